//! Namespace-aware XPath selection over `XmlDocument`.
//!
//! Expressions are compiled and evaluated with sxd-xpath against a snapshot
//! of the document; the matched nodes are then mapped back to element
//! locations in the owned tree, which stays the one that gets edited and
//! re-serialized. Prefixes resolve through explicit bindings, never through
//! the prefixes the document happens to use.

use crate::error::{VbmsError, VbmsResult};
use crate::parser::{NodePath, XmlDocument, XmlElement, XmlNode};
use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;
use sxd_document::dom::{ChildOfElement, Element, ParentOfChild};
use sxd_xpath::nodeset::Node;
use sxd_xpath::{Context, Factory, Value, XPath};

/// Prefix to namespace URI bindings used to evaluate a path.
pub type NamespaceBindings = BTreeMap<String, String>;

/// Build bindings from `(prefix, uri)` pairs.
pub fn bindings<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> NamespaceBindings {
    pairs
        .into_iter()
        .map(|(prefix, uri)| (prefix.to_string(), uri.to_string()))
        .collect()
}

fn qname_regex() -> VbmsResult<&'static (Regex, Regex)> {
    static RE: OnceLock<Result<(Regex, Regex), regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Ok((
            Regex::new(r#"'[^']*'|"[^"]*""#)?,
            Regex::new(r"(?:^|::|[^\w.\-:$])([A-Za-z_][\w.\-]*):[A-Za-z_*]")?,
        ))
    })
    .as_ref()
    .map_err(|e| VbmsError::Xml(format!("Prefix pattern: {}", e)))
}

/// A compiled XPath expression.
pub struct ElementPath {
    source: String,
    xpath: XPath,
    prefixes: Vec<String>,
}

impl fmt::Debug for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ElementPath").field(&self.source).finish()
    }
}

impl ElementPath {
    pub fn parse(expr: &str) -> VbmsResult<Self> {
        let xpath = Factory::new()
            .build(expr)
            .map_err(|e| VbmsError::Xml(format!("Invalid path '{}': {:?}", expr, e)))?
            .ok_or_else(|| VbmsError::Xml(format!("Path '{}' is empty", expr)))?;

        let (literals, qnames) = qname_regex()?;
        let stripped = literals.replace_all(expr, "");
        let mut prefixes: Vec<String> = qnames
            .captures_iter(&stripped)
            .filter_map(|c| c.get(1))
            .map(|m| m.as_str().to_string())
            .collect();
        prefixes.sort();
        prefixes.dedup();

        Ok(Self {
            source: expr.to_string(),
            xpath,
            prefixes,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Select every matching element, in document order. Attribute and text
    /// matches select the element that owns them.
    pub fn select(
        &self,
        doc: &XmlDocument,
        bindings: &NamespaceBindings,
    ) -> VbmsResult<Vec<NodePath>> {
        if let Some(prefix) = self.prefixes.iter().find(|p| !bindings.contains_key(*p)) {
            return Err(VbmsError::Xml(format!(
                "Unbound prefix '{}' in path '{}'",
                prefix, self.source
            )));
        }

        let package = sxd_document::parser::parse(&doc.to_xml())
            .map_err(|e| VbmsError::Xml(format!("Cannot evaluate '{}': {:?}", self.source, e)))?;
        let document = package.as_document();

        let mut context = Context::new();
        for (prefix, uri) in bindings {
            context.set_namespace(prefix, uri);
        }

        let value = self
            .xpath
            .evaluate(&context, document.root())
            .map_err(|e| VbmsError::Xml(format!("Cannot evaluate '{}': {:?}", self.source, e)))?;
        let Value::Nodeset(nodes) = value else {
            return Err(VbmsError::Xml(format!(
                "Path '{}' does not select nodes",
                self.source
            )));
        };

        let mut found = Vec::new();
        for node in nodes.document_order() {
            let element = match node {
                Node::Element(element) => Some(element),
                Node::Attribute(attribute) => attribute.parent(),
                Node::Text(text) => text.parent(),
                _ => None,
            };
            let Some(element) = element else {
                continue;
            };
            let path = element_indices(element)
                .and_then(|indices| node_path(doc, &indices))
                .ok_or_else(|| {
                    VbmsError::Xml(format!(
                        "Match for '{}' has no element in the document",
                        self.source
                    ))
                })?;
            found.push(path);
        }

        found.sort();
        found.dedup();
        Ok(found)
    }

    /// Select the first matching element, if any.
    pub fn select_first(
        &self,
        doc: &XmlDocument,
        bindings: &NamespaceBindings,
    ) -> VbmsResult<Option<NodePath>> {
        Ok(self.select(doc, bindings)?.into_iter().next())
    }
}

impl fmt::Display for ElementPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Position of `element` among its element siblings at each level below the
/// document element.
fn element_indices(element: Element<'_>) -> Option<Vec<usize>> {
    let mut indices = Vec::new();
    let mut current = element;
    while let ParentOfChild::Element(parent) = current.parent()? {
        let index = parent
            .children()
            .into_iter()
            .filter_map(|child| match child {
                ChildOfElement::Element(e) => Some(e),
                _ => None,
            })
            .position(|e| e == current)?;
        indices.push(index);
        current = parent;
    }
    indices.reverse();
    Some(indices)
}

fn node_path(doc: &XmlDocument, indices: &[usize]) -> Option<NodePath> {
    let mut element = &doc.root;
    let mut path = NodePath::new();
    for &nth in indices {
        let (index, child) = element
            .children
            .iter()
            .enumerate()
            .filter_map(|(i, node)| match node {
                XmlNode::Element(e) => Some((i, e)),
                _ => None,
            })
            .nth(nth)?;
        path.push(index);
        element = child;
    }
    Some(path)
}

/// Evaluate `expr` and return the first matching element.
pub fn find_first<'d>(
    doc: &'d XmlDocument,
    expr: &str,
    bindings: &NamespaceBindings,
) -> VbmsResult<Option<&'d XmlElement>> {
    let path = ElementPath::parse(expr)?;
    Ok(path
        .select_first(doc, bindings)?
        .and_then(|p| doc.element_at(&p)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::namespaces::{SOAPENV_NS, WSSE_NS};

    const SAMPLE: &str = r#"<s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/">
  <s:Header>
    <wsse:Security xmlns:wsse="http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd"/>
  </s:Header>
  <!-- body follows -->
  <s:Body>
    <r:response xmlns:r="urn:read">
      <r:result id="1"/>
      <other:result xmlns:other="urn:other" id="x"/>
      <r:nested><r:result id="2">two</r:result></r:nested>
    </r:response>
  </s:Body>
</s:Envelope>"#;

    fn soap_bindings() -> NamespaceBindings {
        bindings([("soapenv", SOAPENV_NS), ("wsse", WSSE_NS), ("read", "urn:read")])
    }

    fn ids(doc: &XmlDocument, found: &[NodePath]) -> Vec<String> {
        found
            .iter()
            .map(|p| doc.element_at(p).unwrap().attr("id").unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_absolute_path_uses_bindings_not_document_prefixes() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let path = ElementPath::parse("/soapenv:Envelope/soapenv:Body").unwrap();
        let found = path.select(&doc, &soap_bindings()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(doc.element_at(&found[0]).unwrap().name, "s:Body");
    }

    #[test]
    fn test_descendant_step() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let found = ElementPath::parse("//read:result")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert_eq!(ids(&doc, &found), vec!["1", "2"]);

        let direct = ElementPath::parse("//read:response/read:result")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert_eq!(direct.len(), 1);
    }

    #[test]
    fn test_predicates_and_attribute_steps() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let found = ElementPath::parse("//read:result[@id='2']")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert_eq!(ids(&doc, &found), vec!["2"]);

        // an attribute match selects its owner
        let owners = ElementPath::parse("/soapenv:Envelope/soapenv:Body//read:result/@id")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert_eq!(ids(&doc, &owners), vec!["1", "2"]);

        let by_text = ElementPath::parse("//read:result[text()='two']")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert_eq!(ids(&doc, &by_text), vec!["2"]);
    }

    #[test]
    fn test_find_first_security() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let security = find_first(&doc, "//wsse:Security", &soap_bindings())
            .unwrap()
            .unwrap();
        assert_eq!(security.local_name(), "Security");
    }

    #[test]
    fn test_no_match() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let found = ElementPath::parse("/soapenv:Envelope/soapenv:Fault")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_unbound_prefix_is_an_error() {
        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let err = ElementPath::parse("//missing:thing")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap_err();
        assert!(matches!(err, VbmsError::Xml(msg) if msg.contains("missing")));

        // axes and prefixes inside literals are not bindings
        let found = ElementPath::parse("/child::soapenv:Envelope/soapenv:Body//*[@id='no:such']")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap();
        assert!(found.is_empty());
        let err = ElementPath::parse("/child::lost:Envelope")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap_err();
        assert!(err.to_string().contains("lost"));
    }

    #[test]
    fn test_invalid_expressions() {
        assert!(ElementPath::parse("/soapenv:Body[").is_err());
        assert!(ElementPath::parse("").is_err());

        let doc = XmlDocument::parse(SAMPLE).unwrap();
        let err = ElementPath::parse("count(//read:result)")
            .unwrap()
            .select(&doc, &soap_bindings())
            .unwrap_err();
        assert!(err.to_string().contains("does not select nodes"));
    }
}
