//! Owned XML document model built on quick-xml.
//!
//! Signed envelopes pass through this model on their way to the wire, so
//! parsing keeps every text node (whitespace included), comment and CDATA
//! section in document order, and serialization writes them back unchanged.
//! quick-xml never expands entities; DOCTYPE declarations are rejected outright.

use crate::error::{VbmsError, VbmsResult};
use quick_xml::escape::{escape, partial_escape};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::collections::HashMap;

/// A node in an element's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XmlNode {
    Element(XmlElement),
    Text(String),
    CData(String),
    Comment(String),
}

/// An XML element with its qualified name, ordered attributes and content.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XmlElement {
    /// Qualified name as written, e.g. `soapenv:Body`
    pub name: String,
    /// Attributes in document order, keys as written (`xmlns:*` included)
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlNode>,
}

/// Index path from the document root to an element, one entry per level,
/// each indexing into the parent's `children`.
pub type NodePath = Vec<usize>;

/// In-scope prefix bindings; the default namespace uses the empty prefix.
pub type NamespaceScope = HashMap<String, String>;

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Builder: append an attribute.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((key.into(), value.into()));
        self
    }

    /// Builder: append an attribute only when a value is present.
    pub fn with_attr_opt(self, key: impl Into<String>, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.with_attr(key, value),
            None => self,
        }
    }

    /// Builder: append a child element.
    pub fn with_child(mut self, child: XmlElement) -> Self {
        self.children.push(XmlNode::Element(child));
        self
    }

    /// Builder: append a text node.
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.children.push(XmlNode::Text(text.into()));
        self
    }

    pub fn prefix(&self) -> Option<&str> {
        self.name.split_once(':').map(|(prefix, _)| prefix)
    }

    pub fn local_name(&self) -> &str {
        self.name
            .split_once(':')
            .map(|(_, local)| local)
            .unwrap_or(&self.name)
    }

    /// Attribute value by its name as written.
    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Attribute value by local name, ignoring any prefix.
    pub fn attr_local(&self, local: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| !is_namespace_declaration(k) && attr_local_name(k) == local)
            .map(|(_, v)| v.as_str())
    }

    /// Set an attribute, replacing an existing one with the same name.
    pub fn set_attr(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(k, _)| *k == key) {
            Some(slot) => slot.1 = value,
            None => self.attributes.push((key, value)),
        }
    }

    /// Remove every attribute with the given local name. Returns how many went.
    pub fn remove_attr_local(&mut self, local: &str) -> usize {
        let before = self.attributes.len();
        self.attributes
            .retain(|(k, _)| is_namespace_declaration(k) || attr_local_name(k) != local);
        before - self.attributes.len()
    }

    pub fn push_child(&mut self, child: XmlElement) {
        self.children.push(XmlNode::Element(child));
    }

    /// Direct element children.
    pub fn child_elements(&self) -> impl Iterator<Item = &XmlElement> {
        self.children.iter().filter_map(|node| match node {
            XmlNode::Element(e) => Some(e),
            _ => None,
        })
    }

    /// First direct child with the given local name.
    pub fn find_child_local(&self, local: &str) -> Option<&XmlElement> {
        self.child_elements().find(|e| e.local_name() == local)
    }

    /// First descendant (depth-first, self excluded) with the given local name.
    pub fn find_descendant_local(&self, local: &str) -> Option<&XmlElement> {
        for child in self.child_elements() {
            if child.local_name() == local {
                return Some(child);
            }
            if let Some(found) = child.find_descendant_local(local) {
                return Some(found);
            }
        }
        None
    }

    /// Concatenated text and CDATA content of this element and its descendants.
    pub fn text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        for node in &self.children {
            match node {
                XmlNode::Text(t) | XmlNode::CData(t) => out.push_str(t),
                XmlNode::Element(e) => e.collect_text(out),
                XmlNode::Comment(_) => {}
            }
        }
    }

    /// Namespace declarations on this element as `(prefix, uri)`; the default
    /// namespace has an empty prefix.
    pub fn namespace_declarations(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attributes.iter().filter_map(|(k, v)| {
            if k == "xmlns" {
                Some(("", v.as_str()))
            } else {
                k.strip_prefix("xmlns:").map(|prefix| (prefix, v.as_str()))
            }
        })
    }

    /// The scope in effect inside this element, given the parent's scope.
    pub fn scope_within(&self, parent: &NamespaceScope) -> NamespaceScope {
        let mut scope = parent.clone();
        for (prefix, uri) in self.namespace_declarations() {
            scope.insert(prefix.to_string(), uri.to_string());
        }
        scope
    }

    /// Namespace URI of this element's name under `scope` (its own scope).
    pub fn namespace_uri<'s>(&self, scope: &'s NamespaceScope) -> Option<&'s str> {
        scope
            .get(self.prefix().unwrap_or(""))
            .map(String::as_str)
            .filter(|uri| !uri.is_empty())
    }

    /// Serialize without an XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::new();
        self.write_to(&mut out);
        out
    }

    pub fn write_to(&self, out: &mut String) {
        out.push('<');
        out.push_str(&self.name);
        for (key, value) in &self.attributes {
            out.push(' ');
            out.push_str(key);
            out.push_str("=\"");
            out.push_str(&escape(value.as_str()));
            out.push('"');
        }
        if self.children.is_empty() {
            out.push_str("/>");
            return;
        }
        out.push('>');
        for node in &self.children {
            match node {
                XmlNode::Element(e) => e.write_to(out),
                XmlNode::Text(t) => out.push_str(&partial_escape(t.as_str())),
                XmlNode::CData(t) => {
                    out.push_str("<![CDATA[");
                    out.push_str(t);
                    out.push_str("]]>");
                }
                XmlNode::Comment(t) => {
                    out.push_str("<!--");
                    out.push_str(t);
                    out.push_str("-->");
                }
            }
        }
        out.push_str("</");
        out.push_str(&self.name);
        out.push('>');
    }
}

/// A parsed XML document. The prolog is not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XmlDocument {
    pub root: XmlElement,
}

impl XmlDocument {
    pub fn new(root: XmlElement) -> Self {
        Self { root }
    }

    /// Parse raw bytes as an XML document.
    pub fn parse_bytes(data: &[u8]) -> VbmsResult<Self> {
        let xml = std::str::from_utf8(data)
            .map_err(|e| VbmsError::Xml(format!("Invalid UTF-8: {}", e)))?;
        Self::parse(xml)
    }

    /// Parse a string as an XML document.
    pub fn parse(xml: &str) -> VbmsResult<Self> {
        check_xxe_patterns(xml)?;

        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(false);

        let mut stack: Vec<XmlElement> = Vec::new();
        let mut root: Option<XmlElement> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) => {
                    stack.push(element_from_start(e)?);
                }
                Ok(Event::Empty(ref e)) => {
                    let element = element_from_start(e)?;
                    attach(&mut stack, &mut root, XmlNode::Element(element))?;
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| VbmsError::Xml("Unbalanced end tag".to_string()))?;
                    attach(&mut stack, &mut root, XmlNode::Element(element))?;
                }
                Ok(Event::Text(e)) => {
                    let text = e
                        .unescape()
                        .map_err(|e| VbmsError::Xml(format!("Bad text content: {}", e)))?;
                    match stack.last_mut() {
                        Some(parent) => parent.children.push(XmlNode::Text(text.into_owned())),
                        None if text.trim().is_empty() => {}
                        None => {
                            return Err(VbmsError::Xml(
                                "Text content outside the root element".to_string(),
                            ))
                        }
                    }
                }
                Ok(Event::CData(e)) => {
                    let text = String::from_utf8(e.into_inner().into_owned())
                        .map_err(|e| VbmsError::Xml(format!("Invalid UTF-8 in CDATA: {}", e)))?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::CData(text));
                    }
                }
                Ok(Event::Comment(e)) => {
                    let text = String::from_utf8(e.into_inner().into_owned()).map_err(|e| {
                        VbmsError::Xml(format!("Invalid UTF-8 in comment: {}", e))
                    })?;
                    if let Some(parent) = stack.last_mut() {
                        parent.children.push(XmlNode::Comment(text));
                    }
                }
                Ok(Event::DocType(_)) => {
                    return Err(VbmsError::Xml(
                        "DOCTYPE declarations are not allowed".to_string(),
                    ));
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => {
                    return Err(VbmsError::Xml(format!(
                        "XML parse error at {}: {}",
                        reader.error_position(),
                        e
                    )));
                }
            }
        }

        if let Some(open) = stack.last() {
            return Err(VbmsError::Xml(format!("Unclosed element <{}>", open.name)));
        }
        let root = root.ok_or_else(|| VbmsError::Xml("Document has no root element".to_string()))?;
        Ok(Self { root })
    }

    /// Serialize with a UTF-8 XML declaration.
    pub fn to_xml(&self) -> String {
        let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>");
        self.root.write_to(&mut out);
        out
    }

    pub fn element_at(&self, path: &[usize]) -> Option<&XmlElement> {
        let mut current = &self.root;
        for &index in path {
            current = match current.children.get(index)? {
                XmlNode::Element(e) => e,
                _ => return None,
            };
        }
        Some(current)
    }

    pub fn element_at_mut(&mut self, path: &[usize]) -> Option<&mut XmlElement> {
        let mut current = &mut self.root;
        for &index in path {
            current = match current.children.get_mut(index)? {
                XmlNode::Element(e) => e,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Namespace scope in effect inside the element at `path`.
    pub fn scope_at(&self, path: &[usize]) -> Option<NamespaceScope> {
        let mut current = &self.root;
        let mut scope = current.scope_within(&NamespaceScope::new());
        for &index in path {
            current = match current.children.get(index)? {
                XmlNode::Element(e) => e,
                _ => return None,
            };
            scope = current.scope_within(&scope);
        }
        Some(scope)
    }
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    node: XmlNode,
) -> VbmsResult<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(node);
            Ok(())
        }
        None => match node {
            XmlNode::Element(e) if root.is_none() => {
                *root = Some(e);
                Ok(())
            }
            XmlNode::Element(e) => Err(VbmsError::Xml(format!(
                "Second root element <{}>",
                e.name
            ))),
            _ => Ok(()),
        },
    }
}

fn element_from_start(e: &BytesStart) -> VbmsResult<XmlElement> {
    let name = std::str::from_utf8(e.name().as_ref())
        .map_err(|e| VbmsError::Xml(format!("Invalid element name: {}", e)))?
        .to_string();

    let mut attributes = Vec::new();
    for attr in e.attributes() {
        let attr = attr.map_err(|e| VbmsError::Xml(format!("Bad attribute: {}", e)))?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|e| VbmsError::Xml(format!("Invalid attribute name: {}", e)))?
            .to_string();
        let value = attr
            .unescape_value()
            .map_err(|e| VbmsError::Xml(format!("Bad value for attribute {}: {}", key, e)))?
            .into_owned();
        attributes.push((key, value));
    }

    Ok(XmlElement {
        name,
        attributes,
        children: Vec::new(),
    })
}

/// Reject DTD constructs before handing the text to the reader.
fn check_xxe_patterns(xml: &str) -> VbmsResult<()> {
    if xml.contains("<!DOCTYPE") || xml.contains("<!doctype") {
        return Err(VbmsError::Xml(
            "DOCTYPE declarations are not allowed".to_string(),
        ));
    }

    if xml.contains("<!ENTITY") || xml.contains("<!entity") {
        return Err(VbmsError::Xml(
            "Entity declarations are not allowed".to_string(),
        ));
    }

    Ok(())
}

fn is_namespace_declaration(key: &str) -> bool {
    key == "xmlns" || key.starts_with("xmlns:")
}

fn attr_local_name(key: &str) -> &str {
    key.split_once(':').map(|(_, local)| local).unwrap_or(key)
}
