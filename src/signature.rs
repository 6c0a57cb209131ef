//! Signature target resolution.
//!
//! Each operation names the envelope elements that must be covered by the
//! WS-Security signature. Before the envelope goes to the signing service
//! every target is resolved against it and must match exactly one element.

use crate::error::{VbmsError, VbmsResult};
use crate::parser::{NodePath, XmlDocument};
use crate::xpath::{ElementPath, NamespaceBindings};
use serde::{Deserialize, Serialize};

/// Which part of a target the signature covers, in WSS4J terms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentSelector {
    /// The element itself, tags included
    Element,
    /// Only the element's children
    Content,
}

impl ContentSelector {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Element => "Element",
            Self::Content => "Content",
        }
    }
}

/// A declared signature target: path, prefix bindings, selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureTarget {
    pub xpath: String,
    pub namespaces: NamespaceBindings,
    pub selector: ContentSelector,
}

impl SignatureTarget {
    pub fn new(
        xpath: impl Into<String>,
        namespaces: NamespaceBindings,
        selector: ContentSelector,
    ) -> Self {
        Self {
            xpath: xpath.into(),
            namespaces,
            selector,
        }
    }
}

/// A target resolved against a concrete envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SignatureMark {
    pub xpath: String,
    pub namespaces: NamespaceBindings,
    pub selector: ContentSelector,
    /// Local name of the resolved element
    pub local_name: String,
    /// Namespace URI of the resolved element
    pub namespace_uri: String,
    /// Location of the element in the envelope
    #[serde(skip)]
    pub node: NodePath,
}

/// Resolve every target, in order. Fails on the first target that matches
/// zero or several elements.
pub fn resolve_marks(
    envelope: &XmlDocument,
    targets: &[SignatureTarget],
) -> VbmsResult<Vec<SignatureMark>> {
    targets
        .iter()
        .map(|target| resolve_mark(envelope, target))
        .collect()
}

fn resolve_mark(envelope: &XmlDocument, target: &SignatureTarget) -> VbmsResult<SignatureMark> {
    let path = ElementPath::parse(&target.xpath)?;
    let mut found = path.select(envelope, &target.namespaces)?;
    if found.len() != 1 {
        return Err(VbmsError::SignatureTargetNotFound {
            xpath: target.xpath.clone(),
            matches: found.len(),
        });
    }
    let node = found.remove(0);

    let not_found = || VbmsError::SignatureTargetNotFound {
        xpath: target.xpath.clone(),
        matches: 0,
    };
    let element = envelope.element_at(&node).ok_or_else(not_found)?;
    let scope = envelope.scope_at(&node).ok_or_else(not_found)?;

    Ok(SignatureMark {
        xpath: target.xpath.clone(),
        namespaces: target.namespaces.clone(),
        selector: target.selector,
        local_name: element.local_name().to_string(),
        namespace_uri: element.namespace_uri(&scope).unwrap_or_default().to_string(),
        node,
    })
}
