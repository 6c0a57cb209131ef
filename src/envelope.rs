//! SOAP envelope assembly.

use crate::error::{VbmsError, VbmsResult};
use crate::namespaces::GLOBAL_NAMESPACES;
use crate::parser::{XmlDocument, XmlElement};
use crate::request::VbmsRequest;
use tracing::debug;

/// Wraps request bodies in a SOAP 1.1 envelope.
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    user_id: String,
}

impl EnvelopeBuilder {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
        }
    }

    /// Build the envelope for a request. The root declares the global table
    /// followed by the operation's own bindings; the Header carries the
    /// operation's header content and the Body the wrapped body fragment.
    pub fn build(&self, request: &VbmsRequest) -> VbmsResult<XmlDocument> {
        let namespaces = merge_namespaces(request.namespaces())?;

        let mut envelope = XmlElement::new("soapenv:Envelope");
        for (prefix, uri) in &namespaces {
            envelope.set_attr(format!("xmlns:{}", prefix), *uri);
        }

        let mut header = XmlElement::new("soapenv:Header");
        for element in request.header_content(&self.user_id) {
            header.push_child(element);
        }

        let mut operation = XmlElement::new(request.operation_element());
        for element in request.build_body() {
            operation.push_child(element);
        }

        let envelope = envelope
            .with_child(header)
            .with_child(XmlElement::new("soapenv:Body").with_child(operation));

        debug!(
            operation = request.operation_name(),
            namespaces = namespaces.len(),
            "Built SOAP envelope"
        );
        Ok(XmlDocument::new(envelope))
    }
}

/// Merge operation bindings into the global table. A prefix may be declared
/// again only with the URI it already has.
pub fn merge_namespaces<'a>(
    extra: &[(&'a str, &'a str)],
) -> VbmsResult<Vec<(&'a str, &'a str)>> {
    let mut merged: Vec<(&'a str, &'a str)> = GLOBAL_NAMESPACES.to_vec();
    for &(prefix, uri) in extra {
        match merged.iter().find(|(p, _)| *p == prefix) {
            Some(&(_, existing)) if existing == uri => {}
            Some(&(_, existing)) => {
                return Err(VbmsError::NamespaceConflict {
                    prefix: prefix.to_string(),
                    existing: existing.to_string(),
                    requested: uri.to_string(),
                })
            }
            None => merged.push((prefix, uri)),
        }
    }
    Ok(merged)
}
