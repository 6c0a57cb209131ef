//! SAML assertion injection into the WS-Security header.
//!
//! The signing service emits a `wsse:Security` header marked
//! `mustUnderstand`. VBMS expects the SAML assertion inside that header and
//! rejects the marker, so the header is patched after signing.

use crate::error::{VbmsError, VbmsResult};
use crate::namespaces::{SOAPENV_NS, WSSE_NS};
use crate::parser::{NodePath, XmlDocument, XmlElement};
use crate::xpath::{bindings, ElementPath};
use std::path::Path;
use tracing::debug;

/// Location of the WS-Security header in a signed envelope.
pub const SECURITY_PATH: &str = "/soapenv:Envelope/soapenv:Header/wsse:Security";

/// Find the Security header, if the envelope has one.
pub fn find_security_header(doc: &XmlDocument) -> VbmsResult<Option<NodePath>> {
    let ns = bindings([("soapenv", SOAPENV_NS), ("wsse", WSSE_NS)]);
    ElementPath::parse(SECURITY_PATH)?.select_first(doc, &ns)
}

/// The Security header, or `SecurityHeaderNotFound`.
pub fn security_header_path(doc: &XmlDocument) -> VbmsResult<NodePath> {
    find_security_header(doc)?.ok_or(VbmsError::SecurityHeaderNotFound)
}

/// Append the assertion to the Security header and drop its
/// `mustUnderstand` attribute.
pub fn inject_saml(doc: &mut XmlDocument, assertion: &XmlElement) -> VbmsResult<()> {
    let path = security_header_path(doc)?;
    let security = doc
        .element_at_mut(&path)
        .ok_or(VbmsError::SecurityHeaderNotFound)?;
    security.push_child(assertion.clone());
    let removed = security.remove_attr_local("mustUnderstand");
    debug!(
        assertion = assertion.local_name(),
        removed_must_understand = removed,
        "Injected SAML assertion"
    );
    Ok(())
}

/// Drop `mustUnderstand` from the Security header when one exists. Used when
/// no assertion is configured.
pub fn remove_must_understand(doc: &mut XmlDocument) -> VbmsResult<usize> {
    let Some(path) = find_security_header(doc)? else {
        return Ok(0);
    };
    Ok(doc
        .element_at_mut(&path)
        .map(|security| security.remove_attr_local("mustUnderstand"))
        .unwrap_or(0))
}

/// Read and parse an assertion file. Returns its root element.
pub async fn load_assertion(path: &Path) -> VbmsResult<XmlElement> {
    let data = tokio::fs::read(path).await.map_err(|e| {
        VbmsError::Config(format!(
            "Cannot read SAML assertion {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(XmlDocument::parse_bytes(&data)?.root)
}
