//! Response handling: envelope extraction, fault detection and dispatch.

use crate::error::{SoapFault, VbmsError, VbmsResult};
use crate::namespaces::SOAPENV_NS;
use crate::parser::{XmlDocument, XmlElement};
use crate::request::{VbmsRequest, VbmsResponse};
use crate::xpath::{bindings, find_first};
use regex::bytes::Regex;
use reqwest::StatusCode;
use std::sync::OnceLock;
use tracing::{debug, warn};

/// Location of a SOAP 1.1 fault.
pub const FAULT_PATH: &str = "/soapenv:Envelope/soapenv:Body/soapenv:Fault";

fn envelope_regex() -> VbmsResult<&'static Regex> {
    static RE: OnceLock<Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?is-u)<([a-z_][a-z0-9_.\-]*:)?envelope[\s>].*?</([a-z_][a-z0-9_.\-]*:)?envelope\s*>",
        )
    })
    .as_ref()
    .map_err(|e| VbmsError::MalformedResponse(format!("Envelope pattern: {}", e)))
}

/// Locate the SOAP envelope in a raw HTTP body. The body may be plain XML
/// or an MTOM multipart whose root part holds the envelope.
pub fn extract_envelope(body: &[u8], status: StatusCode) -> VbmsResult<&[u8]> {
    envelope_regex()?
        .find(body)
        .map(|m| m.as_bytes())
        .ok_or_else(|| {
            VbmsError::MalformedResponse(format!(
                "No SOAP envelope in HTTP {} response ({} bytes)",
                status,
                body.len()
            ))
        })
}

/// Parse response XML. Parse failures are reported as malformed responses.
pub fn parse_response(xml: &[u8]) -> VbmsResult<XmlDocument> {
    XmlDocument::parse_bytes(xml).map_err(|e| match e {
        VbmsError::Xml(message) => VbmsError::MalformedResponse(message),
        other => other,
    })
}

/// The SOAP fault carried by a response, if any.
pub fn detect_fault(doc: &XmlDocument) -> VbmsResult<Option<SoapFault>> {
    let ns = bindings([("soapenv", SOAPENV_NS)]);
    Ok(find_first(doc, FAULT_PATH, &ns)?.map(|fault| SoapFault {
        code: child_text(fault, "faultcode"),
        message: child_text(fault, "faultstring"),
        detail: child_text(fault, "detail"),
    }))
}

fn child_text(element: &XmlElement, local: &str) -> Option<String> {
    element
        .find_child_local(local)
        .map(|child| child.text().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|text| !text.is_empty())
}

/// Turn a parsed response into the request's typed result. A fault is
/// returned as `RemoteFault` and never reaches result extraction.
pub fn dispatch(request: &VbmsRequest, doc: &XmlDocument) -> VbmsResult<VbmsResponse> {
    if let Some(fault) = detect_fault(doc)? {
        warn!(operation = request.operation_name(), fault = %fault, "SOAP fault received");
        return Err(VbmsError::RemoteFault(fault));
    }
    debug!(operation = request.operation_name(), "Extracting result");
    request.extract_result(doc)
}
