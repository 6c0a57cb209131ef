//! Namespace and endpoint tables for the VBMS services.

use serde::{Deserialize, Serialize};
use std::fmt;

/// SOAP namespace URIs.
pub const SOAPENV_NS: &str = "http://schemas.xmlsoap.org/soap/envelope/";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const XOP_NS: &str = "http://www.w3.org/2004/08/xop/include";

/// VBMS domain namespace URIs.
pub const EDOCUMENT_V4_NS: &str = "http://vbms.vba.va.gov/external/eDocumentService/v4";
pub const CLAIM_CDM_NS: &str = "http://vbms.vba.va.gov/cdm/claim/v4";
pub const PARTICIPANT_NS: &str = "http://vbms.vba.va.gov/cdm/participant/v4";
pub const DOCUMENT_CDM_NS: &str = "http://vbms.vba.va.gov/cdm/document/v4";
pub const CLAIM_SERVICE_NS: &str = "http://vbms.vba.va.gov/external/ClaimService/v4";
pub const EFOLDER_READ_NS: &str = "http://service.efolder.vbms.vba.va.gov/eFolderReadService";
pub const VBMS_EXTERNAL_NS: &str = "http://vbms.vba.va.gov/external";

/// Prefixes every envelope declares on its root. Operations may repeat one of
/// these bindings verbatim but never rebind the prefix.
pub const GLOBAL_NAMESPACES: [(&str, &str); 7] = [
    ("soapenv", SOAPENV_NS),
    ("wsse", WSSE_NS),
    ("wsu", WSU_NS),
    ("v4", EDOCUMENT_V4_NS),
    ("cdm", CLAIM_CDM_NS),
    ("participant", PARTICIPANT_NS),
    ("doc", DOCUMENT_CDM_NS),
];

/// Logical service category an operation is posted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    /// Claim establishment service
    Claims,
    /// eFolder read service, inline content
    EfolderReadInline,
    /// eDocument service v4 (uploads)
    Edocument,
}

impl Endpoint {
    /// Default path appended to the configured base URL.
    pub fn default_path(&self) -> &'static str {
        match self {
            Self::Claims => "/vbms-ws/ClaimServiceV4",
            Self::EfolderReadInline => "/vbms-efolder-svc/v1.0/efolder/read/inline",
            Self::Edocument => "/vbms-ws/eDocumentService/v4",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claims => "claims",
            Self::EfolderReadInline => "efolder_read_inline",
            Self::Edocument => "edocument",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
