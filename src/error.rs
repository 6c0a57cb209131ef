//! Error types for the VBMS client.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Result alias used throughout the crate.
pub type VbmsResult<T> = Result<T, VbmsError>;

/// Errors raised while building, sending or decoding a VBMS request.
#[derive(Error, Debug)]
pub enum VbmsError {
    /// A request was constructed without fields the service requires.
    #[error("Incomplete {operation} request, missing: {}", missing.join(", "))]
    IncompleteRequest {
        operation: &'static str,
        missing: Vec<&'static str>,
    },

    /// An operation namespace rebinds a prefix that is already taken.
    #[error("Namespace prefix '{prefix}' is bound to {existing}, cannot rebind to {requested}")]
    NamespaceConflict {
        prefix: String,
        existing: String,
        requested: String,
    },

    /// A signature target did not resolve to exactly one element.
    #[error("Signature target '{xpath}' matched {matches} elements, expected exactly one")]
    SignatureTargetNotFound { xpath: String, matches: usize },

    #[error("WS-Security header not found in signed envelope")]
    SecurityHeaderNotFound,

    #[error("Signing service error: {0}")]
    SigningService(String),

    #[error("Decryption service error: {0}")]
    DecryptionService(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS handshake error: {0}")]
    TlsHandshake(String),

    /// The service answered with a SOAP Fault.
    #[error("Remote fault: {0}")]
    RemoteFault(SoapFault),

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VbmsError {
    /// Whether the transport may try the call again under a retry policy.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}

/// A SOAP 1.1 Fault returned in place of a normal response body.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SoapFault {
    /// `faultcode` text, e.g. `soap:Server`
    pub code: Option<String>,
    /// `faultstring` text
    pub message: Option<String>,
    /// Flattened text of the `detail` element
    pub detail: Option<String>,
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.code.as_deref().unwrap_or("soap:Fault");
        let message = self.message.as_deref().unwrap_or("no faultstring");
        write!(f, "[{}] {}", code, message)?;
        if let Some(detail) = self.detail.as_deref().filter(|d| !d.is_empty()) {
            write!(f, " ({})", detail)?;
        }
        Ok(())
    }
}

/// Pipeline stage at which a request failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// Envelope assembly
    Build,
    /// Signature target resolution
    Mark,
    /// External signing
    Sign,
    /// SAML assertion injection
    Inject,
    /// MTOM packaging
    Package,
    /// HTTP round trip
    Transmit,
    /// External decryption of the response
    Decrypt,
    /// Response parsing and fault detection
    Parse,
    /// Typed result extraction
    Extract,
}

impl Stage {
    /// Get the string code for this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "build",
            Self::Mark => "mark",
            Self::Sign => "sign",
            Self::Inject => "inject",
            Self::Package => "package",
            Self::Transmit => "transmit",
            Self::Decrypt => "decrypt",
            Self::Parse => "parse",
            Self::Extract => "extract",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error leaving the client, tagged with where it happened.
#[derive(Error, Debug)]
#[error("{operation} failed at {stage}: {source}")]
pub struct PipelineError {
    pub operation: &'static str,
    pub stage: Stage,
    #[source]
    pub source: VbmsError,
}

impl PipelineError {
    pub fn new(operation: &'static str, stage: Stage, source: VbmsError) -> Self {
        Self {
            operation,
            stage,
            source,
        }
    }

    /// The SOAP fault, if the service returned one.
    pub fn fault(&self) -> Option<&SoapFault> {
        match &self.source {
            VbmsError::RemoteFault(fault) => Some(fault),
            _ => None,
        }
    }
}
