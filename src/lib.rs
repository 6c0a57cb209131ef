//! WS-Security SOAP client for the VBMS claims and eFolder services.
//!
//! Builds SOAP 1.1 envelopes for VBMS operations, has them signed by an
//! external signing service, injects the SAML assertion into the
//! WS-Security header, packages uploads as MTOM and sends everything over
//! mutually authenticated TLS. Responses are decrypted when the operation
//! requires it, checked for SOAP faults and decoded into typed results.
//!
//! # Features
//!
//! - Operations: `establishClaim`, `getDocumentContent`,
//!   `uploadDocumentWithAssociations`
//! - Namespace-checked envelope assembly
//! - Signature targets resolved before signing
//! - MTOM packaging for document uploads
//! - Explicit retry policy for connection failures
//! - Failures tagged with the pipeline stage that produced them
//!
//! # Example
//!
//! ```ignore
//! use connect_vbms::{ClientConfig, VbmsClient};
//!
//! let config = ClientConfig::from_env("test")?;
//! let client = VbmsClient::from_config(config)?;
//! let document = client.get_document_content("{9E364101-AFDD-49A7-A11F-602CCF2E5DB5}").await?;
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod mtom;
pub mod namespaces;
pub mod parser;
pub mod request;
pub mod response;
pub mod saml;
pub mod services;
pub mod signature;
pub mod transport;
pub mod xpath;

pub use client::{CallOptions, VbmsClient};
pub use config::{ClientConfig, CredentialBundle};
pub use error::{PipelineError, SoapFault, Stage, VbmsError, VbmsResult};
pub use request::{
    Claim, ClaimInput, DocumentContent, DocumentUpload, EstablishClaim, GetDocumentContent,
    UploadDocumentWithAssociations, UploadedDocument, VbmsRequest, VbmsResponse, VeteranRecord,
};
pub use services::{DecryptionService, SigningService};
