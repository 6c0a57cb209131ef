//! VBMS client.
//!
//! Runs a request through the full pipeline: envelope assembly, signature
//! marking, external signing, SAML injection, optional MTOM packaging, the
//! HTTPS round trip, optional response decryption, fault detection and typed
//! result extraction. Every failure carries the stage it happened at.

use crate::config::{ClientConfig, CredentialBundle};
use crate::envelope::EnvelopeBuilder;
use crate::error::{PipelineError, Stage, VbmsError, VbmsResult};
use crate::mtom;
use crate::parser::XmlDocument;
use crate::request::{
    Claim, ClaimInput, DocumentContent, DocumentUpload, EstablishClaim, GetDocumentContent,
    UploadDocumentWithAssociations, UploadedDocument, VbmsRequest, VbmsResponse, VeteranRecord,
};
use crate::response::{dispatch, extract_envelope, parse_response};
use crate::saml::{inject_saml, load_assertion, remove_must_understand};
use crate::services::{
    CommandDecryptionService, CommandSigningService, DecryptionService, SigningService,
};
use crate::signature::resolve_marks;
use crate::transport::TransportClient;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, trace, Instrument};

const SOAP_CONTENT_TYPE: &str = "text/xml;charset=UTF-8";

/// Per-call overrides.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Request timeout replacing the configured one
    pub timeout: Option<Duration>,
}

impl CallOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// Client for the VBMS SOAP services.
///
/// Cheap to clone and safe to share across tasks. Calls are independent;
/// dropping a call's future cancels it and kills any collaborator process it
/// started.
#[derive(Clone)]
pub struct VbmsClient {
    config: Arc<ClientConfig>,
    credentials: Option<CredentialBundle>,
    envelopes: EnvelopeBuilder,
    transport: TransportClient,
    signer: Arc<dyn SigningService>,
    decryptor: Option<Arc<dyn DecryptionService>>,
}

impl std::fmt::Debug for VbmsClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VbmsClient")
            .field("base_url", &self.config.base_url)
            .field("credentials", &self.credentials)
            .field("transport", &self.transport)
            .field("decryptor", &self.decryptor.is_some())
            .finish()
    }
}

impl VbmsClient {
    /// Create a client with explicit collaborators.
    pub fn new(
        config: ClientConfig,
        signer: Arc<dyn SigningService>,
        decryptor: Option<Arc<dyn DecryptionService>>,
    ) -> VbmsResult<Self> {
        config.validate()?;
        let credentials = config.credentials.bundle()?;
        let transport = TransportClient::new(&config.transport, credentials.as_ref())?;

        info!(
            base_url = %config.base_url,
            authenticated = credentials.is_some(),
            max_attempts = config.transport.retry.max_attempts,
            "VBMS client initialized"
        );

        Ok(Self {
            envelopes: EnvelopeBuilder::new(config.user_id.clone()),
            config: Arc::new(config),
            credentials,
            transport,
            signer,
            decryptor,
        })
    }

    /// Create a client whose collaborators are the configured external
    /// signing and decryption programs.
    pub fn from_config(config: ClientConfig) -> VbmsResult<Self> {
        let signer = Arc::new(CommandSigningService::new(config.signing.clone()));
        let decryptor: Arc<dyn DecryptionService> =
            Arc::new(CommandDecryptionService::new(config.decryption.clone()));
        Self::new(config, signer, Some(decryptor))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send a request with default options.
    pub async fn send(&self, request: &VbmsRequest) -> Result<VbmsResponse, PipelineError> {
        self.send_with(request, CallOptions::default()).await
    }

    /// Send a request.
    pub async fn send_with(
        &self,
        request: &VbmsRequest,
        options: CallOptions,
    ) -> Result<VbmsResponse, PipelineError> {
        let span = info_span!(
            "vbms_call",
            operation = request.operation_name(),
            endpoint = %request.endpoint(),
        );
        self.run(request, options).instrument(span).await
    }

    /// Establish a claim for a veteran.
    pub async fn establish_claim(
        &self,
        veteran: VeteranRecord,
        claim: ClaimInput,
    ) -> Result<Claim, PipelineError> {
        let request = EstablishClaim::new(veteran, claim)
            .map_err(|e| PipelineError::new(EstablishClaim::OPERATION, Stage::Build, e))?;
        match self.send(&request.into()).await? {
            VbmsResponse::Claim(claim) => Ok(claim),
            other => Err(unexpected(EstablishClaim::OPERATION, &other)),
        }
    }

    /// Fetch the content of one document version.
    pub async fn get_document_content(
        &self,
        document_id: &str,
    ) -> Result<DocumentContent, PipelineError> {
        let request = GetDocumentContent::new(document_id)
            .map_err(|e| PipelineError::new(GetDocumentContent::OPERATION, Stage::Build, e))?;
        match self.send(&request.into()).await? {
            VbmsResponse::DocumentContent(content) => Ok(content),
            other => Err(unexpected(GetDocumentContent::OPERATION, &other)),
        }
    }

    /// Upload a document into a veteran's eFolder.
    pub async fn upload_document(
        &self,
        upload: DocumentUpload,
    ) -> Result<UploadedDocument, PipelineError> {
        let request = UploadDocumentWithAssociations::new(upload).map_err(|e| {
            PipelineError::new(UploadDocumentWithAssociations::OPERATION, Stage::Build, e)
        })?;
        match self.send(&request.into()).await? {
            VbmsResponse::UploadedDocument(uploaded) => Ok(uploaded),
            other => Err(unexpected(UploadDocumentWithAssociations::OPERATION, &other)),
        }
    }

    async fn run(
        &self,
        request: &VbmsRequest,
        options: CallOptions,
    ) -> Result<VbmsResponse, PipelineError> {
        let operation = request.operation_name();
        let at = move |stage: Stage| move |source: VbmsError| PipelineError::new(operation, stage, source);
        let started = Instant::now();

        let envelope = self.envelopes.build(request).map_err(at(Stage::Build))?;
        let envelope_xml = envelope.to_xml();
        trace!(envelope = %envelope_xml, "Unsigned envelope");

        let marks = resolve_marks(&envelope, &request.signature_targets()).map_err(at(Stage::Mark))?;
        debug!(marks = marks.len(), "Resolved signature targets");

        let signed_xml = self
            .signer
            .sign(operation, &envelope_xml, &marks, self.credentials.as_ref())
            .await
            .map_err(at(Stage::Sign))?;

        let soap_xml = self.inject(&signed_xml).await.map_err(at(Stage::Inject))?;

        let (body, content_type) = if request.attachments().is_empty() {
            (soap_xml.into_bytes(), SOAP_CONTENT_TYPE.to_string())
        } else {
            let message =
                mtom::package(&soap_xml, request.attachments()).map_err(at(Stage::Package))?;
            (message.body, message.content_type)
        };

        let mut headers = HeaderMap::new();
        let content_type = HeaderValue::from_str(&content_type).map_err(|e| {
            at(Stage::Package)(VbmsError::Config(format!("Invalid Content-Type: {}", e)))
        })?;
        headers.insert(CONTENT_TYPE, content_type);

        let url = self.config.endpoint_url(request.endpoint());
        info!(url = %url, bytes = body.len(), "Sending VBMS request");
        let response = self
            .transport
            .send(&url, body, headers, options.timeout)
            .await
            .map_err(at(Stage::Transmit))?;

        let raw_envelope =
            extract_envelope(&response.body, response.status).map_err(at(Stage::Parse))?;

        let response_xml = if request.decrypts_response() {
            let encrypted = String::from_utf8_lossy(raw_envelope);
            let decrypted = self.decrypt(&encrypted).await.map_err(at(Stage::Decrypt))?;
            extract_envelope(decrypted.as_bytes(), response.status)
                .map_err(at(Stage::Decrypt))?
                .to_vec()
        } else {
            raw_envelope.to_vec()
        };
        trace!(response = %String::from_utf8_lossy(&response_xml), "Response envelope");

        let doc: XmlDocument = parse_response(&response_xml).map_err(at(Stage::Parse))?;
        let result = dispatch(request, &doc).map_err(|e| match e {
            VbmsError::RemoteFault(_) => at(Stage::Parse)(e),
            other => at(Stage::Extract)(other),
        })?;

        info!(
            status = %response.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "VBMS request complete"
        );
        Ok(result)
    }

    /// Add the SAML assertion to the signed envelope. Without credentials
    /// there is no assertion; only the `mustUnderstand` marker is dropped.
    async fn inject(&self, signed_xml: &str) -> VbmsResult<String> {
        let mut doc = XmlDocument::parse(signed_xml)?;
        match &self.credentials {
            Some(bundle) => {
                let assertion = load_assertion(&bundle.saml_assertion_path).await?;
                inject_saml(&mut doc, &assertion)?;
            }
            None => {
                remove_must_understand(&mut doc)?;
            }
        }
        Ok(doc.to_xml())
    }

    async fn decrypt(&self, encrypted: &str) -> VbmsResult<String> {
        let decryptor = self.decryptor.as_ref().ok_or_else(|| {
            VbmsError::DecryptionService("No decryption service configured".to_string())
        })?;
        decryptor.decrypt(encrypted, self.credentials.as_ref()).await
    }
}

fn unexpected(operation: &'static str, response: &VbmsResponse) -> PipelineError {
    PipelineError::new(
        operation,
        Stage::Extract,
        VbmsError::MalformedResponse(format!("Unexpected result {:?}", response)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::SignatureMark;
    use async_trait::async_trait;

    struct PassthroughSigner;

    #[async_trait]
    impl SigningService for PassthroughSigner {
        async fn sign(
            &self,
            _operation: &str,
            envelope_xml: &str,
            _marks: &[SignatureMark],
            _credentials: Option<&CredentialBundle>,
        ) -> VbmsResult<String> {
            Ok(envelope_xml.to_string())
        }
    }

    struct FailingSigner;

    #[async_trait]
    impl SigningService for FailingSigner {
        async fn sign(
            &self,
            _operation: &str,
            _envelope_xml: &str,
            _marks: &[SignatureMark],
            _credentials: Option<&CredentialBundle>,
        ) -> VbmsResult<String> {
            Err(VbmsError::SigningService("keystore locked".to_string()))
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let err = VbmsClient::new(ClientConfig::default(), Arc::new(PassthroughSigner), None)
            .unwrap_err();
        assert!(matches!(err, VbmsError::Config(_)));
    }

    #[tokio::test]
    async fn test_incomplete_request_fails_at_build() {
        let client = VbmsClient::new(config(), Arc::new(PassthroughSigner), None).unwrap();
        let err = client.get_document_content("").await.unwrap_err();
        assert_eq!(err.stage, Stage::Build);
        assert_eq!(err.operation, "getDocumentContent");
    }

    #[tokio::test]
    async fn test_signing_failure_is_staged() {
        let client = VbmsClient::new(config(), Arc::new(FailingSigner), None).unwrap();
        let request = VbmsRequest::from(GetDocumentContent::new("{doc}").unwrap());
        let err = client.send(&request).await.unwrap_err();
        assert_eq!(err.stage, Stage::Sign);
        assert!(err.to_string().contains("keystore locked"));
    }

    #[tokio::test]
    async fn test_unauthenticated_inject_keeps_envelope_without_security() {
        let client = VbmsClient::new(config(), Arc::new(PassthroughSigner), None).unwrap();
        let xml = client
            .inject(r#"<soapenv:Envelope xmlns:soapenv="http://schemas.xmlsoap.org/soap/envelope/"><soapenv:Header/><soapenv:Body/></soapenv:Envelope>"#)
            .await
            .unwrap();
        assert!(xml.contains("<soapenv:Header/>"));
    }
}
