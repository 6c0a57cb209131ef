//! VBMS operations.
//!
//! Every remote call is one variant of [`VbmsRequest`]. A variant knows its
//! operation name, endpoint, body fragment, signature targets and how to turn
//! the response document into a typed [`VbmsResponse`]. Variants validate
//! their inputs on construction and are immutable afterwards, so one value
//! can be sent any number of times.

use crate::error::{VbmsError, VbmsResult};
use crate::mtom::{validate_filename, Attachment};
use crate::namespaces::{
    Endpoint, CLAIM_CDM_NS, CLAIM_SERVICE_NS, EDOCUMENT_V4_NS, EFOLDER_READ_NS, PARTICIPANT_NS,
    SOAPENV_NS, VBMS_EXTERNAL_NS, XOP_NS,
};
use crate::parser::{XmlDocument, XmlElement};
use crate::signature::{ContentSelector, SignatureTarget};
use crate::xpath::{bindings, find_first};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

const BODY_PATH: &str = "/soapenv:Envelope/soapenv:Body";

fn body_content_target() -> SignatureTarget {
    SignatureTarget::new(
        BODY_PATH,
        bindings([("soapenv", SOAPENV_NS)]),
        ContentSelector::Content,
    )
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

fn require(missing: &mut Vec<&'static str>, name: &'static str, value: &str) {
    if value.trim().is_empty() {
        missing.push(name);
    }
}

/// Veteran identity and mailing address for claim establishment.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VeteranRecord {
    pub file_number: String,
    /// Gender code as VBMS expects it, e.g. `M` or `F`
    pub sex: String,
    pub first_name: String,
    pub last_name: String,
    pub ssn: Option<String>,
    pub address_line1: Option<String>,
    pub address_line2: Option<String>,
    pub address_line3: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: Option<String>,
    pub zip_code: Option<String>,
}

/// End product and routing fields for a new claim.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaimInput {
    /// C&P Live is `1`, C&P Death is `2`
    pub benefit_type_code: String,
    pub payee_code: String,
    pub end_product_code: String,
    pub end_product_label: String,
    pub end_product_modifier: String,
    pub station_of_jurisdiction: String,
    pub date: Option<NaiveDate>,
    pub predischarge: bool,
    pub gulf_war_registry: bool,
    pub suppress_acknowledgment_letter: bool,
}

/// `establishClaim` on the claim service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstablishClaim {
    veteran: VeteranRecord,
    claim: ClaimInput,
    claim_date: NaiveDate,
}

impl EstablishClaim {
    pub const OPERATION: &'static str = "establishClaim";

    pub fn new(veteran: VeteranRecord, claim: ClaimInput) -> VbmsResult<Self> {
        let mut missing = Vec::new();
        require(&mut missing, "file_number", &veteran.file_number);
        require(&mut missing, "sex", &veteran.sex);
        require(&mut missing, "first_name", &veteran.first_name);
        require(&mut missing, "last_name", &veteran.last_name);
        require(&mut missing, "benefit_type_code", &claim.benefit_type_code);
        require(&mut missing, "payee_code", &claim.payee_code);
        require(&mut missing, "end_product_code", &claim.end_product_code);
        require(&mut missing, "end_product_label", &claim.end_product_label);
        require(&mut missing, "end_product_modifier", &claim.end_product_modifier);
        require(
            &mut missing,
            "station_of_jurisdiction",
            &claim.station_of_jurisdiction,
        );

        if claim.date.is_none() {
            missing.push("date");
        }
        match claim.date {
            Some(claim_date) if missing.is_empty() => Ok(Self {
                veteran,
                claim,
                claim_date,
            }),
            _ => Err(VbmsError::IncompleteRequest {
                operation: Self::OPERATION,
                missing,
            }),
        }
    }

    pub fn veteran(&self) -> &VeteranRecord {
        &self.veteran
    }

    pub fn claim(&self) -> &ClaimInput {
        &self.claim
    }

    fn build_body(&self) -> Vec<XmlElement> {
        let v = &self.veteran;
        let c = &self.claim;

        // absent person fields still go out, as empty attributes
        let address = XmlElement::new("participant:address")
            .with_attr("addressLine1", v.address_line1.as_deref().unwrap_or_default())
            .with_attr("addressLine2", v.address_line2.as_deref().unwrap_or_default())
            .with_attr("addressLine3", v.address_line3.as_deref().unwrap_or_default())
            .with_attr("city", v.city.as_deref().unwrap_or_default())
            .with_attr("stateCode", v.state.as_deref().unwrap_or_default())
            .with_attr("countryCode", v.country.as_deref().unwrap_or_default())
            .with_attr("postalCode", v.zip_code.as_deref().unwrap_or_default())
            .with_attr("preferredAddr", "true")
            .with_attr("type", "");

        let veteran_input = XmlElement::new("cla:veteranInput")
            .with_attr("fileNumber", &v.file_number)
            .with_attr("gender", &v.sex)
            .with_attr("marriageStatus", "Unknown")
            .with_child(
                XmlElement::new("participant:preferredName")
                    .with_attr("firstName", &v.first_name)
                    .with_attr("lastName", &v.last_name),
            )
            .with_child(
                XmlElement::new("participant:personalInfo")
                    .with_attr("ssn", v.ssn.as_deref().unwrap_or_default())
                    .with_child(address),
            );

        // sectionUnit is required but not interpreted by the service
        let claim_to_establish = XmlElement::new("cla:claimToEstablish")
            .with_attr("benefitTypeCd", &c.benefit_type_code)
            .with_attr("claimLevelStatusCd", "PEND")
            .with_attr("payeeCd", &c.payee_code)
            .with_attr("label", &c.end_product_label)
            .with_attr("modifiedEndProductCd", &c.end_product_modifier)
            .with_attr("sectionUnit", "999")
            .with_attr("stationOfJurisdiction", &c.station_of_jurisdiction)
            .with_attr("currentStationOfJurisdiction", &c.station_of_jurisdiction)
            .with_attr("disposition", "M")
            .with_attr("folderWithClaim", "N")
            .with_attr("priority", "1")
            .with_attr("preDischarge", bool_str(c.predischarge))
            .with_attr("gulfWarRegistry", bool_str(c.gulf_war_registry))
            .with_child(
                XmlElement::new("cdm:endProductClaimType")
                    .with_attr("code", &c.end_product_code)
                    .with_attr("name", &c.end_product_label),
            )
            .with_child(
                XmlElement::new("cdm:claimDateDt")
                    .with_text(self.claim_date.format("%Y-%m-%d").to_string()),
            )
            .with_child(
                XmlElement::new("cdm:suppressAckLetter")
                    .with_text(bool_str(c.suppress_acknowledgment_letter)),
            );

        vec![veteran_input, claim_to_establish]
    }

    fn extract_result(doc: &XmlDocument) -> VbmsResult<Claim> {
        let ns = bindings([("cla", CLAIM_SERVICE_NS)]);
        let el = find_first(doc, "//cla:establishClaimResponse/cla:establishedClaim", &ns)?
            .ok_or_else(|| {
                VbmsError::MalformedResponse(
                    "establishClaimResponse/establishedClaim not found".to_string(),
                )
            })?;

        let claim_id = el.attr_local("id").ok_or_else(|| {
            VbmsError::MalformedResponse("establishedClaim has no id".to_string())
        })?;

        Ok(Claim {
            claim_id: claim_id.to_string(),
            program_type_code: el.attr_local("programTypeCd").map(String::from),
            status_code: el.attr_local("claimLevelStatusCd").map(String::from),
            end_product_code: el
                .find_descendant_local("endProductClaimType")
                .and_then(|e| e.attr_local("code"))
                .map(String::from),
        })
    }
}

/// `getDocumentContent` on the eFolder read service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GetDocumentContent {
    document_id: String,
}

impl GetDocumentContent {
    pub const OPERATION: &'static str = "getDocumentContent";

    pub fn new(document_id: impl Into<String>) -> VbmsResult<Self> {
        let document_id = document_id.into();
        let mut missing = Vec::new();
        require(&mut missing, "document_id", &document_id);
        if !missing.is_empty() {
            return Err(VbmsError::IncompleteRequest {
                operation: Self::OPERATION,
                missing,
            });
        }
        Ok(Self { document_id })
    }

    pub fn document_id(&self) -> &str {
        &self.document_id
    }

    fn build_body(&self) -> Vec<XmlElement> {
        vec![XmlElement::new("read:documentVersionRefID").with_text(&self.document_id)]
    }

    fn extract_result(doc: &XmlDocument) -> VbmsResult<DocumentContent> {
        let ns = bindings([("read", EFOLDER_READ_NS)]);
        let result = find_first(doc, "//read:getDocumentContentResponse/read:result", &ns)?
            .ok_or_else(|| {
                VbmsError::MalformedResponse(
                    "getDocumentContentResponse/result not found".to_string(),
                )
            })?;

        let document_id = result
            .attr_local("documentVersionReferenceId")
            .ok_or_else(|| {
                VbmsError::MalformedResponse(
                    "result has no documentVersionReferenceId".to_string(),
                )
            })?;

        let encoded = result
            .find_child_local("bytes")
            .map(|b| b.text())
            .ok_or_else(|| VbmsError::MalformedResponse("result has no bytes".to_string()))?;
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let content = STANDARD.decode(compact).map_err(|e| {
            VbmsError::MalformedResponse(format!("Document bytes are not base64: {}", e))
        })?;

        Ok(DocumentContent {
            document_id: document_id.to_string(),
            content,
        })
    }
}

/// Input for an evidence upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentUpload {
    pub file_number: String,
    pub received_at: Option<DateTime<FixedOffset>>,
    pub first_name: String,
    pub middle_name: Option<String>,
    pub last_name: String,
    /// Document subject, e.g. the exam name
    pub subject: String,
    pub filename: String,
    #[serde(skip)]
    pub content: Vec<u8>,
    /// `356` is "C&P Exam"
    pub doc_type: String,
    pub source: String,
    /// Whether the associated claim is still pending
    pub new_mail: bool,
    pub external_id: String,
}

impl Default for DocumentUpload {
    fn default() -> Self {
        Self {
            file_number: String::new(),
            received_at: None,
            first_name: String::new(),
            middle_name: None,
            last_name: String::new(),
            subject: String::new(),
            filename: String::new(),
            content: Vec::new(),
            doc_type: "356".to_string(),
            source: "VHA_CUI".to_string(),
            new_mail: true,
            external_id: "123".to_string(),
        }
    }
}

/// `uploadDocumentWithAssociations` on the eDocument service. The document
/// travels as an MTOM attachment and the response comes back encrypted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadDocumentWithAssociations {
    upload: DocumentUpload,
    received_at: DateTime<FixedOffset>,
    attachment: Attachment,
}

impl UploadDocumentWithAssociations {
    pub const OPERATION: &'static str = "uploadDocumentWithAssociations";

    pub fn new(mut upload: DocumentUpload) -> VbmsResult<Self> {
        let mut missing = Vec::new();
        require(&mut missing, "file_number", &upload.file_number);
        if upload.received_at.is_none() {
            missing.push("received_at");
        }
        require(&mut missing, "first_name", &upload.first_name);
        require(&mut missing, "last_name", &upload.last_name);
        require(&mut missing, "subject", &upload.subject);
        require(&mut missing, "filename", &upload.filename);
        require(&mut missing, "doc_type", &upload.doc_type);
        if upload.content.is_empty() {
            missing.push("content");
        }

        let received_at = match upload.received_at {
            Some(at) if missing.is_empty() => at,
            _ => {
                return Err(VbmsError::IncompleteRequest {
                    operation: Self::OPERATION,
                    missing,
                })
            }
        };
        validate_filename(&upload.filename)?;

        let attachment = Attachment::new(upload.filename.clone(), std::mem::take(&mut upload.content));
        Ok(Self {
            upload,
            received_at,
            attachment,
        })
    }

    pub fn upload(&self) -> &DocumentUpload {
        &self.upload
    }

    /// The service rejects time-of-day; only the date is sent.
    fn va_receive_date(&self) -> String {
        self.received_at.format("%Y-%m-%dZ").to_string()
    }

    fn build_body(&self) -> Vec<XmlElement> {
        let u = &self.upload;

        let document = XmlElement::new("v4:document")
            .with_attr("externalId", &u.external_id)
            .with_attr("fileName", &u.filename)
            .with_attr("docType", &u.doc_type)
            .with_attr("subject", &u.subject)
            .with_attr("vaReceiveDate", self.va_receive_date())
            .with_attr("newMail", bool_str(u.new_mail))
            .with_child(XmlElement::new("doc:docSource").with_text(&u.source));

        let content = XmlElement::new("v4:documentContent").with_child(
            XmlElement::new("doc:data").with_child(
                XmlElement::new("xop:Include")
                    .with_attr("xmlns:xop", XOP_NS)
                    .with_attr("href", self.attachment.cid_href()),
            ),
        );

        let veteran = XmlElement::new("v4:veteran")
            .with_attr("fileNumber", &u.file_number)
            .with_attr("firstName", &u.first_name)
            .with_attr_opt("middleName", u.middle_name.as_deref())
            .with_attr("lastName", &u.last_name);

        vec![document, content, veteran]
    }

    fn extract_result(doc: &XmlDocument) -> VbmsResult<UploadedDocument> {
        let ns = bindings([("v4", EDOCUMENT_V4_NS)]);
        let response = find_first(doc, "//v4:uploadDocumentWithAssociationsResponse", &ns)?
            .ok_or_else(|| {
                VbmsError::MalformedResponse(
                    "uploadDocumentWithAssociationsResponse not found".to_string(),
                )
            })?;

        let document_version_ref_id = response
            .find_descendant_local("documentVersionRefID")
            .map(|e| e.text().trim().to_string())
            .filter(|id| !id.is_empty());

        Ok(UploadedDocument {
            document_version_ref_id,
        })
    }
}

/// One remote VBMS operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VbmsRequest {
    EstablishClaim(EstablishClaim),
    GetDocumentContent(GetDocumentContent),
    UploadDocumentWithAssociations(UploadDocumentWithAssociations),
}

impl VbmsRequest {
    pub fn operation_name(&self) -> &'static str {
        match self {
            Self::EstablishClaim(_) => EstablishClaim::OPERATION,
            Self::GetDocumentContent(_) => GetDocumentContent::OPERATION,
            Self::UploadDocumentWithAssociations(_) => UploadDocumentWithAssociations::OPERATION,
        }
    }

    pub fn endpoint(&self) -> Endpoint {
        match self {
            Self::EstablishClaim(_) => Endpoint::Claims,
            Self::GetDocumentContent(_) => Endpoint::EfolderReadInline,
            Self::UploadDocumentWithAssociations(_) => Endpoint::Edocument,
        }
    }

    /// Default endpoint path; `EndpointsConfig` may override it.
    pub fn endpoint_path(&self) -> &'static str {
        self.endpoint().default_path()
    }

    /// Prefix of the element wrapping the body fragment.
    fn operation_prefix(&self) -> &'static str {
        match self {
            Self::EstablishClaim(_) => "cla",
            Self::GetDocumentContent(_) => "read",
            Self::UploadDocumentWithAssociations(_) => "v4",
        }
    }

    /// Qualified name of the element wrapping the body fragment.
    pub fn operation_element(&self) -> String {
        format!("{}:{}", self.operation_prefix(), self.operation_name())
    }

    /// Namespaces this operation adds to the global table.
    pub fn namespaces(&self) -> &'static [(&'static str, &'static str)] {
        match self {
            Self::EstablishClaim(_) => &[
                ("cla", CLAIM_SERVICE_NS),
                ("cdm", CLAIM_CDM_NS),
                ("participant", PARTICIPANT_NS),
            ],
            Self::GetDocumentContent(_) => &[("read", EFOLDER_READ_NS)],
            Self::UploadDocumentWithAssociations(_) => &[],
        }
    }

    /// Elements this operation places in the SOAP Header.
    pub fn header_content(&self, user_id: &str) -> Vec<XmlElement> {
        match self {
            Self::EstablishClaim(_) => vec![XmlElement::new("vbmsext:userId")
                .with_attr("xmlns:vbmsext", VBMS_EXTERNAL_NS)
                .with_text(user_id)],
            _ => Vec::new(),
        }
    }

    /// The body fragment, without the operation element. Pure.
    pub fn build_body(&self) -> Vec<XmlElement> {
        match self {
            Self::EstablishClaim(r) => r.build_body(),
            Self::GetDocumentContent(r) => r.build_body(),
            Self::UploadDocumentWithAssociations(r) => r.build_body(),
        }
    }

    /// Elements the signing service must sign, in order.
    pub fn signature_targets(&self) -> Vec<SignatureTarget> {
        match self {
            Self::EstablishClaim(_) | Self::GetDocumentContent(_) => vec![body_content_target()],
            Self::UploadDocumentWithAssociations(_) => vec![SignatureTarget::new(
                "/soapenv:Envelope/soapenv:Body/v4:uploadDocumentWithAssociations/v4:document",
                bindings([("soapenv", SOAPENV_NS), ("v4", EDOCUMENT_V4_NS)]),
                ContentSelector::Element,
            )],
        }
    }

    /// Binary parts sent alongside the envelope.
    pub fn attachments(&self) -> &[Attachment] {
        match self {
            Self::UploadDocumentWithAssociations(r) => std::slice::from_ref(&r.attachment),
            _ => &[],
        }
    }

    /// Whether the response must go through the decryption service.
    pub fn decrypts_response(&self) -> bool {
        matches!(self, Self::UploadDocumentWithAssociations(_))
    }

    /// Decode a verified, fault-free response document.
    pub fn extract_result(&self, doc: &XmlDocument) -> VbmsResult<VbmsResponse> {
        match self {
            Self::EstablishClaim(_) => EstablishClaim::extract_result(doc).map(VbmsResponse::Claim),
            Self::GetDocumentContent(_) => {
                GetDocumentContent::extract_result(doc).map(VbmsResponse::DocumentContent)
            }
            Self::UploadDocumentWithAssociations(_) => {
                UploadDocumentWithAssociations::extract_result(doc)
                    .map(VbmsResponse::UploadedDocument)
            }
        }
    }
}

impl From<EstablishClaim> for VbmsRequest {
    fn from(request: EstablishClaim) -> Self {
        Self::EstablishClaim(request)
    }
}

impl From<GetDocumentContent> for VbmsRequest {
    fn from(request: GetDocumentContent) -> Self {
        Self::GetDocumentContent(request)
    }
}

impl From<UploadDocumentWithAssociations> for VbmsRequest {
    fn from(request: UploadDocumentWithAssociations) -> Self {
        Self::UploadDocumentWithAssociations(request)
    }
}

/// A claim as established by VBMS.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claim {
    pub claim_id: String,
    pub program_type_code: Option<String>,
    pub status_code: Option<String>,
    pub end_product_code: Option<String>,
}

/// Raw content of one document version.
#[derive(Clone, PartialEq, Eq)]
pub struct DocumentContent {
    pub document_id: String,
    pub content: Vec<u8>,
}

impl std::fmt::Debug for DocumentContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentContent")
            .field("document_id", &self.document_id)
            .field("bytes", &self.content.len())
            .finish()
    }
}

/// Acknowledgement of an upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedDocument {
    pub document_version_ref_id: Option<String>,
}

/// Typed result of a [`VbmsRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VbmsResponse {
    Claim(Claim),
    DocumentContent(DocumentContent),
    UploadedDocument(UploadedDocument),
}
