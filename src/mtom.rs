//! MTOM multipart packaging for upload operations.
//!
//! The eDocument service only accepts the exact layout produced here: a root
//! `application/xop+xml` part carrying the signed envelope, then one binary
//! part per attachment whose Content-ID matches the `xop:Include` reference in
//! the envelope. Lines end in CRLF.

use crate::error::{VbmsError, VbmsResult};

/// Boundary token the service expects.
pub const MTOM_BOUNDARY: &str = "boundary_1234";

/// Content-ID of the root (envelope) part.
pub const ROOT_CONTENT_ID: &str = "soap_request";

/// A binary payload sent alongside the envelope.
#[derive(Clone, PartialEq, Eq)]
pub struct Attachment {
    pub filename: String,
    pub content: Vec<u8>,
}

impl std::fmt::Debug for Attachment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attachment")
            .field("filename", &self.filename)
            .field("bytes", &self.content.len())
            .finish()
    }
}

impl Attachment {
    pub fn new(filename: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            content,
        }
    }

    /// The `href` an `xop:Include` uses to reference this attachment.
    pub fn cid_href(&self) -> String {
        format!("cid:{}", self.filename)
    }
}

/// A packaged multipart body and the Content-Type header that describes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MtomMessage {
    pub content_type: String,
    pub body: Vec<u8>,
}

/// HTTP Content-Type for an MTOM message with the given boundary.
pub fn content_type(boundary: &str) -> String {
    format!(
        "Multipart/Related; type=\"application/xop+xml\"; start-info=\"application/soap+xml\"; boundary=\"{}\"",
        boundary
    )
}

/// Package with the service's fixed boundary.
pub fn package(envelope_xml: &str, attachments: &[Attachment]) -> VbmsResult<MtomMessage> {
    package_with_boundary(MTOM_BOUNDARY, envelope_xml, attachments)
}

pub fn package_with_boundary(
    boundary: &str,
    envelope_xml: &str,
    attachments: &[Attachment],
) -> VbmsResult<MtomMessage> {
    if attachments.is_empty() {
        return Err(VbmsError::Config(
            "MTOM packaging needs at least one attachment".to_string(),
        ));
    }
    for attachment in attachments {
        validate_filename(&attachment.filename)?;
    }

    let payload_len: usize = attachments.iter().map(|a| a.content.len() + 256).sum();
    let mut body = Vec::with_capacity(envelope_xml.len() + payload_len + 256);

    push_line(&mut body, &format!("--{}", boundary));
    push_line(
        &mut body,
        "Content-Type: application/xop+xml; charset=UTF-8; type=\"application/soap+xml\"",
    );
    push_line(&mut body, "Content-Transfer-Encoding: 8bit");
    push_line(&mut body, &format!("Content-ID: <{}>", ROOT_CONTENT_ID));
    push_line(&mut body, "");
    push_line(&mut body, envelope_xml);

    for attachment in attachments {
        push_line(&mut body, &format!("--{}", boundary));
        push_line(&mut body, "Content-Type: application/octet-stream");
        push_line(&mut body, "Content-Transfer-Encoding: binary");
        push_line(&mut body, &format!("Content-ID: <{}>", attachment.filename));
        push_line(&mut body, "");
        body.extend_from_slice(&attachment.content);
        body.extend_from_slice(b"\r\n");
    }

    push_line(&mut body, &format!("--{}--", boundary));

    Ok(MtomMessage {
        content_type: content_type(boundary),
        body,
    })
}

/// Filenames end up in a MIME header and a `cid:` URI.
pub fn validate_filename(filename: &str) -> VbmsResult<()> {
    if filename.is_empty() {
        return Err(VbmsError::Config("Attachment filename is empty".to_string()));
    }
    if filename
        .chars()
        .any(|c| c.is_control() || matches!(c, '<' | '>' | '"'))
    {
        return Err(VbmsError::Config(format!(
            "Attachment filename {:?} contains characters not allowed in a Content-ID",
            filename
        )));
    }
    Ok(())
}

fn push_line(body: &mut Vec<u8>, line: &str) {
    body.extend_from_slice(line.as_bytes());
    body.extend_from_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_type_header() {
        assert_eq!(
            content_type(MTOM_BOUNDARY),
            "Multipart/Related; type=\"application/xop+xml\"; start-info=\"application/soap+xml\"; boundary=\"boundary_1234\""
        );
    }

    #[test]
    fn test_one_part_per_attachment() {
        let message = package(
            "<e/>",
            &[
                Attachment::new("a.pdf", vec![1, 2, 3]),
                Attachment::new("b.pdf", vec![0xff, 0x00]),
            ],
        )
        .unwrap();
        let text = String::from_utf8_lossy(&message.body);
        assert_eq!(text.matches("--boundary_1234\r\n").count(), 3);
        assert!(text.contains("Content-ID: <a.pdf>\r\n"));
        assert!(text.contains("Content-ID: <b.pdf>\r\n"));
        assert!(message.body.ends_with(b"\r\n--boundary_1234--\r\n"));
        let raw = b"\r\n\r\n\xff\x00\r\n";
        assert!(message.body.windows(raw.len()).any(|w| w == raw));
    }

    #[test]
    fn test_rejects_header_injection_in_filename() {
        let err = package("<e/>", &[Attachment::new("a.pdf>\r\nX-Evil: 1", vec![])]).unwrap_err();
        assert!(matches!(err, VbmsError::Config(_)));
        assert!(package("<e/>", &[]).is_err());
    }

    #[test]
    fn test_cid_href() {
        assert_eq!(Attachment::new("exam.pdf", vec![]).cid_href(), "cid:exam.pdf");
    }
}
