//! MIME part scrubber
//!
//! Walks the MIME tree of a parsed message, collecting the plaintext body
//! and stripping every other leaf part out as a numbered attachment. Part
//! numbers count every node of the tree in depth-first order (containers
//! included), so they are stable identifiers of where a part sat in the
//! original message rather than a dense sequence.

use mailparse::{DispositionType, ParsedMail};

use crate::errors::{AppError, AppResult};

/// One part stripped out of a message
#[derive(Debug, Clone)]
pub struct ScrubbedPart {
    /// Position of the part in the depth-first walk of the message
    pub number: i32,
    /// Declared file name, or a synthesized `attachment.<ext>` fallback
    pub name: Option<String>,
    /// Declared MIME content type, lowercased
    pub mime_type: String,
    /// Declared charset parameter, if any
    pub code: Option<String>,
    /// Part payload, decoded to text where the transport encoding and
    /// charset allowed it
    pub payload: PartPayload,
}

/// Payload of a scrubbed part
///
/// `Text` means the part body decoded cleanly through its declared charset;
/// `Binary` carries the transfer-decoded bytes untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PartPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl PartPayload {
    /// View the payload as bytes for content sniffing
    pub fn sniff_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Binary(bytes) => bytes,
        }
    }
}

/// Scrub a parsed message into its plaintext body and attachment parts
///
/// Inline `text/plain` parts are joined (in document order) into the body;
/// every other leaf part, and any text part carrying an attachment
/// disposition or file name, is returned as a `ScrubbedPart`.
///
/// # Errors
///
/// Returns `MalformedMessage` if a part body cannot be transfer-decoded.
pub fn scrub(message: &ParsedMail<'_>) -> AppResult<(String, Vec<ScrubbedPart>)> {
    let mut number = 0;
    let mut texts = Vec::new();
    let mut parts = Vec::new();
    walk(message, &mut number, &mut texts, &mut parts)?;
    Ok((texts.join("\n"), parts))
}

/// Walk the MIME tree depth-first, numbering every node
fn walk(
    part: &ParsedMail<'_>,
    number: &mut i32,
    texts: &mut Vec<String>,
    parts: &mut Vec<ScrubbedPart>,
) -> AppResult<()> {
    let current = *number;
    *number += 1;

    if !part.subparts.is_empty() {
        for sub in &part.subparts {
            walk(sub, number, texts, parts)?;
        }
        return Ok(());
    }

    let mime_type = part.ctype.mimetype.to_ascii_lowercase();
    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let is_attachment =
        disposition.disposition == DispositionType::Attachment || filename.is_some();

    if mime_type == "text/plain" && !is_attachment {
        let body = part
            .get_body()
            .map_err(|e| AppError::MalformedMessage(format!("undecodable body part: {e}")))?;
        texts.push(body);
        return Ok(());
    }

    let name = filename.unwrap_or_else(|| synthesized_name(&mime_type));
    let code = part.ctype.params.get("charset").cloned();
    let payload = if mime_type.starts_with("text/") {
        match part.get_body() {
            Ok(text) => PartPayload::Text(text),
            Err(_) => PartPayload::Binary(raw_body(part)?),
        }
    } else {
        PartPayload::Binary(raw_body(part)?)
    };

    parts.push(ScrubbedPart {
        number: current,
        name: Some(name),
        mime_type,
        code,
        payload,
    });
    Ok(())
}

fn raw_body(part: &ParsedMail<'_>) -> AppResult<Vec<u8>> {
    part.get_body_raw()
        .map_err(|e| AppError::MalformedMessage(format!("undecodable attachment part: {e}")))
}

/// Name for a part that declared none
fn synthesized_name(mime_type: &str) -> String {
    match mime2ext::mime2ext(mime_type) {
        Some(ext) => format!("attachment.{ext}"),
        None => "attachment".to_owned(),
    }
}
