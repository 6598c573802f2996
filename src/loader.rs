//! Mail ingestion and materialization
//!
//! Two contracts over the same raw bytes. `load_mail_record` parses an
//! RFC 5322 message once at ingest into a storable record with its scrubbed
//! attachment parts. `load_mail_resource` re-parses only the headers of a
//! stored message and builds the JSON wire resource; it runs on every read,
//! so the stored record never caches derived header data.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use mailparse::{MailAddr, MailHeader, MailHeaderMap};

use crate::errors::{AppError, AppResult};
use crate::resource::{AttachmentResource, MailResource, Target, UrlBuilder};
use crate::scrub::{self, PartPayload};
use crate::store::{AttachmentMeta, MailRow, NewAttachment, NewMail};

/// A content-type estimate: MIME type plus optional charset
pub type TypeEstimate = (String, Option<String>);

/// Content sniffer over raw part payloads
///
/// External collaborator: given the payload bytes it may return a better
/// `(type, charset)` estimate than the declared headers, or nothing at all.
/// Failures are never fatal; the declared values stand.
pub type TypeSniffer = dyn Fn(&[u8]) -> Option<TypeEstimate> + Send + Sync;

/// Create a storable mail record from an RFC 5322 message
///
/// Populates the record id from the unquoted `Message-ID`, the timestamp
/// from the `Date` header, the plaintext body from the scrubber, and one
/// attachment per scrubbed part after content-type refinement:
///
/// 1. Declared `application/octet-stream` and `text/plain` parts are run
///    through `sniffer`; a usable estimate replaces both type and charset.
/// 2. Binary payloads of `text/*` parts are decoded with the declared
///    charset (UTF-8 when none); decode failure keeps the bytes.
/// 3. Textual payloads are re-encoded as UTF-8 and the charset is forced to
///    `utf-8`.
/// 4. The charset is stored only for `text/*` parts.
///
/// # Errors
///
/// Returns `MalformedMessage` when the message cannot be parsed, lacks a
/// `Message-ID` or parseable `Date` header, or when the scrubber yields two
/// parts with the same number.
pub fn load_mail_record(origin: &[u8], sniffer: &TypeSniffer) -> AppResult<NewMail> {
    let message = mailparse::parse_mail(origin)
        .map_err(|e| AppError::MalformedMessage(format!("unparseable message: {e}")))?;

    let id = message
        .headers
        .get_first_value("Message-ID")
        .map(|value| unquote(value.trim()))
        .filter(|id| !id.is_empty())
        .ok_or_else(|| AppError::MalformedMessage("missing Message-ID header".to_owned()))?;

    let date_header = message
        .headers
        .get_first_value("Date")
        .ok_or_else(|| AppError::MalformedMessage("missing Date header".to_owned()))?;
    let seconds = mailparse::dateparse(&date_header)
        .map_err(|e| AppError::MalformedMessage(format!("unparseable Date header: {e}")))?;
    let date = DateTime::<Utc>::from_timestamp(seconds, 0)
        .ok_or_else(|| AppError::MalformedMessage("Date header out of range".to_owned()))?;

    let (text, parts) = scrub::scrub(&message)?;

    let mut numbers = HashSet::new();
    let mut attachments = Vec::with_capacity(parts.len());
    for part in parts {
        if !numbers.insert(part.number) {
            return Err(AppError::MalformedMessage(format!(
                "duplicate attachment number {}",
                part.number
            )));
        }
        attachments.push(refine_part(part, sniffer));
    }

    Ok(NewMail {
        id,
        date,
        text: text.trim().to_owned(),
        data: origin.to_vec(),
        attachments,
    })
}

/// Apply the content-type refinement pipeline to one scrubbed part
fn refine_part(part: scrub::ScrubbedPart, sniffer: &TypeSniffer) -> NewAttachment {
    let scrub::ScrubbedPart {
        number,
        name,
        mut mime_type,
        mut code,
        mut payload,
    } = part;

    if matches!(
        mime_type.as_str(),
        "application/octet-stream" | "text/plain"
    ) && let Some((estimated_type, estimated_code)) = sniffer(payload.sniff_bytes())
    {
        mime_type = estimated_type;
        code = estimated_code;
    }

    if mime_type.starts_with("text/")
        && let PartPayload::Binary(bytes) = &payload
    {
        let label = code.as_deref().unwrap_or("utf-8");
        if let Some(encoding) = encoding_rs::Encoding::for_label(label.as_bytes())
            && let Some(text) = encoding.decode_without_bom_handling_and_without_replacement(bytes)
        {
            payload = PartPayload::Text(text.into_owned());
        }
    }

    let (data, code) = match payload {
        PartPayload::Text(text) => (text.into_bytes(), Some("utf-8".to_owned())),
        PartPayload::Binary(bytes) => (bytes, code),
    };
    let code = if mime_type.starts_with("text/") {
        code
    } else {
        None
    };

    NewAttachment {
        number,
        name,
        mime_type,
        code,
        data,
    }
}

/// Build the wire resource for a stored mail
///
/// Re-parses the stored bytes headers-only. Address headers unroll into
/// `Target` lists with first-occurrence de-duplication; absent headers stay
/// null. `In-Reply-To` and `References` split on whitespace with each token
/// unquoted. Self links come from `url`.
pub fn load_mail_resource(
    mail: &MailRow,
    attachments: &[AttachmentMeta],
    url: &UrlBuilder,
) -> AppResult<MailResource> {
    let (headers, _) = mailparse::parse_headers(&mail.data)
        .map_err(|e| AppError::MalformedMessage(format!("unparseable stored message: {e}")))?;

    let sender = address_targets(&headers, "Sender")?.and_then(|mut list| {
        if list.is_empty() {
            None
        } else {
            Some(list.remove(0))
        }
    });

    let attachments = attachments
        .iter()
        .map(|a| AttachmentResource {
            self_url: url.attachment(&mail.id, a.number),
            name: a.name.clone(),
            number: a.number,
            mime_type: a.mime_type.clone(),
            code: a.code.clone(),
        })
        .collect();

    Ok(MailResource {
        self_url: url.mail(&mail.id),
        id: mail.id.clone(),
        date: mail.date,
        text: mail.text.clone(),
        from: address_targets(&headers, "From")?,
        sender,
        reply_to: address_targets(&headers, "Reply-To")?,
        to: address_targets(&headers, "To")?,
        cc: address_targets(&headers, "Cc")?,
        bcc: address_targets(&headers, "Bcc")?,
        subject: headers
            .get_first_value("Subject")
            .map(|s| s.trim().to_owned()),
        in_reply_to: id_list(&headers, "In-Reply-To"),
        references: id_list(&headers, "References"),
        attachments,
    })
}

/// Unroll an address header into de-duplicated targets
///
/// Group addresses flatten into their members. Returns `None` when the
/// header is absent.
fn address_targets(headers: &[MailHeader<'_>], name: &str) -> AppResult<Option<Vec<Target>>> {
    let Some(header) = headers.get_first_header(name) else {
        return Ok(None);
    };
    let parsed = mailparse::addrparse_header(header)
        .map_err(|e| AppError::MalformedMessage(format!("unparseable {name} header: {e}")))?;

    let mut targets: Vec<Target> = Vec::new();
    for address in parsed.iter() {
        match address {
            MailAddr::Single(single) => push_unique(&mut targets, target_of(single)),
            MailAddr::Group(group) => {
                for single in &group.addrs {
                    push_unique(&mut targets, target_of(single));
                }
            }
        }
    }
    Ok(Some(targets))
}

fn target_of(single: &mailparse::SingleInfo) -> Target {
    Target {
        name: single.display_name.clone(),
        addr_spec: single.addr.clone(),
    }
}

fn push_unique(targets: &mut Vec<Target>, target: Target) {
    if !targets.contains(&target) {
        targets.push(target);
    }
}

/// Split a message-id header into unquoted tokens, preserving order
fn id_list(headers: &[MailHeader<'_>], name: &str) -> Option<Vec<String>> {
    headers
        .get_first_value(name)
        .map(|value| value.split_whitespace().map(unquote).collect())
}

/// Strip the angle brackets or quotes around a header token
fn unquote(value: impl AsRef<str>) -> String {
    let value = value.as_ref();
    if value.len() > 1 {
        if value.starts_with('<') && value.ends_with('>') {
            return value[1..value.len() - 1].to_owned();
        }
        if value.starts_with('"') && value.ends_with('"') {
            return value[1..value.len() - 1]
                .replace("\\\\", "\\")
                .replace("\\\"", "\"");
        }
    }
    value.to_owned()
}

/// Default content sniffer
///
/// Magic-number lookup through `file_type`; when that recognizes nothing
/// specific, a payload that is valid UTF-8 estimates as plain text and
/// anything else yields no estimate.
pub fn estimate_type(data: &[u8]) -> Option<TypeEstimate> {
    let charset = std::str::from_utf8(data).ok().map(|_| "utf-8".to_owned());

    let detected = file_type::FileType::from_bytes(data);
    match detected.media_types().first() {
        Some(media_type) if *media_type != "application/octet-stream" => {
            Some(((*media_type).to_owned(), charset))
        }
        _ => charset.map(|charset| ("text/plain".to_owned(), Some(charset))),
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{TypeEstimate, load_mail_record, load_mail_resource, unquote};
    use crate::resource::{Target, UrlBuilder};
    use crate::store::{AttachmentMeta, MailRow};

    const MAIL_1: &[u8] = include_bytes!("../tests/data/1.eml");
    const MAIL_2: &[u8] = include_bytes!("../tests/data/2.eml");
    const MAIL_4: &[u8] = include_bytes!("../tests/data/4.eml");

    /// Sniffer that never produces an estimate
    fn no_sniff(_: &[u8]) -> Option<TypeEstimate> {
        None
    }

    fn target(name: &str, addr_spec: &str) -> Target {
        Target {
            name: Some(name.to_owned()),
            addr_spec: addr_spec.to_owned(),
        }
    }

    fn resource_of(record: &crate::store::NewMail) -> crate::resource::MailResource {
        let mail = MailRow {
            id: record.id.clone(),
            date: record.date,
            text: record.text.clone(),
            data: record.data.clone(),
        };
        let attachments: Vec<AttachmentMeta> = record
            .attachments
            .iter()
            .map(|a| AttachmentMeta {
                mail_id: record.id.clone(),
                number: a.number,
                name: a.name.clone(),
                mime_type: a.mime_type.clone(),
                code: a.code.clone(),
            })
            .collect();
        load_mail_resource(&mail, &attachments, &UrlBuilder::detached()).expect("materialize")
    }

    #[test]
    fn loads_multipart_message_with_alternative_and_attachment() {
        let record = load_mail_record(MAIL_1, &no_sniff).expect("load");

        assert_eq!(record.id, "12b13e25-5ee2-471c-b78c-e3178668864d@kaimel.io");
        assert_eq!(
            record.date,
            Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap()
        );
        assert_eq!(record.text, "This is some *sample* text");
        assert_eq!(record.data, MAIL_1);
        assert_eq!(record.attachments.len(), 2);

        let html = &record.attachments[0];
        assert_eq!(html.number, 3);
        assert_eq!(html.name.as_deref(), Some("attachment.html"));
        assert_eq!(html.mime_type, "text/html");
        assert_eq!(html.code.as_deref(), Some("utf-8"));
        assert_eq!(
            String::from_utf8(html.data.clone()).expect("utf-8").trim(),
            "<div dir=\"ltr\">This is some <b>sample</b> text<br></div>"
        );

        let text = &record.attachments[1];
        assert_eq!(text.number, 4);
        assert_eq!(text.name.as_deref(), Some("test-attachment.txt"));
        assert_eq!(text.mime_type, "text/plain");
        assert_eq!(text.code.as_deref(), Some("utf-8"));
        assert_eq!(
            String::from_utf8(text.data.clone()).expect("utf-8").trim(),
            "This is a test attachment"
        );
    }

    #[test]
    fn materializes_all_address_headers_with_deduplication() {
        let record = load_mail_record(MAIL_1, &no_sniff).expect("load");
        let resource = resource_of(&record);

        // From lists Sample User 1 twice in the header; only the first copy
        // survives.
        assert_eq!(
            resource.from,
            Some(vec![
                target("Sample User 1", "sample-user-1@kaimel.io"),
                target("Sample User 2", "sample-user-2@kaimel.io"),
            ])
        );
        assert_eq!(
            resource.sender,
            Some(target("Sample User 0", "sample-user-0@kaimel.io"))
        );
        assert_eq!(
            resource.reply_to,
            Some(vec![
                target("pgsql-hackers", "pgsql-hackers@postgresql.org"),
                target("Sample User 3", "sample-user-3@kaimel.io"),
            ])
        );
        assert_eq!(
            resource.to,
            Some(vec![
                target("pgsql-hackers", "pgsql-hackers@postgresql.org"),
                target("Sample User 4", "sample-user-4@kaimel.io"),
            ])
        );
        assert_eq!(
            resource.cc,
            Some(vec![
                target("Sample User 5", "sample-user-5@kaimel.io"),
                target("Sample User 6", "sample-user-6@kaimel.io"),
            ])
        );
        assert_eq!(
            resource.bcc,
            Some(vec![
                target("Sample User 7", "sample-user-7@kaimel.io"),
                target("Sample User 8", "sample-user-8@kaimel.io"),
            ])
        );
        assert_eq!(
            resource.in_reply_to,
            Some(vec![
                "1bd5f0e9-690d-47a2-bfca-d4c1dc78daf8@kaimel.io".to_owned(),
                "b5634a34-5770-476b-bcdf-5d2551b1a94d@kaimel.io".to_owned(),
            ])
        );
        assert_eq!(
            resource.references,
            Some(vec![
                "1bd5f0e9-690d-47a2-bfca-d4c1dc78daf8@kaimel.io".to_owned(),
                "b5634a34-5770-476b-bcdf-5d2551b1a94d@kaimel.io".to_owned(),
                "3a3b8895-fd56-4d0a-95e4-82efaaeb0fb2@kaimel.io".to_owned(),
                "64431af8-9984-4eaf-a7fd-fcfd03ea114b@kaimel.io".to_owned(),
            ])
        );
        assert_eq!(resource.subject.as_deref(), Some("Test Message"));

        for (projected, stored) in resource.attachments.iter().zip(&record.attachments) {
            assert_eq!(projected.number, stored.number);
            assert_eq!(projected.name, stored.name);
            assert_eq!(projected.mime_type, stored.mime_type);
            assert_eq!(projected.self_url, None);
        }
    }

    #[test]
    fn html_only_message_has_empty_text_and_attachment_zero() {
        let record = load_mail_record(MAIL_2, &no_sniff).expect("load");

        assert_eq!(record.id, "30da3ae3-f1f1-44a4-966a-073eb75e1b70@kaimel.io");
        assert_eq!(record.text, "");
        assert_eq!(record.attachments.len(), 1);
        assert_eq!(record.attachments[0].number, 0);
        assert_eq!(
            record.attachments[0].name.as_deref(),
            Some("attachment.html")
        );
        assert_eq!(record.attachments[0].mime_type, "text/html");
        assert_eq!(record.attachments[0].code.as_deref(), Some("utf-8"));

        let resource = resource_of(&record);
        assert_eq!(
            resource.from,
            Some(vec![target("Sample User 1", "sample-user-1@kaimel.io")])
        );
        assert_eq!(resource.sender, None);
        assert_eq!(resource.reply_to, None);
        assert_eq!(resource.to, None);
        assert_eq!(resource.cc, None);
        assert_eq!(resource.bcc, None);
        assert_eq!(resource.in_reply_to, None);
        assert_eq!(resource.references, None);
        assert_eq!(resource.subject, None);
    }

    #[test]
    fn sniffed_octet_stream_becomes_text_attachment() {
        let sniffer =
            |_: &[u8]| Some(("text/x-diff".to_owned(), Some("utf-8".to_owned())));
        let record = load_mail_record(MAIL_4, &sniffer).expect("load");

        assert_eq!(record.id, "39669c1f-692f-467c-a0cd-f51a13e1fe12@kaimel.io");
        assert_eq!(record.text, "This is some *sample* text");
        assert_eq!(record.attachments.len(), 1);

        let diff = &record.attachments[0];
        assert_eq!(diff.number, 2);
        assert_eq!(diff.name.as_deref(), Some("sample.diff"));
        assert_eq!(diff.mime_type, "text/x-diff");
        assert_eq!(diff.code.as_deref(), Some("utf-8"));
        assert!(
            String::from_utf8(diff.data.clone())
                .expect("utf-8")
                .starts_with("commit 0000000000000000000000000000000000000000")
        );
    }

    #[test]
    fn unsniffed_octet_stream_keeps_declared_values() {
        let record = load_mail_record(MAIL_4, &no_sniff).expect("load");
        let diff = &record.attachments[0];

        assert_eq!(diff.mime_type, "application/octet-stream");
        assert_eq!(diff.code, None);
    }

    #[test]
    fn undecodable_text_attachment_keeps_its_bytes() {
        let sniffer = |_: &[u8]| Some(("text/plain".to_owned(), Some("utf-8".to_owned())));
        let raw = concat!(
            "Message-ID: <binary-test@kaimel.io>\r\n",
            "Date: Mon, 10 Jun 2024 08:00:00 -0400\r\n",
            "From: Sample User 1 <sample-user-1@kaimel.io>\r\n",
            "MIME-Version: 1.0\r\n",
            "Content-Type: multipart/mixed; boundary=\"b\"\r\n",
            "\r\n",
            "--b\r\n",
            "Content-Type: text/plain\r\n",
            "\r\n",
            "body\r\n",
            "--b\r\n",
            "Content-Type: application/octet-stream\r\n",
            "Content-Disposition: attachment; filename=\"blob.bin\"\r\n",
            "Content-Transfer-Encoding: base64\r\n",
            "\r\n",
            "/v8A\r\n",
            "--b--\r\n",
        )
        .as_bytes();

        let record = load_mail_record(raw, &sniffer).expect("load");
        let blob = &record.attachments[0];
        // Sniffed to text/plain but 0xFE 0xFF 0x00 does not decode as UTF-8.
        assert_eq!(blob.mime_type, "text/plain");
        assert_eq!(blob.data, vec![0xFE, 0xFF, 0x00]);
        assert_eq!(blob.code.as_deref(), Some("utf-8"));
    }

    #[test]
    fn missing_message_id_is_rejected() {
        let raw = b"Date: Mon, 10 Jun 2024 08:00:00 -0400\r\n\r\nhello";
        assert!(load_mail_record(raw, &no_sniff).is_err());
    }

    #[test]
    fn missing_date_is_rejected() {
        let raw = b"Message-ID: <x@kaimel.io>\r\n\r\nhello";
        assert!(load_mail_record(raw, &no_sniff).is_err());
    }

    #[test]
    fn unquote_strips_angle_brackets_and_quotes() {
        assert_eq!(unquote("<id@kaimel.io>"), "id@kaimel.io");
        assert_eq!(unquote("\"quoted\""), "quoted");
        assert_eq!(unquote("bare"), "bare");
        assert_eq!(unquote("<"), "<");
    }
}
