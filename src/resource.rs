//! Wire resources for mail and attachments
//!
//! Frozen value types serialized into every HTTP response body. Header-named
//! fields keep their RFC 5322 spellings on the wire (`from`, `reply-to`,
//! `in-reply-to`) and each object carries a `self` link when a request
//! context is active. Absent address headers serialize as `null`; a present
//! but empty header serializes as `[]`.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A single address from an address header
///
/// Equality is structural, which is what the de-duplication in the
/// materializer relies on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Target {
    /// Display name, absent for bare addresses
    pub name: Option<String>,
    /// The `local@domain` address itself
    pub addr_spec: String,
}

/// Attachment projection returned inside mail resources and by the
/// attachment endpoint in JSON mode
///
/// Never carries the attachment bytes; those are served through content
/// negotiation on the attachment endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttachmentResource {
    /// Link to the attachment endpoint, null outside a request context
    #[serde(rename = "self")]
    pub self_url: Option<String>,
    /// Declared or synthesized file name
    pub name: Option<String>,
    /// Part number within the parent mail
    pub number: i32,
    /// MIME content type
    #[serde(rename = "type")]
    pub mime_type: String,
    /// Charset, present only for `text/*` attachments
    pub code: Option<String>,
}

/// The mail resource served by `GET /mail` and `GET /mail/{id}`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailResource {
    /// Link to the mail endpoint, null outside a request context
    #[serde(rename = "self")]
    pub self_url: Option<String>,
    /// Message-ID, unquoted
    pub id: String,
    /// Parsed Date header
    pub date: DateTime<Utc>,
    /// Extracted plaintext body
    pub text: String,
    pub from: Option<Vec<Target>>,
    pub sender: Option<Target>,
    #[serde(rename = "reply-to")]
    pub reply_to: Option<Vec<Target>>,
    pub to: Option<Vec<Target>>,
    pub cc: Option<Vec<Target>>,
    pub bcc: Option<Vec<Target>>,
    pub subject: Option<String>,
    #[serde(rename = "in-reply-to")]
    pub in_reply_to: Option<Vec<String>>,
    pub references: Option<Vec<String>>,
    /// Attachment projections in stored order
    pub attachments: Vec<AttachmentResource>,
}

/// Produces `self` links for resources
///
/// Passed explicitly into the materializer. Handlers construct an active
/// builder; detached contexts (the ingest CLI, unit tests without a request)
/// render `null` links instead.
#[derive(Debug, Clone, Copy)]
pub struct UrlBuilder {
    active: bool,
}

impl UrlBuilder {
    /// Builder for an active request context
    pub fn request() -> Self {
        Self { active: true }
    }

    /// Builder that renders every link as null
    pub fn detached() -> Self {
        Self { active: false }
    }

    /// Link to a mail resource
    pub fn mail(&self, id: &str) -> Option<String> {
        self.active
            .then(|| format!("/mail/{}", urlencoding::encode(id)))
    }

    /// Link to an attachment resource
    pub fn attachment(&self, mail_id: &str, number: i32) -> Option<String> {
        self.active
            .then(|| format!("/mail/{}/attachment/{number}", urlencoding::encode(mail_id)))
    }
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{AttachmentResource, MailResource, Target, UrlBuilder};

    fn minimal_resource() -> MailResource {
        MailResource {
            self_url: UrlBuilder::request().mail("test-mail"),
            id: "test-mail".to_owned(),
            date: Utc.with_ymd_and_hms(2024, 6, 10, 12, 0, 0).unwrap(),
            text: String::new(),
            from: None,
            sender: None,
            reply_to: None,
            to: Some(Vec::new()),
            cc: None,
            bcc: None,
            subject: None,
            in_reply_to: None,
            references: None,
            attachments: vec![AttachmentResource {
                self_url: UrlBuilder::request().attachment("test-mail", 3),
                name: Some("attachment.html".to_owned()),
                number: 3,
                mime_type: "text/html".to_owned(),
                code: Some("utf-8".to_owned()),
            }],
        }
    }

    #[test]
    fn serializes_wire_aliases_and_null_versus_empty_lists() {
        let value = serde_json::to_value(minimal_resource()).expect("serialize");

        assert_eq!(value["self"], "/mail/test-mail");
        assert!(value["from"].is_null());
        assert_eq!(value["to"], serde_json::json!([]));
        assert!(value.get("reply-to").is_some());
        assert!(value.get("in-reply-to").is_some());
        assert!(value.get("reply_to").is_none());

        let attachment = &value["attachments"][0];
        assert_eq!(attachment["self"], "/mail/test-mail/attachment/3");
        assert_eq!(attachment["type"], "text/html");
        assert_eq!(attachment["code"], "utf-8");
        assert!(attachment.get("data").is_none());
    }

    #[test]
    fn detached_builder_renders_null_links() {
        let url = UrlBuilder::detached();
        assert_eq!(url.mail("x"), None);
        assert_eq!(url.attachment("x", 1), None);
    }

    #[test]
    fn link_paths_encode_reserved_characters() {
        let url = UrlBuilder::request();
        let link = url.mail("a/b c").expect("active builder");
        assert_eq!(link, "/mail/a%2Fb%20c");
    }

    #[test]
    fn targets_compare_structurally() {
        let a = Target {
            name: Some("Sample User".to_owned()),
            addr_spec: "sample@kaimel.io".to_owned(),
        };
        assert_eq!(a, a.clone());
        assert_ne!(
            a,
            Target {
                name: None,
                addr_spec: "sample@kaimel.io".to_owned()
            }
        );
    }
}
