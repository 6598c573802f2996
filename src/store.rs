//! Store schema records and access layer
//!
//! Owns every SQL statement in the service and the transaction boundaries
//! around them. Large blob columns are projected in or out per query through
//! distinct record types: `MailRow` carries the raw message bytes,
//! `MailData` is the bytes-only projection for the text retrieval modes, and
//! `AttachmentMeta` never carries the attachment blob (a separate query
//! fetches it inside the same transaction when a response needs it).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, PgConnection, Postgres, Transaction};

/// Full mail row: identity, schedule-relevant metadata, and raw bytes
#[derive(Debug, Clone, FromRow)]
pub struct MailRow {
    /// Unquoted Message-ID, globally unique
    pub id: String,
    /// Parsed Date header
    pub date: DateTime<Utc>,
    /// Extracted plaintext body
    pub text: String,
    /// Original RFC 5322 bytes
    pub data: Vec<u8>,
}

/// Bytes-only mail projection for `text/plain` and `message/rfc822` reads
#[derive(Debug, Clone, FromRow)]
pub struct MailData {
    pub id: String,
    pub data: Vec<u8>,
}

/// Attachment row without its blob
#[derive(Debug, Clone, FromRow)]
pub struct AttachmentMeta {
    pub mail_id: String,
    pub number: i32,
    pub name: Option<String>,
    #[sqlx(rename = "type")]
    pub mime_type: String,
    pub code: Option<String>,
}

/// A feed subscriber
#[derive(Debug, Clone, FromRow)]
pub struct Consumer {
    pub id: i32,
    pub name: String,
}

/// Per-(consumer, mail) delivery schedule row
#[derive(Debug, Clone, FromRow)]
pub struct Dispatch {
    pub consumer_id: i32,
    pub mail_id: String,
    /// Most recent delivery instant, if any
    pub last_time: Option<DateTime<Utc>>,
    /// When the consumer is next eligible to receive the mail
    pub next_time: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// A mail claimed for delivery, with its attachment projections
#[derive(Debug, Clone)]
pub struct DeliveredMail {
    pub mail: MailRow,
    pub attachments: Vec<AttachmentMeta>,
}

/// Mail record ready for insertion
#[derive(Debug, Clone)]
pub struct NewMail {
    pub id: String,
    pub date: DateTime<Utc>,
    pub text: String,
    pub data: Vec<u8>,
    pub attachments: Vec<NewAttachment>,
}

/// Attachment record ready for insertion
#[derive(Debug, Clone)]
pub struct NewAttachment {
    pub number: i32,
    pub name: Option<String>,
    pub mime_type: String,
    pub code: Option<String>,
    pub data: Vec<u8>,
}

/// Claim every due dispatch for a consumer in one statement.
///
/// The inner CTE locks the due rows, the update advances them, and the outer
/// select returns the corresponding mails ordered by the pre-update
/// `next_time` (the update's RETURNING only exposes new values, so the due
/// CTE carries the old one through). The `FOR KEY SHARE` on mail keeps the
/// follow-up attachment fetch consistent. The re-check of `next_time` in the
/// update guards against a concurrent claimer that advanced a row between
/// our snapshot and the lock.
const CLAIM_DUE_BATCH: &str = r#"
WITH due AS (
    SELECT consumer_id, mail_id, next_time
    FROM dispatch
    WHERE consumer_id = $1 AND next_time <= now()
    FOR NO KEY UPDATE
), advanced AS (
    UPDATE dispatch AS d
    SET last_time = now(), next_time = now() + make_interval(secs => $2)
    FROM due
    WHERE d.consumer_id = due.consumer_id
      AND d.mail_id = due.mail_id
      AND d.next_time <= now()
    RETURNING d.mail_id, due.next_time AS due_time
)
SELECT m.id, m.date, m.text, m.data
FROM advanced
JOIN mail AS m ON m.id = advanced.mail_id
ORDER BY advanced.due_time ASC
FOR KEY SHARE OF m
"#;

/// Lock the single most overdue dispatch for a consumer.
///
/// `FOR NO KEY UPDATE` conflicts with other claimers of the same row while
/// staying compatible with the foreign-key checks on mail, so no explicit
/// mail lock is needed.
const CLAIM_ONE_DUE: &str = r#"
SELECT consumer_id, mail_id, last_time, next_time, created_at
FROM dispatch
WHERE consumer_id = $1 AND next_time <= now()
ORDER BY next_time
LIMIT 1
FOR NO KEY UPDATE
"#;

/// Variant of [`CLAIM_ONE_DUE`] pinned to one mail, used on notifications
const CLAIM_ONE_DUE_BY_MAIL: &str = r#"
SELECT consumer_id, mail_id, last_time, next_time, created_at
FROM dispatch
WHERE consumer_id = $1 AND mail_id = $2 AND next_time <= now()
LIMIT 1
FOR NO KEY UPDATE
"#;

const ADVANCE_DISPATCH: &str = r#"
UPDATE dispatch
SET last_time = now(), next_time = now() + make_interval(secs => $3)
WHERE consumer_id = $1 AND mail_id = $2
"#;

const MAIL_BY_ID: &str = "SELECT id, date, text, data FROM mail WHERE id = $1";

const MAIL_FOR_CONSUMER: &str = r#"
SELECT m.id, m.date, m.text, m.data
FROM mail AS m
JOIN dispatch AS d ON d.mail_id = m.id
WHERE d.consumer_id = $1 AND m.id = $2
"#;

const MAIL_DATA_FOR_CONSUMER: &str = r#"
SELECT m.id, m.data
FROM mail AS m
JOIN dispatch AS d ON d.mail_id = m.id
WHERE d.consumer_id = $1 AND m.id = $2
"#;

const MAIL_VISIBLE: &str =
    "SELECT EXISTS (SELECT 1 FROM dispatch WHERE consumer_id = $1 AND mail_id = $2)";

const ATTACHMENTS_FOR_MAIL: &str = r#"
SELECT mail_id, number, name, type, code
FROM attachment
WHERE mail_id = $1
ORDER BY number ASC
"#;

const ATTACHMENTS_FOR_MAILS: &str = r#"
SELECT mail_id, number, name, type, code
FROM attachment
WHERE mail_id = ANY($1)
ORDER BY mail_id, number ASC
"#;

/// Shared row lock on the attachment so a concurrent delete cannot race
/// with the blob fetch that follows in the same transaction.
const ATTACHMENT_FOR_CONSUMER: &str = r#"
SELECT a.mail_id, a.number, a.name, a.type, a.code
FROM attachment AS a
JOIN dispatch AS d ON d.mail_id = a.mail_id
WHERE d.consumer_id = $1 AND a.mail_id = $2 AND a.number = $3
FOR SHARE OF a
"#;

const ATTACHMENT_DATA: &str = "SELECT data FROM attachment WHERE mail_id = $1 AND number = $2";

const DELETE_DISPATCH: &str = "DELETE FROM dispatch WHERE consumer_id = $1 AND mail_id = $2";

const INSERT_MAIL: &str = "INSERT INTO mail (id, date, text, data) VALUES ($1, $2, $3, $4)";

const INSERT_ATTACHMENT: &str = r#"
INSERT INTO attachment (mail_id, number, name, type, code, data)
VALUES ($1, $2, $3, $4, $5, $6)
"#;

const INSERT_CONSUMER: &str = "INSERT INTO consumer (name) VALUES ($1) RETURNING id, name";

const INSERT_DISPATCH: &str = r#"
INSERT INTO dispatch (consumer_id, mail_id)
VALUES ($1, $2)
RETURNING consumer_id, mail_id, last_time, next_time, created_at
"#;

const SELECT_CONSUMER: &str = "SELECT id, name FROM consumer WHERE id = $1";

const SELECT_DISPATCH: &str = r#"
SELECT consumer_id, mail_id, last_time, next_time, created_at
FROM dispatch
WHERE consumer_id = $1 AND mail_id = $2
"#;

const SELECT_CONSUMERS: &str = "SELECT id, name FROM consumer ORDER BY id ASC";

/// Typed query surface over the connection pool
///
/// Cloning is cheap; the pool is shared.
#[derive(Debug, Clone)]
pub struct Store {
    pool: PgPool,
    redeliver_seconds: f64,
}

impl Store {
    /// Wrap a pool, advancing delivered dispatches by `redeliver_after`
    pub fn new(pool: PgPool, redeliver_after: std::time::Duration) -> Self {
        Self {
            pool,
            redeliver_seconds: redeliver_after.as_secs_f64(),
        }
    }

    /// The underlying pool, used by the streaming engine to acquire its
    /// dedicated notification connection
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Open a transaction for callers that span multiple queries
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    /// Resolve a consumer by id
    pub async fn consumer(&self, id: i32) -> Result<Option<Consumer>, sqlx::Error> {
        sqlx::query_as(SELECT_CONSUMER)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
    }

    /// All registered consumers, in id order
    pub async fn consumers(&self) -> Result<Vec<Consumer>, sqlx::Error> {
        sqlx::query_as(SELECT_CONSUMERS).fetch_all(&self.pool).await
    }

    /// Register a feed subscriber
    pub async fn create_consumer(&self, name: &str) -> Result<Consumer, sqlx::Error> {
        sqlx::query_as(INSERT_CONSUMER)
            .bind(name)
            .fetch_one(&self.pool)
            .await
    }

    /// Schedule a mail for a consumer; the schema trigger notifies the
    /// consumer's channel on commit
    pub async fn create_dispatch(
        &self,
        consumer_id: i32,
        mail_id: &str,
    ) -> Result<Dispatch, sqlx::Error> {
        sqlx::query_as(INSERT_DISPATCH)
            .bind(consumer_id)
            .bind(mail_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Look up a single dispatch row
    pub async fn dispatch(
        &self,
        consumer_id: i32,
        mail_id: &str,
    ) -> Result<Option<Dispatch>, sqlx::Error> {
        sqlx::query_as(SELECT_DISPATCH)
            .bind(consumer_id)
            .bind(mail_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Remove the consumer's dispatch for a mail, returning rows removed
    pub async fn delete_dispatch(
        &self,
        consumer_id: i32,
        mail_id: &str,
    ) -> Result<u64, sqlx::Error> {
        let result = sqlx::query(DELETE_DISPATCH)
            .bind(consumer_id)
            .bind(mail_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Whether a dispatch authorizes the consumer to observe the mail
    pub async fn mail_visible(&self, consumer_id: i32, mail_id: &str) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(MAIL_VISIBLE)
            .bind(consumer_id)
            .bind(mail_id)
            .fetch_one(&self.pool)
            .await
    }

    /// Bytes-only lookup of a dispatch-joined mail
    pub async fn mail_data_for_consumer(
        &self,
        consumer_id: i32,
        mail_id: &str,
    ) -> Result<Option<MailData>, sqlx::Error> {
        sqlx::query_as(MAIL_DATA_FOR_CONSUMER)
            .bind(consumer_id)
            .bind(mail_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// Full lookup of a dispatch-joined mail with attachments eager-loaded
    pub async fn mail_for_consumer(
        &self,
        consumer_id: i32,
        mail_id: &str,
    ) -> Result<Option<DeliveredMail>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mail: Option<MailRow> = sqlx::query_as(MAIL_FOR_CONSUMER)
            .bind(consumer_id)
            .bind(mail_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(mail) = mail else {
            return Ok(None);
        };
        let attachments = sqlx::query_as(ATTACHMENTS_FOR_MAIL)
            .bind(&mail.id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(DeliveredMail { mail, attachments }))
    }

    /// Locked attachment metadata lookup, gated by the consumer's dispatch
    ///
    /// Runs on a caller-held transaction; the `FOR SHARE` lock persists
    /// until that transaction ends, covering a later [`Self::attachment_data`]
    /// call.
    pub async fn attachment_for_consumer(
        &self,
        conn: &mut PgConnection,
        consumer_id: i32,
        mail_id: &str,
        number: i32,
    ) -> Result<Option<AttachmentMeta>, sqlx::Error> {
        sqlx::query_as(ATTACHMENT_FOR_CONSUMER)
            .bind(consumer_id)
            .bind(mail_id)
            .bind(number)
            .fetch_optional(conn)
            .await
    }

    /// Fetch the attachment blob, deferred until a response actually needs it
    ///
    /// The caller already holds a share lock on the row, so it must exist.
    pub async fn attachment_data(
        &self,
        conn: &mut PgConnection,
        mail_id: &str,
        number: i32,
    ) -> Result<Vec<u8>, sqlx::Error> {
        sqlx::query_scalar(ATTACHMENT_DATA)
            .bind(mail_id)
            .bind(number)
            .fetch_one(conn)
            .await
    }

    /// Atomically claim every due dispatch for a consumer
    ///
    /// One round trip: the CTE advances the rows, and the mails come back in
    /// ascending pre-update `next_time` order with attachments prefetched.
    pub async fn claim_due_batch(
        &self,
        consumer_id: i32,
    ) -> Result<Vec<DeliveredMail>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let mails: Vec<MailRow> = sqlx::query_as(CLAIM_DUE_BATCH)
            .bind(consumer_id)
            .bind(self.redeliver_seconds)
            .fetch_all(&mut *tx)
            .await?;
        if mails.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let ids: Vec<String> = mails.iter().map(|m| m.id.clone()).collect();
        let metas: Vec<AttachmentMeta> = sqlx::query_as(ATTACHMENTS_FOR_MAILS)
            .bind(&ids[..])
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut by_mail: HashMap<String, Vec<AttachmentMeta>> = HashMap::new();
        for meta in metas {
            by_mail.entry(meta.mail_id.clone()).or_default().push(meta);
        }
        Ok(mails
            .into_iter()
            .map(|mail| {
                let attachments = by_mail.remove(&mail.id).unwrap_or_default();
                DeliveredMail { mail, attachments }
            })
            .collect())
    }

    /// Claim and advance the single most overdue dispatch, if any
    ///
    /// With `mail_id` set, only a dispatch for that mail qualifies (the
    /// notification path). Each call is its own transaction: the row lock,
    /// the advance, and the mail load commit together before the caller
    /// yields the resource, so a client disconnect costs at most this one
    /// dispatch.
    pub async fn claim_one_due(
        &self,
        consumer_id: i32,
        mail_id: Option<&str>,
    ) -> Result<Option<DeliveredMail>, sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        let dispatch: Option<Dispatch> = match mail_id {
            Some(mail_id) => {
                sqlx::query_as(CLAIM_ONE_DUE_BY_MAIL)
                    .bind(consumer_id)
                    .bind(mail_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
            None => {
                sqlx::query_as(CLAIM_ONE_DUE)
                    .bind(consumer_id)
                    .fetch_optional(&mut *tx)
                    .await?
            }
        };
        // Dropping the transaction rolls back, releasing the read snapshot.
        let Some(dispatch) = dispatch else {
            return Ok(None);
        };

        sqlx::query(ADVANCE_DISPATCH)
            .bind(consumer_id)
            .bind(&dispatch.mail_id)
            .bind(self.redeliver_seconds)
            .execute(&mut *tx)
            .await?;
        let mail: MailRow = sqlx::query_as(MAIL_BY_ID)
            .bind(&dispatch.mail_id)
            .fetch_one(&mut *tx)
            .await?;
        let attachments = sqlx::query_as(ATTACHMENTS_FOR_MAIL)
            .bind(&mail.id)
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(Some(DeliveredMail { mail, attachments }))
    }

    /// Insert a mail and its attachments in one transaction
    ///
    /// Re-ingesting the same Message-ID fails on the primary key.
    pub async fn insert_mail(&self, mail: &NewMail) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(INSERT_MAIL)
            .bind(&mail.id)
            .bind(mail.date)
            .bind(&mail.text)
            .bind(&mail.data)
            .execute(&mut *tx)
            .await?;
        for attachment in &mail.attachments {
            sqlx::query(INSERT_ATTACHMENT)
                .bind(&mail.id)
                .bind(attachment.number)
                .bind(&attachment.name)
                .bind(&attachment.mime_type)
                .bind(&attachment.code)
                .bind(&attachment.data)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await
    }
}
