//! Delivery engine behind `GET /mail`
//!
//! Two modes over the same dispatch rows. Batch mode claims every due
//! dispatch in one atomic statement and buffers a JSON array. Streaming mode
//! is a long-lived NDJSON body that interleaves a *drain* phase (claim one
//! due dispatch at a time, commit, emit) with a *wait* phase on the
//! consumer's notification channel, so that newly scheduled mail is pushed
//! out without polling.
//!
//! The notification listener owns a dedicated pool connection for the whole
//! session; claim transactions run on separate connections. Sharing one
//! connection between the notification iterator and SQL would deadlock at
//! the driver, which is why the listener is acquired first and never used
//! for queries. Dropping the stream on any exit path (client disconnect
//! included) releases the listener connection and rolls back an in-flight
//! claim.

use std::sync::Arc;

use axum::body::Bytes;
use futures::Stream;
use futures::future::BoxFuture;
use sqlx::postgres::PgListener;
use tokio::time::{Instant, timeout_at};

use crate::errors::AppResult;
use crate::loader;
use crate::resource::{MailResource, UrlBuilder};
use crate::server::AppState;
use crate::store::{Consumer, DeliveredMail, Store};

/// Hook invoked between the drain and wait phases of every streaming pass
///
/// A no-op in production; tests inject side effects (such as committing new
/// mail) to exercise the notification path deterministically.
pub type StreamHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// The default, do-nothing hook
pub fn noop_hook() -> StreamHook {
    Arc::new(|| Box::pin(async {}))
}

/// Batch mode: claim everything due and materialize it, oldest first
///
/// The claim is a single statement, so a crash after commit has delivered
/// nothing twice and a crash before commit has delivered nothing at all.
pub async fn batch(
    store: &Store,
    consumer: &Consumer,
    url: &UrlBuilder,
) -> AppResult<Vec<MailResource>> {
    let delivered = store.claim_due_batch(consumer.id).await?;
    delivered
        .iter()
        .map(|item| loader::load_mail_resource(&item.mail, &item.attachments, url))
        .collect()
}

/// Streaming mode: a lazy NDJSON body that lives until the client leaves
///
/// Each emitted line corresponds to exactly one committed dispatch advance,
/// so a disconnect between commit and write costs at most one redelivery
/// after the redelivery interval.
pub fn stream(
    state: AppState,
    consumer: Consumer,
    url: UrlBuilder,
) -> impl Stream<Item = AppResult<Bytes>> + Send + 'static {
    let notify_wait = state.config.notify_wait;

    async_stream::try_stream! {
        let channel = format!("consumer_id={}", consumer.id);
        let mut listener = PgListener::connect_with(state.store.pool()).await?;
        listener.listen(&channel).await?;
        tracing::debug!(consumer_id = consumer.id, "streaming session listening");

        loop {
            // Drain: one claim, one commit, one line at a time.
            while let Some(delivered) = state.store.claim_one_due(consumer.id, None).await? {
                yield ndjson_line(&delivered, &url)?;
            }

            (state.stream_hook)().await;

            // Wait: bounded read of the notification channel. A notification
            // whose dispatch is no longer due was handled earlier; skip it.
            let deadline = Instant::now() + notify_wait;
            loop {
                let Ok(received) = timeout_at(deadline, listener.recv()).await else {
                    break;
                };
                let notification = received?;
                if let Some(delivered) = state
                    .store
                    .claim_one_due(consumer.id, Some(notification.payload()))
                    .await?
                {
                    yield ndjson_line(&delivered, &url)?;
                }
            }
        }
    }
}

/// Serialize one delivered mail as an NDJSON line
fn ndjson_line(delivered: &DeliveredMail, url: &UrlBuilder) -> AppResult<Bytes> {
    let resource = loader::load_mail_resource(&delivered.mail, &delivered.attachments, url)?;
    let mut line = serde_json::to_string(&resource)?;
    line.push('\n');
    Ok(Bytes::from(line))
}
