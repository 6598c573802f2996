//! HTTP surface: application state, router, and retrieval handlers
//!
//! Routes are wired through the authentication filter with `route_layer`, so
//! a request that matches no route is answered 404 without touching the
//! filter. Handlers negotiate their response body against the `Accept`
//! header and consult the store strictly through the requesting consumer's
//! dispatches; a missing dispatch and a missing mail are indistinguishable
//! 404s. The feed endpoint hands off to the delivery engine.

use std::sync::Arc;

use axum::Router;
use axum::body::Body;
use axum::extract::{Extension, Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use jsonwebtoken::DecodingKey;
use secrecy::ExposeSecret;
use tower_http::trace::TraceLayer;

use crate::accept;
use crate::auth;
use crate::config::ServerConfig;
use crate::deliver::{self, StreamHook};
use crate::errors::{AppError, AppResult};
use crate::loader;
use crate::resource::{AttachmentResource, UrlBuilder};
use crate::store::{AttachmentMeta, Consumer, Store};

/// Media types offered by `GET /mail/{id}`
const MAIL_OFFERS: &[&str] = &["text/plain", "application/json", "message/rfc822"];
/// Media types offered by `GET /mail`
const FEED_OFFERS: &[&str] = &["application/json", "application/x-ndjson"];
/// Selected when the request carries no usable `Accept` header
const DEFAULT_MEDIA_TYPE: &str = "application/json";

/// Shared application state
///
/// Cheap to clone; handlers receive it through the axum state extractor.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    /// Pre-built HS256 key for the authentication filter
    pub decoding_key: Arc<DecodingKey>,
    /// Hook run between the streaming drain and wait phases
    pub stream_hook: StreamHook,
}

impl AppState {
    /// Build the state with the default no-op streaming hook
    pub fn new(config: ServerConfig, store: Store) -> Self {
        let decoding_key = DecodingKey::from_secret(config.secret.expose_secret().as_bytes());
        Self {
            config: Arc::new(config),
            store,
            decoding_key: Arc::new(decoding_key),
            stream_hook: deliver::noop_hook(),
        }
    }

    /// Replace the streaming hook
    ///
    /// Tests inject side effects (committing new mail mid-stream) here.
    pub fn with_stream_hook(mut self, hook: StreamHook) -> Self {
        self.stream_hook = hook;
        self
    }
}

/// Assemble the router with authentication and request tracing
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/mail", get(select_mail))
        .route("/mail/{id}", get(retrieve_mail).delete(delete_mail))
        .route(
            "/mail/{mail_id}/attachment/{number}",
            get(retrieve_attachment),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::authenticate,
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn accept_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
}

/// `GET /mail/{id}`: one mail, content-negotiated
async fn retrieve_mail(
    State(state): State<AppState>,
    Extension(consumer): Extension<Consumer>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> AppResult<Response> {
    match accept::negotiate(accept_header(&headers), MAIL_OFFERS, DEFAULT_MEDIA_TYPE).as_deref() {
        Some(media_type @ ("text/plain" | "message/rfc822")) => {
            retrieve_mail_as_text(&state, &consumer, &id, media_type).await
        }
        Some("application/json") => retrieve_mail_as_json(&state, &consumer, &id).await,
        _ => {
            // 406 must not leak existence: without a dispatch it is a 404.
            if state.store.mail_visible(consumer.id, &id).await? {
                Err(AppError::NotAcceptable)
            } else {
                Err(AppError::NotFound)
            }
        }
    }
}

/// Raw-bytes rendering of a mail for the text media types
async fn retrieve_mail_as_text(
    state: &AppState,
    consumer: &Consumer,
    id: &str,
    media_type: &str,
) -> AppResult<Response> {
    let mail = state
        .store
        .mail_data_for_consumer(consumer.id, id)
        .await?
        .ok_or(AppError::NotFound)?;
    let body = String::from_utf8(mail.data)
        .map_err(|_| AppError::Internal("stored message is not valid UTF-8".to_owned()))?;
    let content_type = if media_type == "text/plain" {
        "text/plain; charset=utf-8"
    } else {
        "message/rfc822"
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

/// Materialized JSON rendering of a mail
async fn retrieve_mail_as_json(
    state: &AppState,
    consumer: &Consumer,
    id: &str,
) -> AppResult<Response> {
    let delivered = state
        .store
        .mail_for_consumer(consumer.id, id)
        .await?
        .ok_or(AppError::NotFound)?;
    let resource =
        loader::load_mail_resource(&delivered.mail, &delivered.attachments, &UrlBuilder::request())?;
    Ok(Json(resource).into_response())
}

/// `DELETE /mail/{id}`: remove the consumer's dispatch
async fn delete_mail(
    State(state): State<AppState>,
    Extension(consumer): Extension<Consumer>,
    Path(id): Path<String>,
) -> AppResult<Response> {
    match state.store.delete_dispatch(consumer.id, &id).await? {
        0 => Err(AppError::NotFound),
        _ => Ok(StatusCode::OK.into_response()),
    }
}

/// `GET /mail/{mail_id}/attachment/{number}`: one attachment,
/// content-negotiated over a type list derived from the attachment itself
async fn retrieve_attachment(
    State(state): State<AppState>,
    Extension(consumer): Extension<Consumer>,
    Path((mail_id, number)): Path<(String, i32)>,
    headers: HeaderMap,
) -> AppResult<Response> {
    // The share lock taken by the metadata lookup must outlive the blob
    // fetch, so both run on one transaction.
    let mut tx = state.store.begin().await?;
    let Some(attachment) = state
        .store
        .attachment_for_consumer(&mut tx, consumer.id, &mail_id, number)
        .await?
    else {
        return Err(AppError::NotFound);
    };

    let mut offers: Vec<&str> = vec![attachment.mime_type.as_str(), "application/json"];
    if attachment.mime_type.starts_with("text/") {
        offers.push("text/plain");
    }
    offers.push("application/octet-stream");

    let Some(media_type) = accept::negotiate(accept_header(&headers), &offers, DEFAULT_MEDIA_TYPE)
    else {
        return Err(AppError::NotAcceptable);
    };

    let response = if media_type == attachment.mime_type {
        let data = state
            .store
            .attachment_data(&mut tx, &attachment.mail_id, attachment.number)
            .await?;
        let content_type = content_type_with(&attachment.mime_type, attachment.code.as_deref());
        ([(header::CONTENT_TYPE, content_type)], data).into_response()
    } else if media_type == "text/plain" {
        let data = state
            .store
            .attachment_data(&mut tx, &attachment.mail_id, attachment.number)
            .await?;
        let content_type = content_type_with("text/plain", attachment.code.as_deref());
        ([(header::CONTENT_TYPE, content_type)], data).into_response()
    } else if media_type == "application/json" {
        Json(attachment_resource(&attachment)).into_response()
    } else {
        let data = state
            .store
            .attachment_data(&mut tx, &attachment.mail_id, attachment.number)
            .await?;
        (
            [(header::CONTENT_TYPE, "application/octet-stream".to_owned())],
            data,
        )
            .into_response()
    };
    tx.commit().await?;
    Ok(response)
}

/// Attachment projection with its self link
fn attachment_resource(attachment: &AttachmentMeta) -> AttachmentResource {
    AttachmentResource {
        self_url: UrlBuilder::request().attachment(&attachment.mail_id, attachment.number),
        name: attachment.name.clone(),
        number: attachment.number,
        mime_type: attachment.mime_type.clone(),
        code: attachment.code.clone(),
    }
}

/// `GET /mail`: the delivery feed, batch or streaming
async fn select_mail(
    State(state): State<AppState>,
    Extension(consumer): Extension<Consumer>,
    headers: HeaderMap,
) -> AppResult<Response> {
    match accept::negotiate(accept_header(&headers), FEED_OFFERS, DEFAULT_MEDIA_TYPE).as_deref() {
        Some("application/json") => {
            let resources =
                deliver::batch(&state.store, &consumer, &UrlBuilder::request()).await?;
            Ok(Json(resources).into_response())
        }
        Some("application/x-ndjson") => {
            let stream = deliver::stream(state.clone(), consumer, UrlBuilder::request());
            Response::builder()
                .header(header::CONTENT_TYPE, "application/x-ndjson")
                .body(Body::from_stream(stream))
                .map_err(|e| AppError::Internal(format!("response build failed: {e}")))
        }
        _ => Err(AppError::NotAcceptable),
    }
}

/// Render a content type with its optional charset parameter
fn content_type_with(media_type: &str, code: Option<&str>) -> String {
    match code {
        Some(code) => format!("{media_type}; charset={code}"),
        None => media_type.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::content_type_with;

    #[test]
    fn content_type_carries_charset_only_when_present() {
        assert_eq!(
            content_type_with("text/plain", Some("utf-8")),
            "text/plain; charset=utf-8"
        );
        assert_eq!(content_type_with("image/png", None), "image/png");
    }
}
