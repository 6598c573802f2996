//! Application error model with HTTP response mapping
//!
//! Defines a typed error hierarchy using `thiserror` for internal error
//! handling, and maps each variant to the HTTP status code the API contract
//! promises. Authentication rejections (401) are not represented here: they
//! carry a `WWW-Authenticate` challenge derived from the request host, so the
//! authentication filter builds those responses directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application error type
///
/// Covers all error cases the archive service may encounter on the request
/// path and at ingest.
#[derive(Debug, Error)]
pub enum AppError {
    /// No such resource, or the consumer holds no dispatch for it. The two
    /// cases are indistinguishable on the wire so existence never leaks
    /// across consumers.
    #[error("not found")]
    NotFound,
    /// Content negotiation failed for an otherwise retrievable resource
    #[error("not acceptable")]
    NotAcceptable,
    /// The token was valid but names a consumer that does not exist
    #[error("forbidden")]
    Forbidden,
    /// The raw message could not be parsed at ingest
    #[error("malformed message: {0}")]
    MalformedMessage(String),
    /// Store failure (connection, constraint, transaction)
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    /// Resource serialization failure
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Invalid or missing configuration
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Internal error (unexpected failure, external crate error)
    #[error("internal error: {0}")]
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound => (StatusCode::NOT_FOUND, "Not Found").into_response(),
            Self::NotAcceptable => (StatusCode::NOT_ACCEPTABLE, "Not Acceptable").into_response(),
            Self::Forbidden => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
            error => {
                tracing::error!(%error, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
            }
        }
    }
}

/// Type alias for fallible return values
///
/// Use this for all internal functions that can fail. Provides a consistent
/// error type throughout the codebase.
pub type AppResult<T> = Result<T, AppError>;
