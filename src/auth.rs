//! Bearer-JWT authentication filter
//!
//! Runs on every matched route before its handler (unmatched routes return
//! 404 untouched). Verifies the bearer token with HS256 against the shared
//! secret, requires a `sub` claim of the form `consumer_id=<int>`, and binds
//! the resolved consumer to the request. Failures answer 401 with a
//! `WWW-Authenticate: bearer` challenge whose realm is the request host; an
//! `error` parameter is attached only once a bearer token was actually
//! presented.

use std::sync::LazyLock;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use jsonwebtoken::{Algorithm, Validation};
use regex::Regex;
use serde::Deserialize;

use crate::errors::AppError;
use crate::server::AppState;

static SUB_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^consumer_id=([0-9]+)$").expect("literal pattern"));

/// Claims required of an accepted token
#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Outcome of parsing an `Authorization` header value
#[derive(Debug, PartialEq, Eq)]
enum BearerParse<'a> {
    /// Absent, unreadable, or non-bearer scheme: challenge without an error
    /// code
    WrongScheme,
    /// Bearer scheme without a token
    MissingToken,
    Token(&'a str),
}

/// Authenticate the request and attach the resolved [`crate::store::Consumer`]
pub async fn authenticate(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let realm = request
        .headers()
        .get(header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_owned();

    let authorization = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());

    let token = match authorization.map(parse_bearer) {
        None | Some(BearerParse::WrongScheme) => return reject(&realm, None),
        Some(BearerParse::MissingToken) => return reject(&realm, Some("invalid_request")),
        Some(BearerParse::Token(token)) => token,
    };

    let data = match jsonwebtoken::decode::<Claims>(token, &state.decoding_key, &validation()) {
        Ok(data) => data,
        Err(_) => return reject(&realm, Some("invalid_token")),
    };

    let Some(captures) = SUB_PATTERN.captures(&data.claims.sub) else {
        return reject(&realm, Some("invalid_token"));
    };
    // An id too large for the column cannot name an existing consumer.
    let Ok(consumer_id) = captures[1].parse::<i32>() else {
        return (StatusCode::FORBIDDEN, "Forbidden").into_response();
    };

    match state.store.consumer(consumer_id).await {
        Ok(Some(consumer)) => {
            request.extensions_mut().insert(consumer);
            next.run(request).await
        }
        Ok(None) => (StatusCode::FORBIDDEN, "Forbidden").into_response(),
        Err(error) => AppError::from(error).into_response(),
    }
}

/// Token verification rules: HS256 only, `sub` required, no expiry claim
/// expected of archive tokens
fn validation() -> Validation {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_required_spec_claims(&["sub"]);
    validation.validate_exp = false;
    validation
}

fn parse_bearer(authorization: &str) -> BearerParse<'_> {
    let (scheme, token) = match authorization.trim().split_once(char::is_whitespace) {
        Some((scheme, token)) => (scheme, token.trim()),
        None => (authorization.trim(), ""),
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return BearerParse::WrongScheme;
    }
    if token.is_empty() {
        return BearerParse::MissingToken;
    }
    BearerParse::Token(token)
}

/// 401 with a `WWW-Authenticate: bearer` challenge
fn reject(realm: &str, error: Option<&str>) -> Response {
    let mut challenge = format!("bearer realm=\"{realm}\"");
    if let Some(code) = error {
        challenge.push_str(", error=\"");
        challenge.push_str(code);
        challenge.push('"');
    }
    (
        StatusCode::UNAUTHORIZED,
        [(header::WWW_AUTHENTICATE, challenge)],
        "Unauthorized",
    )
        .into_response()
}
