//! Configuration module for the archive delivery service
//!
//! All configuration is loaded from environment variables following the
//! pattern `MAIL_ARCHIVE_<KEY>`. The database URL falls back to the
//! conventional `DATABASE_URL` so the service and the sqlx tooling can share
//! one setting.

use std::env;
use std::env::VarError;
use std::time::Duration;

use secrecy::SecretString;

use crate::errors::{AppError, AppResult};

/// Server-wide configuration
///
/// Shared across handlers and the delivery engine via `Arc` inside the
/// application state. The JWT secret is stored in a type that prevents
/// accidental logging.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Socket address the HTTP listener binds to
    pub listen: String,
    /// Shared HS256 secret used to verify bearer tokens
    pub secret: SecretString,
    /// Maximum connections in the store pool
    pub pool_size: u32,
    /// Upper bound on a single notification wait in the streaming feed
    pub notify_wait: Duration,
    /// How far `next_time` advances after a successful delivery
    pub redeliver_after: Duration,
}

impl ServerConfig {
    /// Load all configuration from environment variables
    ///
    /// # Errors
    ///
    /// Returns `Config` if a required variable is missing or a set variable
    /// is malformed.
    ///
    /// # Example Environment
    ///
    /// ```text
    /// MAIL_ARCHIVE_DATABASE_URL=postgres://localhost/mail_archive
    /// MAIL_ARCHIVE_LISTEN=127.0.0.1:8080
    /// MAIL_ARCHIVE_SECRET=shared-hs256-secret
    /// ```
    pub fn load_from_env() -> AppResult<Self> {
        let database_url = match env::var("MAIL_ARCHIVE_DATABASE_URL") {
            Ok(v) if !v.trim().is_empty() => v,
            _ => required_env("DATABASE_URL")?,
        };

        Ok(Self {
            database_url,
            listen: optional_env("MAIL_ARCHIVE_LISTEN")?
                .unwrap_or_else(|| "127.0.0.1:8080".to_owned()),
            secret: SecretString::new(required_env("MAIL_ARCHIVE_SECRET")?.into()),
            pool_size: parse_u32_env("MAIL_ARCHIVE_POOL_SIZE", 10)?,
            notify_wait: Duration::from_secs(parse_u64_env("MAIL_ARCHIVE_NOTIFY_WAIT_SECS", 60)?),
            redeliver_after: Duration::from_secs(parse_u64_env(
                "MAIL_ARCHIVE_REDELIVER_SECS",
                3_600,
            )?),
        })
    }
}

/// Read a required environment variable, returning error if missing or empty
fn required_env(key: &str) -> AppResult<String> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(AppError::Config(format!(
            "missing required environment variable {key}"
        ))),
    }
}

/// Read an optional environment variable, treating empty as unset
fn optional_env(key: &str) -> AppResult<Option<String>> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => Ok(Some(v)),
        Ok(_) | Err(VarError::NotPresent) => Ok(None),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u32` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u32`.
fn parse_u32_env(key: &str, default: u32) -> AppResult<u32> {
    match env::var(key) {
        Ok(v) => v.parse::<u32>().map_err(|_| {
            AppError::Config(format!("invalid u32 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

/// Parse a `u64` environment variable with default fallback
///
/// Returns `default` if unset.
///
/// # Errors
///
/// Returns `Config` if the variable is set but not a valid `u64`.
fn parse_u64_env(key: &str, default: u64) -> AppResult<u64> {
    match env::var(key) {
        Ok(v) => v.parse::<u64>().map_err(|_| {
            AppError::Config(format!("invalid u64 environment variable {key}: '{v}'"))
        }),
        Err(VarError::NotPresent) => Ok(default),
        Err(VarError::NotUnicode(_)) => Err(AppError::Config(format!(
            "environment variable {key} contains non-unicode data"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_u32_env, parse_u64_env};

    #[test]
    fn parse_env_helpers_fall_back_to_defaults_when_unset() {
        assert_eq!(
            parse_u32_env("MAIL_ARCHIVE_TEST_UNSET_U32", 7).expect("default"),
            7
        );
        assert_eq!(
            parse_u64_env("MAIL_ARCHIVE_TEST_UNSET_U64", 60).expect("default"),
            60
        );
    }

    #[test]
    fn parse_env_helpers_reject_garbage() {
        // Key is unique to this test; no other test reads it.
        unsafe { std::env::set_var("MAIL_ARCHIVE_TEST_BAD_U32", "ten") };
        assert!(parse_u32_env("MAIL_ARCHIVE_TEST_BAD_U32", 1).is_err());
        unsafe { std::env::remove_var("MAIL_ARCHIVE_TEST_BAD_U32") };
    }
}
