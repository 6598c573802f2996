//! Multi-tenant mail archive delivery service
//!
//! Stores RFC 5322 messages with their MIME attachments in PostgreSQL and
//! serves each registered consumer an at-least-once, re-deliverable feed
//! over HTTP. Every consumer holds one dispatch row per mail; a dispatch is
//! both the delivery schedule and the sole authorization to read that mail.
//!
//! # Architecture
//!
//! - [`config`]: environment-driven configuration
//! - [`errors`]: application error model with HTTP response mapping
//! - [`store`]: schema records, projections, and all SQL
//! - [`scrub`]: MIME part walker feeding ingestion
//! - [`loader`]: ingest and materialize contracts over raw messages
//! - [`resource`]: wire resources with alias names and self links
//! - [`accept`]: Accept-header content negotiation
//! - [`auth`]: bearer-JWT authentication filter
//! - [`server`]: router, state, and retrieval handlers
//! - [`deliver`]: the batch + streaming delivery engine

pub mod accept;
pub mod auth;
pub mod config;
pub mod deliver;
pub mod errors;
pub mod loader;
pub mod resource;
pub mod scrub;
pub mod server;
pub mod store;
