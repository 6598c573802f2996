//! mail-archive-rs: process entry point
//!
//! Loads `.env` and tracing configuration, applies migrations, and runs the
//! selected subcommand: `serve` (the HTTP delivery service, the default),
//! `ingest` (archive one message file and schedule it for every consumer),
//! or `consumer` (register a feed subscriber).

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::EnvFilter;

use mail_archive_rs::config::ServerConfig;
use mail_archive_rs::loader::{self, TypeSniffer};
use mail_archive_rs::server::{self, AppState};
use mail_archive_rs::store::Store;

#[derive(Debug, Parser)]
#[command(name = "mail-archive", about = "Mail archive delivery service", version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the HTTP delivery service
    Serve,
    /// Archive one RFC 5322 message file and schedule it for every consumer
    Ingest {
        /// Path to the raw message file
        file: PathBuf,
    },
    /// Register a feed subscriber and print its id
    Consumer {
        /// Human-readable subscriber name
        name: String,
    },
}

/// Application entry point
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ServerConfig::load_from_env()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.pool_size)
        .connect(&config.database_url)
        .await?;
    sqlx::migrate!().run(&pool).await?;
    let store = Store::new(pool, config.redeliver_after);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config, store).await,
        Command::Ingest { file } => ingest(&store, &file).await,
        Command::Consumer { name } => {
            let consumer = store.create_consumer(&name).await?;
            println!("{}", consumer.id);
            Ok(())
        }
    }
}

/// Serve the HTTP API until interrupted
async fn serve(config: ServerConfig, store: Store) -> Result<(), Box<dyn std::error::Error>> {
    let listen = config.listen.clone();
    let state = AppState::new(config, store);
    let router = server::build_router(state);

    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "archive service listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        tracing::error!(%error, "failed to install shutdown handler");
    }
}

/// Archive a message file: the minimal producer
///
/// Inserts the mail and creates a dispatch per registered consumer; the
/// schema trigger notifies each consumer's channel as the dispatches commit.
async fn ingest(store: &Store, file: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let origin = std::fs::read(file)?;
    let sniffer: &TypeSniffer = &loader::estimate_type;
    let record = loader::load_mail_record(&origin, sniffer)?;

    store.insert_mail(&record).await?;
    let consumers = store.consumers().await?;
    for consumer in &consumers {
        store.create_dispatch(consumer.id, &record.id).await?;
    }

    tracing::info!(
        id = %record.id,
        attachments = record.attachments.len(),
        consumers = consumers.len(),
        "message archived"
    );
    println!("{}", record.id);
    Ok(())
}
