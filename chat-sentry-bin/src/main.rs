//! chat-sentry service binary - the admission gate and admin surface for a
//! chat-automation dashboard.

#![deny(missing_docs)]

use chat_sentry::{Sentry, SentryConfig, start_janitor};
use conf::Conf;
use std::{net::SocketAddr, sync::Arc};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod serve;
use serve::start_http_task;

/// Top-level configuration for chat-sentry.
#[derive(Conf, Debug)]
pub struct Config {
    /// If true, just validate config and don't start
    #[conf(long)]
    dry_run: bool,
    /// Socket to listen for HTTP requests (gate checks and admin operations)
    #[conf(long, env, default_value = "0.0.0.0:8700")]
    http_listen_addr: SocketAddr,
    #[conf(flatten)]
    sentry: SentryConfig,
}

fn init_logging() {
    // Build a default tracing subscriber, writing to STDERR
    // Uses RUST_LOG env var for filtering, defaults to "info" if not set
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_file(true)
        .with_line_number(true)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // load dotenv file
    match dotenvy::dotenv() {
        Ok(path) => info!("Read dotenv file from: {}", path.display()),
        Err(dotenvy::Error::Io(io_error)) => {
            if matches!(io_error.kind(), std::io::ErrorKind::NotFound) {
                info!("Couldn't find a dotenv file");
            } else {
                panic!("Io error when reading dot env file: {io_error}")
            }
        }
        Err(err) => {
            panic!("Error reading dotenv file: {err}")
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let config = Config::parse();
    info!("Config = {config:#?}");

    // Policy validation happens here; a bad value is fatal before we listen
    let sentry = Arc::new(Sentry::new(config.sentry)?);

    if config.dry_run {
        return Ok(());
    }

    let token = CancellationToken::new();

    // Listen for ctrl-c
    let thread_token = token.clone();
    tokio::task::spawn(async move {
        tokio::signal::ctrl_c().await.unwrap();
        warn!("ctrl-c: Stop requested");
        thread_token.cancel();
    });

    let listener = TcpListener::bind(config.http_listen_addr).await?;
    info!("Listening for http on {}", config.http_listen_addr);

    // Start the background janitor and the HTTP service
    let janitor = start_janitor(sentry.clone(), token.clone());
    let _http_task = start_http_task(listener, sentry);

    // Block until shutdown is requested, then let the janitor wind down
    token.cancelled().await;
    janitor.await?;

    Ok(())
}
