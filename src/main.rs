//! fjson: NUL-framed JSON request/response over TCP
//!
//! Subcommands:
//! - `serve`: run a server with one of the built-in handlers
//! - `send`: send a JSON document and print the response
//!
//! Configuration via CLI arguments or TOML file.

mod config;

use std::error::Error as StdError;
use std::time::Instant;

use config::{Command, Config, HandlerKind, SendSettings, ServeSettings};
use fjson::{blocking, handlers, Client, Handler, Server, ServerConfig};
use serde_json::Value;
use tokio::signal;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

type BoxError = Box<dyn StdError + Send + Sync>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match config.command {
        Command::Serve(settings) => serve(settings).await,
        Command::Send(settings) => send(settings).await,
    }
}

async fn serve(settings: ServeSettings) -> Result<(), BoxError> {
    info!(
        listen = %settings.server.listen,
        timeout_ms = settings.server.timeout.as_millis() as u64,
        mode = ?settings.server.mode,
        handler = ?settings.handler,
        "Starting fjson server"
    );

    match settings.handler {
        HandlerKind::Echo => run_server(settings.server, handlers::echo).await,
        HandlerKind::Digest => run_server(settings.server, blocking(handlers::digest)).await,
    }
}

async fn run_server<H: Handler>(config: ServerConfig, handler: H) -> Result<(), BoxError> {
    let server = Server::bind(config, handler).await?;
    let shutdown = server.shutdown_handle();

    let mut serving = tokio::spawn(server.serve());

    tokio::select! {
        result = &mut serving => result??,
        _ = shutdown_signal() => {
            info!("Shutdown signal received, draining connections");
            shutdown.shutdown().await;
            serving.await??;

            let metrics = shutdown.metrics();
            info!(
                accepted = metrics.accepted(),
                completed = metrics.completed(),
                failed = metrics.failed(),
                timed_out = metrics.timed_out(),
                "Connection totals"
            );
        }
    }

    Ok(())
}

async fn send(settings: SendSettings) -> Result<(), BoxError> {
    let message: Value = serde_json::from_str(&settings.message)?;
    let client = Client::new(settings.host, settings.timeout);

    let response = if settings.count <= 1 {
        client.send(&message).await?
    } else {
        // Repeated exchanges share one connection
        let mut conn = client.connect().await?;
        let start = Instant::now();
        let mut last = Value::Null;
        for _ in 0..settings.count {
            last = conn.exchange(&message).await?;
        }
        conn.close().await;
        debug!(
            count = settings.count,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Exchanges complete"
        );
        last
    };

    println!("{}", serde_json::to_string_pretty(&response)?);
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
