//! fjson: JSON request/response over raw TCP.
//!
//! A client sends one JSON document and receives one JSON document back.
//! Messages are delimited on the byte stream by a single `0x00` byte after
//! the JSON text, which valid JSON can never contain.
//!
//! # Components
//!
//! - [`codec`]: frame encoding and incremental frame scanning
//! - [`Connection`]: one socket, one exchange at a time, with a deadline
//! - [`Client`]: fixed target address, one-shot [`Client::send`] or
//!   explicit [`Client::connect`]
//! - [`Server`]: accept loop, per-connection timeout, graceful shutdown
//! - [`Handler`]: the application function invoked for each request
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use fjson::{handlers, Client, Server, ServerConfig};
//! use serde_json::json;
//!
//! # async fn run() -> fjson::Result<()> {
//! let config = ServerConfig::new("127.0.0.1:8080", Duration::from_secs(1));
//! let server = Server::bind(config, handlers::echo).await?;
//! let shutdown = server.shutdown_handle();
//! tokio::spawn(server.serve());
//!
//! let client = Client::new("127.0.0.1:8080", Duration::from_secs(1));
//! let response = client.send(&json!({"greetings": "hello"})).await?;
//! assert_eq!(response["greetings"], "hello");
//!
//! shutdown.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod handlers;
pub mod server;

pub use client::Client;
pub use connection::Connection;
pub use error::{Error, HandlerError, Result};
pub use handler::{blocking, Handler, HandlerResult};
pub use server::{
    ConnectionMetrics, ServeMode, Server, ServerConfig, ServerState, ShutdownHandle,
};
