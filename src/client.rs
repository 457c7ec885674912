//! Request/response client.
//!
//! A [`Client`] is just a target address and a timeout. Every call opens
//! its own [`Connection`], so one client can be shared freely between
//! tasks.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::connection::Connection;
use crate::error::Result;

/// Client for a fixed server address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    host: String,
    timeout: Duration,
}

impl Client {
    /// Create a client for `host` (`host:port`). Performs no I/O.
    pub fn new(host: impl Into<String>, timeout: Duration) -> Self {
        Self {
            host: host.into(),
            timeout,
        }
    }

    /// Target address.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Dial and exchange timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Open a connection for explicit, possibly repeated, exchanges.
    pub async fn connect(&self) -> Result<Connection> {
        Connection::open(&self.host, self.timeout).await
    }

    /// Send one message on a fresh connection and return the response.
    ///
    /// The connection is closed whether the exchange succeeds or not.
    pub async fn send<T>(&self, message: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        self.send_as(message).await
    }

    /// Like [`send`](Self::send), decoding the response into `R`.
    pub async fn send_as<T, R>(&self, message: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let mut conn = self.connect().await?;
        let result = conn.exchange_as(message).await;
        conn.close().await;
        result
    }
}
