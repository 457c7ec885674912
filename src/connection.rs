//! Client-side connection.
//!
//! A [`Connection`] wraps one TCP socket and performs exchanges: write one
//! request frame, read one response frame. Each exchange is bounded by a
//! single deadline covering both legs. A connection that times out or hits
//! a transport error is closed on the spot; later exchanges fail with
//! [`Error::Closed`].

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::codec::{self, FrameBuffer};
use crate::error::{Error, Result};

/// One TCP connection to a server.
///
/// Exchanges take `&mut self`, so a connection is used by one task at a
/// time. Sequential exchanges on the same connection only work against a
/// server running in keep-alive mode.
#[derive(Debug)]
pub struct Connection {
    stream: Option<TcpStream>,
    frames: FrameBuffer,
    peer_addr: SocketAddr,
    timeout: Duration,
}

impl Connection {
    /// Connect to `host` (`host:port`), giving up after `timeout`.
    ///
    /// `timeout` also becomes the default deadline for [`exchange`](Self::exchange).
    pub async fn open(host: &str, timeout: Duration) -> Result<Self> {
        let dial_error = |source: io::Error| Error::Dial {
            host: host.to_string(),
            source,
        };

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(host)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(dial_error(e)),
            Err(_) => {
                return Err(dial_error(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no connection after {timeout:?}"),
                )))
            }
        };

        stream.set_nodelay(true).map_err(dial_error)?;
        let peer_addr = stream.peer_addr().map_err(dial_error)?;
        debug!(peer = %peer_addr, "Connection opened");

        Ok(Self {
            stream: Some(stream),
            frames: FrameBuffer::new(),
            peer_addr,
            timeout,
        })
    }

    /// Send `message` and wait for the response, using the connection's timeout.
    pub async fn exchange<T>(&mut self, message: &T) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        self.exchange_with_timeout(message, self.timeout).await
    }

    /// Send `message` and wait for the response within `timeout`.
    pub async fn exchange_with_timeout<T>(&mut self, message: &T, timeout: Duration) -> Result<Value>
    where
        T: Serialize + ?Sized,
    {
        let request = codec::encode(message)?;
        self.round_trip(&request, timeout).await
    }

    /// Send `message` and decode the response into `R`.
    pub async fn exchange_as<T, R>(&mut self, message: &T) -> Result<R>
    where
        T: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let request = codec::encode(message)?;
        self.round_trip(&request, self.timeout).await
    }

    async fn round_trip<R: DeserializeOwned>(&mut self, request: &[u8], timeout: Duration) -> Result<R> {
        let stream = self.stream.as_mut().ok_or(Error::Closed)?;
        let frames = &mut self.frames;

        let result = tokio::time::timeout(timeout, async {
            stream.write_all(request).await.map_err(Error::Write)?;
            frames.read_frame(stream).await
        })
        .await;

        match result {
            Ok(Ok(frame)) => {
                trace!(peer = %self.peer_addr, len = frame.len(), "Response frame received");
                codec::decode(&frame)
            }
            Ok(Err(e)) => {
                self.abandon(&e);
                Err(e)
            }
            Err(_) => {
                let e = Error::Timeout(timeout);
                self.abandon(&e);
                Err(e)
            }
        }
    }

    /// Drop the socket after a failed exchange.
    fn abandon(&mut self, reason: &Error) {
        if self.stream.take().is_some() {
            debug!(peer = %self.peer_addr, error = %reason, "Connection abandoned");
        }
        self.frames = FrameBuffer::new();
    }

    /// Shut the socket down. Safe to call more than once.
    pub async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                trace!(peer = %self.peer_addr, error = %e, "Shutdown failed");
            }
            debug!(peer = %self.peer_addr, "Connection closed");
        }
    }

    /// Check if the connection has been closed or abandoned.
    pub fn is_closed(&self) -> bool {
        self.stream.is_none()
    }

    /// Address of the server this connection talks to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Default exchange deadline.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::future::Future;
    use tokio::net::TcpListener;

    const TIMEOUT: Duration = Duration::from_secs(2);

    /// Accept one connection on an ephemeral port and hand it to `peer`.
    async fn spawn_peer<F, Fut>(peer: F) -> String
    where
        F: FnOnce(TcpStream) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            peer(stream).await;
        });
        addr.to_string()
    }

    /// Peer that echoes frames until the client hangs up.
    async fn echo_peer(mut stream: TcpStream) {
        let mut frames = FrameBuffer::new();
        while let Ok(frame) = frames.read_frame(&mut stream).await {
            let value: Value = codec::decode(&frame).unwrap();
            codec::write_frame(&mut stream, &value).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_exchange_round_trip() {
        let addr = spawn_peer(echo_peer).await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        let request = json!({"greetings": "hello", "now": 1700000000});
        let response = conn.exchange(&request).await.unwrap();
        assert_eq!(response, request);

        conn.close().await;
    }

    #[tokio::test]
    async fn test_sequential_exchanges() {
        let addr = spawn_peer(echo_peer).await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        for i in 0..5 {
            let response = conn.exchange(&json!({ "seq": i })).await.unwrap();
            assert_eq!(response["seq"], i);
        }
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_exchange_as_typed() {
        #[derive(Debug, Serialize, Deserialize, PartialEq)]
        struct Greeting {
            greetings: String,
            now: i64,
        }

        let addr = spawn_peer(echo_peer).await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        let request = Greeting {
            greetings: "hello".to_string(),
            now: 1700000000,
        };
        let response: Greeting = conn.exchange_as(&request).await.unwrap();
        assert_eq!(response, request);
    }

    #[tokio::test]
    async fn test_exchange_timeout() {
        let addr = spawn_peer(|stream| async move {
            // Hold the socket open without ever answering.
            tokio::time::sleep(Duration::from_secs(3)).await;
            drop(stream);
        })
        .await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        let timeout = Duration::from_millis(100);
        let start = std::time::Instant::now();
        let err = conn
            .exchange_with_timeout(&json!("ping"), timeout)
            .await
            .unwrap_err();

        assert!(err.is_timeout());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(conn.is_closed());
        assert!(matches!(conn.exchange(&json!("again")).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_truncated_response() {
        let addr = spawn_peer(|mut stream| async move {
            let mut frames = FrameBuffer::new();
            frames.read_frame(&mut stream).await.unwrap();
            stream.write_all(b"{\"partial\"").await.unwrap();
        })
        .await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        match conn.exchange(&json!({})).await {
            Err(Error::TruncatedFrame { buffered }) => assert_eq!(buffered, 10),
            other => panic!("unexpected: {:?}", other),
        }
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_closed_without_response() {
        let addr = spawn_peer(|mut stream| async move {
            let mut frames = FrameBuffer::new();
            frames.read_frame(&mut stream).await.unwrap();
        })
        .await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        assert!(matches!(conn.exchange(&json!([1, 2])).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_invalid_json_response() {
        let addr = spawn_peer(|mut stream| async move {
            let mut frames = FrameBuffer::new();
            frames.read_frame(&mut stream).await.unwrap();
            stream.write_all(b"not json\0").await.unwrap();
            tokio::time::sleep(Duration::from_millis(200)).await;
        })
        .await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        assert!(matches!(conn.exchange(&json!(1)).await, Err(Error::Unmarshal(_))));
        // The frame boundary was intact, so the socket is still usable.
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_marshal_error_keeps_connection() {
        let addr = spawn_peer(echo_peer).await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        let mut bad = BTreeMap::new();
        bad.insert(vec![1u8], 1u8);
        assert!(matches!(conn.exchange(&bad).await, Err(Error::Marshal(_))));

        assert_eq!(conn.exchange(&json!("ok")).await.unwrap(), json!("ok"));
    }

    #[tokio::test]
    async fn test_dial_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        match Connection::open(&addr, TIMEOUT).await {
            Err(Error::Dial { host, .. }) => assert_eq!(host, addr),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let addr = spawn_peer(echo_peer).await;
        let mut conn = Connection::open(&addr, TIMEOUT).await.unwrap();

        conn.close().await;
        conn.close().await;
        assert!(conn.is_closed());
        assert!(matches!(conn.exchange(&json!(1)).await, Err(Error::Closed)));
    }
}
