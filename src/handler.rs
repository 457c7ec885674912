//! The request handler contract.
//!
//! The server decodes each inbound frame into a [`serde_json::Value`] and
//! passes it verbatim to a [`Handler`]. The handler owns all structural
//! validation: malformed-but-parseable requests should produce an error
//! *value* (e.g. `{"error": "Malformed request."}`) so the peer always gets
//! an answer. Returning `Err` closes the connection without a response.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use crate::error::HandlerError;

/// Result type returned by handlers.
pub type HandlerResult = Result<Value, HandlerError>;

/// Turns a decoded request into a response value.
///
/// Implemented for any `Fn(Value) -> impl Future<Output = HandlerResult>`,
/// so async closures can be passed to the server directly.
pub trait Handler: Send + Sync + 'static {
    /// Handle one request.
    fn call(&self, request: Value) -> impl Future<Output = HandlerResult> + Send;
}

impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send,
{
    fn call(&self, request: Value) -> impl Future<Output = HandlerResult> + Send {
        self(request)
    }
}

/// Handler adapter that runs a synchronous function on the blocking pool.
///
/// Use this for CPU-bound or blocking handlers so they do not stall the
/// runtime, and so the per-connection timeout can still fire while they run.
pub struct Blocking<F> {
    func: Arc<F>,
}

/// Wrap a synchronous handler function. See [`Blocking`].
pub fn blocking<F>(func: F) -> Blocking<F>
where
    F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
{
    Blocking {
        func: Arc::new(func),
    }
}

impl<F> Handler for Blocking<F>
where
    F: Fn(Value) -> HandlerResult + Send + Sync + 'static,
{
    fn call(&self, request: Value) -> impl Future<Output = HandlerResult> + Send {
        let func = Arc::clone(&self.func);
        async move {
            tokio::task::spawn_blocking(move || func(request))
                .await
                .map_err(|e| HandlerError::new(format!("handler task failed: {e}")))?
        }
    }
}
