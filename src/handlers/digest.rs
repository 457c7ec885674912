//! Digest handler.
//!
//! Request:  `{"messages": ["a", "b"]}`
//! Response: `{"count": 2, "digests": ["ca978112...", "3e23e816..."]}`
//!
//! Each digest is the lowercase hex SHA-256 of the message's UTF-8 bytes.
//! A request of any other shape is answered with
//! `{"error": "Malformed request."}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

use crate::error::HandlerError;
use crate::handler::HandlerResult;

/// Error value returned for requests that are valid JSON but the wrong shape.
pub const MALFORMED_REQUEST: &str = "Malformed request.";

#[derive(Debug, Deserialize)]
struct DigestRequest {
    messages: Vec<String>,
}

#[derive(Debug, Serialize)]
struct DigestResponse {
    count: usize,
    digests: Vec<String>,
}

/// Hash every message in the request.
///
/// Synchronous and CPU-bound: wrap with [`crate::handler::blocking`] when
/// handing it to a server.
pub fn digest(request: Value) -> HandlerResult {
    let request: DigestRequest = match serde_json::from_value(request) {
        Ok(req) => req,
        Err(_) => return Ok(json!({ "error": MALFORMED_REQUEST })),
    };

    let digests: Vec<String> = request
        .messages
        .iter()
        .map(|m| format!("{:x}", Sha256::digest(m.as_bytes())))
        .collect();

    let response = DigestResponse {
        count: digests.len(),
        digests,
    };

    serde_json::to_value(response).map_err(|e| HandlerError::new(e.to_string()))
}
