//! Built-in handlers.
//!
//! - `echo`: returns every request unchanged. Useful for round-trip and
//!   throughput testing without any application logic.
//! - `digest`: hashes a list of messages, answering malformed requests with
//!   a structured error value instead of closing the connection.

pub mod digest;
pub mod echo;

pub use digest::digest;
pub use echo::echo;
