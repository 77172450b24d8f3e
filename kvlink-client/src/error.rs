//! # Client Errors
//!
//! Purpose: One error type shared by the blocking and tokio transports so
//! callers (and the pool registry) can classify failures the same way.

use thiserror::Error;

/// Result type for both client flavours.
pub type ClientResult<T> = Result<T, ClientError>;

/// Errors surfaced by the client and its pools.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network or IO failure while connecting, reading or writing.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// RESP2 framing or parse error.
    #[error("protocol error")]
    Protocol,
    /// Server returned an error reply.
    #[error("server error: {}", String::from_utf8_lossy(.message))]
    Server { message: Vec<u8> },
    /// Response type did not match the expected command response.
    #[error("unexpected response")]
    UnexpectedResponse,
    /// Pool is at capacity and no idle connections are available.
    #[error("connection pool exhausted")]
    PoolExhausted,
    /// Pool was closed; no further connections are handed out.
    #[error("connection pool closed")]
    PoolClosed,
    /// Endpoint could not be turned into a socket address or path.
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    /// Reply payload was not valid UTF-8 while response decoding is enabled.
    #[error("response is not valid utf-8")]
    Decode(#[from] std::string::FromUtf8Error),
}

impl ClientError {
    /// Returns true for transport-level failures that may clear up by
    /// reconnecting later (refused, reset, timed out, missing socket file).
    ///
    /// Server replies, protocol violations and local misconfiguration are not
    /// connection errors.
    pub fn is_connection(&self) -> bool {
        matches!(self, ClientError::Io(_))
    }
}
