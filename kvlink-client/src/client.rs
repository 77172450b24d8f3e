//! # Blocking Client API
//!
//! Purpose: Expose a compact, blocking API for issuing Redis-compatible
//! commands over RESP2, backed by a bounded connection pool.
//!
//! ## Design Principles
//! 1. **Facade Pattern**: `KVClient` hides pooling and protocol details.
//! 2. **Borrow-Friendly API**: Accept `&[u8]` to avoid unnecessary copies.
//! 3. **Fail Fast**: Protocol violations surface immediately as errors.
//! 4. **Shared Reply Decoding**: Reply-to-type mapping lives here and is reused
//!    by the tokio facade so both flavours agree on semantics.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ClientError, ClientResult};
use crate::pool::ConnectionPool;
use crate::resp::RespValue;

/// Where the server listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// TCP host and port.
    Tcp { host: String, port: u16 },
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Endpoint {
    /// Short transport label used in log lines.
    pub fn transport(&self) -> &'static str {
        match self {
            Endpoint::Tcp { .. } => "TCP",
            Endpoint::Unix(_) => "UNIXSOCKET",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Endpoint::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Endpoint::Unix(path) => write!(f, "unix:{}", path.display()),
        }
    }
}

/// TTL state returned by the server, mirroring Redis semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientTtl {
    /// Key is missing or already expired.
    Missing,
    /// Key exists without expiration.
    NoExpiry,
    /// Key expires after the provided duration.
    ExpiresIn(Duration),
}

/// Configuration shared by both client flavours and their pools.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server endpoint.
    pub endpoint: Endpoint,
    /// Password sent with AUTH on every new connection; empty disables AUTH.
    pub password: String,
    /// Logical database selected on every new connection.
    pub db: u32,
    /// Maximum idle connections kept in the pool.
    pub max_idle: usize,
    /// Maximum total connections (idle + in-use).
    pub max_total: usize,
    /// Optional read timeout.
    pub read_timeout: Option<Duration>,
    /// Optional write timeout.
    pub write_timeout: Option<Duration>,
    /// Optional connect timeout.
    pub connect_timeout: Option<Duration>,
    /// Decode string replies strictly as UTF-8.
    pub decode_responses: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            endpoint: Endpoint::Tcp {
                host: "127.0.0.1".to_string(),
                port: 6379,
            },
            password: String::new(),
            db: 0,
            max_idle: 8,
            max_total: 16,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            decode_responses: true,
        }
    }
}

/// Blocking client with connection pooling.
///
/// Each call acquires a connection, executes one command, and returns the
/// connection to the pool.
pub struct KVClient {
    pool: ConnectionPool,
    decode_responses: bool,
}

impl KVClient {
    /// Creates a client for a TCP address with default configuration.
    pub fn connect(host: impl Into<String>, port: u16) -> ClientResult<Self> {
        let config = ClientConfig {
            endpoint: Endpoint::Tcp {
                host: host.into(),
                port,
            },
            ..ClientConfig::default()
        };
        Self::with_config(config)
    }

    /// Creates a client with a custom configuration.
    ///
    /// No connection is opened until the first command.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let decode_responses = config.decode_responses;
        let pool = ConnectionPool::new(config)?;
        Ok(KVClient {
            pool,
            decode_responses,
        })
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }

    /// Fetches a value by key.
    ///
    /// Returns `Ok(None)` when the key is missing.
    pub fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire()?;
        bulk_reply(conn.exec(&[b"GET", key])?)
    }

    /// Fetches a value by key and decodes it as a string.
    pub fn get_string(&self, key: &[u8]) -> ClientResult<Option<String>> {
        decode_string(self.get(key)?, self.decode_responses)
    }

    /// Sets a value for a key without expiration.
    pub fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let mut conn = self.pool.acquire()?;
        ok_reply(conn.exec(&[b"SET", key, value])?)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let seconds = ttl.as_secs().to_string();
        let mut conn = self.pool.acquire()?;
        ok_reply(conn.exec(&[b"SET", key, value, b"EX", seconds.as_bytes()])?)
    }

    /// Deletes a key. Returns true when a key was removed.
    pub fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire()?;
        Ok(integer_reply(conn.exec(&[b"DEL", key])?)? > 0)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let seconds = ttl.as_secs().to_string();
        let mut conn = self.pool.acquire()?;
        Ok(integer_reply(conn.exec(&[b"EXPIRE", key, seconds.as_bytes()])?)? == 1)
    }

    /// Returns TTL status for a key.
    pub fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        let mut conn = self.pool.acquire()?;
        ttl_reply(conn.exec(&[b"TTL", key])?)
    }

    /// Pings the server. Returns the raw reply payload.
    pub fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let mut conn = self.pool.acquire()?;
        let response = match payload {
            Some(data) => conn.exec(&[b"PING", data])?,
            None => conn.exec(&[b"PING"])?,
        };
        ping_reply(response)
    }

    /// Closes the pool. Idle connections are shut down immediately and
    /// checked-out connections are dropped when returned.
    pub fn close(&self) -> ClientResult<()> {
        self.pool.close()
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl fmt::Debug for KVClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KVClient")
            .field("endpoint", self.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}

pub(crate) fn ok_reply(response: RespValue) -> ClientResult<()> {
    match response {
        RespValue::Simple(_) => Ok(()),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub(crate) fn bulk_reply(response: RespValue) -> ClientResult<Option<Vec<u8>>> {
    match response {
        RespValue::Bulk(data) => Ok(data),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub(crate) fn integer_reply(response: RespValue) -> ClientResult<i64> {
    match response {
        RespValue::Integer(value) => Ok(value),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub(crate) fn ttl_reply(response: RespValue) -> ClientResult<ClientTtl> {
    match integer_reply(response)? {
        -2 => Ok(ClientTtl::Missing),
        -1 => Ok(ClientTtl::NoExpiry),
        value if value >= 0 => Ok(ClientTtl::ExpiresIn(Duration::from_secs(value as u64))),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub(crate) fn ping_reply(response: RespValue) -> ClientResult<Vec<u8>> {
    match response {
        RespValue::Simple(text) => Ok(text),
        RespValue::Bulk(Some(data)) => Ok(data),
        RespValue::Error(message) => Err(ClientError::Server { message }),
        _ => Err(ClientError::UnexpectedResponse),
    }
}

pub(crate) fn decode_string(data: Option<Vec<u8>>, strict: bool) -> ClientResult<Option<String>> {
    match data {
        None => Ok(None),
        Some(bytes) if strict => Ok(Some(String::from_utf8(bytes)?)),
        Some(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
    }
}
