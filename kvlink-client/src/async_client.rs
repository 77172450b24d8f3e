//! # Async Client API
//!
//! Purpose: Non-blocking facade over [`AsyncConnectionPool`] with the same
//! command surface and reply semantics as [`crate::KVClient`].

use std::fmt;
use std::time::Duration;

use crate::async_pool::AsyncConnectionPool;
use crate::client::{
    bulk_reply, decode_string, integer_reply, ok_reply, ping_reply, ttl_reply, ClientConfig, ClientTtl,
    Endpoint,
};
use crate::error::ClientResult;

/// Tokio client with connection pooling.
pub struct AsyncKVClient {
    pool: AsyncConnectionPool,
    decode_responses: bool,
}

impl AsyncKVClient {
    /// Creates a client with a custom configuration.
    ///
    /// No connection is opened until the first command.
    pub fn with_config(config: ClientConfig) -> ClientResult<Self> {
        let decode_responses = config.decode_responses;
        let pool = AsyncConnectionPool::new(config)?;
        Ok(AsyncKVClient {
            pool,
            decode_responses,
        })
    }

    /// Endpoint this client talks to.
    pub fn endpoint(&self) -> &Endpoint {
        self.pool.endpoint()
    }

    /// Fetches a value by key.
    pub async fn get(&self, key: &[u8]) -> ClientResult<Option<Vec<u8>>> {
        let mut conn = self.pool.acquire().await?;
        bulk_reply(conn.exec(&[b"GET", key]).await?)
    }

    /// Fetches a value by key and decodes it as a string.
    pub async fn get_string(&self, key: &[u8]) -> ClientResult<Option<String>> {
        decode_string(self.get(key).await?, self.decode_responses)
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &[u8], value: &[u8]) -> ClientResult<()> {
        let mut conn = self.pool.acquire().await?;
        ok_reply(conn.exec(&[b"SET", key, value]).await?)
    }

    /// Sets a value and attaches an expiration in seconds.
    pub async fn set_with_ttl(&self, key: &[u8], value: &[u8], ttl: Duration) -> ClientResult<()> {
        let seconds = ttl.as_secs().to_string();
        let mut conn = self.pool.acquire().await?;
        ok_reply(conn.exec(&[b"SET", key, value, b"EX", seconds.as_bytes()]).await?)
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn delete(&self, key: &[u8]) -> ClientResult<bool> {
        let mut conn = self.pool.acquire().await?;
        Ok(integer_reply(conn.exec(&[b"DEL", key]).await?)? > 0)
    }

    /// Sets a time-to-live on a key. Returns true when the TTL was set.
    pub async fn expire(&self, key: &[u8], ttl: Duration) -> ClientResult<bool> {
        let seconds = ttl.as_secs().to_string();
        let mut conn = self.pool.acquire().await?;
        Ok(integer_reply(conn.exec(&[b"EXPIRE", key, seconds.as_bytes()]).await?)? == 1)
    }

    /// Returns TTL status for a key.
    pub async fn ttl(&self, key: &[u8]) -> ClientResult<ClientTtl> {
        let mut conn = self.pool.acquire().await?;
        ttl_reply(conn.exec(&[b"TTL", key]).await?)
    }

    /// Pings the server. Returns the raw reply payload.
    pub async fn ping(&self, payload: Option<&[u8]>) -> ClientResult<Vec<u8>> {
        let mut conn = self.pool.acquire().await?;
        let response = match payload {
            Some(data) => conn.exec(&[b"PING", data]).await?,
            None => conn.exec(&[b"PING"]).await?,
        };
        ping_reply(response)
    }

    /// Closes the pool.
    pub async fn close(&self) -> ClientResult<()> {
        self.pool.close().await
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}

impl fmt::Debug for AsyncKVClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncKVClient")
            .field("endpoint", self.endpoint())
            .field("closed", &self.is_closed())
            .finish()
    }
}
