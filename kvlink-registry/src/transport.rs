//! # Transport Seam
//!
//! Purpose: The registry only needs to open a pool, ping it and close it.
//! These traits are that contract, in a blocking and a non-blocking shape, so
//! the lifecycle logic can run against the RESP client or a test double.

use std::time::Duration;

use async_trait::async_trait;
use kvlink_client::{AsyncKVClient, ClientConfig, ClientResult, KVClient};

use crate::config::PoolConfig;

/// Opens blocking pools.
pub trait Connector: Send + Sync + 'static {
    /// Pool object stored in the registry.
    type Handle: PoolHandle;

    /// Creates a pool for `config`. May or may not connect eagerly.
    fn open(&self, config: &PoolConfig) -> ClientResult<Self::Handle>;
}

/// A blocking pool as seen by the registry.
pub trait PoolHandle: Send + Sync + 'static {
    /// Round-trips a liveness check to the server.
    fn ping(&self) -> ClientResult<()>;

    /// Releases the pool's connections.
    fn close(&self) -> ClientResult<()>;

    /// Identity used in log lines.
    fn describe(&self) -> String;
}

/// Opens non-blocking pools.
#[async_trait]
pub trait AsyncConnector: Send + Sync + 'static {
    /// Pool object stored in the registry.
    type Handle: AsyncPoolHandle;

    /// Creates a pool for `config`.
    async fn open(&self, config: &PoolConfig) -> ClientResult<Self::Handle>;
}

/// A non-blocking pool as seen by the registry.
#[async_trait]
pub trait AsyncPoolHandle: Send + Sync + 'static {
    /// Round-trips a liveness check to the server.
    async fn ping(&self) -> ClientResult<()>;

    /// Releases the pool's connections.
    async fn close(&self) -> ClientResult<()>;

    /// Identity used in log lines.
    fn describe(&self) -> String;
}

/// Connect limit used by [`RespTimeouts::default`].
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Read/write limit used by [`RespTimeouts::default`].
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(5);

/// Timeouts applied to every connection the RESP connectors open.
///
/// The defaults are bounded so an init attempt against a server that accepts
/// but never answers ends in a retryable I/O error instead of hanging.
#[derive(Debug, Clone, Copy)]
pub struct RespTimeouts {
    /// Limit on establishing a connection. `None` waits indefinitely.
    pub connect: Option<Duration>,
    /// Limit on each read and write. `None` waits indefinitely.
    pub io: Option<Duration>,
}

impl Default for RespTimeouts {
    fn default() -> Self {
        RespTimeouts {
            connect: Some(DEFAULT_CONNECT_TIMEOUT),
            io: Some(DEFAULT_IO_TIMEOUT),
        }
    }
}

impl RespTimeouts {
    fn apply(&self, mut config: ClientConfig) -> ClientConfig {
        config.connect_timeout = self.connect;
        config.read_timeout = self.io;
        config.write_timeout = self.io;
        config
    }
}

/// Opens [`KVClient`] pools.
#[derive(Debug, Clone, Default)]
pub struct RespConnector {
    pub timeouts: RespTimeouts,
}

impl Connector for RespConnector {
    type Handle = KVClient;

    fn open(&self, config: &PoolConfig) -> ClientResult<KVClient> {
        KVClient::with_config(self.timeouts.apply(config.client_config()))
    }
}

impl PoolHandle for KVClient {
    fn ping(&self) -> ClientResult<()> {
        KVClient::ping(self, None).map(|_| ())
    }

    fn close(&self) -> ClientResult<()> {
        KVClient::close(self)
    }

    fn describe(&self) -> String {
        self.endpoint().to_string()
    }
}

/// Opens [`AsyncKVClient`] pools.
#[derive(Debug, Clone, Default)]
pub struct AsyncRespConnector {
    pub timeouts: RespTimeouts,
}

#[async_trait]
impl AsyncConnector for AsyncRespConnector {
    type Handle = AsyncKVClient;

    async fn open(&self, config: &PoolConfig) -> ClientResult<AsyncKVClient> {
        AsyncKVClient::with_config(self.timeouts.apply(config.client_config()))
    }
}

#[async_trait]
impl AsyncPoolHandle for AsyncKVClient {
    async fn ping(&self) -> ClientResult<()> {
        AsyncKVClient::ping(self, None).await.map(|_| ())
    }

    async fn close(&self) -> ClientResult<()> {
        AsyncKVClient::close(self).await
    }

    fn describe(&self) -> String {
        self.endpoint().to_string()
    }
}
