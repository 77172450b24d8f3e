//! # Registry Errors
//!
//! Purpose: Classify what can go wrong while creating, probing and closing
//! pools. Connection-level failures never appear here during `init`; they are
//! retried. Everything listed is either returned under a strict policy or is
//! a close failure, which always propagates.

use std::fmt;

use kvlink_client::ClientError;
use thiserror::Error;

/// Result type for registry operations.
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Environment could not be turned into a pool configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A `REDIS_*` variable failed to parse (e.g. non-numeric connection cap).
    #[error("invalid environment: {0}")]
    Env(#[from] envy::Error),
    /// `REDIS_PORT` is set but is not a port number.
    #[error("invalid REDIS_PORT value {0:?}")]
    InvalidPort(String),
}

/// One pool that failed to close.
#[derive(Debug)]
pub struct CloseFailure {
    /// Database index the pool belonged to.
    pub db: u32,
    /// Error returned by the transport.
    pub error: ClientError,
}

impl fmt::Display for CloseFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "db {}: {}", self.db, self.error)
    }
}

/// Errors surfaced by the pool registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Configuration for `db` could not be built.
    #[error("invalid configuration for db {db}: {source}")]
    Config {
        db: u32,
        #[source]
        source: ConfigError,
    },
    /// A non-connection failure (auth, bad address, protocol) during init.
    #[error("failed to initialize pool for db {db}: {source}")]
    Init {
        db: u32,
        #[source]
        source: ClientError,
    },
    /// The retry loop for `db` was cancelled before a pool became ready.
    #[error("initialization of db {db} was cancelled")]
    Cancelled { db: u32 },
    /// `db` was initialized, but the attempt failed and left no usable pool.
    #[error("no usable pool for db {db}; initialization failed earlier")]
    Unavailable { db: u32 },
    /// The reconnect probe hit a non-connection failure.
    #[error("reconnect probe on db {db} failed: {source}")]
    Probe {
        db: u32,
        #[source]
        source: ClientError,
    },
    /// One or more pools failed to close. Every pool was still attempted.
    #[error("failed to close {} pool(s): {}", .failures.len(), join_failures(.failures))]
    Close { failures: Vec<CloseFailure> },
}

fn join_failures(failures: &[CloseFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
