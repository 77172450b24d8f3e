//! # KVLink Pool Registry
//!
//! Purpose: Process-wide management of Redis-compatible connection pools,
//! one per logical database index, created on first use, reused afterwards
//! and closed together.
//!
//! ## Design Principles
//! 1. **Explicit Registry**: No hidden global. Build a [`Registry`] or
//!    [`AsyncRegistry`] once and pass clones around.
//! 2. **Block Until Available**: `init` retries connection failures forever by
//!    default, so services can start before their cache does. A
//!    cancellation token bounds the wait when needed.
//! 3. **Log, Don't Throw**: Init failures are logged and recorded unless the
//!    caller opts into [`InitPolicy::Propagate`]. Close failures always
//!    propagate.
//! 4. **One State Machine, Two Schedulers**: Blocking and tokio registries
//!    share [`lifecycle`] and [`config`]; only the waiting differs.
//!
//! ## Example
//!
//! ```rust,no_run
//! use kvlink_registry::{Registry, RespConnector};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let registry = Registry::new(RespConnector::default());
//! let lifespan = registry.scoped_lifespan()?;
//! let redis = lifespan.get(0)?;
//! redis.set(b"name", b"ali")?;
//! lifespan.finish()?;
//! # Ok(())
//! # }
//! ```

mod blocking;
pub mod config;
mod error;
pub mod lifecycle;
mod non_blocking;
pub mod transport;

pub use blocking::{Lifespan, Registry};
pub use config::{CacheSettings, ConfigSource, PoolConfig};
pub use error::{CloseFailure, ConfigError, RegistryError, RegistryResult};
pub use lifecycle::{CloseOutcome, InitPolicy, ProbeBudget, ProbeOutcome, RegistryOptions, DEFAULT_DB};
pub use non_blocking::{AsyncLifespan, AsyncRegistry};
pub use transport::{
    AsyncConnector, AsyncPoolHandle, AsyncRespConnector, Connector, PoolHandle, RespConnector, RespTimeouts,
};

pub use tokio_util::sync::CancellationToken;
