//! # Environment Configuration
//!
//! Purpose: Turn `REDIS_*` environment variables into a [`PoolConfig`] on
//! every `init` call, and expose the downstream knobs that live next to them.
//!
//! ## Transport Selection
//! TCP is used only when both `REDIS_HOST` and `REDIS_PORT` are present.
//! Anything else selects the Unix socket at `REDIS_UNIX_SOCKET_PATH`.
//!
//! ## Usage Notes
//! - Missing variables fall back to defaults and may log a warning; only
//!   values that fail to parse are errors.
//! - `ConfigSource::Fixed` reads from a captured list instead of the process
//!   environment, so tests can run side by side without `set_var`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use kvlink_client::{ClientConfig, Endpoint};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Prefix shared by every variable this crate reads.
pub const ENV_PREFIX: &str = "REDIS_";

/// Host used when `REDIS_HOST` is present but empty.
pub const DEFAULT_HOST: &str = "localhost";

/// Port used when `REDIS_PORT` is present but empty.
pub const DEFAULT_PORT: u16 = 6379;

/// Connection cap when `REDIS_MAX_CONNECTIONS` is unset.
pub const DEFAULT_MAX_CONNECTIONS: usize = 50;

/// Batch size when `REDIS_POP_COUNT` is unset.
pub const DEFAULT_POP_COUNT: usize = 100;

/// Key TTL in seconds when `REDIS_KEY_EXPIRE` is unset.
pub const DEFAULT_KEY_EXPIRE_SECS: u64 = 60;

#[derive(Debug, Deserialize)]
struct PoolEnv {
    host: Option<String>,
    port: Option<String>,
    unix_socket_path: Option<PathBuf>,
    #[serde(default)]
    pass: String,
    db: Option<String>,
    #[serde(default = "default_max_connections")]
    max_connections: usize,
}

#[derive(Debug, Deserialize)]
struct SettingsEnv {
    #[serde(default = "default_pop_count")]
    pop_count: usize,
    #[serde(default = "default_key_expire")]
    key_expire: u64,
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

fn default_pop_count() -> usize {
    DEFAULT_POP_COUNT
}

fn default_key_expire() -> u64 {
    DEFAULT_KEY_EXPIRE_SECS
}

/// Everything needed to open one pool for one database index.
#[derive(Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// TCP address or Unix socket path.
    pub endpoint: Endpoint,
    /// AUTH credential; empty disables AUTH.
    pub password: String,
    /// Upper bound on open connections in the pool.
    pub max_connections: usize,
    /// Database index selected on every connection.
    pub db: u32,
    /// Decode string replies as UTF-8. Always enabled by the registry.
    pub decode_responses: bool,
}

impl PoolConfig {
    /// Builds the config for `db` from the process environment.
    pub fn from_env(db: u32) -> Result<Self, ConfigError> {
        ConfigSource::Process.pool_config(db)
    }

    /// Maps the pool settings onto a client configuration.
    pub fn client_config(&self) -> ClientConfig {
        ClientConfig {
            endpoint: self.endpoint.clone(),
            password: self.password.clone(),
            db: self.db,
            max_idle: self.max_connections,
            max_total: self.max_connections,
            decode_responses: self.decode_responses,
            ..ClientConfig::default()
        }
    }
}

// Hand-written so the password never reaches a log line.
impl fmt::Debug for PoolConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolConfig")
            .field("endpoint", &self.endpoint)
            .field("password", &if self.password.is_empty() { "" } else { "***" })
            .field("max_connections", &self.max_connections)
            .field("db", &self.db)
            .field("decode_responses", &self.decode_responses)
            .finish()
    }
}

/// Knobs for downstream cache consumers. The registry never reads them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheSettings {
    /// How many items a consumer pops per batch (`REDIS_POP_COUNT`).
    pub pop_count: usize,
    /// Default key lifetime (`REDIS_KEY_EXPIRE`, seconds).
    pub key_expire: Duration,
}

impl CacheSettings {
    /// Reads the settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        ConfigSource::Process.cache_settings()
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            pop_count: DEFAULT_POP_COUNT,
            key_expire: Duration::from_secs(DEFAULT_KEY_EXPIRE_SECS),
        }
    }
}

/// Where configuration variables come from.
#[derive(Debug, Clone, Default)]
pub enum ConfigSource {
    /// The live process environment, read on every call.
    #[default]
    Process,
    /// A fixed set of `(name, value)` pairs.
    Fixed(Vec<(String, String)>),
}

impl ConfigSource {
    /// Captures a fixed set of variables.
    pub fn fixed<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        ConfigSource::Fixed(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }

    /// Builds the pool configuration for `db`.
    pub fn pool_config(&self, db: u32) -> Result<PoolConfig, ConfigError> {
        let env: PoolEnv = self.load()?;

        // Advisory only: the requested index always wins.
        match env.db.as_deref().map(str::parse::<u32>) {
            None => warn!(db, "REDIS_DB is not set in the environment, using the requested index"),
            Some(Err(_)) => warn!(db, "REDIS_DB is not a database index, using the requested index"),
            Some(Ok(_)) => {}
        }

        let endpoint = match (env.host, env.port) {
            (Some(host), Some(port)) => Endpoint::Tcp {
                host: if host.is_empty() { DEFAULT_HOST.to_string() } else { host },
                port: parse_port(&port)?,
            },
            _ => {
                let path = env.unix_socket_path.unwrap_or_default();
                if path.as_os_str().is_empty() {
                    warn!(db, "REDIS_HOST/REDIS_PORT not both set and REDIS_UNIX_SOCKET_PATH is empty");
                }
                Endpoint::Unix(path)
            }
        };

        Ok(PoolConfig {
            endpoint,
            password: env.pass,
            max_connections: env.max_connections,
            db,
            decode_responses: true,
        })
    }

    /// Reads the downstream cache knobs.
    pub fn cache_settings(&self) -> Result<CacheSettings, ConfigError> {
        let env: SettingsEnv = self.load()?;
        Ok(CacheSettings {
            pop_count: env.pop_count,
            key_expire: Duration::from_secs(env.key_expire),
        })
    }

    fn load<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        let parsed: Result<T, envy::Error> = match self {
            ConfigSource::Process => envy::prefixed(ENV_PREFIX).from_env(),
            ConfigSource::Fixed(vars) => envy::prefixed(ENV_PREFIX).from_iter(vars.clone()),
        };
        Ok(parsed?)
    }
}

fn parse_port(raw: &str) -> Result<u16, ConfigError> {
    if raw.is_empty() {
        return Ok(DEFAULT_PORT);
    }
    raw.parse().map_err(|_| ConfigError::InvalidPort(raw.to_string()))
}
