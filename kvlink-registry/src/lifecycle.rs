//! # Pool Lifecycle
//!
//! Purpose: The state machine and policies shared by the blocking and the
//! non-blocking registries. Only the waiting primitives differ between the
//! two; everything decided here is identical.
//!
//! ## States per database index
//!
//! ```text
//!            init                 ping ok
//! ABSENT ─────────────▶ INITIALIZING ─────────▶ READY
//!   ▲                        │  │                  │
//!   │   propagate / cancel   │  │ swallow          │
//!   ├────────────────────────┘  ▼                  │
//!   │                         BROKEN               │
//!   └──────────── close (whole registry) ──────────┘
//! ```
//!
//! INITIALIZING is a key present in the map whose slot holds no state yet.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use kvlink_client::ClientError;
use tracing::{error, info};

use crate::config::{ConfigSource, PoolConfig};
use crate::error::{CloseFailure, RegistryError, RegistryResult};

/// Database index used when the caller does not name one.
pub const DEFAULT_DB: u32 = 0;

/// Time units `init` waits between connection attempts.
pub const DEFAULT_RETRY_DELAY: u64 = 10;

/// Upper bound on the reconnect probe's budget; larger values reset to it.
pub const MAX_PROBE_BUDGET: u64 = 30;

/// Probe poll interval used when the requested one is out of range.
pub const DEFAULT_POLL_INTERVAL: u64 = 5;

/// What `init` does with a failure that retrying cannot fix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitPolicy {
    /// Log it, mark the index broken and report success.
    #[default]
    Swallow,
    /// Leave the index absent and return the error.
    Propagate,
}

/// Tuning shared by both registries.
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    /// Handling of non-connection init failures.
    pub init_policy: InitPolicy,
    /// Delay between connection attempts in `init`, in time units.
    pub retry_delay: u64,
    /// Length of one time unit. Retry and probe arguments are multiples of it.
    pub time_unit: Duration,
    /// Where `REDIS_*` variables are read from.
    pub source: ConfigSource,
}

impl Default for RegistryOptions {
    fn default() -> Self {
        RegistryOptions {
            init_policy: InitPolicy::default(),
            retry_delay: DEFAULT_RETRY_DELAY,
            time_unit: Duration::from_secs(1),
            source: ConfigSource::default(),
        }
    }
}

impl RegistryOptions {
    /// Sets how non-connection init failures are handled.
    pub fn with_init_policy(mut self, policy: InitPolicy) -> Self {
        self.init_policy = policy;
        self
    }

    /// Sets the delay between connection attempts, in time units.
    pub fn with_retry_delay(mut self, units: u64) -> Self {
        self.retry_delay = units;
        self
    }

    /// Sets the length of one time unit.
    pub fn with_time_unit(mut self, unit: Duration) -> Self {
        self.time_unit = unit;
        self
    }

    /// Sets where `REDIS_*` variables are read from.
    pub fn with_source(mut self, source: ConfigSource) -> Self {
        self.source = source;
        self
    }

    /// Converts a count of time units to wall-clock time.
    pub fn units(&self, count: u64) -> Duration {
        self.time_unit
            .saturating_mul(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

/// Clamped arguments of the reconnect probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeBudget {
    /// Total time units the probe may spend.
    pub timeout_budget: u64,
    /// Time units between pings.
    pub poll_interval: u64,
}

impl ProbeBudget {
    /// Applies the probe's argument rules.
    ///
    /// A budget above [`MAX_PROBE_BUDGET`] is reset to it. A poll interval of
    /// zero or one larger than the budget is reset to
    /// [`DEFAULT_POLL_INTERVAL`].
    pub fn clamp(timeout_budget: u64, poll_interval: u64) -> Self {
        let timeout_budget = if timeout_budget > MAX_PROBE_BUDGET {
            MAX_PROBE_BUDGET
        } else {
            timeout_budget
        };
        let poll_interval = if poll_interval == 0 || poll_interval > timeout_budget {
            DEFAULT_POLL_INTERVAL
        } else {
            poll_interval
        };
        ProbeBudget {
            timeout_budget,
            poll_interval,
        }
    }
}

impl Default for ProbeBudget {
    fn default() -> Self {
        ProbeBudget {
            timeout_budget: MAX_PROBE_BUDGET,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

/// Result of a reconnect probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    /// Nothing to probe: the registry holds no ready pool.
    NotInitialized,
    /// A ping succeeded within the budget.
    Connected,
    /// The budget ran out before a ping succeeded.
    TimedOut,
}

impl ProbeOutcome {
    /// True when a ping succeeded.
    pub fn is_connected(self) -> bool {
        self == ProbeOutcome::Connected
    }
}

/// Result of closing the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// The registry was already empty.
    NotInitialized,
    /// This many ready pools were closed.
    Closed(usize),
}

/// Settled state of one index.
pub(crate) enum SlotState<H> {
    Ready(Arc<H>),
    Broken,
}

/// What a finished `init` leaves behind: a state to store (or `None` to drop
/// the slot) and the result for the caller.
pub(crate) type Settled<H> = (Option<SlotState<H>>, RegistryResult<()>);

pub(crate) fn settle_ready<H>(db: u32, handle: H, describe: String, attempts: u64) -> Settled<H> {
    info!(db, pool = %describe, attempts, "connection pool ready");
    (Some(SlotState::Ready(Arc::new(handle))), Ok(()))
}

pub(crate) fn settle_failure<H>(policy: InitPolicy, err: RegistryError) -> Settled<H> {
    error!(error = %err, "redis initialization failed");
    match policy {
        InitPolicy::Swallow => (Some(SlotState::Broken), Ok(())),
        InitPolicy::Propagate => (None, Err(err)),
    }
}

pub(crate) fn settle_cancelled<H>(db: u32) -> Settled<H> {
    info!(db, "redis initialization cancelled");
    (None, Err(RegistryError::Cancelled { db }))
}

/// Loads the config for `db` and logs which transport it selected.
pub(crate) fn load_config(options: &RegistryOptions, db: u32, mode: &'static str) -> RegistryResult<PoolConfig> {
    let config = options
        .source
        .pool_config(db)
        .map_err(|source| RegistryError::Config { db, source })?;
    info!(
        db,
        mode,
        transport = config.endpoint.transport(),
        endpoint = %config.endpoint,
        max_connections = config.max_connections,
        "opening redis connection pool"
    );
    Ok(config)
}

pub(crate) fn log_retry(db: u32, attempt: u64, delay: Duration, err: &ClientError) {
    tracing::warn!(db, attempt, retry_in = ?delay, error = %err, "redis unavailable, retrying");
}

pub(crate) fn close_outcome(closed: usize, failures: Vec<CloseFailure>) -> RegistryResult<CloseOutcome> {
    if failures.is_empty() {
        Ok(CloseOutcome::Closed(closed))
    } else {
        Err(RegistryError::Close { failures })
    }
}

/// Database index → slot map. The lock is held only for lookups and edits,
/// never while a slot is being initialized.
pub(crate) struct SlotMap<S> {
    slots: Mutex<BTreeMap<u32, Arc<S>>>,
}

impl<S: Default> SlotMap<S> {
    pub(crate) fn new() -> Self {
        SlotMap {
            slots: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u32, Arc<S>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn get(&self, db: u32) -> Option<Arc<S>> {
        self.lock().get(&db).cloned()
    }

    pub(crate) fn get_or_insert(&self, db: u32) -> Arc<S> {
        self.lock().entry(db).or_default().clone()
    }

    /// True when `slot` is still the registered slot for `db`.
    pub(crate) fn is_current(&self, db: u32, slot: &Arc<S>) -> bool {
        self.lock().get(&db).map_or(false, |current| Arc::ptr_eq(current, slot))
    }

    pub(crate) fn remove_if_current(&self, db: u32, slot: &Arc<S>) {
        let mut slots = self.lock();
        if slots.get(&db).map_or(false, |current| Arc::ptr_eq(current, slot)) {
            slots.remove(&db);
        }
    }

    pub(crate) fn take_all(&self) -> BTreeMap<u32, Arc<S>> {
        std::mem::take(&mut *self.lock())
    }

    /// Slots in index order.
    pub(crate) fn snapshot(&self) -> Vec<(u32, Arc<S>)> {
        self.lock().iter().map(|(db, slot)| (*db, slot.clone())).collect()
    }

    pub(crate) fn indices(&self) -> Vec<u32> {
        self.lock().keys().copied().collect()
    }
}
