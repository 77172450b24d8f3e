//! # Blocking Registry
//!
//! Purpose: Own one lazily created pool per database index for callers that
//! run on plain threads. Every wait (ping, retry delay, probe interval)
//! blocks the calling thread.
//!
//! ## Usage Notes
//! - Construct once at startup and clone it into whatever needs a pool; all
//!   clones share the same pools.
//! - Each index has its own initialization guard, so a slow or retrying
//!   `init(1)` does not hold up `get(0)`.
//! - Dropping the last clone closes any pool still registered.

use std::ops::Deref;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{CloseFailure, RegistryError, RegistryResult};
use crate::lifecycle::{
    close_outcome, load_config, log_retry, settle_cancelled, settle_failure, settle_ready, CloseOutcome,
    ProbeBudget, ProbeOutcome, RegistryOptions, Settled, SlotMap, SlotState, DEFAULT_DB,
};
use crate::transport::{Connector, PoolHandle};

const MODE: &str = "SYNC";

/// Longest single sleep while waiting, so cancellation is noticed promptly.
const CANCEL_POLL: Duration = Duration::from_millis(50);

struct Slot<H> {
    state: Mutex<Option<SlotState<H>>>,
}

impl<H> Default for Slot<H> {
    fn default() -> Self {
        Slot {
            state: Mutex::new(None),
        }
    }
}

impl<H> Slot<H> {
    fn lock(&self) -> MutexGuard<'_, Option<SlotState<H>>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_ready(&self) -> Option<Arc<H>> {
        let state = match self.state.try_lock() {
            Ok(state) => state,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return None,
        };
        match &*state {
            Some(SlotState::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }
}

struct Inner<C: Connector> {
    connector: C,
    options: RegistryOptions,
    slots: SlotMap<Slot<C::Handle>>,
}

impl<C: Connector> Drop for Inner<C> {
    fn drop(&mut self) {
        for (db, slot) in self.slots.take_all() {
            let state = slot.lock().take();
            if let Some(SlotState::Ready(handle)) = state {
                info!(db, pool = %handle.describe(), "closing redis on shutdown");
                if let Err(err) = handle.close() {
                    error!(db, error = %err, "failed to close redis on shutdown");
                }
            }
        }
    }
}

/// Blocking pool registry keyed by database index.
pub struct Registry<C: Connector> {
    inner: Arc<Inner<C>>,
}

impl<C: Connector> Clone for Registry<C> {
    fn clone(&self) -> Self {
        Registry {
            inner: self.inner.clone(),
        }
    }
}

impl<C: Connector> Registry<C> {
    /// Creates an empty registry that reads the process environment.
    pub fn new(connector: C) -> Self {
        Self::with_options(connector, RegistryOptions::default())
    }

    /// Creates an empty registry with explicit options.
    pub fn with_options(connector: C, options: RegistryOptions) -> Self {
        Registry {
            inner: Arc::new(Inner {
                connector,
                options,
                slots: SlotMap::new(),
            }),
        }
    }

    /// Options this registry was built with.
    pub fn options(&self) -> &RegistryOptions {
        &self.inner.options
    }

    /// Indices that have a slot (ready, broken or initializing).
    pub fn indices(&self) -> Vec<u32> {
        self.inner.slots.indices()
    }

    /// Creates the pool for `db` unless the index was already initialized.
    ///
    /// Connection failures are retried forever. Other failures follow the
    /// configured [`crate::InitPolicy`].
    pub fn init(&self, db: u32) -> RegistryResult<()> {
        self.init_with_cancel(db, &CancellationToken::new())
    }

    /// Like [`Registry::init`], but gives up with
    /// [`RegistryError::Cancelled`] once `cancel` fires.
    pub fn init_with_cancel(&self, db: u32, cancel: &CancellationToken) -> RegistryResult<()> {
        loop {
            let slot = self.inner.slots.get_or_insert(db);
            let mut state = slot.lock();
            if state.is_some() {
                info!(db, "redis is already initialized");
                return Ok(());
            }
            if !self.inner.slots.is_current(db, &slot) {
                // Closed or abandoned while we waited for the guard.
                continue;
            }

            let (next, result) = self.connect(db, cancel);
            match next {
                Some(next) => *state = Some(next),
                None => {
                    drop(state);
                    self.inner.slots.remove_if_current(db, &slot);
                }
            }
            return result;
        }
    }

    /// Returns the pool for `db`, initializing it first if needed.
    ///
    /// Every call for the same index returns the same pool until `close`.
    pub fn get(&self, db: u32) -> RegistryResult<Arc<C::Handle>> {
        loop {
            if let Some(slot) = self.inner.slots.get(db) {
                let state = slot.lock();
                match &*state {
                    Some(SlotState::Ready(handle)) => return Ok(handle.clone()),
                    Some(SlotState::Broken) => return Err(RegistryError::Unavailable { db }),
                    None => {}
                }
            }
            self.init(db)?;
        }
    }

    /// Pool for [`DEFAULT_DB`].
    pub fn get_default(&self) -> RegistryResult<Arc<C::Handle>> {
        self.get(DEFAULT_DB)
    }

    /// Closes every registered pool and empties the registry.
    ///
    /// An empty registry is logged and reported as
    /// [`CloseOutcome::NotInitialized`]. Close failures are returned after
    /// every pool has been attempted.
    pub fn close(&self) -> RegistryResult<CloseOutcome> {
        let slots = self.inner.slots.take_all();
        if slots.is_empty() {
            error!("redis not initialized");
            return Ok(CloseOutcome::NotInitialized);
        }

        let mut closed = 0;
        let mut failures = Vec::new();
        for (db, slot) in slots {
            let state = slot.lock().take();
            match state {
                Some(SlotState::Ready(handle)) => {
                    info!(db, pool = %handle.describe(), "closing redis");
                    match handle.close() {
                        Ok(()) => closed += 1,
                        Err(err) => {
                            error!(db, error = %err, "failed to close redis");
                            failures.push(CloseFailure { db, error: err });
                        }
                    }
                }
                Some(SlotState::Broken) => debug!(db, "dropping broken redis slot"),
                None => {}
            }
        }
        close_outcome(closed, failures)
    }

    /// Pings one ready pool until it answers or the budget runs out.
    ///
    /// `timeout_budget` and `poll_interval` are in time units and are clamped
    /// by [`ProbeBudget::clamp`]. Only the lowest-indexed ready pool is
    /// probed; no pool is created.
    pub fn reconnect_probe(&self, timeout_budget: u64, poll_interval: u64) -> RegistryResult<ProbeOutcome> {
        let slots = self.inner.slots.snapshot();
        if slots.is_empty() {
            error!("redis not initialized");
            return Ok(ProbeOutcome::NotInitialized);
        }
        let (db, handle) = match slots.iter().find_map(|(db, slot)| slot.try_ready().map(|h| (*db, h))) {
            Some(target) => target,
            None => {
                error!("redis not initialized: no ready pool to probe");
                return Ok(ProbeOutcome::NotInitialized);
            }
        };

        let budget = ProbeBudget::clamp(timeout_budget, poll_interval);
        let interval = self.inner.options.units(budget.poll_interval);
        let mut remaining = budget.timeout_budget;
        while remaining > 0 {
            match handle.ping() {
                Ok(()) => {
                    info!(db, pool = %handle.describe(), "redis connected");
                    return Ok(ProbeOutcome::Connected);
                }
                Err(err) if err.is_connection() => {
                    warn!(db, remaining, error = %err, "redis unreachable, probing again");
                    thread::sleep(interval);
                    remaining = remaining.saturating_sub(budget.poll_interval);
                }
                Err(source) => return Err(RegistryError::Probe { db, source }),
            }
        }

        error!(db, budget = budget.timeout_budget, "redis did not come back within the probe budget");
        Ok(ProbeOutcome::TimedOut)
    }

    /// Initializes [`DEFAULT_DB`] and returns a guard that closes the
    /// registry when dropped.
    pub fn scoped_lifespan(&self) -> RegistryResult<Lifespan<C>> {
        self.init(DEFAULT_DB)?;
        Ok(Lifespan {
            registry: self.clone(),
            finished: false,
        })
    }

    fn connect(&self, db: u32, cancel: &CancellationToken) -> Settled<C::Handle> {
        let options = &self.inner.options;
        let config = match load_config(options, db, MODE) {
            Ok(config) => config,
            Err(err) => return settle_failure(options.init_policy, err),
        };
        let delay = options.units(options.retry_delay);

        let mut attempt = 0;
        loop {
            if cancel.is_cancelled() {
                return settle_cancelled(db);
            }
            attempt += 1;

            let outcome = self.inner.connector.open(&config).and_then(|handle| match handle.ping() {
                Ok(()) => Ok(handle),
                Err(err) => {
                    if let Err(close_err) = handle.close() {
                        debug!(db, error = %close_err, "discarding unreachable pool");
                    }
                    Err(err)
                }
            });

            match outcome {
                Ok(handle) => {
                    let describe = handle.describe();
                    return settle_ready(db, handle, describe, attempt);
                }
                Err(err) if err.is_connection() => {
                    log_retry(db, attempt, delay, &err);
                    if !sleep_unless_cancelled(delay, cancel) {
                        return settle_cancelled(db);
                    }
                }
                Err(source) => {
                    return settle_failure(options.init_policy, RegistryError::Init { db, source });
                }
            }
        }
    }
}

/// Sleeps for `total`; returns false if `cancel` fired first.
fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    let deadline = Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let now = Instant::now();
        if now >= deadline {
            return true;
        }
        thread::sleep((deadline - now).min(CANCEL_POLL));
    }
}

/// Keeps [`DEFAULT_DB`] initialized for a scope and closes the registry when
/// the scope ends, including on early return and unwinding.
pub struct Lifespan<C: Connector> {
    registry: Registry<C>,
    finished: bool,
}

impl<C: Connector> Lifespan<C> {
    /// Ends the scope now and reports the close result.
    pub fn finish(mut self) -> RegistryResult<CloseOutcome> {
        self.finished = true;
        self.registry.close()
    }
}

impl<C: Connector> Deref for Lifespan<C> {
    type Target = Registry<C>;

    fn deref(&self) -> &Registry<C> {
        &self.registry
    }
}

impl<C: Connector> Drop for Lifespan<C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.registry.close() {
            error!(error = %err, "failed to close redis at end of lifespan");
        }
    }
}
