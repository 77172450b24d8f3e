//! # Non-Blocking Registry
//!
//! Purpose: The tokio twin of [`crate::Registry`]. Same state machine, same
//! policies; pings, retry delays and probe intervals suspend the task
//! instead of blocking a worker thread.
//!
//! ## Usage Notes
//! - Per-index guards are `tokio::sync::Mutex`, held across the connect
//!   loop, so concurrent `get(i)` for a new `i` creates one pool.
//! - Async code cannot close pools from `Drop`; end the process through
//!   [`AsyncRegistry::close`] or a lifespan guard.

use std::future::Future;
use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use kvlink_client::ClientResult;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{CloseFailure, RegistryError, RegistryResult};
use crate::lifecycle::{
    close_outcome, load_config, log_retry, settle_cancelled, settle_failure, settle_ready, CloseOutcome,
    ProbeBudget, ProbeOutcome, RegistryOptions, Settled, SlotMap, SlotState, DEFAULT_DB,
};
use crate::transport::{AsyncConnector, AsyncPoolHandle};

const MODE: &str = "ASYNC";

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
    fn try_ready(&self) -> Option<Arc<H>> {
        let state = self.state.try_lock().ok()?;
        match &*state {
            Some(SlotState::Ready(handle)) => Some(handle.clone()),
            _ => None,
        }
    }
}

struct Inner<C: AsyncConnector> {
    connector: C,
    options: RegistryOptions,
    slots: SlotMap<Slot<C::Handle>>,
}

/// Non-blocking pool registry keyed by database index.
pub struct AsyncRegistry<C: AsyncConnector> {
    inner: Arc<Inner<C>>,
}

impl<C: AsyncConnector> Clone for AsyncRegistry<C> {
    fn clone(&self) -> Self {
        AsyncRegistry {
            inner: self.inner.clone(),
        }
    }
}

impl<C: AsyncConnector> AsyncRegistry<C> {
    /// Creates an empty registry that reads the process environment.
    pub fn new(connector: C) -> Self {
        Self::with_options(connector, RegistryOptions::default())
    }

    /// Creates an empty registry with explicit options.
    pub fn with_options(connector: C, options: RegistryOptions) -> Self {
        AsyncRegistry {
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
    pub async fn init(&self, db: u32) -> RegistryResult<()> {
        self.init_with_cancel(db, &CancellationToken::new()).await
    }

    /// Like [`AsyncRegistry::init`], but gives up with
    /// [`RegistryError::Cancelled`] once `cancel` fires.
    pub async fn init_with_cancel(&self, db: u32, cancel: &CancellationToken) -> RegistryResult<()> {
        loop {
            let slot = self.inner.slots.get_or_insert(db);
            let mut state = slot.state.lock().await;
            if state.is_some() {
                info!(db, "redis is already initialized");
                return Ok(());
            }
            if !self.inner.slots.is_current(db, &slot) {
                continue;
            }

            let (next, result) = self.connect(db, cancel).await;
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
    pub async fn get(&self, db: u32) -> RegistryResult<Arc<C::Handle>> {
        loop {
            let slot = self.inner.slots.get(db);
            if let Some(slot) = slot {
                let state = slot.state.lock().await;
                match &*state {
                    Some(SlotState::Ready(handle)) => return Ok(handle.clone()),
                    Some(SlotState::Broken) => return Err(RegistryError::Unavailable { db }),
                    None => {}
                }
            }
            self.init(db).await?;
        }
    }

    /// Pool for [`DEFAULT_DB`].
    pub async fn get_default(&self) -> RegistryResult<Arc<C::Handle>> {
        self.get(DEFAULT_DB).await
    }

    /// Closes every registered pool and empties the registry.
    pub async fn close(&self) -> RegistryResult<CloseOutcome> {
        let slots = self.inner.slots.take_all();
        if slots.is_empty() {
            error!("redis not initialized");
            return Ok(CloseOutcome::NotInitialized);
        }

        let mut closed = 0;
        let mut failures = Vec::new();
        for (db, slot) in slots {
            let state = slot.state.lock().await.take();
            match state {
                Some(SlotState::Ready(handle)) => {
                    info!(db, pool = %handle.describe(), "closing redis");
                    match handle.close().await {
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
    /// Same clamping and target choice as [`crate::Registry::reconnect_probe`].
    pub async fn reconnect_probe(&self, timeout_budget: u64, poll_interval: u64) -> RegistryResult<ProbeOutcome> {
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
            match handle.ping().await {
                Ok(()) => {
                    info!(db, pool = %handle.describe(), "redis connected");
                    return Ok(ProbeOutcome::Connected);
                }
                Err(err) if err.is_connection() => {
                    warn!(db, remaining, error = %err, "redis unreachable, probing again");
                    tokio::time::sleep(interval).await;
                    remaining = remaining.saturating_sub(budget.poll_interval);
                }
                Err(source) => return Err(RegistryError::Probe { db, source }),
            }
        }

        error!(db, budget = budget.timeout_budget, "redis did not come back within the probe budget");
        Ok(ProbeOutcome::TimedOut)
    }

    /// Initializes [`DEFAULT_DB`] and returns a guard that closes the
    /// registry when finished or dropped.
    pub async fn scoped_lifespan(&self) -> RegistryResult<AsyncLifespan<C>> {
        self.init(DEFAULT_DB).await?;
        Ok(AsyncLifespan {
            registry: self.clone(),
            finished: false,
        })
    }

    /// Runs `f` inside a lifespan: [`DEFAULT_DB`] is initialized first and the
    /// registry is closed afterwards.
    pub async fn run_scoped<F, Fut, T>(&self, f: F) -> RegistryResult<T>
    where
        F: FnOnce(AsyncRegistry<C>) -> Fut,
        Fut: Future<Output = T>,
    {
        let lifespan = self.scoped_lifespan().await?;
        let output = f(self.clone()).await;
        lifespan.finish().await?;
        Ok(output)
    }

    async fn connect(&self, db: u32, cancel: &CancellationToken) -> Settled<C::Handle> {
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

            // An attempt stuck on a silent server is abandoned as soon as the
            // token fires.
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return settle_cancelled(db),
                outcome = self.attempt(db, &config) => outcome,
            };

            match outcome {
                Ok(handle) => {
                    let describe = handle.describe();
                    return settle_ready(db, handle, describe, attempt);
                }
                Err(err) if err.is_connection() => {
                    log_retry(db, attempt, delay, &err);
                    if !sleep_unless_cancelled(delay, cancel).await {
                        return settle_cancelled(db);
                    }
                }
                Err(source) => {
                    return settle_failure(options.init_policy, RegistryError::Init { db, source });
                }
            }
        }
    }

    /// Opens a pool and pings it once; an unreachable pool is closed again.
    async fn attempt(&self, db: u32, config: &PoolConfig) -> ClientResult<C::Handle> {
        let handle = self.inner.connector.open(config).await?;
        match handle.ping().await {
            Ok(()) => Ok(handle),
            Err(err) => {
                if let Err(close_err) = handle.close().await {
                    debug!(db, error = %close_err, "discarding unreachable pool");
                }
                Err(err)
            }
        }
    }
}

async fn sleep_unless_cancelled(total: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(total) => true,
    }
}

/// Keeps [`DEFAULT_DB`] initialized for a scope.
///
/// Call [`AsyncLifespan::finish`] to close and observe the result. If the
/// guard is dropped instead (early return, panic), the close is spawned onto
/// the current tokio runtime.
pub struct AsyncLifespan<C: AsyncConnector> {
    registry: AsyncRegistry<C>,
    finished: bool,
}

impl<C: AsyncConnector> AsyncLifespan<C> {
    /// Ends the scope now and reports the close result.
    pub async fn finish(mut self) -> RegistryResult<CloseOutcome> {
        self.finished = true;
        self.registry.close().await
    }
}

impl<C: AsyncConnector> Deref for AsyncLifespan<C> {
    type Target = AsyncRegistry<C>;

    fn deref(&self) -> &AsyncRegistry<C> {
        &self.registry
    }
}

impl<C: AsyncConnector> Drop for AsyncLifespan<C> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let registry = self.registry.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(err) = registry.close().await {
                        error!(error = %err, "failed to close redis at end of lifespan");
                    }
                });
            }
            Err(_) => warn!("lifespan dropped outside a tokio runtime; redis pools were not closed"),
        }
    }
}
