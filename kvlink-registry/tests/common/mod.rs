#![allow(dead_code)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kvlink_client::{ClientError, ClientResult};
use kvlink_registry::{
    AsyncConnector, AsyncPoolHandle, ConfigSource, Connector, InitPolicy, PoolConfig, PoolHandle, RegistryOptions,
};

/// Shared script and counters for the fake transports.
#[derive(Default)]
pub struct FakeState {
    pub opened: AtomicUsize,
    pub pings: AtomicUsize,
    pub closed: AtomicUsize,
    fail_next_pings: AtomicUsize,
    down: AtomicBool,
    reject_auth: AtomicBool,
    close_fails: AtomicBool,
    last_config: Mutex<Option<PoolConfig>>,
}

impl FakeState {
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// The next `count` pings fail with a connection error.
    pub fn fail_next_pings(&self, count: usize) {
        self.fail_next_pings.store(count, Ordering::SeqCst);
    }

    /// Every ping fails with a connection error until cleared.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Opening a pool fails with an authentication error.
    pub fn reject_auth(&self) {
        self.reject_auth.store(true, Ordering::SeqCst);
    }

    pub fn fail_closes(&self) {
        self.close_fails.store(true, Ordering::SeqCst);
    }

    pub fn last_config(&self) -> Option<PoolConfig> {
        self.last_config.lock().unwrap().clone()
    }

    fn open(&self, config: &PoolConfig) -> ClientResult<FakeHandle> {
        *self.last_config.lock().unwrap() = Some(config.clone());
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(ClientError::Server {
                message: b"WRONGPASS invalid username-password pair".to_vec(),
            });
        }
        let id = self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(FakeHandle { id, db: config.db })
    }

    fn ping(&self) -> ClientResult<()> {
        self.pings.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(refused());
        }
        let failing = self
            .fail_next_pings
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if failing {
            return Err(refused());
        }
        Ok(())
    }

    fn close(&self) -> ClientResult<()> {
        self.closed.fetch_add(1, Ordering::SeqCst);
        if self.close_fails.load(Ordering::SeqCst) {
            return Err(ClientError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "close failed")));
        }
        Ok(())
    }
}

fn refused() -> ClientError {
    ClientError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"))
}

#[derive(Debug)]
pub struct FakeHandle {
    pub id: usize,
    pub db: u32,
}

/// Blocking fake: counts pools, scripts ping outcomes.
#[derive(Clone, Default)]
pub struct FakeConnector {
    pub state: Arc<FakeState>,
    pub open_delay: Duration,
}

pub struct FakePool {
    pub handle: FakeHandle,
    state: Arc<FakeState>,
}

impl Connector for FakeConnector {
    type Handle = FakePool;

    fn open(&self, config: &PoolConfig) -> ClientResult<FakePool> {
        if !self.open_delay.is_zero() {
            std::thread::sleep(self.open_delay);
        }
        let handle = self.state.open(config)?;
        Ok(FakePool {
            handle,
            state: self.state.clone(),
        })
    }
}

impl PoolHandle for FakePool {
    fn ping(&self) -> ClientResult<()> {
        self.state.ping()
    }

    fn close(&self) -> ClientResult<()> {
        self.state.close()
    }

    fn describe(&self) -> String {
        format!("fake#{} db={}", self.handle.id, self.handle.db)
    }
}

/// Non-blocking fake sharing the same script.
#[derive(Clone, Default)]
pub struct AsyncFakeConnector {
    pub state: Arc<FakeState>,
    pub open_delay: Duration,
}

pub struct AsyncFakePool {
    pub handle: FakeHandle,
    state: Arc<FakeState>,
}

#[async_trait]
impl AsyncConnector for AsyncFakeConnector {
    type Handle = AsyncFakePool;

    async fn open(&self, config: &PoolConfig) -> ClientResult<AsyncFakePool> {
        if !self.open_delay.is_zero() {
            tokio::time::sleep(self.open_delay).await;
        }
        let handle = self.state.open(config)?;
        Ok(AsyncFakePool {
            handle,
            state: self.state.clone(),
        })
    }
}

#[async_trait]
impl AsyncPoolHandle for AsyncFakePool {
    async fn ping(&self) -> ClientResult<()> {
        tokio::task::yield_now().await;
        self.state.ping()
    }

    async fn close(&self) -> ClientResult<()> {
        self.state.close()
    }

    fn describe(&self) -> String {
        format!("async-fake#{} db={}", self.handle.id, self.handle.db)
    }
}

pub fn tcp_source() -> ConfigSource {
    ConfigSource::fixed([
        ("REDIS_HOST", "localhost"),
        ("REDIS_PORT", "6379"),
        ("REDIS_DB", "0"),
    ])
}

/// Options with a 1ms time unit so retry and probe loops finish quickly.
pub fn fast_options() -> RegistryOptions {
    RegistryOptions::default()
        .with_time_unit(Duration::from_millis(1))
        .with_source(tcp_source())
}

pub fn strict_options() -> RegistryOptions {
    fast_options().with_init_policy(InitPolicy::Propagate)
}
