//! # Async Connection Pool
//!
//! Purpose: The tokio counterpart of [`crate::pool`]. Same bounded-pool rules
//! and handshake, but every network wait suspends the task instead of blocking
//! the worker thread.
//!
//! ## Design Principles
//! 1. **Same Policy, Different Scheduler**: Limits, close semantics and error
//!    classification match the blocking pool exactly.
//! 2. **Short Critical Sections**: The state mutex is never held across an
//!    `.await`, so a plain `std::sync::Mutex` is enough.
//! 3. **Incremental Framing**: Replies are parsed from a `BytesMut` as bytes
//!    arrive, like the server side of the protocol.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
#[cfg(unix)]
use tokio::net::UnixStream;
use tracing::debug;

use crate::client::{ok_reply, ClientConfig, Endpoint};
use crate::error::{ClientError, ClientResult};
use crate::pool::validate_endpoint;
use crate::resp::{encode_command, parse_frame, RespValue};

trait AsyncIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncIo for T {}

struct PoolState {
    idle: VecDeque<AsyncConnection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: ClientConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Async connection pool handle.
#[derive(Clone)]
pub struct AsyncConnectionPool {
    inner: Arc<PoolInner>,
}

impl AsyncConnectionPool {
    /// Creates a new pool; connections are opened lazily.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        validate_endpoint(&config.endpoint)?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
            closed: false,
        };
        Ok(AsyncConnectionPool {
            inner: Arc::new(PoolInner {
                config,
                state: Mutex::new(state),
            }),
        })
    }

    /// Endpoint the pool connects to.
    pub fn endpoint(&self) -> &Endpoint {
        &self.inner.config.endpoint
    }

    /// Acquires a connection, opening a new one when no idle connection exists.
    pub async fn acquire(&self) -> ClientResult<AsyncPooledConnection> {
        if let Some(conn) = self.pop_idle()? {
            return Ok(AsyncPooledConnection::new(self.inner.clone(), conn));
        }

        if !self.try_reserve()? {
            return Err(ClientError::PoolExhausted);
        }

        match AsyncConnection::connect(&self.inner.config).await {
            Ok(conn) => Ok(AsyncPooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Closes the pool and shuts down every idle connection.
    pub async fn close(&self) -> ClientResult<()> {
        let idle: Vec<AsyncConnection> = {
            let mut state = self.inner.lock();
            state.closed = true;
            let drained: Vec<AsyncConnection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };

        let mut first_err = None;
        for conn in idle {
            if let Err(err) = conn.shutdown().await {
                first_err.get_or_insert(err);
            }
        }
        debug!(endpoint = %self.inner.config.endpoint, "async connection pool closed");

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn pop_idle(&self) -> ClientResult<Option<AsyncConnection>> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        Ok(state.idle.pop_front())
    }

    fn try_reserve(&self) -> ClientResult<bool> {
        let mut state = self.inner.lock();
        if state.closed {
            return Err(ClientError::PoolClosed);
        }
        if state.total >= self.inner.config.max_total {
            return Ok(false);
        }
        state.total += 1;
        Ok(true)
    }

    fn release_slot(&self) {
        let mut state = self.inner.lock();
        state.total = state.total.saturating_sub(1);
    }
}

fn return_connection(pool: &PoolInner, conn: AsyncConnection) {
    let mut state = pool.lock();
    if !state.closed && state.idle.len() < pool.config.max_idle {
        state.idle.push_back(conn);
    } else {
        state.total = state.total.saturating_sub(1);
    }
}

/// RAII wrapper returning a connection to the async pool on drop.
pub struct AsyncPooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<AsyncConnection>,
    valid: bool,
}

impl AsyncPooledConnection {
    fn new(pool: Arc<PoolInner>, conn: AsyncConnection) -> Self {
        AsyncPooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed reply.
    ///
    /// The connection counts as broken until the reply has been read, so a
    /// future dropped mid-command never returns a stream with a pending reply
    /// to the idle queue.
    pub async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        if !self.valid {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe).into());
        }
        let read_timeout = self.pool.config.read_timeout;
        let conn = self.conn.as_mut().ok_or(ClientError::PoolClosed)?;
        self.valid = false;
        let response = with_timeout(read_timeout, conn.exec(args)).await;
        self.valid = response.is_ok();
        response
    }
}

impl Drop for AsyncPooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        if self.valid {
            return_connection(&self.pool, conn);
        } else {
            let mut state = self.pool.lock();
            state.total = state.total.saturating_sub(1);
        }
    }
}

struct AsyncConnection {
    stream: Box<dyn AsyncIo>,
    read_buf: BytesMut,
    write_buf: Vec<u8>,
}

impl AsyncConnection {
    async fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let stream = with_timeout(config.connect_timeout, connect_stream(&config.endpoint)).await?;
        let mut conn = AsyncConnection {
            stream,
            read_buf: BytesMut::with_capacity(4 * 1024),
            write_buf: Vec::with_capacity(256),
        };

        if !config.password.is_empty() {
            ok_reply(conn.exec(&[b"AUTH", config.password.as_bytes()]).await?)?;
        }
        if config.db != 0 {
            let db = config.db.to_string();
            ok_reply(conn.exec(&[b"SELECT", db.as_bytes()]).await?)?;
        }
        debug!(endpoint = %config.endpoint, db = config.db, "opened async connection");
        Ok(conn)
    }

    async fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await?;

        loop {
            if let Some((value, used)) = parse_frame(&self.read_buf)? {
                self.read_buf.advance(used);
                return Ok(value);
            }
            let bytes = self.stream.read_buf(&mut self.read_buf).await?;
            if bytes == 0 {
                return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
            }
        }
    }

    async fn shutdown(mut self) -> io::Result<()> {
        match self.stream.shutdown().await {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

async fn connect_stream(endpoint: &Endpoint) -> ClientResult<Box<dyn AsyncIo>> {
    match endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = TcpStream::connect((host.as_str(), *port)).await?;
            stream.set_nodelay(true)?;
            Ok(Box::new(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Box::new(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(ClientError::InvalidAddress(endpoint.to_string())),
    }
}

async fn with_timeout<T>(
    limit: Option<Duration>,
    fut: impl Future<Output = ClientResult<T>>,
) -> ClientResult<T> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::from(io::ErrorKind::TimedOut).into()),
        },
        None => fut.await,
    }
}
