//! # Connection Pool
//!
//! Purpose: Reuse TCP or Unix-socket connections for the blocking client to
//! reduce handshake latency and allocation churn.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Keep a bounded set of reusable connections.
//! 2. **Minimal Locking**: Hold the mutex only while moving idle connections.
//! 3. **Fail Fast**: Exceeding the pool limit returns an error immediately.
//! 4. **Cache-Friendly Buffers**: Each connection reuses its own buffers.

use std::collections::VecDeque;
use std::io::{self, BufReader, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
#[cfg(unix)]
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::debug;

use crate::client::{ok_reply, ClientConfig, Endpoint};
use crate::error::{ClientError, ClientResult};
use crate::resp::{encode_command, read_response, RespValue};

struct PoolState {
    idle: VecDeque<Connection>,
    total: usize,
    closed: bool,
}

struct PoolInner {
    config: ClientConfig,
    state: Mutex<PoolState>,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        // Pool state stays consistent across a panic, so a poisoned lock is usable.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Connection pool handle.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Creates a new connection pool with the provided configuration.
    ///
    /// Connections are opened lazily on first acquire.
    pub fn new(config: ClientConfig) -> ClientResult<Self> {
        validate_endpoint(&config.endpoint)?;
        let state = PoolState {
            idle: VecDeque::with_capacity(config.max_idle),
            total: 0,
            closed: false,
        };
        Ok(ConnectionPool {
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

    /// Acquires a connection from the pool.
    pub fn acquire(&self) -> ClientResult<PooledConnection> {
        if let Some(conn) = self.pop_idle()? {
            return Ok(PooledConnection::new(self.inner.clone(), conn));
        }

        if !self.try_reserve()? {
            return Err(ClientError::PoolExhausted);
        }

        match Connection::connect(&self.inner.config) {
            Ok(conn) => Ok(PooledConnection::new(self.inner.clone(), conn)),
            Err(err) => {
                self.release_slot();
                Err(err)
            }
        }
    }

    /// Closes the pool and shuts down every idle connection.
    ///
    /// Returns the first shutdown failure, after attempting all of them.
    pub fn close(&self) -> ClientResult<()> {
        let idle: Vec<Connection> = {
            let mut state = self.inner.lock();
            state.closed = true;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total = state.total.saturating_sub(drained.len());
            drained
        };

        let mut first_err = None;
        for conn in idle {
            if let Err(err) = conn.shutdown() {
                first_err.get_or_insert(err);
            }
        }
        debug!(endpoint = %self.inner.config.endpoint, "connection pool closed");

        match first_err {
            Some(err) => Err(err.into()),
            None => Ok(()),
        }
    }

    /// Returns true once `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    fn pop_idle(&self) -> ClientResult<Option<Connection>> {
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

    fn return_connection(&self, conn: Connection) {
        let mut state = self.inner.lock();
        if !state.closed && state.idle.len() < self.inner.config.max_idle {
            state.idle.push_back(conn);
        } else {
            state.total = state.total.saturating_sub(1);
        }
    }
}

/// RAII wrapper returning a connection to the pool on drop.
pub struct PooledConnection {
    pool: Arc<PoolInner>,
    conn: Option<Connection>,
    valid: bool,
}

impl PooledConnection {
    fn new(pool: Arc<PoolInner>, conn: Connection) -> Self {
        PooledConnection {
            pool,
            conn: Some(conn),
            valid: true,
        }
    }

    /// Executes a RESP command and returns the parsed reply.
    pub fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        let conn = self.conn.as_mut().ok_or(ClientError::PoolClosed)?;
        let response = conn.exec(args);
        if response.is_err() {
            // If IO/protocol fails, do not return this connection to the pool.
            self.valid = false;
        }
        response
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        let conn = match self.conn.take() {
            Some(conn) => conn,
            None => return,
        };

        let pool = ConnectionPool {
            inner: self.pool.clone(),
        };

        if self.valid {
            pool.return_connection(conn);
        } else {
            pool.release_slot();
        }
    }
}

/// Byte stream to the server over either transport.
enum Stream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}

impl Stream {
    fn set_timeouts(&self, read: Option<Duration>, write: Option<Duration>) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)?;
                // Disable Nagle to keep request latency low for small payloads.
                stream.set_nodelay(true)
            }
            #[cfg(unix)]
            Stream::Unix(stream) => {
                stream.set_read_timeout(read)?;
                stream.set_write_timeout(write)
            }
        }
    }

    fn shutdown(&self) -> io::Result<()> {
        let result = match self {
            Stream::Tcp(stream) => stream.shutdown(Shutdown::Both),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.shutdown(Shutdown::Both),
        };
        match result {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Tcp(stream) => stream.flush(),
            #[cfg(unix)]
            Stream::Unix(stream) => stream.flush(),
        }
    }
}

/// Single server connection with reusable buffers.
struct Connection {
    // Buffered reader reduces syscalls while still allowing direct writes.
    reader: BufReader<Stream>,
    line_buf: Vec<u8>,
    write_buf: Vec<u8>,
}

impl Connection {
    fn connect(config: &ClientConfig) -> ClientResult<Self> {
        let stream = connect_stream(config)?;
        stream.set_timeouts(config.read_timeout, config.write_timeout)?;

        let mut conn = Connection {
            reader: BufReader::new(stream),
            line_buf: Vec::with_capacity(128),
            write_buf: Vec::with_capacity(256),
        };
        conn.handshake(config)?;
        debug!(endpoint = %config.endpoint, db = config.db, "opened connection");
        Ok(conn)
    }

    fn handshake(&mut self, config: &ClientConfig) -> ClientResult<()> {
        if !config.password.is_empty() {
            ok_reply(self.exec(&[b"AUTH", config.password.as_bytes()])?)?;
        }
        if config.db != 0 {
            let db = config.db.to_string();
            ok_reply(self.exec(&[b"SELECT", db.as_bytes()])?)?;
        }
        Ok(())
    }

    fn exec(&mut self, args: &[&[u8]]) -> ClientResult<RespValue> {
        self.write_buf.clear();
        encode_command(args, &mut self.write_buf);

        let stream = self.reader.get_mut();
        stream.write_all(&self.write_buf)?;
        stream.flush()?;

        read_response(&mut self.reader, &mut self.line_buf)
    }

    fn shutdown(self) -> io::Result<()> {
        self.reader.get_ref().shutdown()
    }
}

pub(crate) fn validate_endpoint(endpoint: &Endpoint) -> ClientResult<()> {
    match endpoint {
        Endpoint::Tcp { host, .. } if host.is_empty() => {
            Err(ClientError::InvalidAddress("empty host".to_string()))
        }
        Endpoint::Unix(path) if path.as_os_str().is_empty() => {
            Err(ClientError::InvalidAddress("empty unix socket path".to_string()))
        }
        #[cfg(not(unix))]
        Endpoint::Unix(path) => Err(ClientError::InvalidAddress(format!(
            "unix sockets are unsupported on this platform: {}",
            path.display()
        ))),
        _ => Ok(()),
    }
}

fn connect_stream(config: &ClientConfig) -> ClientResult<Stream> {
    match &config.endpoint {
        Endpoint::Tcp { host, port } => {
            let stream = match config.connect_timeout {
                Some(timeout) => {
                    let addr = (host.as_str(), *port)
                        .to_socket_addrs()?
                        .next()
                        .ok_or_else(|| ClientError::InvalidAddress(config.endpoint.to_string()))?;
                    TcpStream::connect_timeout(&addr, timeout)?
                }
                None => TcpStream::connect((host.as_str(), *port))?,
            };
            Ok(Stream::Tcp(stream))
        }
        #[cfg(unix)]
        Endpoint::Unix(path) => Ok(Stream::Unix(UnixStream::connect(path)?)),
        #[cfg(not(unix))]
        Endpoint::Unix(_) => Err(ClientError::InvalidAddress(config.endpoint.to_string())),
    }
}
