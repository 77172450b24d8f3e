//! # KVLink Client
//!
//! Purpose: Provide a lightweight Redis-compatible client with connection
//! pooling, in a blocking flavour and a tokio flavour, over TCP or a Unix
//! domain socket.
//!
//! ## Design Principles
//! 1. **Object Pool Pattern**: Reuse connections to avoid repeated connects.
//! 2. **One Protocol, Two Schedulers**: Both flavours share the RESP2 codec,
//!    the reply decoding and the error type.
//! 3. **Minimal Allocation**: Reuse buffers for RESP framing and parsing.
//! 4. **Protocol Clarity**: Encode/parse RESP2 explicitly for correctness.

mod async_client;
mod async_pool;
mod client;
mod error;
mod pool;
pub mod resp;

pub use async_client::AsyncKVClient;
pub use client::{ClientConfig, ClientTtl, Endpoint, KVClient};
pub use error::{ClientError, ClientResult};
