//! Stores and reads back one key through the blocking registry.
//!
//! Reads `REDIS_*` from the environment (and `.env` when present).

use anyhow::Context;
use kvlink_registry::{Registry, RespConnector, DEFAULT_DB};
use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Registry::new(RespConnector::default());
    let lifespan = registry.scoped_lifespan()?;

    let redis = lifespan.get(DEFAULT_DB)?;
    redis.set(b"name", b"ali").context("SET name")?;
    let name = redis.get_string(b"name").context("GET name")?;
    println!("name is '{}'", name.unwrap_or_default());

    lifespan.finish()?;
    Ok(())
}
