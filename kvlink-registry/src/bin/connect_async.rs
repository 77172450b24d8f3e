//! Stores and reads back one key through the tokio registry.
//!
//! Reads `REDIS_*` from the environment (and `.env` when present).

use anyhow::Context;
use kvlink_registry::{AsyncRegistry, AsyncRespConnector, DEFAULT_DB};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = AsyncRegistry::new(AsyncRespConnector::default());
    registry
        .run_scoped(|registry| async move {
            let redis = registry.get(DEFAULT_DB).await?;
            redis.set(b"name", b"ali").await.context("SET name")?;
            let name = redis.get_string(b"name").await.context("GET name")?;
            println!("name is '{}'", name.unwrap_or_default());
            anyhow::Ok(())
        })
        .await??;
    Ok(())
}
