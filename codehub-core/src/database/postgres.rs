//! Pool setup. Coordinators additionally check out a dedicated connection
//! outside this pool for their advisory-lock lifetime (spec §9); the pool
//! here serves the API/proxy's ordinary request-scoped queries.

use std::time::Duration;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use tracing::info;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_connections: u32,
    pub acquire_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_connections: 20, acquire_timeout: Duration::from_secs(10) }
    }
}

pub async fn connect(database_url: &str, config: PoolConfig) -> Result<PgPool> {
    info!("connecting to postgres");
    let options: PgConnectOptions = database_url.parse()?;
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(options)
        .await?;
    info!("postgres pool ready");
    Ok(pool)
}
