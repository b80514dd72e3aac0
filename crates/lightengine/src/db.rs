//! Postgres connection pool and schema migrations

use lightengine_common::{EngineError, Result};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
}

impl DbConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 30,
        }
    }

    /// `DATABASE_URL` plus optional pool sizing; `None` when no database is
    /// configured.
    pub fn from_env() -> Option<Self> {
        let url = std::env::var("DATABASE_URL").ok().filter(|u| !u.is_empty())?;
        let mut config = Self::new(url);

        if let Some(max) = std::env::var("DB_MAX_CONNECTIONS").ok().and_then(|s| s.parse().ok()) {
            config.max_connections = max;
        }
        if let Some(min) = std::env::var("DB_MIN_CONNECTIONS").ok().and_then(|s| s.parse().ok()) {
            config.min_connections = min;
        }
        if let Some(timeout) = std::env::var("DB_CONNECT_TIMEOUT").ok().and_then(|s| s.parse().ok()) {
            config.connect_timeout_secs = timeout;
        }
        Some(config)
    }
}

pub async fn create_pool(config: &DbConfig) -> Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
        .connect(&config.url)
        .await
        .map_err(|e| EngineError::Config(format!("failed to connect to database: {}", e)))?;

    tracing::info!(
        max_connections = config.max_connections,
        min_connections = config.min_connections,
        "Database connection pool created"
    );

    Ok(pool)
}

/// Apply the ledger and pipeline metadata schema.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(|e| EngineError::Ledger(format!("migration failed: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_sizing() {
        let config = DbConfig::new("postgresql://localhost/lightengine");
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.min_connections, 1);
        assert_eq!(config.connect_timeout_secs, 30);
    }
}
