//! Configuration management

use crate::db::DbConfig;
use crate::enrichment::EnrichmentPlugin;
use crate::notify::DEFAULT_CONSOLE_URL_TEMPLATE;
use crate::partition::QueryContext;
use crate::storage::StorageConfig;
use lightengine_common::{EngineError, Result};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

// ============================================================================
// Engine Configuration Constants
// ============================================================================

/// Default staging prefix collectors write under.
pub const DEFAULT_STAGING_PREFIX: &str = "AWSLogs";

/// Default data lake prefix in the centralized bucket.
pub const DEFAULT_CENTRALIZED_PREFIX: &str = "datalake";

/// Default cold-storage prefix.
pub const DEFAULT_ARCHIVE_PREFIX: &str = "archive";

/// Default catalog database.
pub const DEFAULT_CATALOG_DATABASE: &str = "centralized";

/// Default query work group.
pub const DEFAULT_CATALOG_WORKGROUP: &str = "primary";

/// Default enrichment allow-list.
pub const DEFAULT_ENRICHMENT_PLUGINS: &str = "geo_ip,user_agent";

/// Default ledger record lifetime in seconds (30 days).
pub const DEFAULT_LEDGER_TTL_SECS: u64 = crate::ledger::DEFAULT_TTL_SECS;

/// Default bounded fan-out per invocation.
pub const DEFAULT_WORKER_CONCURRENCY: usize = crate::storage::batch::DEFAULT_CONCURRENCY;

/// Default partitions per DDL statement.
pub const DEFAULT_DDL_BATCH_SIZE: usize = crate::partition::DEFAULT_BATCH_SIZE;

/// Default catalog poll interval in milliseconds.
pub const DEFAULT_QUERY_POLL_INTERVAL_MS: u64 = 500;

/// Default catalog statement timeout in seconds.
pub const DEFAULT_QUERY_TIMEOUT_SECS: u64 = 300;

/// Default merged object size (128 MiB).
pub const DEFAULT_MERGE_TARGET_SIZE_BYTES: u64 = 128 * 1024 * 1024;

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| EngineError::Config(format!("{} has an invalid value '{}'", name, raw))),
        None => Ok(default),
    }
}

/// Engine configuration
#[derive(Debug, Clone, Serialize)]
pub struct EngineConfig {
    pub staging_bucket: String,
    pub staging_prefix: String,
    pub centralized_bucket: String,
    pub centralized_prefix: String,
    pub archive_bucket: String,
    pub archive_prefix: String,
    pub catalog: CatalogConfig,
    pub enrichment_plugins: Vec<EnrichmentPlugin>,
    pub geoip_database_path: Option<PathBuf>,
    pub ledger_ttl_secs: u64,
    pub worker_concurrency: usize,
    pub merge_target_size_bytes: u64,
    pub delete_staging_on_success: bool,
    #[serde(skip_serializing)]
    pub database: Option<DbConfig>,
    pub pipelines_file: Option<PathBuf>,
    pub notify_webhook_url: Option<String>,
    pub console_url_template: String,
    pub storage: StorageConfig,
}

/// Where partition DDL runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogBackend {
    #[default]
    Athena,
    /// In-process tables; state is lost when the process exits.
    Memory,
}

impl std::str::FromStr for CatalogBackend {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "athena" => Ok(CatalogBackend::Athena),
            "memory" => Ok(CatalogBackend::Memory),
            other => Err(EngineError::Config(format!("unknown catalog backend '{}'", other))),
        }
    }
}

/// Query catalog configuration
#[derive(Debug, Clone, Serialize)]
pub struct CatalogConfig {
    pub backend: CatalogBackend,
    pub database: String,
    pub work_group: String,
    pub output_location: String,
    /// Athena endpoint override
    pub endpoint: Option<String>,
    pub ddl_batch_size: usize,
    pub poll_interval_ms: u64,
    pub timeout_secs: u64,
}

impl CatalogConfig {
    pub fn context(&self) -> QueryContext {
        QueryContext {
            database: self.database.clone(),
            work_group: self.work_group.clone(),
            output_location: self.output_location.clone(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EngineConfig {
    /// Load configuration from environment and defaults
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let centralized_bucket = env_string("CENTRALIZED_BUCKET").unwrap_or_default();
        let config = EngineConfig {
            staging_bucket: env_string("STAGING_BUCKET").unwrap_or_default(),
            staging_prefix: env_string("STAGING_PREFIX").unwrap_or_else(|| DEFAULT_STAGING_PREFIX.to_string()),
            centralized_prefix: env_string("CENTRALIZED_PREFIX")
                .unwrap_or_else(|| DEFAULT_CENTRALIZED_PREFIX.to_string()),
            archive_bucket: env_string("ARCHIVE_BUCKET").unwrap_or_else(|| centralized_bucket.clone()),
            archive_prefix: env_string("ARCHIVE_PREFIX").unwrap_or_else(|| DEFAULT_ARCHIVE_PREFIX.to_string()),
            catalog: CatalogConfig {
                backend: match env_string("CATALOG_BACKEND") {
                    Some(raw) => raw.trim().parse()?,
                    None => CatalogBackend::default(),
                },
                database: env_string("CATALOG_DATABASE").unwrap_or_else(|| DEFAULT_CATALOG_DATABASE.to_string()),
                work_group: env_string("CATALOG_WORKGROUP").unwrap_or_else(|| DEFAULT_CATALOG_WORKGROUP.to_string()),
                output_location: env_string("CATALOG_OUTPUT_LOCATION")
                    .unwrap_or_else(|| format!("s3://{}/athena-results/", centralized_bucket)),
                endpoint: env_string("CATALOG_ENDPOINT"),
                ddl_batch_size: env_parse("DDL_BATCH_SIZE", DEFAULT_DDL_BATCH_SIZE)?,
                poll_interval_ms: env_parse("QUERY_POLL_INTERVAL_MS", DEFAULT_QUERY_POLL_INTERVAL_MS)?,
                timeout_secs: env_parse("QUERY_TIMEOUT_SECS", DEFAULT_QUERY_TIMEOUT_SECS)?,
            },
            enrichment_plugins: EnrichmentPlugin::parse_list(
                &env_string("ENRICHMENT_PLUGINS").unwrap_or_else(|| DEFAULT_ENRICHMENT_PLUGINS.to_string()),
            )
            .map_err(|e| EngineError::Config(e.to_string()))?,
            geoip_database_path: env_string("GEOIP_DATABASE_PATH").map(PathBuf::from),
            ledger_ttl_secs: env_parse("LEDGER_TTL_SECS", DEFAULT_LEDGER_TTL_SECS)?,
            worker_concurrency: env_parse("WORKER_CONCURRENCY", DEFAULT_WORKER_CONCURRENCY)?,
            merge_target_size_bytes: env_parse("MERGE_TARGET_SIZE_BYTES", DEFAULT_MERGE_TARGET_SIZE_BYTES)?,
            delete_staging_on_success: env_parse("DELETE_STAGING_ON_SUCCESS", true)?,
            database: DbConfig::from_env(),
            pipelines_file: env_string("PIPELINES_FILE").map(PathBuf::from),
            notify_webhook_url: env_string("NOTIFY_WEBHOOK_URL"),
            console_url_template: env_string("CONSOLE_URL_TEMPLATE")
                .unwrap_or_else(|| DEFAULT_CONSOLE_URL_TEMPLATE.to_string()),
            storage: StorageConfig::from_env(),
            centralized_bucket,
        };

        config.validate()?;

        Ok(config)
    }

    /// Settings for in-process runs and tests.
    pub fn local(staging_bucket: &str, centralized_bucket: &str) -> Self {
        EngineConfig {
            staging_bucket: staging_bucket.to_string(),
            staging_prefix: DEFAULT_STAGING_PREFIX.to_string(),
            centralized_bucket: centralized_bucket.to_string(),
            centralized_prefix: DEFAULT_CENTRALIZED_PREFIX.to_string(),
            archive_bucket: centralized_bucket.to_string(),
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            catalog: CatalogConfig {
                backend: CatalogBackend::Memory,
                database: DEFAULT_CATALOG_DATABASE.to_string(),
                work_group: DEFAULT_CATALOG_WORKGROUP.to_string(),
                output_location: format!("s3://{}/athena-results/", centralized_bucket),
                endpoint: None,
                ddl_batch_size: DEFAULT_DDL_BATCH_SIZE,
                poll_interval_ms: 1,
                timeout_secs: 5,
            },
            enrichment_plugins: vec![EnrichmentPlugin::GeoIp, EnrichmentPlugin::UserAgent],
            geoip_database_path: None,
            ledger_ttl_secs: DEFAULT_LEDGER_TTL_SECS,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            merge_target_size_bytes: DEFAULT_MERGE_TARGET_SIZE_BYTES,
            delete_staging_on_success: true,
            database: None,
            pipelines_file: None,
            notify_webhook_url: None,
            console_url_template: DEFAULT_CONSOLE_URL_TEMPLATE.to_string(),
            storage: StorageConfig::default(),
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.worker_concurrency == 0 {
            return Err(EngineError::Config("WORKER_CONCURRENCY must be greater than 0".to_string()));
        }
        if self.catalog.ddl_batch_size == 0 {
            return Err(EngineError::Config("DDL_BATCH_SIZE must be greater than 0".to_string()));
        }
        if self.ledger_ttl_secs == 0 {
            return Err(EngineError::Config("LEDGER_TTL_SECS must be greater than 0".to_string()));
        }
        if self.merge_target_size_bytes == 0 {
            return Err(EngineError::Config("MERGE_TARGET_SIZE_BYTES must be greater than 0".to_string()));
        }
        if self.catalog.poll_interval_ms == 0 {
            return Err(EngineError::Config("QUERY_POLL_INTERVAL_MS must be greater than 0".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: [&str; 7] = [
        "CENTRALIZED_BUCKET",
        "CATALOG_BACKEND",
        "ARCHIVE_BUCKET",
        "WORKER_CONCURRENCY",
        "ENRICHMENT_PLUGINS",
        "LEDGER_TTL_SECS",
        "DDL_BATCH_SIZE",
    ];

    fn clear() {
        for var in VARS {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear();
        std::env::set_var("CENTRALIZED_BUCKET", "lake");
        let config = EngineConfig::load().unwrap();
        assert_eq!(config.centralized_prefix, DEFAULT_CENTRALIZED_PREFIX);
        assert_eq!(config.archive_bucket, "lake");
        assert_eq!(config.catalog.output_location, "s3://lake/athena-results/");
        assert_eq!(config.catalog.backend, CatalogBackend::Athena);
        assert_eq!(config.ledger_ttl_secs, 2_592_000);
        assert_eq!(config.worker_concurrency, 8);
        assert_eq!(config.catalog.ddl_batch_size, 100);
        assert_eq!(
            config.enrichment_plugins,
            vec![EnrichmentPlugin::GeoIp, EnrichmentPlugin::UserAgent]
        );
        clear();
    }

    #[test]
    #[serial]
    fn test_rejects_bad_values() {
        clear();
        std::env::set_var("WORKER_CONCURRENCY", "0");
        assert!(EngineConfig::load().unwrap_err().is_validation());
        clear();

        std::env::set_var("ENRICHMENT_PLUGINS", "geo_ip,weather");
        assert!(matches!(EngineConfig::load().unwrap_err(), EngineError::Config(_)));
        clear();

        std::env::set_var("CATALOG_BACKEND", "trino");
        assert!(matches!(EngineConfig::load().unwrap_err(), EngineError::Config(_)));
        clear();

        std::env::set_var("LEDGER_TTL_SECS", "soon");
        assert!(EngineConfig::load().is_err());
        clear();
    }

    #[test]
    fn test_local_config_is_valid() {
        let config = EngineConfig::local("staging", "lake");
        config.validate().unwrap();
        assert_eq!(config.catalog.context().database, "centralized");
    }
}
