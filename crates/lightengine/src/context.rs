//! Shared clients of one engine process
//!
//! Clients are built once per invocation and handed to the stages by
//! reference.

use crate::config::{CatalogBackend, EngineConfig};
use crate::db::{create_pool, migrate};
use crate::enrichment::{Enricher, GeoIpDatabase};
use crate::ledger::{Ledger, MemoryLedgerStore, PostgresLedgerStore};
use crate::meta::{MemoryMetaStore, MetaStore, PostgresMetaStore};
use crate::notify::{LogNotifier, Notifier, WebhookNotifier};
use crate::partition::{AthenaClient, MemoryCatalog, QueryExecutor};
use crate::storage::{BatchEngine, ObjectStore, S3ObjectStore};
use lightengine_common::{Backoff, Result};
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Clone)]
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn ObjectStore>,
    pub batch: BatchEngine,
    pub catalog: Arc<dyn QueryExecutor>,
    pub ledger: Ledger,
    pub meta: Arc<dyn MetaStore>,
    pub enricher: Arc<Enricher>,
    pub notifier: Arc<dyn Notifier>,
    pub backoff: Backoff,
}

impl EngineContext {
    /// Wire the given collaborators; the enricher has no geo database.
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ObjectStore>,
        catalog: Arc<dyn QueryExecutor>,
        ledger: Ledger,
        meta: Arc<dyn MetaStore>,
    ) -> Self {
        let batch = BatchEngine::new(Arc::clone(&store), config.worker_concurrency);
        let enricher = Arc::new(Enricher::new(config.enrichment_plugins.iter().copied(), None));
        Self {
            config,
            store,
            batch,
            catalog,
            ledger,
            meta,
            enricher,
            notifier: Arc::new(LogNotifier),
            backoff: Backoff::default(),
        }
    }

    pub fn with_enricher(mut self, enricher: Enricher) -> Self {
        self.enricher = Arc::new(enricher);
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Build every client from configuration.
    pub async fn from_config(config: EngineConfig) -> Result<Self> {
        let store: Arc<dyn ObjectStore> = Arc::new(S3ObjectStore::new(config.storage.clone()).await?);

        let catalog: Arc<dyn QueryExecutor> = match config.catalog.backend {
            CatalogBackend::Athena => {
                Arc::new(AthenaClient::new(&config.storage, config.catalog.endpoint.as_deref()).await)
            }
            CatalogBackend::Memory => {
                warn!("Using the in-memory catalog; partitions are not persisted");
                Arc::new(MemoryCatalog::new())
            }
        };

        let (ledger, meta): (Ledger, Arc<dyn MetaStore>) = match &config.database {
            Some(db) => {
                let pool = create_pool(db).await?;
                migrate(&pool).await?;
                (
                    Ledger::new(Arc::new(PostgresLedgerStore::new(pool.clone())), config.ledger_ttl_secs),
                    Arc::new(PostgresMetaStore::new(pool)),
                )
            }
            None => {
                info!("No database configured; ledger is kept in memory");
                let meta = match &config.pipelines_file {
                    Some(path) => MemoryMetaStore::from_file(path)?,
                    None => MemoryMetaStore::default(),
                };
                (
                    Ledger::new(Arc::new(MemoryLedgerStore::new()), config.ledger_ttl_secs),
                    Arc::new(meta),
                )
            }
        };

        let geo_ip = match &config.geoip_database_path {
            Some(path) => Some(Arc::new(GeoIpDatabase::open(path)?)),
            None => None,
        };
        let enricher = Enricher::new(config.enrichment_plugins.iter().copied(), geo_ip);

        let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
            Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
            None => Arc::new(LogNotifier),
        };

        Ok(Self::new(config, store, catalog, ledger, meta)
            .with_enricher(enricher)
            .with_notifier(notifier))
    }
}
