//! Shared fixtures for integration tests
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use flate2::write::GzEncoder;
use flate2::Compression;
use lightengine::config::EngineConfig;
use lightengine::context::EngineContext;
use lightengine::ledger::Ledger;
use lightengine::meta::{MemoryMetaStore, PipelineMeta};
use lightengine::partition::MemoryCatalog;
use lightengine::storage::MemoryObjectStore;
use lightengine_common::Backoff;
use serde_json::json;
use std::io::Write;
use std::sync::Arc;

pub const STAGING_BUCKET: &str = "staging";
pub const CENTRALIZED_BUCKET: &str = "centralized";

pub const ALB_LINE: &str = r#"https 2023-03-11T20:00:01.123456Z app/my-alb/50dc6c495c0c9188 192.168.131.39:2817 10.0.0.1:80 0.000 0.001 0.000 200 200 34 366 "GET https://www.example.com:443/ HTTP/1.1" "curl/7.46.0" ECDHE-RSA-AES128-GCM-SHA256 TLSv1.2 arn:aws:elasticloadbalancing:us-east-2:123456789012:targetgroup/my-targets/73e2d6bc24d8a067 "Root=1-58337281-1d84f3d73c47ec4e58577259" "www.example.com" "arn:aws:acm:us-east-2:123456789012:certificate/12345678-1234-1234-1234-123456789012" 1 2023-03-11T20:00:00.123000Z "forward" "-" "-" "10.0.0.1:80" "200" "-" "-""#;

/// An engine wired entirely to in-memory collaborators
pub struct TestEngine {
    pub ctx: EngineContext,
    pub store: MemoryObjectStore,
    pub catalog: MemoryCatalog,
    pub meta: MemoryMetaStore,
}

pub fn engine() -> TestEngine {
    let store = MemoryObjectStore::new();
    let catalog = MemoryCatalog::new();
    let meta = MemoryMetaStore::default();
    let ctx = EngineContext::new(
        EngineConfig::local(STAGING_BUCKET, CENTRALIZED_BUCKET),
        Arc::new(store.clone()),
        Arc::new(catalog.clone()),
        Ledger::in_memory(),
        Arc::new(meta.clone()),
    )
    .with_backoff(Backoff::immediate(3));
    TestEngine {
        ctx,
        store,
        catalog,
        meta,
    }
}

pub fn alb_pipeline(id: &str) -> PipelineMeta {
    serde_json::from_value(json!({
        "pipelineId": id,
        "source": {
            "type": "alb",
            "table": {"schema": {}, "dataFormat": "", "tableProperties": {}, "serializationProperties": {}},
            "enrichmentPlugins": ["user_agent"]
        },
        "destination": {
            "location": {"bucket": CENTRALIZED_BUCKET, "prefix": "datalake"},
            "database": {"name": "centralized"},
            "table": {
                "name": "alb",
                "schema": {},
                "partitions": ["__ds__", "region", "__execution_name__"],
                "partitionValues": {"region": "us-east-1"}
            }
        },
        "scheduler": {},
        "staging": {"prefix": "AWSLogs/111122223333/alb"}
    }))
    .unwrap()
}

pub fn gzip(text: &str) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(text.as_bytes()).unwrap();
    encoder.finish().unwrap()
}
