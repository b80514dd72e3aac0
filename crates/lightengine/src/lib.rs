//! Light Engine
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Batch log ingestion into a partitioned data lake.
//!
//! # Components
//!
//! - **Parsers**: normalize ALB, CloudFront, S3 access, WAF, VPC flow, RDS,
//!   audit trail, config snapshot and Lambda logs into flat records
//! - **Enrichment**: geo-IP and user-agent plugins behind an allow-list
//! - **Storage**: bounded-concurrency copy, merge, delete and list over an
//!   object store, plus bucket notification and policy reconciliation
//! - **Partitions**: partition keys, ADD/DROP DDL rendering and a catalog
//!   statement client
//! - **Ledger**: execution task records with TTL, parent/child trees and
//!   status aggregation
//! - **Stages**: Processor, Merger and Archiver drivers built on the above
//!
//! # Example
//!
//! ```no_run
//! use lightengine::config::EngineConfig;
//! use lightengine::context::EngineContext;
//! use lightengine::jobs::MergerJob;
//! use lightengine::stages::run_merger;
//!
//! #[tokio::main]
//! async fn main() -> lightengine_common::Result<()> {
//!     let ctx = EngineContext::from_config(EngineConfig::load()?).await?;
//!     let job = MergerJob {
//!         pipeline_id: "alb-pipeline".to_string(),
//!         ..MergerJob::default()
//!     };
//!     let report = run_merger(&ctx, job).await?;
//!     println!("{:?}", report.status);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod db;
pub mod enrichment;
pub mod jobs;
pub mod ledger;
pub mod meta;
pub mod notify;
pub mod parser;
pub mod partition;
pub mod stages;
pub mod storage;
