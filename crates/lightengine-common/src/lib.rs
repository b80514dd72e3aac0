//! Light Engine Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging and retry utilities for the Light Engine
//! workspace.
//!
//! - **Error Handling**: [`EngineError`] and the [`Result`] alias
//! - **Logging**: global `tracing` subscriber setup
//! - **Retry**: exponential and jittered backoff schedules

pub mod error;
pub mod logging;
pub mod retry;

// Re-export commonly used types
pub use error::{EngineError, Result};
pub use retry::Backoff;
