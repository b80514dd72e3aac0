//! Command-line exit codes
//!
//! These tests verify:
//! - A bad job document is reported before configuration is read
//! - Out-of-range retention windows exit with the validation code
//! - Expired ledger rows can be purged from the command line

use std::io::Write;
use std::process::{Command, Output};
use tempfile::NamedTempFile;

fn job_file(body: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(body.as_bytes()).unwrap();
    file
}

fn lightengine(args: &[&str], env: &[(&str, &str)]) -> Output {
    let mut command = Command::new(env!("CARGO_BIN_EXE_lightengine"));
    command
        .args(args)
        .env_remove("DATABASE_URL")
        .env("CATALOG_BACKEND", "memory")
        .env("S3_REGION", "us-east-1")
        .env("S3_ACCESS_KEY", "test")
        .env("S3_SECRET_KEY", "test")
        .env("AWS_EC2_METADATA_DISABLED", "true");
    for (name, value) in env {
        command.env(name, value);
    }
    command.output().unwrap()
}

#[test]
fn test_bad_document_wins_over_bad_config() {
    let job = job_file(r#"{"olderThanDays": 30}"#);
    let output = lightengine(
        &["archive", "--job", job.path().to_str().unwrap()],
        &[("WORKER_CONCURRENCY", "0")],
    );

    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("pipelineId"), "stderr: {}", stderr);
    assert!(!stderr.contains("WORKER_CONCURRENCY"), "stderr: {}", stderr);
}

#[test]
fn test_huge_retention_exits_with_validation_code() {
    let job = job_file(r#"{"pipelineId": "p1", "olderThanDays": 200000000}"#);
    let output = lightengine(&["archive", "--job", job.path().to_str().unwrap()], &[]);

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("olderThanDays"));
}

#[test]
fn test_purge_ledger() {
    let output = lightengine(&["purge-ledger"], &[]);

    assert_eq!(output.status.code(), Some(0), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(report["purged"], 0);
}
