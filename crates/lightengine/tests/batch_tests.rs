//! Object storage batch engine over the in-memory store
//!
//! These tests verify:
//! - Per-task failure isolation in copy
//! - Merge of a single task degenerates to a copy
//! - Merged gzip objects stay readable as one stream

mod common;

use common::gzip;
use flate2::read::MultiGzDecoder;
use lightengine::storage::{BatchEngine, CopyOptions, MemoryObjectStore, ObjectLocation, ReplicationTask};
use std::io::Read;
use std::sync::Arc;

fn task(source: &str, destination: &str) -> ReplicationTask {
    ReplicationTask::new(ObjectLocation::new("src", source), ObjectLocation::new("dst", destination))
}

fn setup() -> (MemoryObjectStore, BatchEngine) {
    let store = MemoryObjectStore::new();
    let engine = BatchEngine::new(Arc::new(store.clone()), 2);
    (store, engine)
}

#[tokio::test]
async fn test_copy_partial_failure() {
    let (store, engine) = setup();
    for key in ["a", "b", "d"] {
        store.insert("src", key, key.as_bytes().to_vec());
    }
    let tasks = vec![
        task("a", "out/a"),
        task("b", "out/b"),
        task("c", "out/c"),
        task("d", "out/d"),
        task("e", "out/e"),
    ];

    let options = CopyOptions {
        delete_on_success: true,
        transform: None,
    };
    let report = engine.copy(tasks, &options).await;

    assert_eq!((report.succeeded, report.failed), (3, 2));
    let mut failed: Vec<&str> = report.failures.iter().map(|f| f.task.source.key.as_str()).collect();
    failed.sort_unstable();
    assert_eq!(failed, vec!["c", "e"]);
    assert_eq!(store.keys("dst"), vec!["out/a", "out/b", "out/d"]);
    assert!(store.keys("src").is_empty());
}

#[tokio::test]
async fn test_single_task_merge_is_a_copy() {
    let (store, engine) = setup();
    store.insert("src", "only.log", "line\n");

    let destination = engine.merge(&[task("only.log", "merged.log")], false).await.unwrap();

    assert_eq!(destination, ObjectLocation::new("dst", "merged.log"));
    assert_eq!(store.object("dst", "merged.log").unwrap(), b"line\n".to_vec());
    assert!(store.contains("src", "only.log"));
}

#[tokio::test]
async fn test_merge_gzip_members() {
    let (store, engine) = setup();
    store.insert("src", "1.json.gz", gzip("{\"n\":1}\n"));
    store.insert("src", "2.json.gz", gzip("{\"n\":2}\n"));

    let tasks = vec![task("1.json.gz", "merged.json.gz"), task("2.json.gz", "merged.json.gz")];
    engine.merge(&tasks, true).await.unwrap();

    let merged = store.object("dst", "merged.json.gz").unwrap();
    let mut text = String::new();
    MultiGzDecoder::new(merged.as_slice()).read_to_string(&mut text).unwrap();
    assert_eq!(text, "{\"n\":1}\n{\"n\":2}\n");
    assert!(store.keys("src").is_empty());
}

#[tokio::test]
async fn test_merge_without_tasks_is_rejected() {
    let (_, engine) = setup();
    assert!(engine.merge(&[], false).await.unwrap_err().is_validation());
}
