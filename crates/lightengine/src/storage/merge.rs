//! Concatenation of many small objects into one
//!
//! Sources are downloaded into a scratch directory that is removed when the
//! merge returns, on success or failure. The encoding of each file is read
//! from its first bytes, never from its name, and one batch must share a
//! single encoding.

use flate2::read::MultiGzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use futures::stream::{self, StreamExt};
use lightengine_common::{EngineError, Result};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::{debug, info, instrument, warn};

use super::batch::{BatchEngine, CopyOptions, ObjectLocation, ReplicationTask};

const PARQUET_MAGIC: &[u8] = b"PAR1";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Parquet,
    Gzip,
    Plain,
}

impl Encoding {
    pub fn detect(header: &[u8]) -> Self {
        if header.starts_with(PARQUET_MAGIC) {
            Encoding::Parquet
        } else if header.starts_with(GZIP_MAGIC) {
            Encoding::Gzip
        } else {
            Encoding::Plain
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Encoding::Parquet => "application/vnd.apache.parquet",
            Encoding::Gzip => "application/gzip",
            Encoding::Plain => "text/plain",
        }
    }
}

#[instrument(skip(engine, tasks), fields(tasks = tasks.len()))]
pub(super) async fn merge_objects(
    engine: &BatchEngine,
    tasks: &[ReplicationTask],
    delete_on_success: bool,
) -> Result<ObjectLocation> {
    let first = tasks
        .first()
        .ok_or_else(|| EngineError::Validation("merge needs at least one task".to_string()))?;
    let destination = first.destination.clone();

    if tasks.len() == 1 {
        let options = CopyOptions {
            delete_on_success,
            transform: None,
        };
        let report = engine.copy(vec![first.clone()], &options).await;
        return match report.failures.into_iter().next() {
            Some(failure) => Err(EngineError::Storage(failure.error)),
            None => Ok(destination),
        };
    }

    let scratch = tempfile::Builder::new().prefix("lightengine-merge-").tempdir()?;
    let scratch_path = scratch.path().to_path_buf();

    let downloads: Vec<Result<PathBuf>> = stream::iter(tasks.iter().enumerate())
        .map(|(index, task)| {
            let path = scratch_path.join(format!("part-{:05}", index));
            async move {
                let store = engine.source_store(&task.source).await?;
                let body = store.get(&task.source.bucket, &task.source.key).await?;
                tokio::fs::write(&path, body).await?;
                Ok(path)
            }
        })
        .buffered(engine.concurrency())
        .collect()
        .await;
    let paths = downloads.into_iter().collect::<Result<Vec<_>>>()?;

    let (encoding, merged) = tokio::task::spawn_blocking(move || merge_files(&paths))
        .await
        .map_err(|e| EngineError::Storage(format!("merge worker failed: {}", e)))??;

    let size = merged.len();
    engine
        .store()
        .put(&destination.bucket, &destination.key, merged, Some(encoding.content_type()))
        .await?;
    info!(destination = %destination, ?encoding, size, "Merged objects");

    if delete_on_success {
        delete_sources(engine, tasks, &destination).await;
    }

    drop(scratch);
    Ok(destination)
}

async fn delete_sources(engine: &BatchEngine, tasks: &[ReplicationTask], destination: &ObjectLocation) {
    let (direct, assumed): (Vec<_>, Vec<_>) = tasks
        .iter()
        .filter(|t| t.source.location() != *destination)
        .partition(|t| t.source.role.is_none());

    let report = engine
        .delete(direct.iter().map(|t| t.source.location()).collect())
        .await;
    if report.failed > 0 {
        warn!(failed = report.failed, "Merged sources not deleted");
    }

    for task in assumed {
        let keys = [task.source.key.clone()];
        let result = match engine.source_store(&task.source).await {
            Ok(store) => store.delete_many(&task.source.bucket, &keys).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(source = %task.source.location(), error = %e, "Merged source not deleted");
        }
    }
}

/// Merge local files of one encoding into a single body.
pub fn merge_files(paths: &[PathBuf]) -> Result<(Encoding, Vec<u8>)> {
    let mut encodings = Vec::with_capacity(paths.len());
    for path in paths {
        let mut header = Vec::with_capacity(4);
        File::open(path)?.take(4).read_to_end(&mut header)?;
        encodings.push(Encoding::detect(&header));
    }

    let encoding = *encodings
        .first()
        .ok_or_else(|| EngineError::Validation("nothing to merge".to_string()))?;
    if let Some(other) = encodings.iter().find(|e| **e != encoding) {
        return Err(EngineError::Storage(format!(
            "cannot merge mixed encodings {:?} and {:?}",
            encoding, other
        )));
    }
    debug!(?encoding, files = paths.len(), "Merging local files");

    let merged = match encoding {
        Encoding::Parquet => merge_parquet(paths)?,
        Encoding::Gzip => merge_gzip(paths)?,
        Encoding::Plain => merge_plain(paths)?,
    };
    Ok((encoding, merged))
}

fn parquet_error(context: &str) -> impl Fn(parquet::errors::ParquetError) -> EngineError + '_ {
    move |e| EngineError::Storage(format!("{}: {}", context, e))
}

fn writer_properties() -> WriterProperties {
    let created_by = KeyValue {
        key: "created_by".to_string(),
        value: Some("lightengine".to_string()),
    };
    WriterProperties::builder()
        .set_compression(parquet::basic::Compression::SNAPPY)
        .set_key_value_metadata(Some(vec![created_by]))
        .build()
}

fn merge_parquet(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut writer: Option<ArrowWriter<Vec<u8>>> = None;

    for path in paths {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)
            .map_err(parquet_error("parquet reader init failed"))?;
        if writer.is_none() {
            writer = Some(
                ArrowWriter::try_new(Vec::new(), builder.schema().clone(), Some(writer_properties()))
                    .map_err(parquet_error("parquet writer init failed"))?,
            );
        }
        let reader = builder
            .build()
            .map_err(parquet_error("parquet reader build failed"))?;

        if let Some(writer) = writer.as_mut() {
            for batch in reader {
                let batch = batch
                    .map_err(|e| EngineError::Storage(format!("parquet read batch failed: {}", e)))?;
                writer
                    .write(&batch)
                    .map_err(parquet_error("parquet write failed"))?;
            }
        }
    }

    writer
        .ok_or_else(|| EngineError::Validation("nothing to merge".to_string()))?
        .into_inner()
        .map_err(parquet_error("parquet close failed"))
}

/// Writer that remembers the last byte passed through it.
struct LastByte<W> {
    inner: W,
    last: Option<u8>,
}

impl<W: Write> Write for LastByte<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        if written > 0 {
            self.last = Some(buf[written - 1]);
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Decompressed bytes are concatenated as-is; each member ends on a newline.
fn merge_gzip(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut output = LastByte {
        inner: GzEncoder::new(Vec::new(), Compression::default()),
        last: None,
    };
    for path in paths {
        output.last = None;
        io::copy(&mut MultiGzDecoder::new(File::open(path)?), &mut output)?;
        if output.last.is_some_and(|byte| byte != b'\n') {
            output.write_all(b"\n")?;
        }
    }
    Ok(output.inner.finish()?)
}

fn merge_plain(paths: &[PathBuf]) -> Result<Vec<u8>> {
    let mut merged = Vec::new();
    for path in paths {
        let body = std::fs::read(path)?;
        if body.is_empty() {
            continue;
        }
        merged.extend_from_slice(&body);
        if !body.ends_with(b"\n") {
            merged.push(b'\n');
        }
    }
    Ok(merged)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::storage::MemoryObjectStore;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn gzip(text: &str) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(text.as_bytes()).unwrap();
        encoder.finish().unwrap()
    }

    fn gunzip(data: &[u8]) -> String {
        let mut text = String::new();
        MultiGzDecoder::new(data).read_to_string(&mut text).unwrap();
        text
    }

    fn parquet(ids: &[i64], names: &[&str]) -> Vec<u8> {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, false),
        ]));
        let batch = RecordBatch::try_new(
            schema.clone(),
            vec![
                Arc::new(Int64Array::from(ids.to_vec())),
                Arc::new(StringArray::from(names.to_vec())),
            ],
        )
        .unwrap();
        let mut writer = ArrowWriter::try_new(Vec::new(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.into_inner().unwrap()
    }

    fn tasks(count: usize) -> Vec<ReplicationTask> {
        (0..count)
            .map(|i| {
                ReplicationTask::new(
                    ObjectLocation::new("lake", format!("t/ds=1/part-{}", i)),
                    ObjectLocation::new("lake", "t/ds=1/merged"),
                )
            })
            .collect()
    }

    #[test]
    fn test_detect_encoding() {
        assert_eq!(Encoding::detect(b"PAR1...."), Encoding::Parquet);
        assert_eq!(Encoding::detect(&[0x1f, 0x8b, 0x08]), Encoding::Gzip);
        assert_eq!(Encoding::detect(b"{\"a\":1}"), Encoding::Plain);
        assert_eq!(Encoding::detect(b""), Encoding::Plain);
    }

    #[tokio::test]
    async fn test_merge_gzip_deletes_sources() {
        let store = MemoryObjectStore::new();
        store.insert("lake", "t/ds=1/part-0", gzip("a\nb\n"));
        store.insert("lake", "t/ds=1/part-1", gzip("c"));
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        let destination = engine.merge(&tasks(2), true).await.unwrap();
        assert_eq!(destination.key, "t/ds=1/merged");
        assert_eq!(gunzip(&store.object("lake", "t/ds=1/merged").unwrap()), "a\nb\nc\n");
        assert_eq!(store.keys("lake"), vec!["t/ds=1/merged"]);
    }

    #[tokio::test]
    async fn test_merge_gzip_keeps_non_utf8_bytes() {
        let store = MemoryObjectStore::new();
        let latin1 = b"caf\xe9\n\xff\xfe raw";
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(latin1).unwrap();
        store.insert("lake", "t/ds=1/part-0", encoder.finish().unwrap());
        store.insert("lake", "t/ds=1/part-1", gzip("ok\n"));
        store.insert("lake", "t/ds=1/part-2", gzip(""));
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        engine.merge(&tasks(3), false).await.unwrap();
        let mut merged = Vec::new();
        MultiGzDecoder::new(store.object("lake", "t/ds=1/merged").unwrap().as_slice())
            .read_to_end(&mut merged)
            .unwrap();
        assert_eq!(merged, b"caf\xe9\n\xff\xfe raw\nok\n");
    }

    #[tokio::test]
    async fn test_merge_plain_adds_trailing_newlines() {
        let store = MemoryObjectStore::new();
        store.insert("lake", "t/ds=1/part-0", "one");
        store.insert("lake", "t/ds=1/part-1", "two\n");
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        engine.merge(&tasks(2), false).await.unwrap();
        assert_eq!(store.object("lake", "t/ds=1/merged").unwrap(), b"one\ntwo\n");
        assert!(store.contains("lake", "t/ds=1/part-0"));
    }

    #[tokio::test]
    async fn test_merge_parquet() {
        let store = MemoryObjectStore::new();
        store.insert("lake", "t/ds=1/part-0", parquet(&[1, 2], &["a", "b"]));
        store.insert("lake", "t/ds=1/part-1", parquet(&[3], &["c"]));
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        engine.merge(&tasks(2), true).await.unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("merged.parquet");
        std::fs::write(&path, store.object("lake", "t/ds=1/merged").unwrap()).unwrap();
        let rows: usize = ParquetRecordBatchReaderBuilder::try_new(File::open(&path).unwrap())
            .unwrap()
            .build()
            .unwrap()
            .map(|b| b.unwrap().num_rows())
            .sum();
        assert_eq!(rows, 3);
    }

    #[tokio::test]
    async fn test_mixed_encodings_abort_batch() {
        let store = MemoryObjectStore::new();
        store.insert("lake", "t/ds=1/part-0", gzip("a\n"));
        store.insert("lake", "t/ds=1/part-1", "plain\n");
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);

        assert!(engine.merge(&tasks(2), true).await.is_err());
        assert!(!store.contains("lake", "t/ds=1/merged"));
        assert!(store.contains("lake", "t/ds=1/part-0"));
        assert!(store.contains("lake", "t/ds=1/part-1"));
    }

    #[tokio::test]
    async fn test_single_task_merge_is_copy() {
        let merged_store = MemoryObjectStore::new();
        let copied_store = MemoryObjectStore::new();
        for store in [&merged_store, &copied_store] {
            store.insert("lake", "t/ds=1/part-0", gzip("only\n"));
        }
        let task = tasks(1);

        BatchEngine::new(Arc::new(merged_store.clone()), 1)
            .merge(&task, true)
            .await
            .unwrap();
        BatchEngine::new(Arc::new(copied_store.clone()), 1)
            .copy(task, &CopyOptions { delete_on_success: true, transform: None })
            .await;

        assert_eq!(merged_store.keys("lake"), copied_store.keys("lake"));
        assert_eq!(
            merged_store.object("lake", "t/ds=1/merged"),
            copied_store.object("lake", "t/ds=1/merged")
        );
    }

    #[tokio::test]
    async fn test_missing_source_fails_batch() {
        let store = MemoryObjectStore::new();
        store.insert("lake", "t/ds=1/part-0", "one\n");
        let engine = BatchEngine::new(Arc::new(store.clone()), 2);
        assert!(engine.merge(&tasks(2), true).await.is_err());
        assert!(store.contains("lake", "t/ds=1/part-0"));
    }
}
