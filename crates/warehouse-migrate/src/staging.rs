//! Intermediate staging storage between extraction and load.
//!
//! Staged data lives under deterministic paths derived from table name and
//! window bounds, so re-running an extraction overwrites its own partition
//! and concurrent tables never collide. Two implementations ship with the
//! crate: a filesystem store (JSON-lines, one file per partition) and an
//! in-memory store for tests.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PipelineError, Result};
use crate::job::Window;
use crate::value::Row;

/// Batch size used when streaming a partition back out of the store.
const READ_BATCH_ROWS: usize = 1024;

/// Reference to one staged partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedPartition {
    /// Source table the data came from.
    pub table: String,

    /// Window the partition covers.
    pub window: Window,

    /// Location inside the staging store.
    pub location: String,

    /// Hex SHA-256 streaming checksum over canonical row bytes.
    pub checksum: String,

    /// Rows staged.
    pub row_count: i64,
}

/// Deterministic staging location for one (table, window) partition.
pub fn partition_path(table: &str, window: &Window) -> String {
    format!("{}/{}", table, window.token())
}

/// Abstraction over intermediate object storage.
#[async_trait]
pub trait StagingStore: Send + Sync {
    /// Begin a partition at `path`, discarding any previous content so
    /// re-runs overwrite rather than duplicate.
    async fn create(&self, path: &str) -> Result<()>;

    /// Append a batch of rows to the partition at `path`.
    async fn append(&self, path: &str, rows: &[Row]) -> Result<()>;

    /// Stream the partition back as batches of rows.
    async fn read(&self, path: &str) -> Result<mpsc::Receiver<Result<Vec<Row>>>>;

    /// Delete the partition. Deleting a missing path is not an error.
    async fn delete(&self, path: &str) -> Result<()>;

    /// Whether a partition exists at `path`.
    async fn exists(&self, path: &str) -> Result<bool>;
}

/// Filesystem-backed staging store; each partition is one `.jsonl` file.
pub struct FsStagingStore {
    root: PathBuf,
}

impl FsStagingStore {
    /// Create a store rooted at `root` (created if missing).
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        std::fs::create_dir_all(root.as_ref())?;
        Ok(Self {
            root: root.as_ref().to_path_buf(),
        })
    }

    fn file_path(&self, path: &str) -> PathBuf {
        self.root.join(format!("{}.jsonl", path))
    }
}

#[async_trait]
impl StagingStore for FsStagingStore {
    async fn create(&self, path: &str) -> Result<()> {
        let file = self.file_path(path);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        // Truncates on re-run, giving overwrite semantics.
        std::fs::File::create(&file)?;
        debug!("staging: created partition at {:?}", file);
        Ok(())
    }

    async fn append(&self, path: &str, rows: &[Row]) -> Result<()> {
        let file = self.file_path(path);
        let mut handle = std::fs::OpenOptions::new().append(true).open(&file)?;
        let mut buf = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut buf, row)?;
            buf.push(b'\n');
        }
        handle.write_all(&buf)?;
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<mpsc::Receiver<Result<Vec<Row>>>> {
        let file = self.file_path(path);
        let location = path.to_string();
        let (tx, rx) = mpsc::channel(8);

        tokio::task::spawn_blocking(move || {
            let handle = match std::fs::File::open(&file) {
                Ok(h) => h,
                Err(e) => {
                    let _ = tx.blocking_send(Err(PipelineError::staging(
                        &location,
                        format!("open failed: {}", e),
                    )));
                    return;
                }
            };

            let reader = BufReader::new(handle);
            let mut batch = Vec::with_capacity(READ_BATCH_ROWS);
            for line in reader.lines() {
                let row: Result<Row> = line
                    .map_err(PipelineError::from)
                    .and_then(|l| serde_json::from_str(&l).map_err(PipelineError::from));
                match row {
                    Ok(row) => {
                        batch.push(row);
                        if batch.len() >= READ_BATCH_ROWS
                            && tx.blocking_send(Ok(std::mem::take(&mut batch))).is_err()
                        {
                            return;
                        }
                    }
                    Err(e) => {
                        let _ = tx.blocking_send(Err(PipelineError::staging(
                            &location,
                            format!("corrupt row: {}", e),
                        )));
                        return;
                    }
                }
            }
            if !batch.is_empty() {
                let _ = tx.blocking_send(Ok(batch));
            }
        });

        Ok(rx)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let file = self.file_path(path);
        match std::fs::remove_file(&file) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.file_path(path).exists())
    }
}

/// In-memory staging store for tests and local experiments.
#[derive(Default)]
pub struct MemoryStagingStore {
    files: RwLock<HashMap<String, Vec<Row>>>,
}

impl MemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently staged at `path`, if any. Test helper.
    pub fn rows_at(&self, path: &str) -> Option<Vec<Row>> {
        self.files
            .read()
            .expect("staging lock poisoned")
            .get(path)
            .cloned()
    }
}

#[async_trait]
impl StagingStore for MemoryStagingStore {
    async fn create(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .expect("staging lock poisoned")
            .insert(path.to_string(), Vec::new());
        Ok(())
    }

    async fn append(&self, path: &str, rows: &[Row]) -> Result<()> {
        let mut files = self.files.write().expect("staging lock poisoned");
        let partition = files
            .get_mut(path)
            .ok_or_else(|| PipelineError::staging(path, "partition not created"))?;
        partition.extend_from_slice(rows);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<mpsc::Receiver<Result<Vec<Row>>>> {
        let rows = self
            .rows_at(path)
            .ok_or_else(|| PipelineError::staging(path, "partition not found"))?;

        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(async move {
            for chunk in rows.chunks(READ_BATCH_ROWS) {
                if tx.send(Ok(chunk.to_vec())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.files
            .write()
            .expect("staging lock poisoned")
            .remove(path);
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self
            .files
            .read()
            .expect("staging lock poisoned")
            .contains_key(path))
    }
}
