//! In-memory reference warehouse.
//!
//! Implements both connector traits over plain vectors of rows. It backs
//! the test suite and local experiments, and doubles as a worked example of
//! the connector contracts: window-restricted extraction, idempotent loads
//! with batch markers, and order-independent aggregates. Fault injection
//! hooks simulate the failure modes the coordinator must survive.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

use crate::checksum::{combine, value_hash};
use crate::connector::{AggregateSnapshot, LoadResult, SourceConnector, TargetConnector};
use crate::error::{PipelineError, Result};
use crate::job::Window;
use crate::staging::{StagedPartition, StagingStore};
use crate::value::{Row, Value};

const EXTRACT_BATCH_ROWS: usize = 512;

/// One row plus the load-batch marker that brought it in (None for seeds).
#[derive(Debug, Clone)]
struct TaggedRow {
    batch: Option<String>,
    row: Row,
}

#[derive(Debug)]
struct MemoryTable {
    columns: Vec<String>,
    rows: Vec<TaggedRow>,
}

impl MemoryTable {
    fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }
}

#[derive(Default)]
struct Faults {
    transient_extract_failures: AtomicU32,
    partial_load_once: RwLock<HashSet<String>>,
    load_row_loss: RwLock<HashMap<String, usize>>,
    load_delay: RwLock<HashMap<String, Duration>>,
}

/// In-memory warehouse usable as source, target, or both.
pub struct MemoryWarehouse {
    tables: RwLock<HashMap<String, MemoryTable>>,
    staging: Arc<dyn StagingStore>,
    completed_loads: RwLock<HashMap<(String, String), i64>>,
    faults: Faults,
}

impl MemoryWarehouse {
    /// Create a warehouse that reads staged partitions from `staging`.
    pub fn new(staging: Arc<dyn StagingStore>) -> Self {
        Self {
            tables: RwLock::new(HashMap::new()),
            staging,
            completed_loads: RwLock::new(HashMap::new()),
            faults: Faults::default(),
        }
    }

    /// Create an empty table with the given column names.
    pub fn create_table(&self, name: &str, columns: Vec<String>) {
        self.tables.write().expect("table lock poisoned").insert(
            name.to_string(),
            MemoryTable {
                columns,
                rows: Vec::new(),
            },
        );
    }

    /// Seed rows directly (no batch marker), e.g. source data in tests.
    pub fn insert_rows(&self, name: &str, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.write().expect("table lock poisoned");
        let table = tables
            .get_mut(name)
            .ok_or_else(|| PipelineError::State(format!("unknown table {}", name)))?;
        table
            .rows
            .extend(rows.into_iter().map(|row| TaggedRow { batch: None, row }));
        Ok(())
    }

    /// Total rows currently in a table.
    pub fn row_count(&self, name: &str) -> i64 {
        self.tables
            .read()
            .expect("table lock poisoned")
            .get(name)
            .map(|t| t.rows.len() as i64)
            .unwrap_or(0)
    }

    // ----- fault injection -----

    /// Fail the next `n` extraction calls with a transient error.
    pub fn fail_next_extracts(&self, n: u32) {
        self.faults
            .transient_extract_failures
            .store(n, Ordering::SeqCst);
    }

    /// Make the next load into `table` apply half its rows, then fail
    /// transiently without committing.
    pub fn fail_next_load_partial(&self, table: &str) {
        self.faults
            .partial_load_once
            .write()
            .expect("fault lock poisoned")
            .insert(table.to_string());
    }

    /// Silently drop `n` rows from every load into `table` while still
    /// reporting a full load. Only validation can catch this.
    pub fn lose_rows_on_load(&self, table: &str, n: usize) {
        self.faults
            .load_row_loss
            .write()
            .expect("fault lock poisoned")
            .insert(table.to_string(), n);
    }

    /// Delay every load into `table`, for scheduling tests.
    pub fn set_load_delay(&self, table: &str, delay: Duration) {
        self.faults
            .load_delay
            .write()
            .expect("fault lock poisoned")
            .insert(table.to_string(), delay);
    }

    fn take_extract_failure(&self) -> bool {
        self.faults
            .transient_extract_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok()
    }

    fn discard_uncommitted(&self, table: &str, key: &str) {
        let mut tables = self.tables.write().expect("table lock poisoned");
        if let Some(t) = tables.get_mut(table) {
            t.rows.retain(|r| r.batch.as_deref() != Some(key));
        }
    }

    fn apply_rows(&self, table: &str, key: &str, rows: Vec<Row>) -> Result<()> {
        let mut tables = self.tables.write().expect("table lock poisoned");
        let t = tables
            .get_mut(table)
            .ok_or_else(|| PipelineError::load_permanent(table, "unknown target table"))?;
        t.rows.extend(rows.into_iter().map(|row| TaggedRow {
            batch: Some(key.to_string()),
            row,
        }));
        Ok(())
    }

    fn aggregate_table(
        &self,
        table: &str,
        partition_column: &str,
        window: &Window,
        columns: &[String],
    ) -> Result<AggregateSnapshot> {
        let tables = self.tables.read().expect("table lock poisoned");
        let t = tables
            .get(table)
            .ok_or_else(|| PipelineError::State(format!("unknown table {}", table)))?;
        let pidx = t.column_index(partition_column).ok_or_else(|| {
            PipelineError::State(format!(
                "table {} has no column {}",
                table, partition_column
            ))
        })?;

        let mut indices = Vec::with_capacity(columns.len());
        for column in columns {
            let idx = t.column_index(column).ok_or_else(|| {
                PipelineError::State(format!("table {} has no column {}", table, column))
            })?;
            indices.push((column.clone(), idx));
        }

        let mut row_count = 0i64;
        let mut hashes: BTreeMap<String, u64> =
            columns.iter().map(|c| (c.clone(), 0u64)).collect();

        for tagged in &t.rows {
            let in_window = matches!(
                tagged.row.get(pidx),
                Some(Value::Timestamp(ts)) if window.contains(ts)
            );
            if !in_window {
                continue;
            }
            row_count += 1;
            for (column, idx) in &indices {
                if let Some(value) = tagged.row.get(*idx) {
                    let acc = hashes.get_mut(column).expect("column pre-registered");
                    *acc = combine(*acc, value_hash(value));
                }
            }
        }

        Ok(AggregateSnapshot {
            row_count,
            column_hashes: hashes,
        })
    }
}

#[async_trait]
impl SourceConnector for MemoryWarehouse {
    fn extract_range(
        &self,
        table: &str,
        column: &str,
        window: &Window,
    ) -> mpsc::Receiver<Result<Vec<Row>>> {
        let (tx, rx) = mpsc::channel(4);

        if self.take_extract_failure() {
            let table = table.to_string();
            tokio::spawn(async move {
                let _ = tx
                    .send(Err(PipelineError::extraction_transient(
                        &table,
                        "simulated source timeout",
                    )))
                    .await;
            });
            return rx;
        }

        let snapshot: Result<Vec<Row>> = (|| {
            let tables = self.tables.read().expect("table lock poisoned");
            let t = tables.get(table).ok_or_else(|| {
                PipelineError::extraction_permanent(table, "unknown source table")
            })?;
            let pidx = t.column_index(column).ok_or_else(|| {
                PipelineError::extraction_permanent(
                    table,
                    format!("unknown partition column {}", column),
                )
            })?;
            Ok(t.rows
                .iter()
                .filter(|r| {
                    matches!(
                        r.row.get(pidx),
                        Some(Value::Timestamp(ts)) if window.contains(ts)
                    )
                })
                .map(|r| r.row.clone())
                .collect())
        })();

        tokio::spawn(async move {
            match snapshot {
                Ok(rows) => {
                    for chunk in rows.chunks(EXTRACT_BATCH_ROWS) {
                        if tx.send(Ok(chunk.to_vec())).await.is_err() {
                            return;
                        }
                    }
                }
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                }
            }
        });

        rx
    }

    async fn aggregate(
        &self,
        table: &str,
        partition_column: &str,
        window: &Window,
        columns: &[String],
    ) -> Result<AggregateSnapshot> {
        self.aggregate_table(table, partition_column, window, columns)
    }
}

#[async_trait]
impl TargetConnector for MemoryWarehouse {
    async fn load(
        &self,
        staged: &StagedPartition,
        table: &str,
        idempotency_key: &str,
    ) -> Result<LoadResult> {
        let delay = self
            .faults
            .load_delay
            .read()
            .expect("fault lock poisoned")
            .get(table)
            .copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        // A key whose load already committed is deduplicated.
        let prior = self
            .completed_loads
            .read()
            .expect("load registry poisoned")
            .get(&(table.to_string(), idempotency_key.to_string()))
            .copied();
        if let Some(rows_loaded) = prior {
            debug!(
                "{}: load batch {} already committed, deduplicating",
                table, idempotency_key
            );
            return Ok(LoadResult { rows_loaded });
        }

        let mut stream = self.staging.read(&staged.location).await?;
        let mut rows = Vec::new();
        while let Some(batch) = stream.recv().await {
            rows.extend(batch?);
        }

        // Leftovers from an interrupted load under this key are discarded
        // before re-applying.
        self.discard_uncommitted(table, idempotency_key);

        let partial = self
            .faults
            .partial_load_once
            .write()
            .expect("fault lock poisoned")
            .remove(table);
        if partial {
            let half = rows.len() / 2;
            self.apply_rows(table, idempotency_key, rows[..half].to_vec())?;
            return Err(PipelineError::load_transient(
                table,
                "simulated connection reset mid-batch",
            ));
        }

        let loss = self
            .faults
            .load_row_loss
            .read()
            .expect("fault lock poisoned")
            .get(table)
            .copied()
            .unwrap_or(0);
        let keep = rows.len().saturating_sub(loss);
        self.apply_rows(table, idempotency_key, rows[..keep].to_vec())?;

        self.completed_loads
            .write()
            .expect("load registry poisoned")
            .insert(
                (table.to_string(), idempotency_key.to_string()),
                staged.row_count,
            );

        Ok(LoadResult {
            rows_loaded: staged.row_count,
        })
    }

    async fn delete_by_load_batch(&self, table: &str, idempotency_key: &str) -> Result<()> {
        self.discard_uncommitted(table, idempotency_key);
        self.completed_loads
            .write()
            .expect("load registry poisoned")
            .remove(&(table.to_string(), idempotency_key.to_string()));
        Ok(())
    }

    async fn aggregate(
        &self,
        table: &str,
        partition_column: &str,
        window: &Window,
        columns: &[String],
    ) -> Result<AggregateSnapshot> {
        self.aggregate_table(table, partition_column, window, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging::MemoryStagingStore;
    use chrono::{TimeZone, Utc};

    fn window() -> Window {
        Window {
            start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap(),
        }
    }

    fn event_row(id: i64, hour: u32) -> Row {
        vec![
            Value::Int(id),
            Value::Text("read_online".into()),
            Value::Timestamp(Utc.with_ymd_and_hms(2025, 6, 1, hour, 0, 0).unwrap()),
        ]
    }

    fn columns() -> Vec<String> {
        vec!["event_id".into(), "event_type".into(), "event_ts".into()]
    }

    fn warehouse() -> (Arc<MemoryStagingStore>, MemoryWarehouse) {
        let staging = Arc::new(MemoryStagingStore::new());
        let wh = MemoryWarehouse::new(staging.clone());
        (staging, wh)
    }

    #[tokio::test]
    async fn test_extract_filters_on_window() {
        let (_, wh) = warehouse();
        wh.create_table("library.events", columns());
        wh.insert_rows(
            "library.events",
            vec![
                event_row(1, 6),
                event_row(2, 23),
                // Outside the window.
                vec![
                    Value::Int(3),
                    Value::Text("download".into()),
                    Value::Timestamp(Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap()),
                ],
            ],
        )
        .unwrap();

        let mut rx = wh.extract_range("library.events", "event_ts", &window());
        let mut rows = Vec::new();
        while let Some(batch) = rx.recv().await {
            rows.extend(batch.unwrap());
        }
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn test_extract_unknown_table_is_permanent() {
        let (_, wh) = warehouse();
        let mut rx = wh.extract_range("nope", "event_ts", &window());
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_injected_extract_failure_is_transient() {
        let (_, wh) = warehouse();
        wh.create_table("library.events", columns());
        wh.fail_next_extracts(1);

        let mut rx = wh.extract_range("library.events", "event_ts", &window());
        let err = rx.recv().await.unwrap().unwrap_err();
        assert!(err.is_transient());

        // Next call succeeds.
        let mut rx = wh.extract_range("library.events", "event_ts", &window());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_load_deduplicates_by_key() {
        let (staging, wh) = warehouse();
        wh.create_table("analytics.events", columns());

        staging.create("p").await.unwrap();
        staging
            .append("p", &[event_row(1, 1), event_row(2, 2)])
            .await
            .unwrap();
        let staged = StagedPartition {
            table: "library.events".into(),
            window: window(),
            location: "p".into(),
            checksum: String::new(),
            row_count: 2,
        };

        let first = wh.load(&staged, "analytics.events", "k1").await.unwrap();
        let second = wh.load(&staged, "analytics.events", "k1").await.unwrap();
        assert_eq!(first.rows_loaded, 2);
        assert_eq!(second.rows_loaded, 2);
        assert_eq!(wh.row_count("analytics.events"), 2);
    }

    #[tokio::test]
    async fn test_delete_by_load_batch_removes_rows() {
        let (staging, wh) = warehouse();
        wh.create_table("analytics.events", columns());

        staging.create("p").await.unwrap();
        staging.append("p", &[event_row(1, 1)]).await.unwrap();
        let staged = StagedPartition {
            table: "library.events".into(),
            window: window(),
            location: "p".into(),
            checksum: String::new(),
            row_count: 1,
        };

        wh.load(&staged, "analytics.events", "k1").await.unwrap();
        assert_eq!(wh.row_count("analytics.events"), 1);

        wh.delete_by_load_batch("analytics.events", "k1")
            .await
            .unwrap();
        assert_eq!(wh.row_count("analytics.events"), 0);
    }

    #[tokio::test]
    async fn test_aggregates_ignore_row_order() {
        let (_, source) = warehouse();
        let (_, target) = warehouse();
        source.create_table("t", columns());
        target.create_table("t", columns());

        let rows = vec![event_row(1, 1), event_row(2, 2), event_row(3, 3)];
        let mut reversed = rows.clone();
        reversed.reverse();

        source.insert_rows("t", rows).unwrap();
        target.insert_rows("t", reversed).unwrap();

        let cols = columns();
        let a = SourceConnector::aggregate(&source, "t", "event_ts", &window(), &cols)
            .await
            .unwrap();
        let b = SourceConnector::aggregate(&target, "t", "event_ts", &window(), &cols)
            .await
            .unwrap();
        assert_eq!(a, b);
    }
}
