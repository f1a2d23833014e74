//! Warehouse connector traits.
//!
//! The pipeline core is warehouse-agnostic: everything it needs from a
//! concrete warehouse is expressed through [`SourceConnector`] and
//! [`TargetConnector`]. Adding a new warehouse means implementing these
//! traits, not modifying the coordinator. The crate ships one in-memory
//! reference implementation in [`crate::memory`] for tests and local runs.

use std::collections::BTreeMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::job::Window;
use crate::staging::StagedPartition;
use crate::value::Row;

/// Row count plus per-column order-independent hash aggregates for one
/// table restricted to a window.
///
/// Column hashes are sums of per-value hashes modulo
/// [`crate::checksum::HASH_PRIME`], so scan order never affects them.
/// `BTreeMap` keeps serialized snapshots deterministic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregateSnapshot {
    /// Rows in the window.
    pub row_count: i64,

    /// Aggregate hash per requested column.
    pub column_hashes: BTreeMap<String, u64>,
}

/// Result of a load operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadResult {
    /// Rows the target reports as applied for this idempotency key.
    pub rows_loaded: i64,
}

/// Read capability of the source warehouse.
#[async_trait]
pub trait SourceConnector: Send + Sync {
    /// Start streaming rows of `table` where `column` falls inside `window`.
    ///
    /// Returns a channel receiver yielding batches until the range is
    /// exhausted, enabling backpressure on large partitions. Errors are
    /// delivered in-band; a transient error means the whole extraction may
    /// be retried.
    fn extract_range(
        &self,
        table: &str,
        column: &str,
        window: &Window,
    ) -> mpsc::Receiver<Result<Vec<Row>>>;

    /// Row count and per-column hash aggregates for `table` restricted to
    /// `window` on `partition_column`. Read-only.
    async fn aggregate(
        &self,
        table: &str,
        partition_column: &str,
        window: &Window,
        columns: &[String],
    ) -> Result<AggregateSnapshot>;
}

/// Write capability of the target warehouse.
#[async_trait]
pub trait TargetConnector: Send + Sync {
    /// Apply a staged partition to `table`, tagged with `idempotency_key`.
    ///
    /// Repeated invocations for the same key must not double-insert: a key
    /// whose load already completed returns the prior result, and rows left
    /// over from an interrupted load under the same key are discarded before
    /// re-applying.
    async fn load(
        &self,
        staged: &StagedPartition,
        table: &str,
        idempotency_key: &str,
    ) -> Result<LoadResult>;

    /// Delete every row of `table` tagged with `idempotency_key`'s
    /// load-batch marker. Used to roll back partial applications.
    async fn delete_by_load_batch(&self, table: &str, idempotency_key: &str) -> Result<()>;

    /// Row count and per-column hash aggregates, same contract as the
    /// source side.
    async fn aggregate(
        &self,
        table: &str,
        partition_column: &str,
        window: &Window,
        columns: &[String],
    ) -> Result<AggregateSnapshot>;
}
