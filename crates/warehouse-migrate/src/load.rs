//! Loading of staged partitions into the target.

use std::sync::Arc;

use tracing::{info, warn};

use crate::connector::{LoadResult, TargetConnector};
use crate::error::{PipelineError, Result};
use crate::job::TableSpec;
use crate::staging::StagedPartition;

/// Applies staged partitions to the target warehouse.
///
/// Every load is tagged with its idempotency key so the target deduplicates
/// repeats, and a partially applied batch is rolled back before the error
/// surfaces — partial application is never an acceptable end state for an
/// attempt.
#[derive(Clone)]
pub struct Loader {
    target: Arc<dyn TargetConnector>,
}

impl Loader {
    pub fn new(target: Arc<dyn TargetConnector>) -> Self {
        Self { target }
    }

    /// Ingest `staged` into `spec.target` under `idempotency_key`.
    pub async fn load(
        &self,
        staged: &StagedPartition,
        spec: &TableSpec,
        idempotency_key: &str,
    ) -> Result<LoadResult> {
        match self.target.load(staged, &spec.target, idempotency_key).await {
            Ok(result) if result.rows_loaded == staged.row_count => {
                info!(
                    "{}: loaded {} rows from {}",
                    spec.target, result.rows_loaded, staged.location
                );
                Ok(result)
            }
            Ok(result) => {
                warn!(
                    "{}: partial load ({}/{} rows), rolling back batch {}",
                    spec.target, result.rows_loaded, staged.row_count, idempotency_key
                );
                self.rollback(&spec.target, idempotency_key).await;
                Err(PipelineError::load_transient(
                    &spec.target,
                    format!(
                        "partial load: applied {} of {} staged rows",
                        result.rows_loaded, staged.row_count
                    ),
                ))
            }
            Err(err) => {
                self.rollback(&spec.target, idempotency_key).await;
                Err(err)
            }
        }
    }

    /// Best-effort removal of any rows tagged with the batch marker. The
    /// target additionally discards uncommitted rows under the same key on
    /// the next load, so a failed rollback cannot double-apply.
    async fn rollback(&self, table: &str, idempotency_key: &str) {
        if let Err(err) = self.target.delete_by_load_batch(table, idempotency_key).await {
            warn!(
                "{}: rollback of batch {} failed: {}",
                table, idempotency_key, err
            );
        }
    }
}
