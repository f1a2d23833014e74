//! # warehouse-migrate
//!
//! Warehouse-agnostic table migration pipeline coordinator.
//!
//! This library moves a table's data through **extract → stage → load →
//! validate**, one time window at a time, with support for:
//!
//! - **Concurrent table pipelines** bounded by a configurable worker limit
//! - **Retries** with exponential backoff for transient stage failures
//! - **Exactly-once loads** via idempotency keys and partial-batch rollback
//! - **Cross-system validation** using row counts and order-independent
//!   column hash aggregates
//! - **Durable job state** in signed JSON files for idempotent re-runs
//!
//! Which warehouses sit on either side is a detail of the
//! [`SourceConnector`]/[`TargetConnector`] implementations; the coordinator
//! never changes when a new warehouse is added.
//!
//! ## Example
//!
//! ```rust,ignore
//! use warehouse_migrate::{MigrationJob, StateStore, WorkflowCoordinator};
//!
//! #[tokio::main]
//! async fn main() -> warehouse_migrate::Result<()> {
//!     let job = MigrationJob::load("job.yaml")?;
//!     let coordinator = WorkflowCoordinator::new(source, target, staging, state);
//!     let job_id = coordinator.submit(job).await?;
//!     let outcome = coordinator.run(&job_id).await?;
//!     println!("{} of {} tables passed", outcome.tables_passed, outcome.tables_total);
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod config;
pub mod connector;
pub mod coordinator;
pub mod error;
pub mod extract;
pub mod job;
pub mod load;
pub mod memory;
pub mod staging;
pub mod state;
pub mod task;
pub mod validate;
pub mod value;

// Re-exports for convenient access
pub use config::PipelineOptions;
pub use connector::{AggregateSnapshot, LoadResult, SourceConnector, TargetConnector};
pub use coordinator::{JobOutcome, WorkflowCoordinator};
pub use error::{PipelineError, Result, Transience};
pub use extract::Extractor;
pub use job::{ColumnSpec, ColumnType, MigrationJob, TableSpec, Window};
pub use load::Loader;
pub use memory::MemoryWarehouse;
pub use staging::{FsStagingStore, MemoryStagingStore, StagedPartition, StagingStore};
pub use state::{JobState, JobStatus, StateStore};
pub use task::{idempotency_key, PipelineState, TaskKind, TaskRun, TaskState};
pub use validate::{ValidationReport, Validator, Verdict};
pub use value::{Row, Value};
