//! Durable job/task state.
//!
//! Each job's state is a single JSON document: per-table pipeline state,
//! the three task runs, and the validation report once available. State is
//! held in memory and optionally persisted after every transition (atomic
//! temp-file + rename, HMAC-signed with the job-spec hash), which is what
//! makes re-runs idempotent and the pipeline observable from outside.

pub mod locks;

pub use locks::KeyLocks;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::job::MigrationJob;
use crate::task::{idempotency_key, PipelineState, TaskKind, TaskRun};
use crate::validate::ValidationReport;

type HmacSha256 = Hmac<Sha256>;

/// Overall job status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Cancelled,
}

/// Per-table progress record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableProgress {
    /// Pipeline state machine position.
    pub pipeline: PipelineState,

    /// The three task runs, keyed by stage.
    pub tasks: BTreeMap<TaskKind, TaskRun>,

    /// Validation report, once produced.
    pub report: Option<ValidationReport>,

    /// Error detail for a terminal task failure.
    pub error: Option<String>,
}

impl TableProgress {
    fn new(source_table: &str, window: &crate::job::Window) -> Self {
        let mut tasks = BTreeMap::new();
        for kind in [TaskKind::Extract, TaskKind::Load, TaskKind::Validate] {
            tasks.insert(
                kind,
                TaskRun::new(kind, idempotency_key(source_table, window, kind)),
            );
        }
        Self {
            pipeline: PipelineState::Pending,
            tasks,
            report: None,
            error: None,
        }
    }

    fn task_mut(&mut self, kind: TaskKind) -> Option<&mut TaskRun> {
        self.tasks.get_mut(&kind)
    }
}

/// Complete state of one migration job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Job identifier.
    pub job_id: String,

    /// SHA-256 of the job descriptor; keys the HMAC signature.
    pub spec_hash: String,

    /// When the job was accepted.
    pub submitted_at: DateTime<Utc>,

    /// When every table reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,

    /// Overall status.
    pub status: JobStatus,

    /// Per-table progress, keyed by target table name.
    pub tables: BTreeMap<String, TableProgress>,

    /// HMAC-SHA256 signature over the rest of the document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hmac: Option<String>,
}

impl JobState {
    /// Initial state for a freshly submitted job: every task PENDING.
    pub fn new(job: &MigrationJob, job_id: &str) -> Self {
        let tables = job
            .tables
            .iter()
            .map(|t| {
                (
                    t.target.clone(),
                    TableProgress::new(&t.source, &job.window),
                )
            })
            .collect();

        Self {
            job_id: job_id.to_string(),
            spec_hash: job.spec_hash(),
            submitted_at: Utc::now(),
            completed_at: None,
            status: JobStatus::Pending,
            tables,
            hmac: None,
        }
    }

    /// Whether every table reached a terminal pipeline state.
    pub fn is_terminal(&self) -> bool {
        self.tables.values().all(|t| t.pipeline.is_terminal())
    }

    /// Per-table pipeline states, for the status surface.
    pub fn pipeline_states(&self) -> BTreeMap<String, PipelineState> {
        self.tables
            .iter()
            .map(|(name, t)| (name.clone(), t.pipeline))
            .collect()
    }

    // ----- transitions (all guarded against overwriting terminal states) -----

    /// An attempt of `kind` started for `table`.
    pub fn stage_started(&mut self, table: &str, kind: TaskKind, attempt: u32) {
        if let Some(progress) = self.tables.get_mut(table) {
            if progress.pipeline.is_terminal() {
                return;
            }
            progress.pipeline = PipelineState::for_stage(kind);
            if let Some(task) = progress.task_mut(kind) {
                task.mark_running(attempt);
            }
        }
    }

    /// An attempt failed transiently and will be retried.
    pub fn stage_retrying(&mut self, table: &str, kind: TaskKind, error: &str) {
        if let Some(progress) = self.tables.get_mut(table) {
            if progress.pipeline.is_terminal() {
                return;
            }
            progress.pipeline = PipelineState::Retrying;
            if let Some(task) = progress.task_mut(kind) {
                task.mark_retrying(error);
            }
        }
    }

    /// A stage completed successfully.
    pub fn stage_completed(&mut self, table: &str, kind: TaskKind) {
        if let Some(progress) = self.tables.get_mut(table) {
            if let Some(task) = progress.task_mut(kind) {
                if !task.state.is_terminal() {
                    task.mark_completed();
                }
            }
        }
    }

    /// A stage failed permanently (or exhausted its retries).
    pub fn stage_failed(&mut self, table: &str, kind: TaskKind, error: &str) {
        if let Some(progress) = self.tables.get_mut(table) {
            if let Some(task) = progress.task_mut(kind) {
                if !task.state.is_terminal() {
                    task.mark_failed(error);
                }
            }
            if !progress.pipeline.is_terminal() {
                progress.pipeline = PipelineState::FailedTask;
                progress.error = Some(error.to_string());
            }
        }
    }

    /// Validation produced a PASS verdict.
    pub fn table_passed(&mut self, table: &str, report: ValidationReport) {
        if let Some(progress) = self.tables.get_mut(table) {
            if !progress.pipeline.is_terminal() {
                progress.pipeline = PipelineState::Passed;
                progress.report = Some(report);
            }
        }
    }

    /// Validation produced a FAIL or INCONCLUSIVE verdict.
    pub fn table_failed_validation(&mut self, table: &str, report: ValidationReport) {
        if let Some(progress) = self.tables.get_mut(table) {
            if !progress.pipeline.is_terminal() {
                progress.pipeline = PipelineState::FailedValidation;
                progress.report = Some(report);
            }
        }
    }

    /// Mark one table's pipeline as a task failure without touching task
    /// runs. Fallback for failures outside a recorded stage attempt.
    pub fn table_failed(&mut self, table: &str, error: &str) {
        if let Some(progress) = self.tables.get_mut(table) {
            if !progress.pipeline.is_terminal() {
                progress.pipeline = PipelineState::FailedTask;
                progress.error = Some(error.to_string());
            }
        }
    }

    /// Mark one table's pipeline cancelled.
    pub fn table_cancelled(&mut self, table: &str) {
        if let Some(progress) = self.tables.get_mut(table) {
            if !progress.pipeline.is_terminal() {
                progress.pipeline = PipelineState::Cancelled;
                for task in progress.tasks.values_mut() {
                    task.mark_cancelled();
                }
            }
        }
    }

    /// Cancel everything that is not already terminal.
    pub fn cancel_remaining(&mut self) {
        let tables: Vec<String> = self.tables.keys().cloned().collect();
        for table in tables {
            self.table_cancelled(&table);
        }
        if self.status != JobStatus::Completed {
            self.status = JobStatus::Cancelled;
        }
    }

    /// The run loop started.
    pub fn mark_running(&mut self) {
        if self.status == JobStatus::Pending {
            self.status = JobStatus::Running;
        }
    }

    /// The run loop finished; status reflects whether it was cancelled.
    pub fn mark_finished(&mut self, cancelled: bool) {
        self.status = if cancelled {
            JobStatus::Cancelled
        } else {
            JobStatus::Completed
        };
        self.completed_at = Some(Utc::now());
    }

    // ----- persistence -----

    fn compute_hmac(&self) -> Result<String> {
        let mut unsigned = self.clone();
        unsigned.hmac = None;

        let content = serde_json::to_string(&unsigned)?;
        let mut mac = HmacSha256::new_from_slice(self.spec_hash.as_bytes())
            .map_err(|e| PipelineError::State(format!("failed to create HMAC: {}", e)))?;
        mac.update(content.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Save to a file (atomic write, HMAC-signed).
    pub fn save<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.hmac = Some(self.compute_hmac()?);

        let content = serde_json::to_string_pretty(self)?;
        let temp_path = path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load from a file, validating the HMAC signature when present.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;

        if let Some(stored) = &state.hmac {
            let expected = state.compute_hmac()?;
            if stored != &expected {
                return Err(PipelineError::State(
                    "state file integrity check failed: HMAC mismatch".into(),
                ));
            }
        } else {
            warn!("state file has no HMAC signature, integrity cannot be verified");
        }

        Ok(state)
    }
}

/// Shared registry of job states plus the per-key execution locks.
pub struct StateStore {
    dir: Option<PathBuf>,
    jobs: StdRwLock<HashMap<String, Arc<Mutex<JobState>>>>,
    locks: KeyLocks,
}

impl StateStore {
    /// In-memory store, no durability.
    pub fn in_memory() -> Self {
        Self {
            dir: None,
            jobs: StdRwLock::new(HashMap::new()),
            locks: KeyLocks::new(),
        }
    }

    /// Durable store writing one `<job_id>.json` per job under `dir`.
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> Result<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: Some(dir.as_ref().to_path_buf()),
            jobs: StdRwLock::new(HashMap::new()),
            locks: KeyLocks::new(),
        })
    }

    /// The per-idempotency-key execution locks.
    pub fn locks(&self) -> &KeyLocks {
        &self.locks
    }

    /// Register a new job. Fails if the id is already known.
    pub async fn create(&self, state: JobState) -> Result<()> {
        let job_id = state.job_id.clone();
        let entry = {
            let mut jobs = self.jobs.write().expect("state registry poisoned");
            if jobs.contains_key(&job_id) {
                return Err(PipelineError::State(format!(
                    "job {} already registered",
                    job_id
                )));
            }
            let entry = Arc::new(Mutex::new(state));
            jobs.insert(job_id, entry.clone());
            entry
        };

        let mut guard = entry.lock().await;
        self.persist(&mut guard)
    }

    /// Apply a transition and persist the result, returning a snapshot.
    pub async fn update<F>(&self, job_id: &str, transition: F) -> Result<JobState>
    where
        F: FnOnce(&mut JobState),
    {
        let entry = self.entry(job_id)?;
        let mut guard = entry.lock().await;
        transition(&mut guard);
        self.persist(&mut guard)?;
        Ok(guard.clone())
    }

    /// Current state of a job.
    pub async fn snapshot(&self, job_id: &str) -> Result<JobState> {
        let entry = self.entry(job_id)?;
        let guard = entry.lock().await;
        Ok(guard.clone())
    }

    fn entry(&self, job_id: &str) -> Result<Arc<Mutex<JobState>>> {
        self.jobs
            .read()
            .expect("state registry poisoned")
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }

    fn persist(&self, state: &mut JobState) -> Result<()> {
        if let Some(dir) = &self.dir {
            state.save(dir.join(format!("{}.json", state.job_id)))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineOptions;
    use crate::job::{ColumnSpec, ColumnType, TableSpec, Window};
    use chrono::TimeZone;

    fn sample_job() -> MigrationJob {
        MigrationJob {
            tables: vec![TableSpec {
                source: "library.events".into(),
                target: "analytics.events".into(),
                partition_column: "event_ts".into(),
                columns: vec![ColumnSpec {
                    name: "event_ts".into(),
                    data_type: ColumnType::Timestamp,
                }],
                tolerance: None,
            }],
            window: Window {
                start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
                end: Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap(),
            },
            options: PipelineOptions::default(),
        }
    }

    #[test]
    fn test_new_state_is_all_pending() {
        let state = JobState::new(&sample_job(), "job-1");
        let progress = state.tables.get("analytics.events").unwrap();
        assert_eq!(progress.pipeline, PipelineState::Pending);
        assert_eq!(progress.tasks.len(), 3);
        assert!(!state.is_terminal());
    }

    #[test]
    fn test_state_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");

        let mut state = JobState::new(&sample_job(), "job-1");
        state.stage_started("analytics.events", TaskKind::Extract, 1);
        state.save(&path).unwrap();

        let loaded = JobState::load(&path).unwrap();
        assert_eq!(loaded.job_id, "job-1");
        assert_eq!(
            loaded.tables.get("analytics.events").unwrap().pipeline,
            PipelineState::Extracting
        );
    }

    #[test]
    fn test_tampered_state_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.json");

        let mut state = JobState::new(&sample_job(), "job-1");
        state.save(&path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let tampered = content.replace("\"pending\"", "\"passed\"");
        assert_ne!(content, tampered);
        std::fs::write(&path, tampered).unwrap();

        assert!(JobState::load(&path).is_err());
    }

    #[test]
    fn test_failed_task_is_terminal() {
        let mut state = JobState::new(&sample_job(), "job-1");
        state.stage_started("analytics.events", TaskKind::Extract, 1);
        state.stage_failed("analytics.events", TaskKind::Extract, "schema drift");

        let progress = state.tables.get("analytics.events").unwrap();
        assert_eq!(progress.pipeline, PipelineState::FailedTask);
        assert_eq!(progress.error.as_deref(), Some("schema drift"));
        assert!(state.is_terminal());
    }

    #[test]
    fn test_cancel_remaining_skips_terminal_tables() {
        let mut state = JobState::new(&sample_job(), "job-1");
        state.stage_started("analytics.events", TaskKind::Extract, 1);
        state.stage_failed("analytics.events", TaskKind::Extract, "boom");

        state.cancel_remaining();
        assert_eq!(state.status, JobStatus::Cancelled);
        // Already-terminal table keeps its failure state.
        assert_eq!(
            state.tables.get("analytics.events").unwrap().pipeline,
            PipelineState::FailedTask
        );
    }

    #[test]
    fn test_terminal_pipeline_ignores_late_transitions() {
        let mut state = JobState::new(&sample_job(), "job-1");
        state.table_cancelled("analytics.events");
        state.stage_started("analytics.events", TaskKind::Load, 1);

        assert_eq!(
            state.tables.get("analytics.events").unwrap().pipeline,
            PipelineState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_store_update_and_snapshot() {
        let store = StateStore::in_memory();
        store
            .create(JobState::new(&sample_job(), "job-1"))
            .await
            .unwrap();

        store
            .update("job-1", |s| {
                s.stage_started("analytics.events", TaskKind::Extract, 1)
            })
            .await
            .unwrap();

        let snap = store.snapshot("job-1").await.unwrap();
        assert_eq!(
            snap.tables.get("analytics.events").unwrap().pipeline,
            PipelineState::Extracting
        );
    }

    #[tokio::test]
    async fn test_store_rejects_duplicate_job() {
        let store = StateStore::in_memory();
        store
            .create(JobState::new(&sample_job(), "job-1"))
            .await
            .unwrap();
        assert!(store
            .create(JobState::new(&sample_job(), "job-1"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_store_unknown_job() {
        let store = StateStore::in_memory();
        assert!(matches!(
            store.snapshot("nope").await,
            Err(PipelineError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_durable_store_writes_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::with_dir(dir.path()).unwrap();
        store
            .create(JobState::new(&sample_job(), "job-1"))
            .await
            .unwrap();

        let path = dir.path().join("job-1.json");
        assert!(path.exists());
        let loaded = JobState::load(&path).unwrap();
        assert_eq!(loaded.job_id, "job-1");
    }
}
