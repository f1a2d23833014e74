//! Workflow coordinator - drives table pipelines to a terminal state.
//!
//! Each table in a job runs the sequential extract → load → validate
//! pipeline; tables run concurrently up to the job's concurrency limit.
//! Transient stage failures retry with exponential backoff, a validation
//! mismatch never does, and one table's failure never aborts its siblings:
//! the job's outcome is simply the set of per-table terminal states.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::PipelineOptions;
use crate::connector::{SourceConnector, TargetConnector};
use crate::error::{PipelineError, Result};
use crate::extract::Extractor;
use crate::job::{MigrationJob, TableSpec, Window};
use crate::load::Loader;
use crate::staging::StagingStore;
use crate::state::{JobState, JobStatus, StateStore};
use crate::task::{idempotency_key, PipelineState, TaskKind};
use crate::validate::{ValidationReport, Validator, Verdict};

/// Final result of running a job.
///
/// A job never fails atomically; some tables may end in a failure state
/// while others pass, and the outcome reports all of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobOutcome {
    /// Job identifier.
    pub job_id: String,

    /// Final job status.
    pub status: JobStatus,

    /// Tables in the job.
    pub tables_total: usize,

    /// Tables that passed validation.
    pub tables_passed: usize,

    /// Tables whose validation found mismatches.
    pub tables_failed_validation: usize,

    /// Tables that exhausted retries or hit a permanent task error.
    pub tables_failed_task: usize,

    /// Tables cancelled before reaching another terminal state.
    pub tables_cancelled: usize,

    /// Terminal pipeline state per table.
    pub table_states: BTreeMap<String, PipelineState>,

    /// Validation reports, for every table that got far enough.
    pub reports: BTreeMap<String, ValidationReport>,
}

impl JobOutcome {
    /// Summarize a job's recorded state.
    pub fn from_state(state: &JobState) -> Self {
        let mut outcome = Self {
            job_id: state.job_id.clone(),
            status: state.status,
            tables_total: state.tables.len(),
            tables_passed: 0,
            tables_failed_validation: 0,
            tables_failed_task: 0,
            tables_cancelled: 0,
            table_states: BTreeMap::new(),
            reports: BTreeMap::new(),
        };

        for (name, progress) in &state.tables {
            match progress.pipeline {
                PipelineState::Passed => outcome.tables_passed += 1,
                PipelineState::FailedValidation => outcome.tables_failed_validation += 1,
                PipelineState::FailedTask => outcome.tables_failed_task += 1,
                PipelineState::Cancelled => outcome.tables_cancelled += 1,
                _ => {}
            }
            outcome.table_states.insert(name.clone(), progress.pipeline);
            if let Some(report) = &progress.report {
                outcome.reports.insert(name.clone(), report.clone());
            }
        }

        outcome
    }

    /// Convert to JSON string.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// A submitted job: its descriptor, effective options, and cancel token.
#[derive(Clone)]
struct JobEntry {
    job: Arc<MigrationJob>,
    options: PipelineOptions,
    cancel: CancellationToken,
}

/// The scheduler: accepts jobs and drives their table pipelines.
pub struct WorkflowCoordinator {
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetConnector>,
    staging: Arc<dyn StagingStore>,
    state: Arc<StateStore>,
    defaults: PipelineOptions,
    jobs: StdRwLock<HashMap<String, JobEntry>>,
}

impl WorkflowCoordinator {
    /// Create a coordinator over the given collaborators.
    pub fn new(
        source: Arc<dyn SourceConnector>,
        target: Arc<dyn TargetConnector>,
        staging: Arc<dyn StagingStore>,
        state: Arc<StateStore>,
    ) -> Self {
        Self {
            source,
            target,
            staging,
            state,
            defaults: PipelineOptions::default(),
            jobs: StdRwLock::new(HashMap::new()),
        }
    }

    /// Set coordinator-level default options (jobs may override per field).
    pub fn with_options(mut self, options: PipelineOptions) -> Self {
        self.defaults = options;
        self
    }

    /// Validate and register a job, persisting its initial PENDING task
    /// runs. Returns the new job identifier.
    pub async fn submit(&self, job: MigrationJob) -> Result<String> {
        job.validate()?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let options = job.options.merged_over(&self.defaults);
        self.state.create(JobState::new(&job, &job_id)).await?;

        let entry = JobEntry {
            job: Arc::new(job),
            options,
            cancel: CancellationToken::new(),
        };
        self.jobs
            .write()
            .expect("job registry poisoned")
            .insert(job_id.clone(), entry);

        info!("job {} submitted", job_id);
        Ok(job_id)
    }

    /// Drive every table of the job to a terminal state.
    ///
    /// Tables already terminal from a previous run are skipped, never
    /// re-executed. Returns once all tables are terminal or the job has
    /// been cancelled.
    pub async fn run(&self, job_id: &str) -> Result<JobOutcome> {
        let entry = self.entry(job_id)?;
        let job = entry.job.clone();
        let options = entry.options.clone();
        let cancel = entry.cancel.clone();

        self.state.update(job_id, |s| s.mark_running()).await?;
        info!(
            "job {}: running {} table pipelines (concurrency {})",
            job_id,
            job.tables.len(),
            options.get_concurrency_limit()
        );

        let semaphore = Arc::new(Semaphore::new(options.get_concurrency_limit()));
        let snapshot = self.state.snapshot(job_id).await?;
        let mut handles = Vec::new();

        for spec in &job.tables {
            if cancel.is_cancelled() {
                info!("job {}: cancellation requested, not starting further tables", job_id);
                break;
            }

            let already_terminal = snapshot
                .tables
                .get(&spec.target)
                .map(|t| t.pipeline.is_terminal())
                .unwrap_or(false);
            if already_terminal {
                debug!("job {}: skipping {} (already terminal)", job_id, spec.target);
                continue;
            }

            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("worker semaphore closed");

            let ctx = TableContext {
                job_id: job_id.to_string(),
                spec: spec.clone(),
                window: job.window,
                options: options.clone(),
                source: self.source.clone(),
                target: self.target.clone(),
                staging: self.staging.clone(),
                state: self.state.clone(),
                cancel: cancel.clone(),
            };

            let table = spec.target.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_table(ctx).await;
            });
            handles.push((table, handle));
        }

        for (table, handle) in handles {
            if let Err(err) = handle.await {
                error!("{}: pipeline task panicked - {}", table, err);
                let _ = self
                    .state
                    .update(job_id, |s| {
                        s.table_failed(&table, &format!("task panicked: {}", err))
                    })
                    .await;
            }
        }

        let cancelled = cancel.is_cancelled();
        let final_state = self
            .state
            .update(job_id, |s| {
                if cancelled {
                    s.cancel_remaining();
                }
                s.mark_finished(cancelled);
            })
            .await?;

        let outcome = JobOutcome::from_state(&final_state);
        info!(
            "job {} {}: {}/{} tables passed, {} failed validation, {} failed, {} cancelled",
            job_id,
            if cancelled { "cancelled" } else { "completed" },
            outcome.tables_passed,
            outcome.tables_total,
            outcome.tables_failed_validation,
            outcome.tables_failed_task,
            outcome.tables_cancelled
        );
        Ok(outcome)
    }

    /// Per-table pipeline states.
    pub async fn status(&self, job_id: &str) -> Result<BTreeMap<String, PipelineState>> {
        Ok(self.state.snapshot(job_id).await?.pipeline_states())
    }

    /// The validation report for one table, once available.
    pub async fn report(&self, job_id: &str, table: &str) -> Result<Option<ValidationReport>> {
        let snapshot = self.state.snapshot(job_id).await?;
        let progress = snapshot
            .tables
            .get(table)
            .ok_or_else(|| PipelineError::TableNotFound(table.to_string()))?;
        Ok(progress.report.clone())
    }

    /// Cancel a job: non-terminal task runs become CANCELLED immediately.
    ///
    /// In-flight external calls are not forcibly aborted; their results are
    /// discarded when they return, and no further stage is started.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let entry = self.entry(job_id)?;
        entry.cancel.cancel();
        self.state.update(job_id, |s| s.cancel_remaining()).await?;
        info!("job {}: cancelled", job_id);
        Ok(())
    }

    fn entry(&self, job_id: &str) -> Result<JobEntry> {
        self.jobs
            .read()
            .expect("job registry poisoned")
            .get(job_id)
            .cloned()
            .ok_or_else(|| PipelineError::JobNotFound(job_id.to_string()))
    }
}

/// Everything one table's pipeline needs, owned so it can be spawned.
struct TableContext {
    job_id: String,
    spec: TableSpec,
    window: Window,
    options: PipelineOptions,
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetConnector>,
    staging: Arc<dyn StagingStore>,
    state: Arc<StateStore>,
    cancel: CancellationToken,
}

impl TableContext {
    /// Run one stage under the retry policy.
    ///
    /// The per-key execution lock is held for the duration of each attempt,
    /// so state transitions for a key are sequenced and at most one run of
    /// the key is in flight at a time.
    async fn run_stage<T, F, Fut>(&self, kind: TaskKind, key: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = if kind.is_retryable() {
            self.options.get_max_attempts()
        } else {
            1
        };
        let stage_timeout = self.options.get_stage_timeout();
        let table = self.spec.target.clone();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if self.cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            let guard = self.state.locks().acquire(key).await;
            self.state
                .update(&self.job_id, |s| s.stage_started(&table, kind, attempt))
                .await?;

            let outcome = match tokio::time::timeout(stage_timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::StageTimeout {
                    kind,
                    table: table.clone(),
                    seconds: stage_timeout.as_secs(),
                }),
            };

            match outcome {
                Ok(value) => {
                    if self.cancel.is_cancelled() {
                        // The stage was allowed to finish; discard its result.
                        self.state
                            .update(&self.job_id, |s| s.table_cancelled(&table))
                            .await?;
                        return Err(PipelineError::Cancelled);
                    }
                    self.state
                        .update(&self.job_id, |s| s.stage_completed(&table, kind))
                        .await?;
                    return Ok(value);
                }
                Err(err) if err.is_transient() && attempt < max_attempts => {
                    let delay = backoff_delay(self.options.get_backoff_base(), attempt, key);
                    warn!(
                        "{}: {} attempt {}/{} failed ({}), retrying in {:?}",
                        table, kind, attempt, max_attempts, err, delay
                    );
                    self.state
                        .update(&self.job_id, |s| {
                            s.stage_retrying(&table, kind, &err.to_string())
                        })
                        .await?;
                    drop(guard);
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.state
                        .update(&self.job_id, |s| {
                            s.stage_failed(&table, kind, &err.to_string())
                        })
                        .await?;
                    return Err(err);
                }
            }
        }
    }
}

/// Top-level task for one table's pipeline; never panics outward.
async fn run_table(ctx: TableContext) {
    let table = ctx.spec.target.clone();
    match drive_table(&ctx).await {
        Ok(()) => {}
        Err(PipelineError::Cancelled) => {
            debug!("{}: pipeline cancelled", table);
            let _ = ctx
                .state
                .update(&ctx.job_id, |s| s.table_cancelled(&table))
                .await;
        }
        Err(err) => {
            error!("{}: pipeline failed - {}", table, err);
            // stage_failed already recorded the terminal state in the normal
            // path; this covers state-store failures mid-pipeline.
            let _ = ctx
                .state
                .update(&ctx.job_id, |s| s.table_failed(&table, &err.to_string()))
                .await;
        }
    }
}

/// The sequential extract → load → validate pipeline for one table.
async fn drive_table(ctx: &TableContext) -> Result<()> {
    let spec = &ctx.spec;
    let window = &ctx.window;

    let extractor = Extractor::new(ctx.source.clone(), ctx.staging.clone());
    let extract_key = idempotency_key(&spec.source, window, TaskKind::Extract);
    let staged = ctx
        .run_stage(TaskKind::Extract, &extract_key, || {
            let extractor = extractor.clone();
            let spec = spec.clone();
            let window = *window;
            async move { extractor.extract(&spec, &window).await }
        })
        .await?;

    let loader = Loader::new(ctx.target.clone());
    let load_key = idempotency_key(&spec.source, window, TaskKind::Load);
    ctx.run_stage(TaskKind::Load, &load_key, || {
        let loader = loader.clone();
        let staged = staged.clone();
        let spec = spec.clone();
        let key = load_key.clone();
        async move { loader.load(&staged, &spec, &key).await }
    })
    .await?;

    let validator = Validator::new(ctx.source.clone(), ctx.target.clone());
    let tolerance = spec.effective_tolerance(ctx.options.get_default_tolerance());
    let validate_key = idempotency_key(&spec.source, window, TaskKind::Validate);
    let report = ctx
        .run_stage(TaskKind::Validate, &validate_key, || {
            let validator = validator.clone();
            let spec = spec.clone();
            let window = *window;
            async move { validator.validate(&spec, &window, tolerance).await }
        })
        .await?;

    let table = spec.target.clone();
    match report.verdict {
        Verdict::Pass => {
            // Staged data is garbage-collected only after load and
            // validation both succeeded.
            if let Err(err) = ctx.staging.delete(&staged.location).await {
                warn!(
                    "{}: failed to clean staged partition {}: {}",
                    table, staged.location, err
                );
            }
            ctx.state
                .update(&ctx.job_id, move |s| s.table_passed(&table, report))
                .await?;
        }
        Verdict::Fail | Verdict::Inconclusive => {
            // Staged partition is retained for diagnosis.
            ctx.state
                .update(&ctx.job_id, move |s| s.table_failed_validation(&table, report))
                .await?;
        }
    }

    Ok(())
}

/// Exponential backoff with deterministic jitter.
///
/// Jitter is derived from the idempotency key and attempt number instead of
/// a random source, so replays of a given key schedule identically.
fn backoff_delay(base: Duration, attempt: u32, key: &str) -> Duration {
    let shift = attempt.saturating_sub(1).min(16);
    let exp = base.saturating_mul(1u32 << shift);
    let base_ms = (base.as_millis() as u64).max(1);
    let jitter = Duration::from_millis(jitter_seed(key, attempt) % base_ms);
    exp + jitter
}

fn jitter_seed(key: &str, attempt: u32) -> u64 {
    let digest = Sha256::digest(format!("{}#{}", key, attempt).as_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_grows_exponentially() {
        let base = Duration::from_millis(100);
        let d1 = backoff_delay(base, 1, "key");
        let d2 = backoff_delay(base, 2, "key");
        let d3 = backoff_delay(base, 3, "key");

        assert!(d1 >= base && d1 < base * 2);
        assert!(d2 >= base * 2 && d2 < base * 3);
        assert!(d3 >= base * 4 && d3 < base * 5);
    }

    #[test]
    fn test_backoff_jitter_is_deterministic() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 2, "key"), backoff_delay(base, 2, "key"));
    }

    #[test]
    fn test_backoff_jitter_varies_by_key() {
        // Different keys should (almost always) land on different delays.
        let base = Duration::from_millis(1000);
        let delays: std::collections::HashSet<u128> = (0..8)
            .map(|i| backoff_delay(base, 1, &format!("key-{}", i)).as_millis())
            .collect();
        assert!(delays.len() > 1);
    }
}
