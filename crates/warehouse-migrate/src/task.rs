//! Task runs and the per-table pipeline state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::Window;

/// The three stages of a table pipeline.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Extract,
    Load,
    Validate,
}

impl TaskKind {
    /// Retries apply to extract and load only; re-running validation cannot
    /// change already-loaded data, and a mismatch is a verdict, not an error.
    pub fn is_retryable(self) -> bool {
        matches!(self, TaskKind::Extract | TaskKind::Load)
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskKind::Extract => write!(f, "extract"),
            TaskKind::Load => write!(f, "load"),
            TaskKind::Validate => write!(f, "validate"),
        }
    }
}

/// Execution state of one task run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Retrying,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }
}

/// Overall state of one table's pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Pending,
    Extracting,
    Loading,
    Validating,
    Retrying,
    Passed,
    FailedValidation,
    FailedTask,
    Cancelled,
}

impl PipelineState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PipelineState::Passed
                | PipelineState::FailedValidation
                | PipelineState::FailedTask
                | PipelineState::Cancelled
        )
    }

    /// The active pipeline state while a stage of `kind` is running.
    pub fn for_stage(kind: TaskKind) -> Self {
        match kind {
            TaskKind::Extract => PipelineState::Extracting,
            TaskKind::Load => PipelineState::Loading,
            TaskKind::Validate => PipelineState::Validating,
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PipelineState::Pending => "pending",
            PipelineState::Extracting => "extracting",
            PipelineState::Loading => "loading",
            PipelineState::Validating => "validating",
            PipelineState::Retrying => "retrying",
            PipelineState::Passed => "passed",
            PipelineState::FailedValidation => "failed_validation",
            PipelineState::FailedTask => "failed_task",
            PipelineState::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// One execution record of {extract, load, validate} for one table/window.
///
/// Mutated only by the coordinator, always under the per-key execution lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRun {
    /// Stage this run belongs to.
    pub kind: TaskKind,

    /// Current state.
    pub state: TaskState,

    /// Attempts made so far (0 while pending).
    pub attempts: u32,

    /// When the first attempt started.
    pub started_at: Option<DateTime<Utc>>,

    /// When the run reached a terminal state.
    pub finished_at: Option<DateTime<Utc>>,

    /// Error detail from the last failed attempt.
    pub error: Option<String>,

    /// Deterministic identity of this unit of work.
    pub idempotency_key: String,
}

impl TaskRun {
    /// Create a pending run.
    pub fn new(kind: TaskKind, idempotency_key: String) -> Self {
        Self {
            kind,
            state: TaskState::Pending,
            attempts: 0,
            started_at: None,
            finished_at: None,
            error: None,
            idempotency_key,
        }
    }

    /// Record the start of an attempt.
    pub fn mark_running(&mut self, attempt: u32) {
        self.state = TaskState::Running;
        self.attempts = attempt;
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record a transient failure that will be retried.
    pub fn mark_retrying(&mut self, error: &str) {
        self.state = TaskState::Retrying;
        self.error = Some(error.to_string());
    }

    /// Record successful completion.
    pub fn mark_completed(&mut self) {
        self.state = TaskState::Completed;
        self.finished_at = Some(Utc::now());
        self.error = None;
    }

    /// Record terminal failure.
    pub fn mark_failed(&mut self, error: &str) {
        self.state = TaskState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error.to_string());
    }

    /// Record cancellation; completed runs are left untouched.
    pub fn mark_cancelled(&mut self) {
        if !self.state.is_terminal() {
            self.state = TaskState::Cancelled;
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Deterministic identity of one (table, window, stage) unit of work.
///
/// Repeated execution under the same key must have the same net effect as a
/// single execution: extraction overwrites its staged location, and the
/// target deduplicates loads tagged with the key.
pub fn idempotency_key(source_table: &str, window: &Window, kind: TaskKind) -> String {
    let material = format!("{}|{}|{}", source_table, window.token(), kind);
    hex::encode(Sha256::digest(material.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn window() -> Window {
        Window {
            start: Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_idempotency_key_is_stable() {
        let a = idempotency_key("library.events", &window(), TaskKind::Extract);
        let b = idempotency_key("library.events", &window(), TaskKind::Extract);
        assert_eq!(a, b);
    }

    #[test]
    fn test_idempotency_key_varies_by_stage() {
        let extract = idempotency_key("library.events", &window(), TaskKind::Extract);
        let load = idempotency_key("library.events", &window(), TaskKind::Load);
        assert_ne!(extract, load);
    }

    #[test]
    fn test_task_run_lifecycle() {
        let mut run = TaskRun::new(TaskKind::Load, "key".into());
        assert_eq!(run.state, TaskState::Pending);

        run.mark_running(1);
        assert_eq!(run.attempts, 1);
        assert!(run.started_at.is_some());

        run.mark_retrying("throttled");
        assert_eq!(run.state, TaskState::Retrying);

        run.mark_running(2);
        run.mark_completed();
        assert_eq!(run.state, TaskState::Completed);
        assert!(run.error.is_none());
        assert!(run.finished_at.is_some());
    }

    #[test]
    fn test_cancel_leaves_completed_alone() {
        let mut run = TaskRun::new(TaskKind::Extract, "key".into());
        run.mark_running(1);
        run.mark_completed();
        run.mark_cancelled();
        assert_eq!(run.state, TaskState::Completed);
    }

    #[test]
    fn test_retry_only_for_extract_and_load() {
        assert!(TaskKind::Extract.is_retryable());
        assert!(TaskKind::Load.is_retryable());
        assert!(!TaskKind::Validate.is_retryable());
    }

    #[test]
    fn test_pipeline_terminal_states() {
        assert!(PipelineState::Passed.is_terminal());
        assert!(PipelineState::FailedValidation.is_terminal());
        assert!(PipelineState::FailedTask.is_terminal());
        assert!(PipelineState::Cancelled.is_terminal());
        assert!(!PipelineState::Retrying.is_terminal());
    }
}
