//! Error types for the migration pipeline.

use thiserror::Error;

use crate::task::TaskKind;

/// Whether a task failure is worth retrying.
///
/// Transient failures (timeouts, throttling, connection drops) are retried
/// under the coordinator's backoff policy. Permanent failures (schema
/// mismatch, missing table) escalate directly to a terminal task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transience {
    Transient,
    Permanent,
}

impl std::fmt::Display for Transience {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Transience::Transient => write!(f, "transient"),
            Transience::Permanent => write!(f, "permanent"),
        }
    }
}

/// Main error type for pipeline operations.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Malformed job input. Fails submission, never retried.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Extraction from the source warehouse failed.
    #[error("Extraction failed for table {table} ({transience}): {message}")]
    Extraction {
        table: String,
        transience: Transience,
        message: String,
    },

    /// Load into the target warehouse failed.
    #[error("Load failed for table {table} ({transience}): {message}")]
    Load {
        table: String,
        transience: Transience,
        message: String,
    },

    /// A stage exceeded its configured timeout. Treated as transient.
    #[error("{kind} stage timed out after {seconds}s for table {table}")]
    StageTimeout {
        kind: TaskKind,
        table: String,
        seconds: u64,
    },

    /// Staging store read/write failure.
    #[error("Staging error at {location}: {message}")]
    Staging { location: String, message: String },

    /// State store failure (persistence, integrity check).
    #[error("State error: {0}")]
    State(String),

    /// Lookup of an unknown job identifier.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// Lookup of a table that is not part of the job.
    #[error("Table not found in job: {0}")]
    TableNotFound(String),

    /// The job was cancelled; the result of any in-flight stage is discarded.
    #[error("Job cancelled")]
    Cancelled,

    /// IO error (file operations).
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML serialization/deserialization error.
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl PipelineError {
    /// Create a transient extraction error.
    pub fn extraction_transient(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Extraction {
            table: table.into(),
            transience: Transience::Transient,
            message: message.into(),
        }
    }

    /// Create a permanent extraction error.
    pub fn extraction_permanent(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Extraction {
            table: table.into(),
            transience: Transience::Permanent,
            message: message.into(),
        }
    }

    /// Create a transient load error.
    pub fn load_transient(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Load {
            table: table.into(),
            transience: Transience::Transient,
            message: message.into(),
        }
    }

    /// Create a permanent load error.
    pub fn load_permanent(table: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Load {
            table: table.into(),
            transience: Transience::Permanent,
            message: message.into(),
        }
    }

    /// Create a staging error with the location it occurred at.
    pub fn staging(location: impl Into<String>, message: impl Into<String>) -> Self {
        PipelineError::Staging {
            location: location.into(),
            message: message.into(),
        }
    }

    /// Whether the coordinator's retry policy applies to this error.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            PipelineError::Extraction {
                transience: Transience::Transient,
                ..
            } | PipelineError::Load {
                transience: Transience::Transient,
                ..
            } | PipelineError::StageTimeout { .. }
        )
    }

    /// Format error with full details including error chain.
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;
