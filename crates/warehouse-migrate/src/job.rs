//! Job descriptors: tables, windows, and the migration job itself.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PipelineOptions;
use crate::error::{PipelineError, Result};

/// Logical column type understood by both warehouse sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColumnType {
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

/// One declared column of a migrated table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,

    /// Logical type.
    pub data_type: ColumnType,
}

/// Half-open UTC time range `[start, end)` bounding one unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Window {
    /// Inclusive lower bound.
    pub start: DateTime<Utc>,

    /// Exclusive upper bound.
    pub end: DateTime<Utc>,
}

impl Window {
    /// Create a window; errors unless `start < end`.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self> {
        let window = Self { start, end };
        window.validate()?;
        Ok(window)
    }

    /// Check that the window is non-empty.
    pub fn validate(&self) -> Result<()> {
        if self.start >= self.end {
            return Err(PipelineError::InvalidJob(format!(
                "window start {} must be before end {}",
                self.start.to_rfc3339(),
                self.end.to_rfc3339()
            )));
        }
        Ok(())
    }

    /// Whether `ts` falls inside the window.
    pub fn contains(&self, ts: &DateTime<Utc>) -> bool {
        *ts >= self.start && *ts < self.end
    }

    /// Compact, key-safe rendering used in staging paths and idempotency
    /// keys, e.g. `20250601T000000Z-20250602T000000Z`.
    pub fn token(&self) -> String {
        format!(
            "{}-{}",
            self.start.format("%Y%m%dT%H%M%SZ"),
            self.end.format("%Y%m%dT%H%M%SZ")
        )
    }
}

impl std::fmt::Display for Window {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}, {})",
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

/// A logical table to migrate. Immutable once a job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Fully-qualified source table name.
    pub source: String,

    /// Fully-qualified target table name.
    pub target: String,

    /// Column the window restriction applies to (must be a timestamp).
    pub partition_column: String,

    /// Declared columns, in staging order.
    pub columns: Vec<ColumnSpec>,

    /// Maximum allowed mismatch fraction before validation turns FAIL.
    /// Falls back to the job's `default_tolerance` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tolerance: Option<f64>,
}

impl TableSpec {
    /// Column names in declared order.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// The tolerance in effect for this table.
    pub fn effective_tolerance(&self, default_tolerance: f64) -> f64 {
        self.tolerance.unwrap_or(default_tolerance)
    }

    fn validate(&self) -> Result<()> {
        if self.source.is_empty() {
            return Err(PipelineError::InvalidJob("table source name is required".into()));
        }
        if self.target.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "table {} has no target name",
                self.source
            )));
        }
        if self.partition_column.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "table {} has no partition column",
                self.source
            )));
        }
        if self.columns.is_empty() {
            return Err(PipelineError::InvalidJob(format!(
                "table {} declares no columns",
                self.source
            )));
        }
        if !self.columns.iter().any(|c| c.name == self.partition_column) {
            return Err(PipelineError::InvalidJob(format!(
                "table {}: partition column {} is not a declared column",
                self.source, self.partition_column
            )));
        }
        if let Some(t) = self.tolerance {
            if !(0.0..=1.0).contains(&t) {
                return Err(PipelineError::InvalidJob(format!(
                    "table {}: tolerance must be within [0, 1], got {}",
                    self.source, t
                )));
            }
        }
        Ok(())
    }
}

/// An ordered set of tables to migrate over one global window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationJob {
    /// Tables to migrate, in submission order.
    pub tables: Vec<TableSpec>,

    /// Global time window applied to every table.
    pub window: Window,

    /// Job-level option overrides (concurrency limit, retries, tolerance).
    #[serde(default)]
    pub options: PipelineOptions,
}

impl MigrationJob {
    /// Load a job descriptor from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let job: Self = serde_yaml::from_str(&content)?;
        Ok(job)
    }

    /// Validate the descriptor before accepting it for execution.
    pub fn validate(&self) -> Result<()> {
        if self.tables.is_empty() {
            return Err(PipelineError::InvalidJob("job has no tables".into()));
        }
        self.window.validate()?;
        self.options.validate()?;

        let mut seen = std::collections::HashSet::new();
        for table in &self.tables {
            table.validate()?;
            if !seen.insert(table.target.as_str()) {
                return Err(PipelineError::InvalidJob(format!(
                    "duplicate target table name: {}",
                    table.target
                )));
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form of the job.
    ///
    /// Keys the state-file HMAC and lets re-runs detect a changed descriptor.
    pub fn spec_hash(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        hex::encode(Sha256::digest(canonical.as_bytes()))
    }
}
