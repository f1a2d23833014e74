//! Cross-system consistency validation.
//!
//! The validator runs one aggregate query per side — row count plus an
//! order-independent hash per declared column — and compares them. It never
//! mutates data, and re-running it against unchanged source/target yields a
//! byte-identical report: the report carries no timestamps or durations and
//! all maps are ordered.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connector::{SourceConnector, TargetConnector};
use crate::error::Result;
use crate::job::{TableSpec, Window};

/// Outcome of validating one (table, window) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    /// Zero mismatched checks.
    Pass,

    /// Mismatch fraction exceeded the table's tolerance.
    Fail,

    /// Mismatches present but within tolerance; flagged for manual review
    /// rather than silently passed.
    Inconclusive,
}

/// Comparison result for a single column's hash aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnCheck {
    /// Aggregate hash on the source side.
    pub source_hash: u64,

    /// Aggregate hash on the target side.
    pub target_hash: u64,

    /// Whether the two agree.
    pub matches: bool,
}

/// Immutable validation result for one (table, window) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Fully-qualified target table name.
    pub table: String,

    /// Fully-qualified source table name.
    pub source_table: String,

    /// Window the comparison was restricted to.
    pub window: Window,

    /// Rows on the source side.
    pub source_rows: i64,

    /// Rows on the target side.
    pub target_rows: i64,

    /// Whether the row counts agree.
    pub row_count_match: bool,

    /// Per-column comparison, keyed by column name.
    pub columns: BTreeMap<String, ColumnCheck>,

    /// Total checks performed (row count + one per column).
    pub checks_total: u32,

    /// Checks that disagreed.
    pub checks_mismatched: u32,

    /// Tolerance that was in effect.
    pub tolerance: f64,

    /// Final judgment.
    pub verdict: Verdict,
}

impl ValidationReport {
    /// Fraction of checks that disagreed.
    pub fn mismatch_fraction(&self) -> f64 {
        if self.checks_total == 0 {
            0.0
        } else {
            f64::from(self.checks_mismatched) / f64::from(self.checks_total)
        }
    }
}

/// Decide the verdict from mismatch counts and the effective tolerance.
fn decide(checks_mismatched: u32, checks_total: u32, tolerance: f64) -> Verdict {
    if checks_mismatched == 0 {
        return Verdict::Pass;
    }
    let fraction = f64::from(checks_mismatched) / f64::from(checks_total.max(1));
    if fraction > tolerance {
        Verdict::Fail
    } else {
        Verdict::Inconclusive
    }
}

/// Read-only comparator between source and target.
#[derive(Clone)]
pub struct Validator {
    source: Arc<dyn SourceConnector>,
    target: Arc<dyn TargetConnector>,
}

impl Validator {
    pub fn new(source: Arc<dyn SourceConnector>, target: Arc<dyn TargetConnector>) -> Self {
        Self { source, target }
    }

    /// Compare `spec`'s source and target tables over `window`.
    pub async fn validate(
        &self,
        spec: &TableSpec,
        window: &Window,
        tolerance: f64,
    ) -> Result<ValidationReport> {
        let columns = spec.column_names();

        // Both aggregates issued concurrently; each side scans once.
        let (source_agg, target_agg) = tokio::join!(
            self.source
                .aggregate(&spec.source, &spec.partition_column, window, &columns),
            self.target
                .aggregate(&spec.target, &spec.partition_column, window, &columns)
        );
        let source_agg = source_agg?;
        let target_agg = target_agg?;

        let row_count_match = source_agg.row_count == target_agg.row_count;
        let mut checks_mismatched = u32::from(!row_count_match);

        let mut column_checks = BTreeMap::new();
        for column in &columns {
            let source_hash = source_agg.column_hashes.get(column).copied().unwrap_or(0);
            let target_hash = target_agg.column_hashes.get(column).copied().unwrap_or(0);
            let matches = source_hash == target_hash;
            if !matches {
                checks_mismatched += 1;
                debug!(
                    "{}: column {} hash mismatch (source {} target {})",
                    spec.target, column, source_hash, target_hash
                );
            }
            column_checks.insert(
                column.clone(),
                ColumnCheck {
                    source_hash,
                    target_hash,
                    matches,
                },
            );
        }

        let checks_total = 1 + columns.len() as u32;
        let verdict = decide(checks_mismatched, checks_total, tolerance);

        match verdict {
            Verdict::Pass => info!(
                "{}: validated {} rows over {} (PASS)",
                spec.target, source_agg.row_count, window
            ),
            Verdict::Fail => warn!(
                "{}: validation FAILED - source={} target={} mismatched_checks={}/{}",
                spec.target,
                source_agg.row_count,
                target_agg.row_count,
                checks_mismatched,
                checks_total
            ),
            Verdict::Inconclusive => warn!(
                "{}: validation INCONCLUSIVE - {}/{} checks mismatched within tolerance {}",
                spec.target, checks_mismatched, checks_total, tolerance
            ),
        }

        Ok(ValidationReport {
            table: spec.target.clone(),
            source_table: spec.source.clone(),
            window: *window,
            source_rows: source_agg.row_count,
            target_rows: target_agg.row_count,
            row_count_match,
            columns: column_checks,
            checks_total,
            checks_mismatched,
            tolerance,
            verdict,
        })
    }
}
