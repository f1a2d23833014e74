//! Pipeline tuning options.
//!
//! All fields use `Option<T>` to distinguish "not set" (use the built-in
//! default) from "explicitly set". Options embedded in a job descriptor
//! override coordinator-level defaults field by field.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};

/// Behavioural knobs for the pipeline coordinator.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineOptions {
    /// Maximum attempts per retryable stage (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,

    /// Base delay for exponential backoff in milliseconds (default: 200).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_base_ms: Option<u64>,

    /// Maximum table pipelines running concurrently (default: 4).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency_limit: Option<usize>,

    /// Default validation tolerance for tables that don't set one (default: 0.0).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_tolerance: Option<f64>,

    /// Per-stage timeout in seconds (default: 300).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stage_timeout_secs: Option<u64>,
}

impl PipelineOptions {
    pub fn get_max_attempts(&self) -> u32 {
        self.max_attempts.unwrap_or(3)
    }

    pub fn get_backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms.unwrap_or(200))
    }

    pub fn get_concurrency_limit(&self) -> usize {
        self.concurrency_limit.unwrap_or(4)
    }

    pub fn get_default_tolerance(&self) -> f64 {
        self.default_tolerance.unwrap_or(0.0)
    }

    pub fn get_stage_timeout(&self) -> Duration {
        Duration::from_secs(self.stage_timeout_secs.unwrap_or(300))
    }

    /// Overlay these options on top of `defaults`: explicitly set fields win,
    /// unset fields fall through to the defaults.
    pub fn merged_over(&self, defaults: &PipelineOptions) -> PipelineOptions {
        PipelineOptions {
            max_attempts: self.max_attempts.or(defaults.max_attempts),
            backoff_base_ms: self.backoff_base_ms.or(defaults.backoff_base_ms),
            concurrency_limit: self.concurrency_limit.or(defaults.concurrency_limit),
            default_tolerance: self.default_tolerance.or(defaults.default_tolerance),
            stage_timeout_secs: self.stage_timeout_secs.or(defaults.stage_timeout_secs),
        }
    }

    /// Validate explicitly-set values.
    pub fn validate(&self) -> Result<()> {
        if let Some(0) = self.max_attempts {
            return Err(PipelineError::InvalidJob(
                "options.max_attempts must be at least 1".into(),
            ));
        }
        if let Some(0) = self.concurrency_limit {
            return Err(PipelineError::InvalidJob(
                "options.concurrency_limit must be at least 1".into(),
            ));
        }
        if let Some(t) = self.default_tolerance {
            if !(0.0..=1.0).contains(&t) {
                return Err(PipelineError::InvalidJob(format!(
                    "options.default_tolerance must be within [0, 1], got {}",
                    t
                )));
            }
        }
        if let Some(0) = self.stage_timeout_secs {
            return Err(PipelineError::InvalidJob(
                "options.stage_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
