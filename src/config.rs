use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::dedup::DedupConfig;
use crate::error::{ImportError, Result};
use crate::retry::RetryPolicy;
use crate::validate::ValidatorConfig;

/// How the balance reconciler treats a statement whose end date could not be
/// extracted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MissingEndDatePolicy {
    /// Treat the statement as the most recent and apply its balance.
    ApplyAsLatest,
    /// Hold the import for manual review instead of touching the balance.
    HoldForReview,
}

/// Every tunable of the pipeline in one place, with defaults that match
/// production behavior. Thresholds that route imports to review are
/// deliberately configurable rather than hard-coded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub ocr_retry: RetryPolicy,
    pub structuring_retry: RetryPolicy,
    /// Wall-clock budget for a single OCR attempt. Distinct from the retry
    /// policy: each attempt gets this budget.
    pub ocr_timeout: Duration,
    /// Wall-clock budget for a single structuring attempt.
    pub structuring_timeout: Duration,
    pub validator: ValidatorConfig,
    pub dedup: DedupConfig,
    /// Imports scoring below this confidence are routed to review.
    pub review_confidence_threshold: u8,
    /// Imports where the validator discarded more than this fraction of rows
    /// are routed to review.
    pub review_discard_fraction: f64,
    pub missing_end_date_policy: MissingEndDatePolicy,
    /// Upper bound on imports processed concurrently by `run_many`.
    pub max_concurrent_imports: usize,
    pub supported_mime_types: Vec<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            ocr_retry: RetryPolicy::default(),
            structuring_retry: RetryPolicy::default(),
            ocr_timeout: Duration::from_secs(120),
            structuring_timeout: Duration::from_secs(120),
            validator: ValidatorConfig::default(),
            dedup: DedupConfig::default(),
            review_confidence_threshold: 70,
            review_discard_fraction: 0.25,
            missing_end_date_policy: MissingEndDatePolicy::ApplyAsLatest,
            max_concurrent_imports: 4,
            supported_mime_types: vec![
                "application/pdf".to_string(),
                "image/png".to_string(),
                "image/jpeg".to_string(),
                "image/webp".to_string(),
            ],
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.review_confidence_threshold > 100 {
            return Err(ImportError::InvalidConfig(format!(
                "review_confidence_threshold {} must be between 0 and 100",
                self.review_confidence_threshold
            )));
        }
        if !(0.0..=1.0).contains(&self.review_discard_fraction) {
            return Err(ImportError::InvalidConfig(format!(
                "review_discard_fraction {} must be between 0.0 and 1.0",
                self.review_discard_fraction
            )));
        }
        if !(0.0..=1.0).contains(&self.validator.min_token_overlap) {
            return Err(ImportError::InvalidConfig(format!(
                "validator.min_token_overlap {} must be between 0.0 and 1.0",
                self.validator.min_token_overlap
            )));
        }
        if !(0.0..=1.0).contains(&self.dedup.min_description_similarity) {
            return Err(ImportError::InvalidConfig(format!(
                "dedup.min_description_similarity {} must be between 0.0 and 1.0",
                self.dedup.min_description_similarity
            )));
        }
        if self.max_concurrent_imports == 0 {
            return Err(ImportError::InvalidConfig(
                "max_concurrent_imports must be at least 1".to_string(),
            ));
        }
        if self.ocr_retry.max_attempts == 0 || self.structuring_retry.max_attempts == 0 {
            return Err(ImportError::InvalidConfig(
                "retry policies need at least one attempt".to_string(),
            ));
        }
        if self.supported_mime_types.is_empty() {
            return Err(ImportError::InvalidConfig(
                "supported_mime_types must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn supports_mime(&self, mime_type: &str) -> bool {
        let wanted = mime_type.trim().to_lowercase();
        self.supported_mime_types
            .iter()
            .any(|mime| mime.eq_ignore_ascii_case(&wanted))
    }
}
