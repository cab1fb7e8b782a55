use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorCategory, ImportError, Result};
use crate::schema::{BalanceSource, StructuredStatement};

/// Lifecycle states of a statement import.
///
/// Transitions are monotonic. `Completed`, `Failed` and `Cancelled` are
/// terminal and never transition again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Pending,
    Processing,
    Review,
    Completed,
    Failed,
    Cancelled,
}

impl ImportStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ImportStatus::Completed | ImportStatus::Failed | ImportStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: ImportStatus) -> bool {
        use ImportStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Pending, Cancelled)
                | (Processing, Review)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Cancelled)
                | (Review, Completed)
                | (Review, Failed)
                | (Review, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportStatus::Pending => "pending",
            ImportStatus::Processing => "processing",
            ImportStatus::Review => "review",
            ImportStatus::Completed => "completed",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pipeline stage markers, persisted so a crashed import shows where it
/// stopped and streamed in progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ocr,
    Structuring,
    Validation,
    Normalization,
    Persistence,
    Reconciliation,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ocr => "ocr",
            Stage::Structuring => "structuring",
            Stage::Validation => "validation",
            Stage::Normalization => "normalization",
            Stage::Persistence => "persistence",
            Stage::Reconciliation => "reconciliation",
            Stage::Finalize => "finalize",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-import row counters.
///
/// Invariant: `imported + failed + duplicates <= total`. Duplicates get a
/// dedicated counter so a re-upload reads as "0 imported, N duplicates"
/// instead of looking like a failure.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportCounters {
    pub total: u32,
    pub imported: u32,
    pub failed: u32,
    pub duplicates: u32,
}

impl ImportCounters {
    pub fn is_consistent(&self) -> bool {
        self.imported + self.failed + self.duplicates <= self.total
    }
}

/// Semantic transaction type derived by the normalizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
}

impl TransactionKind {
    /// The sign/type invariant: income is non-negative, expense non-positive.
    pub fn matches_sign(&self, amount: f64) -> bool {
        match self {
            TransactionKind::Income => amount >= 0.0,
            TransactionKind::Expense => amount <= 0.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionKind::Income => "income",
            TransactionKind::Expense => "expense",
        }
    }
}

impl std::fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted transaction row produced by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub import_id: String,
    pub date: NaiveDate,
    pub description: String,
    /// Signed amount: positive for income, negative for expense.
    pub amount: f64,
    pub kind: TransactionKind,
    pub reference: Option<String>,
    pub category: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Diagnostic blob persisted on the import record. Everything in here is
/// engineer-facing; user-facing text lives in `error_message` only.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImportMetadata {
    pub correlation_id: String,
    #[serde(default)]
    pub page_count: Option<u32>,
    #[serde(default)]
    pub ocr_cache_hit: Option<bool>,
    #[serde(default)]
    pub structured_cache_hit: Option<bool>,
    #[serde(default)]
    pub last_stage: Option<Stage>,
    #[serde(default)]
    pub rows_discarded: u32,
    #[serde(default)]
    pub rows_malformed: u32,
    #[serde(default)]
    pub sign_corrections: u32,
    #[serde(default)]
    pub classification_fallbacks: u32,
    #[serde(default)]
    pub ambiguous_payments: u32,
    #[serde(default)]
    pub balance_decision: Option<String>,
    #[serde(default)]
    pub provider_diagnostic: Option<String>,
}

/// An upload handed to the pipeline: who it belongs to plus the raw bytes.
#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub user_id: String,
    pub account_id: String,
    pub filename: String,
    pub mime_type: String,
    pub storage_ref: Option<String>,
    pub bytes: Vec<u8>,
}

/// The statement-import record: one row per uploaded document, tracking the
/// file identity, pipeline status, counters and extraction results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementImport {
    pub id: String,
    pub user_id: String,
    pub account_id: String,
    pub filename: String,
    pub storage_ref: Option<String>,
    pub mime_type: String,
    pub byte_size: u64,
    pub content_hash: String,
    pub status: ImportStatus,
    pub counters: ImportCounters,
    /// Extraction confidence in 0-100, set once scoring has run.
    pub confidence: Option<u8>,
    pub error_category: Option<ErrorCategory>,
    /// Generic user-facing message for `error_category`; never raw diagnostics.
    pub error_message: Option<String>,
    pub statement_start: Option<NaiveDate>,
    pub statement_end: Option<NaiveDate>,
    pub closing_balance: Option<f64>,
    pub balance_source: Option<BalanceSource>,
    pub metadata: ImportMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly when a terminal status is entered.
    pub completed_at: Option<DateTime<Utc>>,
}

impl StatementImport {
    pub fn new(request: &ImportRequest, content_hash: String) -> Self {
        let now = Utc::now();
        StatementImport {
            id: Uuid::new_v4().to_string(),
            user_id: request.user_id.clone(),
            account_id: request.account_id.clone(),
            filename: request.filename.clone(),
            storage_ref: request.storage_ref.clone(),
            mime_type: request.mime_type.clone(),
            byte_size: request.bytes.len() as u64,
            content_hash,
            status: ImportStatus::Pending,
            counters: ImportCounters::default(),
            confidence: None,
            error_category: None,
            error_message: None,
            statement_start: None,
            statement_end: None,
            closing_balance: None,
            balance_source: None,
            metadata: ImportMetadata {
                correlation_id: Uuid::new_v4().to_string(),
                ..ImportMetadata::default()
            },
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    /// Moves the record to `next`, enforcing the transition table and
    /// stamping `completed_at` on terminal entry.
    pub fn transition(&mut self, next: ImportStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(ImportError::IllegalTransition {
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        if next.is_terminal() {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Stamps the failure category and its generic user-facing message.
    pub fn record_failure(&mut self, category: ErrorCategory, diagnostic: String) {
        self.error_category = Some(category);
        self.error_message = Some(category.user_message().to_string());
        self.metadata.provider_diagnostic = Some(diagnostic);
    }
}

/// Cached OCR output keyed by document content hash. Entries are written
/// once; the only later mutation is attaching the structured result so the
/// structuring stage is not billed twice for identical content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcrCacheEntry {
    pub content_hash: String,
    pub text: String,
    pub page_count: u32,
    pub structured: Option<StructuredStatement>,
    pub created_at: DateTime<Utc>,
}

impl OcrCacheEntry {
    pub fn new(content_hash: String, text: String, page_count: u32) -> Self {
        OcrCacheEntry {
            content_hash,
            text,
            page_count,
            structured: None,
            created_at: Utc::now(),
        }
    }
}
