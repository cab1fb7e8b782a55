use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::Sender;

use crate::models::{ImportStatus, Stage, TransactionKind};

/// Progress and data-quality events streamed while an import runs.
///
/// Everything the pipeline logs about a specific row or decision is also
/// emitted here, so callers can drive progress UIs and tests can assert on
/// the presence or absence of an event without scraping log output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    Started {
        import_id: String,
        correlation_id: String,
    },
    StatusChanged {
        import_id: String,
        from: ImportStatus,
        to: ImportStatus,
    },
    OcrCacheHit {
        import_id: String,
        content_hash: String,
    },
    OcrCompleted {
        import_id: String,
        pages: u32,
        from_cache: bool,
    },
    StructuringCompleted {
        import_id: String,
        transactions: u32,
        from_cache: bool,
    },
    RowsDiscarded {
        import_id: String,
        discarded: u32,
        total: u32,
    },
    SignCorrected {
        import_id: String,
        description: String,
        original: f64,
        corrected: f64,
        entry_type: String,
    },
    AmbiguousPayment {
        import_id: String,
        description: String,
        resolved: TransactionKind,
    },
    ClassificationFallback {
        import_id: String,
        description: String,
        raw_type: Option<String>,
        resolved: TransactionKind,
    },
    DuplicateSkipped {
        import_id: String,
        date: NaiveDate,
        amount: f64,
        matched_id: String,
        by_reference: bool,
    },
    BalanceApplied {
        import_id: String,
        account_id: String,
        balance: f64,
    },
    BalanceSkippedStale {
        import_id: String,
        statement_end: NaiveDate,
        newest_end: NaiveDate,
    },
    BalanceHeldForReview {
        import_id: String,
    },
    ReviewRequired {
        import_id: String,
        confidence: u8,
        discard_fraction: f64,
    },
    StageFailed {
        import_id: String,
        stage: Stage,
        category: String,
    },
    Cancelled {
        import_id: String,
        stage: Stage,
    },
    Completed {
        import_id: String,
        imported: u32,
        duplicates: u32,
        failed: u32,
    },
}

/// Optional event channel. Sends are fire-and-forget: a dropped or full
/// receiver never fails the pipeline.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<Sender<PipelineEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<PipelineEvent>) -> Self {
        EventSink { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        EventSink { tx: None }
    }

    pub async fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event).await;
        }
    }
}
