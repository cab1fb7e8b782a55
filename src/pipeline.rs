use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::NaiveDate;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{MissingEndDatePolicy, PipelineConfig};
use crate::confidence::{self, ConfidenceInputs};
use crate::dedup::{DedupEngine, DedupOutcome};
use crate::error::{ErrorCategory, ImportError, Result};
use crate::events::{EventSink, PipelineEvent};
use crate::llm::{StatementExtractor, StructuringProvider};
use crate::models::{
    ImportCounters, ImportRequest, ImportStatus, Stage, StatementImport, Transaction,
};
use crate::normalize::{self, NormalizationNote, NormalizedBatch};
use crate::ocr::{OcrClient, OcrProvider, OcrRequest};
use crate::reconcile::{reconcile_balance, BalanceDecision};
use crate::schema::{BalanceSource, ClosingBalance};
use crate::store::{AccountStore, ImportStore, OcrCacheStore, TransactionStore};
use crate::utils::{content_hash, parse_flexible_date, truncate_diagnostic};
use crate::validate::{ExtractionValidator, ValidationReport};

/// Cloneable cancellation handle. The pipeline checks it between stages, so
/// a call already in flight finishes but nothing new starts afterwards.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        CancelFlag::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// The four persistence roles the pipeline needs. `shared` wires them all to
/// one backing store, which is how `MemoryStore` is used in tests.
pub struct PipelineStores {
    pub imports: Arc<dyn ImportStore>,
    pub transactions: Arc<dyn TransactionStore>,
    pub accounts: Arc<dyn AccountStore>,
    pub ocr_cache: Arc<dyn OcrCacheStore>,
}

impl PipelineStores {
    pub fn shared<T>(store: Arc<T>) -> Self
    where
        T: ImportStore + TransactionStore + AccountStore + OcrCacheStore + 'static,
    {
        PipelineStores {
            imports: store.clone(),
            transactions: store.clone(),
            accounts: store.clone(),
            ocr_cache: store,
        }
    }
}

/// One async mutex per account. Balance read-decide-write and the completion
/// of an import run inside it, so concurrent imports for the same account
/// serialize exactly there and nowhere else.
#[derive(Default)]
struct AccountLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AccountLocks {
    fn for_account(&self, account_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut locks = self
            .inner
            .lock()
            .map_err(|_| ImportError::Store("account lock registry poisoned".to_string()))?;
        Ok(locks
            .entry(account_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }
}

/// Drives an uploaded statement through OCR, structuring, validation,
/// normalization, dedup, persistence and balance reconciliation, persisting
/// the `StatementImport` record after every status change.
///
/// Provider failures do not surface as `Err`: the import record comes back
/// with status `Failed`, a machine-readable category and a generic
/// user-facing message. `Err` is reserved for infrastructure problems such
/// as store failures or calls against unknown or mis-stated imports.
pub struct ImportPipeline<O, S> {
    ocr: OcrClient<O>,
    extractor: StatementExtractor<S>,
    imports: Arc<dyn ImportStore>,
    transactions: Arc<dyn TransactionStore>,
    accounts: Arc<dyn AccountStore>,
    cache: Arc<dyn OcrCacheStore>,
    config: PipelineConfig,
    events: EventSink,
    account_locks: AccountLocks,
}

impl<O: OcrProvider, S: StructuringProvider> ImportPipeline<O, S> {
    pub fn new(
        ocr_provider: O,
        structuring_provider: S,
        stores: PipelineStores,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let ocr = OcrClient::new(
            ocr_provider,
            stores.ocr_cache.clone(),
            config.ocr_retry,
            config.ocr_timeout,
        );
        let extractor = StatementExtractor::new(
            structuring_provider,
            config.structuring_retry,
            config.structuring_timeout,
        );
        Ok(ImportPipeline {
            ocr,
            extractor,
            imports: stores.imports,
            transactions: stores.transactions,
            accounts: stores.accounts,
            cache: stores.ocr_cache,
            config,
            events: EventSink::disabled(),
            account_locks: AccountLocks::default(),
        })
    }

    /// Stream progress and data-quality events to this sink.
    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    /// Registers the upload and persists the `Pending` record. Processing
    /// starts separately so callers can queue first and drive later.
    pub fn submit(&self, request: &ImportRequest) -> Result<StatementImport> {
        let hash = content_hash(&request.bytes);
        let record = StatementImport::new(request, hash);
        info!(
            "Queued statement import {} for account {} ({}, {} bytes)",
            record.id, record.account_id, record.filename, record.byte_size
        );
        self.imports.insert(record.clone())?;
        Ok(record)
    }

    /// Submits and processes in one call.
    pub async fn run(
        &self,
        request: ImportRequest,
        cancel: &CancelFlag,
    ) -> Result<StatementImport> {
        let record = self.submit(&request)?;
        self.process(&record.id, &request.bytes, cancel).await
    }

    /// Processes a batch with bounded parallelism. Results come back in
    /// completion order.
    pub async fn run_many(
        &self,
        requests: Vec<ImportRequest>,
        cancel: &CancelFlag,
    ) -> Vec<Result<StatementImport>> {
        stream::iter(
            requests
                .into_iter()
                .map(|request| self.run(request, cancel)),
        )
        .buffer_unordered(self.config.max_concurrent_imports)
        .collect()
        .await
    }

    /// Runs a `Pending` import through the pipeline, or resumes a
    /// `Processing` one after a crash. The content-hash cache and dedup make
    /// a resume idempotent: no second OCR or structuring bill, no duplicate
    /// rows.
    pub async fn process(
        &self,
        import_id: &str,
        bytes: &[u8],
        cancel: &CancelFlag,
    ) -> Result<StatementImport> {
        let mut record = self
            .imports
            .get(import_id)?
            .ok_or_else(|| ImportError::UnknownImport(import_id.to_string()))?;

        let hash = content_hash(bytes);
        if hash != record.content_hash {
            return Err(ImportError::InvalidState {
                id: record.id,
                state: record.status.to_string(),
                action: "process with different file content".to_string(),
            });
        }

        match record.status {
            ImportStatus::Pending => {}
            ImportStatus::Processing => {
                info!("Resuming import {} left in processing", record.id);
            }
            other => {
                return Err(ImportError::InvalidState {
                    id: record.id,
                    state: other.to_string(),
                    action: "process".to_string(),
                });
            }
        }

        self.events
            .emit(PipelineEvent::Started {
                import_id: record.id.clone(),
                correlation_id: record.metadata.correlation_id.clone(),
            })
            .await;

        if cancel.is_cancelled() {
            return self.finish_cancelled(record, Stage::Ocr).await;
        }

        if record.status == ImportStatus::Pending {
            self.set_status(&mut record, ImportStatus::Processing)
                .await?;
        }
        reset_progress(&mut record);

        if !self.config.supports_mime(&record.mime_type) {
            let diagnostic = format!("unsupported mime type {}", record.mime_type);
            return self
                .finish_failed(
                    record,
                    Stage::Ocr,
                    ErrorCategory::UnsupportedFormat,
                    diagnostic,
                )
                .await;
        }

        // OCR, cache first.
        record.metadata.last_stage = Some(Stage::Ocr);
        let ocr_request = OcrRequest {
            bytes,
            mime_type: &record.mime_type,
            filename: &record.filename,
        };
        let fetched = self
            .ocr
            .fetch(&record.id, &record.content_hash, ocr_request, &self.events)
            .await;
        let (mut entry, ocr_from_cache) = match fetched {
            Ok(fetched) => fetched,
            Err(ImportError::Ocr(err)) => {
                return self
                    .finish_failed(
                        record,
                        Stage::Ocr,
                        ErrorCategory::from(&err),
                        err.to_string(),
                    )
                    .await;
            }
            Err(other) => return Err(other),
        };
        record.metadata.ocr_cache_hit = Some(ocr_from_cache);
        record.metadata.page_count = Some(entry.page_count);
        self.events
            .emit(PipelineEvent::OcrCompleted {
                import_id: record.id.clone(),
                pages: entry.page_count,
                from_cache: ocr_from_cache,
            })
            .await;

        if entry.text.trim().is_empty() {
            return self
                .finish_failed(
                    record,
                    Stage::Ocr,
                    ErrorCategory::Unknown,
                    "OCR produced no text".to_string(),
                )
                .await;
        }

        if cancel.is_cancelled() {
            return self.finish_cancelled(record, Stage::Structuring).await;
        }

        // Structuring, reusing a cached result when the same content was
        // structured before.
        record.metadata.last_stage = Some(Stage::Structuring);
        let (structured, structured_from_cache) = match entry.structured.take() {
            Some(structured) => {
                info!(
                    "Reusing cached structured result for import {} (hash {})",
                    record.id, record.content_hash
                );
                (structured, true)
            }
            None => match self.extractor.extract(&record.id, &entry.text).await {
                Ok(structured) => {
                    self.cache
                        .attach_structured(&record.content_hash, &structured)?;
                    (structured, false)
                }
                Err(err) => {
                    return self
                        .finish_failed(
                            record,
                            Stage::Structuring,
                            ErrorCategory::from(&err),
                            err.to_string(),
                        )
                        .await;
                }
            },
        };
        record.metadata.structured_cache_hit = Some(structured_from_cache);
        self.events
            .emit(PipelineEvent::StructuringCompleted {
                import_id: record.id.clone(),
                transactions: structured.transactions.len() as u32,
                from_cache: structured_from_cache,
            })
            .await;

        record.statement_start = structured
            .period
            .start_date
            .as_deref()
            .and_then(parse_flexible_date);
        record.statement_end = structured
            .period
            .end_date
            .as_deref()
            .and_then(parse_flexible_date);
        record.closing_balance = structured.closing_balance.as_ref().map(|b| b.amount);
        record.balance_source = structured.closing_balance.as_ref().map(|b| b.source.clone());

        if cancel.is_cancelled() {
            return self.finish_cancelled(record, Stage::Validation).await;
        }

        // Validation and normalization.
        record.metadata.last_stage = Some(Stage::Validation);
        let report =
            ExtractionValidator::new(self.config.validator).validate(&record.id, &entry.text, &structured.transactions);
        self.apply_report(&mut record, &report).await;

        record.metadata.last_stage = Some(Stage::Normalization);
        let batch = normalize::normalize_rows(&record.id, &report.rows);
        record.metadata.sign_corrections = batch.summary.sign_corrections;
        record.metadata.classification_fallbacks = batch.summary.classification_fallbacks;
        record.metadata.ambiguous_payments = batch.summary.ambiguous_payments;
        self.emit_normalization_events(&record.id, &batch).await;

        let score = confidence::score(&ConfidenceInputs {
            total_rows: report.total,
            discarded_rows: report.discarded.len() as u32,
            malformed_rows: report.malformed.len() as u32,
            classification_fallbacks: batch.summary.classification_fallbacks,
            ambiguous_payments: batch.summary.ambiguous_payments,
            has_end_date: record.statement_end.is_some(),
            balance_source: record.balance_source.clone(),
        });
        record.confidence = Some(score);

        // Review routing: persist counters and confidence, commit nothing.
        let discard_fraction = report.discard_fraction();
        let held_for_missing_end = record.statement_end.is_none()
            && record.closing_balance.is_some()
            && self.config.missing_end_date_policy == MissingEndDatePolicy::HoldForReview;
        let needs_review = score < self.config.review_confidence_threshold
            || discard_fraction > self.config.review_discard_fraction
            || held_for_missing_end;
        if needs_review {
            warn!(
                "Routing import {} to review: confidence {}, discard fraction {:.2}{}",
                record.id,
                score,
                discard_fraction,
                if held_for_missing_end {
                    ", no statement end date"
                } else {
                    ""
                }
            );
            self.events
                .emit(PipelineEvent::ReviewRequired {
                    import_id: record.id.clone(),
                    confidence: score,
                    discard_fraction,
                })
                .await;
            self.set_status(&mut record, ImportStatus::Review).await?;
            return Ok(record);
        }

        self.commit(record, batch, cancel).await
    }

    /// Commits an import a human has confirmed in review. OCR and structured
    /// results come from the cache, so confirmation never re-bills the
    /// providers.
    pub async fn confirm_review(&self, import_id: &str) -> Result<StatementImport> {
        let mut record = self.expect_review(import_id, "confirm review")?;
        info!("Import {} confirmed in review", record.id);

        let entry = self.cache.get(&record.content_hash)?.ok_or_else(|| {
            ImportError::InvalidState {
                id: record.id.clone(),
                state: record.status.to_string(),
                action: "confirm review without a cached OCR result".to_string(),
            }
        })?;
        let structured = entry
            .structured
            .as_ref()
            .ok_or_else(|| ImportError::InvalidState {
                id: record.id.clone(),
                state: record.status.to_string(),
                action: "confirm review without a cached structured result".to_string(),
            })?;

        reset_progress(&mut record);
        let report = ExtractionValidator::new(self.config.validator).validate(
            &record.id,
            &entry.text,
            &structured.transactions,
        );
        self.apply_report(&mut record, &report).await;
        let batch = normalize::normalize_rows(&record.id, &report.rows);
        record.metadata.sign_corrections = batch.summary.sign_corrections;
        record.metadata.classification_fallbacks = batch.summary.classification_fallbacks;
        record.metadata.ambiguous_payments = batch.summary.ambiguous_payments;
        record.confidence = Some(confidence::score(&ConfidenceInputs {
            total_rows: report.total,
            discarded_rows: report.discarded.len() as u32,
            malformed_rows: report.malformed.len() as u32,
            classification_fallbacks: batch.summary.classification_fallbacks,
            ambiguous_payments: batch.summary.ambiguous_payments,
            has_end_date: record.statement_end.is_some(),
            balance_source: record.balance_source.clone(),
        }));

        self.commit(record, batch, &CancelFlag::new()).await
    }

    /// Cancels an import waiting in review.
    pub async fn reject_review(&self, import_id: &str) -> Result<StatementImport> {
        let mut record = self.expect_review(import_id, "reject review")?;
        info!("Import {} rejected in review", record.id);
        self.events
            .emit(PipelineEvent::Cancelled {
                import_id: record.id.clone(),
                stage: Stage::Persistence,
            })
            .await;
        self.set_status(&mut record, ImportStatus::Cancelled)
            .await?;
        Ok(record)
    }

    fn expect_review(&self, import_id: &str, action: &str) -> Result<StatementImport> {
        let record = self
            .imports
            .get(import_id)?
            .ok_or_else(|| ImportError::UnknownImport(import_id.to_string()))?;
        if record.status != ImportStatus::Review {
            return Err(ImportError::InvalidState {
                id: record.id,
                state: record.status.to_string(),
                action: action.to_string(),
            });
        }
        Ok(record)
    }

    /// Dedup, per-row persistence, balance reconciliation and completion.
    /// The reconciliation read-decide-write and the final status flip run
    /// inside the per-account lock, so a concurrent import for the account
    /// always observes either "not completed" or "completed with its balance
    /// applied". No provider call happens in here.
    async fn commit(
        &self,
        mut record: StatementImport,
        batch: NormalizedBatch,
        cancel: &CancelFlag,
    ) -> Result<StatementImport> {
        if cancel.is_cancelled() {
            return self.finish_cancelled(record, Stage::Persistence).await;
        }

        record.metadata.last_stage = Some(Stage::Persistence);
        let existing = self.transactions.for_account(&record.account_id)?;
        let mut dedup = DedupEngine::new(self.config.dedup, existing);

        for row in &batch.rows {
            let outcome = dedup.check(&record.id, row);
            if let Some(matched_id) = outcome.matched_id() {
                record.counters.duplicates += 1;
                self.events
                    .emit(PipelineEvent::DuplicateSkipped {
                        import_id: record.id.clone(),
                        date: row.date,
                        amount: row.amount,
                        matched_id: matched_id.to_string(),
                        by_reference: matches!(outcome, DedupOutcome::DuplicateByReference { .. }),
                    })
                    .await;
                continue;
            }

            let transaction = Transaction {
                id: Uuid::new_v4().to_string(),
                user_id: record.user_id.clone(),
                account_id: record.account_id.clone(),
                import_id: record.id.clone(),
                date: row.date,
                description: row.description.clone(),
                amount: row.amount,
                kind: row.kind,
                reference: row.reference.clone(),
                category: None,
                created_at: chrono::Utc::now(),
            };
            match self.transactions.insert(transaction) {
                Ok(()) => record.counters.imported += 1,
                Err(err) => {
                    // One bad row must not abort the statement.
                    record.counters.failed += 1;
                    error!(
                        "Failed to persist row {:?} on {} for import {}: {}",
                        row.description, row.date, record.id, err
                    );
                }
            }
        }

        record.metadata.last_stage = Some(Stage::Reconciliation);
        let lock = self.account_locks.for_account(&record.account_id)?;
        let (decision, previous_status) = {
            let _guard = lock.lock().await;

            let completed = self.imports.completed_for_account(&record.account_id)?;
            let completed_end_dates: Vec<NaiveDate> = completed
                .iter()
                .filter(|other| other.id != record.id)
                .filter_map(|other| other.statement_end)
                .collect();
            let closing = record.closing_balance.map(|amount| ClosingBalance {
                amount,
                source: record
                    .balance_source
                    .clone()
                    .unwrap_or(BalanceSource::Inferred),
            });
            let decision = reconcile_balance(
                &record.id,
                &record.account_id,
                self.config.missing_end_date_policy,
                record.statement_end,
                closing.as_ref(),
                &completed_end_dates,
            );
            if let BalanceDecision::Applied { balance } = &decision {
                self.accounts.set_balance(&record.account_id, *balance)?;
            }

            record.metadata.balance_decision = Some(decision.describe());
            record.metadata.last_stage = Some(Stage::Finalize);
            let previous_status = record.status;
            record.transition(ImportStatus::Completed)?;
            self.imports.update(&record)?;
            (decision, previous_status)
        };

        self.events
            .emit(PipelineEvent::StatusChanged {
                import_id: record.id.clone(),
                from: previous_status,
                to: ImportStatus::Completed,
            })
            .await;
        match &decision {
            BalanceDecision::Applied { balance } => {
                self.events
                    .emit(PipelineEvent::BalanceApplied {
                        import_id: record.id.clone(),
                        account_id: record.account_id.clone(),
                        balance: *balance,
                    })
                    .await;
            }
            BalanceDecision::SkippedStale {
                statement_end,
                newest_end,
            } => {
                self.events
                    .emit(PipelineEvent::BalanceSkippedStale {
                        import_id: record.id.clone(),
                        statement_end: *statement_end,
                        newest_end: *newest_end,
                    })
                    .await;
            }
            BalanceDecision::HeldForReview => {
                self.events
                    .emit(PipelineEvent::BalanceHeldForReview {
                        import_id: record.id.clone(),
                    })
                    .await;
            }
            BalanceDecision::SkippedNoBalance => {}
        }

        info!(
            "Import {} completed: {} imported, {} duplicates, {} failed of {} rows",
            record.id,
            record.counters.imported,
            record.counters.duplicates,
            record.counters.failed,
            record.counters.total
        );
        self.events
            .emit(PipelineEvent::Completed {
                import_id: record.id.clone(),
                imported: record.counters.imported,
                duplicates: record.counters.duplicates,
                failed: record.counters.failed,
            })
            .await;
        Ok(record)
    }

    async fn apply_report(&self, record: &mut StatementImport, report: &ValidationReport) {
        record.counters.total = report.total;
        record.counters.failed += report.malformed.len() as u32;
        record.metadata.rows_discarded = report.discarded.len() as u32;
        record.metadata.rows_malformed = report.malformed.len() as u32;
        if !report.discarded.is_empty() {
            self.events
                .emit(PipelineEvent::RowsDiscarded {
                    import_id: record.id.clone(),
                    discarded: report.discarded.len() as u32,
                    total: report.total,
                })
                .await;
        }
    }

    async fn emit_normalization_events(&self, import_id: &str, batch: &NormalizedBatch) {
        for row in &batch.rows {
            for note in &row.notes {
                let event = match note {
                    NormalizationNote::SignCorrected {
                        original,
                        corrected,
                        entry_type,
                    } => PipelineEvent::SignCorrected {
                        import_id: import_id.to_string(),
                        description: row.description.clone(),
                        original: *original,
                        corrected: *corrected,
                        entry_type: entry_type.clone(),
                    },
                    NormalizationNote::AmbiguousPaymentResolved { resolved_to } => {
                        PipelineEvent::AmbiguousPayment {
                            import_id: import_id.to_string(),
                            description: row.description.clone(),
                            resolved: *resolved_to,
                        }
                    }
                    NormalizationNote::SignFallback { entry_type } => {
                        PipelineEvent::ClassificationFallback {
                            import_id: import_id.to_string(),
                            description: row.description.clone(),
                            raw_type: entry_type.clone(),
                            resolved: row.kind,
                        }
                    }
                };
                self.events.emit(event).await;
            }
        }
    }

    /// Persists a status change together with the current counters in one
    /// store update.
    async fn set_status(&self, record: &mut StatementImport, next: ImportStatus) -> Result<()> {
        let from = record.status;
        record.transition(next)?;
        self.imports.update(record)?;
        info!("Import {} moved {} -> {}", record.id, from, next);
        self.events
            .emit(PipelineEvent::StatusChanged {
                import_id: record.id.clone(),
                from,
                to: next,
            })
            .await;
        Ok(())
    }

    async fn finish_cancelled(
        &self,
        mut record: StatementImport,
        next_stage: Stage,
    ) -> Result<StatementImport> {
        warn!("Import {} cancelled before {}", record.id, next_stage);
        self.events
            .emit(PipelineEvent::Cancelled {
                import_id: record.id.clone(),
                stage: next_stage,
            })
            .await;
        self.set_status(&mut record, ImportStatus::Cancelled)
            .await?;
        Ok(record)
    }

    async fn finish_failed(
        &self,
        mut record: StatementImport,
        stage: Stage,
        category: ErrorCategory,
        diagnostic: String,
    ) -> Result<StatementImport> {
        error!(
            "Import {} failed at {}: {} ({})",
            record.id,
            stage,
            category.as_str(),
            diagnostic
        );
        record.record_failure(category, truncate_diagnostic(&diagnostic));
        record.metadata.last_stage = Some(stage);
        self.events
            .emit(PipelineEvent::StageFailed {
                import_id: record.id.clone(),
                stage,
                category: category.as_str().to_string(),
            })
            .await;
        self.set_status(&mut record, ImportStatus::Failed).await?;
        Ok(record)
    }
}

fn reset_progress(record: &mut StatementImport) {
    record.counters = ImportCounters::default();
    record.confidence = None;
    record.metadata.rows_discarded = 0;
    record.metadata.rows_malformed = 0;
    record.metadata.sign_corrections = 0;
    record.metadata.classification_fallbacks = 0;
    record.metadata.ambiguous_payments = 0;
    record.metadata.balance_decision = None;
}
