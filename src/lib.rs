//! # Statement Ingest
//!
//! A library for turning uploaded bank-statement documents (PDFs and scans)
//! into clean, deduplicated transaction rows and an up-to-date account
//! balance, using OCR and LLM structuring with validation against the source
//! text.
//!
//! ## Core Concepts
//!
//! - **Import Record**: One upload's full lifecycle (`pending` through
//!   `completed`/`failed`/`cancelled`), persisted after every status change
//! - **Content Hash**: SHA-256 of the uploaded bytes; OCR and structuring
//!   results are cached by it, so re-uploads never re-bill the providers
//! - **Corroboration**: Every extracted row must trace back to the OCR text
//!   (amount and description), or it is discarded as a hallucination
//! - **Normalization**: Statement-side transaction types map onto
//!   income/expense, and amount signs are forced to match, with every
//!   correction logged
//! - **Review**: Low-confidence imports park for a human instead of
//!   committing silently; confirmation commits from cache, rejection cancels
//! - **Reconciliation**: Only the newest statement (by period end date) may
//!   set the account balance
//!
//! ## Example
//!
//! ```rust,ignore
//! use statement_ingest::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let pipeline = ImportPipeline::new(
//!         HttpOcrClient::new(std::env::var("OCR_API_KEY").unwrap()),
//!         GeminiClient::new(std::env::var("GEMINI_API_KEY").unwrap()),
//!         PipelineStores::shared(store),
//!         PipelineConfig::default(),
//!     )?;
//!
//!     let request = ImportRequest {
//!         user_id: "user-1".to_string(),
//!         account_id: "acct-42".to_string(),
//!         filename: "january.pdf".to_string(),
//!         mime_type: "application/pdf".to_string(),
//!         storage_ref: None,
//!         bytes: std::fs::read("january.pdf").unwrap(),
//!     };
//!
//!     let import = pipeline.run(request, &CancelFlag::new()).await?;
//!     println!(
//!         "{}: {} imported, {} duplicates, confidence {:?}",
//!         import.id, import.counters.imported, import.counters.duplicates, import.confidence
//!     );
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod confidence;
pub mod dedup;
pub mod error;
pub mod events;
pub mod llm;
pub mod models;
pub mod normalize;
pub mod ocr;
pub mod pipeline;
pub mod reconcile;
pub mod retry;
pub mod schema;
pub mod store;
pub mod utils;
pub mod validate;

pub use config::{MissingEndDatePolicy, PipelineConfig};
pub use confidence::{score, ConfidenceInputs};
pub use dedup::{DedupConfig, DedupEngine, DedupOutcome};
pub use error::{ErrorCategory, ImportError, OcrError, Result, StructuringError};
pub use events::{EventSink, PipelineEvent};
pub use llm::{GeminiClient, StatementExtractor, StructuringProvider};
pub use models::*;
pub use normalize::{normalize_rows, NormalizationNote, NormalizedBatch, NormalizedRow};
pub use ocr::{HttpOcrClient, OcrClient, OcrOutcome, OcrProvider, OcrRequest};
pub use pipeline::{CancelFlag, ImportPipeline, PipelineStores};
pub use reconcile::{reconcile_balance, BalanceDecision};
pub use retry::{run_with_retry, RetryPolicy};
pub use schema::*;
pub use store::{AccountStore, ImportStore, MemoryStore, OcrCacheStore, TransactionStore};
pub use utils::*;
pub use validate::{ExtractionValidator, ValidationReport, ValidatorConfig};
