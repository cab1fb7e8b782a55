use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use crate::error::{ImportError, Result};
use crate::models::{ImportStatus, OcrCacheEntry, StatementImport, Transaction};
use crate::schema::StructuredStatement;

/// Persistence seam for statement-import records.
///
/// `update` persists the whole record in one operation, so a status change
/// always lands together with its counters. SQL-backed implementations map
/// it to a single UPDATE statement.
pub trait ImportStore: Send + Sync {
    fn insert(&self, record: StatementImport) -> Result<()>;
    fn get(&self, id: &str) -> Result<Option<StatementImport>>;
    fn update(&self, record: &StatementImport) -> Result<()>;
    /// Completed imports for an account. Feeds the balance recency check.
    fn completed_for_account(&self, account_id: &str) -> Result<Vec<StatementImport>>;
}

pub trait TransactionStore: Send + Sync {
    fn insert(&self, transaction: Transaction) -> Result<()>;
    fn for_account(&self, account_id: &str) -> Result<Vec<Transaction>>;
    fn for_import(&self, import_id: &str) -> Result<Vec<Transaction>>;
}

/// Account balances live outside the pipeline; this is the only surface it
/// touches them through, and the reconciler is the only writer.
pub trait AccountStore: Send + Sync {
    fn balance(&self, account_id: &str) -> Result<Option<f64>>;
    fn set_balance(&self, account_id: &str, balance: f64) -> Result<()>;
}

pub trait OcrCacheStore: Send + Sync {
    fn get(&self, content_hash: &str) -> Result<Option<OcrCacheEntry>>;
    fn put(&self, entry: OcrCacheEntry) -> Result<()>;
    /// Attaches the structured result to an existing entry so identical
    /// content never pays for structuring twice.
    fn attach_structured(
        &self,
        content_hash: &str,
        structured: &StructuredStatement,
    ) -> Result<()>;
}

/// In-memory store backing tests and embedders without a database.
///
/// Beyond storage it enforces the record contract on `update`: counters must
/// stay consistent and `completed_at` must be set exactly on terminal
/// states, so contract violations fail loudly instead of persisting.
#[derive(Default)]
pub struct MemoryStore {
    imports: Mutex<HashMap<String, StatementImport>>,
    transactions: Mutex<Vec<Transaction>>,
    balances: Mutex<HashMap<String, f64>>,
    ocr_cache: Mutex<HashMap<String, OcrCacheEntry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> Result<MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|_| ImportError::Store("store lock poisoned".to_string()))
    }

    fn check_record(record: &StatementImport) -> Result<()> {
        if !record.counters.is_consistent() {
            return Err(ImportError::Store(format!(
                "inconsistent counters for import {}: {:?}",
                record.id, record.counters
            )));
        }
        if record.status.is_terminal() != record.completed_at.is_some() {
            return Err(ImportError::Store(format!(
                "import {} is {} but completed_at is {}",
                record.id,
                record.status,
                if record.completed_at.is_some() {
                    "set"
                } else {
                    "unset"
                }
            )));
        }
        Ok(())
    }
}

impl ImportStore for MemoryStore {
    fn insert(&self, record: StatementImport) -> Result<()> {
        Self::check_record(&record)?;
        let mut imports = Self::lock(&self.imports)?;
        if imports.contains_key(&record.id) {
            return Err(ImportError::Store(format!(
                "import {} already exists",
                record.id
            )));
        }
        imports.insert(record.id.clone(), record);
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<StatementImport>> {
        Ok(Self::lock(&self.imports)?.get(id).cloned())
    }

    fn update(&self, record: &StatementImport) -> Result<()> {
        Self::check_record(record)?;
        let mut imports = Self::lock(&self.imports)?;
        match imports.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(())
            }
            None => Err(ImportError::Store(format!(
                "cannot update unknown import {}",
                record.id
            ))),
        }
    }

    fn completed_for_account(&self, account_id: &str) -> Result<Vec<StatementImport>> {
        Ok(Self::lock(&self.imports)?
            .values()
            .filter(|record| {
                record.account_id == account_id && record.status == ImportStatus::Completed
            })
            .cloned()
            .collect())
    }
}

impl TransactionStore for MemoryStore {
    fn insert(&self, transaction: Transaction) -> Result<()> {
        Self::lock(&self.transactions)?.push(transaction);
        Ok(())
    }

    fn for_account(&self, account_id: &str) -> Result<Vec<Transaction>> {
        Ok(Self::lock(&self.transactions)?
            .iter()
            .filter(|tx| tx.account_id == account_id)
            .cloned()
            .collect())
    }

    fn for_import(&self, import_id: &str) -> Result<Vec<Transaction>> {
        Ok(Self::lock(&self.transactions)?
            .iter()
            .filter(|tx| tx.import_id == import_id)
            .cloned()
            .collect())
    }
}

impl AccountStore for MemoryStore {
    fn balance(&self, account_id: &str) -> Result<Option<f64>> {
        Ok(Self::lock(&self.balances)?.get(account_id).copied())
    }

    fn set_balance(&self, account_id: &str, balance: f64) -> Result<()> {
        Self::lock(&self.balances)?.insert(account_id.to_string(), balance);
        Ok(())
    }
}

impl OcrCacheStore for MemoryStore {
    fn get(&self, content_hash: &str) -> Result<Option<OcrCacheEntry>> {
        Ok(Self::lock(&self.ocr_cache)?.get(content_hash).cloned())
    }

    fn put(&self, entry: OcrCacheEntry) -> Result<()> {
        Self::lock(&self.ocr_cache)?.insert(entry.content_hash.clone(), entry);
        Ok(())
    }

    fn attach_structured(
        &self,
        content_hash: &str,
        structured: &StructuredStatement,
    ) -> Result<()> {
        let mut cache = Self::lock(&self.ocr_cache)?;
        match cache.get_mut(content_hash) {
            Some(entry) => {
                entry.structured = Some(structured.clone());
                Ok(())
            }
            None => Err(ImportError::Store(format!(
                "no OCR cache entry for content hash {}",
                content_hash
            ))),
        }
    }
}
