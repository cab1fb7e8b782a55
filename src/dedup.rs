use std::collections::HashSet;

use log::info;
use serde::{Deserialize, Serialize};

use crate::models::Transaction;
use crate::normalize::NormalizedRow;
use crate::utils::{amounts_equal, significant_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DedupConfig {
    /// Days either side of the candidate date a fuzzy match may sit.
    pub date_tolerance_days: i64,
    /// Description token overlap (Jaccard) two rows need to count as the
    /// same transaction.
    pub min_description_similarity: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        DedupConfig {
            date_tolerance_days: 1,
            min_description_similarity: 0.8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum DedupOutcome {
    Unique,
    DuplicateByReference { matched_id: String },
    FuzzyDuplicate { matched_id: String, similarity: f64 },
}

impl DedupOutcome {
    pub fn is_duplicate(&self) -> bool {
        !matches!(self, DedupOutcome::Unique)
    }

    pub fn matched_id(&self) -> Option<&str> {
        match self {
            DedupOutcome::Unique => None,
            DedupOutcome::DuplicateByReference { matched_id } => Some(matched_id),
            DedupOutcome::FuzzyDuplicate { matched_id, .. } => Some(matched_id),
        }
    }
}

/// Checks normalized rows against the account's persisted transactions so a
/// re-uploaded statement does not insert its rows twice.
///
/// Each existing transaction can absorb at most one candidate. A statement
/// that legitimately contains twin rows (two identical card payments on the
/// same day) therefore imports both of them the first time, and matches both
/// of them on a re-upload.
pub struct DedupEngine {
    config: DedupConfig,
    existing: Vec<Transaction>,
    claimed: Vec<bool>,
}

impl DedupEngine {
    /// `existing` is the account's persisted transaction list, fetched once
    /// per import.
    pub fn new(config: DedupConfig, existing: Vec<Transaction>) -> Self {
        let claimed = vec![false; existing.len()];
        DedupEngine {
            config,
            existing,
            claimed,
        }
    }

    pub fn check(&mut self, import_id: &str, candidate: &NormalizedRow) -> DedupOutcome {
        let candidate_reference = normalized_reference(&candidate.reference);

        // Reference match: same date, same amount, same bank reference.
        if let Some(reference) = &candidate_reference {
            for (i, transaction) in self.existing.iter().enumerate() {
                if self.claimed[i] {
                    continue;
                }
                let Some(existing_reference) = normalized_reference(&transaction.reference) else {
                    continue;
                };
                if existing_reference == *reference
                    && transaction.date == candidate.date
                    && amounts_equal(transaction.amount, candidate.amount)
                {
                    self.claimed[i] = true;
                    info!(
                        "Skipping duplicate for import {}: reference {:?} matches transaction {}",
                        import_id, candidate.reference, transaction.id
                    );
                    return DedupOutcome::DuplicateByReference {
                        matched_id: transaction.id.clone(),
                    };
                }
            }
        }

        // Fuzzy match: close date, equal amount, similar description.
        let candidate_tokens = significant_tokens(&candidate.description);
        let mut best: Option<(usize, f64)> = None;
        for (i, transaction) in self.existing.iter().enumerate() {
            if self.claimed[i] {
                continue;
            }
            // Two rows that both carry a reference, but different ones, are
            // distinct transactions no matter how alike they look.
            if let (Some(a), Some(b)) = (
                &candidate_reference,
                normalized_reference(&transaction.reference),
            ) {
                if *a != b {
                    continue;
                }
            }
            let day_gap = (transaction.date - candidate.date).num_days().abs();
            if day_gap > self.config.date_tolerance_days {
                continue;
            }
            if !amounts_equal(transaction.amount, candidate.amount) {
                continue;
            }
            let similarity = description_similarity(&candidate_tokens, &transaction.description);
            if similarity >= self.config.min_description_similarity
                && best.map_or(true, |(_, current)| similarity > current)
            {
                best = Some((i, similarity));
            }
        }

        if let Some((i, similarity)) = best {
            self.claimed[i] = true;
            let matched_id = self.existing[i].id.clone();
            info!(
                "Skipping duplicate for import {}: {:?} on {} fuzzy-matches transaction {} (similarity {:.2})",
                import_id, candidate.description, candidate.date, matched_id, similarity
            );
            return DedupOutcome::FuzzyDuplicate {
                matched_id,
                similarity,
            };
        }

        DedupOutcome::Unique
    }
}

fn normalized_reference(reference: &Option<String>) -> Option<String> {
    reference
        .as_ref()
        .map(|r| r.trim().to_lowercase())
        .filter(|r| !r.is_empty())
}

/// Jaccard overlap of the significant description tokens.
fn description_similarity(candidate_tokens: &[String], existing_description: &str) -> f64 {
    let existing_tokens = significant_tokens(existing_description);
    if candidate_tokens.is_empty() && existing_tokens.is_empty() {
        return 1.0;
    }
    if candidate_tokens.is_empty() || existing_tokens.is_empty() {
        return 0.0;
    }
    let a: HashSet<&str> = candidate_tokens.iter().map(String::as_str).collect();
    let b: HashSet<&str> = existing_tokens.iter().map(String::as_str).collect();
    let intersection = a.intersection(&b).count();
    let union = a.union(&b).count();
    intersection as f64 / union as f64
}
