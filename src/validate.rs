use chrono::NaiveDate;
use log::warn;
use serde::{Deserialize, Serialize};

use crate::schema::{EntryType, StatementRow};
use crate::utils::{amount_variants, canonicalize_text, parse_flexible_date, significant_tokens};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidatorConfig {
    /// Fraction of a row's significant description tokens that must appear
    /// in the OCR text for the row to count as corroborated.
    pub min_token_overlap: f64,
}

impl Default for ValidatorConfig {
    fn default() -> Self {
        ValidatorConfig {
            min_token_overlap: 0.5,
        }
    }
}

/// A structured row that survived corroboration, with its date parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct CorroboratedRow {
    pub date: NaiveDate,
    pub description: String,
    pub amount: f64,
    pub entry_type: Option<EntryType>,
    pub reference: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardReason {
    AmountNotInSource,
    DescriptionNotInSource,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscardReason::AmountNotInSource => "amount not found in OCR text",
            DiscardReason::DescriptionNotInSource => "description not found in OCR text",
        }
    }
}

#[derive(Debug, Clone)]
pub struct DiscardedRow {
    pub description: String,
    pub amount: f64,
    pub reason: DiscardReason,
}

/// A row dropped before corroboration because its data is unusable.
#[derive(Debug, Clone)]
pub struct MalformedRow {
    pub description: String,
    pub raw_date: String,
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub rows: Vec<CorroboratedRow>,
    pub discarded: Vec<DiscardedRow>,
    pub malformed: Vec<MalformedRow>,
    pub total: u32,
}

impl ValidationReport {
    pub fn discard_fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.discarded.len() as f64 / self.total as f64
        }
    }
}

/// Cross-checks structured rows against the OCR text they were extracted
/// from. A structuring model under pressure will hallucinate plausible rows;
/// a row whose amount and description cannot be found in the source text is
/// dropped rather than persisted.
pub struct ExtractionValidator {
    config: ValidatorConfig,
}

impl ExtractionValidator {
    pub fn new(config: ValidatorConfig) -> Self {
        ExtractionValidator { config }
    }

    pub fn validate(
        &self,
        import_id: &str,
        ocr_text: &str,
        rows: &[StatementRow],
    ) -> ValidationReport {
        let haystack = canonicalize_text(ocr_text);
        let mut report = ValidationReport {
            total: rows.len() as u32,
            ..ValidationReport::default()
        };

        for row in rows {
            // 1. The date must parse; a row without a usable date cannot be
            //    persisted or deduplicated.
            let date = match parse_flexible_date(&row.date) {
                Some(date) => date,
                None => {
                    warn!(
                        "Dropping malformed row for import {}: unparseable date {:?} ({})",
                        import_id, row.date, row.description
                    );
                    report.malformed.push(MalformedRow {
                        description: row.description.clone(),
                        raw_date: row.date.clone(),
                    });
                    continue;
                }
            };

            // 2. The amount must appear somewhere in the source text.
            if !amount_appears(&haystack, row.amount) {
                warn!(
                    "Discarding uncorroborated row for import {}: amount {:.2} not in source ({})",
                    import_id, row.amount, row.description
                );
                report.discarded.push(DiscardedRow {
                    description: row.description.clone(),
                    amount: row.amount,
                    reason: DiscardReason::AmountNotInSource,
                });
                continue;
            }

            // 3. Enough of the description must appear too.
            let overlap = token_overlap(&haystack, &row.description);
            if overlap < self.config.min_token_overlap {
                warn!(
                    "Discarding uncorroborated row for import {}: description overlap {:.2} below {:.2} ({})",
                    import_id, overlap, self.config.min_token_overlap, row.description
                );
                report.discarded.push(DiscardedRow {
                    description: row.description.clone(),
                    amount: row.amount,
                    reason: DiscardReason::DescriptionNotInSource,
                });
                continue;
            }

            report.rows.push(CorroboratedRow {
                date,
                description: row.description.clone(),
                amount: row.amount,
                entry_type: row.transaction_type.clone(),
                reference: row.reference.clone(),
            });
        }

        if !report.discarded.is_empty() {
            warn!(
                "Validator discarded {} of {} row(s) for import {}",
                report.discarded.len(),
                report.total,
                import_id
            );
        }

        report
    }
}

fn amount_appears(haystack: &str, amount: f64) -> bool {
    amount_variants(amount)
        .iter()
        .any(|variant| haystack.contains(variant.as_str()))
}

fn token_overlap(haystack: &str, description: &str) -> f64 {
    let tokens = significant_tokens(description);
    if tokens.is_empty() {
        // Nothing to corroborate on; the amount check carries the row.
        return 1.0;
    }
    let hits = tokens
        .iter()
        .filter(|token| haystack.contains(token.as_str()))
        .count();
    hits as f64 / tokens.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    const OCR_TEXT: &str = "\
# Account Statement\n\
| 15/01/2025 | SALARY ACME CORP | 2,500.00 |\n\
| 16/01/2025 | COFFEE CORNER | -4.50 |\n\
| 20/01/2025 | RENT JANUARY | -1,200.00 |\n\
Closing balance: 1,295.50";

    fn row(date: &str, description: &str, amount: f64) -> StatementRow {
        StatementRow {
            date: date.to_string(),
            description: description.to_string(),
            amount,
            transaction_type: Some(EntryType::Debit),
            reference: None,
        }
    }

    fn validator() -> ExtractionValidator {
        ExtractionValidator::new(ValidatorConfig::default())
    }

    #[test]
    fn test_corroborated_rows_pass() {
        let rows = vec![
            row("2025-01-15", "SALARY ACME CORP", 2500.0),
            row("2025-01-16", "COFFEE CORNER", -4.5),
        ];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert_eq!(report.rows.len(), 2);
        assert!(report.discarded.is_empty());
        assert!(report.malformed.is_empty());
        assert_eq!(
            report.rows[0].date,
            NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()
        );
    }

    #[test]
    fn test_hallucinated_amount_is_discarded() {
        let rows = vec![row("2025-01-17", "SALARY ACME CORP", 999.99)];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert!(report.rows.is_empty());
        assert_eq!(report.discarded.len(), 1);
        assert_eq!(
            report.discarded[0].reason,
            DiscardReason::AmountNotInSource
        );
    }

    #[test]
    fn test_hallucinated_description_is_discarded() {
        // The amount 4.50 exists, but this merchant never appears.
        let rows = vec![row("2025-01-16", "UNICORN GADGETS EMPORIUM", -4.5)];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert!(report.rows.is_empty());
        assert_eq!(
            report.discarded[0].reason,
            DiscardReason::DescriptionNotInSource
        );
    }

    #[test]
    fn test_partial_description_overlap_passes() {
        // OCR noise truncated the merchant; half the tokens still match.
        let rows = vec![row("2025-01-16", "COFFEE SHOP", -4.5)];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert_eq!(report.rows.len(), 1);
    }

    #[test]
    fn test_unparseable_date_is_malformed_not_discarded() {
        let rows = vec![row("January the 15th", "SALARY ACME CORP", 2500.0)];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert!(report.rows.is_empty());
        assert!(report.discarded.is_empty());
        assert_eq!(report.malformed.len(), 1);
        assert_eq!(report.malformed[0].raw_date, "January the 15th");
    }

    #[test]
    fn test_grouped_amounts_are_found() {
        let rows = vec![row("2025-01-20", "RENT JANUARY", -1200.0)];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert_eq!(report.rows.len(), 1, "1,200.00 should match 1200.0");
    }

    #[test]
    fn test_discard_fraction() {
        let rows = vec![
            row("2025-01-15", "SALARY ACME CORP", 2500.0),
            row("2025-01-17", "GHOST ROW ONE", 111.11),
            row("2025-01-18", "GHOST ROW TWO", 222.22),
            row("2025-01-19", "GHOST ROW THREE", 333.33),
        ];
        let report = validator().validate("imp-1", OCR_TEXT, &rows);
        assert_eq!(report.rows.len(), 1);
        assert_eq!(report.discarded.len(), 3);
        assert!((report.discard_fraction() - 0.75).abs() < f64::EPSILON);
    }

    #[test]
    fn test_empty_input() {
        let report = validator().validate("imp-1", OCR_TEXT, &[]);
        assert_eq!(report.total, 0);
        assert_eq!(report.discard_fraction(), 0.0);
    }
}
