use chrono::NaiveDate;
use log::{info, warn};

use crate::models::TransactionKind;
use crate::schema::EntryType;
use crate::validate::CorroboratedRow;

/// Raw type strings (from the `Unrecognized` absorption path) that clearly
/// mean money in or money out even though they are not canonical values.
const MONEY_IN_TYPE_PATTERNS: &[&str] = &[
    "payment received",
    "payment in",
    "deposit",
    "refund",
    "reversal",
    "cashback",
];

const MONEY_OUT_TYPE_PATTERNS: &[&str] = &[
    "payment made",
    "payment out",
    "payment sent",
    "withdrawal",
    "purchase",
    "charge",
];

/// Description keywords that disambiguate a `payment` row. Card statements
/// print incoming repayments as variations of "PAYMENT RECEIVED - THANKYOU".
const PAYMENT_INCOME_HINTS: &[&str] = &["thankyou", "thank you", "payment received", "refund"];

const PAYMENT_EXPENSE_HINTS: &[&str] = &["payment to", "bill payment", "direct debit", "autopay"];

/// What the normalizer had to do to a row beyond the happy path. Kept as
/// values so callers can count, persist and stream them without scraping
/// the log output.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalizationNote {
    /// The raw sign disagreed with the classified kind and was flipped.
    SignCorrected {
        original: f64,
        corrected: f64,
        entry_type: String,
    },
    /// An ambiguous `payment` row was resolved by description keywords.
    AmbiguousPaymentResolved { resolved_to: TransactionKind },
    /// No usable type signal; the raw amount sign decided the kind.
    SignFallback { entry_type: Option<String> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedRow {
    pub date: NaiveDate,
    pub description: String,
    /// Signed amount, consistent with `kind`: income non-negative, expense
    /// non-positive.
    pub amount: f64,
    pub kind: TransactionKind,
    pub reference: Option<String>,
    pub notes: Vec<NormalizationNote>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NormalizationSummary {
    pub sign_corrections: u32,
    pub classification_fallbacks: u32,
    pub ambiguous_payments: u32,
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    pub rows: Vec<NormalizedRow>,
    pub summary: NormalizationSummary,
}

enum KindDecision {
    /// Steps 1 and 2: the type signal alone settles the direction.
    Forced(TransactionKind),
    /// Step 3: `payment` resolved through description keywords.
    Ambiguous(TransactionKind),
    /// Step 4: nothing usable, the amount sign decides.
    Fallback,
}

/// Classifies corroborated rows as income or expense and forces the amount
/// sign to agree with the classification.
///
/// The three available signals (the structuring model's type tag, the raw
/// amount sign, and the free-text description) regularly contradict each
/// other, so the decision runs in strict priority order:
///
/// 1. `credit`, `interest` or a money-in type pattern: income, amount `+|a|`.
/// 2. `debit`, `fee` or a money-out type pattern: expense, amount `-|a|`.
/// 3. `payment`: resolved through description keywords, else step 4.
/// 4. Anything else (including `transfer`, which carries no direction of its
///    own): the raw amount sign decides, logged as degraded classification.
/// 5. The final amount sign must match the kind. When steps 1 to 3 chose a
///    kind that contradicts the raw sign, the sign is corrected, never the
///    kind, and the correction is logged with both amounts.
pub fn normalize_rows(import_id: &str, rows: &[CorroboratedRow]) -> NormalizedBatch {
    let mut batch = NormalizedBatch::default();
    for row in rows {
        let normalized = normalize_row(import_id, row, &mut batch.summary);
        batch.rows.push(normalized);
    }
    batch
}

fn normalize_row(
    import_id: &str,
    row: &CorroboratedRow,
    summary: &mut NormalizationSummary,
) -> NormalizedRow {
    let raw_amount = row.amount;
    let type_label = row
        .entry_type
        .as_ref()
        .map(|entry_type| entry_type.as_str().to_string());
    let mut notes = Vec::new();

    let kind = match decide_kind(row.entry_type.as_ref(), &row.description) {
        KindDecision::Forced(kind) => kind,
        KindDecision::Ambiguous(kind) => {
            summary.ambiguous_payments += 1;
            info!(
                "Ambiguous payment resolved to {} for import {} ({:?})",
                kind, import_id, row.description
            );
            notes.push(NormalizationNote::AmbiguousPaymentResolved { resolved_to: kind });
            kind
        }
        KindDecision::Fallback => {
            summary.classification_fallbacks += 1;
            warn!(
                "Classification fell back to amount sign for import {}: type {:?} gives no direction ({:?})",
                import_id, type_label, row.description
            );
            notes.push(NormalizationNote::SignFallback {
                entry_type: type_label.clone(),
            });
            if raw_amount >= 0.0 {
                TransactionKind::Income
            } else {
                TransactionKind::Expense
            }
        }
    };

    let amount = if raw_amount == 0.0 {
        0.0
    } else {
        match kind {
            TransactionKind::Income => raw_amount.abs(),
            TransactionKind::Expense => -raw_amount.abs(),
        }
    };

    if amount != raw_amount {
        summary.sign_corrections += 1;
        warn!(
            "Corrected amount sign for import {}: {:.2} -> {:.2}, type {:?} ({:?})",
            import_id, raw_amount, amount, type_label, row.description
        );
        notes.push(NormalizationNote::SignCorrected {
            original: raw_amount,
            corrected: amount,
            entry_type: type_label.unwrap_or_else(|| "none".to_string()),
        });
    }

    debug_assert!(kind.matches_sign(amount));

    NormalizedRow {
        date: row.date,
        description: row.description.clone(),
        amount,
        kind,
        reference: row.reference.clone(),
        notes,
    }
}

fn decide_kind(entry_type: Option<&EntryType>, description: &str) -> KindDecision {
    match entry_type {
        Some(EntryType::Credit) | Some(EntryType::Interest) => {
            KindDecision::Forced(TransactionKind::Income)
        }
        Some(EntryType::Debit) | Some(EntryType::Fee) => {
            KindDecision::Forced(TransactionKind::Expense)
        }
        Some(EntryType::Payment) => {
            let lowered = description.to_lowercase();
            if contains_any(&lowered, PAYMENT_INCOME_HINTS) {
                KindDecision::Ambiguous(TransactionKind::Income)
            } else if contains_any(&lowered, PAYMENT_EXPENSE_HINTS) {
                KindDecision::Ambiguous(TransactionKind::Expense)
            } else {
                KindDecision::Fallback
            }
        }
        Some(EntryType::Unrecognized(raw)) => {
            let lowered = raw.to_lowercase();
            if contains_any(&lowered, MONEY_IN_TYPE_PATTERNS) {
                KindDecision::Forced(TransactionKind::Income)
            } else if contains_any(&lowered, MONEY_OUT_TYPE_PATTERNS) {
                KindDecision::Forced(TransactionKind::Expense)
            } else {
                KindDecision::Fallback
            }
        }
        Some(EntryType::Transfer) | None => KindDecision::Fallback,
    }
}

fn contains_any(haystack: &str, patterns: &[&str]) -> bool {
    patterns.iter().any(|pattern| haystack.contains(pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(description: &str, amount: f64, entry_type: Option<EntryType>) -> CorroboratedRow {
        CorroboratedRow {
            date: NaiveDate::from_ymd_opt(2025, 1, 15).unwrap(),
            description: description.to_string(),
            amount,
            entry_type,
            reference: None,
        }
    }

    fn normalize_one(row: CorroboratedRow) -> (NormalizedRow, NormalizationSummary) {
        let batch = normalize_rows("imp-1", &[row]);
        (batch.rows.into_iter().next().unwrap(), batch.summary)
    }

    #[test]
    fn test_credit_is_income_with_positive_amount() {
        let (normalized, summary) = normalize_one(row("SALARY", 2500.0, Some(EntryType::Credit)));
        assert_eq!(normalized.kind, TransactionKind::Income);
        assert_eq!(normalized.amount, 2500.0);
        assert!(normalized.notes.is_empty());
        assert_eq!(summary.sign_corrections, 0);
    }

    #[test]
    fn test_negative_credit_gets_sign_corrected() {
        let (normalized, summary) = normalize_one(row("SALARY", -500.0, Some(EntryType::Credit)));
        assert_eq!(normalized.kind, TransactionKind::Income);
        assert_eq!(normalized.amount, 500.0);
        assert_eq!(summary.sign_corrections, 1);
        assert!(matches!(
            normalized.notes[0],
            NormalizationNote::SignCorrected {
                original,
                corrected,
                ..
            } if original == -500.0 && corrected == 500.0
        ));
    }

    #[test]
    fn test_positive_debit_gets_sign_corrected() {
        let (normalized, summary) = normalize_one(row("GROCERIES", 82.13, Some(EntryType::Debit)));
        assert_eq!(normalized.kind, TransactionKind::Expense);
        assert_eq!(normalized.amount, -82.13);
        assert_eq!(summary.sign_corrections, 1);
    }

    #[test]
    fn test_fee_and_interest_directions() {
        let (fee, _) = normalize_one(row("MONTHLY FEE", 5.0, Some(EntryType::Fee)));
        assert_eq!(fee.kind, TransactionKind::Expense);
        assert_eq!(fee.amount, -5.0);

        let (interest, _) = normalize_one(row("INTEREST EARNED", 1.23, Some(EntryType::Interest)));
        assert_eq!(interest.kind, TransactionKind::Income);
        assert_eq!(interest.amount, 1.23);
    }

    #[test]
    fn test_payment_thankyou_is_income() {
        let (normalized, summary) = normalize_one(row(
            "PAYMENT RECEIVED - THANKYOU",
            -350.0,
            Some(EntryType::Payment),
        ));
        assert_eq!(normalized.kind, TransactionKind::Income);
        assert_eq!(normalized.amount, 350.0);
        assert_eq!(summary.ambiguous_payments, 1);
        assert_eq!(summary.sign_corrections, 1);
        assert!(normalized
            .notes
            .iter()
            .any(|note| matches!(note, NormalizationNote::AmbiguousPaymentResolved { .. })));
    }

    #[test]
    fn test_payment_to_merchant_is_expense() {
        let (normalized, summary) =
            normalize_one(row("Payment to Acme Energy", 120.0, Some(EntryType::Payment)));
        assert_eq!(normalized.kind, TransactionKind::Expense);
        assert_eq!(normalized.amount, -120.0);
        assert_eq!(summary.ambiguous_payments, 1);
    }

    #[test]
    fn test_payment_without_hints_falls_back_to_sign() {
        let (positive, summary) =
            normalize_one(row("PAYMENT 00417", 45.0, Some(EntryType::Payment)));
        assert_eq!(positive.kind, TransactionKind::Income);
        assert_eq!(summary.classification_fallbacks, 1);
        assert_eq!(summary.ambiguous_payments, 0);

        let (negative, _) = normalize_one(row("PAYMENT 00418", -45.0, Some(EntryType::Payment)));
        assert_eq!(negative.kind, TransactionKind::Expense);
    }

    #[test]
    fn test_missing_type_falls_back_to_sign() {
        let (normalized, summary) = normalize_one(row("MYSTERY ROW", -10.0, None));
        assert_eq!(normalized.kind, TransactionKind::Expense);
        assert_eq!(normalized.amount, -10.0);
        assert_eq!(summary.classification_fallbacks, 1);
        assert_eq!(summary.sign_corrections, 0);
        assert!(matches!(
            normalized.notes[0],
            NormalizationNote::SignFallback { entry_type: None }
        ));
    }

    #[test]
    fn test_transfer_uses_sign() {
        let (out, _) = normalize_one(row("TRANSFER TO SAVINGS", -200.0, Some(EntryType::Transfer)));
        assert_eq!(out.kind, TransactionKind::Expense);

        let (incoming, _) =
            normalize_one(row("TRANSFER FROM SAVINGS", 200.0, Some(EntryType::Transfer)));
        assert_eq!(incoming.kind, TransactionKind::Income);
    }

    #[test]
    fn test_unrecognized_type_pattern_still_classifies() {
        let (normalized, summary) = normalize_one(row(
            "ATM HIGH STREET",
            60.0,
            Some(EntryType::Unrecognized("cash withdrawal".to_string())),
        ));
        assert_eq!(normalized.kind, TransactionKind::Expense);
        assert_eq!(normalized.amount, -60.0);
        assert_eq!(summary.classification_fallbacks, 0);
        assert_eq!(summary.sign_corrections, 1);
    }

    #[test]
    fn test_unrecognized_type_without_pattern_falls_back() {
        let (normalized, summary) = normalize_one(row(
            "SOMETHING",
            15.0,
            Some(EntryType::Unrecognized("standing order".to_string())),
        ));
        assert_eq!(normalized.kind, TransactionKind::Income);
        assert_eq!(summary.classification_fallbacks, 1);
    }

    #[test]
    fn test_zero_amount_never_produces_negative_zero() {
        let (normalized, _) = normalize_one(row("VOID", 0.0, Some(EntryType::Debit)));
        assert_eq!(normalized.kind, TransactionKind::Expense);
        assert!(normalized.amount.is_sign_positive());
        assert_eq!(normalized.amount, 0.0);
    }

    #[test]
    fn test_batch_summary_accumulates() {
        let rows = vec![
            row("SALARY", -2500.0, Some(EntryType::Credit)),
            row("PAYMENT THANKYOU", 100.0, Some(EntryType::Payment)),
            row("UNKNOWN", 5.0, None),
        ];
        let batch = normalize_rows("imp-1", &rows);
        assert_eq!(batch.rows.len(), 3);
        assert_eq!(batch.summary.sign_corrections, 1);
        assert_eq!(batch.summary.ambiguous_payments, 1);
        assert_eq!(batch.summary.classification_fallbacks, 1);
    }

    #[test]
    fn test_every_row_satisfies_sign_invariant() {
        let rows = vec![
            row("A", -1.0, Some(EntryType::Credit)),
            row("B", 1.0, Some(EntryType::Debit)),
            row("C", -2.0, Some(EntryType::Payment)),
            row("D", 3.0, Some(EntryType::Transfer)),
            row("E", -4.0, None),
            row("PAYMENT THANKYOU", -5.0, Some(EntryType::Payment)),
        ];
        let batch = normalize_rows("imp-1", &rows);
        for normalized in &batch.rows {
            assert!(
                normalized.kind.matches_sign(normalized.amount),
                "{} violates sign invariant with {}",
                normalized.description,
                normalized.amount
            );
        }
    }
}
