use crate::schema::BalanceSource;

/// Everything the scorer looks at, collected by the pipeline after
/// normalization has run.
#[derive(Debug, Clone, Default)]
pub struct ConfidenceInputs {
    /// Rows the structuring stage produced, before validation.
    pub total_rows: u32,
    pub discarded_rows: u32,
    pub malformed_rows: u32,
    pub classification_fallbacks: u32,
    pub ambiguous_payments: u32,
    pub has_end_date: bool,
    pub balance_source: Option<BalanceSource>,
}

/// Deterministic extraction-quality score in 0-100.
///
/// Deductions are proportional to how often the pipeline had to guess:
/// rows the validator could not corroborate weigh heaviest, then rows whose
/// classification degraded to the sign fallback, then ambiguous payments.
/// Missing period or balance data costs a flat amount. A statement with no
/// extracted rows scores zero outright.
pub fn score(inputs: &ConfidenceInputs) -> u8 {
    if inputs.total_rows == 0 {
        return 0;
    }
    let total = inputs.total_rows as f64;
    let fraction = |count: u32| (count as f64 / total).min(1.0);

    let mut score = 100.0;
    score -= 40.0 * fraction(inputs.discarded_rows + inputs.malformed_rows);
    score -= 25.0 * fraction(inputs.classification_fallbacks);
    score -= 10.0 * fraction(inputs.ambiguous_payments);
    if !inputs.has_end_date {
        score -= 10.0;
    }
    score -= match inputs.balance_source {
        Some(BalanceSource::Explicit) => 0.0,
        Some(BalanceSource::Inferred) => 5.0,
        None => 10.0,
    };

    score.round().clamp(0.0, 100.0) as u8
}
