use chrono::NaiveDate;
use log::{info, warn};

use crate::config::MissingEndDatePolicy;
use crate::schema::ClosingBalance;

/// What the reconciler decided to do with an extracted closing balance.
#[derive(Debug, Clone, PartialEq)]
pub enum BalanceDecision {
    /// The account balance is overwritten with this value.
    Applied { balance: f64 },
    /// The statement carried no usable closing balance.
    SkippedNoBalance,
    /// A completed import for the account covers a later period, so this
    /// statement's balance is stale and must not overwrite the newer one.
    SkippedStale {
        statement_end: NaiveDate,
        newest_end: NaiveDate,
    },
    /// The statement has no end date and policy routes it to review instead
    /// of guessing.
    HeldForReview,
}

impl BalanceDecision {
    pub fn label(&self) -> &'static str {
        match self {
            BalanceDecision::Applied { .. } => "applied",
            BalanceDecision::SkippedNoBalance => "skipped_no_balance",
            BalanceDecision::SkippedStale { .. } => "skipped_stale",
            BalanceDecision::HeldForReview => "held_for_review",
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BalanceDecision::Applied { balance } => format!("applied {:.2}", balance),
            BalanceDecision::SkippedNoBalance => "skipped, no closing balance".to_string(),
            BalanceDecision::SkippedStale {
                statement_end,
                newest_end,
            } => format!(
                "skipped, statement end {} is older than completed statement end {}",
                statement_end, newest_end
            ),
            BalanceDecision::HeldForReview => "held for review, no statement end date".to_string(),
        }
    }
}

/// Decides whether a statement's closing balance may overwrite the account
/// balance.
///
/// Statements are uploaded in arbitrary order. A user backfilling January
/// after importing February must not roll the account balance backwards, so
/// the statement's end date is compared against the end dates of every other
/// import for the account that reached completion. `completed_end_dates`
/// carries exactly those dates; completed imports without an end date do not
/// participate in the comparison.
pub fn reconcile_balance(
    import_id: &str,
    account_id: &str,
    policy: MissingEndDatePolicy,
    statement_end: Option<NaiveDate>,
    closing_balance: Option<&ClosingBalance>,
    completed_end_dates: &[NaiveDate],
) -> BalanceDecision {
    let Some(closing) = closing_balance else {
        info!(
            "No closing balance extracted for import {}; account {} balance untouched",
            import_id, account_id
        );
        return BalanceDecision::SkippedNoBalance;
    };

    let Some(statement_end) = statement_end else {
        return match policy {
            MissingEndDatePolicy::ApplyAsLatest => {
                warn!(
                    "Import {} has no statement end date; treating it as most recent for account {}",
                    import_id, account_id
                );
                BalanceDecision::Applied {
                    balance: closing.amount,
                }
            }
            MissingEndDatePolicy::HoldForReview => {
                warn!(
                    "Import {} has no statement end date; holding for review instead of updating account {}",
                    import_id, account_id
                );
                BalanceDecision::HeldForReview
            }
        };
    };

    if let Some(newest_end) = completed_end_dates.iter().max().copied() {
        if statement_end < newest_end {
            warn!(
                "Skipping stale balance for import {}: statement end {} predates completed statement end {} on account {}",
                import_id, statement_end, newest_end, account_id
            );
            return BalanceDecision::SkippedStale {
                statement_end,
                newest_end,
            };
        }
    }

    info!(
        "Applying closing balance {:.2} from import {} to account {}",
        closing.amount, import_id, account_id
    );
    BalanceDecision::Applied {
        balance: closing.amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::BalanceSource;

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn closing(amount: f64) -> ClosingBalance {
        ClosingBalance {
            amount,
            source: BalanceSource::Explicit,
        }
    }

    #[test]
    fn test_no_balance_is_skipped() {
        let decision = reconcile_balance(
            "imp-1",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            Some(date(2025, 1, 31)),
            None,
            &[],
        );
        assert_eq!(decision, BalanceDecision::SkippedNoBalance);
    }

    #[test]
    fn test_first_import_applies() {
        let decision = reconcile_balance(
            "imp-1",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            Some(date(2025, 1, 31)),
            Some(&closing(1295.5)),
            &[],
        );
        assert_eq!(decision, BalanceDecision::Applied { balance: 1295.5 });
    }

    #[test]
    fn test_backfilled_older_statement_is_stale() {
        let decision = reconcile_balance(
            "imp-2",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            Some(date(2025, 1, 31)),
            Some(&closing(900.0)),
            &[date(2025, 2, 28)],
        );
        assert_eq!(
            decision,
            BalanceDecision::SkippedStale {
                statement_end: date(2025, 1, 31),
                newest_end: date(2025, 2, 28),
            }
        );
    }

    #[test]
    fn test_newer_statement_applies_over_older_completed() {
        let decision = reconcile_balance(
            "imp-3",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            Some(date(2025, 3, 31)),
            Some(&closing(1500.0)),
            &[date(2025, 1, 31), date(2025, 2, 28)],
        );
        assert_eq!(decision, BalanceDecision::Applied { balance: 1500.0 });
    }

    #[test]
    fn test_equal_end_dates_apply() {
        // A corrected re-issue of the same period wins over the original.
        let decision = reconcile_balance(
            "imp-4",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            Some(date(2025, 2, 28)),
            Some(&closing(1400.0)),
            &[date(2025, 2, 28)],
        );
        assert_eq!(decision, BalanceDecision::Applied { balance: 1400.0 });
    }

    #[test]
    fn test_missing_end_date_applies_under_default_policy() {
        let decision = reconcile_balance(
            "imp-5",
            "acct-1",
            MissingEndDatePolicy::ApplyAsLatest,
            None,
            Some(&closing(777.0)),
            &[date(2025, 2, 28)],
        );
        assert_eq!(decision, BalanceDecision::Applied { balance: 777.0 });
    }

    #[test]
    fn test_missing_end_date_holds_under_review_policy() {
        let decision = reconcile_balance(
            "imp-6",
            "acct-1",
            MissingEndDatePolicy::HoldForReview,
            None,
            Some(&closing(777.0)),
            &[],
        );
        assert_eq!(decision, BalanceDecision::HeldForReview);
    }

    #[test]
    fn test_labels_for_metadata() {
        assert_eq!(
            BalanceDecision::Applied { balance: 1.0 }.label(),
            "applied"
        );
        assert_eq!(BalanceDecision::SkippedNoBalance.label(), "skipped_no_balance");
        let stale = BalanceDecision::SkippedStale {
            statement_end: date(2025, 1, 31),
            newest_end: date(2025, 2, 28),
        };
        assert_eq!(stale.label(), "skipped_stale");
        assert!(stale.describe().contains("2025-01-31"));
        assert!(stale.describe().contains("2025-02-28"));
    }
}
