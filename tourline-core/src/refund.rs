use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::{CoreError, CoreResult};

pub const NO_REFUND: &str = "no_refund";

/// One row of the refund table: cancelling at least `min_days_before`
/// days ahead of departure refunds `percentage` of the total.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefundTier {
    pub min_days_before: i64,
    pub percentage: u8,
    pub reason_code: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RefundBreakdown {
    pub total_amount: Decimal,
    pub refund_amount: Decimal,
    pub refund_percentage: u8,
    pub days_before_departure: i64,
    pub reason_code: String,
}

/// Tiered cancellation refund table. Pure: no clock, no storage.
#[derive(Debug, Clone)]
pub struct RefundPolicy {
    // Sorted by `min_days_before`, descending.
    tiers: Vec<RefundTier>,
}

impl RefundPolicy {
    /// Rejects tables that would refund more for a later cancellation than an
    /// earlier one.
    pub fn new(mut tiers: Vec<RefundTier>) -> CoreResult<Self> {
        tiers.sort_by(|a, b| b.min_days_before.cmp(&a.min_days_before));

        for tier in &tiers {
            if tier.percentage > 100 {
                return Err(CoreError::InvalidArgument(format!(
                    "refund tier '{}' exceeds 100%",
                    tier.reason_code
                )));
            }
        }
        for pair in tiers.windows(2) {
            if pair[0].min_days_before == pair[1].min_days_before {
                return Err(CoreError::InvalidArgument(format!(
                    "duplicate refund threshold at {} days",
                    pair[0].min_days_before
                )));
            }
            if pair[1].percentage > pair[0].percentage {
                return Err(CoreError::InvalidArgument(format!(
                    "refund tier '{}' refunds more than the earlier tier '{}'",
                    pair[1].reason_code, pair[0].reason_code
                )));
            }
        }

        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[RefundTier] {
        &self.tiers
    }

    pub fn refund(&self, total_amount: Decimal, days_before_departure: i64) -> RefundBreakdown {
        let (percentage, reason_code) = self
            .tiers
            .iter()
            .find(|tier| days_before_departure >= tier.min_days_before)
            .map(|tier| (tier.percentage, tier.reason_code.clone()))
            .unwrap_or((0, NO_REFUND.to_string()));

        let refund_amount = (total_amount * Decimal::from(percentage) / Decimal::ONE_HUNDRED)
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
            .normalize();

        RefundBreakdown {
            total_amount,
            refund_amount,
            refund_percentage: percentage,
            days_before_departure,
            reason_code,
        }
    }
}

impl Default for RefundPolicy {
    fn default() -> Self {
        Self {
            tiers: default_tiers(),
        }
    }
}

/// >=30 days: 100%, 15-29: 50%, 1-14: 20%, otherwise nothing.
pub fn default_tiers() -> Vec<RefundTier> {
    vec![
        RefundTier {
            min_days_before: 30,
            percentage: 100,
            reason_code: "full_refund".to_string(),
        },
        RefundTier {
            min_days_before: 15,
            percentage: 50,
            reason_code: "partial_refund_50".to_string(),
        },
        RefundTier {
            min_days_before: 1,
            percentage: 20,
            reason_code: "partial_refund_20".to_string(),
        },
    ]
}

/// Whole calendar days (UTC) between `now` and the departure date. Negative
/// once the departure date has passed.
pub fn days_before_departure(departs_on: NaiveDate, now: DateTime<Utc>) -> i64 {
    (departs_on - now.date_naive()).num_days()
}
