// =============================================================================
// PRICING MODULE
// =============================================================================
// Authoritative reservation and subscription pricing. Client-side previews
// are cosmetic; billing always goes through these functions.
//
// NOTES:
// - All arithmetic is integer, in the smallest currency unit
// - Partial billing units round UP (never undercharge)
// - Subscription discounts are percentages from configuration, rounded
//   half-up to the nearest unit
// =============================================================================

use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, AppResult};
use crate::models::{Amount, RateTable, SubscriptionPeriod, SubscriptionTier};
use crate::timerange::{duration, TimeRange};

// -----------------------------------------------------------------------------
// CONFIGURATION
// -----------------------------------------------------------------------------

/// Base price per tier for one month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierBasePrices {
    pub basic: Amount,
    pub premium: Amount,
    pub vip: Amount,
}

impl TierBasePrices {
    pub fn base(&self, tier: SubscriptionTier) -> Amount {
        match tier {
            SubscriptionTier::Basic => self.basic,
            SubscriptionTier::Premium => self.premium,
            SubscriptionTier::Vip => self.vip,
        }
    }
}

/// Price of a period as a percentage of `months × base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodTerms {
    pub monthly_percent: u32,
    pub quarterly_percent: u32,
    pub yearly_percent: u32,
}

impl PeriodTerms {
    pub fn percent(&self, period: SubscriptionPeriod) -> u32 {
        match period {
            SubscriptionPeriod::Monthly => self.monthly_percent,
            SubscriptionPeriod::Quarterly => self.quarterly_percent,
            SubscriptionPeriod::Yearly => self.yearly_percent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingConfig {
    /// Durations strictly above this also get a daily-rate quote
    pub daily_rate_threshold: Duration,
    pub tier_base: TierBasePrices,
    pub period_terms: PeriodTerms,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            daily_rate_threshold: Duration::hours(8),
            tier_base: TierBasePrices {
                basic: 50_000,
                premium: 100_000,
                vip: 200_000,
            },
            period_terms: PeriodTerms {
                monthly_percent: 100,
                quarterly_percent: 90,
                yearly_percent: 80,
            },
        }
    }
}

// -----------------------------------------------------------------------------
// RESERVATION PRICING
// -----------------------------------------------------------------------------

/// Number of whole billing units needed to cover `length`, rounding up.
pub fn billing_units(length: Duration, unit: Duration) -> i64 {
    let secs = length.num_seconds().max(0);
    let unit_secs = unit.num_seconds().max(1);
    (secs + unit_secs - 1) / unit_secs
}

/// Cheapest applicable quote from the lot's rate table.
///
/// Hourly is `hourly_rate × ceil(duration / 1h)`. Above the configured
/// threshold the daily quote `daily_rate × ceil(duration / 24h)` is also
/// considered and the lesser wins. A lot with only one of the two rates
/// always uses that one.
pub fn price_reservation(
    rates: &RateTable,
    range: &TimeRange,
    config: &PricingConfig,
) -> AppResult<Amount> {
    let length = duration(range);
    let hourly = rates
        .hourly_rate
        .map(|rate| rate.saturating_mul(billing_units(length, Duration::hours(1))));
    let daily = rates
        .daily_rate
        .map(|rate| rate.saturating_mul(billing_units(length, Duration::days(1))));

    match (hourly, daily) {
        (Some(h), Some(d)) if length > config.daily_rate_threshold => Ok(h.min(d)),
        (Some(h), _) => Ok(h),
        (None, Some(d)) => Ok(d),
        (None, None) => Err(AppError::Validation(
            "parking lot has no hourly or daily rate configured".to_string(),
        )),
    }
}

// -----------------------------------------------------------------------------
// SUBSCRIPTION PRICING
// -----------------------------------------------------------------------------

/// `base(tier) × months(period) × percent(period) / 100`, rounded half-up.
pub fn price_subscription(
    tier: SubscriptionTier,
    period: SubscriptionPeriod,
    config: &PricingConfig,
) -> Amount {
    let gross = config
        .tier_base
        .base(tier)
        .saturating_mul(i64::from(period.months()))
        .saturating_mul(i64::from(config.period_terms.percent(period)));
    (gross + 50) / 100
}

/// `date` moved forward by one period, clamping to month end (Jan 31 → Feb 28).
pub fn add_period(date: DateTime<Utc>, period: SubscriptionPeriod) -> AppResult<DateTime<Utc>> {
    add_periods(date, period, 1)
}

/// `anchor` moved forward by `count` periods in one step, so month-end
/// clamping never accumulates: Dec 31 + 3 months is Mar 31, not Mar 28.
pub fn add_periods(
    anchor: DateTime<Utc>,
    period: SubscriptionPeriod,
    count: u32,
) -> AppResult<DateTime<Utc>> {
    period
        .months()
        .checked_mul(count)
        .and_then(|months| anchor.checked_add_months(Months::new(months)))
        .ok_or_else(|| AppError::Validation("subscription end date out of range".to_string()))
}
