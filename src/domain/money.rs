//! Monetary rounding helpers.
//!
//! All amounts are rounded half-up (`MidpointAwayFromZero`) at two decimals.
//! The 50% meals rule depends on this: 34.73 * 0.5 = 17.365 rounds to 17.37.

use rust_decimal::{Decimal, RoundingStrategy};

/// Round to 2 decimal places, half-up
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Deductible amount for an original amount at an integer percentage
pub fn deductible_amount(original: Decimal, percent: u8) -> Decimal {
    round2(original * Decimal::from(percent) / Decimal::from(100u8))
}

/// Aggregate rate as a percentage with one decimal place: 100 * deductible / original
pub fn deductibility_rate(total_deductible: Decimal, total_original: Decimal) -> Decimal {
    if total_original.is_zero() {
        return Decimal::ZERO;
    }
    (Decimal::from(100u8) * total_deductible / total_original)
        .round_dp_with_strategy(1, RoundingStrategy::MidpointAwayFromZero)
}
