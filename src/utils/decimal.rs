//! Decimal arithmetic utilities for price and size calculations.

use rust_decimal::Decimal;

/// Round down to lot size (share quantity precision).
pub fn round_down_to_lot(value: Decimal, lot_size: Decimal) -> Decimal {
    if lot_size == Decimal::ZERO {
        return value;
    }
    (value / lot_size).floor() * lot_size
}

/// Safe division that returns zero if divisor is zero.
pub fn safe_div(numerator: Decimal, denominator: Decimal) -> Decimal {
    if denominator == Decimal::ZERO {
        Decimal::ZERO
    } else {
        numerator / denominator
    }
}

/// Calculate weighted average of `(value, weight)` pairs.
pub fn weighted_average(values: &[(Decimal, Decimal)]) -> Decimal {
    let (sum, weight_sum) = values.iter().fold(
        (Decimal::ZERO, Decimal::ZERO),
        |(sum, weight_sum), (val, weight)| (sum + val * weight, weight_sum + weight),
    );

    safe_div(sum, weight_sum)
}

/// Arithmetic mean; `None` for an empty slice.
pub fn mean(values: &[Decimal]) -> Option<Decimal> {
    if values.is_empty() {
        return None;
    }
    let sum: Decimal = values.iter().sum();
    Some(sum / Decimal::from(values.len()))
}

/// Population variance; `None` for an empty slice.
pub fn variance(values: &[Decimal]) -> Option<Decimal> {
    let avg = mean(values)?;
    let squares: Vec<Decimal> = values.iter().map(|v| (v - avg) * (v - avg)).collect();
    mean(&squares)
}

/// Relative change from `base` to `value`; zero when `base` is zero.
pub fn pct_change(value: Decimal, base: Decimal) -> Decimal {
    safe_div(value - base, base)
}
