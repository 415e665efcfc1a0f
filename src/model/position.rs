//! Position ledger entries and fill merging.
//!
//! A position's quantity is the net of its signed fills since it was last
//! flat. Same-side fills move the average entry price; opposite-side fills
//! realize pnl against it. A fill larger than the open quantity closes the
//! position and opens a new one on the other side at the fill price.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::utils::{pct_change, weighted_average};

/// Why a position was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    MaxHold,
    RiskCap,
    /// Closed by an order the exit monitor did not request
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::TakeProfit => "take_profit",
            ExitReason::StopLoss => "stop_loss",
            ExitReason::MaxHold => "max_hold",
            ExitReason::RiskCap => "risk_cap",
            ExitReason::Manual => "manual",
        }
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExitReason {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "take_profit" => Ok(ExitReason::TakeProfit),
            "stop_loss" => Ok(ExitReason::StopLoss),
            "max_hold" => Ok(ExitReason::MaxHold),
            "risk_cap" => Ok(ExitReason::RiskCap),
            "manual" => Ok(ExitReason::Manual),
            other => anyhow::bail!("unknown exit reason: {}", other),
        }
    }
}

/// `open → closing(reason) → closed`. Closed positions leave the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    Closing,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "open",
            PositionStatus::Closing => "closing",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(PositionStatus::Open),
            "closing" => Ok(PositionStatus::Closing),
            other => anyhow::bail!("unknown position status: {}", other),
        }
    }
}

/// Net exposure in one outcome of one market for one strategy.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Zero until the row is first inserted
    pub id: i64,
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    /// Signed share quantity
    pub quantity: Decimal,
    pub avg_price: Decimal,
    pub opened_at: DateTime<Utc>,
    pub entry_dislocation: Option<Decimal>,
    /// Shares accumulated on the entry side
    pub entry_quantity: Decimal,
    /// Shares unwound so far, and their notional
    pub exit_quantity: Decimal,
    pub exit_notional: Decimal,
    pub realized_pnl: Decimal,
    /// Worst and best unrealized return seen by the exit monitor
    pub max_adverse: Decimal,
    pub max_favourable: Decimal,
    pub status: PositionStatus,
    pub exit_reason: Option<ExitReason>,
    pub paper: bool,
    pub version: i64,
    pub updated_at: DateTime<Utc>,
}

/// Result of merging one fill into a position.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FillEffect {
    pub realized_pnl: Decimal,
    pub closed_quantity: Decimal,
    /// Set when the fill took the position through zero
    pub closed: Option<ClosedPosition>,
}

/// Immutable record written when a position returns to flat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClosedPosition {
    pub strategy: String,
    pub market_id: String,
    pub outcome: u32,
    /// Sign of the closed position (+1 long, -1 short)
    pub direction: i32,
    pub entry_price: Decimal,
    pub entry_at: DateTime<Utc>,
    pub exit_price: Decimal,
    pub exit_at: DateTime<Utc>,
    pub size: Decimal,
    pub entry_dislocation: Option<Decimal>,
    pub exit_reason: ExitReason,
    pub realized_pnl: Decimal,
    pub paper: bool,
}

impl Position {
    /// A flat position ready to absorb its first fill.
    pub fn flat(
        strategy: &str,
        market_id: &str,
        outcome: u32,
        paper: bool,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: 0,
            strategy: strategy.to_string(),
            market_id: market_id.to_string(),
            outcome,
            quantity: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            opened_at: now,
            entry_dislocation: None,
            entry_quantity: Decimal::ZERO,
            exit_quantity: Decimal::ZERO,
            exit_notional: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            max_adverse: Decimal::ZERO,
            max_favourable: Decimal::ZERO,
            status: PositionStatus::Open,
            exit_reason: None,
            paper,
            version: 0,
            updated_at: now,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.quantity.is_zero()
    }

    pub fn is_long(&self) -> bool {
        self.quantity > Decimal::ZERO
    }

    /// Unrealized return at `mark`, positive when in profit.
    pub fn pnl_pct(&self, mark: Decimal) -> Decimal {
        let raw = pct_change(mark, self.avg_price);
        if self.is_long() {
            raw
        } else {
            -raw
        }
    }

    pub fn unrealized_pnl(&self, mark: Decimal) -> Decimal {
        (mark - self.avg_price) * self.quantity
    }

    /// Merge a signed fill into the position.
    pub fn apply_fill(&mut self, quantity: Decimal, price: Decimal, ts: DateTime<Utc>) -> FillEffect {
        if quantity.is_zero() {
            return FillEffect::default();
        }

        let same_side = self.quantity.is_zero()
            || self.quantity.is_sign_negative() == quantity.is_sign_negative();

        if same_side {
            self.add_to_position(quantity, price, ts);
            return FillEffect::default();
        }

        let open = self.quantity.abs();
        let incoming = quantity.abs();
        let closed_quantity = open.min(incoming);
        let direction = if self.quantity.is_sign_negative() {
            -Decimal::ONE
        } else {
            Decimal::ONE
        };
        let realized = (price - self.avg_price) * closed_quantity * direction;

        self.realized_pnl += realized;
        self.exit_quantity += closed_quantity;
        self.exit_notional += closed_quantity * price;
        self.quantity += quantity;
        self.updated_at = ts;

        let mut effect = FillEffect {
            realized_pnl: realized,
            closed_quantity,
            closed: None,
        };

        if incoming >= open {
            effect.closed = Some(self.closed_record(direction, ts));
            let remainder = self.quantity;
            self.reset_after_close(ts);
            if !remainder.is_zero() {
                self.add_to_position(remainder, price, ts);
            }
        }

        effect
    }

    fn add_to_position(&mut self, quantity: Decimal, price: Decimal, ts: DateTime<Utc>) {
        let held = self.quantity.abs();
        let incoming = quantity.abs();
        if held.is_zero() {
            self.opened_at = ts;
            self.avg_price = price;
        } else {
            self.avg_price = weighted_average(&[(self.avg_price, held), (price, incoming)]);
        }
        self.quantity += quantity;
        self.entry_quantity += incoming;
        self.updated_at = ts;
    }

    fn closed_record(&self, direction: Decimal, ts: DateTime<Utc>) -> ClosedPosition {
        let exit_price = if self.exit_quantity.is_zero() {
            Decimal::ZERO
        } else {
            self.exit_notional / self.exit_quantity
        };
        ClosedPosition {
            strategy: self.strategy.clone(),
            market_id: self.market_id.clone(),
            outcome: self.outcome,
            direction: if direction.is_sign_negative() { -1 } else { 1 },
            entry_price: self.avg_price,
            entry_at: self.opened_at,
            exit_price,
            exit_at: ts,
            size: self.entry_quantity,
            entry_dislocation: self.entry_dislocation,
            exit_reason: self.exit_reason.unwrap_or(ExitReason::Manual),
            realized_pnl: self.realized_pnl,
            paper: self.paper,
        }
    }

    fn reset_after_close(&mut self, ts: DateTime<Utc>) {
        self.quantity = Decimal::ZERO;
        self.avg_price = Decimal::ZERO;
        self.opened_at = ts;
        self.entry_dislocation = None;
        self.entry_quantity = Decimal::ZERO;
        self.exit_quantity = Decimal::ZERO;
        self.exit_notional = Decimal::ZERO;
        self.realized_pnl = Decimal::ZERO;
        self.max_adverse = Decimal::ZERO;
        self.max_favourable = Decimal::ZERO;
        self.status = PositionStatus::Open;
        self.exit_reason = None;
    }

    /// Track excursion extremes for a new mark. Returns true if either moved.
    pub fn observe_mark(&mut self, mark: Decimal) -> bool {
        let pct = self.pnl_pct(mark);
        let mut changed = false;
        if pct < self.max_adverse {
            self.max_adverse = pct;
            changed = true;
        }
        if pct > self.max_favourable {
            self.max_favourable = pct;
            changed = true;
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn flat() -> Position {
        Position::flat("mr", "m1", 1, true, Utc::now())
    }

    #[test]
    fn test_average_price_is_size_weighted() {
        let mut pos = flat();
        let now = Utc::now();
        pos.apply_fill(dec!(100), dec!(0.10), now);
        pos.apply_fill(dec!(300), dec!(0.20), now);

        assert_eq!(pos.quantity, dec!(400));
        // (100 * 0.10 + 300 * 0.20) / 400
        assert_eq!(pos.avg_price, dec!(0.175));
        assert_eq!(pos.entry_quantity, dec!(400));
    }

    #[test]
    fn test_partial_close_realizes_pnl() {
        let mut pos = flat();
        let now = Utc::now();
        pos.apply_fill(dec!(1000), dec!(0.10), now);

        let effect = pos.apply_fill(dec!(-400), dec!(0.115), now);
        assert_eq!(effect.closed_quantity, dec!(400));
        assert_eq!(effect.realized_pnl, dec!(6.000));
        assert!(effect.closed.is_none());
        assert_eq!(pos.quantity, dec!(600));
        assert_eq!(pos.avg_price, dec!(0.10));
    }

    #[test]
    fn test_full_close_produces_record() {
        let mut pos = flat();
        let opened = Utc::now();
        pos.entry_dislocation = Some(dec!(-0.25));
        pos.apply_fill(dec!(1000), dec!(0.10), opened);
        pos.exit_reason = Some(ExitReason::TakeProfit);

        let closed_at = opened + Duration::hours(2);
        pos.apply_fill(dec!(-500), dec!(0.12), closed_at);
        let effect = pos.apply_fill(dec!(-500), dec!(0.11), closed_at);

        let record = effect.closed.expect("position should close");
        assert!(pos.is_flat());
        assert_eq!(record.size, dec!(1000));
        assert_eq!(record.entry_price, dec!(0.10));
        assert_eq!(record.exit_price, dec!(0.115));
        assert_eq!(record.realized_pnl, dec!(15.000));
        assert_eq!(record.exit_reason, ExitReason::TakeProfit);
        assert_eq!(record.entry_dislocation, Some(dec!(-0.25)));
        assert_eq!(record.direction, 1);
    }

    #[test]
    fn test_short_position_pnl_sign() {
        let mut pos = flat();
        let now = Utc::now();
        pos.apply_fill(dec!(-100), dec!(0.50), now);
        let effect = pos.apply_fill(dec!(100), dec!(0.40), now);

        assert_eq!(effect.realized_pnl, dec!(10.00));
        let record = effect.closed.unwrap();
        assert_eq!(record.direction, -1);
        assert_eq!(record.exit_reason, ExitReason::Manual);
    }

    #[test]
    fn test_overshoot_flips_position() {
        let mut pos = flat();
        let now = Utc::now();
        pos.apply_fill(dec!(100), dec!(0.30), now);
        let effect = pos.apply_fill(dec!(-150), dec!(0.40), now);

        assert!(effect.closed.is_some());
        assert_eq!(effect.realized_pnl, dec!(10.00));
        assert_eq!(pos.quantity, dec!(-50));
        assert_eq!(pos.avg_price, dec!(0.40));
        assert_eq!(pos.realized_pnl, Decimal::ZERO);
        assert_eq!(pos.entry_quantity, dec!(50));
    }

    #[test]
    fn test_quantity_is_sum_of_signed_fills() {
        let mut pos = flat();
        let now = Utc::now();
        let fills = [dec!(50), dec!(25), dec!(-30), dec!(10), dec!(-55)];
        for qty in fills {
            pos.apply_fill(qty, dec!(0.2), now);
        }
        assert!(pos.is_flat());
    }

    #[test]
    fn test_pnl_pct_and_excursions() {
        let mut pos = flat();
        pos.apply_fill(dec!(1000), dec!(0.10), Utc::now());
        assert_eq!(pos.pnl_pct(dec!(0.115)), dec!(0.15));
        assert!(pos.observe_mark(dec!(0.09)));
        assert!(pos.observe_mark(dec!(0.12)));
        assert_eq!(pos.max_adverse, dec!(-0.1));
        assert_eq!(pos.max_favourable, dec!(0.2));
        assert!(!pos.observe_mark(dec!(0.11)));
    }
}
