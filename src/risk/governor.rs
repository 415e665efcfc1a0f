//! Risk governor: daily loss circuit breaker, loss-streak bans, cooldowns
//! and exposure limits.
//!
//! State lives in the store. `record_close` runs inside the fill
//! reconciler's transaction so a close and its risk bookkeeping commit
//! together; `entry_block` runs inside the translator's claim transaction.

use super::alert::{AlertSeverity, RiskAlert, RiskAlertType};
use crate::config::RiskConfig;
use crate::model::ClosedPosition;
use crate::persistence::{
    count_inflight_entries, count_inflight_entries_for_market, count_positions,
    count_positions_in_market, load_market_risk, load_strategy_risk, save_market_risk,
    save_strategy_risk, MarketRiskState, StrategyRiskState,
};
use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use rust_decimal::Decimal;
use std::fmt;
use tracing::{info, warn};

/// Why a new entry was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockReason {
    CircuitBreaker,
    DailyLossLimit,
    LossStreakBan,
    Cooldown,
    MarketDrawdown,
    MaxOpenPositions,
    MaxPositionsPerMarket,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::CircuitBreaker => "circuit_breaker",
            BlockReason::DailyLossLimit => "daily_loss_limit",
            BlockReason::LossStreakBan => "loss_streak_ban",
            BlockReason::Cooldown => "market_cooldown",
            BlockReason::MarketDrawdown => "market_drawdown_cap",
            BlockReason::MaxOpenPositions => "max_open_positions",
            BlockReason::MaxPositionsPerMarket => "max_positions_per_market",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Start of the UTC day after `now`.
fn next_utc_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    now.date_naive()
        .succ_opt()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|d| d.and_utc())
        .unwrap_or(now + Duration::days(1))
}

pub struct RiskGovernor {
    strategy: String,
    config: RiskConfig,
}

impl RiskGovernor {
    pub fn new(strategy: impl Into<String>, config: RiskConfig) -> Self {
        Self {
            strategy: strategy.into(),
            config,
        }
    }

    /// Strategy state rolled forward to the UTC day of `now`.
    fn strategy_state(&self, conn: &Connection, now: DateTime<Utc>) -> Result<StrategyRiskState> {
        let today = now.date_naive();
        let mut state = load_strategy_risk(conn, &self.strategy)?
            .unwrap_or_else(|| StrategyRiskState::new(&self.strategy, today));
        if state.day != today {
            info!(
                strategy = %self.strategy,
                previous_day = %state.day,
                previous_pnl = %state.daily_realized_pnl,
                "📅 [RISK] Day rollover"
            );
            state.day = today;
            state.daily_realized_pnl = Decimal::ZERO;
        }
        Ok(state)
    }

    fn market_state(&self, conn: &Connection, market_id: &str) -> Result<MarketRiskState> {
        Ok(load_market_risk(conn, &self.strategy, market_id)?
            .unwrap_or_else(|| MarketRiskState::new(&self.strategy, market_id)))
    }

    fn drawdown_hit(&self, cumulative_pnl: Decimal) -> bool {
        self.config.market_max_drawdown_usd > Decimal::ZERO
            && cumulative_pnl <= -self.config.market_max_drawdown_usd
    }

    /// Book a realized close. Returns alerts to emit once the surrounding
    /// transaction commits.
    pub fn record_close(
        &self,
        conn: &Connection,
        closed: &ClosedPosition,
        now: DateTime<Utc>,
    ) -> Result<Vec<RiskAlert>> {
        let mut alerts = Vec::new();
        let pnl = closed.realized_pnl;

        let mut strategy = self.strategy_state(conn, now)?;
        strategy.daily_realized_pnl += pnl;
        if strategy.daily_realized_pnl <= -self.config.daily_loss_limit
            && !strategy.breaker_active(now)
        {
            let until = next_utc_midnight(now);
            strategy.breaker_until = Some(until);
            strategy.breaker_reason = Some("daily_loss_limit".to_string());
            warn!(
                strategy = %self.strategy,
                daily_pnl = %strategy.daily_realized_pnl,
                %until,
                "🛑 [RISK] Circuit breaker tripped"
            );
            alerts.push(
                RiskAlert::new(
                    &self.strategy,
                    RiskAlertType::CircuitBreaker {
                        daily_pnl: strategy.daily_realized_pnl,
                        limit: self.config.daily_loss_limit,
                    },
                    AlertSeverity::Critical,
                    "daily loss limit reached, new entries halted until next UTC day",
                    now,
                )
                .with_metric("daily_pnl", strategy.daily_realized_pnl),
            );
        }
        save_strategy_risk(conn, &strategy, now)?;

        let mut market = self.market_state(conn, &closed.market_id)?;
        let was_over_drawdown = self.drawdown_hit(market.cumulative_pnl);
        market.cumulative_pnl += pnl;
        market.last_close_at = Some(now);
        if pnl < Decimal::ZERO {
            market.loss_streak += 1;
        } else {
            market.loss_streak = 0;
        }

        if self.config.max_loss_streak > 0 && market.loss_streak >= self.config.max_loss_streak {
            let until = now + Duration::hours(i64::from(self.config.ban_duration_hours));
            let streak = market.loss_streak;
            market.banned_until = Some(until);
            market.ban_reason = Some(format!("loss_streak_{}", streak));
            market.loss_streak = 0;
            warn!(
                strategy = %self.strategy,
                market = %closed.market_id,
                streak,
                %until,
                "⛔ [RISK] Market banned after loss streak"
            );
            alerts.push(RiskAlert::new(
                &self.strategy,
                RiskAlertType::LossStreakBan {
                    market_id: closed.market_id.clone(),
                    streak,
                },
                AlertSeverity::Warning,
                format!("{} consecutive losses, market banned until {}", streak, until),
                now,
            ));
        }

        if !was_over_drawdown && self.drawdown_hit(market.cumulative_pnl) {
            alerts.push(
                RiskAlert::new(
                    &self.strategy,
                    RiskAlertType::MarketDrawdown {
                        market_id: closed.market_id.clone(),
                        cumulative_pnl: market.cumulative_pnl,
                    },
                    AlertSeverity::Error,
                    "market drawdown cap reached",
                    now,
                )
                .with_metric("cap", self.config.market_max_drawdown_usd),
            );
        }
        save_market_risk(conn, &market, now)?;

        Ok(alerts)
    }

    /// First limit a new entry in `market_id` would violate, if any.
    pub fn entry_block(
        &self,
        conn: &Connection,
        market_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<BlockReason>> {
        let strategy = self.strategy_state(conn, now)?;
        if strategy.breaker_active(now) {
            return Ok(Some(BlockReason::CircuitBreaker));
        }
        if strategy.daily_realized_pnl <= -self.config.daily_loss_limit {
            return Ok(Some(BlockReason::DailyLossLimit));
        }

        let market = self.market_state(conn, market_id)?;
        if market.ban_active(now) {
            return Ok(Some(BlockReason::LossStreakBan));
        }
        if let Some(last) = market.last_close_at {
            let cooldown = Duration::seconds(self.config.market_cooldown_secs as i64);
            if now < last + cooldown {
                return Ok(Some(BlockReason::Cooldown));
            }
        }
        if self.drawdown_hit(market.cumulative_pnl) {
            return Ok(Some(BlockReason::MarketDrawdown));
        }

        let open = count_positions(conn, &self.strategy)?
            + count_inflight_entries(conn, &self.strategy)?;
        if open >= self.config.max_open_positions {
            return Ok(Some(BlockReason::MaxOpenPositions));
        }
        let in_market = count_positions_in_market(conn, &self.strategy, market_id)?
            + count_inflight_entries_for_market(conn, &self.strategy, market_id)?;
        if in_market >= self.config.max_positions_per_market {
            return Ok(Some(BlockReason::MaxPositionsPerMarket));
        }

        Ok(None)
    }

    /// Whether realized plus `unrealized` pnl in a market breaches the cap.
    pub fn drawdown_breached(
        &self,
        conn: &Connection,
        market_id: &str,
        unrealized: Decimal,
    ) -> Result<bool> {
        let market = self.market_state(conn, market_id)?;
        Ok(self.drawdown_hit(market.cumulative_pnl + unrealized))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ExitReason;
    use crate::persistence::Store;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn config() -> RiskConfig {
        RiskConfig {
            max_loss_streak: 3,
            daily_loss_limit: dec!(100),
            market_cooldown_secs: 0,
            ..RiskConfig::default()
        }
    }

    fn closed(market: &str, pnl: Decimal, at: DateTime<Utc>) -> ClosedPosition {
        ClosedPosition {
            strategy: "mr".to_string(),
            market_id: market.to_string(),
            outcome: 1,
            direction: 1,
            entry_price: dec!(0.10),
            entry_at: at - Duration::hours(1),
            exit_price: dec!(0.09),
            exit_at: at,
            size: dec!(100),
            entry_dislocation: None,
            exit_reason: ExitReason::StopLoss,
            realized_pnl: pnl,
            paper: true,
        }
    }

    #[test]
    fn test_three_losses_ban_market_until_expiry() {
        let store = Store::in_memory().unwrap();
        let governor = RiskGovernor::new("mr", config());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        for i in 0..2 {
            let alerts = governor
                .record_close(store.conn(), &closed("m1", dec!(-1), t0 + Duration::minutes(i)), t0)
                .unwrap();
            assert!(alerts.is_empty());
        }
        assert_eq!(governor.entry_block(store.conn(), "m1", t0).unwrap(), None);

        let alerts = governor
            .record_close(store.conn(), &closed("m1", dec!(-1), t0), t0)
            .unwrap();
        assert_eq!(alerts.len(), 1);

        let state = store.market_risk("mr", "m1").unwrap().unwrap();
        assert_eq!(state.banned_until, Some(t0 + Duration::hours(24)));
        assert_eq!(state.loss_streak, 0);

        assert_eq!(
            governor.entry_block(store.conn(), "m1", t0 + Duration::hours(1)).unwrap(),
            Some(BlockReason::LossStreakBan)
        );
        assert_eq!(governor.entry_block(store.conn(), "m2", t0).unwrap(), None);
        assert_eq!(
            governor.entry_block(store.conn(), "m1", t0 + Duration::hours(25)).unwrap(),
            None
        );
    }

    #[test]
    fn test_win_resets_streak() {
        let store = Store::in_memory().unwrap();
        let governor = RiskGovernor::new("mr", config());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();

        governor.record_close(store.conn(), &closed("m1", dec!(-1), t0), t0).unwrap();
        governor.record_close(store.conn(), &closed("m1", dec!(-1), t0), t0).unwrap();
        governor.record_close(store.conn(), &closed("m1", dec!(0), t0), t0).unwrap();
        governor.record_close(store.conn(), &closed("m1", dec!(-1), t0), t0).unwrap();

        let state = store.market_risk("mr", "m1").unwrap().unwrap();
        assert_eq!(state.loss_streak, 1);
        assert_eq!(state.banned_until, None);
        assert_eq!(state.cumulative_pnl, dec!(-3));
    }

    #[test]
    fn test_daily_loss_trips_breaker_until_next_day() {
        let store = Store::in_memory().unwrap();
        let governor = RiskGovernor::new("mr", config());
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 22, 0, 0).unwrap();

        let alerts = governor
            .record_close(store.conn(), &closed("m1", dec!(-60), t0), t0)
            .unwrap();
        assert!(alerts.is_empty());
        let alerts = governor
            .record_close(store.conn(), &closed("m2", dec!(-40), t0), t0)
            .unwrap();
        assert!(matches!(alerts[0].alert_type, RiskAlertType::CircuitBreaker { .. }));

        assert_eq!(
            governor.entry_block(store.conn(), "m3", t0 + Duration::hours(1)).unwrap(),
            Some(BlockReason::CircuitBreaker)
        );

        // Next UTC day: breaker expired, counter rolled over
        let next_day = Utc.with_ymd_and_hms(2026, 3, 3, 0, 0, 1).unwrap();
        assert_eq!(governor.entry_block(store.conn(), "m3", next_day).unwrap(), None);
        governor
            .record_close(store.conn(), &closed("m3", dec!(5), next_day), next_day)
            .unwrap();
        let state = store.strategy_risk("mr").unwrap().unwrap();
        assert_eq!(state.daily_realized_pnl, dec!(5));
    }

    #[test]
    fn test_cooldown_and_drawdown_cap() {
        let store = Store::in_memory().unwrap();
        let governor = RiskGovernor::new(
            "mr",
            RiskConfig {
                market_cooldown_secs: 600,
                market_max_drawdown_usd: dec!(20),
                daily_loss_limit: dec!(1000),
                ..RiskConfig::default()
            },
        );
        let t0 = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        governor.record_close(store.conn(), &closed("m1", dec!(5), t0), t0).unwrap();

        assert_eq!(
            governor.entry_block(store.conn(), "m1", t0 + Duration::minutes(5)).unwrap(),
            Some(BlockReason::Cooldown)
        );
        assert_eq!(
            governor.entry_block(store.conn(), "m1", t0 + Duration::minutes(11)).unwrap(),
            None
        );

        assert!(!governor.drawdown_breached(store.conn(), "m1", dec!(-20)).unwrap());
        assert!(governor.drawdown_breached(store.conn(), "m1", dec!(-25)).unwrap());

        let alerts = governor
            .record_close(store.conn(), &closed("m1", dec!(-30), t0), t0)
            .unwrap();
        assert!(alerts
            .iter()
            .any(|a| matches!(a.alert_type, RiskAlertType::MarketDrawdown { .. })));
        assert_eq!(
            governor.entry_block(store.conn(), "m1", t0 + Duration::hours(1)).unwrap(),
            Some(BlockReason::MarketDrawdown)
        );
    }

    #[test]
    fn test_exposure_limits_count_positions() {
        let store = Store::in_memory().unwrap();
        let governor = RiskGovernor::new(
            "mr",
            RiskConfig {
                max_open_positions: 1,
                ..RiskConfig::default()
            },
        );
        let now = Utc::now();
        let mut position = crate::model::Position::flat("mr", "m1", 1, true, now);
        position.apply_fill(dec!(100), dec!(0.10), now);
        crate::persistence::insert_position(store.conn(), &position).unwrap();
        assert_eq!(
            governor.entry_block(store.conn(), "m2", now).unwrap(),
            Some(BlockReason::MaxOpenPositions)
        );
    }
}
