//! Signal generator: finds outcomes trading well below their rolling
//! average and queues entry intents for the translator.

use crate::config::{Blacklist, BlacklistWatcher, Config, ExecutionMode, SignalConfig};
use crate::model::{IntentAction, IntentKind, IntentStatus, Market, NewIntent, Side};
use crate::persistence::{ShadowFill, Store};
use crate::runtime::{CycleReport, Worker};
use crate::utils::{mean, pct_change, round_down_to_lot, variance};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, trace};

/// Why an outcome (or its whole market) produced no intent this cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotInDb,
    Inactive,
    ExcludedTag,
    NotIncluded,
    Keyword,
    Blacklisted,
    NoQuestion,
    EndingSoon,
    HasPosition,
    PendingIntent,
    NoPrice,
    StalePrice,
    VolatilityCollapse,
    VolumeSpike,
    NoAverage,
    PriceRange,
    NotDislocated,
    TooSmall,
    TooExtreme,
}

impl SkipReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotInDb => "not_in_db",
            SkipReason::Inactive => "inactive",
            SkipReason::ExcludedTag => "excluded_tag",
            SkipReason::NotIncluded => "not_included",
            SkipReason::Keyword => "keyword",
            SkipReason::Blacklisted => "blacklisted",
            SkipReason::NoQuestion => "no_question",
            SkipReason::EndingSoon => "ending_soon",
            SkipReason::HasPosition => "has_position",
            SkipReason::PendingIntent => "pending_intent",
            SkipReason::NoPrice => "no_price",
            SkipReason::StalePrice => "stale_price",
            SkipReason::VolatilityCollapse => "avoid_vol_collapse",
            SkipReason::VolumeSpike => "avoid_volume_spike",
            SkipReason::NoAverage => "no_average",
            SkipReason::PriceRange => "price_range",
            SkipReason::NotDislocated => "not_dislocation",
            SkipReason::TooSmall => "too_small",
            SkipReason::TooExtreme => "too_extreme",
        }
    }
}

/// An eligible entry.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub market_id: String,
    pub outcome: u32,
    pub current: Decimal,
    pub avg: Decimal,
    pub dislocation: Decimal,
}

/// Entry rule. Longs only: the price must sit below its average by at least
/// the threshold and at most the max dislocation, inside the price bounds.
/// Returns the (negative) dislocation when eligible.
pub fn evaluate_entry(
    signal: &SignalConfig,
    current: Decimal,
    avg: Decimal,
) -> Result<Decimal, SkipReason> {
    if avg <= Decimal::ZERO {
        return Err(SkipReason::NoAverage);
    }
    if current < signal.min_price || current > signal.max_price {
        return Err(SkipReason::PriceRange);
    }

    let dislocation = pct_change(current, avg);
    if dislocation >= Decimal::ZERO {
        return Err(SkipReason::NotDislocated);
    }
    let magnitude = dislocation.abs();
    if magnitude < signal.dislocation_threshold {
        return Err(SkipReason::TooSmall);
    }
    if magnitude > signal.max_dislocation {
        return Err(SkipReason::TooExtreme);
    }
    Ok(dislocation)
}

/// Price volatility over the last hour collapsed against the three hours
/// before it (stddev down more than 60%). Needs 10 recent and 30 prior
/// samples to say anything.
pub fn volatility_collapsed(samples: &[(DateTime<Utc>, Decimal)], now: DateTime<Utc>) -> bool {
    let recent_start = now - Duration::hours(1);
    let prior_start = now - Duration::hours(4);

    let recent: Vec<Decimal> = samples
        .iter()
        .filter(|(ts, _)| *ts >= recent_start && *ts <= now)
        .map(|(_, p)| *p)
        .collect();
    let prior: Vec<Decimal> = samples
        .iter()
        .filter(|(ts, _)| *ts >= prior_start && *ts < recent_start)
        .map(|(_, p)| *p)
        .collect();

    if recent.len() < 10 || prior.len() < 30 {
        return false;
    }

    match (variance(&recent), variance(&prior)) {
        // Compared on variance: a 60% stddev drop is a ratio below 0.4², 0.16
        (Some(recent_var), Some(prior_var))
            if recent_var > Decimal::ZERO && prior_var > Decimal::ZERO =>
        {
            recent_var < prior_var * dec!(0.16)
        }
        _ => false,
    }
}

/// Observation count in the last hour is more than 4x the hourly mean of the
/// 24 hours before it (hours without observations not counted).
pub fn volume_spike(samples: &[(DateTime<Utc>, Decimal)], now: DateTime<Utc>) -> bool {
    let recent_start = now - Duration::hours(1);
    let history_start = now - Duration::hours(25);

    let recent = samples
        .iter()
        .filter(|(ts, _)| *ts >= recent_start && *ts <= now)
        .count();

    let mut hourly: HashMap<i64, usize> = HashMap::new();
    for (ts, _) in samples {
        if *ts >= history_start && *ts < recent_start {
            *hourly.entry(ts.timestamp().div_euclid(3600)).or_default() += 1;
        }
    }
    if hourly.is_empty() {
        return false;
    }

    let hourly_mean = Decimal::from(hourly.values().sum::<usize>()) / Decimal::from(hourly.len());
    Decimal::from(recent) > hourly_mean * dec!(4)
}

pub struct SignalGenerator {
    store: Store,
    config: Config,
    blacklist: BlacklistWatcher,
}

impl SignalGenerator {
    pub fn new(store: Store, config: Config) -> Self {
        let blacklist = BlacklistWatcher::new(config.universe.blacklist_file.clone());
        Self {
            store,
            config,
            blacklist,
        }
    }

    fn strategy(&self) -> &str {
        &self.config.strategy.id
    }

    /// Market-level universe rules.
    fn market_filter(
        &self,
        market: &Market,
        blacklist: &Blacklist,
        now: DateTime<Utc>,
    ) -> Result<(), SkipReason> {
        let universe = &self.config.universe;
        if !market.active {
            return Err(SkipReason::Inactive);
        }
        if market.has_any_tag(&universe.excluded_tags) {
            return Err(SkipReason::ExcludedTag);
        }
        if !universe.included_tags.is_empty() && !market.has_any_tag(&universe.included_tags) {
            return Err(SkipReason::NotIncluded);
        }

        let question = market.question.trim();
        if universe.require_question && question.len() < 10 {
            return Err(SkipReason::NoQuestion);
        }
        let lowered = question.to_lowercase();
        if universe
            .excluded_keywords
            .iter()
            .any(|k| !k.is_empty() && lowered.contains(&k.to_lowercase()))
        {
            return Err(SkipReason::Keyword);
        }
        if blacklist.blocks(&market.market_id, question) {
            return Err(SkipReason::Blacklisted);
        }
        let horizon = Duration::hours(i64::from(universe.min_hours_to_resolution));
        if market.resolves_within(now, horizon) {
            return Err(SkipReason::EndingSoon);
        }
        Ok(())
    }

    /// Top markets by 24h volume that pass the universe rules.
    fn select_universe(
        &self,
        now: DateTime<Utc>,
        skips: &mut BTreeMap<&'static str, usize>,
    ) -> Result<Vec<Market>> {
        let universe = &self.config.universe;
        let blacklist = self.blacklist.current();

        // Over-fetch; filters drop some of the ranked markets
        let ranked = self.store.top_markets_by_volume(
            now - Duration::hours(24),
            universe.min_volume_24h,
            universe.top_markets.saturating_mul(3),
        )?;

        let mut selected = Vec::new();
        for (market_id, volume) in ranked {
            if selected.len() >= universe.top_markets {
                break;
            }
            let Some(market) = self.store.get_market(&market_id)? else {
                *skips.entry(SkipReason::NotInDb.as_str()).or_default() += 1;
                continue;
            };
            match self.market_filter(&market, &blacklist, now) {
                Ok(()) => {
                    trace!(market = %market_id, %volume, "Market in universe");
                    selected.push(market);
                }
                Err(reason) => {
                    trace!(market = %market_id, reason = reason.as_str(), "Market filtered");
                    *skips.entry(reason.as_str()).or_default() += 1;
                }
            }
        }
        Ok(selected)
    }

    fn evaluate_outcome(
        &self,
        market: &Market,
        outcome: u32,
        now: DateTime<Utc>,
    ) -> Result<Result<EntrySignal, SkipReason>> {
        let signal = &self.config.signal;
        let strategy = self.strategy();

        if self
            .store
            .get_position(strategy, &market.market_id, outcome)?
            .is_some()
        {
            return Ok(Err(SkipReason::HasPosition));
        }
        if self
            .store
            .has_pending_intent(strategy, &market.market_id, outcome, IntentKind::Entry)?
        {
            return Ok(Err(SkipReason::PendingIntent));
        }
        if self.config.strategy.mode == ExecutionMode::Shadow
            && self
                .store
                .has_live_shadow_intent(strategy, &market.market_id, outcome, now)?
        {
            return Ok(Err(SkipReason::PendingIntent));
        }

        let lookback_hours = signal.fallback_window_hours.max(25);
        let samples: Vec<(DateTime<Utc>, Decimal)> = self
            .store
            .price_samples(
                &market.market_id,
                outcome,
                now - Duration::hours(i64::from(lookback_hours)),
            )?
            .into_iter()
            .filter(|(ts, _)| *ts <= now)
            .collect();

        let Some(&(observed_at, current)) = samples.last() else {
            return Ok(Err(SkipReason::NoPrice));
        };
        if now - observed_at > self.config.max_price_age() {
            return Ok(Err(SkipReason::StalePrice));
        }

        if signal.avoid_volatility_collapse && volatility_collapsed(&samples, now) {
            return Ok(Err(SkipReason::VolatilityCollapse));
        }
        if signal.avoid_volume_spike && volume_spike(&samples, now) {
            return Ok(Err(SkipReason::VolumeSpike));
        }

        let window_avg = |hours: u32| {
            let start = now - Duration::hours(i64::from(hours));
            let prices: Vec<Decimal> = samples
                .iter()
                .filter(|(ts, _)| *ts >= start)
                .map(|(_, p)| *p)
                .collect();
            mean(&prices)
        };
        let Some(avg) = window_avg(signal.avg_window_hours)
            .or_else(|| window_avg(signal.fallback_window_hours))
        else {
            return Ok(Err(SkipReason::NoAverage));
        };

        Ok(evaluate_entry(signal, current, avg).map(|dislocation| EntrySignal {
            market_id: market.market_id.clone(),
            outcome,
            current,
            avg,
            dislocation,
        }))
    }

    /// Proposed USD size for an entry.
    fn entry_size_usd(&self) -> Decimal {
        let sizing = &self.config.sizing;
        let size = sizing.base_position_usd.min(sizing.max_position_usd);
        match sizing.max_order_usd {
            Some(cap) => size.min(cap),
            None => size,
        }
    }

    fn emit(&self, entry: &EntrySignal, now: DateTime<Utc>) -> Result<i64> {
        let size_usd = self.entry_size_usd();
        let intent = NewIntent {
            strategy: self.strategy().to_string(),
            market_id: entry.market_id.clone(),
            outcome: entry.outcome,
            side: Side::Buy,
            action: IntentAction::Open { size_usd },
            signal_price: entry.current,
            avg_price: Some(entry.avg),
            dislocation: Some(entry.dislocation),
            reason: format!("dislocation {}", entry.dislocation.round_dp(4)),
            created_at: now,
            expires_at: now + self.config.intent_ttl(),
        };

        if self.config.strategy.mode == ExecutionMode::Shadow {
            let intent_id = self.store.insert_intent(&intent, IntentStatus::Shadow)?;
            let sim_entry_price = entry.current * (Decimal::ONE + self.config.execution.slippage);
            let size = round_down_to_lot(size_usd / sim_entry_price, dec!(0.01));
            self.store.record_shadow_fill(&ShadowFill {
                strategy: self.strategy().to_string(),
                market_id: entry.market_id.clone(),
                outcome: entry.outcome,
                side: Side::Buy,
                ts: now,
                size,
                signal_price: entry.current,
                sim_entry_price,
                avg_price: Some(entry.avg),
                dislocation: Some(entry.dislocation),
                intent_id: Some(intent_id),
                notes: Some(format!("{}_shadow", self.strategy())),
            })?;
            info!(
                market = %entry.market_id,
                outcome = entry.outcome,
                price = %entry.current,
                sim_entry = %sim_entry_price,
                %size,
                dislocation = %entry.dislocation,
                "👻 [SHADOW] Entry signal recorded"
            );
            return Ok(intent_id);
        }

        let intent_id = self.store.insert_intent(&intent, IntentStatus::Pending)?;
        info!(
            intent_id,
            market = %entry.market_id,
            outcome = entry.outcome,
            price = %entry.current,
            avg = %entry.avg,
            dislocation = %entry.dislocation,
            %size_usd,
            "📈 [SIGNAL] Entry intent queued"
        );
        Ok(intent_id)
    }
}

#[async_trait(?Send)]
impl Worker for SignalGenerator {
    fn name(&self) -> String {
        format!("signals:{}", self.strategy())
    }

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport> {
        self.blacklist.refresh();

        let mut skips: BTreeMap<&'static str, usize> = BTreeMap::new();
        let universe = self.select_universe(now, &mut skips)?;
        let mut report = CycleReport::default();

        for market in &universe {
            for outcome in 0..market.outcome_tokens.len() as u32 {
                match self.evaluate_outcome(market, outcome, now)? {
                    Ok(entry) => {
                        self.emit(&entry, now)?;
                        report.processed += 1;
                    }
                    Err(reason) => {
                        debug!(
                            market = %market.market_id,
                            outcome,
                            reason = reason.as_str(),
                            "Outcome skipped"
                        );
                        *skips.entry(reason.as_str()).or_default() += 1;
                        report.skipped += 1;
                    }
                }
            }
        }

        info!(
            universe = universe.len(),
            entries = report.processed,
            filters = ?skips,
            "📡 [SIGNAL] Scan complete"
        );
        Ok(report)
    }
}
