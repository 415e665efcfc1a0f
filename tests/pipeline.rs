//! End-to-end pipeline tests.
//!
//! Every worker gets its own connection to one temp-file store, as separate
//! processes would, and the venue is the in-memory mock with auto fills:
//! - Dip entry through to a take-profit close
//! - Three losing closes ban the market for new entries
//! - Ledger vs venue mismatch is recorded, never corrected

use chrono::{DateTime, Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use mean_reversion_trader::config::{Config, ExecutionMode};
use mean_reversion_trader::exchange::{ExchangeClient, MockExchange};
use mean_reversion_trader::model::{ExitReason, IntentKind, Market, PositionStatus, PriceObservation};
use mean_reversion_trader::persistence::Store;
use mean_reversion_trader::risk::PositionReconciler;
use mean_reversion_trader::runtime::{Clock, ManualClock, Worker};
use mean_reversion_trader::strategy::{
    ExitMonitor, FillReconciler, IntentTranslator, OrderSubmitter, SignalGenerator, Translation,
};

const MARKET: &str = "m1";
const TOKEN: &str = "m1-yes";

fn config() -> Config {
    let mut config = Config::default();
    config.strategy.id = "mr".to_string();
    config.strategy.mode = ExecutionMode::Paper;
    config.signal.avoid_volatility_collapse = false;
    config.signal.avoid_volume_spike = false;
    config.risk.max_loss_streak = 3;
    config
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap()
}

struct Pipeline {
    _dir: TempDir,
    path: PathBuf,
    clock: Arc<ManualClock>,
    exchange: Arc<MockExchange>,
    store: Store,
    signals: SignalGenerator,
    translator: IntentTranslator,
    submitter: OrderSubmitter,
    fills: FillReconciler,
    exits: ExitMonitor,
}

impl Pipeline {
    fn new(config: Config) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pipeline.db");
        let open = || Store::open(&path).unwrap();

        let clock = Arc::new(ManualClock::new(start()));
        let exchange = Arc::new(MockExchange::new(clock.clone()).with_auto_fill());

        let store = open();
        store
            .upsert_market(&Market {
                market_id: MARKET.to_string(),
                question: "Will the bill pass the senate this week?".to_string(),
                tags: vec!["politics".to_string()],
                outcome_tokens: vec!["m1-no".to_string(), TOKEN.to_string()],
                resolves_at: None,
                active: true,
            })
            .unwrap();

        Self {
            signals: SignalGenerator::new(open(), config.clone()),
            translator: IntentTranslator::new(open(), config.clone()),
            submitter: OrderSubmitter::new(
                open(),
                exchange.clone(),
                config.strategy.id.clone(),
                true,
                config.execution.clone(),
            ),
            fills: FillReconciler::new(open(), exchange.clone(), &config),
            exits: ExitMonitor::new(open(), exchange.clone(), config.clone()),
            store,
            path,
            clock,
            exchange,
            _dir: dir,
        }
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    fn record_price(&self, price: Decimal, ts: DateTime<Utc>) {
        self.store
            .record_price(&PriceObservation {
                market_id: MARKET.to_string(),
                outcome: 1,
                ts,
                price,
                volume_usd: dec!(1000),
            })
            .unwrap();
    }

    /// Twenty samples at 0.10 over the last 17h, then a dip to 0.075.
    fn seed_dip(&self) {
        let now = self.now();
        for i in 0..20 {
            self.record_price(dec!(0.10), now - Duration::hours(17) + Duration::minutes(i * 50));
        }
        self.record_price(dec!(0.075), now - Duration::minutes(1));
    }

    /// One pass of every worker in pipeline order, exit leg included.
    async fn tick(&mut self) {
        let now = self.now();
        self.signals.run_cycle(now).await.unwrap();
        self.translator.run_cycle(now).await.unwrap();
        self.submitter.run_cycle(now).await.unwrap();
        self.fills.run_cycle(now).await.unwrap();
        self.exits.run_cycle(now).await.unwrap();
        self.translator.run_cycle(now).await.unwrap();
        self.submitter.run_cycle(now).await.unwrap();
        self.fills.run_cycle(now).await.unwrap();
    }

    fn reconciler(&self) -> PositionReconciler {
        PositionReconciler::new(
            Store::open(&self.path).unwrap(),
            self.exchange.clone(),
            "mr",
            "paper",
            dec!(0.5),
            std::time::Duration::from_secs(5),
            Duration::seconds(120),
        )
    }
}

#[tokio::test]
async fn test_dip_entry_to_take_profit_close() {
    let mut pipeline = Pipeline::new(config());
    pipeline.seed_dip();

    // No mark yet: the stored 0.075 is fresh and no exit rule matches
    pipeline.tick().await;
    let position = pipeline.store.get_position("mr", MARKET, 1).unwrap().unwrap();
    assert_eq!(position.status, PositionStatus::Open);
    // 100 USD sized at the signal price, filled at the 1% slippage limit
    assert_eq!(position.quantity, dec!(1333.33));
    assert_eq!(position.avg_price, dec!(0.07575));
    let dislocation = position.entry_dislocation.unwrap();
    assert!(dislocation < dec!(-0.20) && dislocation > dec!(-0.25));

    // +15.5% on the mark
    pipeline.exchange.set_mark(TOKEN, dec!(0.0875)).await;
    pipeline.clock.advance(Duration::minutes(1));
    pipeline.tick().await;

    assert!(pipeline.store.get_position("mr", MARKET, 1).unwrap().is_none());
    let closed = pipeline
        .store
        .closed_positions("mr", start() - Duration::hours(1), 10)
        .unwrap();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].exit_reason, ExitReason::TakeProfit);
    assert_eq!(closed[0].size, dec!(1333.33));
    // Sold at 0.0875 less 1% slippage
    assert_eq!(closed[0].exit_price, dec!(0.086625));
    assert!(closed[0].realized_pnl > Decimal::ZERO);

    let counts = pipeline.store.intent_counts("mr").unwrap();
    assert_eq!(counts.ordered, 2);
    assert_eq!(counts.pending, 0);
    assert_eq!(pipeline.exchange.submit_calls().await, 2);

    // Venue and ledger are both flat
    let report = pipeline.reconciler().run_cycle(pipeline.now()).await.unwrap();
    assert_eq!(report.failed, 0);
    assert!(pipeline.exchange.positions("paper").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_loss_streak_bans_market_for_new_entries() {
    let mut pipeline = Pipeline::new(config());
    pipeline.seed_dip();
    // Entries fill at their limit; the mark is far enough down to hit the loss cap
    pipeline.exchange.set_mark(TOKEN, dec!(0.06)).await;

    for round in 0..3 {
        if round > 0 {
            // Past the re-entry cooldown, with a fresh dip print
            pipeline.clock.advance(Duration::minutes(11));
            let now = pipeline.now();
            pipeline.record_price(dec!(0.075), now - Duration::seconds(30));
        }
        pipeline.tick().await;
        assert!(
            pipeline.store.get_position("mr", MARKET, 1).unwrap().is_none(),
            "round {} should have closed",
            round
        );
    }

    let closed = pipeline
        .store
        .closed_positions("mr", start() - Duration::hours(1), 10)
        .unwrap();
    assert_eq!(closed.len(), 3);
    assert!(closed.iter().all(|c| c.realized_pnl < Decimal::ZERO));
    assert!(closed.iter().all(|c| c.exit_reason == ExitReason::RiskCap));

    let risk = pipeline.store.market_risk("mr", MARKET).unwrap().unwrap();
    // The streak resets once it has been turned into a ban
    assert_eq!(risk.loss_streak, 0);
    assert_eq!(risk.ban_reason.as_deref(), Some("loss_streak_3"));
    let banned_until = risk.banned_until.unwrap();
    assert!(banned_until > pipeline.now() + Duration::hours(23));

    // A fresh signal is still emitted, but the translator refuses it
    pipeline.clock.advance(Duration::minutes(11));
    let now = pipeline.now();
    pipeline.record_price(dec!(0.075), now - Duration::seconds(30));
    let report = pipeline.signals.run_cycle(now).await.unwrap();
    assert_eq!(report.processed, 1);

    match pipeline.translator.translate_next(now).unwrap() {
        Some(Translation::Rejected { reason, .. }) => assert_eq!(reason, "loss_streak_ban"),
        other => panic!("expected a ban rejection, got {:?}", other),
    }
    assert!(!pipeline
        .store
        .has_pending_intent("mr", MARKET, 1, IntentKind::Entry)
        .unwrap());
    assert_eq!(pipeline.exchange.submit_calls().await, 6);
}

#[tokio::test]
async fn test_manual_venue_trade_is_flagged_not_corrected() {
    let mut pipeline = Pipeline::new(config());
    pipeline.seed_dip();
    pipeline.tick().await;
    let ledger = pipeline.store.get_position("mr", MARKET, 1).unwrap().unwrap();

    // Someone sold 500 shares by hand on the venue
    pipeline
        .exchange
        .set_position(MARKET, 1, ledger.quantity - dec!(500))
        .await;

    let mut reconciler = pipeline.reconciler();
    let report = reconciler.run_cycle(pipeline.now()).await.unwrap();
    assert_eq!(report.failed, 1);

    let found = pipeline
        .store
        .discrepancies("mr", start() - Duration::hours(1))
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].ledger_quantity, ledger.quantity);
    assert_eq!(found[0].exchange_quantity, dec!(833.33));

    let after = pipeline.store.get_position("mr", MARKET, 1).unwrap().unwrap();
    assert_eq!(after.quantity, ledger.quantity);
}
