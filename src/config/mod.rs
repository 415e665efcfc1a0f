//! Configuration management for the mean-reversion trader.
//!
//! Settings are layered: `config.toml`, then the strategy profile file
//! `config/<profile>.toml`, then `MR_*` environment variables. The result is
//! immutable for the life of a worker; only the blacklist file is reloaded.

mod blacklist;

pub use blacklist::{Blacklist, BlacklistWatcher};

use anyhow::{Context, Result};
use chrono::Duration;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Strategy identity and execution mode
    #[serde(default)]
    pub strategy: StrategyConfig,
    /// Entry signal parameters
    #[serde(default)]
    pub signal: SignalConfig,
    /// Market universe selection
    #[serde(default)]
    pub universe: UniverseConfig,
    /// Position sizing
    #[serde(default)]
    pub sizing: SizingConfig,
    /// Exit rules
    #[serde(default)]
    pub exits: ExitConfig,
    /// Risk limits
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order execution parameters
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// Worker loop and storage
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Exchange API credentials
    #[serde(default)]
    pub exchange: ExchangeConfig,
}

/// How intents are acted upon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Record intents and hypothetical fills only
    Shadow,
    /// Route orders to the simulated exchange
    Paper,
    /// Route orders to the real exchange
    Live,
}

impl ExecutionMode {
    pub fn is_paper(&self) -> bool {
        !matches!(self, ExecutionMode::Live)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    /// Strategy identifier stamped on every intent, order and position
    #[serde(default = "default_strategy_id")]
    pub id: String,
    #[serde(default = "default_mode")]
    pub mode: ExecutionMode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalConfig {
    /// Minimum |dislocation| for entry (0.20 = 20% below average)
    #[serde(default = "default_dislocation_threshold")]
    pub dislocation_threshold: Decimal,
    /// Maximum |dislocation|; deeper drops are treated as regime changes
    #[serde(default = "default_max_dislocation")]
    pub max_dislocation: Decimal,
    #[serde(default = "default_min_price")]
    pub min_price: Decimal,
    #[serde(default = "default_max_price")]
    pub max_price: Decimal,
    /// Rolling average window
    #[serde(default = "default_avg_window_hours")]
    pub avg_window_hours: u32,
    /// Wider window used when the primary window has no observations
    #[serde(default = "default_fallback_window_hours")]
    pub fallback_window_hours: u32,
    /// Observations older than this are stale
    #[serde(default = "default_max_price_age_secs")]
    pub max_price_age_secs: u64,
    #[serde(default = "default_intent_ttl_secs")]
    pub intent_ttl_secs: u64,
    /// Skip outcomes whose short-term volatility just collapsed
    #[serde(default = "default_true")]
    pub avoid_volatility_collapse: bool,
    /// Skip outcomes with an abnormal burst of activity
    #[serde(default = "default_true")]
    pub avoid_volume_spike: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    /// Number of markets scanned per cycle
    #[serde(default = "default_top_markets")]
    pub top_markets: usize,
    #[serde(default = "default_min_volume_24h")]
    pub min_volume_24h: Decimal,
    #[serde(default = "default_excluded_tags")]
    pub excluded_tags: Vec<String>,
    /// When non-empty, a market must carry at least one of these tags
    #[serde(default)]
    pub included_tags: Vec<String>,
    /// Case-insensitive substrings matched against the market question
    #[serde(default)]
    pub excluded_keywords: Vec<String>,
    #[serde(default)]
    pub require_question: bool,
    /// Markets resolving sooner than this are skipped
    #[serde(default = "default_min_hours_to_resolution")]
    pub min_hours_to_resolution: u32,
    /// JSON file with blacklisted market ids, reloaded on change
    #[serde(default)]
    pub blacklist_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingConfig {
    /// Target notional per entry in USD
    #[serde(default = "default_base_position_usd")]
    pub base_position_usd: Decimal,
    #[serde(default = "default_max_position_usd")]
    pub max_position_usd: Decimal,
    /// Hard cap on a single order's notional
    #[serde(default)]
    pub max_order_usd: Option<Decimal>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExitConfig {
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: Decimal,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: Decimal,
    /// Loss cap measured on the slippage-adjusted exit price
    #[serde(default = "default_hard_stop_loss_pct")]
    pub hard_stop_loss_pct: Decimal,
    #[serde(default = "default_max_hold_hours")]
    pub max_hold_hours: u32,
    /// Stored marks older than this are not used for exits
    #[serde(default = "default_max_price_age_secs")]
    pub max_mark_age_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,
    #[serde(default = "default_max_positions_per_market")]
    pub max_positions_per_market: u32,
    /// Cooldown after a close before re-entering the same market
    #[serde(default = "default_market_cooldown_secs")]
    pub market_cooldown_secs: u64,
    /// Daily realized loss (USD) that trips the circuit breaker
    #[serde(default = "default_daily_loss_limit")]
    pub daily_loss_limit: Decimal,
    /// Consecutive losing closes in one market before it is banned
    #[serde(default = "default_max_loss_streak")]
    pub max_loss_streak: u32,
    #[serde(default = "default_ban_duration_hours")]
    pub ban_duration_hours: u32,
    /// Cumulative realized loss per market that blocks entries (0 = disabled)
    #[serde(default)]
    pub market_max_drawdown_usd: Decimal,
    /// Share quantity difference tolerated between ledger and exchange
    #[serde(default = "default_reconcile_tolerance")]
    pub reconcile_tolerance: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Limit price offset from the signal price (0.01 = 1%)
    #[serde(default = "default_slippage")]
    pub slippage: Decimal,
    /// Upper bound on any single exchange call
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_submit_attempts")]
    pub max_submit_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: u64,
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
    /// Live orders unfilled for longer than this are cancelled
    #[serde(default = "default_order_ttl_secs")]
    pub order_ttl_secs: u64,
    /// Quantity tolerance when deciding an order is fully filled
    #[serde(default = "default_fill_epsilon")]
    pub fill_epsilon: Decimal,
    /// Rows handled per worker cycle
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_loop_interval_secs")]
    pub loop_interval_secs: u64,
    /// Sleep after a failed cycle
    #[serde(default = "default_error_backoff_secs")]
    pub error_backoff_secs: u64,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    #[serde(default = "default_lock_dir")]
    pub lock_dir: PathBuf,
    /// Heartbeats older than this mark a worker as stalled
    #[serde(default = "default_heartbeat_stale_secs")]
    pub heartbeat_stale_secs: u64,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    #[serde(default = "default_exchange_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub api_secret: String,
    #[serde(default)]
    pub api_passphrase: String,
    /// Account (funder) address whose positions are reconciled
    #[serde(default)]
    pub account: String,
}

// Default value functions

fn default_strategy_id() -> String {
    "mean_reversion_v1".to_string()
}

fn default_mode() -> ExecutionMode {
    ExecutionMode::Paper
}

fn default_dislocation_threshold() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_dislocation() -> Decimal {
    Decimal::new(45, 2) // 0.45
}

fn default_min_price() -> Decimal {
    Decimal::new(5, 2) // 0.05
}

fn default_max_price() -> Decimal {
    Decimal::new(95, 2) // 0.95
}

fn default_avg_window_hours() -> u32 {
    18
}

fn default_fallback_window_hours() -> u32 {
    72
}

fn default_max_price_age_secs() -> u64 {
    3600
}

fn default_intent_ttl_secs() -> u64 {
    120
}

fn default_true() -> bool {
    true
}

fn default_top_markets() -> usize {
    50
}

fn default_min_volume_24h() -> Decimal {
    Decimal::new(10_000, 0)
}

fn default_excluded_tags() -> Vec<String> {
    ["sports", "nfl", "nba", "soccer", "mlb", "hockey"]
        .iter()
        .map(|t| t.to_string())
        .collect()
}

fn default_min_hours_to_resolution() -> u32 {
    6
}

fn default_base_position_usd() -> Decimal {
    Decimal::new(100, 0)
}

fn default_max_position_usd() -> Decimal {
    Decimal::new(200, 0)
}

fn default_take_profit_pct() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_stop_loss_pct() -> Decimal {
    Decimal::new(15, 2) // 0.15
}

fn default_hard_stop_loss_pct() -> Decimal {
    Decimal::new(20, 2) // 0.20
}

fn default_max_hold_hours() -> u32 {
    12
}

fn default_max_open_positions() -> u32 {
    10
}

fn default_max_positions_per_market() -> u32 {
    1
}

fn default_market_cooldown_secs() -> u64 {
    600
}

fn default_daily_loss_limit() -> Decimal {
    Decimal::new(1000, 0)
}

fn default_max_loss_streak() -> u32 {
    4
}

fn default_ban_duration_hours() -> u32 {
    24
}

fn default_reconcile_tolerance() -> Decimal {
    Decimal::new(5, 1) // 0.5 shares
}

fn default_slippage() -> Decimal {
    Decimal::new(1, 2) // 0.01
}

fn default_call_timeout_secs() -> u64 {
    10
}

fn default_max_submit_attempts() -> u32 {
    5
}

fn default_backoff_base_secs() -> u64 {
    2
}

fn default_backoff_max_secs() -> u64 {
    60
}

fn default_order_ttl_secs() -> u64 {
    900
}

fn default_fill_epsilon() -> Decimal {
    Decimal::new(1, 6) // 0.000001
}

fn default_batch_size() -> usize {
    25
}

fn default_loop_interval_secs() -> u64 {
    10
}

fn default_error_backoff_secs() -> u64 {
    30
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/mean_reversion.db")
}

fn default_lock_dir() -> PathBuf {
    PathBuf::from("data/locks")
}

fn default_heartbeat_stale_secs() -> u64 {
    120
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_exchange_url() -> String {
    "https://clob.polymarket.com".to_string()
}

impl Config {
    /// Load configuration for a strategy profile.
    ///
    /// `profile` names an optional `config/<profile>` file layered over the
    /// base `config` file, so strategy variants differ only in parameters.
    pub fn load(profile: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder =
            config::Config::builder().add_source(config::File::with_name("config").required(false));

        if let Some(profile) = profile {
            builder = builder.add_source(
                config::File::with_name(&format!("config/{}", profile)).required(false),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix("MR")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("universe.excluded_tags")
                    .with_list_parse_key("universe.included_tags")
                    .with_list_parse_key("universe.excluded_keywords"),
            )
            .build()
            .context("Failed to build configuration")?;

        let mut loaded: Config = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // A profile file may leave the id untouched; the profile name wins then.
        if let Some(profile) = profile {
            if loaded.strategy.id == default_strategy_id() {
                loaded.strategy.id = profile.to_string();
            }
        }

        Ok(loaded)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.strategy.id.is_empty(), "strategy.id must not be empty");

        anyhow::ensure!(
            self.signal.dislocation_threshold > Decimal::ZERO
                && self.signal.dislocation_threshold <= self.signal.max_dislocation,
            "dislocation_threshold must be > 0 and <= max_dislocation"
        );

        anyhow::ensure!(
            self.signal.min_price > Decimal::ZERO
                && self.signal.min_price < self.signal.max_price
                && self.signal.max_price < Decimal::ONE,
            "price bounds must satisfy 0 < min_price < max_price < 1"
        );

        anyhow::ensure!(
            self.signal.avg_window_hours > 0
                && self.signal.fallback_window_hours >= self.signal.avg_window_hours,
            "fallback_window_hours must be >= avg_window_hours > 0"
        );

        anyhow::ensure!(
            self.sizing.base_position_usd > Decimal::ZERO
                && self.sizing.max_position_usd > Decimal::ZERO,
            "position sizes must be positive"
        );

        anyhow::ensure!(
            self.exits.take_profit_pct > Decimal::ZERO
                && self.exits.stop_loss_pct > Decimal::ZERO
                && self.exits.hard_stop_loss_pct >= self.exits.stop_loss_pct,
            "exit thresholds must be positive and hard_stop_loss_pct >= stop_loss_pct"
        );

        anyhow::ensure!(
            self.execution.slippage >= Decimal::ZERO && self.execution.slippage < Decimal::ONE,
            "slippage must be between 0 and 1"
        );

        anyhow::ensure!(
            self.execution.max_submit_attempts >= 1,
            "max_submit_attempts must be >= 1"
        );

        anyhow::ensure!(
            self.risk.max_loss_streak >= 1 && self.risk.daily_loss_limit > Decimal::ZERO,
            "max_loss_streak must be >= 1 and daily_loss_limit > 0"
        );

        if self.strategy.mode == ExecutionMode::Live {
            anyhow::ensure!(
                !self.exchange.api_key.is_empty() && !self.exchange.api_secret.is_empty(),
                "live mode requires exchange.api_key and exchange.api_secret"
            );
        }

        Ok(())
    }

    pub fn is_paper(&self) -> bool {
        self.strategy.mode.is_paper()
    }

    pub fn intent_ttl(&self) -> Duration {
        Duration::seconds(self.signal.intent_ttl_secs as i64)
    }

    pub fn max_price_age(&self) -> Duration {
        Duration::seconds(self.signal.max_price_age_secs as i64)
    }
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            id: default_strategy_id(),
            mode: default_mode(),
        }
    }
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            dislocation_threshold: default_dislocation_threshold(),
            max_dislocation: default_max_dislocation(),
            min_price: default_min_price(),
            max_price: default_max_price(),
            avg_window_hours: default_avg_window_hours(),
            fallback_window_hours: default_fallback_window_hours(),
            max_price_age_secs: default_max_price_age_secs(),
            intent_ttl_secs: default_intent_ttl_secs(),
            avoid_volatility_collapse: true,
            avoid_volume_spike: true,
        }
    }
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            top_markets: default_top_markets(),
            min_volume_24h: default_min_volume_24h(),
            excluded_tags: default_excluded_tags(),
            included_tags: Vec::new(),
            excluded_keywords: Vec::new(),
            require_question: false,
            min_hours_to_resolution: default_min_hours_to_resolution(),
            blacklist_file: None,
        }
    }
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            base_position_usd: default_base_position_usd(),
            max_position_usd: default_max_position_usd(),
            max_order_usd: None,
        }
    }
}

impl Default for ExitConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: default_take_profit_pct(),
            stop_loss_pct: default_stop_loss_pct(),
            hard_stop_loss_pct: default_hard_stop_loss_pct(),
            max_hold_hours: default_max_hold_hours(),
            max_mark_age_secs: default_max_price_age_secs(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_open_positions: default_max_open_positions(),
            max_positions_per_market: default_max_positions_per_market(),
            market_cooldown_secs: default_market_cooldown_secs(),
            daily_loss_limit: default_daily_loss_limit(),
            max_loss_streak: default_max_loss_streak(),
            ban_duration_hours: default_ban_duration_hours(),
            market_max_drawdown_usd: Decimal::ZERO,
            reconcile_tolerance: default_reconcile_tolerance(),
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            slippage: default_slippage(),
            call_timeout_secs: default_call_timeout_secs(),
            max_submit_attempts: default_max_submit_attempts(),
            backoff_base_secs: default_backoff_base_secs(),
            backoff_max_secs: default_backoff_max_secs(),
            order_ttl_secs: default_order_ttl_secs(),
            fill_epsilon: default_fill_epsilon(),
            batch_size: default_batch_size(),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            loop_interval_secs: default_loop_interval_secs(),
            error_backoff_secs: default_error_backoff_secs(),
            db_path: default_db_path(),
            lock_dir: default_lock_dir(),
            heartbeat_stale_secs: default_heartbeat_stale_secs(),
            log_dir: default_log_dir(),
        }
    }
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: default_exchange_url(),
            api_key: String::new(),
            api_secret: String::new(),
            api_passphrase: String::new(),
            account: String::new(),
        }
    }
}
