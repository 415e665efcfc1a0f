//! Mean-Reversion Trader - Main Entry Point
//!
//! Each pipeline role runs as its own process (`run <role>`); the processes
//! share nothing but the SQLite store.

use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use mean_reversion_trader::config::{Config, ExecutionMode};
use mean_reversion_trader::exchange::{ClobClient, ExchangeClient, PaperExchange};
use mean_reversion_trader::persistence::Store;
use mean_reversion_trader::risk::PositionReconciler;
use mean_reversion_trader::runtime::{
    run_worker, Clock, Heartbeat, InstanceLock, LoopTiming, SystemClock, Worker,
};
use mean_reversion_trader::strategy::{
    ExitMonitor, FillReconciler, IntentTranslator, OrderSubmitter, SignalGenerator,
};
use rust_decimal_macros::dec;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn, Level};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

/// Mean-Reversion Trader CLI
#[derive(Parser)]
#[command(name = "mean-reversion-trader")]
#[command(version, about = "Mean-reversion trading workers for prediction markets")]
struct Cli {
    /// Strategy profile layered from config/<profile>
    #[arg(short, long, global = true)]
    profile: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one pipeline worker until interrupted
    Run {
        #[arg(value_enum)]
        role: Role,
    },

    /// Create the database schema and exit
    InitDb,

    /// Show pipeline state from the store
    Status {
        /// Also show discrepancies and shadow fills
        #[arg(short, long)]
        verbose: bool,
    },

    /// List worker heartbeats; exits non-zero when any is stale
    Heartbeats {
        /// Staleness threshold in seconds (default: runtime.heartbeat_stale_secs)
        #[arg(long)]
        max_age: Option<u64>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Role {
    Signals,
    Translator,
    Submitter,
    Fills,
    Exits,
    Reconciler,
}

impl Role {
    fn as_str(&self) -> &'static str {
        match self {
            Role::Signals => "signals",
            Role::Translator => "translator",
            Role::Submitter => "submitter",
            Role::Fills => "fills",
            Role::Exits => "exits",
            Role::Reconciler => "reconciler",
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.profile.as_deref())?;

    match cli.command {
        Some(Commands::Run { role }) => {
            init_logging(&config.runtime.log_dir, role.as_str())?;
            run_role(config, role).await
        }
        Some(Commands::InitDb) => {
            Store::open(&config.runtime.db_path)?;
            println!("✅ Database ready at {}", config.runtime.db_path.display());
            Ok(())
        }
        Some(Commands::Status { verbose }) => show_status(&config, verbose),
        Some(Commands::Heartbeats { max_age }) => {
            let max_age = max_age.unwrap_or(config.runtime.heartbeat_stale_secs);
            if !show_heartbeats(&config, max_age)? {
                std::process::exit(2);
            }
            Ok(())
        }
        None => show_status(&config, false),
    }
}

/// Initialize logging to stdout plus an hourly rolling file per role.
fn init_logging(log_dir: &Path, role: &str) -> Result<()> {
    use tracing_subscriber::fmt::writer::MakeWriterExt;

    std::fs::create_dir_all(log_dir)
        .with_context(|| format!("Failed to create log dir {}", log_dir.display()))?;

    let file_appender =
        tracing_appender::rolling::hourly(log_dir, format!("mean-reversion-{}.log", role));
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);

    // Leak the guard to keep it alive for the program duration
    Box::leak(Box::new(_guard));

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("mean_reversion_trader=debug".parse()?)
                .add_directive(Level::INFO.into()),
        )
        .with_writer(std::io::stdout.and(file_writer))
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_span_events(FmtSpan::CLOSE)
        .with_ansi(true)
        .init();

    Ok(())
}

/// Log configuration on startup.
fn log_config(config: &Config, role: Role) {
    info!("📋 Configuration:");
    info!("   Strategy: {} ({:?}), role {}", config.strategy.id, config.strategy.mode, role.as_str());
    info!(
        "   Dislocation: {:.0}%..{:.0}%, prices {}..{}",
        config.signal.dislocation_threshold * dec!(100),
        config.signal.max_dislocation * dec!(100),
        config.signal.min_price,
        config.signal.max_price
    );
    info!(
        "   Exits: TP {:.0}%, SL {:.0}%, hard cap {:.0}%, max hold {}h",
        config.exits.take_profit_pct * dec!(100),
        config.exits.stop_loss_pct * dec!(100),
        config.exits.hard_stop_loss_pct * dec!(100),
        config.exits.max_hold_hours
    );
    info!(
        "   Sizing: base ${}, max ${}",
        config.sizing.base_position_usd, config.sizing.max_position_usd
    );
    info!(
        "   Risk: max {} positions, daily loss ${}, streak {} → {}h ban",
        config.risk.max_open_positions,
        config.risk.daily_loss_limit,
        config.risk.max_loss_streak,
        config.risk.ban_duration_hours
    );
    info!("   Store: {}", config.runtime.db_path.display());
}

/// Account whose positions the venue reports.
fn account(config: &Config) -> String {
    if config.exchange.account.is_empty() {
        "paper".to_string()
    } else {
        config.exchange.account.clone()
    }
}

fn build_exchange(config: &Config, clock: Arc<dyn Clock>) -> Result<Arc<dyn ExchangeClient>> {
    let call_timeout = Duration::from_secs(config.execution.call_timeout_secs);
    match config.strategy.mode {
        ExecutionMode::Live => {
            warn!("⚠️  LIVE TRADING MODE - Real money at risk!");
            Ok(Arc::new(ClobClient::new(&config.exchange, call_timeout)?))
        }
        ExecutionMode::Paper | ExecutionMode::Shadow => {
            info!("📝 PAPER TRADING MODE - Simulated venue in the shared store");
            let store = Store::open(&config.runtime.db_path)?;
            Ok(Arc::new(PaperExchange::new(store, clock, account(config))))
        }
    }
}

async fn run_role(config: Config, role: Role) -> Result<()> {
    config.validate()?;

    info!("╔════════════════════════════════════════════════════════════╗");
    info!(
        "║       Mean-Reversion Trader v{} - {:<12}               ║",
        env!("CARGO_PKG_VERSION"),
        role.as_str()
    );
    info!("╚════════════════════════════════════════════════════════════╝");
    log_config(&config, role);

    let lock = InstanceLock::acquire(
        &config.runtime.lock_dir,
        &format!("{}-{}", role.as_str(), config.strategy.id),
    )?;
    info!(lock = %lock.path().display(), "🔒 Instance lock held");

    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("🛑 Shutdown signal received");
        shutdown_clone.store(true, Ordering::SeqCst);
    });

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let timing = LoopTiming {
        interval: Duration::from_secs(config.runtime.loop_interval_secs),
        error_backoff: Duration::from_secs(config.runtime.error_backoff_secs),
    };
    let open = || Store::open(&config.runtime.db_path);

    match role {
        Role::Signals => {
            let mut worker = SignalGenerator::new(open()?, config.clone());
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
        Role::Translator => {
            let mut worker = IntentTranslator::new(open()?, config.clone());
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
        Role::Submitter => {
            let exchange = build_exchange(&config, clock.clone())?;
            let mut worker = OrderSubmitter::new(
                open()?,
                exchange,
                config.strategy.id.clone(),
                config.is_paper(),
                config.execution.clone(),
            );
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
        Role::Fills => {
            let exchange = build_exchange(&config, clock.clone())?;
            let mut worker = FillReconciler::new(open()?, exchange, &config);
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
        Role::Exits => {
            let exchange = build_exchange(&config, clock.clone())?;
            let mut worker = ExitMonitor::new(open()?, exchange, config.clone());
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
        Role::Reconciler => {
            let exchange = build_exchange(&config, clock.clone())?;
            let mut worker = PositionReconciler::new(
                open()?,
                exchange,
                config.strategy.id.clone(),
                account(&config),
                config.risk.reconcile_tolerance,
                Duration::from_secs(config.execution.call_timeout_secs),
                ChronoDuration::seconds(config.runtime.heartbeat_stale_secs as i64),
            );
            drive(&mut worker, &config, clock.as_ref(), timing, shutdown).await?
        }
    }

    info!("👋 Mean-Reversion Trader {} shutdown complete", role.as_str());
    Ok(())
}

async fn drive<W: Worker>(
    worker: &mut W,
    config: &Config,
    clock: &dyn Clock,
    timing: LoopTiming,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let heartbeat = Heartbeat::new(Store::open(&config.runtime.db_path)?, worker.name(), clock.now());
    run_worker(worker, &heartbeat, clock, timing, shutdown).await
}

/// Show pipeline state from the store.
fn show_status(config: &Config, verbose: bool) -> Result<()> {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║              MEAN-REVERSION STATUS                         ║");
    println!("╚════════════════════════════════════════════════════════════╝");

    let db_path = &config.runtime.db_path;
    if !db_path.exists() {
        println!("\n❌ Database not found: {}", db_path.display());
        println!("   Run `init-db` or start a worker first.");
        return Ok(());
    }

    let store = Store::open(db_path)?;
    let strategy = config.strategy.id.as_str();
    let now = Utc::now();

    println!("\n📋 Strategy");
    println!("   ├─ Id:    {}", strategy);
    println!("   └─ Mode:  {:?}", config.strategy.mode);

    let intents = store.intent_counts(strategy)?;
    println!("\n🧭 Intents");
    println!("   ├─ Pending:  {}", intents.pending);
    println!("   ├─ Shadow:   {}", intents.shadow);
    println!("   ├─ Ordered:  {}", intents.ordered);
    println!("   ├─ Rejected: {}", intents.rejected);
    println!("   └─ Expired:  {}", intents.expired);

    let orders = store.order_status_counts(strategy)?;
    if !orders.is_empty() {
        println!("\n📨 Orders");
        for (status, count) in &orders {
            println!("   ├─ {}: {}", status, count);
        }
    }

    let positions = store.positions(strategy)?;
    println!("\n🔓 Positions ({})", positions.len());
    for pos in &positions {
        println!(
            "   ├─ {}#{} {} @ {} [{}{}] since {}",
            pos.market_id,
            pos.outcome,
            pos.quantity,
            pos.avg_price.round_dp(4),
            pos.status.as_str(),
            pos.exit_reason.map(|r| format!(" {}", r)).unwrap_or_default(),
            pos.opened_at.format("%Y-%m-%d %H:%M UTC")
        );
    }

    let summary = store.closed_summary(strategy, now - ChronoDuration::hours(24))?;
    println!("\n📈 Last 24h");
    println!("   ├─ Closed:       {}", summary.count);
    println!("   ├─ Win rate:     {:.1}%", summary.win_rate() * dec!(100));
    println!("   └─ Realized PnL: ${:.2}", summary.realized_pnl);
    for (reason, count, pnl) in &summary.by_reason {
        println!("       {}: {} (${:.2})", reason, count, pnl);
    }

    println!("\n🛡️  Risk");
    match store.strategy_risk(strategy)? {
        Some(risk) => {
            println!("   ├─ Day {}: ${:.2}", risk.day, risk.daily_realized_pnl);
            match risk.breaker_until.filter(|until| *until > now) {
                Some(until) => println!("   ├─ 🛑 Circuit breaker until {}", until.format("%Y-%m-%d %H:%M UTC")),
                None => println!("   ├─ Circuit breaker: off"),
            }
        }
        None => println!("   ├─ No closes booked yet"),
    }
    let bans = store.active_bans(strategy, now)?;
    println!("   └─ Banned markets: {}", bans.len());
    for ban in &bans {
        if let Some(until) = ban.banned_until {
            println!(
                "       {} until {} ({})",
                ban.market_id,
                until.format("%Y-%m-%d %H:%M UTC"),
                ban.ban_reason.as_deref().unwrap_or("-")
            );
        }
    }

    if verbose {
        let discrepancies = store.discrepancies(strategy, now - ChronoDuration::hours(24))?;
        if !discrepancies.is_empty() {
            println!("\n⚠️  Reconciliation discrepancies (24h)");
            for d in &discrepancies {
                println!(
                    "   ├─ {} {}#{} ledger={} exchange={}",
                    d.detected_at.format("%H:%M:%S"),
                    d.market_id,
                    d.outcome,
                    d.ledger_quantity,
                    d.exchange_quantity
                );
            }
        }

        let shadow = store.shadow_fills(strategy, 10)?;
        if !shadow.is_empty() {
            println!("\n👻 Recent shadow fills");
            for fill in &shadow {
                println!(
                    "   ├─ {} {}#{} {} @ {} (signal {})",
                    fill.ts.format("%Y-%m-%d %H:%M"),
                    fill.market_id,
                    fill.outcome,
                    fill.size,
                    fill.sim_entry_price.round_dp(4),
                    fill.signal_price
                );
            }
        }
    }

    println!();
    Ok(())
}

/// Print heartbeats. Returns false when any worker is stale.
fn show_heartbeats(config: &Config, max_age_secs: u64) -> Result<bool> {
    let store = Store::open(&config.runtime.db_path)?;
    let now = Utc::now();
    let max_age = ChronoDuration::seconds(max_age_secs as i64);

    let beats = store.heartbeats()?;
    if beats.is_empty() {
        println!("No heartbeats recorded");
        return Ok(true);
    }

    let mut healthy = true;
    for beat in &beats {
        let stale = beat.is_stale(now, max_age);
        healthy &= !stale;
        println!(
            "{} {:<28} pid={} host={} age={}s cycles={}{}",
            if stale { "❌" } else { "✅" },
            beat.worker,
            beat.pid,
            beat.host,
            (now - beat.last_seen).num_seconds(),
            beat.cycles,
            beat.last_error
                .as_deref()
                .map(|e| format!(" last_error={}", e))
                .unwrap_or_default()
        );
    }
    Ok(healthy)
}
