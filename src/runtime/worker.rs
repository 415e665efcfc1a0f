//! Poll/sleep loop shared by every worker role.

use super::Clock;
use crate::persistence::Store;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Counters from one pass over a worker's queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub processed: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl CycleReport {
    pub fn is_idle(&self) -> bool {
        self.processed == 0 && self.skipped == 0 && self.failed == 0
    }

    pub fn merge(&mut self, other: CycleReport) {
        self.processed += other.processed;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }
}

impl fmt::Display for CycleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "processed={} skipped={} failed={}",
            self.processed, self.skipped, self.failed
        )
    }
}

/// One role in the pipeline. A cycle must leave the store consistent on
/// its own; a crash between cycles loses nothing.
///
/// Workers own a blocking SQLite connection and run on a current-thread
/// runtime, so cycle futures are not `Send`.
#[async_trait(?Send)]
pub trait Worker {
    /// Heartbeat/lock identity, `<role>:<strategy>`.
    fn name(&self) -> String;

    async fn run_cycle(&mut self, now: DateTime<Utc>) -> Result<CycleReport>;
}

/// Liveness row writer for one worker process.
pub struct Heartbeat {
    store: Store,
    worker: String,
    pid: u32,
    host: String,
    started_at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn new(store: Store, worker: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            store,
            worker: worker.into(),
            pid: std::process::id(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
            started_at,
        }
    }

    pub fn beat(&self, now: DateTime<Utc>, last_error: Option<&str>) -> Result<()> {
        self.store
            .beat(&self.worker, self.pid, &self.host, self.started_at, now, last_error)
    }
}

/// Loop timing.
#[derive(Debug, Clone, Copy)]
pub struct LoopTiming {
    pub interval: Duration,
    pub error_backoff: Duration,
}

/// Run `worker` until `shutdown` is set. Cycle errors are logged, recorded in
/// the heartbeat and followed by the error backoff; they never end the loop.
pub async fn run_worker<W: Worker>(
    worker: &mut W,
    heartbeat: &Heartbeat,
    clock: &dyn Clock,
    timing: LoopTiming,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    let name = worker.name();
    info!(worker = %name, interval = ?timing.interval, "🚀 [WORKER] Starting");

    while !shutdown.load(Ordering::SeqCst) {
        let now = clock.now();
        let (pause, last_error) = match worker.run_cycle(now).await {
            Ok(report) => {
                if report.is_idle() {
                    debug!(worker = %name, "Idle cycle");
                } else {
                    info!(worker = %name, %report, "🔁 [WORKER] Cycle complete");
                }
                (timing.interval, None)
            }
            Err(e) => {
                error!(worker = %name, error = %format!("{:#}", e), "❌ [WORKER] Cycle failed");
                (timing.error_backoff, Some(format!("{:#}", e)))
            }
        };

        if let Err(e) = heartbeat.beat(clock.now(), last_error.as_deref()) {
            warn!(worker = %name, error = %e, "Failed to record heartbeat");
        }

        sleep_unless_shutdown(pause, &shutdown).await;
    }

    info!(worker = %name, "👋 [WORKER] Stopped");
    Ok(())
}

/// Sleep in short slices so a shutdown request is honoured promptly.
async fn sleep_unless_shutdown(total: Duration, shutdown: &AtomicBool) {
    let slice = Duration::from_millis(250);
    let mut remaining = total;
    while !remaining.is_zero() && !shutdown.load(Ordering::SeqCst) {
        let step = remaining.min(slice);
        tokio::time::sleep(step).await;
        remaining = remaining.saturating_sub(step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::SystemClock;
    use anyhow::anyhow;

    struct Flaky {
        cycles: usize,
        shutdown: Arc<AtomicBool>,
    }

    #[async_trait(?Send)]
    impl Worker for Flaky {
        fn name(&self) -> String {
            "flaky:test".to_string()
        }

        async fn run_cycle(&mut self, _now: DateTime<Utc>) -> Result<CycleReport> {
            self.cycles += 1;
            if self.cycles >= 3 {
                self.shutdown.store(true, Ordering::SeqCst);
            }
            if self.cycles == 2 {
                return Err(anyhow!("boom"));
            }
            Ok(CycleReport {
                processed: 1,
                ..Default::default()
            })
        }
    }

    #[tokio::test]
    async fn test_errors_do_not_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("hb.db");
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut worker = Flaky {
            cycles: 0,
            shutdown: shutdown.clone(),
        };
        let heartbeat = Heartbeat::new(Store::open(&db).unwrap(), "flaky:test", Utc::now());
        let timing = LoopTiming {
            interval: Duration::from_millis(1),
            error_backoff: Duration::from_millis(1),
        };

        run_worker(&mut worker, &heartbeat, &SystemClock, timing, shutdown)
            .await
            .unwrap();

        assert_eq!(worker.cycles, 3);
        let beats = Store::open(&db).unwrap().heartbeats().unwrap();
        assert_eq!(beats.len(), 1);
        assert_eq!(beats[0].cycles, 3);
        // Last cycle succeeded, so the error is cleared
        assert_eq!(beats[0].last_error, None);
    }

    #[test]
    fn test_report_merge() {
        let mut a = CycleReport {
            processed: 1,
            skipped: 2,
            failed: 0,
        };
        a.merge(CycleReport {
            processed: 1,
            skipped: 0,
            failed: 1,
        });
        assert_eq!(a.to_string(), "processed=2 skipped=2 failed=1");
        assert!(!a.is_idle());
        assert!(CycleReport::default().is_idle());
    }
}
