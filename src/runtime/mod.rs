//! Worker process plumbing: clock, single-instance lock, poll loop and
//! heartbeat.

mod clock;
mod lock;
mod worker;

pub use clock::{Clock, ManualClock, SystemClock};
pub use lock::InstanceLock;
pub use worker::{run_worker, CycleReport, Heartbeat, LoopTiming, Worker};
