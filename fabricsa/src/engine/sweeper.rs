//! Periodic timeout sweep.
//!
//! Bounds how long a record may sit in `WaitingForResult`, `NotAbleToSend`,
//! or `BusyRetryDelay`: each tick compares every timed record's deadline
//! against the monotonic clock and drives elapsed ones through the
//! retry/fail path. The observable latency between a deadline expiring and
//! its transition is at most one sweep interval.

use std::sync::Arc;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::driver::EngineCore;

/// Background task scanning the registry for elapsed deadlines.
pub(crate) struct TimeoutSweeper {
    core: Arc<EngineCore>,
}

impl TimeoutSweeper {
    pub fn new(core: Arc<EngineCore>) -> Self {
        TimeoutSweeper { core }
    }

    /// Sweep at the configured interval until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) {
        let interval = self.core.config.sweep_interval;
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        debug!(interval_ms = interval.as_millis() as u64, "timeout sweeper started");

        loop {
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => break,

                _ = ticker.tick() => self.core.sweep_once(),
            }
        }

        debug!("timeout sweeper stopped");
    }
}
