//! Background polling loop shared by collectors

use crate::error::Result;
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Poll statistics, logged when the loop ends
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub ticks: u64,
    pub errors: u64,
}

/// Periodic task calling `tick` until stopped
pub struct Poller {
    stop_tx: watch::Sender<bool>,
    handle: JoinHandle<PollStats>,
}

impl Poller {
    /// Start polling; the first tick fires immediately
    pub fn spawn<F, Fut>(name: impl Into<String>, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        let (stop_tx, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            debug!(poller = %name, interval_ms = period.as_millis() as u64, "Starting poll loop");
            let mut ticker = interval(period.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut stats = PollStats::default();
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let start = Instant::now();
                        if let Err(e) = tick().await {
                            stats.errors += 1;
                            warn!(poller = %name, error = %e, "Poll failed");
                        }
                        stats.ticks += 1;
                        let elapsed = start.elapsed();
                        if elapsed > period {
                            debug!(
                                poller = %name,
                                elapsed_ms = elapsed.as_millis() as u64,
                                "Poll took longer than its interval"
                            );
                        }
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!(poller = %name, ticks = stats.ticks, errors = stats.errors, "Poll loop stopped");
            stats
        });
        Self { stop_tx, handle }
    }

    /// Signal the loop and wait for it; a tick in progress completes first
    pub async fn stop(self) -> PollStats {
        let _ = self.stop_tx.send(true);
        self.handle.await.unwrap_or_default()
    }
}
