//! Periodic expiry sweeping.
//!
//! One background task owns all time-driven cleanup: key rotation, and the
//! removal of expired sessions, lapsed key sets, and idle abuse ledgers.
//! The loop runs on an injected [`Clock`] so tests drive it with a manual
//! clock, and it shuts down through a watch channel rather than being
//! aborted mid-pass.

use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::modules::metrics::DeliveryMetrics;

use super::clock::Clock;
use super::keys::KeyManager;
use super::ledger::AbuseDetector;
use super::session::SessionStore;

/// Counts from one sweep pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub keys_rotated: usize,
    pub sessions_removed: usize,
    pub key_sets_removed: usize,
    pub ledgers_removed: usize,
}

impl SweepReport {
    pub fn total_removed(&self) -> usize {
        self.sessions_removed + self.key_sets_removed + self.ledgers_removed
    }
}

/// Drives cleanup across every expiring store.
pub struct ExpirySweeper {
    sessions: SessionStore,
    keys: KeyManager,
    abuse: AbuseDetector,
    clock: Arc<dyn Clock>,
    grace_secs: i64,
    metrics: Arc<DeliveryMetrics>,
}

impl ExpirySweeper {
    pub fn new(
        sessions: SessionStore,
        keys: KeyManager,
        abuse: AbuseDetector,
        clock: Arc<dyn Clock>,
        grace_secs: i64,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        ExpirySweeper {
            sessions,
            keys,
            abuse,
            clock,
            grace_secs,
            metrics,
        }
    }

    /// One full pass: rotate lapsed keys first so live key sessions stay
    /// serviceable, then drop whatever has expired past its grace window.
    pub async fn run_once(&self) -> SweepReport {
        let now = self.clock.now();

        let report = SweepReport {
            keys_rotated: self.keys.rotate(now).await,
            sessions_removed: self.sessions.sweep_expired(now, self.grace_secs).await,
            key_sets_removed: self.keys.sweep(now, self.grace_secs).await,
            ledgers_removed: self.abuse.sweep(now).await,
        };

        self.metrics.record_sweep(report.total_removed());
        if report.total_removed() > 0 || report.keys_rotated > 0 {
            info!(
                "Sweep pass: {} sessions, {} key sets, {} ledgers removed; {} keys rotated",
                report.sessions_removed,
                report.key_sets_removed,
                report.ledgers_removed,
                report.keys_rotated
            );
        } else {
            debug!("Sweep pass: nothing to do");
        }
        report
    }

    /// Spawn the periodic loop. Dropping the returned handle leaves the task
    /// running; call [`SweeperHandle::shutdown`] to stop it cleanly.
    pub fn start(self, period: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.run_once().await;
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Expiry sweeper stopped");
        });
        SweeperHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}

/// Shutdown handle for a running sweeper.
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the loop to stop and wait for the in-flight pass to finish.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}
