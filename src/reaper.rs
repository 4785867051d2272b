//! Reaper for finished handler tasks
//!
//! Runs for the whole server lifetime. Wakes when a handler reports
//! completion and on a fixed interval, removes completed task records from
//! the registry and joins their tasks outside the lock.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

use crate::registry::Registry;
use crate::types::ConnectionId;

pub struct Reaper {
    registry: Registry,
    completions: mpsc::UnboundedReceiver<ConnectionId>,
    shutdown: watch::Receiver<bool>,
    interval: Duration,
}

impl Reaper {
    pub fn new(
        registry: Registry,
        completions: mpsc::UnboundedReceiver<ConnectionId>,
        shutdown: watch::Receiver<bool>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            completions,
            shutdown,
            interval,
        }
    }

    /// Sweep until shutdown or until every completion sender is gone
    pub async fn run(mut self) {
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.wait_for(|stop| *stop) => break,
                done = self.completions.recv() => {
                    if done.is_none() {
                        break;
                    }
                }
                _ = ticker.tick() => {}
            }

            reap_completed(&self.registry).await;
        }

        debug!("Reaper stopped");
    }
}

/// Join and discard every completed task; returns how many were reaped
pub async fn reap_completed(registry: &Registry) -> usize {
    let finished = registry.take_completed().await;
    let count = finished.len();

    for record in finished {
        record.join().await;
    }
    if count > 0 {
        debug!("Reaped {} handler tasks", count);
    }
    count
}
