//! Periodic eviction of stale counters.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info};

use super::store::CounterStore;

/// Background task that keeps the counter store bounded.
///
/// Every tick removes counters whose window ended more than one sweep
/// interval ago.
pub struct Sweeper {
    store: Arc<CounterStore>,
    every: Duration,
}

impl Sweeper {
    pub fn new(store: Arc<CounterStore>, every: Duration) -> Self {
        Self { store, every }
    }

    /// Run one sweep now.
    pub fn sweep(&self) -> usize {
        let evicted = self.store.evict_expired(self.every);
        debug!(
            evicted,
            remaining = self.store.counter_count(),
            "Eviction sweep finished"
        );
        evicted
    }

    /// Spawn the sweep loop; it ends once `shutdown` flips to `true` or its
    /// sender is dropped.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            info!(every = ?self.every, "Eviction sweeper started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!("Eviction sweeper stopped");
        })
    }
}
