//! Shutdown coordination.
//!
//! Tracks how many tasks each service has in flight and detects the moment
//! when, once shutdown was requested, nothing is running anymore.

use crate::metrics::TaskMetrics;
use std::collections::HashMap;
use tokio::sync::watch;
use tracing::debug;

#[derive(Debug, Default)]
struct Ledger {
    counters: HashMap<String, usize>,
    armed: bool,
}

impl Ledger {
    fn total(&self) -> usize {
        self.counters.values().sum()
    }

    fn is_quiescent(&self) -> bool {
        self.armed && self.total() == 0
    }
}

/// Per-service task counters plus a global "armed" flag.
///
/// Counters never go below zero. Quiescence is reached when the coordinator is
/// armed and the sum of all counters is zero; every change to the ledger wakes
/// the waiters so they can re-check their condition.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<Ledger>,
    quiesced: watch::Sender<bool>,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(Ledger::default());
        let (quiesced, _) = watch::channel(false);
        Self { state, quiesced }
    }

    /// A task started on `id`.
    pub fn start(&self, id: &str) {
        let mut pending = 0;
        self.state.send_modify(|ledger| {
            let count = ledger.counters.entry(id.to_string()).or_default();
            *count += 1;
            pending = *count;
        });
        TaskMetrics::new(id).in_flight(pending);
    }

    /// A task finished on `id`.
    pub fn finish(&self, id: &str) {
        let mut pending = 0;
        self.state.send_modify(|ledger| {
            let count = ledger.counters.entry(id.to_string()).or_default();
            *count = count.saturating_sub(1);
            pending = *count;
        });
        TaskMetrics::new(id).in_flight(pending);
        self.check();
    }

    /// Tasks currently running on `id`.
    pub fn pending(&self, id: &str) -> usize {
        self.state
            .borrow()
            .counters
            .get(id)
            .copied()
            .unwrap_or_default()
    }

    /// Tasks currently running across all services.
    pub fn total(&self) -> usize {
        self.state.borrow().total()
    }

    /// Mark that shutdown was requested.
    pub fn arm(&self) {
        self.state.send_if_modified(|ledger| {
            let changed = !ledger.armed;
            ledger.armed = true;
            changed
        });
        self.check();
    }

    pub fn is_armed(&self) -> bool {
        self.state.borrow().armed
    }

    /// Whether quiescence has been reached since the coordinator was armed.
    pub fn is_quiescent(&self) -> bool {
        *self.quiesced.borrow()
    }

    fn check(&self) {
        if !self.state.borrow().is_quiescent() {
            return;
        }

        let fired = self.quiesced.send_if_modified(|quiesced| !std::mem::replace(quiesced, true));
        if fired {
            debug!("All services are idle");
        }
    }

    /// Receiver that flips to `true` once quiescence is first reached.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.quiesced.subscribe()
    }

    /// Wait until `id` has no running task.
    pub async fn wait_drained(&self, id: &str) {
        let mut rx = self.state.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx
            .wait_for(|ledger| ledger.counters.get(id).copied().unwrap_or_default() == 0)
            .await;
    }

    /// Wait until the coordinator is armed and every counter is zero.
    pub async fn wait_quiescent(&self) {
        let mut rx = self.quiesced.subscribe();
        let _ = rx.wait_for(|quiesced| *quiesced).await;
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
