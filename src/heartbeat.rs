//! Heartbeat tracking and the secondary-side heartbeat monitor.
//!
//! While a node is secondary it expects a heartbeat from the primary every
//! `heartbeat_interval`. The monitor counts consecutive intervals without a
//! beat and emits a Primary desired-role event once the miss threshold is
//! reached. Everything here is inert while the node is primary.

use crate::types::{NodeRole, SharedRole};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{interval, Instant},
};
use tracing::{debug, error, info, warn};

#[derive(Debug)]
struct HeartbeatState {
    last_beat: Instant,
    missed: u32,
}

/// Mutex-guarded heartbeat bookkeeping shared between the replication
/// endpoint (which records inbound beats) and the monitor loop.
///
/// Critical sections are limited to the two fields.
#[derive(Debug)]
pub struct HeartbeatTracker {
    state: Mutex<HeartbeatState>,
}

impl Default for HeartbeatTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatTracker {
    /// Create a tracker with `last_beat` set to now.
    #[must_use]
    pub fn new() -> Self {
        Self { state: Mutex::new(HeartbeatState { last_beat: Instant::now(), missed: 0 }) }
    }

    /// Record an inbound heartbeat: refresh the timestamp and clear misses.
    pub fn record_beat(&self) {
        let mut state = self.state.lock();
        state.last_beat = Instant::now();
        state.missed = 0;
    }

    /// Reset to a fresh state. Used on promotion to secondary (grants the
    /// new primary a startup grace window) and on promotion to primary
    /// (heartbeat state is meaningless there).
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.last_beat = Instant::now();
        state.missed = 0;
    }

    /// Evaluate one monitor tick. Returns the new miss count and whether
    /// the threshold was crossed. When it is, the counter is reset to zero
    /// before the lock is released, so the Primary transition always begins
    /// with a clean count.
    fn tick(&self, heartbeat_interval: Duration, threshold: u32) -> (u32, bool) {
        let mut state = self.state.lock();
        if state.last_beat.elapsed() <= heartbeat_interval {
            return (state.missed, false);
        }
        state.missed += 1;
        if state.missed >= threshold {
            state.missed = 0;
            return (threshold, true);
        }
        (state.missed, false)
    }

    /// Current consecutive miss count.
    #[must_use]
    pub fn missed(&self) -> u32 {
        self.state.lock().missed
    }

    /// Time since the most recent beat (or reset).
    #[must_use]
    pub fn elapsed_since_last_beat(&self) -> Duration {
        self.state.lock().last_beat.elapsed()
    }
}

/// Secondary-side monitor loop emitting a Primary desired-role event on
/// heartbeat loss.
#[derive(Debug)]
pub struct HeartbeatMonitor {
    tracker: Arc<HeartbeatTracker>,
    heartbeat_interval: Duration,
    miss_threshold: u32,
    role: SharedRole,
    events: mpsc::Sender<NodeRole>,
    stop: watch::Receiver<bool>,
}

impl HeartbeatMonitor {
    /// Create a monitor. It does nothing until [`spawn`](Self::spawn)ed.
    #[must_use]
    pub fn new(
        tracker: Arc<HeartbeatTracker>,
        heartbeat_interval: Duration,
        miss_threshold: u32,
        role: SharedRole,
        events: mpsc::Sender<NodeRole>,
        stop: watch::Receiver<bool>,
    ) -> Self {
        Self { tracker, heartbeat_interval, miss_threshold, role, events, stop }
    }

    /// Spawn the monitor loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(mut self) {
        info!(
            interval = ?self.heartbeat_interval,
            threshold = self.miss_threshold,
            "starting heartbeat monitor"
        );
        let mut ticker = interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The immediate first tick would count the interval twice.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.stop.changed() => {
                    debug!("heartbeat monitor stopping");
                    return;
                }
                _ = ticker.tick() => {
                    if self.role.load() != NodeRole::Secondary {
                        debug!("no longer secondary, heartbeat monitor exiting");
                        return;
                    }
                    let (missed, exceeded) = self
                        .tracker
                        .tick(self.heartbeat_interval, self.miss_threshold);
                    if exceeded {
                        error!(
                            missed_count = missed,
                            "heartbeat threshold exceeded, initiating failover"
                        );
                        match self.events.try_send(NodeRole::Primary) {
                            Ok(()) => info!("triggered failover to primary role"),
                            Err(_) => {
                                warn!("role channel full, failover request dropped");
                            }
                        }
                        return;
                    }
                    if missed > 0 {
                        warn!(missed_count = missed, "missed heartbeat from primary");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_beat_clears_misses() {
        let tracker = HeartbeatTracker::new();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let (missed, exceeded) = tracker.tick(Duration::from_millis(10), 5);
        assert_eq!(missed, 1);
        assert!(!exceeded);

        tracker.record_beat();
        assert_eq!(tracker.missed(), 0);
        let (missed, exceeded) = tracker.tick(Duration::from_millis(10), 5);
        assert_eq!(missed, 0);
        assert!(!exceeded);
    }

    #[tokio::test]
    async fn test_threshold_crossing_resets_count() {
        let tracker = HeartbeatTracker::new();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let interval = Duration::from_millis(1);
        assert!(!tracker.tick(interval, 3).1);
        assert!(!tracker.tick(interval, 3).1);
        let (missed, exceeded) = tracker.tick(interval, 3);
        assert!(exceeded);
        assert_eq!(missed, 3);
        // Counter must be clean at the moment the transition begins.
        assert_eq!(tracker.missed(), 0);
    }

    #[tokio::test]
    async fn test_monitor_emits_primary_on_silence() {
        let tracker = Arc::new(HeartbeatTracker::new());
        let role = SharedRole::new();
        role.store(NodeRole::Secondary);
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let monitor = HeartbeatMonitor::new(
            tracker,
            Duration::from_millis(10),
            3,
            role,
            events_tx,
            stop_rx,
        );
        let handle = monitor.spawn();

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .expect("monitor should emit before the deadline")
            .expect("channel should stay open");
        assert_eq!(event, NodeRole::Primary);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_quiet_while_beats_arrive() {
        let tracker = Arc::new(HeartbeatTracker::new());
        let role = SharedRole::new();
        role.store(NodeRole::Secondary);
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = watch::channel(false);

        let monitor = HeartbeatMonitor::new(
            tracker.clone(),
            Duration::from_millis(20),
            3,
            role,
            events_tx,
            stop_rx,
        );
        let handle = monitor.spawn();

        // Keep beating for a while; no failover should trigger.
        for _ in 0..10 {
            tracker.record_beat();
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(events_rx.try_recv().is_err());

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_monitor_exits_on_role_change() {
        let tracker = Arc::new(HeartbeatTracker::new());
        let role = SharedRole::new();
        role.store(NodeRole::Primary);
        let (events_tx, mut events_rx) = mpsc::channel(1);
        let (_stop_tx, stop_rx) = watch::channel(false);

        let monitor = HeartbeatMonitor::new(
            tracker,
            Duration::from_millis(5),
            3,
            role,
            events_tx,
            stop_rx,
        );
        let handle = monitor.spawn();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor should exit promptly")
            .unwrap();
        assert!(events_rx.try_recv().is_err());
    }
}
