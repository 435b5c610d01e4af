//! Height monitor: polls the source peer and emits stable heights.

use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};
use warp_network::ClientError;
use warp_task::{Task, TaskConfig, TaskError, TaskSpec, background};

use crate::config::MonitorConfig;
use crate::ledger::Ledger;
use crate::stats::SyncStats;

/// Converts raw network heights into a strictly increasing stable sequence.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeightTracker {
    confirmation_depth: u64,
    last_emitted: Option<u64>,
}

impl HeightTracker {
    pub fn new(confirmation_depth: u64) -> Self {
        Self {
            confirmation_depth,
            last_emitted: None,
        }
    }

    /// Stable height to emit for `network_height`, if it is new.
    pub fn observe(&mut self, network_height: u64) -> Option<u64> {
        let stable = network_height.checked_sub(self.confirmation_depth)?;
        if self.last_emitted.is_some_and(|last| stable <= last) {
            return None;
        }
        self.last_emitted = Some(stable);
        Some(stable)
    }

    pub fn last_emitted(&self) -> Option<u64> {
        self.last_emitted
    }
}

pub fn height_monitor(
    ledger: Arc<dyn Ledger>,
    config: MonitorConfig,
    task_config: TaskConfig,
    stats: Arc<SyncStats>,
    output: mpsc::Sender<u64>,
) -> Task {
    Task::new(TaskSpec {
        config: task_config,
        background: vec![background(move |ctx| async move {
            let mut tracker = HeightTracker::new(config.confirmation_depth);
            let mut ticker = tokio::time::interval(config.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    _ = ticker.tick() => {}
                }

                let network_height = tokio::select! {
                    _ = ctx.cancelled() => return Ok(()),
                    res = ledger.network_height() => res,
                };
                let network_height = match network_height {
                    Ok(height) => height,
                    Err(ClientError::Cancelled) => return Err(TaskError::Cancelled),
                    Err(e) => {
                        SyncStats::incr(&stats.height_poll_errors);
                        warn!(error = %e, "monitor: failed to fetch network height");
                        continue;
                    }
                };

                match tracker.observe(network_height) {
                    Some(stable) => {
                        SyncStats::incr(&stats.heights_observed);
                        info!(network_height, stable, "monitor: new stable height");
                        ctx.send(&output, stable).await?;
                    }
                    None => debug!(network_height, "monitor: no new stable height"),
                }
            }
        })],
        ..TaskSpec::new("height-monitor")
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::testing::ScriptedLedger;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    #[test]
    fn tracker_subtracts_depth() {
        let mut t = HeightTracker::new(10);
        assert_eq!(t.observe(100), Some(90));
        assert_eq!(t.last_emitted(), Some(90));
    }

    #[test]
    fn tracker_never_repeats_or_decreases() {
        let mut t = HeightTracker::new(0);
        assert_eq!(t.observe(5), Some(5));
        assert_eq!(t.observe(5), None);
        assert_eq!(t.observe(4), None);
        assert_eq!(t.observe(7), Some(7));
    }

    #[test]
    fn tracker_waits_for_depth() {
        let mut t = HeightTracker::new(10);
        assert_eq!(t.observe(9), None);
        assert_eq!(t.observe(10), Some(0));
    }

    mod props {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn emitted_heights_strictly_increase(depth in 0u64..20, heights in prop::collection::vec(0u64..1_000, 0..100)) {
                let mut t = HeightTracker::new(depth);
                let emitted: Vec<u64> = heights.into_iter().filter_map(|h| t.observe(h)).collect();
                prop_assert!(emitted.windows(2).all(|w| w[0] < w[1]));
            }
        }
    }

    fn config() -> MonitorConfig {
        MonitorConfig {
            interval: Duration::from_secs(1),
            confirmation_depth: 2,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn monitor_emits_on_growth_only() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.height.store(12, Ordering::SeqCst);
        let stats = SyncStats::new();
        let (tx, mut rx) = mpsc::channel(8);

        let task = height_monitor(ledger.clone(), config(), TaskConfig::default(), stats.clone(), tx);
        task.start().unwrap();

        assert_eq!(rx.recv().await, Some(10));
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        assert!(rx.try_recv().is_err());

        ledger.height.store(15, Ordering::SeqCst);
        assert_eq!(rx.recv().await, Some(13));
        assert_eq!(stats.snapshot().heights_observed, 2);

        task.stop_wait().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_send_is_interrupted_by_shutdown() {
        let ledger = Arc::new(ScriptedLedger::default());
        ledger.height.store(100, Ordering::SeqCst);
        let (tx, _rx) = mpsc::channel(1);
        let task = height_monitor(ledger.clone(), config(), TaskConfig::default(), SyncStats::new(), tx);
        task.start().unwrap();

        for h in 101..105 {
            ledger.height.store(h, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        task.stop_wait().await.unwrap();
    }
}
