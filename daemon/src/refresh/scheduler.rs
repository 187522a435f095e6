//! Scheduled upkeep - background task for list reloads and snapshots.
//!
//! Checks the list files on one interval and persists profiles on another,
//! until the daemon signals shutdown.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::now_ms;
use crate::refresh::service::RefreshService;
use log::{debug, info};

/// Configuration for the scheduled refresh service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Interval between list modification checks
    #[serde(with = "secs")]
    pub refresh_interval: Duration,
    /// Interval between profile snapshots
    #[serde(with = "secs")]
    pub snapshot_interval: Duration,
    /// Whether the scheduler is enabled
    pub enabled: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(30),
            snapshot_interval: Duration::from_secs(5 * 60),
            enabled: true,
        }
    }
}

/// Durations are written as whole seconds in config files
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Runs as a background task spawned during daemon startup.
pub struct RefreshScheduler {
    service: Arc<RefreshService>,
    config: SchedulerConfig,
    /// Timestamp of the last list check
    last_refresh_at: Arc<RwLock<u64>>,
}

impl RefreshScheduler {
    pub fn new(service: Arc<RefreshService>, config: SchedulerConfig) -> Self {
        Self {
            service,
            config,
            last_refresh_at: Arc::new(RwLock::new(now_ms())),
        }
    }

    /// Returns the timestamp of the last list check.
    pub fn last_refresh(&self) -> u64 {
        *self.last_refresh_at.read()
    }

    /// Starts the scheduler loop.
    ///
    /// Runs until `shutdown` flips to true (or its sender is dropped), then
    /// writes one final snapshot.
    pub async fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            info!("Scheduled refresh is disabled, skipping");
            return;
        }

        info!(
            "Starting scheduled refresh: lists every {}s, snapshots every {}s",
            self.config.refresh_interval.as_secs(),
            self.config.snapshot_interval.as_secs()
        );

        let mut refresh_ticker = interval(self.config.refresh_interval);
        refresh_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut snapshot_ticker = interval(self.config.snapshot_interval);
        snapshot_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Both intervals fire immediately; the startup state needs no snapshot
        snapshot_ticker.tick().await;

        loop {
            tokio::select! {
                _ = refresh_ticker.tick() => self.do_refresh(),
                _ = snapshot_ticker.tick() => self.service.persist_or_log(),
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.service.persist_or_log();
        info!("Scheduled refresh stopped");
    }

    /// Executes one list check.
    fn do_refresh(&self) {
        let stats = self.service.refresh_lists();
        if stats.lists_reloaded > 0 {
            info!(
                "Scheduled refresh reloaded {} lists ({} entries) in {}ms",
                stats.lists_reloaded, stats.entries, stats.duration_ms
            );
        } else {
            debug!("Scheduled refresh: lists unchanged");
        }
        *self.last_refresh_at.write() = stats.timestamp;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::SnapshotStore;
    use policy_core::{BlockOrAllowList, DecisionEngine, ProfileManager};

    #[test]
    fn test_scheduler_config_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.enabled);
        assert_eq!(config.refresh_interval.as_secs(), 30);
        assert_eq!(config.snapshot_interval.as_secs(), 300);
    }

    #[test]
    fn test_scheduler_config_in_seconds() {
        let config: SchedulerConfig =
            serde_json::from_str(r#"{"refresh_interval": 3600, "enabled": false}"#).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.refresh_interval.as_secs(), 3600);
        assert_eq!(
            serde_json::to_value(&config).unwrap()["snapshot_interval"],
            300
        );
    }

    #[tokio::test]
    async fn test_scheduler_snapshots_on_shutdown() {
        let engine = Arc::new(DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::new(),
            BlockOrAllowList::new(),
        ));
        let store = Arc::new(SnapshotStore::in_memory().unwrap());
        let service = Arc::new(RefreshService::with_store(engine, Arc::clone(&store)));
        let scheduler = Arc::new(RefreshScheduler::new(
            service,
            SchedulerConfig {
                refresh_interval: Duration::from_millis(10),
                snapshot_interval: Duration::from_secs(3600),
                enabled: true,
            },
        ));

        let (tx, rx) = watch::channel(false);
        let task = tokio::spawn(Arc::clone(&scheduler).start(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_disabled_scheduler_returns_immediately() {
        let engine = Arc::new(DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::new(),
            BlockOrAllowList::new(),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::new(RefreshService::new(engine)),
            SchedulerConfig {
                enabled: false,
                ..Default::default()
            },
        ));
        let (_tx, rx) = watch::channel(false);
        scheduler.start(rx).await;
    }
}
