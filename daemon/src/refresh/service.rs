//! On-demand upkeep service.
//!
//! Reloads the block and allow lists when their files changed and writes
//! profile snapshots to storage. Used by the scheduler on every tick and by
//! the admin surface after profile mutations.

use log::{debug, error};
use policy_core::DecisionEngine;
use std::sync::Arc;
use std::time::Instant;

use crate::error::DaemonResult;
use crate::now_ms;
use crate::snapshot::SnapshotStore;

/// Statistics from a list refresh.
#[derive(Debug, Clone)]
pub struct RefreshStats {
    /// Number of list files reloaded
    pub lists_reloaded: usize,
    /// Entries held by both lists after the refresh
    pub entries: usize,
    /// Duration of refresh operation in milliseconds
    pub duration_ms: u64,
    /// Timestamp of refresh
    pub timestamp: u64,
}

pub struct RefreshService {
    engine: Arc<DecisionEngine>,
    store: Option<Arc<SnapshotStore>>,
}

impl RefreshService {
    /// Service without persistence; snapshots are no-ops.
    pub fn new(engine: Arc<DecisionEngine>) -> Self {
        Self {
            engine,
            store: None,
        }
    }

    pub fn with_store(engine: Arc<DecisionEngine>, store: Arc<SnapshotStore>) -> Self {
        Self {
            engine,
            store: Some(store),
        }
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    /// Reloads whichever list file changed since its last load.
    pub fn refresh_lists(&self) -> RefreshStats {
        let started = Instant::now();
        let lists_reloaded = self.engine.refresh_lists();
        let entries = self.engine.block_list().len() + self.engine.allow_list().len();

        RefreshStats {
            lists_reloaded,
            entries,
            // Monotonic, unaffected by wall clock steps
            duration_ms: started.elapsed().as_millis() as u64,
            timestamp: now_ms(),
        }
    }

    /// Writes every profile to storage. Returns the number of profiles saved,
    /// 0 without a store or after a purge.
    pub fn persist_snapshot(&self) -> DaemonResult<usize> {
        match &self.store {
            Some(store) => store.save(&self.engine.profiles().snapshot()),
            None => Ok(0),
        }
    }

    /// Like `persist_snapshot`, but only logs failures
    pub fn persist_or_log(&self) {
        match self.persist_snapshot() {
            Ok(n) => debug!("Persisted {} profiles", n),
            Err(e) => error!("Failed to persist profiles: {}", e),
        }
    }

    /// Deletes every stored snapshot and stops further snapshots
    pub fn purge(&self) -> DaemonResult<usize> {
        match &self.store {
            Some(store) => store.purge(),
            None => Ok(0),
        }
    }
}
