// Daemon assembly: storage, engine, background services.

use log::{info, warn};
use policy_core::{BlockOrAllowList, DecisionEngine, ProfileManager};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::admin::{admin_channel, AdminHandle, AdminService};
use crate::config::DaemonConfig;
use crate::error::DaemonResult;
use crate::notifier::BroadcastNotifier;
use crate::refresh::{RefreshScheduler, RefreshService};
use crate::snapshot::SnapshotStore;

/// Everything the daemon owns, wired together
pub struct Firewalld {
    config: DaemonConfig,
    engine: Arc<DecisionEngine>,
    refresh: Arc<RefreshService>,
    notifier: Arc<BroadcastNotifier>,
    shutdown: Arc<watch::Sender<bool>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Firewalld {
    /// Opens the snapshot store named in `config` and restores from it
    pub fn new(config: DaemonConfig) -> DaemonResult<Self> {
        let store = SnapshotStore::open(&config.storage)?;
        Self::with_store(config, store)
    }

    pub fn with_store(config: DaemonConfig, store: SnapshotStore) -> DaemonResult<Self> {
        let snapshots = store.load()?;
        info!("Loaded {} profile snapshots", snapshots.len());
        let profiles = ProfileManager::from_snapshots(snapshots, config.retention());

        let block_list = open_list(config.block_list_path.as_ref());
        for extra in &config.extra_block_lists {
            if let Err(e) = block_list.add_from_file(extra) {
                warn!("Skipping extra block list: {}", e);
            }
        }
        let allow_list = open_list(config.allow_list_path.as_ref());

        let engine = Arc::new(DecisionEngine::new(profiles, block_list, allow_list));
        let notifier = Arc::new(BroadcastNotifier::new(config.resolution_channel_size));
        engine.add_notifier(notifier.clone());

        let refresh = Arc::new(RefreshService::with_store(
            Arc::clone(&engine),
            Arc::new(store),
        ));
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            engine,
            refresh,
            notifier,
            shutdown: Arc::new(shutdown),
            tasks: Vec::new(),
        })
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn notifier(&self) -> &Arc<BroadcastNotifier> {
        &self.notifier
    }

    /// Receiver that flips to true when the daemon should stop
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Spawns the scheduler and the admin service on the current runtime
    pub fn spawn(&mut self) -> AdminHandle {
        let scheduler = Arc::new(RefreshScheduler::new(
            Arc::clone(&self.refresh),
            self.config.scheduler.clone(),
        ));
        self.tasks
            .push(tokio::spawn(scheduler.start(self.shutdown.subscribe())));

        let (handle, commands) = admin_channel(self.config.admin_channel_size);
        let service = AdminService::new(Arc::clone(&self.refresh), Arc::clone(&self.shutdown));
        self.tasks.push(tokio::spawn(service.run(commands)));
        handle
    }

    /// Signals shutdown, waits for background tasks and writes a last snapshot
    pub async fn stop(mut self) {
        self.shutdown.send_replace(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }
        self.refresh.persist_or_log();
        info!("Daemon stopped");
    }
}

fn open_list(path: Option<&PathBuf>) -> BlockOrAllowList {
    match path {
        Some(path) => BlockOrAllowList::open(path),
        None => BlockOrAllowList::new(),
    }
}
