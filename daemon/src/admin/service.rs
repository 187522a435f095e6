// Administrative service.
//
// Requests arrive on an mpsc channel together with a oneshot sender for the
// reply. The service handles them one at a time against the shared engine;
// the engine's own locks keep evaluations running in parallel with it.
//
// Outcomes are reply values. Errors from the core are logged and folded into
// `Success(false)`, a zero count or `Done`, never returned to the caller.

use log::{debug, info, warn};
use policy_core::{DecisionEngine, PolicyError};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};

use crate::admin::protocol::{AdminReply, AdminRequest};
use crate::error::{DaemonError, DaemonResult};
use crate::refresh::RefreshService;

/// One request plus the path its reply travels back on
#[derive(Debug)]
pub struct AdminCommand {
    pub request: AdminRequest,
    pub reply: oneshot::Sender<AdminReply>,
}

pub struct AdminService {
    engine: Arc<DecisionEngine>,
    refresh: Arc<RefreshService>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl AdminService {
    pub fn new(refresh: Arc<RefreshService>, shutdown: Arc<watch::Sender<bool>>) -> Self {
        Self {
            engine: Arc::clone(refresh.engine()),
            refresh,
            shutdown,
        }
    }

    /// Serves commands until every `AdminHandle` is dropped or shutdown is
    /// signalled.
    pub async fn run(self, mut commands: mpsc::Receiver<AdminCommand>) {
        let mut shutdown = self.shutdown.subscribe();
        info!("Admin service started");
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(AdminCommand { request, reply }) = command else {
                        break;
                    };
                    let op = request.op();
                    if reply.send(self.handle(request)).is_err() {
                        debug!("Caller of {} went away before the reply", op);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Admin service stopped");
    }

    /// Applies one request and produces its reply
    pub fn handle(&self, request: AdminRequest) -> AdminReply {
        debug!("Admin request: {}", request.op());
        let engine = &self.engine;
        match request {
            AdminRequest::GetPreferences => AdminReply::Preferences(engine.preferences()),
            AdminRequest::UpdatePreferences { preferences } => {
                let effective = engine.update_preferences(&preferences);
                self.refresh.persist_or_log();
                AdminReply::Preferences(effective)
            }
            AdminRequest::GetRules => AdminReply::Rules(engine.rules()),
            AdminRequest::GetConnectionEvents => {
                AdminReply::ConnectionEvents(engine.connection_events())
            }
            AdminRequest::GetPendingConnections => {
                AdminReply::PendingConnections(engine.pending_connections())
            }
            AdminRequest::ResolvePendingConnection { id, action } => {
                let resolved = engine.resolve_pending(&id, action);
                AdminReply::Success(report("resolvePendingConnection", resolved))
            }
            AdminRequest::DeletePendingConnection { id } => {
                AdminReply::Success(engine.delete_pending(&id))
            }
            AdminRequest::AddRule { rule } => {
                let rule = engine.add_rule(rule.into_rule());
                info!("Added rule {} for '{}'", rule.id, rule.subject);
                AdminReply::Done
            }
            AdminRequest::ToggleRule { subject, id, enabled } => {
                report("toggleRule", engine.toggle_rule(&subject, &id, enabled));
                AdminReply::Done
            }
            AdminRequest::DeleteRule { subject, id } => {
                report("deleteRule", engine.delete_rule(&subject, &id));
                AdminReply::Done
            }
            AdminRequest::ExportRules => match engine.export_rules() {
                Ok(blob) => AdminReply::Blob(String::from_utf8_lossy(&blob).into_owned()),
                Err(e) => {
                    warn!("exportRules failed: {}", e);
                    AdminReply::Blob(String::new())
                }
            },
            AdminRequest::ImportRules { blob, user_only } => {
                match engine.import_rules(blob.as_bytes(), user_only) {
                    Ok(_) => {
                        self.refresh.persist_or_log();
                        AdminReply::Success(true)
                    }
                    Err(e) => {
                        warn!("importRules rejected: {}", e);
                        AdminReply::Success(false)
                    }
                }
            }
            AdminRequest::CleanupRules { aggressive } => {
                AdminReply::Count(engine.cleanup_rules(aggressive))
            }
            AdminRequest::GetCurrentProfile => {
                AdminReply::Profile(engine.profiles().active().name().to_string())
            }
            AdminRequest::GetProfiles => AdminReply::Profiles(engine.profiles().list()),
            AdminRequest::AddProfile { name, preferences } => {
                let created = engine
                    .profiles()
                    .create(&name, preferences.unwrap_or_default())
                    .map(|_| ());
                self.profile_mutation("addProfile", created)
            }
            AdminRequest::DeleteProfile { name } => {
                let deleted = engine.profiles().delete(&name);
                self.profile_mutation("deleteProfile", deleted)
            }
            AdminRequest::SetProfile { name } => {
                let switched = engine.set_active_profile(&name);
                self.profile_mutation("setProfile", switched)
            }
            AdminRequest::Uninstall => AdminReply::Success(self.uninstall()),
        }
    }

    fn profile_mutation(&self, op: &str, result: Result<(), PolicyError>) -> AdminReply {
        let ok = report(op, result);
        if ok {
            self.refresh.persist_or_log();
        }
        AdminReply::Success(ok)
    }

    /// Removes persisted state and asks the daemon to stop
    fn uninstall(&self) -> bool {
        let purged = match self.refresh.purge() {
            Ok(n) => {
                info!("Uninstall: removed {} stored profiles", n);
                true
            }
            Err(e) => {
                warn!("Uninstall: purge failed: {}", e);
                false
            }
        };
        self.engine.pending().clear();
        self.shutdown.send_replace(true);
        purged
    }
}

fn report<T>(op: &str, result: Result<T, PolicyError>) -> bool {
    match result {
        Ok(_) => true,
        Err(e) => {
            debug!("{}: {}", op, e);
            false
        }
    }
}

// ================================================================================================
// CLIENT HANDLE
// ================================================================================================

/// Creates the request channel: a cloneable client handle and the receiver
/// the service runs on
pub fn admin_channel(size: usize) -> (AdminHandle, mpsc::Receiver<AdminCommand>) {
    let (tx, rx) = mpsc::channel(size);
    (AdminHandle { tx }, rx)
}

/// Typed client for the admin service
#[derive(Debug, Clone)]
pub struct AdminHandle {
    tx: mpsc::Sender<AdminCommand>,
}

macro_rules! expect_reply {
    ($reply:expr, $variant:ident) => {
        match $reply {
            AdminReply::$variant(value) => Ok(value),
            other => Err(DaemonError::UnexpectedReply(other.kind().to_string())),
        }
    };
}

impl AdminHandle {
    /// Sends one request and waits for its reply
    pub async fn call(&self, request: AdminRequest) -> DaemonResult<AdminReply> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(AdminCommand {
                request,
                reply: reply_tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;
        reply_rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    async fn success(&self, request: AdminRequest) -> DaemonResult<bool> {
        expect_reply!(self.call(request).await?, Success)
    }

    async fn done(&self, request: AdminRequest) -> DaemonResult<()> {
        match self.call(request).await? {
            AdminReply::Done => Ok(()),
            other => Err(DaemonError::UnexpectedReply(other.kind().to_string())),
        }
    }

    pub async fn get_preferences(&self) -> DaemonResult<policy_core::Preferences> {
        expect_reply!(self.call(AdminRequest::GetPreferences).await?, Preferences)
    }

    pub async fn update_preferences(
        &self,
        preferences: policy_core::PreferencesUpdate,
    ) -> DaemonResult<policy_core::Preferences> {
        expect_reply!(
            self.call(AdminRequest::UpdatePreferences { preferences }).await?,
            Preferences
        )
    }

    pub async fn get_rules(&self) -> DaemonResult<Vec<policy_core::Rule>> {
        expect_reply!(self.call(AdminRequest::GetRules).await?, Rules)
    }

    pub async fn get_connection_events(&self) -> DaemonResult<Vec<policy_core::ConnectionEvent>> {
        expect_reply!(self.call(AdminRequest::GetConnectionEvents).await?, ConnectionEvents)
    }

    pub async fn get_pending_connections(
        &self,
    ) -> DaemonResult<Vec<policy_core::PendingConnection>> {
        expect_reply!(
            self.call(AdminRequest::GetPendingConnections).await?,
            PendingConnections
        )
    }

    pub async fn resolve_pending_connection(
        &self,
        id: uuid::Uuid,
        action: policy_core::RuleAction,
    ) -> DaemonResult<bool> {
        self.success(AdminRequest::ResolvePendingConnection { id, action })
            .await
    }

    pub async fn delete_pending_connection(&self, id: uuid::Uuid) -> DaemonResult<bool> {
        self.success(AdminRequest::DeletePendingConnection { id }).await
    }

    pub async fn add_rule(&self, rule: crate::admin::protocol::NewRule) -> DaemonResult<()> {
        self.done(AdminRequest::AddRule { rule }).await
    }

    pub async fn toggle_rule(
        &self,
        subject: policy_core::SubjectKey,
        id: policy_core::RuleId,
        enabled: bool,
    ) -> DaemonResult<()> {
        self.done(AdminRequest::ToggleRule { subject, id, enabled })
            .await
    }

    pub async fn delete_rule(
        &self,
        subject: policy_core::SubjectKey,
        id: policy_core::RuleId,
    ) -> DaemonResult<()> {
        self.done(AdminRequest::DeleteRule { subject, id }).await
    }

    pub async fn export_rules(&self) -> DaemonResult<String> {
        expect_reply!(self.call(AdminRequest::ExportRules).await?, Blob)
    }

    pub async fn import_rules(&self, blob: String, user_only: bool) -> DaemonResult<bool> {
        self.success(AdminRequest::ImportRules { blob, user_only })
            .await
    }

    pub async fn cleanup_rules(&self, aggressive: bool) -> DaemonResult<usize> {
        expect_reply!(
            self.call(AdminRequest::CleanupRules { aggressive }).await?,
            Count
        )
    }

    pub async fn get_current_profile(&self) -> DaemonResult<String> {
        expect_reply!(self.call(AdminRequest::GetCurrentProfile).await?, Profile)
    }

    pub async fn get_profiles(&self) -> DaemonResult<Vec<String>> {
        expect_reply!(self.call(AdminRequest::GetProfiles).await?, Profiles)
    }

    pub async fn add_profile(
        &self,
        name: impl Into<String>,
        preferences: Option<policy_core::Preferences>,
    ) -> DaemonResult<bool> {
        self.success(AdminRequest::AddProfile {
            name: name.into(),
            preferences,
        })
        .await
    }

    pub async fn delete_profile(&self, name: impl Into<String>) -> DaemonResult<bool> {
        self.success(AdminRequest::DeleteProfile { name: name.into() })
            .await
    }

    pub async fn set_profile(&self, name: impl Into<String>) -> DaemonResult<bool> {
        self.success(AdminRequest::SetProfile { name: name.into() })
            .await
    }

    pub async fn uninstall(&self) -> DaemonResult<bool> {
        self.success(AdminRequest::Uninstall).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admin::protocol::NewRule;
    use crate::snapshot::SnapshotStore;
    use policy_core::{
        BlockOrAllowList, DefaultAction, Endpoint, Flow, Outcome, Preferences, PreferencesUpdate,
        ProfileManager, Protocol, RuleAction, RulePredicate, DEFAULT_PROFILE,
    };

    struct Fixture {
        engine: Arc<DecisionEngine>,
        store: Arc<SnapshotStore>,
        handle: AdminHandle,
        shutdown: watch::Receiver<bool>,
    }

    fn start() -> Fixture {
        let engine = Arc::new(DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::new(),
            BlockOrAllowList::new(),
        ));
        let store = Arc::new(SnapshotStore::in_memory().unwrap());
        let refresh = Arc::new(RefreshService::with_store(
            Arc::clone(&engine),
            Arc::clone(&store),
        ));
        let (shutdown_tx, shutdown) = watch::channel(false);
        let (handle, rx) = admin_channel(8);
        tokio::spawn(AdminService::new(refresh, Arc::new(shutdown_tx)).run(rx));
        Fixture {
            engine,
            store,
            handle,
            shutdown,
        }
    }

    fn example_flow() -> Flow {
        Flow::new(
            "com.example.app",
            Endpoint::from_ip("93.184.216.34".parse().unwrap(), 443),
            Protocol::Tcp,
        )
    }

    #[tokio::test]
    async fn test_resolve_pending_twice() {
        let fx = start();
        let id = fx.engine.evaluate(&example_flow()).pending_id().unwrap();

        let pending = fx.handle.get_pending_connections().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, id);

        assert!(fx
            .handle
            .resolve_pending_connection(id, RuleAction::Allow)
            .await
            .unwrap());
        assert!(!fx
            .handle
            .resolve_pending_connection(id, RuleAction::Allow)
            .await
            .unwrap());
        assert_eq!(fx.handle.get_rules().await.unwrap().len(), 1);
        assert_eq!(fx.engine.evaluate(&example_flow()).outcome, Outcome::Allowed);
    }

    #[tokio::test]
    async fn test_delete_pending() {
        let fx = start();
        let id = fx.engine.evaluate(&example_flow()).pending_id().unwrap();
        assert!(fx.handle.delete_pending_connection(id).await.unwrap());
        assert!(!fx.handle.delete_pending_connection(id).await.unwrap());
        assert!(fx.handle.get_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rule_crud_is_fire_and_forget() {
        let fx = start();
        fx.handle
            .add_rule(NewRule {
                subject: "com.example.app".into(),
                process_path: None,
                predicate: RulePredicate {
                    port: Some(443),
                    ..Default::default()
                },
                action: RuleAction::Block,
                enabled: true,
            })
            .await
            .unwrap();
        let rule = fx.handle.get_rules().await.unwrap().remove(0);

        // Unknown id and mismatched subject are silent no-ops
        fx.handle
            .toggle_rule("com.example.app".into(), policy_core::RuleId::new(), false)
            .await
            .unwrap();
        fx.handle
            .delete_rule("com.other.app".into(), rule.id)
            .await
            .unwrap();
        assert_eq!(fx.handle.get_rules().await.unwrap().len(), 1);

        fx.handle
            .toggle_rule(rule.subject.clone(), rule.id, false)
            .await
            .unwrap();
        assert!(!fx.handle.get_rules().await.unwrap()[0].enabled);

        fx.handle.delete_rule(rule.subject, rule.id).await.unwrap();
        assert!(fx.handle.get_rules().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_export_import_round_trip() {
        let fx = start();
        fx.engine
            .add_rule(policy_core::Rule::builder("com.example.app", RuleAction::Allow).port(443).build());
        let blob = fx.handle.export_rules().await.unwrap();

        assert!(fx.handle.add_profile("empty", None).await.unwrap());
        assert!(fx.handle.set_profile("empty").await.unwrap());
        assert!(fx.handle.import_rules(blob, false).await.unwrap());

        let rules = fx.handle.get_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].predicate.port, Some(443));

        assert!(!fx.handle.import_rules("garbage".to_string(), false).await.unwrap());
    }

    #[tokio::test]
    async fn test_profiles() {
        let fx = start();
        assert_eq!(fx.handle.get_current_profile().await.unwrap(), DEFAULT_PROFILE);

        let travel = Preferences {
            default_action: DefaultAction::Block,
            ..Default::default()
        };
        assert!(fx.handle.add_profile("travel", Some(travel)).await.unwrap());
        assert!(!fx.handle.add_profile("travel", None).await.unwrap());
        assert!(!fx.handle.set_profile("ghost").await.unwrap());

        fx.engine
            .add_rule(policy_core::Rule::builder("com.example.app", RuleAction::Allow).build());
        assert!(fx.handle.set_profile("travel").await.unwrap());
        assert!(fx.handle.get_rules().await.unwrap().is_empty());
        assert_eq!(
            fx.handle.get_preferences().await.unwrap().default_action,
            DefaultAction::Block
        );
        assert_eq!(fx.engine.evaluate(&example_flow()).outcome, Outcome::Blocked);

        assert!(!fx.handle.delete_profile("travel").await.unwrap());
        assert!(fx.handle.delete_profile(DEFAULT_PROFILE).await.unwrap());
        assert_eq!(fx.handle.get_profiles().await.unwrap(), vec!["travel".to_string()]);

        // Profile mutations are persisted straight away
        assert_eq!(fx.store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_update_preferences_returns_effective() {
        let fx = start();
        let effective = fx
            .handle
            .update_preferences(PreferencesUpdate {
                block_mode: Some(true),
                telemetry_capacity: Some(4),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(effective.block_mode);
        assert!(!effective.allow_mode);
        assert_eq!(fx.engine.telemetry().capacity(), 4);

        // The change is persisted without waiting for the scheduler
        let stored = fx.store.load().unwrap();
        assert_eq!(stored.len(), 1);
        assert!(stored[0].preferences.block_mode);
        assert_eq!(stored[0].preferences.telemetry_capacity, 4);
    }

    #[tokio::test]
    async fn test_connection_events_newest_first() {
        let fx = start();
        fx.engine.evaluate(&example_flow());
        fx.engine.evaluate(&Flow::new(
            "com.example.app",
            Endpoint::from_ip("93.184.216.34".parse().unwrap(), 80),
            Protocol::Tcp,
        ));
        let events = fx.handle.get_connection_events().await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].remote.port, 80);
    }

    #[tokio::test]
    async fn test_cleanup_counts() {
        let fx = start();
        fx.engine.add_rule(
            policy_core::Rule::builder("/nonexistent/bin/tool", RuleAction::Allow).build(),
        );
        fx.engine
            .add_rule(policy_core::Rule::builder("com.example.app", RuleAction::Allow).build());
        assert_eq!(fx.handle.cleanup_rules(false).await.unwrap(), 1);
        assert_eq!(fx.handle.get_rules().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_uninstall_purges_and_signals_shutdown() {
        let mut fx = start();
        assert!(fx.handle.add_profile("work", None).await.unwrap());
        assert_eq!(fx.store.count().unwrap(), 2);

        assert!(fx.handle.uninstall().await.unwrap());
        assert_eq!(fx.store.count().unwrap(), 0);
        fx.shutdown.changed().await.unwrap();
        assert!(*fx.shutdown.borrow());

        // The service loop exits after shutdown
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(matches!(
            fx.handle.get_profiles().await,
            Err(DaemonError::ChannelClosed)
        ));
    }
}
