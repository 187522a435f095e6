// Single entry point for verdicts.
//
// Precedence, evaluated top to bottom against one captured profile:
//   1. block list (when blockMode)            -> Blocked
//   2. active profile rule lookup             -> rule action
//   3. allow list (when allowMode)            -> Allowed
//   4. platform binary (allowPlatformBinaries) -> Allowed, Default rule recorded
//   5. silent default action                  -> default action, no rule
//   6. otherwise                              -> Pending, answered with Block
//
// The engine never waits on an operator. A pending flow is answered with the
// fail-closed verdict right away; the operator's decision arrives later through
// `resolve_pending`, which installs a rule and hands the outcome to every
// registered `ResolutionNotifier`.

use log::{debug, info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::block_allow_list::BlockOrAllowList;
use crate::error::{PolicyError, PolicyResult};
use crate::flow::{Flow, SubjectKey};
use crate::pending::{Enqueued, PendingConnection, PendingConnectionQueue};
use crate::preferences::{Preferences, PreferencesUpdate};
use crate::profile::{Profile, ProfileManager};
use crate::rule::{Rule, RuleAction, RuleId, RuleSource};
use crate::rule_store::{FileSystemResolver, ImportReport, SubjectResolver};
use crate::telemetry_log::{ConnectionEvent, EventSource, TelemetryLog, Verdict};

/// Verdict handed to the hook while an operator decision is outstanding
pub const FAIL_SAFE_VERDICT: Verdict = Verdict::Block;

// ============================================================================
// Evaluation results
// ============================================================================

/// Terminal state of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Blocked,
    Allowed,
    Pending,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Evaluation {
    pub outcome: Outcome,
    /// What the hook must enforce now
    pub verdict: Verdict,
    pub source: EventSource,
}

impl Evaluation {
    fn decided(verdict: Verdict, source: EventSource) -> Self {
        let outcome = match verdict {
            Verdict::Allow => Outcome::Allowed,
            Verdict::Block => Outcome::Blocked,
        };
        Self {
            outcome,
            verdict,
            source,
        }
    }

    fn pending(id: Uuid) -> Self {
        Self {
            outcome: Outcome::Pending,
            verdict: FAIL_SAFE_VERDICT,
            source: EventSource::Pending(id),
        }
    }

    pub fn pending_id(&self) -> Option<Uuid> {
        match self.source {
            EventSource::Pending(id) => Some(id),
            _ => None,
        }
    }
}

impl From<RuleAction> for Verdict {
    fn from(action: RuleAction) -> Self {
        match action {
            RuleAction::Allow => Verdict::Allow,
            RuleAction::Block => Verdict::Block,
        }
    }
}

/// Operator decision on a pending connection, delivered out of band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub pending_id: Uuid,
    pub flow: Flow,
    pub action: RuleAction,
    pub rule_id: RuleId,
}

/// Receives resolutions once they are committed
pub trait ResolutionNotifier: Send + Sync {
    fn notify(&self, resolution: &Resolution);
}

// ============================================================================
// Engine
// ============================================================================

pub struct DecisionEngine {
    profiles: ProfileManager,
    block_list: BlockOrAllowList,
    allow_list: BlockOrAllowList,
    pending: PendingConnectionQueue,
    telemetry: TelemetryLog,
    notifiers: RwLock<Vec<Arc<dyn ResolutionNotifier>>>,
    resolver: Arc<dyn SubjectResolver>,
}

impl DecisionEngine {
    pub fn new(
        profiles: ProfileManager,
        block_list: BlockOrAllowList,
        allow_list: BlockOrAllowList,
    ) -> Self {
        let telemetry = TelemetryLog::new(profiles.active().preferences().telemetry_capacity);
        Self {
            profiles,
            block_list,
            allow_list,
            pending: PendingConnectionQueue::new(),
            telemetry,
            notifiers: RwLock::new(Vec::new()),
            resolver: Arc::new(FileSystemResolver),
        }
    }

    /// Replaces the resolver used by `cleanup_rules`
    pub fn with_resolver(mut self, resolver: Arc<dyn SubjectResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn add_notifier(&self, notifier: Arc<dyn ResolutionNotifier>) {
        self.notifiers.write().push(notifier);
    }

    pub fn profiles(&self) -> &ProfileManager {
        &self.profiles
    }

    pub fn block_list(&self) -> &BlockOrAllowList {
        &self.block_list
    }

    pub fn allow_list(&self) -> &BlockOrAllowList {
        &self.allow_list
    }

    pub fn pending(&self) -> &PendingConnectionQueue {
        &self.pending
    }

    pub fn telemetry(&self) -> &TelemetryLog {
        &self.telemetry
    }

    /// Classifies one flow and records the verdict in telemetry
    pub fn evaluate(&self, flow: &Flow) -> Evaluation {
        let evaluation = self.classify(flow);
        self.telemetry
            .append(flow, evaluation.verdict, evaluation.source);
        debug!(
            "{} -> {}/{}: {} ({})",
            flow.subject, flow.remote, flow.protocol, evaluation.verdict, evaluation.source
        );
        evaluation
    }

    fn classify(&self, flow: &Flow) -> Evaluation {
        // One profile for the whole evaluation, even if a switch lands mid-way
        let profile = self.profiles.active();
        let prefs = profile.preferences();

        if flow.fingerprint().is_none() {
            warn!(
                "Malformed flow from '{}' to {}, applying fail-safe verdict",
                flow.subject, flow.remote
            );
            return Evaluation::decided(FAIL_SAFE_VERDICT, EventSource::Default);
        }

        if prefs.block_mode && self.block_list.is_match(flow) {
            return Evaluation::decided(Verdict::Block, EventSource::BlockList);
        }

        if let Some(rule) = profile
            .rules()
            .lookup(&flow.subject, &flow.remote, flow.protocol)
        {
            return Evaluation::decided(rule.action.into(), EventSource::Rule(rule.id));
        }

        if prefs.allow_mode && self.allow_list.is_match(flow) {
            return Evaluation::decided(Verdict::Allow, EventSource::AllowList);
        }

        if prefs.allow_platform_binaries && flow.platform_binary {
            let rule = profile
                .rules()
                .add(Rule::for_flow(flow, RuleAction::Allow, RuleSource::Default));
            info!(
                "Allowed platform binary '{}' to {} (rule {})",
                flow.subject, flow.remote, rule.id
            );
            return Evaluation::decided(Verdict::Allow, EventSource::Rule(rule.id));
        }

        if let Some(action) = prefs.default_action.as_rule_action() {
            return Evaluation::decided(action.into(), EventSource::Default);
        }

        match self.pending.enqueue_if_absent(flow, profile.rules()) {
            Ok(Enqueued::Queued { id, .. }) => Evaluation::pending(id),
            // Resolved while this evaluation was in flight
            Ok(Enqueued::Settled(rule)) => {
                Evaluation::decided(rule.action.into(), EventSource::Rule(rule.id))
            }
            Err(e) => {
                warn!("Cannot queue flow from '{}': {}", flow.subject, e);
                Evaluation::decided(FAIL_SAFE_VERDICT, EventSource::Default)
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pending connections
    // ------------------------------------------------------------------------

    /// Applies an operator decision: the entry is removed, a rule is added to
    /// the active profile, the resolution is logged and every notifier is told.
    pub fn resolve_pending(&self, id: &Uuid, action: RuleAction) -> PolicyResult<Arc<Rule>> {
        let profile = self.profiles.active();
        let (entry, rule) = self.pending.resolve(id, action, profile.rules())?;

        self.telemetry
            .append(&entry.flow, action.into(), EventSource::Rule(rule.id));

        let resolution = Resolution {
            pending_id: entry.id,
            flow: entry.flow,
            action,
            rule_id: rule.id,
        };
        for notifier in self.notifiers.read().iter() {
            notifier.notify(&resolution);
        }
        Ok(rule)
    }

    /// Drops a pending entry. The flow stays under its fail-safe verdict.
    pub fn delete_pending(&self, id: &Uuid) -> bool {
        self.pending.delete(id)
    }

    pub fn pending_connections(&self) -> Vec<PendingConnection> {
        self.pending.list()
    }

    pub fn connection_events(&self) -> Vec<ConnectionEvent> {
        self.telemetry.recent()
    }

    // ------------------------------------------------------------------------
    // Rules of the active profile
    // ------------------------------------------------------------------------

    pub fn rules(&self) -> Vec<Rule> {
        self.profiles.active().rules().all()
    }

    pub fn add_rule(&self, rule: Rule) -> Arc<Rule> {
        self.profiles.active().rules().add(rule)
    }

    /// Enables or disables a rule, provided it belongs to `subject`
    pub fn toggle_rule(&self, subject: &SubjectKey, id: &RuleId, enabled: bool) -> PolicyResult<()> {
        let profile = self.profiles.active();
        Self::owned_by(&profile, subject, id)?;
        profile.rules().toggle(id, enabled)
    }

    /// Deletes a rule, provided it belongs to `subject`
    pub fn delete_rule(&self, subject: &SubjectKey, id: &RuleId) -> PolicyResult<Arc<Rule>> {
        let profile = self.profiles.active();
        Self::owned_by(&profile, subject, id)?;
        profile.rules().delete(id)
    }

    fn owned_by(profile: &Profile, subject: &SubjectKey, id: &RuleId) -> PolicyResult<()> {
        match profile.rules().get(id) {
            Some(rule) if &rule.subject == subject => Ok(()),
            _ => Err(PolicyError::NotFound(format!("rule {} of '{}'", id, subject))),
        }
    }

    pub fn export_rules(&self) -> PolicyResult<Vec<u8>> {
        self.profiles.active().rules().export_all()
    }

    pub fn import_rules(&self, blob: &[u8], user_only: bool) -> PolicyResult<ImportReport> {
        self.profiles.active().rules().import_bulk(blob, user_only)
    }

    pub fn cleanup_rules(&self, aggressive: bool) -> usize {
        self.profiles
            .active()
            .rules()
            .cleanup(aggressive, self.resolver.as_ref())
    }

    // ------------------------------------------------------------------------
    // Preferences and profiles
    // ------------------------------------------------------------------------

    pub fn preferences(&self) -> Preferences {
        (*self.profiles.active().preferences()).clone()
    }

    /// Merges into the active profile and returns the effective preferences
    pub fn update_preferences(&self, update: &PreferencesUpdate) -> Preferences {
        let effective = self.profiles.active().update_preferences(update);
        self.telemetry.set_capacity(effective.telemetry_capacity);
        effective
    }

    /// Switches profiles. Pending entries are left in place.
    pub fn set_active_profile(&self, name: &str) -> PolicyResult<()> {
        let profile = self.profiles.set_active(name)?;
        self.telemetry
            .set_capacity(profile.preferences().telemetry_capacity);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Lists
    // ------------------------------------------------------------------------

    /// Reloads whichever list file changed since its last load. Returns the
    /// number of lists reloaded.
    pub fn refresh_lists(&self) -> usize {
        [&self.block_list, &self.allow_list]
            .into_iter()
            .filter(|list| list.reload_if_stale())
            .count()
    }
}

impl std::fmt::Debug for DecisionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecisionEngine")
            .field("active_profile", &self.profiles.active().name())
            .field("block_list", &self.block_list.len())
            .field("allow_list", &self.allow_list.len())
            .field("pending", &self.pending.len())
            .field("telemetry", &self.telemetry.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::{Endpoint, Protocol};
    use crate::preferences::DefaultAction;
    use crate::rule::AddressMatch;
    use parking_lot::Mutex;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn example_flow() -> Flow {
        Flow::new(
            "com.example.app",
            Endpoint::from_ip("93.184.216.34".parse().unwrap(), 443),
            Protocol::Tcp,
        )
    }

    fn list_file(lines: &[&str]) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        for line in lines {
            writeln!(file, "{}", line).unwrap();
        }
        file.flush().unwrap();
        file
    }

    fn engine() -> DecisionEngine {
        DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::new(),
            BlockOrAllowList::new(),
        )
    }

    fn engine_with_lists(block: &NamedTempFile, allow: &NamedTempFile) -> DecisionEngine {
        let engine = DecisionEngine::new(
            ProfileManager::new(),
            BlockOrAllowList::open(block.path()),
            BlockOrAllowList::open(allow.path()),
        );
        engine.update_preferences(&PreferencesUpdate {
            block_mode: Some(true),
            allow_mode: Some(true),
            ..Default::default()
        });
        engine
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<Resolution>>);

    impl ResolutionNotifier for Recorder {
        fn notify(&self, resolution: &Resolution) {
            self.0.lock().push(resolution.clone());
        }
    }

    #[test]
    fn unmatched_flow_goes_pending_then_resolves() {
        let engine = engine();
        let recorder = Arc::new(Recorder::default());
        engine.add_notifier(recorder.clone());

        let first = engine.evaluate(&example_flow());
        assert_eq!(first.outcome, Outcome::Pending);
        assert_eq!(first.verdict, Verdict::Block);
        assert_eq!(engine.pending_connections().len(), 1);

        let id = first.pending_id().unwrap();
        let rule = engine.resolve_pending(&id, RuleAction::Allow).unwrap();
        assert_eq!(rule.source, RuleSource::Prompt);

        let second = engine.evaluate(&example_flow());
        assert_eq!(second.outcome, Outcome::Allowed);
        assert_eq!(second.source, EventSource::Rule(rule.id));
        assert!(engine.pending_connections().is_empty());

        let delivered = recorder.0.lock();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].pending_id, id);
        assert_eq!(delivered[0].rule_id, rule.id);
    }

    #[test]
    fn second_resolve_creates_nothing() {
        let engine = engine();
        let id = engine.evaluate(&example_flow()).pending_id().unwrap();

        assert!(engine.resolve_pending(&id, RuleAction::Block).is_ok());
        assert!(matches!(
            engine.resolve_pending(&id, RuleAction::Block),
            Err(PolicyError::NotFound(_))
        ));
        assert_eq!(engine.rules().len(), 1);
    }

    #[test]
    fn repeated_flow_reuses_pending_entry() {
        let engine = engine();
        let a = engine.evaluate(&example_flow());
        let b = engine.evaluate(&example_flow());
        assert_eq!(a.pending_id(), b.pending_id());
        assert_eq!(engine.pending().len(), 1);
    }

    #[test]
    fn block_list_wins_over_allow_list() {
        let block = list_file(&["93.184.216.0/24"]);
        let allow = list_file(&["93.184.216.34"]);
        let engine = engine_with_lists(&block, &allow);

        let eval = engine.evaluate(&example_flow());
        assert_eq!(eval.outcome, Outcome::Blocked);
        assert_eq!(eval.source, EventSource::BlockList);
    }

    #[test]
    fn rule_beats_allow_list_but_not_block_list() {
        let block = list_file(&["# nothing"]);
        let allow = list_file(&["93.184.216.34"]);
        let engine = engine_with_lists(&block, &allow);
        let rule = engine.add_rule(
            Rule::builder("com.example.app", RuleAction::Block)
                .address(AddressMatch::parse("93.184.216.34").unwrap())
                .build(),
        );

        let eval = engine.evaluate(&example_flow());
        assert_eq!(eval.outcome, Outcome::Blocked);
        assert_eq!(eval.source, EventSource::Rule(rule.id));
    }

    #[test]
    fn lists_are_ignored_when_modes_are_off() {
        let block = list_file(&["93.184.216.34"]);
        let allow = list_file(&["93.184.216.34"]);
        let engine = engine_with_lists(&block, &allow);
        engine.update_preferences(&PreferencesUpdate {
            block_mode: Some(false),
            allow_mode: Some(false),
            ..Default::default()
        });

        assert_eq!(engine.evaluate(&example_flow()).outcome, Outcome::Pending);
    }

    #[test]
    fn silent_mode_applies_default_without_rule() {
        let engine = engine();
        engine.update_preferences(&PreferencesUpdate {
            default_action: Some(DefaultAction::Allow),
            ..Default::default()
        });

        let eval = engine.evaluate(&example_flow());
        assert_eq!(eval.outcome, Outcome::Allowed);
        assert_eq!(eval.source, EventSource::Default);
        assert!(engine.rules().is_empty());
        assert!(engine.pending().is_empty());
    }

    #[test]
    fn platform_binaries_are_allowed_and_remembered() {
        let engine = engine();
        let flow = example_flow().platform();

        let first = engine.evaluate(&flow);
        assert_eq!(first.outcome, Outcome::Allowed);
        let rules = engine.rules();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].source, RuleSource::Default);

        let second = engine.evaluate(&flow);
        assert_eq!(second.source, EventSource::Rule(rules[0].id));
        assert_eq!(engine.rules().len(), 1);
    }

    #[test]
    fn malformed_flow_gets_fail_safe_verdict() {
        let engine = engine();
        let flow = Flow::new(
            "",
            Endpoint::from_ip("93.184.216.34".parse().unwrap(), 443),
            Protocol::Tcp,
        );
        let eval = engine.evaluate(&flow);
        assert_eq!(eval.verdict, FAIL_SAFE_VERDICT);
        assert_eq!(eval.source, EventSource::Default);
        assert!(engine.pending().is_empty());
    }

    #[test]
    fn every_verdict_is_logged() {
        let engine = engine();
        let id = engine.evaluate(&example_flow()).pending_id().unwrap();
        let rule = engine.resolve_pending(&id, RuleAction::Allow).unwrap();
        engine.evaluate(&example_flow());

        let events = engine.connection_events();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].source, EventSource::Rule(rule.id));
        assert_eq!(events[1].source, EventSource::Rule(rule.id));
        assert_eq!(events[1].verdict, Verdict::Allow);
        assert_eq!(events[2].source, EventSource::Pending(id));
        assert_eq!(events[2].verdict, Verdict::Block);
    }

    #[test]
    fn profile_switch_isolates_rules() {
        let engine = engine();
        engine
            .profiles()
            .create("travel", Preferences::default())
            .unwrap();
        engine.add_rule(Rule::builder("com.example.app", RuleAction::Allow).build());

        engine.set_active_profile("travel").unwrap();
        assert!(engine.rules().is_empty());
        assert_eq!(engine.evaluate(&example_flow()).outcome, Outcome::Pending);
    }

    #[test]
    fn pending_entries_survive_profile_switch() {
        let engine = engine();
        engine
            .profiles()
            .create("travel", Preferences::default())
            .unwrap();
        let id = engine.evaluate(&example_flow()).pending_id().unwrap();

        engine.set_active_profile("travel").unwrap();
        assert_eq!(engine.pending_connections()[0].id, id);

        engine.resolve_pending(&id, RuleAction::Allow).unwrap();
        assert_eq!(engine.rules().len(), 1);
        assert!(engine
            .profiles()
            .get(crate::profile::DEFAULT_PROFILE)
            .unwrap()
            .rules()
            .is_empty());
    }

    #[test]
    fn toggle_and_delete_require_matching_subject() {
        let engine = engine();
        let rule = engine.add_rule(Rule::builder("com.example.app", RuleAction::Allow).build());
        let other = SubjectKey::new("com.other.app");

        assert!(engine.toggle_rule(&other, &rule.id, false).is_err());
        assert!(engine.delete_rule(&other, &rule.id).is_err());

        engine.toggle_rule(&rule.subject, &rule.id, false).unwrap();
        assert!(!engine.rules()[0].enabled);
        assert_eq!(engine.evaluate(&example_flow()).outcome, Outcome::Pending);

        engine.delete_rule(&rule.subject, &rule.id).unwrap();
        assert!(engine.rules().is_empty());
    }

    #[test]
    fn deleted_pending_entry_creates_no_rule() {
        let engine = engine();
        let id = engine.evaluate(&example_flow()).pending_id().unwrap();
        assert!(engine.delete_pending(&id));
        assert!(!engine.delete_pending(&id));
        assert!(engine.rules().is_empty());
    }

    #[test]
    fn telemetry_capacity_follows_preferences() {
        let engine = engine();
        engine.update_preferences(&PreferencesUpdate {
            telemetry_capacity: Some(2),
            ..Default::default()
        });
        for port in 1..=5 {
            engine.evaluate(&Flow::new(
                "com.example.app",
                Endpoint::from_ip("93.184.216.34".parse().unwrap(), port),
                Protocol::Udp,
            ));
        }
        assert_eq!(engine.connection_events().len(), 2);
    }

    #[test]
    fn refresh_picks_up_changed_list() {
        let block = list_file(&["198.51.100.1"]);
        let allow = list_file(&[]);
        let engine = engine_with_lists(&block, &allow);
        assert_eq!(engine.refresh_lists(), 0);

        std::fs::write(block.path(), "93.184.216.34\n").unwrap();
        let later = std::time::SystemTime::now() + std::time::Duration::from_secs(5);
        std::fs::File::options()
            .write(true)
            .open(block.path())
            .unwrap()
            .set_modified(later)
            .unwrap();

        assert_eq!(engine.refresh_lists(), 1);
        assert_eq!(engine.evaluate(&example_flow()).outcome, Outcome::Blocked);
    }

    #[test]
    fn concurrent_evaluations_share_one_pending_entry() {
        let engine = Arc::new(engine());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || engine.evaluate(&example_flow()).pending_id())
            })
            .collect();
        let ids: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ids.iter().all(|id| id.is_some() && *id == ids[0]));
        assert_eq!(engine.pending().len(), 1);
    }

    #[test]
    fn evaluation_racing_resolve_never_requeues() {
        for _ in 0..500 {
            let engine = Arc::new(engine());
            let id = engine.evaluate(&example_flow()).pending_id().unwrap();

            let racer = {
                let engine = Arc::clone(&engine);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        engine.evaluate(&example_flow());
                    }
                })
            };
            engine.resolve_pending(&id, RuleAction::Allow).unwrap();
            racer.join().unwrap();

            assert!(engine.pending_connections().is_empty());
            assert_eq!(engine.rules().len(), 1);
            assert_eq!(engine.evaluate(&example_flow()).outcome, Outcome::Allowed);
        }
    }
}
