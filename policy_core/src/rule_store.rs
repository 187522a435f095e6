// In-memory per-application rule storage.
//
// Design:
// - RuleIndexes is immutable once published; readers clone the Arc and
//   evaluate without holding any lock.
// - Writers hold the write lock for the whole clone-modify-swap, so two
//   concurrent mutations cannot lose each other's changes and a reader sees
//   either all or none of a mutation.
// - Lookups go through the subject index; a flow only ever scans the rules of
//   its own application.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::{PolicyError, PolicyResult};
use crate::flow::{Endpoint, Protocol, SubjectKey};
use crate::rule::{Rule, RuleId};
use crate::rule_blob::{self, DecodedRules};

/// Disabled rules untouched for this long are removed by an aggressive cleanup
pub const DEFAULT_STALE_RETENTION_DAYS: i64 = 30;

/// Decides whether a rule's application is still present on the host
pub trait SubjectResolver: Send + Sync {
    fn is_installed(&self, rule: &Rule) -> bool;
}

/// Resolves subjects through the filesystem: a rule whose recorded executable
/// path (or path-shaped subject key) no longer exists is stale. Rules keyed by
/// signing identifier with no recorded path are always considered installed.
#[derive(Debug, Default, Clone, Copy)]
pub struct FileSystemResolver;

impl SubjectResolver for FileSystemResolver {
    fn is_installed(&self, rule: &Rule) -> bool {
        let path = match (&rule.process_path, rule.subject.is_path()) {
            (Some(path), _) => path.as_str(),
            (None, true) => rule.subject.as_str(),
            (None, false) => return true,
        };
        Path::new(path).exists()
    }
}

#[derive(Debug, Clone, Default)]
struct RuleIndexes {
    /// Primary index: rule id -> rule
    by_id: HashMap<RuleId, Arc<Rule>>,
    /// Secondary index: subject -> rules of that subject
    by_subject: HashMap<SubjectKey, Vec<Arc<Rule>>>,
}

impl RuleIndexes {
    fn insert(&mut self, rule: Arc<Rule>) -> Option<Arc<Rule>> {
        let previous = self.remove(&rule.id);
        self.by_subject
            .entry(rule.subject.clone())
            .or_default()
            .push(Arc::clone(&rule));
        self.by_id.insert(rule.id, rule);
        previous
    }

    fn remove(&mut self, id: &RuleId) -> Option<Arc<Rule>> {
        let rule = self.by_id.remove(id)?;
        if let Some(rules) = self.by_subject.get_mut(&rule.subject) {
            rules.retain(|r| r.id != *id);
            if rules.is_empty() {
                self.by_subject.remove(&rule.subject);
            }
        }
        Some(rule)
    }

    fn lookup(&self, subject: &SubjectKey, remote: &Endpoint, protocol: Protocol) -> Option<Arc<Rule>> {
        self.by_subject
            .get(subject)?
            .iter()
            .filter(|r| r.matches(subject, remote, protocol))
            .max_by(|a, b| {
                a.predicate
                    .specificity()
                    .cmp(&b.predicate.specificity())
                    .then_with(|| a.created_at.cmp(&b.created_at))
            })
            .cloned()
    }
}

/// Result of a bulk import
#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: usize,
    /// Entries that could not be decoded or were filtered by `user_only`
    pub skipped: usize,
    pub version_mismatch: Option<PolicyError>,
}

/// Per-application rule table
pub struct RuleStore {
    indexes: RwLock<Arc<RuleIndexes>>,
    retention: Duration,
}

impl RuleStore {
    pub fn new() -> Self {
        Self::with_retention(Duration::days(DEFAULT_STALE_RETENTION_DAYS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        Self {
            indexes: RwLock::new(Arc::new(RuleIndexes::default())),
            retention,
        }
    }

    /// Store pre-populated with `rules`; later ids overwrite earlier ones
    pub fn from_rules(rules: impl IntoIterator<Item = Rule>, retention: Duration) -> Self {
        let mut indexes = RuleIndexes::default();
        for rule in rules {
            indexes.insert(Arc::new(rule));
        }
        Self {
            indexes: RwLock::new(Arc::new(indexes)),
            retention,
        }
    }

    fn snapshot(&self) -> Arc<RuleIndexes> {
        Arc::clone(&*self.indexes.read())
    }

    /// Runs `f` against a private copy of the indexes and publishes the copy.
    fn mutate<T>(&self, f: impl FnOnce(&mut RuleIndexes) -> T) -> T {
        let mut guard = self.indexes.write();
        let mut next = (**guard).clone();
        let out = f(&mut next);
        *guard = Arc::new(next);
        out
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Most specific enabled rule of `subject` matching the endpoint
    pub fn lookup(&self, subject: &SubjectKey, remote: &Endpoint, protocol: Protocol) -> Option<Arc<Rule>> {
        self.snapshot().lookup(subject, remote, protocol)
    }

    pub fn get(&self, id: &RuleId) -> Option<Arc<Rule>> {
        self.snapshot().by_id.get(id).cloned()
    }

    /// All rules, ordered by subject then creation time
    pub fn all(&self) -> Vec<Rule> {
        let snapshot = self.snapshot();
        let mut rules: Vec<Rule> = snapshot.by_id.values().map(|r| (**r).clone()).collect();
        rules.sort_by(|a, b| {
            a.subject
                .cmp(&b.subject)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        rules
    }

    pub fn rules_for(&self, subject: &SubjectKey) -> Vec<Rule> {
        self.snapshot()
            .by_subject
            .get(subject)
            .map(|rules| rules.iter().map(|r| (**r).clone()).collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.snapshot().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Inserts a rule, replacing any rule with the same id
    pub fn add(&self, rule: Rule) -> Arc<Rule> {
        let rule = Arc::new(rule);
        let replaced = self.mutate(|idx| idx.insert(Arc::clone(&rule)));
        debug!(
            "{} rule {} for {} ({})",
            if replaced.is_some() { "Replaced" } else { "Added" },
            rule.id,
            rule.subject,
            rule.action
        );
        rule
    }

    pub fn toggle(&self, id: &RuleId, enabled: bool) -> PolicyResult<()> {
        self.mutate(|idx| -> PolicyResult<()> {
            let current = idx
                .by_id
                .get(id)
                .cloned()
                .ok_or_else(|| PolicyError::NotFound(format!("rule {}", id)))?;
            let mut updated = (*current).clone();
            updated.enabled = enabled;
            updated.updated_at = Utc::now();
            idx.insert(Arc::new(updated));
            Ok(())
        })?;
        debug!("Rule {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn delete(&self, id: &RuleId) -> PolicyResult<Arc<Rule>> {
        let removed = self
            .mutate(|idx| idx.remove(id))
            .ok_or_else(|| PolicyError::NotFound(format!("rule {}", id)))?;
        debug!("Deleted rule {} for {}", id, removed.subject);
        Ok(removed)
    }

    /// Removes every rule of `subject`; returns how many were removed
    pub fn delete_subject(&self, subject: &SubjectKey) -> usize {
        self.mutate(|idx| {
            let ids: Vec<RuleId> = idx
                .by_subject
                .get(subject)
                .map(|rules| rules.iter().map(|r| r.id).collect())
                .unwrap_or_default();
            ids.iter().filter(|id| idx.remove(id).is_some()).count()
        })
    }

    // ========================================================================
    // Bulk operations
    // ========================================================================

    /// Serializes every rule into a versioned blob
    pub fn export_all(&self) -> PolicyResult<Vec<u8>> {
        rule_blob::encode(&self.all())
    }

    /// Merges rules from a blob. With `user_only`, rules not created by the
    /// user are discarded. Colliding ids are overwritten.
    pub fn import_bulk(&self, blob: &[u8], user_only: bool) -> PolicyResult<ImportReport> {
        let DecodedRules {
            rules,
            skipped,
            version_mismatch,
        } = rule_blob::decode(blob)?;

        let mut report = ImportReport {
            skipped,
            version_mismatch,
            ..Default::default()
        };
        let accepted: Vec<Rule> = rules
            .into_iter()
            .filter(|r| {
                let keep = !user_only || r.source.is_user_created();
                if !keep {
                    report.skipped += 1;
                }
                keep
            })
            .collect();

        report.imported = accepted.len();
        self.mutate(|idx| {
            for rule in accepted {
                idx.insert(Arc::new(rule));
            }
        });

        info!(
            "Imported {} rules ({} skipped, user_only={})",
            report.imported, report.skipped, user_only
        );
        Ok(report)
    }

    /// Removes rules whose application is gone; `aggressive` also drops
    /// disabled rules untouched for the retention period. Never fails.
    pub fn cleanup(&self, aggressive: bool, resolver: &dyn SubjectResolver) -> usize {
        self.cleanup_at(aggressive, resolver, Utc::now())
    }

    fn cleanup_at(&self, aggressive: bool, resolver: &dyn SubjectResolver, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.retention;
        let removed = self.mutate(|idx| {
            let stale: Vec<RuleId> = idx
                .by_id
                .values()
                .filter(|r| {
                    !resolver.is_installed(r) || (aggressive && !r.enabled && r.updated_at < cutoff)
                })
                .map(|r| r.id)
                .collect();
            for id in &stale {
                idx.remove(id);
            }
            stale.len()
        });
        info!("Cleanup removed {} rules (aggressive={})", removed, aggressive);
        removed
    }
}

impl Default for RuleStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RuleStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuleStore")
            .field("rules", &self.len())
            .field("retention", &self.retention)
            .finish()
    }
}
