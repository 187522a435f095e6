// Named bundles of {RuleStore, Preferences}, exactly one of them active.
//
// The registry (all profiles + the active pointer) lives behind one lock, so
// "is this profile active?" and "delete it" cannot interleave with a switch.
// Evaluation clones the active `Arc<Profile>` under a read lock and works from
// that, which is what keeps a profile switch atomic: an evaluation holds one
// profile's rules and preferences from start to finish.

use chrono::Duration;
use log::info;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::error::{PolicyError, PolicyResult};
use crate::preferences::{Preferences, PreferencesUpdate};
use crate::rule::Rule;
use crate::rule_store::{RuleStore, DEFAULT_STALE_RETENTION_DAYS};

pub const DEFAULT_PROFILE: &str = "default";

/// One named bundle of rules and preferences
#[derive(Debug)]
pub struct Profile {
    name: String,
    preferences: RwLock<Arc<Preferences>>,
    rules: RuleStore,
}

impl Profile {
    fn new(name: String, preferences: Preferences, rules: RuleStore) -> Self {
        Self {
            name,
            preferences: RwLock::new(Arc::new(preferences)),
            rules,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn preferences(&self) -> Arc<Preferences> {
        Arc::clone(&*self.preferences.read())
    }

    pub fn rules(&self) -> &RuleStore {
        &self.rules
    }

    /// Merges `update` and returns the effective preferences
    pub fn update_preferences(&self, update: &PreferencesUpdate) -> Preferences {
        let mut guard = self.preferences.write();
        let merged = guard.merged(update);
        *guard = Arc::new(merged.clone());
        merged
    }

    pub fn snapshot(&self, active: bool) -> ProfileSnapshot {
        ProfileSnapshot {
            name: self.name.clone(),
            preferences: (*self.preferences()).clone(),
            rules: self.rules.all(),
            active,
        }
    }
}

/// Serializable copy of a profile, used for persistence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileSnapshot {
    pub name: String,
    pub preferences: Preferences,
    pub rules: Vec<Rule>,
    pub active: bool,
}

#[derive(Debug)]
struct Registry {
    profiles: BTreeMap<String, Arc<Profile>>,
    active: Arc<Profile>,
}

/// Owns every profile and the process-wide active pointer
#[derive(Debug)]
pub struct ProfileManager {
    registry: RwLock<Registry>,
    retention: Duration,
}

impl ProfileManager {
    /// Manager holding only the default profile, active
    pub fn new() -> Self {
        Self::with_retention(Duration::days(DEFAULT_STALE_RETENTION_DAYS))
    }

    pub fn with_retention(retention: Duration) -> Self {
        let default = Arc::new(Profile::new(
            DEFAULT_PROFILE.to_string(),
            Preferences::default(),
            RuleStore::with_retention(retention),
        ));
        let mut profiles = BTreeMap::new();
        profiles.insert(DEFAULT_PROFILE.to_string(), Arc::clone(&default));
        Self {
            registry: RwLock::new(Registry {
                profiles,
                active: default,
            }),
            retention,
        }
    }

    /// Rebuilds profiles from snapshots. The snapshot flagged active wins;
    /// without one, the default profile (created if absent) is activated.
    pub fn from_snapshots(snapshots: Vec<ProfileSnapshot>, retention: Duration) -> Self {
        let manager = Self::with_retention(retention);
        if snapshots.is_empty() {
            return manager;
        }

        let mut profiles = BTreeMap::new();
        let mut active_name = None;
        for snapshot in snapshots {
            if snapshot.active {
                active_name = Some(snapshot.name.clone());
            }
            let store = RuleStore::from_rules(snapshot.rules, retention);
            profiles.insert(
                snapshot.name.clone(),
                Arc::new(Profile::new(snapshot.name, snapshot.preferences, store)),
            );
        }

        let active_name = active_name.unwrap_or_else(|| DEFAULT_PROFILE.to_string());
        let active = match profiles.get(&active_name) {
            Some(profile) => Arc::clone(profile),
            None => {
                let default = Arc::new(Profile::new(
                    active_name.clone(),
                    Preferences::default(),
                    RuleStore::with_retention(retention),
                ));
                profiles.insert(active_name, Arc::clone(&default));
                default
            }
        };

        info!(
            "Restored {} profiles, active '{}'",
            profiles.len(),
            active.name()
        );
        *manager.registry.write() = Registry { profiles, active };
        manager
    }

    /// Creates a profile with an empty rule store
    pub fn create(&self, name: &str, preferences: Preferences) -> PolicyResult<Arc<Profile>> {
        let name = profile_name(name);
        if name.is_empty() {
            return Err(PolicyError::InvalidName(name.to_string()));
        }
        let mut registry = self.registry.write();
        if registry.profiles.contains_key(name) {
            return Err(PolicyError::DuplicateName(name.to_string()));
        }
        let profile = Arc::new(Profile::new(
            name.to_string(),
            preferences,
            RuleStore::with_retention(self.retention),
        ));
        registry.profiles.insert(name.to_string(), Arc::clone(&profile));
        info!("Created profile '{}'", name);
        Ok(profile)
    }

    /// Discards a profile and its rules. The active profile cannot be deleted.
    pub fn delete(&self, name: &str) -> PolicyResult<()> {
        let name = profile_name(name);
        let mut registry = self.registry.write();
        if registry.active.name() == name {
            return Err(PolicyError::ProfileInUse(name.to_string()));
        }
        registry
            .profiles
            .remove(name)
            .ok_or_else(|| PolicyError::NotFound(format!("profile '{}'", name)))?;
        info!("Deleted profile '{}'", name);
        Ok(())
    }

    /// Swaps the active profile pointer
    pub fn set_active(&self, name: &str) -> PolicyResult<Arc<Profile>> {
        let name = profile_name(name);
        let mut registry = self.registry.write();
        let profile = registry
            .profiles
            .get(name)
            .cloned()
            .ok_or_else(|| PolicyError::NotFound(format!("profile '{}'", name)))?;
        let previous = std::mem::replace(&mut registry.active, Arc::clone(&profile));
        info!("Switched profile '{}' -> '{}'", previous.name(), name);
        Ok(profile)
    }

    pub fn active(&self) -> Arc<Profile> {
        Arc::clone(&self.registry.read().active)
    }

    pub fn get(&self, name: &str) -> Option<Arc<Profile>> {
        self.registry.read().profiles.get(profile_name(name)).cloned()
    }

    /// Profile names in lexical order
    pub fn list(&self) -> Vec<String> {
        self.registry.read().profiles.keys().cloned().collect()
    }

    pub fn snapshot(&self) -> Vec<ProfileSnapshot> {
        let registry = self.registry.read();
        registry
            .profiles
            .values()
            .map(|p| p.snapshot(Arc::ptr_eq(p, &registry.active)))
            .collect()
    }
}

/// Names are compared with surrounding whitespace removed
fn profile_name(name: &str) -> &str {
    name.trim()
}

impl Default for ProfileManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::preferences::DefaultAction;
    use crate::rule::RuleAction;

    #[test]
    fn starts_with_active_default_profile() {
        let manager = ProfileManager::new();
        assert_eq!(manager.active().name(), DEFAULT_PROFILE);
        assert_eq!(manager.list(), vec![DEFAULT_PROFILE.to_string()]);
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let manager = ProfileManager::new();
        manager.create("work", Preferences::default()).unwrap();
        assert!(matches!(
            manager.create("work", Preferences::default()),
            Err(PolicyError::DuplicateName(_))
        ));
    }

    #[test]
    fn names_are_trimmed_everywhere() {
        let manager = ProfileManager::new();
        manager.create(" work ", Preferences::default()).unwrap();
        assert_eq!(manager.list(), vec!["default", "work"]);
        assert!(manager.get("work ").is_some());

        manager.set_active(" work").unwrap();
        assert_eq!(manager.active().name(), "work");
        assert!(matches!(
            manager.delete("work  "),
            Err(PolicyError::ProfileInUse(_))
        ));

        manager.set_active("default").unwrap();
        manager.delete("\twork\n").unwrap();
        assert_eq!(manager.list(), vec!["default"]);
    }

    #[test]
    fn active_profile_cannot_be_deleted() {
        let manager = ProfileManager::new();
        manager.create("work", Preferences::default()).unwrap();
        manager.set_active("work").unwrap();

        assert!(matches!(manager.delete("work"), Err(PolicyError::ProfileInUse(_))));
        manager.delete(DEFAULT_PROFILE).unwrap();
        assert_eq!(manager.list(), vec!["work".to_string()]);
        assert!(matches!(manager.delete("nope"), Err(PolicyError::NotFound(_))));
    }

    #[test]
    fn unknown_profile_cannot_be_activated() {
        let manager = ProfileManager::new();
        assert!(matches!(manager.set_active("ghost"), Err(PolicyError::NotFound(_))));
        assert_eq!(manager.active().name(), DEFAULT_PROFILE);
    }

    #[test]
    fn profiles_keep_separate_rules_and_preferences() {
        let manager = ProfileManager::new();
        let silent = Preferences {
            default_action: DefaultAction::Allow,
            ..Default::default()
        };
        manager.create("travel", silent).unwrap();

        manager
            .active()
            .rules()
            .add(Rule::builder("com.example.app", RuleAction::Allow).build());

        let travel = manager.set_active("travel").unwrap();
        assert!(travel.rules().is_empty());
        assert_eq!(travel.preferences().default_action, DefaultAction::Allow);

        let default = manager.set_active(DEFAULT_PROFILE).unwrap();
        assert_eq!(default.rules().len(), 1);
        assert_eq!(default.preferences().default_action, DefaultAction::None);
    }

    #[test]
    fn held_profile_is_unaffected_by_switch() {
        let manager = ProfileManager::new();
        manager.create("other", Preferences::default()).unwrap();

        let held = manager.active();
        manager.set_active("other").unwrap();
        assert_eq!(held.name(), DEFAULT_PROFILE);
        assert_eq!(manager.active().name(), "other");
    }

    #[test]
    fn snapshots_restore_profiles() {
        let manager = ProfileManager::new();
        manager.create("work", Preferences::default()).unwrap();
        manager.set_active("work").unwrap();
        manager
            .active()
            .rules()
            .add(Rule::builder("/usr/bin/ssh", RuleAction::Allow).port(22).build());

        let restored = ProfileManager::from_snapshots(manager.snapshot(), Duration::days(30));
        assert_eq!(restored.active().name(), "work");
        assert_eq!(restored.active().rules().len(), 1);
        assert_eq!(restored.list(), manager.list());
    }

    #[test]
    fn update_preferences_returns_effective_values() {
        let manager = ProfileManager::new();
        let effective = manager.active().update_preferences(&PreferencesUpdate {
            telemetry_capacity: Some(8),
            ..Default::default()
        });
        assert_eq!(effective.telemetry_capacity, 8);
        assert_eq!(manager.active().preferences().telemetry_capacity, 8);
    }
}
