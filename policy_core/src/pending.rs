//! Flows awaiting an operator decision.
//!
//! The queue is keyed twice: by id, for the administrative client, and by
//! fingerprint, so that a burst of identical flows produces a single prompt.
//! Both maps live behind one lock and are only changed together.
//!
//! `resolve` and `delete` are compare-and-remove: the entry leaves the queue
//! under the write lock, so of any number of concurrent callers exactly one
//! gets it and the rest see `NotFound`.

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::{PolicyError, PolicyResult};
use crate::flow::{Fingerprint, Flow};
use crate::rule::{Rule, RuleAction, RuleSource};
use crate::rule_store::RuleStore;

/// A flow parked until the operator decides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingConnection {
    pub id: Uuid,
    pub fingerprint: Fingerprint,
    pub flow: Flow,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Queue {
    by_id: HashMap<Uuid, PendingConnection>,
    by_fingerprint: HashMap<Fingerprint, Uuid>,
}

impl Queue {
    fn take(&mut self, id: &Uuid) -> Option<PendingConnection> {
        let entry = self.by_id.remove(id)?;
        self.by_fingerprint.remove(&entry.fingerprint);
        Some(entry)
    }
}

/// Result of offering a flow to the queue
#[derive(Debug, Clone, PartialEq)]
pub enum Enqueued {
    /// The flow waits on entry `id`; `is_new` is true only for a fresh entry
    Queued { id: Uuid, is_new: bool },
    /// A rule for the flow landed before it could be queued
    Settled(Arc<Rule>),
}

/// Deduplicated set of pending connections
#[derive(Debug, Default)]
pub struct PendingConnectionQueue {
    queue: RwLock<Queue>,
}

impl PendingConnectionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the entry for this flow's fingerprint, creating it if none
    /// exists. `rules` is consulted again under the queue lock: a rule
    /// installed by a concurrent `resolve` wins over a new entry.
    pub fn enqueue_if_absent(&self, flow: &Flow, rules: &RuleStore) -> PolicyResult<Enqueued> {
        let fingerprint = flow
            .fingerprint()
            .ok_or_else(|| PolicyError::MalformedFlow("no subject or remote address".to_string()))?;

        if let Some(id) = self.queue.read().by_fingerprint.get(&fingerprint) {
            return Ok(Enqueued::Queued { id: *id, is_new: false });
        }

        let mut queue = self.queue.write();
        if let Some(id) = queue.by_fingerprint.get(&fingerprint) {
            return Ok(Enqueued::Queued { id: *id, is_new: false });
        }
        if let Some(rule) = rules.lookup(&flow.subject, &flow.remote, flow.protocol) {
            return Ok(Enqueued::Settled(rule));
        }
        let id = Uuid::new_v4();
        queue.by_fingerprint.insert(fingerprint.clone(), id);
        queue.by_id.insert(
            id,
            PendingConnection {
                id,
                fingerprint,
                flow: flow.clone(),
                enqueued_at: Utc::now(),
            },
        );
        info!(
            "Queued pending connection {} ({} -> {}/{})",
            id, flow.subject, flow.remote, flow.protocol
        );
        Ok(Enqueued::Queued { id, is_new: true })
    }

    /// Removes the entry and records its decision as a rule in `rules`.
    /// Both happen under the queue lock, so no enqueue observes the gap.
    pub fn resolve(
        &self,
        id: &Uuid,
        action: RuleAction,
        rules: &RuleStore,
    ) -> PolicyResult<(PendingConnection, Arc<Rule>)> {
        let mut queue = self.queue.write();
        let entry = queue
            .take(id)
            .ok_or_else(|| PolicyError::NotFound(format!("pending connection {}", id)))?;
        let rule = rules.add(Rule::for_flow(&entry.flow, action, RuleSource::Prompt));
        drop(queue);
        info!("Resolved pending connection {} as {} (rule {})", id, action, rule.id);
        Ok((entry, rule))
    }

    /// Removes the entry without creating a rule
    pub fn delete(&self, id: &Uuid) -> bool {
        let removed = self.queue.write().take(id).is_some();
        if removed {
            debug!("Deleted pending connection {}", id);
        }
        removed
    }

    pub fn get(&self, id: &Uuid) -> Option<PendingConnection> {
        self.queue.read().by_id.get(id).cloned()
    }

    pub fn find(&self, fingerprint: &Fingerprint) -> Option<Uuid> {
        self.queue.read().by_fingerprint.get(fingerprint).copied()
    }

    /// Snapshot, oldest first
    pub fn list(&self) -> Vec<PendingConnection> {
        let mut entries: Vec<PendingConnection> = self.queue.read().by_id.values().cloned().collect();
        entries.sort_by(|a, b| a.enqueued_at.cmp(&b.enqueued_at).then_with(|| a.id.cmp(&b.id)));
        entries
    }

    pub fn len(&self) -> usize {
        self.queue.read().by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) -> usize {
        let mut queue = self.queue.write();
        let n = queue.by_id.len();
        queue.by_id.clear();
        queue.by_fingerprint.clear();
        n
    }
}
