// Bounded record of recent connection verdicts.
//
// Each verdict the engine hands back, including fail-safe answers for
// pending flows, is appended here with the rule (or "pending"/"default")
// that produced it. Oldest events are evicted once capacity is reached.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use uuid::Uuid;

use crate::flow::{Endpoint, Flow, Protocol, SubjectKey};
use crate::rule::RuleId;

pub const DEFAULT_TELEMETRY_CAPACITY: usize = 1024;

/// Unique sequence number for connection events
pub type SequenceNumber = u64;

/// Verdict delivered to the interception hook
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Allow,
    Block,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Allow => write!(f, "ALLOW"),
            Verdict::Block => write!(f, "BLOCK"),
        }
    }
}

/// What produced a verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum EventSource {
    BlockList,
    AllowList,
    Rule(RuleId),
    /// Fail-safe answer while awaiting an operator decision
    Pending(Uuid),
    /// Automatic default (silent mode) or a malformed flow
    Default,
}

impl std::fmt::Display for EventSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSource::BlockList => write!(f, "block-list"),
            EventSource::AllowList => write!(f, "allow-list"),
            EventSource::Rule(id) => write!(f, "{}", id),
            EventSource::Pending(_) => write!(f, "pending"),
            EventSource::Default => write!(f, "default"),
        }
    }
}

/// Immutable record of one verdict
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    pub seq: SequenceNumber,
    pub subject: SubjectKey,
    pub remote: Endpoint,
    pub protocol: Protocol,
    pub verdict: Verdict,
    pub source: EventSource,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug)]
struct Trail {
    next_seq: SequenceNumber,
    events: VecDeque<ConnectionEvent>,
    capacity: usize,
}

impl Trail {
    fn evict(&mut self) {
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
    }
}

/// Fixed-capacity, append-only log of connection events
#[derive(Debug)]
pub struct TelemetryLog {
    trail: Mutex<Trail>,
}

impl TelemetryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            trail: Mutex::new(Trail {
                next_seq: 0,
                events: VecDeque::with_capacity(capacity.min(DEFAULT_TELEMETRY_CAPACITY)),
                capacity,
            }),
        }
    }

    pub fn append(&self, flow: &Flow, verdict: Verdict, source: EventSource) -> ConnectionEvent {
        let mut trail = self.trail.lock();
        let event = ConnectionEvent {
            seq: trail.next_seq,
            subject: flow.subject.clone(),
            remote: flow.remote.clone(),
            protocol: flow.protocol,
            verdict,
            source,
            timestamp: Utc::now(),
        };
        trail.next_seq += 1;
        trail.events.push_back(event.clone());
        trail.evict();
        event
    }

    /// Events, most recent first
    pub fn recent(&self) -> Vec<ConnectionEvent> {
        self.trail.lock().events.iter().rev().cloned().collect()
    }

    /// Events produced by one rule, most recent first
    pub fn by_rule(&self, rule_id: &RuleId) -> Vec<ConnectionEvent> {
        self.trail
            .lock()
            .events
            .iter()
            .rev()
            .filter(|e| e.source == EventSource::Rule(*rule_id))
            .cloned()
            .collect()
    }

    /// Changes the bound, evicting the oldest events if it shrank
    pub fn set_capacity(&self, capacity: usize) {
        let mut trail = self.trail.lock();
        trail.capacity = capacity;
        trail.evict();
    }

    pub fn capacity(&self) -> usize {
        self.trail.lock().capacity
    }

    pub fn len(&self) -> usize {
        self.trail.lock().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.trail.lock().events.clear();
    }
}

impl Default for TelemetryLog {
    fn default() -> Self {
        Self::new(DEFAULT_TELEMETRY_CAPACITY)
    }
}
