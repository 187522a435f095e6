// Core rule structure
//
// A rule is a persisted decision for one application identity: which remote
// endpoints it applies to, and whether they are allowed or blocked. Rules are
// owned by a RuleStore and only ever mutated through it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use crate::flow::{Endpoint, Flow, Protocol, SubjectKey};
use crate::prefix::IpPrefix;

/// Unique identifier for a rule (UUID v4)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleId(Uuid);

impl RuleId {
    pub fn new() -> Self {
        RuleId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RuleId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RuleId {
    fn from(uuid: Uuid) -> Self {
        RuleId(uuid)
    }
}

impl std::str::FromStr for RuleId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(RuleId(Uuid::parse_str(s)?))
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a rule does with a matching flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Block,
}

impl std::fmt::Display for RuleAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleAction::Allow => write!(f, "allow"),
            RuleAction::Block => write!(f, "block"),
        }
    }
}

/// Where a rule came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSource {
    /// Added explicitly by the operator
    User,
    /// Created by resolving a pending connection
    Prompt,
    /// System-provided or created automatically by the engine
    Default,
}

impl RuleSource {
    pub fn is_user_created(&self) -> bool {
        matches!(self, RuleSource::User | RuleSource::Prompt)
    }
}

/// Remote address part of a predicate
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressMatch {
    /// Hostname or address, compared case-insensitively
    Literal(String),
    Prefix(IpPrefix),
}

impl AddressMatch {
    /// Parses an operator-supplied address: `a.b.c.d/n` is a prefix,
    /// anything else a literal.
    pub fn parse(s: &str) -> Result<Self, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("empty address".to_string());
        }
        if s.contains('/') {
            return s.parse().map(AddressMatch::Prefix);
        }
        Ok(AddressMatch::Literal(s.to_lowercase()))
    }

    fn matches(&self, remote: &Endpoint) -> bool {
        match self {
            AddressMatch::Literal(literal) => {
                let by_ip = remote
                    .address
                    .map(|ip| ip.to_string().eq_ignore_ascii_case(literal))
                    .unwrap_or(false);
                let by_host = remote
                    .hostname
                    .as_deref()
                    .map(|h| h.eq_ignore_ascii_case(literal))
                    .unwrap_or(false);
                by_ip || by_host
            }
            AddressMatch::Prefix(prefix) => remote
                .address
                .as_ref()
                .map(|ip: &IpAddr| prefix.contains(ip))
                .unwrap_or(false),
        }
    }
}

/// Match predicate; `None` fields are wildcards
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RulePredicate {
    #[serde(default)]
    pub address: Option<AddressMatch>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub protocol: Option<Protocol>,
}

impl RulePredicate {
    pub fn any() -> Self {
        Self::default()
    }

    /// Exact predicate for one endpoint, as produced by a pending resolution
    pub fn exact(remote: &Endpoint, protocol: Protocol) -> Self {
        Self {
            address: remote.address_key().map(AddressMatch::Literal),
            port: Some(remote.port),
            protocol: Some(protocol),
        }
    }

    pub fn matches(&self, remote: &Endpoint, protocol: Protocol) -> bool {
        if let Some(p) = self.protocol {
            if p != protocol {
                return false;
            }
        }
        if let Some(port) = self.port {
            if port != remote.port {
                return false;
            }
        }
        match &self.address {
            Some(address) => address.matches(remote),
            None => true,
        }
    }

    /// Lookup tier: address+port, then address-only, then
    /// port/protocol-only, then full wildcard. Rules in the same tier are
    /// ordered by creation time alone.
    pub fn specificity(&self) -> u8 {
        match (&self.address, self.port, self.protocol) {
            (Some(_), Some(_), _) => 3,
            (Some(_), None, _) => 2,
            (None, Some(_), _) | (None, None, Some(_)) => 1,
            (None, None, None) => 0,
        }
    }
}

/// A persisted decision for one application identity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub id: RuleId,
    pub subject: SubjectKey,
    /// Executable path recorded when the rule was created, used by cleanup
    #[serde(default)]
    pub process_path: Option<String>,
    #[serde(default)]
    pub predicate: RulePredicate,
    pub action: RuleAction,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub source: RuleSource,
    pub created_at: DateTime<Utc>,
    /// Last time the rule was created, toggled or overwritten
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    pub fn builder(subject: impl Into<SubjectKey>, action: RuleAction) -> RuleBuilder {
        RuleBuilder::new(subject.into(), action)
    }

    /// Rule covering exactly the endpoint of `flow`
    pub fn for_flow(flow: &Flow, action: RuleAction, source: RuleSource) -> Self {
        let mut builder = RuleBuilder::new(flow.subject.clone(), action)
            .predicate(RulePredicate::exact(&flow.remote, flow.protocol))
            .source(source);
        if let Some(path) = &flow.process_path {
            builder = builder.process_path(path.clone());
        }
        builder.build()
    }

    pub fn matches(&self, subject: &SubjectKey, remote: &Endpoint, protocol: Protocol) -> bool {
        self.enabled && &self.subject == subject && self.predicate.matches(remote, protocol)
    }

    /// Tuple that identifies a rule's meaning independent of its id
    pub fn signature(&self) -> (SubjectKey, RulePredicate, RuleAction, bool) {
        (
            self.subject.clone(),
            self.predicate.clone(),
            self.action,
            self.enabled,
        )
    }
}

pub struct RuleBuilder {
    id: Option<RuleId>,
    subject: SubjectKey,
    process_path: Option<String>,
    predicate: RulePredicate,
    action: RuleAction,
    enabled: bool,
    source: RuleSource,
    created_at: Option<DateTime<Utc>>,
}

impl RuleBuilder {
    fn new(subject: SubjectKey, action: RuleAction) -> Self {
        Self {
            id: None,
            subject,
            process_path: None,
            predicate: RulePredicate::any(),
            action,
            enabled: true,
            source: RuleSource::User,
            created_at: None,
        }
    }

    pub fn id(mut self, id: RuleId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn process_path(mut self, path: impl Into<String>) -> Self {
        self.process_path = Some(path.into());
        self
    }

    pub fn predicate(mut self, predicate: RulePredicate) -> Self {
        self.predicate = predicate;
        self
    }

    pub fn address(mut self, address: AddressMatch) -> Self {
        self.predicate.address = Some(address);
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.predicate.port = Some(port);
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.predicate.protocol = Some(protocol);
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn source(mut self, source: RuleSource) -> Self {
        self.source = source;
        self
    }

    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = Some(at);
        self
    }

    pub fn build(self) -> Rule {
        let created_at = self.created_at.unwrap_or_else(Utc::now);
        Rule {
            id: self.id.unwrap_or_default(),
            subject: self.subject,
            process_path: self.process_path,
            predicate: self.predicate,
            action: self.action,
            enabled: self.enabled,
            source: self.source,
            created_at,
            updated_at: created_at,
        }
    }
}
