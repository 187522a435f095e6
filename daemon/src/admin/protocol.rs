//! Administrative message types.
//!
//! Every call is an `AdminRequest` answered by exactly one `AdminReply` on a
//! dedicated reply path. Replies carry outcomes as values (bool, count, data);
//! failures never travel as errors.
//!
//! ```text
//! ┌─────────────────┐    AdminRequest     ┌─────────────────┐
//! │                 │────────────────────>│                 │
//! │  Admin client   │                     │  AdminService   │
//! │                 │<────────────────────│                 │
//! └─────────────────┘     AdminReply      └─────────────────┘
//! ```

use policy_core::{
    ConnectionEvent, PendingConnection, Preferences, PreferencesUpdate, Rule, RuleAction, RuleId,
    RulePredicate, RuleSource, SubjectKey,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Rule fields supplied by the operator for `addRule`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRule {
    pub subject: SubjectKey,
    #[serde(default)]
    pub process_path: Option<String>,
    #[serde(default)]
    pub predicate: RulePredicate,
    pub action: RuleAction,
    #[serde(default = "enabled_by_default")]
    pub enabled: bool,
}

fn enabled_by_default() -> bool {
    true
}

impl NewRule {
    pub fn into_rule(self) -> Rule {
        let mut builder = Rule::builder(self.subject, self.action)
            .predicate(self.predicate)
            .enabled(self.enabled)
            .source(RuleSource::User);
        if let Some(path) = self.process_path {
            builder = builder.process_path(path);
        }
        builder.build()
    }
}

/// Requests from the administrative client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum AdminRequest {
    GetPreferences,
    UpdatePreferences {
        preferences: PreferencesUpdate,
    },
    GetRules,
    GetConnectionEvents,
    GetPendingConnections,
    ResolvePendingConnection {
        id: Uuid,
        action: RuleAction,
    },
    DeletePendingConnection {
        id: Uuid,
    },
    AddRule {
        rule: NewRule,
    },
    ToggleRule {
        subject: SubjectKey,
        id: RuleId,
        enabled: bool,
    },
    DeleteRule {
        subject: SubjectKey,
        id: RuleId,
    },
    ExportRules,
    ImportRules {
        blob: String,
        #[serde(rename = "userOnly", default)]
        user_only: bool,
    },
    CleanupRules {
        #[serde(default)]
        aggressive: bool,
    },
    GetCurrentProfile,
    GetProfiles,
    AddProfile {
        name: String,
        #[serde(default)]
        preferences: Option<Preferences>,
    },
    DeleteProfile {
        name: String,
    },
    SetProfile {
        name: String,
    },
    Uninstall,
}

impl AdminRequest {
    /// Operation name as it appears on the wire
    pub fn op(&self) -> &'static str {
        match self {
            AdminRequest::GetPreferences => "getPreferences",
            AdminRequest::UpdatePreferences { .. } => "updatePreferences",
            AdminRequest::GetRules => "getRules",
            AdminRequest::GetConnectionEvents => "getConnectionEvents",
            AdminRequest::GetPendingConnections => "getPendingConnections",
            AdminRequest::ResolvePendingConnection { .. } => "resolvePendingConnection",
            AdminRequest::DeletePendingConnection { .. } => "deletePendingConnection",
            AdminRequest::AddRule { .. } => "addRule",
            AdminRequest::ToggleRule { .. } => "toggleRule",
            AdminRequest::DeleteRule { .. } => "deleteRule",
            AdminRequest::ExportRules => "exportRules",
            AdminRequest::ImportRules { .. } => "importRules",
            AdminRequest::CleanupRules { .. } => "cleanupRules",
            AdminRequest::GetCurrentProfile => "getCurrentProfile",
            AdminRequest::GetProfiles => "getProfiles",
            AdminRequest::AddProfile { .. } => "addProfile",
            AdminRequest::DeleteProfile { .. } => "deleteProfile",
            AdminRequest::SetProfile { .. } => "setProfile",
            AdminRequest::Uninstall => "uninstall",
        }
    }
}

/// Replies to the administrative client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "camelCase")]
pub enum AdminReply {
    Preferences(Preferences),
    Rules(Vec<Rule>),
    ConnectionEvents(Vec<ConnectionEvent>),
    PendingConnections(Vec<PendingConnection>),
    /// Serialized rule blob
    Blob(String),
    Success(bool),
    Count(usize),
    Profile(String),
    Profiles(Vec<String>),
    /// Fire-and-forget operations
    Done,
}

impl AdminReply {
    pub fn kind(&self) -> &'static str {
        match self {
            AdminReply::Preferences(_) => "preferences",
            AdminReply::Rules(_) => "rules",
            AdminReply::ConnectionEvents(_) => "connectionEvents",
            AdminReply::PendingConnections(_) => "pendingConnections",
            AdminReply::Blob(_) => "blob",
            AdminReply::Success(_) => "success",
            AdminReply::Count(_) => "count",
            AdminReply::Profile(_) => "profile",
            AdminReply::Profiles(_) => "profiles",
            AdminReply::Done => "done",
        }
    }
}
