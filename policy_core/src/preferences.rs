// Typed per-profile preferences.

use serde::{Deserialize, Serialize};

use crate::rule::RuleAction;
use crate::telemetry_log::DEFAULT_TELEMETRY_CAPACITY;

/// Verdict applied to flows no list or rule decides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DefaultAction {
    Allow,
    Block,
    /// Queue the flow for an operator decision
    #[default]
    None,
}

impl DefaultAction {
    /// The automatic action in silent mode, if any
    pub fn as_rule_action(&self) -> Option<RuleAction> {
        match self {
            DefaultAction::Allow => Some(RuleAction::Allow),
            DefaultAction::Block => Some(RuleAction::Block),
            DefaultAction::None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    /// Consult the block list
    pub block_mode: bool,
    /// Consult the allow list
    pub allow_mode: bool,
    pub default_action: DefaultAction,
    pub telemetry_capacity: usize,
    /// Allow flows from platform-signed binaries and remember the decision
    pub allow_platform_binaries: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            block_mode: false,
            allow_mode: false,
            default_action: DefaultAction::None,
            telemetry_capacity: DEFAULT_TELEMETRY_CAPACITY,
            allow_platform_binaries: true,
        }
    }
}

impl Preferences {
    /// Applies the fields present in `update`
    pub fn merged(&self, update: &PreferencesUpdate) -> Preferences {
        Preferences {
            block_mode: update.block_mode.unwrap_or(self.block_mode),
            allow_mode: update.allow_mode.unwrap_or(self.allow_mode),
            default_action: update.default_action.unwrap_or(self.default_action),
            telemetry_capacity: update.telemetry_capacity.unwrap_or(self.telemetry_capacity),
            allow_platform_binaries: update
                .allow_platform_binaries
                .unwrap_or(self.allow_platform_binaries),
        }
    }

    pub fn silent_mode(&self) -> bool {
        self.default_action != DefaultAction::None
    }
}

/// Partial preferences; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_action: Option<DefaultAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub telemetry_capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_platform_binaries: Option<bool>,
}
