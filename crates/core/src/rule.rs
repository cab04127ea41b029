//! Rules and the result of evaluating them against a readings snapshot.

use crate::condition::Condition;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleActions {
    #[serde(default)]
    pub connect: Vec<String>,
    #[serde(default)]
    pub disconnect: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub display_name: String,
    #[serde(default)]
    pub locations: Vec<String>,
    #[serde(default)]
    pub condition: Option<Condition>,
    #[serde(default)]
    pub actions: RuleActions,
    #[serde(default)]
    pub environment_overlay: BTreeMap<String, String>,
}

impl Rule {
    /// A rule with no locations and no condition always matches; it is a
    /// fallback.
    pub fn is_fallback(&self) -> bool {
        self.locations.is_empty() && self.condition.is_none()
    }
}

/// The merged outcome of a rule-engine evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleResult {
    pub context: String,
    pub context_display: String,
    pub location: String,
    pub location_display: String,
    pub matched_rule: Option<String>,
    pub environment: BTreeMap<String, String>,
}

impl RuleResult {
    /// Equality used by the context manager to detect a no-op
    /// re-evaluation: context, location and merged environment, ignoring
    /// display names and the matched rule name.
    pub fn label_eq(&self, other: &RuleResult) -> bool {
        self.context == other.context && self.location == other.location && self.environment == other.environment
    }
}
