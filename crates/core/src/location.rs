//! Location labels: named, conditioned building blocks for rules.

use crate::condition::Condition;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The special location name checked first when determining location.
pub const OFFLINE: &str = "offline";
/// The final fallback location name.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    pub name: String,
    pub display_name: String,
    pub condition: Condition,
    #[serde(default)]
    pub environment_overlay: BTreeMap<String, String>,
}

impl Location {
    pub fn is_offline(&self) -> bool {
        self.name == OFFLINE
    }

    pub fn is_unknown(&self) -> bool {
        self.name == UNKNOWN
    }
}
