//! The top-level parsed configuration tree: everything the engine and
//! daemon need, independent of how it was loaded. Producing this struct
//! from the user's HCL file is an external concern (see `spec.md` §1);
//! this crate only defines the shape and validates cross-references.

use crate::daemon::{DaemonConfig, ProbeConfig};
use crate::error::ConfigError;
use overseer_core::{ExportTarget, Location, Rule, TunnelDescriptor};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,

    #[serde(default)]
    pub probes: ProbeConfig,

    #[serde(default)]
    pub locations: Vec<Location>,

    #[serde(default)]
    pub rules: Vec<Rule>,

    #[serde(default)]
    pub tunnels: Vec<TunnelDescriptor>,

    #[serde(default)]
    pub exports: Vec<ExportTarget>,
}

impl Config {
    /// Cross-checks names and aliases referenced between `locations`,
    /// `rules`, and `tunnels`. Parsing produces a syntactically valid
    /// tree; this catches the semantic mistakes a user can still make
    /// (a rule naming a location that was never defined, and so on).
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen_locations = std::collections::HashSet::new();
        for location in &self.locations {
            if !seen_locations.insert(location.name.as_str()) {
                return Err(ConfigError::DuplicateLocation(location.name.clone()));
            }
        }

        let mut seen_rules = std::collections::HashSet::new();
        for rule in &self.rules {
            if !seen_rules.insert(rule.name.as_str()) {
                return Err(ConfigError::DuplicateRule(rule.name.clone()));
            }
        }

        let mut seen_tunnels = std::collections::HashSet::new();
        for tunnel in &self.tunnels {
            if !seen_tunnels.insert(tunnel.alias.as_str()) {
                return Err(ConfigError::DuplicateTunnel(tunnel.alias.clone()));
            }
        }

        let mut has_fallback = false;
        for rule in &self.rules {
            if rule.is_fallback() {
                has_fallback = true;
            }
            for location_name in &rule.locations {
                if !seen_locations.contains(location_name.as_str()) {
                    return Err(ConfigError::UnknownLocation {
                        rule: rule.name.clone(),
                        location: location_name.clone(),
                    });
                }
            }
            for alias in rule.actions.connect.iter().chain(rule.actions.disconnect.iter()) {
                if !seen_tunnels.contains(alias.as_str()) {
                    return Err(ConfigError::UnknownTunnel {
                        rule: rule.name.clone(),
                        alias: alias.clone(),
                        direction: if rule.actions.connect.contains(alias) { "connect" } else { "disconnect" },
                    });
                }
            }
        }

        if !self.rules.is_empty() && !has_fallback {
            return Err(ConfigError::MissingFallbackRule);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{Condition, Pattern, RuleActions};
    use std::collections::BTreeMap;

    fn sample_location(name: &str) -> Location {
        Location {
            name: name.to_string(),
            display_name: name.to_string(),
            condition: Condition::Sensor { sensor: "public_ipv4".into(), pattern: Pattern::Exact("198.51.100.7".into()) },
            environment_overlay: BTreeMap::new(),
        }
    }

    fn fallback_rule() -> Rule {
        Rule {
            name: "fallback".into(),
            display_name: "fallback".into(),
            locations: vec![],
            condition: None,
            actions: RuleActions::default(),
            environment_overlay: BTreeMap::new(),
        }
    }

    #[test]
    fn rejects_rule_referencing_unknown_location() {
        let config = Config {
            locations: vec![sample_location("home")],
            rules: vec![
                fallback_rule(),
                Rule {
                    name: "trusted".into(),
                    display_name: "trusted".into(),
                    locations: vec!["office".into()],
                    condition: None,
                    actions: RuleActions::default(),
                    environment_overlay: BTreeMap::new(),
                },
            ],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::UnknownLocation { .. })));
    }

    #[test]
    fn rejects_missing_fallback_rule() {
        let config = Config {
            rules: vec![Rule {
                name: "trusted".into(),
                display_name: "trusted".into(),
                locations: vec![],
                condition: Some(Condition::Bool { sensor: "online".into(), expected: true }),
                actions: RuleActions::default(),
                environment_overlay: BTreeMap::new(),
            }],
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::MissingFallbackRule)));
    }

    #[test]
    fn accepts_well_formed_config() {
        let config = Config {
            locations: vec![sample_location("home")],
            rules: vec![
                fallback_rule(),
                Rule {
                    name: "trusted".into(),
                    display_name: "trusted".into(),
                    locations: vec!["home".into()],
                    condition: None,
                    actions: RuleActions { connect: vec!["lab".into()], disconnect: vec![] },
                    environment_overlay: BTreeMap::new(),
                },
            ],
            tunnels: vec![TunnelDescriptor { alias: "lab".into(), tags: vec![], companions: vec![] }],
            ..Config::default()
        };
        assert!(config.validate().is_ok());
    }
}
