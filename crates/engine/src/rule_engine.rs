//! Rule engine (spec.md §4.C): a pure function from a readings snapshot
//! to a labeled `RuleResult`.

use overseer_core::{Location, ReadingsView, Rule, RuleResult};
use std::collections::BTreeMap;

const UNKNOWN_CONTEXT: &str = "unknown";

/// Determine location, then context, then merge environment overlays.
/// Declaration order breaks every tie; conditions are total (a failing
/// leaf evaluates to `false`, never an error).
pub fn evaluate(rules: &[Rule], locations: &[Location], readings: &impl ReadingsView, online: bool) -> RuleResult {
    let location = determine_location(locations, readings, online);
    let (context_name, context_display, matched_rule) = determine_context(rules, locations, readings, online);

    let mut environment = location.2.clone();
    for (k, v) in &context_display.1 {
        environment.insert(k.clone(), v.clone());
    }

    RuleResult {
        context: context_name,
        context_display: context_display.0,
        location: location.0,
        location_display: location.1,
        matched_rule,
        environment,
    }
}

type LocationMatch = (String, String, BTreeMap<String, String>);

fn determine_location(locations: &[Location], readings: &impl ReadingsView, online: bool) -> LocationMatch {
    if let Some(offline) = locations.iter().find(|l| l.is_offline()) {
        if offline.condition.evaluate(readings, online) {
            return (offline.name.clone(), offline.display_name.clone(), offline.environment_overlay.clone());
        }
    }
    for loc in locations {
        if loc.is_offline() || loc.is_unknown() {
            continue;
        }
        if loc.condition.evaluate(readings, online) {
            return (loc.name.clone(), loc.display_name.clone(), loc.environment_overlay.clone());
        }
    }
    if let Some(unknown) = locations.iter().find(|l| l.is_unknown()) {
        return (unknown.name.clone(), unknown.display_name.clone(), unknown.environment_overlay.clone());
    }
    (overseer_core::location::UNKNOWN.to_string(), overseer_core::location::UNKNOWN.to_string(), BTreeMap::new())
}

type ContextMatch = (String, BTreeMap<String, String>);

/// A rule naming locations matches if ANY of its own named locations'
/// conditions holds, evaluated independently of whichever single location
/// `determine_location` picked as current — two locations can both be
/// "true" at once (say one gated on an `env:` sensor, one on an IP range)
/// and a rule naming the second must still match.
fn determine_context(
    rules: &[Rule],
    locations: &[Location],
    readings: &impl ReadingsView,
    online: bool,
) -> (String, ContextMatch, Option<String>) {
    for rule in rules {
        if rule.is_fallback() {
            return (rule.name.clone(), (rule.display_name.clone(), rule.environment_overlay.clone()), Some(rule.name.clone()));
        }
        if !rule.locations.is_empty() {
            let any_location_holds = rule.locations.iter().any(|name| {
                locations.iter().find(|l| &l.name == name).is_some_and(|loc| loc.condition.evaluate(readings, online))
            });
            if any_location_holds {
                return (rule.name.clone(), (rule.display_name.clone(), rule.environment_overlay.clone()), Some(rule.name.clone()));
            }
            continue;
        }
        if let Some(condition) = &rule.condition {
            if condition.evaluate(readings, online) {
                return (rule.name.clone(), (rule.display_name.clone(), rule.environment_overlay.clone()), Some(rule.name.clone()));
            }
        }
    }
    (UNKNOWN_CONTEXT.to_string(), (UNKNOWN_CONTEXT.to_string(), BTreeMap::new()), None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use overseer_core::{Condition, Pattern, RuleActions, SensorReading};
    use std::collections::HashMap;
    use std::time::Instant;

    fn home_location() -> Location {
        Location {
            name: "home".into(),
            display_name: "Home".into(),
            condition: Condition::Sensor { sensor: "public_ipv4".into(), pattern: Pattern::parse("198.51.100.0/24") },
            environment_overlay: BTreeMap::new(),
        }
    }

    fn trusted_rule() -> Rule {
        Rule {
            name: "trusted".into(),
            display_name: "Trusted".into(),
            locations: vec!["home".into()],
            condition: None,
            actions: RuleActions { connect: vec!["lab".into()], disconnect: vec![] },
            environment_overlay: BTreeMap::new(),
        }
    }

    #[test]
    fn matches_location_gated_rule() {
        let readings: HashMap<String, SensorReading> = [(
            "public_ipv4".to_string(),
            SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now()),
        )]
        .into_iter()
        .collect();
        let result = evaluate(&[trusted_rule()], &[home_location()], &readings, true);
        assert_eq!(result.context, "trusted");
        assert_eq!(result.location, "home");
    }

    #[test]
    fn falls_back_to_unknown_without_a_match() {
        let result = evaluate(&[trusted_rule()], &[home_location()], &HashMap::new(), true);
        assert_eq!(result.context, "unknown");
        assert_eq!(result.location, "unknown");
    }

    #[test]
    fn first_matching_rule_wins_on_declaration_order() {
        let fallback = Rule {
            name: "fallback".into(),
            display_name: "Fallback".into(),
            locations: vec![],
            condition: None,
            actions: RuleActions::default(),
            environment_overlay: BTreeMap::new(),
        };
        let readings: HashMap<String, SensorReading> = [(
            "public_ipv4".to_string(),
            SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now()),
        )]
        .into_iter()
        .collect();
        let result = evaluate(&[trusted_rule(), fallback], &[home_location()], &readings, true);
        assert_eq!(result.context, "trusted");
    }

    #[test]
    fn rule_matches_a_named_location_even_when_a_different_location_is_picked_as_current() {
        // Two locations both hold at once: `home` (first in declaration
        // order, so `determine_location` picks it as current) and
        // `office`, gated on an unrelated sensor. A rule naming only
        // `office` must still match on `office`'s own condition.
        let office = Location {
            name: "office".into(),
            display_name: "Office".into(),
            condition: Condition::Sensor { sensor: "env:OVERSEER_ZONE".into(), pattern: Pattern::parse("office") },
            environment_overlay: BTreeMap::new(),
        };
        let rule = Rule {
            name: "office-rule".into(),
            display_name: "Office rule".into(),
            locations: vec!["office".into()],
            condition: None,
            actions: RuleActions { connect: vec!["lab".into()], disconnect: vec![] },
            environment_overlay: BTreeMap::new(),
        };
        let readings: HashMap<String, SensorReading> = [
            ("public_ipv4".to_string(), SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now())),
            ("env:OVERSEER_ZONE".to_string(), SensorReading::text("env:OVERSEER_ZONE", "office", Instant::now())),
        ]
        .into_iter()
        .collect();

        let result = evaluate(&[rule], &[home_location(), office], &readings, true);
        assert_eq!(result.location, "home");
        assert_eq!(result.context, "office-rule");
    }

    #[test]
    fn context_overlay_wins_over_location_overlay_on_conflict() {
        let mut loc = home_location();
        loc.environment_overlay.insert("KEY".into(), "from_location".into());
        let mut rule = trusted_rule();
        rule.environment_overlay.insert("KEY".into(), "from_context".into());
        let readings: HashMap<String, SensorReading> = [(
            "public_ipv4".to_string(),
            SensorReading::ip("public_ipv4", "198.51.100.7".parse().unwrap(), Instant::now()),
        )]
        .into_iter()
        .collect();
        let result = evaluate(&[rule], &[loc], &readings, true);
        assert_eq!(result.environment.get("KEY"), Some(&"from_context".to_string()));
    }
}
