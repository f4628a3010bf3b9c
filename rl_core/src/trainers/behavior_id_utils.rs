// Behavior identifiers - parsing of "Brain?team=N" style behavior names
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

const TEAM_SEPARATOR: &str = "?team=";

/// A parsed behavior name. Several identifiers may share one brain name,
/// one per team.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BehaviorIdentifiers {
    pub behavior_id: String,
    pub brain_name: String,
    pub team_id: i32,
}

impl BehaviorIdentifiers {
    /// Parses `Brain?team=N`. A missing or malformed team suffix maps to team 0
    /// and the whole string is used as the brain name.
    pub fn from_name_behavior_id(name_behavior_id: &str) -> Self {
        if let Some((brain_name, team)) = name_behavior_id.split_once(TEAM_SEPARATOR) {
            if let Ok(team_id) = team.parse::<i32>() {
                return Self {
                    behavior_id: name_behavior_id.to_string(),
                    brain_name: brain_name.to_string(),
                    team_id,
                };
            }
        }
        Self {
            behavior_id: name_behavior_id.to_string(),
            brain_name: name_behavior_id.to_string(),
            team_id: 0,
        }
    }
}

impl fmt::Display for BehaviorIdentifiers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.behavior_id)
    }
}

pub fn create_name_behavior_id(brain_name: &str, team_id: i32) -> String {
    format!("{brain_name}{TEAM_SEPARATOR}{team_id}")
}

/// Append-only mapping from brain name to every behavior id bound to it.
#[derive(Debug, Default, Clone)]
pub struct BehaviorRegistry {
    bindings: BTreeMap<String, BTreeSet<String>>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the binding and returns true if it was not known yet.
    pub fn bind(&mut self, parsed: &BehaviorIdentifiers) -> bool {
        self.bindings
            .entry(parsed.brain_name.clone())
            .or_default()
            .insert(parsed.behavior_id.clone())
    }

    pub fn identifiers(&self, brain_name: &str) -> impl Iterator<Item = &str> {
        self.bindings
            .get(brain_name)
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
    }

    pub fn contains(&self, behavior_id: &str) -> bool {
        self.bindings.values().any(|ids| ids.contains(behavior_id))
    }

    pub fn brain_count(&self) -> usize {
        self.bindings.len()
    }

    /// Total number of bound behavior ids.
    pub fn len(&self) -> usize {
        self.bindings.values().map(BTreeSet::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_team_suffix() {
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Striker?team=1");
        assert_eq!(parsed.brain_name, "Striker");
        assert_eq!(parsed.team_id, 1);
        assert_eq!(parsed.behavior_id, "Striker?team=1");
    }

    #[test]
    fn plain_name_is_team_zero() {
        let parsed = BehaviorIdentifiers::from_name_behavior_id("3DBall");
        assert_eq!(parsed.brain_name, "3DBall");
        assert_eq!(parsed.team_id, 0);
    }

    #[test]
    fn malformed_team_keeps_full_name() {
        let parsed = BehaviorIdentifiers::from_name_behavior_id("Walker?team=abc");
        assert_eq!(parsed.brain_name, "Walker?team=abc");
        assert_eq!(parsed.team_id, 0);
    }

    #[test]
    fn registry_never_shrinks() {
        let mut registry = BehaviorRegistry::new();
        let ids = ["Soccer?team=0", "Soccer?team=1", "Soccer?team=0", "Goalie"];
        let mut previous = 0;
        for id in ids {
            registry.bind(&BehaviorIdentifiers::from_name_behavior_id(id));
            assert!(registry.len() >= previous);
            previous = registry.len();
        }
        assert_eq!(registry.len(), 3);
        assert_eq!(registry.brain_count(), 2);
        assert_eq!(registry.identifiers("Soccer").count(), 2);
        assert_eq!(create_name_behavior_id("Soccer", 1), "Soccer?team=1");
    }
}
