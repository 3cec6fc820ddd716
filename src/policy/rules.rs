//! Parses the rule document (§6.3): a JSON array of ordered rules, each
//! naming a match predicate, an `auto_snapshot` opt-out flag, a policy list,
//! and a per-policy retention count. Unknown match keys are ignored with a
//! warning at load time (serde's default permissiveness); missing retention
//! for a listed policy rejects the rule outright.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SizeRange {
    pub min: Option<u32>,
    pub max: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatchPredicate {
    #[serde(default)]
    pub tenant_name: Option<Vec<String>>,
    #[serde(default)]
    pub domain_name: Option<Vec<String>>,
    #[serde(default)]
    pub volume_name: Option<Vec<String>>,
    #[serde(default)]
    pub size_gb: Option<SizeRange>,
    #[serde(default)]
    pub bootable: Option<bool>,
    #[serde(default)]
    pub metadata_equals: Option<HashMap<String, String>>,
    #[serde(default)]
    pub metadata_contains: Option<HashMap<String, String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rule {
    pub name: String,
    pub priority: i64,
    #[serde(rename = "match", default)]
    pub match_predicate: MatchPredicate,
    pub auto_snapshot: bool,
    #[serde(default)]
    pub policies: Vec<String>,
    #[serde(default)]
    pub retention: HashMap<String, u32>,
}

impl Rule {
    fn validate(&self) -> Result<()> {
        for policy in &self.policies {
            if !self.retention.contains_key(policy) {
                return Err(Error::Config(format!(
                    "rule '{}' lists policy '{}' with no retention entry",
                    self.name, policy
                )));
            }
        }
        Ok(())
    }
}

/// An ordered rule set, already sorted by ascending `priority` (lower wins).
#[derive(Debug, Clone)]
pub struct RuleSet {
    rules: Vec<Rule>,
}

impl RuleSet {
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn parse(document: &str) -> Result<Self> {
        let raw: Vec<serde_json::Value> = serde_json::from_str(document)
            .map_err(|e| Error::Config(format!("rule document is not a JSON array: {e}")))?;

        let known_match_keys = [
            "tenant_name",
            "domain_name",
            "volume_name",
            "size_gb",
            "bootable",
            "metadata_equals",
            "metadata_contains",
        ];

        let mut rules = Vec::with_capacity(raw.len());
        for value in raw {
            if let Some(m) = value.get("match").and_then(|m| m.as_object()) {
                for key in m.keys() {
                    if !known_match_keys.contains(&key.as_str()) {
                        warn!(key, "ignoring unknown match predicate key in rule document");
                    }
                }
            }
            let rule: Rule = serde_json::from_value(value)
                .map_err(|e| Error::Config(format!("invalid rule in rule document: {e}")))?;
            rule.validate()?;
            rules.push(rule);
        }
        rules.sort_by_key(|r| r.priority);
        Ok(Self { rules })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rules_are_sorted_by_ascending_priority() {
        let doc = r#"[
            {"name":"b","priority":5,"match":{},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}},
            {"name":"a","priority":1,"match":{},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}}
        ]"#;
        let set = RuleSet::parse(doc).unwrap();
        assert_eq!(set.rules()[0].name, "a");
        assert_eq!(set.rules()[1].name, "b");
    }

    #[test]
    fn missing_retention_for_listed_policy_is_rejected() {
        let doc = r#"[{"name":"bad","priority":1,"match":{},"auto_snapshot":true,"policies":["daily_5"],"retention":{}}]"#;
        let err = RuleSet::parse(doc).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn unknown_match_key_is_ignored_not_rejected() {
        let doc = r#"[{"name":"a","priority":1,"match":{"bogus_key":"x"},"auto_snapshot":true,"policies":[],"retention":{}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        assert_eq!(set.rules().len(), 1);
    }

    #[test]
    fn not_an_array_is_a_config_error() {
        let err = RuleSet::parse(r#"{"name":"a"}"#).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
