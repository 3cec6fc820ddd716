//! First-match-wins evaluator over an ordered [`RuleSet`]: each rule's match
//! predicate is checked in priority order and the first one that matches a
//! volume decides its policy assignment.

use chrono::{DateTime, Utc};
use std::collections::HashMap;

use crate::policy::rules::{MatchPredicate, Rule, RuleSet};

/// The subset of volume + inventory attributes the engine needs to evaluate
/// match predicates against. Deliberately flat and copy-free so a Stage A
/// batch can build one per volume cheaply.
#[derive(Debug, Clone)]
pub struct VolumeContext {
    pub volume_id: String,
    pub volume_name: String,
    pub tenant_name: String,
    pub domain_name: String,
    pub size_gb: u32,
    pub bootable: bool,
    pub metadata: HashMap<String, String>,
}

/// An active, unexpired opt-out. Takes precedence over any rule match.
#[derive(Debug, Clone)]
pub struct Exclusion {
    pub expires_at: Option<DateTime<Utc>>,
}

impl Exclusion {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now < expiry,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// The volume is bound to a policy set; `policies` is the rule's
    /// declared order, `retention` keyed by policy name.
    Assign { rule_name: String, policies: Vec<String>, retention: HashMap<String, u32> },
    /// The volume is actively opted out — either by rule (`auto_snapshot:
    /// false`) or by an unexpired [`Exclusion`].
    Exclude { reason: String },
    /// No rule matched; the volume receives no assignment.
    Unmatched,
}

fn predicate_matches(predicate: &MatchPredicate, ctx: &VolumeContext) -> bool {
    if let Some(tenants) = &predicate.tenant_name {
        if !tenants.iter().any(|t| t == &ctx.tenant_name) {
            return false;
        }
    }
    if let Some(domains) = &predicate.domain_name {
        if !domains.iter().any(|d| d == &ctx.domain_name) {
            return false;
        }
    }
    if let Some(names) = &predicate.volume_name {
        if !names.iter().any(|n| ctx.volume_name.contains(n.as_str())) {
            return false;
        }
    }
    if let Some(range) = &predicate.size_gb {
        if let Some(min) = range.min {
            if ctx.size_gb < min {
                return false;
            }
        }
        if let Some(max) = range.max {
            if ctx.size_gb > max {
                return false;
            }
        }
    }
    if let Some(bootable) = predicate.bootable {
        if bootable != ctx.bootable {
            return false;
        }
    }
    if let Some(equals) = &predicate.metadata_equals {
        for (k, v) in equals {
            if ctx.metadata.get(k) != Some(v) {
                return false;
            }
        }
    }
    if let Some(contains) = &predicate.metadata_contains {
        for (k, v) in contains {
            match ctx.metadata.get(k) {
                Some(actual) if actual.contains(v.as_str()) => {}
                _ => return false,
            }
        }
    }
    true
}

fn decide_from_rule(rule: &Rule) -> Decision {
    if !rule.auto_snapshot {
        Decision::Exclude { reason: format!("rule '{}' has auto_snapshot=false", rule.name) }
    } else {
        Decision::Assign {
            rule_name: rule.name.clone(),
            policies: rule.policies.clone(),
            retention: rule.retention.clone(),
        }
    }
}

/// Evaluates `ruleset` for one volume, given any active exclusion on the
/// volume or its project. Exclusions are checked before rules — an
/// unexpired exclusion always wins regardless of rule priority.
pub fn evaluate(
    ruleset: &RuleSet,
    ctx: &VolumeContext,
    exclusion: Option<&Exclusion>,
    now: DateTime<Utc>,
) -> Decision {
    if let Some(excl) = exclusion {
        if excl.is_active(now) {
            return Decision::Exclude { reason: "active exclusion".to_string() };
        }
    }
    for rule in ruleset.rules() {
        if predicate_matches(&rule.match_predicate, ctx) {
            return decide_from_rule(rule);
        }
    }
    Decision::Unmatched
}

/// An existing Assignment tagged `source='operator'` is never overwritten by
/// a fresh policy pass.
pub fn should_preserve_existing(existing_source: &str) -> bool {
    existing_source == "operator"
}

/// Calendar gates a policy name against today's UTC date (§4.5 Stage C).
/// `daily_5` fires every day; `monthly_1st`/`monthly_15th` fire only on the
/// matching day-of-month. Unknown policy names fire every day, matching the
/// spec's framing of calendar gates as "extensible by adding rules".
pub fn calendar_gate_matches(policy_name: &str, today: DateTime<Utc>) -> bool {
    use chrono::Datelike;
    match policy_name {
        "monthly_1st" => today.day() == 1,
        "monthly_15th" => today.day() == 15,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::rules::RuleSet;
    use proptest::prelude::*;

    fn ctx(tenant: &str, size_gb: u32) -> VolumeContext {
        VolumeContext {
            volume_id: "vol-1".into(),
            volume_name: "data-disk".into(),
            tenant_name: tenant.into(),
            domain_name: "default".into(),
            size_gb,
            bootable: false,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn first_matching_rule_wins_over_later_broader_rule() {
        let doc = r#"[
            {"name":"specific","priority":1,"match":{"tenant_name":["acme"]},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":3}},
            {"name":"catch_all","priority":2,"match":{},"auto_snapshot":true,"policies":["monthly_1st"],"retention":{"monthly_1st":12}}
        ]"#;
        let set = RuleSet::parse(doc).unwrap();
        let decision = evaluate(&set, &ctx("acme", 10), None, Utc::now());
        match decision {
            Decision::Assign { rule_name, .. } => assert_eq!(rule_name, "specific"),
            other => panic!("expected Assign, got {other:?}"),
        }
    }

    #[test]
    fn no_matching_rule_is_unmatched() {
        let doc = r#"[{"name":"acme_only","priority":1,"match":{"tenant_name":["acme"]},"auto_snapshot":true,"policies":[],"retention":{}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        let decision = evaluate(&set, &ctx("other-tenant", 10), None, Utc::now());
        assert_eq!(decision, Decision::Unmatched);
    }

    #[test]
    fn auto_snapshot_false_excludes_the_volume() {
        let doc = r#"[{"name":"opt_out","priority":1,"match":{},"auto_snapshot":false,"policies":[],"retention":{}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        let decision = evaluate(&set, &ctx("acme", 10), None, Utc::now());
        assert!(matches!(decision, Decision::Exclude { .. }));
    }

    #[test]
    fn active_exclusion_beats_a_matching_rule() {
        let doc = r#"[{"name":"catch_all","priority":1,"match":{},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        let exclusion = Exclusion { expires_at: Some(Utc::now() + chrono::Duration::hours(1)) };
        let decision = evaluate(&set, &ctx("acme", 10), Some(&exclusion), Utc::now());
        assert!(matches!(decision, Decision::Exclude { .. }));
    }

    #[test]
    fn expired_exclusion_falls_through_to_rule_evaluation() {
        let doc = r#"[{"name":"catch_all","priority":1,"match":{},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        let exclusion = Exclusion { expires_at: Some(Utc::now() - chrono::Duration::hours(1)) };
        let decision = evaluate(&set, &ctx("acme", 10), Some(&exclusion), Utc::now());
        assert!(matches!(decision, Decision::Assign { .. }));
    }

    #[test]
    fn size_range_is_inclusive_at_both_boundaries() {
        let doc = r#"[{"name":"mid","priority":1,"match":{"size_gb":{"min":10,"max":20}},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}}]"#;
        let set = RuleSet::parse(doc).unwrap();
        assert!(matches!(evaluate(&set, &ctx("acme", 10), None, Utc::now()), Decision::Assign { .. }));
        assert!(matches!(evaluate(&set, &ctx("acme", 20), None, Utc::now()), Decision::Assign { .. }));
        assert_eq!(evaluate(&set, &ctx("acme", 21), None, Utc::now()), Decision::Unmatched);
    }

    #[test]
    fn calendar_gate_fires_monthly_1st_only_on_first() {
        let jan_1 = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc);
        let jan_2 = DateTime::parse_from_rfc3339("2026-01-02T00:00:00Z").unwrap().with_timezone(&Utc);
        assert!(calendar_gate_matches("monthly_1st", jan_1));
        assert!(!calendar_gate_matches("monthly_1st", jan_2));
    }

    #[test]
    fn calendar_gate_daily_5_fires_every_day() {
        let any_day = DateTime::parse_from_rfc3339("2026-03-17T00:00:00Z").unwrap().with_timezone(&Utc);
        assert!(calendar_gate_matches("daily_5", any_day));
    }

    proptest! {
        #[test]
        fn evaluation_is_deterministic_for_identical_inputs(size_gb in 0u32..1000, tenant_idx in 0usize..3) {
            let doc = r#"[
                {"name":"acme","priority":1,"match":{"tenant_name":["acme"]},"auto_snapshot":true,"policies":["daily_5"],"retention":{"daily_5":5}},
                {"name":"beta","priority":2,"match":{"tenant_name":["beta"]},"auto_snapshot":false,"policies":[],"retention":{}}
            ]"#;
            let set = RuleSet::parse(doc).unwrap();
            let tenants = ["acme", "beta", "gamma"];
            let context = ctx(tenants[tenant_idx], size_gb);
            let now = Utc::now();
            let first = evaluate(&set, &context, None, now);
            let second = evaluate(&set, &context, None, now);
            prop_assert_eq!(first, second);
        }
    }
}
