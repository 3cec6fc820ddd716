//! End-to-end checks that exercise the job store, policy engine, and
//! on-demand trigger lifecycle together, the way a single worker pass
//! would use them, without standing up a real cloud or database.

use std::collections::HashMap;

use snapstor_core::domain::ports::{JobStoreApi, VolumeInfo};
use snapstor_core::policy::rules::RuleSet;
use snapstor_core::snapshot::stages;
use snapstor_core::store::InMemoryJobStore;

fn volume(id: &str, tenant: &str, size_gb: u32, bootable: bool) -> VolumeInfo {
    VolumeInfo {
        id: id.into(),
        project_id: "proj-1".into(),
        name: format!("{id}-name"),
        tenant_name: tenant.into(),
        domain_name: "default".into(),
        attached_server_name: None,
        size_gb,
        status: "available".into(),
        bootable,
        metadata: HashMap::new(),
    }
}

const RULES: &str = r#"
[
    {
        "name": "prod-boot-volumes",
        "priority": 1,
        "match": { "tenant_name": ["prod"], "bootable": true },
        "auto_snapshot": true,
        "policies": ["daily"],
        "retention": { "daily": 7 }
    },
    {
        "name": "opt-out-tiny-volumes",
        "priority": 2,
        "match": { "size_gb": { "max": 5 } },
        "auto_snapshot": false,
        "policies": [],
        "retention": {}
    }
]
"#;

#[tokio::test]
async fn policy_assignment_writes_matching_volumes_and_tallies_the_rest() {
    let store = InMemoryJobStore::new();
    let ruleset = RuleSet::parse(RULES).unwrap();
    let inventory = vec![
        volume("vol-prod-boot", "prod", 40, true),
        volume("vol-tiny", "dev", 2, false),
        volume("vol-unmatched", "dev", 80, false),
    ];

    let tally = stages::run_policy_assignment(&store, &ruleset, &inventory, chrono::Utc::now()).await.unwrap();
    assert_eq!(tally.assigned, 1);
    assert_eq!(tally.excluded, 1);
    assert_eq!(tally.unmatched, 1);

    let assignments = store.list_active_assignments().await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].volume_id.to_string(), "vol-prod-boot");
    assert_eq!(assignments[0].rule_name, "prod-boot-volumes");
    assert_eq!(assignments[0].retention.get("daily"), Some(&7));
}

#[tokio::test]
async fn operator_assignment_survives_a_fresh_policy_pass() {
    let store = InMemoryJobStore::new();
    let ruleset = RuleSet::parse(RULES).unwrap();

    let operator_row = snapstor_core::store::models::Assignment {
        volume_id: "vol-prod-boot".into(),
        project_id: "proj-1".into(),
        rule_name: "operator-override".into(),
        policies: vec!["weekly".into()],
        retention: HashMap::from([("weekly".to_string(), 4)]),
        source: "operator".into(),
        updated_at: chrono::Utc::now(),
    };
    store.write_assignments(&[operator_row]).await.unwrap();

    let inventory = vec![volume("vol-prod-boot", "prod", 40, true)];
    stages::run_policy_assignment(&store, &ruleset, &inventory, chrono::Utc::now()).await.unwrap();

    let assignments = store.list_active_assignments().await.unwrap();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].rule_name, "operator-override");
    assert_eq!(assignments[0].source, "operator");
}

#[tokio::test]
async fn on_demand_trigger_lifecycle_rejects_a_second_pending_trigger() {
    let store = InMemoryJobStore::new();
    let trigger_id = store.insert_on_demand_trigger("alice").await.unwrap();

    let conflict = store.insert_on_demand_trigger("bob").await;
    assert!(conflict.is_err());

    let claimed = store.claim_next_on_demand_trigger().await.unwrap().unwrap();
    assert_eq!(claimed.id, trigger_id);
    assert!(store.claim_next_on_demand_trigger().await.unwrap().is_none());

    store.finish_trigger(trigger_id, "completed").await.unwrap();
    let latest = store.latest_trigger().await.unwrap().unwrap();
    assert_eq!(latest.status, "completed");

    let second = store.insert_on_demand_trigger("carol").await.unwrap();
    assert_ne!(second, trigger_id);
}
