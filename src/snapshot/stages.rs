//! Pipeline stages run once per worker iteration (§4.5). Kept as functions
//! over explicit inputs — ruleset, inventory, assignments — rather than
//! methods on the worker, so each stage is exercisable without a live cloud
//! or store: classify candidates first, then act on the classification in
//! its own pass.

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::domain::ports::{CloudApi, ProjectSession, Session, SessionProviderApi, StorageApi, VolumeInfo};
use crate::domain::DomainEvent;
use crate::domain::EventPublisher;
use crate::error::{Error, Result};
use crate::policy::engine::{self, Decision, VolumeContext};
use crate::policy::rules::RuleSet;
use crate::store::models::{Assignment, SnapshotAction, SnapshotRecord};
use crate::store::JobStoreApi;

pub const ASSIGNMENT_CHUNK_SIZE: usize = 500;
const PER_PROJECT_CONCURRENCY: usize = 8;
const STALE_WATERMARK: chrono::Duration = chrono::Duration::hours(1);

/// Outcome tally for a stage, logged and folded into the [`SnapshotRun`]
/// counters by the caller.
#[derive(Debug, Default, Clone, Copy)]
pub struct AssignmentTally {
    pub assigned: u32,
    pub excluded: u32,
    pub unmatched: u32,
}

/// Stage A: evaluate every volume in `inventory` against `ruleset` and
/// persist the resulting [`Assignment`]s in chunks of 500, each chunk one
/// atomic write (§4.5 Stage A). Exclusions and unmatched volumes are
/// tallied but never written — there's nothing to record for them beyond
/// the count.
pub async fn run_policy_assignment(
    store: &dyn JobStoreApi,
    ruleset: &RuleSet,
    inventory: &[VolumeInfo],
    now: DateTime<Utc>,
) -> Result<AssignmentTally> {
    let mut tally = AssignmentTally::default();
    let mut chunk = Vec::with_capacity(ASSIGNMENT_CHUNK_SIZE);

    for volume in inventory {
        let ctx = VolumeContext {
            volume_id: volume.id.to_string(),
            volume_name: volume.name.clone(),
            tenant_name: volume.tenant_name.clone(),
            domain_name: volume.domain_name.clone(),
            size_gb: volume.size_gb,
            bootable: volume.bootable,
            metadata: volume.metadata.clone(),
        };
        match engine::evaluate(ruleset, &ctx, None, now) {
            Decision::Assign { rule_name, policies, retention } => {
                tally.assigned += 1;
                chunk.push(Assignment {
                    volume_id: volume.id.clone(),
                    project_id: volume.project_id.clone(),
                    rule_name,
                    policies,
                    retention,
                    source: "policy".to_string(),
                    updated_at: now,
                });
            }
            Decision::Exclude { .. } => tally.excluded += 1,
            Decision::Unmatched => tally.unmatched += 1,
        }
        if chunk.len() >= ASSIGNMENT_CHUNK_SIZE {
            store.write_assignments(&chunk).await?;
            chunk.clear();
        }
    }
    if !chunk.is_empty() {
        store.write_assignments(&chunk).await?;
    }
    info!(assigned = tally.assigned, excluded = tally.excluded, unmatched = tally.unmatched, "stage A policy assignment complete");
    Ok(tally)
}

/// Stage B: a non-blocking inventory-freshness check. `previous` is the
/// watermark left by the last successful inventory fetch; if it's more
/// than an hour old the run refuses to start (the external inventory
/// collector this depends on has likely stalled). Returns the new
/// watermark to store for the next call.
pub fn observe_inventory_sync(previous: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    if let Some(prev) = previous {
        if now - prev > STALE_WATERMARK {
            return Err(Error::Internal(format!(
                "inventory watermark stale since {prev} (> 1h); refusing to start the snapshot pass"
            )));
        }
    }
    Ok(now)
}

fn slug(input: &str) -> String {
    let mut out = String::new();
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    let trimmed = out.trim_matches('-');
    if trimmed.is_empty() {
        "x".to_string()
    } else {
        trimmed.to_string()
    }
}

fn snapshot_name(tenant: &str, policy: &str, server: Option<&str>, volume: &str, now: DateTime<Utc>) -> String {
    format!(
        "auto-{}-{}-{}-{}-{}",
        slug(tenant),
        slug(policy),
        slug(server.unwrap_or("unattached")),
        slug(volume),
        now.format("%Y%m%dT%H%M%SZ")
    )
}

/// A volume paired with the Assignment that routed it to Stage C.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub volume: VolumeInfo,
    pub assignment: Assignment,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CreationTally {
    pub created: u32,
    pub skipped: u32,
    pub failed: u32,
}

/// Stage C: for every `(volume, policy)` pair in `candidates`, apply the
/// size cap, calendar gate, and daily dedup check, then call
/// `create_snapshot`. Volumes are grouped by project so the session
/// provider grants its per-project role at most once per group; within a
/// group up to 8 `(volume, policy)` pairs run concurrently.
pub async fn run_snapshot_creation(
    cloud: &dyn CloudApi,
    session_provider: &dyn SessionProviderApi,
    store: &dyn JobStoreApi,
    events: &dyn EventPublisher,
    run_id: Uuid,
    max_size_gb: u32,
    dry_run: bool,
    candidates: Vec<Candidate>,
) -> Result<CreationTally> {
    let mut by_project: HashMap<String, Vec<Candidate>> = HashMap::new();
    for c in candidates {
        by_project.entry(c.volume.project_id.to_string()).or_default().push(c);
    }

    let mut tally = CreationTally::default();
    for (project_id, group) in by_project {
        let session = match session_provider.get_project_session(&project_id.clone().into()).await {
            Ok(ProjectSession::Scoped(s)) => s,
            Ok(ProjectSession::Fallback { admin_session, reason }) => {
                warn!(project_id, reason, "falling back to admin session for snapshot creation");
                events
                    .publish(DomainEvent::SessionGrantDegraded {
                        project_id: project_id.clone().into(),
                        reason,
                        timestamp: Utc::now(),
                    })
                    .await;
                admin_session
            }
            Err(e) => {
                warn!(project_id, error = %e, "could not obtain a session for project; skipping its volumes this pass");
                tally.skipped += group.iter().map(|c| c.assignment.policies.len() as u32).sum::<u32>();
                continue;
            }
        };

        let mut pairs: Vec<(VolumeInfo, String)> = Vec::new();
        for c in &group {
            for policy_name in &c.assignment.policies {
                pairs.push((c.volume.clone(), policy_name.clone()));
            }
        }

        let session = Arc::new(session);
        let outcomes: Vec<SnapshotRecord> = stream::iter(pairs)
            .map(|(volume, policy_name)| {
                let session = Arc::clone(&session);
                async move {
                    snapshot_one(cloud, store, &session, run_id, max_size_gb, dry_run, &volume, &policy_name, Utc::now()).await
                }
            })
            .buffer_unordered(PER_PROJECT_CONCURRENCY)
            .collect()
            .await;

        for record in outcomes {
            match record.action {
                SnapshotAction::Created => {
                    tally.created += 1;
                    events
                        .publish(DomainEvent::SnapshotCreated {
                            run_id,
                            volume_id: record.volume_id.clone(),
                            policy_name: record.policy_name.clone(),
                            remote_snapshot_id: record.remote_snapshot_id.clone().unwrap_or_default().into(),
                            timestamp: record.created_at,
                        })
                        .await;
                }
                SnapshotAction::Skipped => {
                    tally.skipped += 1;
                    events
                        .publish(DomainEvent::SnapshotSkipped {
                            run_id,
                            volume_id: record.volume_id.clone(),
                            policy_name: record.policy_name.clone(),
                            reason: record.reason.clone().unwrap_or_default(),
                            timestamp: record.created_at,
                        })
                        .await;
                }
                SnapshotAction::Failed => {
                    tally.failed += 1;
                    events
                        .publish(DomainEvent::SnapshotFailed {
                            run_id,
                            volume_id: record.volume_id.clone(),
                            policy_name: record.policy_name.clone(),
                            reason: record.reason.clone().unwrap_or_default(),
                            timestamp: record.created_at,
                        })
                        .await;
                }
                SnapshotAction::Deleted => {}
            }
            store.append_snapshot_record(run_id, &record).await?;
        }
    }
    Ok(tally)
}

#[allow(clippy::too_many_arguments)]
async fn snapshot_one(
    cloud: &dyn CloudApi,
    store: &dyn JobStoreApi,
    session: &Session,
    run_id: Uuid,
    max_size_gb: u32,
    dry_run: bool,
    volume: &VolumeInfo,
    policy_name: &str,
    now: DateTime<Utc>,
) -> SnapshotRecord {
    let base = |action, remote_id, reason| SnapshotRecord {
        run_id,
        volume_id: volume.id.clone(),
        policy_name: policy_name.to_string(),
        action,
        remote_snapshot_id: remote_id,
        reason,
        created_at: now,
    };

    if volume.size_gb > max_size_gb {
        return base(SnapshotAction::Skipped, None, Some("oversized".to_string()));
    }
    if !engine::calendar_gate_matches(policy_name, now) {
        return base(SnapshotAction::Skipped, None, Some("not_scheduled".to_string()));
    }
    match store.has_snapshot_today(&volume.id, policy_name).await {
        Ok(true) => return base(SnapshotAction::Skipped, None, Some("already_today".to_string())),
        Ok(false) => {}
        Err(e) => return base(SnapshotAction::Failed, None, Some(e.to_string())),
    }

    let name = snapshot_name(&volume.tenant_name, policy_name, volume.attached_server_name.as_deref(), &volume.name, now);
    let mut metadata = HashMap::new();
    metadata.insert("created_by".to_string(), "auto".to_string());
    metadata.insert("policy".to_string(), policy_name.to_string());

    let scoped = Session { dry_run, ..session.clone() };
    match cloud.create_snapshot(&scoped, &volume.id, &name, &metadata).await {
        Ok(remote_id) => base(SnapshotAction::Created, Some(remote_id.to_string()), None),
        Err(Error::SizeRejected(msg)) => base(SnapshotAction::Skipped, None, Some(format!("size_rejected: {msg}"))),
        Err(e) => base(SnapshotAction::Failed, None, Some(e.to_string())),
    }
}

/// Stage D: for every distinct `(volume_id, policy_name)` pair in
/// `touched`, list snapshots matching `created_by=auto ∧ policy=<name>`,
/// sort newest-first, and delete everything past `retention`. Runs after
/// Stage C so the snapshot just created is already in the list the
/// retention budget is computed over (§9 "Retention-after-creation").
pub async fn run_retention_pruning(
    cloud: &dyn CloudApi,
    store: &dyn JobStoreApi,
    events: &dyn EventPublisher,
    session: &Session,
    run_id: Uuid,
    touched: &[(crate::domain::ports::VolumeId, String, u32)],
) -> Result<u32> {
    let mut deleted = 0u32;
    for (volume_id, policy_name, retention) in touched {
        let mut metadata = HashMap::new();
        metadata.insert("created_by".to_string(), "auto".to_string());
        metadata.insert("policy".to_string(), policy_name.clone());
        let mut snapshots = cloud.list_snapshots(session, Some(volume_id), &metadata).await?;
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        for stale in snapshots.into_iter().skip(*retention as usize) {
            match cloud.delete_snapshot(session, &stale.id).await {
                Ok(()) => {
                    deleted += 1;
                    store
                        .append_snapshot_record(
                            run_id,
                            &SnapshotRecord {
                                run_id,
                                volume_id: volume_id.clone(),
                                policy_name: policy_name.clone(),
                                action: SnapshotAction::Deleted,
                                remote_snapshot_id: Some(stale.id.to_string()),
                                reason: Some("retention".to_string()),
                                created_at: Utc::now(),
                            },
                        )
                        .await
                        .ok();
                    events
                        .publish(DomainEvent::SnapshotPruned {
                            volume_id: volume_id.clone(),
                            policy_name: policy_name.clone(),
                            remote_snapshot_id: stale.id,
                            timestamp: Utc::now(),
                        })
                        .await;
                }
                Err(e) => warn!(volume_id = %volume_id, policy_name, error = %e, "retention prune delete failed"),
            }
        }
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_watermark_is_accepted() {
        let now = Utc::now();
        let prev = now - chrono::Duration::minutes(10);
        assert!(observe_inventory_sync(Some(prev), now).is_ok());
    }

    #[test]
    fn stale_watermark_refuses_the_run() {
        let now = Utc::now();
        let prev = now - chrono::Duration::hours(2);
        assert!(observe_inventory_sync(Some(prev), now).is_err());
    }

    #[test]
    fn no_previous_watermark_is_always_fresh() {
        assert!(observe_inventory_sync(None, Utc::now()).is_ok());
    }

    #[test]
    fn snapshot_name_follows_the_naming_convention() {
        let now = DateTime::parse_from_rfc3339("2026-08-01T12:30:00Z").unwrap().with_timezone(&Utc);
        let name = snapshot_name("Acme Corp", "daily_5", Some("web-01"), "boot-disk", now);
        assert_eq!(name, "auto-acme-corp-daily-5-web-01-boot-disk-20260801T123000Z");
    }

    #[test]
    fn unattached_volume_uses_the_unattached_slug() {
        let now = Utc::now();
        let name = snapshot_name("acme", "daily_5", None, "data", now);
        assert!(name.contains("-unattached-"));
    }

    #[test]
    fn slug_never_produces_consecutive_dashes() {
        assert_eq!(slug("My Volume!!  Name"), "my-volume-name");
    }
}
