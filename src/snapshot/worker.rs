//! The scheduler loop (§4.5 "Main loop"): on-demand triggers are polled
//! every ten seconds, policy assignment runs on its own interval, and the
//! snapshot-creation + retention pass runs on a separate one, each tracked
//! against its own `Instant`-based deadline so a slow sweep never starves
//! the fast poll tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::domain::events::DomainEvent;
use crate::domain::ports::{CloudApi, EventPublisher, SessionProviderApi};
use crate::error::Result;
use crate::policy::rules::RuleSet;
use crate::snapshot::stages::{self, Candidate};
use crate::store::models::{RunFinalStatus, RunType, SnapshotRun};
use crate::store::JobStoreApi;

const TRIGGER_POLL_INTERVAL: Duration = Duration::from_secs(10);

pub struct SnapshotWorker {
    cloud: Arc<dyn CloudApi>,
    session_provider: Arc<dyn SessionProviderApi>,
    store: Arc<dyn JobStoreApi>,
    events: Arc<dyn EventPublisher>,
    rules_path: String,
    policy_interval: Duration,
    snapshot_interval: Duration,
    max_size_gb: u32,
    dry_run: bool,
}

impl SnapshotWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        session_provider: Arc<dyn SessionProviderApi>,
        store: Arc<dyn JobStoreApi>,
        events: Arc<dyn EventPublisher>,
        rules_path: String,
        policy_interval: Duration,
        snapshot_interval: Duration,
        max_size_gb: u32,
        dry_run: bool,
    ) -> Self {
        Self {
            cloud,
            session_provider,
            store,
            events,
            rules_path,
            policy_interval,
            snapshot_interval,
            max_size_gb,
            dry_run,
        }
    }

    /// Runs until a rule-load or session-provider-startup error surfaces, at
    /// which point it returns `Err` so the caller can exit the process and
    /// let the supervisor restart it. Per-volume failures inside a stage
    /// never reach this far — they're recorded as `failed` snapshot records
    /// instead.
    pub async fn run_forever(&self) -> Result<()> {
        let recovered = self.store.recover_stale_jobs().await?;
        if recovered > 0 {
            info!(recovered, "recovered jobs interrupted by a previous process exit");
        }

        let mut last_policy_run: Option<Instant> = None;
        let mut last_snapshot_run: Option<Instant> = None;
        let mut last_watermark: Option<DateTime<Utc>> = None;

        loop {
            if let Some(trigger) = self.store.claim_next_on_demand_trigger().await? {
                info!(trigger_id = %trigger.id, requested_by = %trigger.requested_by, "claimed on-demand snapshot trigger");
                self.events
                    .publish(DomainEvent::OnDemandTriggerClaimed { trigger_id: trigger.id, timestamp: Utc::now() })
                    .await;
                let outcome = self.run_pipeline(RunType::OnDemand, &mut last_watermark, Some(trigger.id)).await;
                let status = match &outcome {
                    Ok(status) => status.to_string_lossy(),
                    Err(e) => {
                        warn!(trigger_id = %trigger.id, error = %e, "on-demand snapshot pass failed");
                        "failed".to_string()
                    }
                };
                self.store.finish_trigger(trigger.id, &status).await?;
                self.events
                    .publish(DomainEvent::OnDemandTriggerFinished { trigger_id: trigger.id, status, timestamp: Utc::now() })
                    .await;
            }

            let now = Instant::now();
            let policy_due = last_policy_run.map(|t| now.duration_since(t) >= self.policy_interval).unwrap_or(true);
            if policy_due {
                self.run_policy_stage().await?;
                last_policy_run = Some(now);
            }

            let snapshot_due =
                last_snapshot_run.map(|t| now.duration_since(t) >= self.snapshot_interval).unwrap_or(true);
            if snapshot_due {
                if let Err(e) = self.run_pipeline(RunType::Scheduled, &mut last_watermark, None).await {
                    error!(error = %e, "scheduled snapshot pass failed");
                }
                last_snapshot_run = Some(now);
            }

            tokio::time::sleep(TRIGGER_POLL_INTERVAL).await;
        }
    }

    /// Stage A on its own cadence: reloads the rule document from disk so an
    /// operator edit takes effect without a restart (§6.3).
    async fn run_policy_stage(&self) -> Result<()> {
        let doc = tokio::fs::read_to_string(&self.rules_path).await?;
        let ruleset = RuleSet::parse(&doc)?;
        let admin = self.session_provider.get_admin_session().await?;
        let inventory = self.cloud.list_volumes(&admin, None).await?;
        stages::run_policy_assignment(self.store.as_ref(), &ruleset, &inventory, Utc::now()).await?;
        Ok(())
    }

    /// Stages B, C, and D for one pass, wrapped in a [`SnapshotRun`] row so
    /// operators can see it in run history even when Stage B refuses to
    /// start.
    async fn run_pipeline(
        &self,
        run_type: RunType,
        last_watermark: &mut Option<DateTime<Utc>>,
        trigger_id: Option<Uuid>,
    ) -> Result<RunFinalStatus> {
        let now = Utc::now();
        let watermark = match stages::observe_inventory_sync(*last_watermark, now) {
            Ok(wm) => wm,
            Err(e) => {
                warn!(error = %e, "stage B refused to start the snapshot pass");
                let run = SnapshotRun::new(run_type, self.dry_run);
                self.store.insert_snapshot_run(&run).await?;
                return self.store.finalize_snapshot_run(run.id, Some(RunFinalStatus::Failed)).await;
            }
        };

        let run = SnapshotRun::new(run_type, self.dry_run);
        let run_id = self.store.insert_snapshot_run(&run).await?;
        self.events
            .publish(DomainEvent::SnapshotRunStarted { run_id, run_type: run_type.to_string(), timestamp: now })
            .await;
        if let Some(tid) = trigger_id {
            self.store.update_trigger_progress(tid, serde_json::json!({"stage": "collecting_inventory"})).await?;
        }

        let admin = self.session_provider.get_admin_session().await?;
        let assignments = self.store.list_active_assignments().await?;

        let mut candidates = Vec::with_capacity(assignments.len());
        let mut touched = Vec::new();
        for assignment in &assignments {
            match self.cloud.get_volume(&admin, &assignment.volume_id).await {
                Ok(Some(volume)) => candidates.push(Candidate { volume, assignment: assignment.clone() }),
                Ok(None) => warn!(volume_id = %assignment.volume_id, "assigned volume no longer exists; skipping"),
                Err(e) => warn!(volume_id = %assignment.volume_id, error = %e, "could not fetch assigned volume"),
            }
            for policy_name in &assignment.policies {
                let retention = *assignment.retention.get(policy_name).unwrap_or(&0);
                touched.push((assignment.volume_id.clone(), policy_name.clone(), retention));
            }
        }

        if let Some(tid) = trigger_id {
            self.store.update_trigger_progress(tid, serde_json::json!({"stage": "creating_snapshots"})).await?;
        }
        let creation = stages::run_snapshot_creation(
            self.cloud.as_ref(),
            self.session_provider.as_ref(),
            self.store.as_ref(),
            self.events.as_ref(),
            run_id,
            self.max_size_gb,
            self.dry_run,
            candidates,
        )
        .await?;

        if let Some(tid) = trigger_id {
            self.store.update_trigger_progress(tid, serde_json::json!({"stage": "pruning_retention"})).await?;
        }
        let deleted = stages::run_retention_pruning(self.cloud.as_ref(), self.store.as_ref(), self.events.as_ref(), &admin, run_id, &touched)
            .await?;

        *last_watermark = Some(watermark);
        let status = self.store.finalize_snapshot_run(run_id, None).await?;
        self.events
            .publish(DomainEvent::SnapshotRunFinished {
                run_id,
                status: status.to_string_lossy(),
                created: creation.created,
                deleted,
                failed: creation.failed,
                skipped: creation.skipped,
                timestamp: Utc::now(),
            })
            .await;
        info!(%run_id, ?status, created = creation.created, deleted, failed = creation.failed, skipped = creation.skipped, "snapshot pass finished");
        Ok(status)
    }
}

trait RunFinalStatusExt {
    fn to_string_lossy(&self) -> String;
}

impl RunFinalStatusExt for RunFinalStatus {
    fn to_string_lossy(&self) -> String {
        crate::store::models::RunStatus::from(*self).to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_final_status_stringifies_to_the_run_status_text() {
        assert_eq!(RunFinalStatus::Partial.to_string_lossy(), "partial");
    }
}
