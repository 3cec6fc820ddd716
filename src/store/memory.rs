//! An in-memory [`JobStoreApi`] used by unit and integration tests so the
//! snapshot worker and restore engine can be exercised without a running
//! Postgres instance. It enforces the same invariants as
//! [`crate::store::postgres::PostgresJobStore`]: at most one restore per
//! `vm_id` in flight, at most one live on-demand trigger.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::domain::ports::{JobStoreApi, ProjectId, VmId, VolumeId};
use crate::error::{Error, Result};
use crate::store::models::{
    Assignment, OnDemandTrigger, RestoreJob, RestoreJobStatus, RestoreStep, RestoreStepStatus,
    RunFinalStatus, SnapshotRecord, SnapshotRun,
};

#[derive(Default)]
pub struct InMemoryJobStore {
    runs: DashMap<uuid::Uuid, SnapshotRun>,
    records: Mutex<Vec<SnapshotRecord>>,
    assignments: DashMap<VolumeId, Assignment>,
    jobs: DashMap<uuid::Uuid, RestoreJob>,
    steps: DashMap<uuid::Uuid, Vec<RestoreStep>>,
    triggers: Mutex<Vec<OnDemandTrigger>>,
    // Guards the vm_id uniqueness check + insert as one critical section,
    // mirroring what the Postgres partial unique index gives for free.
    insert_lock: Mutex<()>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStoreApi for InMemoryJobStore {
    async fn insert_snapshot_run(&self, run: &SnapshotRun) -> Result<uuid::Uuid> {
        self.runs.insert(run.id, run.clone());
        Ok(run.id)
    }

    async fn append_snapshot_record(&self, run_id: uuid::Uuid, record: &SnapshotRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        if let Some(mut run) = self.runs.get_mut(&run_id) {
            match record.action {
                crate::store::models::SnapshotAction::Created => run.created += 1,
                crate::store::models::SnapshotAction::Deleted => run.deleted += 1,
                crate::store::models::SnapshotAction::Failed => run.failed += 1,
                crate::store::models::SnapshotAction::Skipped => run.skipped += 1,
            }
        }
        Ok(())
    }

    async fn finalize_snapshot_run(
        &self,
        run_id: uuid::Uuid,
        final_status: Option<RunFinalStatus>,
    ) -> Result<RunFinalStatus> {
        let mut run = self
            .runs
            .get_mut(&run_id)
            .ok_or_else(|| Error::NotFound(format!("snapshot run {run_id}")))?;
        let status = final_status.unwrap_or_else(|| run.computed_final_status());
        run.status = status.into();
        run.finished_at = Some(Utc::now());
        Ok(status)
    }

    async fn has_snapshot_today(&self, volume_id: &VolumeId, policy_name: &str) -> Result<bool> {
        let today = Utc::now().date_naive();
        Ok(self.records.lock().iter().any(|r| {
            r.volume_id == *volume_id
                && r.policy_name == policy_name
                && r.created_at.date_naive() == today
                && matches!(r.action, crate::store::models::SnapshotAction::Created)
        }))
    }

    async fn write_assignments(&self, assignments: &[Assignment]) -> Result<()> {
        for a in assignments {
            if let Some(existing) = self.assignments.get(&a.volume_id) {
                if crate::policy::engine::should_preserve_existing(&existing.source) {
                    continue;
                }
            }
            self.assignments.insert(a.volume_id.clone(), a.clone());
        }
        Ok(())
    }

    async fn list_active_assignments(&self) -> Result<Vec<Assignment>> {
        Ok(self.assignments.iter().map(|e| e.clone()).collect())
    }

    async fn get_assignment(&self, volume_id: &VolumeId) -> Result<Option<Assignment>> {
        Ok(self.assignments.get(volume_id).map(|a| a.clone()))
    }

    async fn insert_restore_job(&self, job: &RestoreJob, steps: &[RestoreStep]) -> Result<uuid::Uuid> {
        let _guard = self.insert_lock.lock();
        let in_flight = self.jobs.iter().any(|entry| {
            entry.vm_id == job.vm_id && entry.status.is_in_flight()
        });
        if in_flight {
            return Err(Error::ConcurrentRestore { vm_id: job.vm_id.to_string() });
        }
        self.jobs.insert(job.id, job.clone());
        self.steps.insert(job.id, steps.to_vec());
        Ok(job.id)
    }

    async fn get_restore_job(&self, job_id: uuid::Uuid) -> Result<Option<RestoreJob>> {
        Ok(self.jobs.get(&job_id).map(|j| j.clone()))
    }

    async fn list_restore_jobs(&self, vm_id: Option<&VmId>) -> Result<Vec<RestoreJob>> {
        Ok(self
            .jobs
            .iter()
            .filter(|entry| vm_id.map(|v| v == &entry.vm_id).unwrap_or(true))
            .map(|entry| entry.clone())
            .collect())
    }

    async fn list_restore_steps(&self, job_id: uuid::Uuid) -> Result<Vec<RestoreStep>> {
        Ok(self.steps.get(&job_id).map(|s| s.clone()).unwrap_or_default())
    }

    async fn update_restore_job_status(
        &self,
        job_id: uuid::Uuid,
        status: RestoreJobStatus,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        let mut job = self
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| Error::NotFound(format!("restore job {job_id}")))?;
        job.status = status;
        if let Some(r) = result {
            job.result = Some(r);
        }
        let now = Utc::now();
        job.updated_at = now;
        job.last_heartbeat = now;
        Ok(())
    }

    async fn update_restore_step(
        &self,
        job_id: uuid::Uuid,
        ordinal: u32,
        status: RestoreStepStatus,
        detail: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        if let Some(mut steps) = self.steps.get_mut(&job_id) {
            if let Some(step) = steps.iter_mut().find(|s| s.ordinal == ordinal) {
                step.status = status;
                step.detail = detail;
                if status == RestoreStepStatus::Running && step.started_at.is_none() {
                    step.started_at = Some(now);
                }
                if matches!(
                    status,
                    RestoreStepStatus::Succeeded | RestoreStepStatus::Failed | RestoreStepStatus::Skipped
                ) {
                    step.finished_at = Some(now);
                }
            }
        }
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            job.last_heartbeat = now;
            job.updated_at = now;
        }
        Ok(())
    }

    async fn observe_cancellation(&self, job_id: uuid::Uuid) -> Result<bool> {
        Ok(self
            .jobs
            .get(&job_id)
            .map(|j| j.status == RestoreJobStatus::Canceled)
            .unwrap_or(false))
    }

    async fn request_cancellation(&self, job_id: uuid::Uuid) -> Result<()> {
        if let Some(mut job) = self.jobs.get_mut(&job_id) {
            if !job.status.is_terminal() {
                job.status = RestoreJobStatus::Canceled;
                job.updated_at = Utc::now();
            }
        }
        Ok(())
    }

    async fn insert_on_demand_trigger(&self, requested_by: &str) -> Result<uuid::Uuid> {
        let mut triggers = self.triggers.lock();
        if triggers.iter().any(|t| t.status == "pending" || t.status == "running") {
            return Err(Error::ConflictError(
                "a snapshot trigger is already pending or running".into(),
            ));
        }
        let trigger = OnDemandTrigger {
            id: uuid::Uuid::new_v4(),
            requested_by: requested_by.to_string(),
            status: "pending".to_string(),
            step_progress: serde_json::json!([]),
            created_at: Utc::now(),
        };
        let id = trigger.id;
        triggers.push(trigger);
        Ok(id)
    }

    async fn claim_next_on_demand_trigger(&self) -> Result<Option<OnDemandTrigger>> {
        let mut triggers = self.triggers.lock();
        if let Some(t) = triggers.iter_mut().find(|t| t.status == "pending") {
            t.status = "running".to_string();
            return Ok(Some(t.clone()));
        }
        Ok(None)
    }

    async fn update_trigger_progress(
        &self,
        trigger_id: uuid::Uuid,
        step_progress: serde_json::Value,
    ) -> Result<()> {
        if let Some(t) = self.triggers.lock().iter_mut().find(|t| t.id == trigger_id) {
            t.step_progress = step_progress;
        }
        Ok(())
    }

    async fn finish_trigger(&self, trigger_id: uuid::Uuid, status: &str) -> Result<()> {
        if let Some(t) = self.triggers.lock().iter_mut().find(|t| t.id == trigger_id) {
            t.status = status.to_string();
        }
        Ok(())
    }

    async fn latest_trigger(&self) -> Result<Option<OnDemandTrigger>> {
        Ok(self.triggers.lock().last().cloned())
    }

    async fn recover_stale_jobs(&self) -> Result<u64> {
        let mut count = 0;
        for mut job in self.jobs.iter_mut() {
            if job.status.is_in_flight() {
                job.status = RestoreJobStatus::Interrupted;
                count += 1;
            }
        }
        for t in self.triggers.lock().iter_mut() {
            if t.status == "running" {
                t.status = "failed".to_string();
            }
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::models::{IpStrategy, RestoreMode};

    fn sample_job(vm_id: &str) -> RestoreJob {
        let now = Utc::now();
        RestoreJob {
            id: uuid::Uuid::new_v4(),
            vm_id: vm_id.into(),
            snapshot_id: "snap-1".into(),
            project_id: "proj-1".into(),
            mode: RestoreMode::New,
            ip_strategy: IpStrategy::NewIps,
            manual_ips: None,
            cleanup_old_storage: false,
            delete_source_snapshot: false,
            security_group_ids: vec![],
            status: RestoreJobStatus::Pending,
            plan: serde_json::json!({}),
            result: None,
            requested_by: "tester".into(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn second_concurrent_restore_is_rejected() {
        let store = InMemoryJobStore::new();
        store.insert_restore_job(&sample_job("vm-a"), &[]).await.unwrap();
        let err = store.insert_restore_job(&sample_job("vm-a"), &[]).await.unwrap_err();
        assert!(matches!(err, Error::ConcurrentRestore { .. }));
    }

    #[tokio::test]
    async fn restore_allowed_again_once_terminal() {
        let store = InMemoryJobStore::new();
        let job = sample_job("vm-a");
        let id = store.insert_restore_job(&job, &[]).await.unwrap();
        store
            .update_restore_job_status(id, RestoreJobStatus::Succeeded, None)
            .await
            .unwrap();
        store.insert_restore_job(&sample_job("vm-a"), &[]).await.unwrap();
    }

    #[tokio::test]
    async fn only_one_live_trigger_at_a_time() {
        let store = InMemoryJobStore::new();
        store.insert_on_demand_trigger("alice").await.unwrap();
        let err = store.insert_on_demand_trigger("bob").await.unwrap_err();
        assert!(matches!(err, Error::ConflictError(_)));
    }
}
