//! Drives a `RestoreJob` through its step list (§4.6.2): a plan-supplied
//! step list executed in order with rollback, retry-from-failed-step, and
//! manual cleanup.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::domain::events::DomainEvent;
use crate::domain::ports::{CloudApi, EventPublisher, SessionProviderApi};
use crate::error::{Error, Result};
use crate::restore::planner;
use crate::restore::steps::{self, ExecutionState, StepContext};
use crate::restore::types::{PlanDocument, PlanRequest};
use crate::store::models::{RestoreJob, RestoreJobStatus, RestoreStep, RestoreStepStatus, StepKind};
use crate::store::JobStoreApi;

pub struct RestoreEngine {
    cloud: Arc<dyn CloudApi>,
    session_provider: Arc<dyn SessionProviderApi>,
    store: Arc<dyn JobStoreApi>,
    events: Arc<dyn EventPublisher>,
    cleanup_volumes: bool,
}

impl RestoreEngine {
    pub fn new(
        cloud: Arc<dyn CloudApi>,
        session_provider: Arc<dyn SessionProviderApi>,
        store: Arc<dyn JobStoreApi>,
        events: Arc<dyn EventPublisher>,
        cleanup_volumes: bool,
    ) -> Self {
        Self { cloud, session_provider, store, events, cleanup_volumes }
    }

    pub async fn plan(&self, req: PlanRequest) -> Result<RestoreJob> {
        let admin_session = self.session_provider.get_admin_session().await?;
        let (job, steps, _doc) = planner::build_plan(self.cloud.as_ref(), &admin_session, &req).await?;
        self.store.insert_restore_job(&job, &steps).await?;
        self.events
            .publish(DomainEvent::RestorePlanned { job_id: job.id, vm_id: job.vm_id.clone(), step_count: steps.len(), timestamp: Utc::now() })
            .await;
        Ok(job)
    }

    /// Validates confirmation and kicks off the background execution task;
    /// returns immediately (§6.1 `execute` is asynchronous — `202 Accepted`).
    pub fn execute(self: &Arc<Self>, job_id: Uuid, confirm_destructive: Option<String>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = engine.run_from_planned(job_id, confirm_destructive).await {
                tracing::error!(%job_id, error = %e, "restore execution failed to start");
            }
        });
    }

    async fn run_from_planned(&self, job_id: Uuid, confirm_destructive: Option<String>) -> Result<()> {
        let job = self
            .store
            .get_restore_job(job_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("restore job {job_id} not found")))?;
        if job.status != RestoreJobStatus::Planned {
            return Err(Error::Internal(format!("restore job {job_id} is not PLANNED")));
        }

        let plan: PlanDocument = serde_json::from_value(job.plan.clone()).map_err(|e| Error::Internal(e.to_string()))?;
        if job.mode == crate::store::models::RestoreMode::Replace {
            let expected = format!("DELETE AND RESTORE {}", plan.original_vm_name);
            if confirm_destructive.as_deref() != Some(expected.as_str()) {
                return Err(Error::ConfirmationRequired { expected });
            }
        }

        self.transition_job(job_id, RestoreJobStatus::Pending, None).await?;
        self.transition_job(job_id, RestoreJobStatus::Running, None).await?;

        let steps = self.store.list_restore_steps(job_id).await?;
        let mut state = ExecutionState::default();
        self.run_steps(&job, &plan, &steps, &mut state).await
    }

    async fn run_steps(&self, job: &RestoreJob, plan: &PlanDocument, steps: &[RestoreStep], state: &mut ExecutionState) -> Result<()> {
        let ctx = StepContext {
            cloud: self.cloud.as_ref(),
            session_provider: self.session_provider.as_ref(),
            plan,
            cleanup_old_storage_volumes: self.cleanup_volumes,
        };

        for step in steps.iter().filter(|s| s.status != RestoreStepStatus::Succeeded) {
            if self.store.observe_cancellation(job.id).await? {
                self.store.update_restore_step(job.id, step.ordinal, RestoreStepStatus::Skipped, serde_json::json!({})).await?;
                let rollback_detail = steps::rollback(&ctx, state).await;
                self.transition_job(job.id, RestoreJobStatus::Canceled, Some(rollback_detail)).await?;
                return Ok(());
            }

            self.store.update_restore_step(job.id, step.ordinal, RestoreStepStatus::Running, serde_json::json!({})).await?;
            self.bump_heartbeat(job.id).await;

            let outcome = self.invoke(step.kind, &ctx, state).await;
            match outcome {
                Ok(detail) => {
                    self.store.update_restore_step(job.id, step.ordinal, RestoreStepStatus::Succeeded, detail).await?;
                    self.bump_heartbeat(job.id).await;
                    self.events
                        .publish(DomainEvent::RestoreStepTransitioned {
                            job_id: job.id,
                            ordinal: step.ordinal,
                            kind: step.kind.to_string(),
                            status: "SUCCEEDED".into(),
                            timestamp: Utc::now(),
                        })
                        .await;
                }
                Err(e) => {
                    let detail = serde_json::json!({ "error": e.to_string(), "kind": e.kind() });
                    self.store.update_restore_step(job.id, step.ordinal, RestoreStepStatus::Failed, detail).await?;
                    let rollback_detail = steps::rollback(&ctx, state).await;
                    self.transition_job(
                        job.id,
                        RestoreJobStatus::Failed,
                        Some(serde_json::json!({ "error": e.to_string(), "kind": e.kind(), "rollback": rollback_detail })),
                    )
                    .await?;
                    return Ok(());
                }
            }
        }

        self.transition_job(job.id, RestoreJobStatus::Succeeded, None).await
    }

    async fn invoke(&self, kind: StepKind, ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
        match kind {
            StepKind::ValidateLiveState => steps::validate_live_state(ctx, state).await,
            StepKind::EnsureServiceUser => steps::ensure_service_user(ctx, state).await,
            StepKind::QuotaCheck => steps::quota_check(ctx, state).await,
            StepKind::DeleteExistingVm => steps::delete_existing_vm(ctx, state).await,
            StepKind::WaitVmDeleted => steps::wait_vm_deleted(ctx, state).await,
            StepKind::CleanupOldPorts => steps::cleanup_old_ports(ctx, state).await,
            StepKind::CreateVolumeFromSnapshot => steps::create_volume_from_snapshot(ctx, state).await,
            StepKind::WaitVolumeAvailable => steps::wait_volume_available(ctx, state).await,
            StepKind::CreatePorts => steps::create_ports(ctx, state).await,
            StepKind::CreateServer => steps::create_server(ctx, state).await,
            StepKind::WaitServerActive => steps::wait_server_active(ctx, state).await,
            StepKind::Finalize => steps::finalize(ctx, state),
            StepKind::CleanupOldStorage => steps::cleanup_old_storage(ctx, state).await,
        }
    }

    async fn transition_job(&self, job_id: Uuid, status: RestoreJobStatus, result: Option<serde_json::Value>) -> Result<()> {
        self.store.update_restore_job_status(job_id, status, result).await?;
        self.events
            .publish(DomainEvent::RestoreJobTransitioned { job_id, from: String::new(), to: status.to_string(), reason: None, timestamp: Utc::now() })
            .await;
        Ok(())
    }

    async fn bump_heartbeat(&self, job_id: Uuid) {
        // `update_restore_job_status` with the job's current status is the
        // store's heartbeat-bump path; a no-op status change still updates
        // `last_heartbeat` per the postgres adapter's `UPDATE ... SET
        // last_heartbeat = now()` clause.
        if let Ok(Some(job)) = self.store.get_restore_job(job_id).await {
            let _ = self.store.update_restore_job_status(job_id, job.status, job.result).await;
        }
    }

    pub async fn cancel(&self, job_id: Uuid) -> Result<()> {
        self.store.request_cancellation(job_id).await
    }

    /// §4.6.2 retry-from-failed-step: builds a fresh `RestoreJob` that
    /// inherits the failed job's plan (optionally overriding `ip_strategy`)
    /// and starts from the first non-succeeded step, replaying the resources
    /// that earlier steps already created.
    pub async fn retry(self: &Arc<Self>, failed_job_id: Uuid, ip_strategy_override: Option<crate::store::models::IpStrategy>) -> Result<RestoreJob> {
        let old_job = self
            .store
            .get_restore_job(failed_job_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("restore job {failed_job_id} not found")))?;
        let old_steps = self.store.list_restore_steps(failed_job_id).await?;

        let mut plan: PlanDocument = serde_json::from_value(old_job.plan.clone()).map_err(|e| Error::Internal(e.to_string()))?;
        if let Some(strategy) = ip_strategy_override {
            for port in &mut plan.ports {
                port.strategy = strategy;
            }
        }

        let now = Utc::now();
        let new_job_id = Uuid::new_v4();
        let new_job = RestoreJob {
            id: new_job_id,
            vm_id: old_job.vm_id.clone(),
            snapshot_id: old_job.snapshot_id.clone(),
            project_id: old_job.project_id.clone(),
            mode: old_job.mode,
            ip_strategy: ip_strategy_override.unwrap_or(old_job.ip_strategy),
            manual_ips: old_job.manual_ips.clone(),
            cleanup_old_storage: old_job.cleanup_old_storage,
            delete_source_snapshot: old_job.delete_source_snapshot,
            security_group_ids: old_job.security_group_ids.clone(),
            status: RestoreJobStatus::Running,
            plan: serde_json::to_value(&plan).map_err(|e| Error::Internal(e.to_string()))?,
            result: None,
            requested_by: old_job.requested_by.clone(),
            last_heartbeat: now,
            created_at: now,
            updated_at: now,
        };

        let new_steps: Vec<RestoreStep> = old_steps
            .iter()
            .map(|s| RestoreStep {
                job_id: new_job_id,
                ordinal: s.ordinal,
                kind: s.kind,
                status: if s.status == RestoreStepStatus::Succeeded { RestoreStepStatus::Succeeded } else { RestoreStepStatus::Pending },
                detail: if s.status == RestoreStepStatus::Succeeded { s.detail.clone() } else { serde_json::json!({}) },
                started_at: None,
                finished_at: None,
            })
            .collect();

        self.store.insert_restore_job(&new_job, &new_steps).await?;

        let mut state = ExecutionState::default();
        for step in old_steps.iter().filter(|s| s.status == RestoreStepStatus::Succeeded) {
            hydrate_state_from_detail(&mut state, step);
        }

        let engine = Arc::clone(self);
        let job_for_task = new_job.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_steps(&job_for_task, &plan, &new_steps, &mut state).await {
                tracing::error!(job_id = %job_for_task.id, error = %e, "retry execution failed");
            }
        });

        Ok(new_job)
    }

    /// §4.6.2 manual cleanup: walks a job's step details for created
    /// resource IDs and deletes each; volumes only when `delete_volume` is
    /// set and the volume is currently `available`.
    pub async fn cleanup(&self, job_id: Uuid, delete_volume: bool) -> Result<serde_json::Value> {
        self.store
            .get_restore_job(job_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("restore job {job_id} not found")))?;
        let steps = self.store.list_restore_steps(job_id).await?;
        let session = self.session_provider.get_admin_session().await?;
        let mut actions = Vec::new();

        for step in &steps {
            match step.kind {
                StepKind::CreateServer => {
                    if let Some(vm_id) = step.detail.get("vm_id").and_then(|v| v.as_str()) {
                        let id: crate::domain::ports::VmId = vm_id.to_string().into();
                        let result = self.cloud.delete_server(&session, &id).await;
                        actions.push(serde_json::json!({ "action": "delete_server", "id": vm_id, "ok": result.is_ok() }));
                    }
                }
                StepKind::CreatePorts => {
                    if let Some(ports) = step.detail.get("ports").and_then(|v| v.as_array()) {
                        for p in ports {
                            if let Some(port_id) = p.get("port_id").and_then(|v| v.as_str()) {
                                let id: crate::domain::ports::PortId = port_id.to_string().into();
                                let result = self.cloud.delete_port(&session, &id).await;
                                actions.push(serde_json::json!({ "action": "delete_port", "id": port_id, "ok": result.is_ok() }));
                            }
                        }
                    }
                }
                StepKind::CreateVolumeFromSnapshot if delete_volume => {
                    if let Some(volume_id) = step.detail.get("volume_id").and_then(|v| v.as_str()) {
                        let volume_id: crate::domain::ports::VolumeId = volume_id.to_string().into();
                        if let Ok(Some(info)) = self.cloud.get_volume(&session, &volume_id).await {
                            if info.status == "available" {
                                let result = self.cloud.delete_volume(&session, &volume_id).await;
                                actions.push(serde_json::json!({ "action": "delete_volume", "id": volume_id.to_string(), "ok": result.is_ok() }));
                            } else {
                                actions.push(serde_json::json!({ "action": "volume_not_available", "id": volume_id.to_string(), "status": info.status }));
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Ok(serde_json::json!({ "actions": actions }))
    }

    /// Post-success storage cleanup, requested independently of whatever
    /// `cleanup_old_storage`/`delete_source_snapshot` the job was planned
    /// with. Shares the safety gate with the `CleanupOldStorage` step
    /// (§4.6.2): the old volume is only deleted while `available`.
    pub async fn cleanup_storage(
        &self,
        job_id: Uuid,
        delete_old_volume: bool,
        delete_source_snapshot: bool,
    ) -> Result<serde_json::Value> {
        let job = self
            .store
            .get_restore_job(job_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("restore job {job_id} not found")))?;
        let plan: PlanDocument = serde_json::from_value(job.plan.clone()).map_err(|e| Error::Internal(e.to_string()))?;
        let session = self.session_provider.get_admin_session().await?;
        let mut detail = serde_json::Map::new();

        if delete_old_volume {
            match self.cloud.get_volume(&session, &plan.source_volume_id).await {
                Ok(Some(info)) if info.status == "available" => match self.cloud.delete_volume(&session, &plan.source_volume_id).await {
                    Ok(()) => {
                        detail.insert("source_volume_deleted".into(), serde_json::json!(true));
                    }
                    Err(e) => {
                        detail.insert("source_volume_delete_error".into(), serde_json::json!(e.to_string()));
                    }
                },
                Ok(Some(info)) => {
                    detail.insert("source_volume_skipped_status".into(), serde_json::json!(info.status));
                }
                Ok(None) => {
                    detail.insert("source_volume_already_absent".into(), serde_json::json!(true));
                }
                Err(e) => {
                    detail.insert("source_volume_lookup_error".into(), serde_json::json!(e.to_string()));
                }
            }
        }

        if delete_source_snapshot {
            let snapshot_id = plan.snapshot_id.clone().into();
            match self.cloud.delete_snapshot(&session, &snapshot_id).await {
                Ok(()) => {
                    detail.insert("source_snapshot_deleted".into(), serde_json::json!(true));
                }
                Err(e) => {
                    detail.insert("source_snapshot_delete_error".into(), serde_json::json!(e.to_string()));
                }
            }
        }

        Ok(serde_json::Value::Object(detail))
    }
}

fn hydrate_state_from_detail(state: &mut ExecutionState, step: &RestoreStep) {
    match step.kind {
        StepKind::DeleteExistingVm => {
            // original_port_ids are derived from the plan itself at runtime
            // by `delete_existing_vm`; nothing to hydrate here.
        }
        StepKind::CleanupOldPorts => {
            if let Some(ids) = step.detail.get("deleted_port_ids").and_then(|v| v.as_array()) {
                state.deleted_port_ids = ids.iter().filter_map(|v| v.as_str().map(String::from)).collect();
            }
        }
        StepKind::CreateVolumeFromSnapshot => {
            if let Some(id) = step.detail.get("volume_id").and_then(|v| v.as_str()) {
                state.new_volume_id = Some(id.to_string().into());
            }
        }
        StepKind::CreatePorts => {
            if let Some(ports) = step.detail.get("ports").and_then(|v| v.as_array()) {
                for p in ports {
                    if let (Some(id), Some(ips)) = (p.get("port_id").and_then(|v| v.as_str()), p.get("ips").and_then(|v| v.as_array())) {
                        let ip_list = ips.iter().filter_map(|v| v.as_str().map(String::from)).collect();
                        state.new_ports.push((id.to_string(), ip_list));
                    }
                }
            }
        }
        StepKind::CreateServer => {
            if let Some(id) = step.detail.get("vm_id").and_then(|v| v.as_str()) {
                state.new_vm_id = Some(id.to_string().into());
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::VolumeId;

    #[test]
    fn hydrate_pulls_volume_id_forward_from_a_succeeded_step() {
        let mut state = ExecutionState::default();
        let step = RestoreStep {
            job_id: Uuid::new_v4(),
            ordinal: 7,
            kind: StepKind::CreateVolumeFromSnapshot,
            status: RestoreStepStatus::Succeeded,
            detail: serde_json::json!({ "volume_id": "vol-42" }),
            started_at: None,
            finished_at: None,
        };
        hydrate_state_from_detail(&mut state, &step);
        assert_eq!(state.new_volume_id.unwrap().to_string(), "vol-42");
    }

    struct FakeCloud {
        volume_status: &'static str,
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::IdentityApi for FakeCloud {
        async fn authenticate(
            &self,
            _: &crate::session::credentials::ServiceUserCredentials,
            _: Option<&crate::domain::ports::ProjectId>,
        ) -> Result<crate::domain::ports::Session> {
            unimplemented!()
        }
        async fn grant_role(
            &self,
            _: &crate::domain::ports::Session,
            _: &crate::domain::ports::UserId,
            _: &crate::domain::ports::ProjectId,
            _: &str,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn find_user_by_email(&self, _: &crate::domain::ports::Session, _: &str) -> Result<Option<crate::domain::ports::UserId>> {
            unimplemented!()
        }
        async fn list_role_assignments(
            &self,
            _: &crate::domain::ports::Session,
            _: Option<&crate::domain::ports::UserId>,
        ) -> Result<Vec<crate::domain::ports::RoleAssignment>> {
            unimplemented!()
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::ComputeApi for FakeCloud {
        async fn get_server(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::VmId) -> Result<Option<crate::domain::ports::ServerInfo>> {
            unimplemented!()
        }
        async fn list_servers(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ProjectId) -> Result<Vec<crate::domain::ports::ServerInfo>> {
            unimplemented!()
        }
        async fn delete_server(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::VmId) -> Result<()> {
            unimplemented!()
        }
        async fn create_server(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ServerSpec) -> Result<crate::domain::ports::VmId> {
            unimplemented!()
        }
        async fn get_user_data(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::VmId) -> Result<Option<String>> {
            unimplemented!()
        }
        async fn wait_server_status(
            &self,
            _: &crate::domain::ports::Session,
            _: &crate::domain::ports::VmId,
            _: &str,
            _: std::time::Duration,
            _: std::time::Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn get_quotas(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ProjectId) -> Result<crate::domain::ports::Quotas> {
            unimplemented!()
        }
        async fn list_flavors(&self, _: &crate::domain::ports::Session) -> Result<Vec<crate::domain::ports::FlavorInfo>> {
            unimplemented!()
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::StorageApi for FakeCloud {
        async fn create_volume_from_snapshot(
            &self,
            _: &crate::domain::ports::Session,
            _: &crate::domain::ports::VolumeFromSnapshotSpec,
        ) -> Result<VolumeId> {
            unimplemented!()
        }
        async fn wait_volume_status(
            &self,
            _: &crate::domain::ports::Session,
            _: &VolumeId,
            _: &str,
            _: std::time::Duration,
            _: std::time::Duration,
        ) -> Result<()> {
            unimplemented!()
        }
        async fn delete_volume(&self, _: &crate::domain::ports::Session, _: &VolumeId) -> Result<()> {
            Ok(())
        }
        async fn list_snapshots(
            &self,
            _: &crate::domain::ports::Session,
            _: Option<&VolumeId>,
            _: &std::collections::HashMap<String, String>,
        ) -> Result<Vec<crate::domain::ports::SnapshotInfo>> {
            unimplemented!()
        }
        async fn create_snapshot(
            &self,
            _: &crate::domain::ports::Session,
            _: &VolumeId,
            _: &str,
            _: &std::collections::HashMap<String, String>,
        ) -> Result<crate::domain::ports::SnapshotId> {
            unimplemented!()
        }
        async fn delete_snapshot(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::SnapshotId) -> Result<()> {
            Ok(())
        }
        async fn get_snapshot(
            &self,
            _: &crate::domain::ports::Session,
            _: &crate::domain::ports::SnapshotId,
        ) -> Result<Option<crate::domain::ports::SnapshotInfo>> {
            unimplemented!()
        }
        async fn get_volume(&self, _: &crate::domain::ports::Session, _: &VolumeId) -> Result<Option<crate::domain::ports::VolumeInfo>> {
            Ok(Some(crate::domain::ports::VolumeInfo {
                id: "vol-old".into(),
                project_id: "proj-1".into(),
                name: "old".into(),
                tenant_name: "tenant".into(),
                domain_name: "domain".into(),
                attached_server_name: None,
                size_gb: 10,
                status: self.volume_status.to_string(),
                bootable: true,
                metadata: std::collections::HashMap::new(),
            }))
        }
        async fn get_quotas(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ProjectId) -> Result<crate::domain::ports::Quotas> {
            unimplemented!()
        }
        async fn list_volumes(
            &self,
            _: &crate::domain::ports::Session,
            _: Option<&crate::domain::ports::ProjectId>,
        ) -> Result<Vec<crate::domain::ports::VolumeInfo>> {
            unimplemented!()
        }
    }

    #[async_trait::async_trait]
    impl crate::domain::ports::NetworkApi for FakeCloud {
        async fn list_ports(&self, _: &crate::domain::ports::Session, _: Option<&str>) -> Result<Vec<crate::domain::ports::PortInfo>> {
            unimplemented!()
        }
        async fn create_port(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::PortSpec) -> Result<crate::domain::ports::PortInfo> {
            unimplemented!()
        }
        async fn delete_port(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::PortId) -> Result<()> {
            unimplemented!()
        }
        async fn list_subnets(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::NetworkId) -> Result<Vec<String>> {
            unimplemented!()
        }
        async fn list_networks(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ProjectId) -> Result<Vec<crate::domain::ports::NetworkId>> {
            unimplemented!()
        }
        async fn create_security_group(&self, _: &crate::domain::ports::Session, _: &str) -> Result<String> {
            unimplemented!()
        }
        async fn create_security_group_rule(&self, _: &crate::domain::ports::Session, _: &str, _: &str) -> Result<()> {
            unimplemented!()
        }
        async fn list_security_groups(&self, _: &crate::domain::ports::Session, _: &crate::domain::ports::ProjectId) -> Result<Vec<String>> {
            unimplemented!()
        }
    }

    struct FakeSessionProvider;

    #[async_trait::async_trait]
    impl SessionProviderApi for FakeSessionProvider {
        async fn get_admin_session(&self) -> Result<crate::domain::ports::Session> {
            Ok(crate::domain::ports::Session {
                token: "tok".into(),
                project_id: "admin".into(),
                expires_at: Utc::now() + chrono::Duration::hours(1),
                dry_run: false,
            })
        }
        async fn get_project_session(&self, _: &crate::domain::ports::ProjectId) -> Result<crate::domain::ports::ProjectSession> {
            unimplemented!()
        }
        async fn invalidate(&self, _: &crate::domain::ports::ProjectId) {}
    }

    fn sample_job(job_id: Uuid) -> RestoreJob {
        let plan = PlanDocument {
            project_id: "proj-1".into(),
            vm_id: "vm-1".into(),
            snapshot_id: "snap-1".into(),
            source_volume_id: "vol-old".into(),
            mode: crate::store::models::RestoreMode::Replace,
            original_vm_name: "web-1".into(),
            new_vm_name: "web-1".into(),
            flavor_id: "m1.small".into(),
            ports: vec![],
            user_data: None,
            security_group_ids: vec![],
            cleanup_old_storage: false,
            delete_source_snapshot: false,
            quota_warnings: vec![],
            user_data_missing: false,
        };
        RestoreJob {
            id: job_id,
            vm_id: "vm-1".into(),
            snapshot_id: "snap-1".into(),
            project_id: "proj-1".into(),
            mode: crate::store::models::RestoreMode::Replace,
            ip_strategy: crate::store::models::IpStrategy::NewIps,
            manual_ips: None,
            cleanup_old_storage: false,
            delete_source_snapshot: false,
            security_group_ids: vec![],
            status: RestoreJobStatus::Succeeded,
            plan: serde_json::to_value(&plan).unwrap(),
            result: None,
            requested_by: "alice".into(),
            last_heartbeat: Utc::now(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn cleanup_storage_deletes_an_available_source_volume_and_snapshot() {
        let store = Arc::new(crate::store::memory::InMemoryJobStore::new());
        let job_id = Uuid::new_v4();
        store.insert_restore_job(&sample_job(job_id), &[]).await.unwrap();

        let engine = RestoreEngine::new(
            Arc::new(FakeCloud { volume_status: "available" }),
            Arc::new(FakeSessionProvider),
            store,
            Arc::new(crate::domain::publisher::InMemoryEventCollector::new()),
            false,
        );

        let detail = engine.cleanup_storage(job_id, true, true).await.unwrap();
        assert_eq!(detail["source_volume_deleted"], serde_json::json!(true));
        assert_eq!(detail["source_snapshot_deleted"], serde_json::json!(true));
    }

    #[tokio::test]
    async fn cleanup_storage_skips_a_volume_that_is_still_in_use() {
        let store = Arc::new(crate::store::memory::InMemoryJobStore::new());
        let job_id = Uuid::new_v4();
        store.insert_restore_job(&sample_job(job_id), &[]).await.unwrap();

        let engine = RestoreEngine::new(
            Arc::new(FakeCloud { volume_status: "in-use" }),
            Arc::new(FakeSessionProvider),
            store,
            Arc::new(crate::domain::publisher::InMemoryEventCollector::new()),
            false,
        );

        let detail = engine.cleanup_storage(job_id, true, false).await.unwrap();
        assert_eq!(detail["source_volume_skipped_status"], serde_json::json!("in-use"));
        assert!(detail.get("source_snapshot_deleted").is_none());
    }
}
