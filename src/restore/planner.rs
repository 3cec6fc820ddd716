//! Builds a deterministic, side-effect-free restore plan (§4.6.1). The
//! planner only reads from the cloud as a cross-check against the live VM,
//! snapshot, and quota state; it never mutates anything. The plan is a
//! document built once up front rather than a state advanced step by
//! step — that advancing is the executor's job.

use chrono::Utc;
use std::collections::HashMap;

use crate::domain::ports::{CloudApi, ComputeApi, ProjectId, Session, VmId};
use crate::error::{Error, Result};
use crate::restore::types::{PlanDocument, PlanPort, PlanRequest, QuotaWarning};
use crate::store::models::{IpStrategy, RestoreJob, RestoreJobStatus, RestoreMode, RestoreStep, RestoreStepStatus, StepKind};

/// The canonical ordinal → kind table from §4.6.1, filtered to the steps
/// present for `mode`/`cleanup_old_storage`.
fn step_kinds_for(mode: RestoreMode, cleanup_old_storage: bool) -> Vec<StepKind> {
    let mut kinds = vec![StepKind::ValidateLiveState, StepKind::EnsureServiceUser, StepKind::QuotaCheck];
    if mode == RestoreMode::Replace {
        kinds.push(StepKind::DeleteExistingVm);
        kinds.push(StepKind::WaitVmDeleted);
        kinds.push(StepKind::CleanupOldPorts);
    }
    kinds.push(StepKind::CreateVolumeFromSnapshot);
    kinds.push(StepKind::WaitVolumeAvailable);
    kinds.push(StepKind::CreatePorts);
    kinds.push(StepKind::CreateServer);
    kinds.push(StepKind::WaitServerActive);
    kinds.push(StepKind::Finalize);
    if mode == RestoreMode::Replace && cleanup_old_storage {
        kinds.push(StepKind::CleanupOldStorage);
    }
    kinds
}

fn resolve_port_ip(strategy: IpStrategy, network_id: &str, original_ip: Option<&str>, manual_ips: &Option<HashMap<String, String>>) -> Option<String> {
    match strategy {
        IpStrategy::NewIps => None,
        IpStrategy::TrySameIps | IpStrategy::SameIpsOrFail => original_ip.map(|s| s.to_string()),
        IpStrategy::ManualIp => manual_ips.as_ref().and_then(|m| m.get(network_id)).cloned().or_else(|| original_ip.map(|s| s.to_string())),
    }
}

pub async fn build_plan(
    cloud: &dyn CloudApi,
    session: &Session,
    req: &PlanRequest,
) -> Result<(RestoreJob, Vec<RestoreStep>, PlanDocument)> {
    let vm_id: VmId = req.vm_id.clone().into();
    let project_id: ProjectId = req.project_id.clone().into();

    let server = cloud
        .get_server(session, &vm_id)
        .await?
        .ok_or_else(|| Error::VMNotFound(req.vm_id.clone()))?;

    let boot_volume_id = server
        .boot_volume_id
        .clone()
        .ok_or_else(|| Error::UnsupportedBootMode { vm_id: req.vm_id.clone() })?;

    let snapshot_id = req.snapshot_id.clone().into();
    let snapshot = cloud
        .get_snapshot(session, &snapshot_id)
        .await?
        .ok_or_else(|| Error::SnapshotNotFound { snapshot_id: req.snapshot_id.clone() })?;
    if snapshot.volume_id != boot_volume_id {
        return Err(Error::SnapshotMismatch { snapshot_id: req.snapshot_id.clone(), vm_id: req.vm_id.clone() });
    }

    let flavors = cloud.list_flavors(session).await?;
    let flavor = flavors.iter().find(|f| f.id == server.flavor_id);
    let user_data = cloud.get_user_data(session, &vm_id).await?;

    let volume_info = cloud.get_volume(session, &boot_volume_id).await?;
    let size_gb = volume_info.as_ref().map(|v| v.size_gb).unwrap_or(0);

    let mut quota_warnings = Vec::new();
    if req.mode == RestoreMode::New {
        let quotas = ComputeApi::get_quotas(cloud, session, &project_id).await?;
        let vcpus = flavor.map(|f| f.vcpus).unwrap_or(0);
        let ram_mb = flavor.map(|f| f.ram_mb).unwrap_or(0);
        check_quota_dimension(&mut quota_warnings, "instances", 1, quotas.instances_limit.saturating_sub(quotas.instances_used));
        check_quota_dimension(&mut quota_warnings, "vcpus", vcpus, quotas.vcpus_limit.saturating_sub(quotas.vcpus_used));
        check_quota_dimension(&mut quota_warnings, "ram_mb", ram_mb, quotas.ram_mb_limit.saturating_sub(quotas.ram_mb_used));
        check_quota_dimension(&mut quota_warnings, "volumes", 1, quotas.volumes_limit.saturating_sub(quotas.volumes_used));
        check_quota_dimension(&mut quota_warnings, "gigabytes", size_gb, quotas.gigabytes_limit.saturating_sub(quotas.gigabytes_used));
    }

    let ports: Vec<PlanPort> = server
        .ports
        .iter()
        .map(|p| PlanPort {
            network_id: p.network_id.clone(),
            original_port_id: Some(p.id.clone()),
            requested_ip: resolve_port_ip(req.ip_strategy, p.network_id.as_ref(), p.ip_addresses.first().map(|s| s.as_str()), &req.manual_ips),
            strategy: req.ip_strategy,
        })
        .collect();

    let plan_doc = PlanDocument {
        project_id: req.project_id.clone(),
        vm_id: req.vm_id.clone(),
        snapshot_id: req.snapshot_id.clone(),
        source_volume_id: boot_volume_id,
        mode: req.mode,
        original_vm_name: server.name.clone(),
        new_vm_name: req.new_vm_name.clone().unwrap_or_else(|| format!("{}-restored", server.name)),
        flavor_id: server.flavor_id.clone(),
        ports,
        user_data: user_data.clone(),
        security_group_ids: req.security_group_ids.clone(),
        cleanup_old_storage: req.cleanup_old_storage,
        delete_source_snapshot: req.delete_source_snapshot,
        quota_warnings,
        user_data_missing: user_data.is_none(),
    };

    let now = Utc::now();
    let job_id = uuid::Uuid::new_v4();
    let job = RestoreJob {
        id: job_id,
        vm_id: req.vm_id.clone().into(),
        snapshot_id: req.snapshot_id.clone().into(),
        project_id: req.project_id.clone().into(),
        mode: req.mode,
        ip_strategy: req.ip_strategy,
        manual_ips: req.manual_ips.clone(),
        cleanup_old_storage: req.cleanup_old_storage,
        delete_source_snapshot: req.delete_source_snapshot,
        security_group_ids: req.security_group_ids.clone(),
        status: RestoreJobStatus::Planned,
        plan: serde_json::to_value(&plan_doc).map_err(|e| Error::Internal(e.to_string()))?,
        result: None,
        requested_by: req.requested_by.clone(),
        last_heartbeat: now,
        created_at: now,
        updated_at: now,
    };

    let steps = step_kinds_for(req.mode, req.cleanup_old_storage)
        .into_iter()
        .enumerate()
        .map(|(i, kind)| RestoreStep {
            job_id,
            ordinal: i as u32 + 1,
            kind,
            status: RestoreStepStatus::Pending,
            detail: serde_json::json!({}),
            started_at: None,
            finished_at: None,
        })
        .collect();

    Ok((job, steps, plan_doc))
}

fn check_quota_dimension(warnings: &mut Vec<QuotaWarning>, dimension: &str, required: u32, available: u32) {
    if required > available {
        warnings.push(QuotaWarning { dimension: dimension.to_string(), required, available });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_mode_has_nine_steps_without_replace_only_stages() {
        let kinds = step_kinds_for(RestoreMode::New, false);
        assert_eq!(kinds.len(), 9);
        assert!(!kinds.contains(&StepKind::DeleteExistingVm));
    }

    #[test]
    fn replace_mode_with_cleanup_has_all_thirteen_steps() {
        let kinds = step_kinds_for(RestoreMode::Replace, true);
        assert_eq!(kinds.len(), 13);
        assert_eq!(kinds.last(), Some(&StepKind::CleanupOldStorage));
    }

    #[test]
    fn replace_mode_without_cleanup_omits_final_step() {
        let kinds = step_kinds_for(RestoreMode::Replace, false);
        assert_eq!(kinds.last(), Some(&StepKind::Finalize));
    }

    #[test]
    fn try_same_ips_requests_the_original_address() {
        let ip = resolve_port_ip(IpStrategy::TrySameIps, "net-1", Some("10.0.0.5"), &None);
        assert_eq!(ip.as_deref(), Some("10.0.0.5"));
    }

    #[test]
    fn new_ips_never_requests_a_fixed_address() {
        let ip = resolve_port_ip(IpStrategy::NewIps, "net-1", Some("10.0.0.5"), &None);
        assert_eq!(ip, None);
    }

    #[test]
    fn manual_ip_prefers_the_override_map() {
        let mut manual = HashMap::new();
        manual.insert("net-1".to_string(), "10.0.0.9".to_string());
        let ip = resolve_port_ip(IpStrategy::ManualIp, "net-1", Some("10.0.0.5"), &Some(manual));
        assert_eq!(ip.as_deref(), Some("10.0.0.9"));
    }
}
