//! Step handlers (§4.6.2): each is a function of the plan, the resources
//! created by prior steps in this execution, the session provider, and the
//! cloud client, returning a `detail` document. The executor is the only
//! caller; handlers never touch the job store directly.

use std::time::Duration;

use crate::domain::ports::{
    CloudApi, ComputeApi, PortSpec, ProjectId, ServerSpec, Session, SessionProviderApi, VmId, VolumeFromSnapshotSpec,
    VolumeId,
};
use crate::error::{Error, Result};
use crate::restore::types::PlanDocument;
use crate::store::models::{IpStrategy, RestoreMode};

const WAIT_VM_DELETED_TIMEOUT: Duration = Duration::from_secs(300);
const WAIT_VOLUME_AVAILABLE_TIMEOUT: Duration = Duration::from_secs(600);
const WAIT_SERVER_ACTIVE_TIMEOUT: Duration = Duration::from_secs(600);
const POLL_INTERVAL: Duration = Duration::from_secs(5);
const CREATE_PORTS_MAX_RETRIES: u32 = 5;
const CREATE_PORTS_RETRY_SPACING: Duration = Duration::from_secs(3);
const PORT_RELEASE_SETTLE: Duration = Duration::from_secs(3);

/// Resources this execution has created so far, carried across step
/// invocations so rollback and later steps can reference them without
/// re-parsing every prior step's `detail` JSON.
#[derive(Debug, Default, Clone)]
pub struct ExecutionState {
    pub scoped_session: Option<Session>,
    pub session_degraded_reason: Option<String>,
    pub original_port_ids: Vec<String>,
    pub deleted_port_ids: Vec<String>,
    pub new_volume_id: Option<VolumeId>,
    pub new_ports: Vec<(String, Vec<String>)>, // (port_id, ip_addresses)
    pub new_vm_id: Option<VmId>,
    pub downgrades: Vec<String>,
}

impl ExecutionState {
    fn session(&self) -> Result<&Session> {
        self.scoped_session
            .as_ref()
            .ok_or_else(|| Error::Internal("no session established before step execution".into()))
    }
}

pub struct StepContext<'a> {
    pub cloud: &'a dyn CloudApi,
    pub session_provider: &'a dyn SessionProviderApi,
    pub plan: &'a PlanDocument,
    pub cleanup_old_storage_volumes: bool,
}

/// Runs before the service user is granted (it's the first step), so this
/// reads through the admin session rather than a scoped one.
pub async fn validate_live_state(ctx: &StepContext<'_>, _state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = ctx.session_provider.get_admin_session().await?;
    let vm_id: VmId = ctx.plan.vm_id.clone().into();
    let snapshot_id = ctx.plan.snapshot_id.clone().into();
    let snapshot = ctx
        .cloud
        .get_snapshot(&session, &snapshot_id)
        .await?
        .ok_or_else(|| Error::SnapshotNotFound { snapshot_id: ctx.plan.snapshot_id.clone() })?;
    if !matches!(snapshot.status.as_str(), "available" | "completed") {
        return Err(Error::ConflictError(format!("snapshot {} is not in a restorable state: {}", ctx.plan.snapshot_id, snapshot.status)));
    }
    if ctx.plan.mode == RestoreMode::New {
        // NEW mode doesn't require the original VM to still exist.
        let _ = ctx.cloud.get_server(&session, &vm_id).await;
    }
    Ok(serde_json::json!({ "snapshot_status": snapshot.status }))
}

pub async fn ensure_service_user(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let project_id: ProjectId = ctx.plan.project_id.clone().into();
    match ctx.session_provider.get_project_session(&project_id).await? {
        crate::domain::ports::ProjectSession::Scoped(session) => {
            state.scoped_session = Some(session);
            Ok(serde_json::json!({ "degraded": false }))
        }
        crate::domain::ports::ProjectSession::Fallback { admin_session, reason } => {
            state.scoped_session = Some(admin_session);
            state.session_degraded_reason = Some(reason.clone());
            Ok(serde_json::json!({ "degraded": true, "reason": reason }))
        }
    }
}

pub async fn quota_check(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    if ctx.plan.mode != RestoreMode::New {
        return Ok(serde_json::json!({ "skipped": true }));
    }
    let session = state.session()?;
    let project_id: ProjectId = ctx.plan.project_id.clone().into();
    let quotas = ComputeApi::get_quotas(ctx.cloud, session, &project_id).await?;
    if quotas.instances_used >= quotas.instances_limit {
        return Err(Error::QuotaInsufficient("instances quota exhausted".into()));
    }
    Ok(serde_json::json!({ "instances_used": quotas.instances_used, "instances_limit": quotas.instances_limit }))
}

pub async fn delete_existing_vm(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?.clone();
    let vm_id: VmId = ctx.plan.vm_id.clone().into();
    state.original_port_ids = ctx
        .plan
        .ports
        .iter()
        .filter_map(|p| p.original_port_id.as_ref().map(|id| id.to_string()))
        .collect();
    match ctx.cloud.delete_server(&session, &vm_id).await {
        Ok(()) => Ok(serde_json::json!({ "deleted": true })),
        Err(Error::NotFound(_)) => Ok(serde_json::json!({ "deleted": true, "already_absent": true })),
        Err(e) => Err(e),
    }
}

pub async fn wait_vm_deleted(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let vm_id: VmId = ctx.plan.vm_id.clone().into();
    ctx.cloud
        .wait_server_status(session, &vm_id, "DELETED", WAIT_VM_DELETED_TIMEOUT, POLL_INTERVAL)
        .await?;
    Ok(serde_json::json!({ "confirmed_deleted": true }))
}

pub async fn cleanup_old_ports(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let mut deleted = Vec::new();

    for port_id in state.original_port_ids.clone() {
        let id: crate::domain::ports::PortId = port_id.clone().into();
        if ctx.cloud.delete_port(session, &id).await.is_ok() {
            deleted.push(port_id);
        }
    }

    for remaining in ctx.cloud.list_ports(session, Some(ctx.plan.vm_id.as_str())).await.unwrap_or_default() {
        if ctx.cloud.delete_port(session, &remaining.id).await.is_ok() {
            deleted.push(remaining.id.to_string());
        }
    }

    for port in &ctx.plan.ports {
        if let Some(ip) = &port.requested_ip {
            for existing in ctx.cloud.list_ports(session, None).await.unwrap_or_default() {
                if existing.ip_addresses.iter().any(|a| a == ip) && ctx.cloud.delete_port(session, &existing.id).await.is_ok() {
                    deleted.push(existing.id.to_string());
                }
            }
        }
    }

    state.deleted_port_ids = deleted.clone();
    tokio::time::sleep(PORT_RELEASE_SETTLE).await;
    Ok(serde_json::json!({ "deleted_port_ids": deleted }))
}

pub async fn create_volume_from_snapshot(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let spec = VolumeFromSnapshotSpec {
        snapshot_id: ctx.plan.snapshot_id.clone().into(),
        project_id: ctx.plan.project_id.clone().into(),
        name: format!("{}-restored-vol", ctx.plan.new_vm_name),
        size_gb: None,
    };
    let volume_id = ctx.cloud.create_volume_from_snapshot(session, &spec).await?;
    state.new_volume_id = Some(volume_id.clone());
    Ok(serde_json::json!({ "volume_id": volume_id.to_string() }))
}

pub async fn wait_volume_available(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let volume_id = state
        .new_volume_id
        .clone()
        .ok_or_else(|| Error::Internal("wait_volume_available ran without a created volume".into()))?;
    ctx.cloud
        .wait_volume_status(session, &volume_id, "available", WAIT_VOLUME_AVAILABLE_TIMEOUT, POLL_INTERVAL)
        .await?;
    Ok(serde_json::json!({ "volume_id": volume_id.to_string(), "status": "available" }))
}

pub async fn create_ports(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?.clone();
    let mut created = Vec::new();
    for port in &ctx.plan.ports {
        let mut attempt = 0;
        loop {
            let spec = PortSpec {
                network_id: port.network_id.clone(),
                fixed_ip: port.requested_ip.clone(),
                security_group_ids: ctx.plan.security_group_ids.clone(),
            };
            match ctx.cloud.create_port(&session, &spec).await {
                Ok(info) => {
                    state.new_ports.push((info.id.to_string(), info.ip_addresses.clone()));
                    created.push(serde_json::json!({ "port_id": info.id.to_string(), "ips": info.ip_addresses }));
                    break;
                }
                Err(Error::ConflictError(reason)) if attempt < CREATE_PORTS_MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, network_id = %port.network_id, %reason, "port create conflict, retrying");
                    tokio::time::sleep(CREATE_PORTS_RETRY_SPACING).await;
                    continue;
                }
                Err(Error::ConflictError(reason)) => {
                    match port.strategy {
                        IpStrategy::TrySameIps => {
                            state.downgrades.push(format!("network {} fell back to DHCP after IP conflict: {reason}", port.network_id));
                            let fallback = PortSpec { network_id: port.network_id.clone(), fixed_ip: None, security_group_ids: ctx.plan.security_group_ids.clone() };
                            let info = ctx.cloud.create_port(&session, &fallback).await?;
                            state.new_ports.push((info.id.to_string(), info.ip_addresses.clone()));
                            created.push(serde_json::json!({ "port_id": info.id.to_string(), "ips": info.ip_addresses, "downgraded": true }));
                            break;
                        }
                        _ => return Err(Error::ConflictError(reason)),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
    Ok(serde_json::json!({ "ports": created }))
}

pub async fn create_server(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let volume_id = state
        .new_volume_id
        .clone()
        .ok_or_else(|| Error::Internal("create_server ran without a created volume".into()))?;
    let port_ids = state.new_ports.iter().map(|(id, _)| id.clone().into()).collect();
    let spec = ServerSpec {
        name: ctx.plan.new_vm_name.clone(),
        flavor_id: ctx.plan.flavor_id.clone(),
        boot_volume_id: volume_id,
        port_ids,
        user_data: ctx.plan.user_data.clone(),
        security_group_ids: ctx.plan.security_group_ids.clone(),
    };
    let vm_id = ctx.cloud.create_server(session, &spec).await?;
    state.new_vm_id = Some(vm_id.clone());
    Ok(serde_json::json!({ "vm_id": vm_id.to_string() }))
}

pub async fn wait_server_active(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let vm_id = state
        .new_vm_id
        .clone()
        .ok_or_else(|| Error::Internal("wait_server_active ran without a created server".into()))?;
    ctx.cloud
        .wait_server_status(session, &vm_id, "ACTIVE", WAIT_SERVER_ACTIVE_TIMEOUT, POLL_INTERVAL)
        .await?;
    Ok(serde_json::json!({ "vm_id": vm_id.to_string(), "status": "ACTIVE" }))
}

pub fn finalize(_ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    Ok(serde_json::json!({
        "vm_id": state.new_vm_id.as_ref().map(|v| v.to_string()),
        "volume_id": state.new_volume_id.as_ref().map(|v| v.to_string()),
        "ports": state.new_ports,
        "downgrades": state.downgrades,
        "session_degraded_reason": state.session_degraded_reason,
    }))
}

pub async fn cleanup_old_storage(ctx: &StepContext<'_>, state: &mut ExecutionState) -> Result<serde_json::Value> {
    let session = state.session()?;
    let mut detail = serde_json::Map::new();

    match ctx.cloud.get_volume(session, &ctx.plan.source_volume_id).await {
        Ok(Some(info)) if info.status == "available" => {
            match ctx.cloud.delete_volume(session, &ctx.plan.source_volume_id).await {
                Ok(()) => detail.insert("source_volume_deleted".into(), serde_json::json!(true)),
                Err(e) => detail.insert("source_volume_delete_error".into(), serde_json::json!(e.to_string())),
            };
        }
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

    if ctx.plan.delete_source_snapshot {
        let snapshot_id = ctx.plan.snapshot_id.clone().into();
        match ctx.cloud.delete_snapshot(session, &snapshot_id).await {
            Ok(()) => detail.insert("source_snapshot_deleted".into(), serde_json::json!(true)),
            Err(e) => detail.insert("source_snapshot_delete_error".into(), serde_json::json!(e.to_string())),
        };
    }

    Ok(serde_json::Value::Object(detail))
}

/// Best-effort rollback after a step failure (§4.6.2 Rollback). Each action
/// is independently fallible; failures are recorded but never propagated,
/// since rollback itself must not fail the job differently than the
/// original error already has.
pub async fn rollback(ctx: &StepContext<'_>, state: &ExecutionState) -> serde_json::Value {
    let mut actions = Vec::new();
    let Some(session) = state.scoped_session.as_ref() else {
        return serde_json::json!({ "rollback_skipped": "no session was ever established" });
    };

    if let Some(vm_id) = &state.new_vm_id {
        let result = ctx.cloud.delete_server(session, vm_id).await;
        actions.push(serde_json::json!({ "action": "delete_server", "vm_id": vm_id.to_string(), "ok": result.is_ok() }));
    }
    for (port_id, _) in &state.new_ports {
        let id: crate::domain::ports::PortId = port_id.clone().into();
        let result = ctx.cloud.delete_port(session, &id).await;
        actions.push(serde_json::json!({ "action": "delete_port", "port_id": port_id, "ok": result.is_ok() }));
    }
    if let Some(volume_id) = &state.new_volume_id {
        if ctx.cleanup_old_storage_volumes {
            let result = ctx.cloud.delete_volume(session, volume_id).await;
            actions.push(serde_json::json!({ "action": "delete_volume", "volume_id": volume_id.to_string(), "ok": result.is_ok() }));
        } else {
            actions.push(serde_json::json!({ "action": "volume_left_for_inspection", "volume_id": volume_id.to_string() }));
        }
    }
    serde_json::json!({ "rollback_actions": actions })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_state_without_session_reports_internal_error() {
        let state = ExecutionState::default();
        let err = state.session().unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
