//! Pure data structures shared by the planner and executor: the plan
//! document itself, per-port IP resolution, and the planner's request/
//! response shapes. The plan is deliberately side-effect-free — building
//! one never touches the cloud beyond the read-only cross-checks §4.6.1
//! calls for.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain::ports::{NetworkId, PortId, VolumeId};
use crate::store::models::{IpStrategy, RestoreMode};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub project_id: String,
    pub vm_id: String,
    pub snapshot_id: String,
    pub mode: RestoreMode,
    pub new_vm_name: Option<String>,
    pub ip_strategy: IpStrategy,
    pub manual_ips: Option<HashMap<String, String>>,
    pub security_group_ids: Vec<String>,
    pub cleanup_old_storage: bool,
    pub delete_source_snapshot: bool,
    pub requested_by: String,
}

/// One port the plan will (re)create, with its resolved IP strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanPort {
    pub network_id: NetworkId,
    pub original_port_id: Option<PortId>,
    pub requested_ip: Option<String>,
    pub strategy: IpStrategy,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct QuotaWarning {
    pub dimension: String,
    pub required: u32,
    pub available: u32,
}

/// The structured plan document persisted on `RestoreJob.plan` and returned
/// to the caller. Everything the executor's step handlers need is captured
/// here so no step re-derives planning decisions from scratch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanDocument {
    pub project_id: String,
    pub vm_id: String,
    pub snapshot_id: String,
    pub source_volume_id: VolumeId,
    pub mode: RestoreMode,
    pub original_vm_name: String,
    pub new_vm_name: String,
    pub flavor_id: String,
    pub ports: Vec<PlanPort>,
    pub user_data: Option<String>,
    pub security_group_ids: Vec<String>,
    pub cleanup_old_storage: bool,
    pub delete_source_snapshot: bool,
    pub quota_warnings: Vec<QuotaWarning>,
    pub user_data_missing: bool,
}
