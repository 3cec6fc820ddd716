//! Trait abstractions (ports) for every external dependency the orchestration
//! core consumes: the remote cloud control plane, the durable job store, and
//! the domain event sink. Adapters under [`crate::cloud`], [`crate::store`],
//! and [`crate::session`] implement these traits; the rest of the crate is
//! written entirely against them so it can be exercised with in-memory fakes
//! in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

use crate::domain::events::DomainEvent;
use crate::error::Result;
use crate::session::credentials::ServiceUserCredentials;
use crate::store::models::{
    Assignment, OnDemandTrigger, RestoreJob, RestoreJobStatus, RestoreStep, RestoreStepStatus,
    RunFinalStatus, SnapshotRecord, SnapshotRun,
};

// ---------------------------------------------------------------------------
// Value objects
// ---------------------------------------------------------------------------

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

id_newtype!(ProjectId);
id_newtype!(VmId);
id_newtype!(VolumeId);
id_newtype!(SnapshotId);
id_newtype!(NetworkId);
id_newtype!(PortId);
id_newtype!(UserId);

/// A bearer token scoped to a specific project, with the expiry the caller
/// needs to know when to re-authenticate.
#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub project_id: ProjectId,
    pub expires_at: DateTime<Utc>,
    pub dry_run: bool,
}

impl Session {
    pub fn is_expired(&self) -> bool {
        Utc::now() >= self.expires_at
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub id: VmId,
    pub name: String,
    pub project_id: ProjectId,
    pub status: String,
    pub flavor_id: String,
    pub boot_volume_id: Option<VolumeId>,
    pub ports: Vec<PortInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortInfo {
    pub id: PortId,
    pub network_id: NetworkId,
    pub ip_addresses: Vec<String>,
    pub mac_address: String,
    pub device_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub id: VolumeId,
    pub project_id: ProjectId,
    pub name: String,
    pub tenant_name: String,
    pub domain_name: String,
    pub attached_server_name: Option<String>,
    pub size_gb: u32,
    pub status: String,
    pub bootable: bool,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub id: SnapshotId,
    pub volume_id: VolumeId,
    pub status: String,
    pub created_at: DateTime<Utc>,
    pub metadata: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlavorInfo {
    pub id: String,
    pub vcpus: u32,
    pub ram_mb: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Quotas {
    pub instances_used: u32,
    pub instances_limit: u32,
    pub vcpus_used: u32,
    pub vcpus_limit: u32,
    pub ram_mb_used: u32,
    pub ram_mb_limit: u32,
    pub volumes_used: u32,
    pub volumes_limit: u32,
    pub gigabytes_used: u32,
    pub gigabytes_limit: u32,
}

#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub name: String,
    pub flavor_id: String,
    pub boot_volume_id: VolumeId,
    pub port_ids: Vec<PortId>,
    pub user_data: Option<String>,
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VolumeFromSnapshotSpec {
    pub snapshot_id: SnapshotId,
    pub project_id: ProjectId,
    pub name: String,
    pub size_gb: Option<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct PortSpec {
    pub network_id: NetworkId,
    pub fixed_ip: Option<String>,
    pub security_group_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub user_id: UserId,
    pub project_id: ProjectId,
    pub role: String,
}

// ---------------------------------------------------------------------------
// Cloud client ports (C1)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait IdentityApi: Send + Sync {
    async fn authenticate(
        &self,
        credential: &ServiceUserCredentials,
        project_id: Option<&ProjectId>,
    ) -> Result<Session>;
    async fn grant_role(
        &self,
        session: &Session,
        user_id: &UserId,
        project_id: &ProjectId,
        role: &str,
    ) -> Result<()>;
    async fn find_user_by_email(&self, session: &Session, email: &str) -> Result<Option<UserId>>;
    async fn list_role_assignments(
        &self,
        session: &Session,
        user_id: Option<&UserId>,
    ) -> Result<Vec<RoleAssignment>>;
}

#[async_trait]
pub trait ComputeApi: Send + Sync {
    async fn get_server(&self, session: &Session, vm_id: &VmId) -> Result<Option<ServerInfo>>;
    async fn list_servers(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<ServerInfo>>;
    async fn delete_server(&self, session: &Session, vm_id: &VmId) -> Result<()>;
    async fn create_server(&self, session: &Session, spec: &ServerSpec) -> Result<VmId>;
    async fn get_user_data(&self, session: &Session, vm_id: &VmId) -> Result<Option<String>>;
    async fn wait_server_status(
        &self,
        session: &Session,
        vm_id: &VmId,
        target: &str,
        timeout: std::time::Duration,
        poll_interval: std::time::Duration,
    ) -> Result<()>;
    async fn get_quotas(&self, session: &Session, project_id: &ProjectId) -> Result<Quotas>;
    async fn list_flavors(&self, session: &Session) -> Result<Vec<FlavorInfo>>;
}

#[async_trait]
pub trait StorageApi: Send + Sync {
    async fn create_volume_from_snapshot(
        &self,
        session: &Session,
        spec: &VolumeFromSnapshotSpec,
    ) -> Result<VolumeId>;
    async fn wait_volume_status(
        &self,
        session: &Session,
        volume_id: &VolumeId,
        target: &str,
        timeout: std::time::Duration,
        poll_interval: std::time::Duration,
    ) -> Result<()>;
    async fn delete_volume(&self, session: &Session, volume_id: &VolumeId) -> Result<()>;
    async fn list_snapshots(
        &self,
        session: &Session,
        volume_id: Option<&VolumeId>,
        metadata_equals: &HashMap<String, String>,
    ) -> Result<Vec<SnapshotInfo>>;
    async fn create_snapshot(
        &self,
        session: &Session,
        volume_id: &VolumeId,
        name: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<SnapshotId>;
    async fn delete_snapshot(&self, session: &Session, snapshot_id: &SnapshotId) -> Result<()>;
    async fn get_snapshot(
        &self,
        session: &Session,
        snapshot_id: &SnapshotId,
    ) -> Result<Option<SnapshotInfo>>;
    async fn get_volume(&self, session: &Session, volume_id: &VolumeId) -> Result<Option<VolumeInfo>>;
    async fn get_quotas(&self, session: &Session, project_id: &ProjectId) -> Result<Quotas>;
    /// Enumerates volumes; `project_id = None` means "all tenants" and
    /// requires an admin session (§4.5 Stage A inventory sweep).
    async fn list_volumes(&self, session: &Session, project_id: Option<&ProjectId>) -> Result<Vec<VolumeInfo>>;
}

#[async_trait]
pub trait NetworkApi: Send + Sync {
    async fn list_ports(&self, session: &Session, device_id: Option<&str>) -> Result<Vec<PortInfo>>;
    async fn create_port(&self, session: &Session, spec: &PortSpec) -> Result<PortInfo>;
    async fn delete_port(&self, session: &Session, port_id: &PortId) -> Result<()>;
    async fn list_subnets(&self, session: &Session, network_id: &NetworkId) -> Result<Vec<String>>;
    async fn list_networks(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<NetworkId>>;
    async fn create_security_group(&self, session: &Session, name: &str) -> Result<String>;
    async fn create_security_group_rule(&self, session: &Session, group_id: &str, rule: &str) -> Result<()>;
    async fn list_security_groups(&self, session: &Session, project_id: &ProjectId) -> Result<Vec<String>>;
}

/// Aggregate façade over the four capability areas; implemented once by
/// [`crate::cloud::client::CloudClient`].
pub trait CloudApi: IdentityApi + ComputeApi + StorageApi + NetworkApi {}
impl<T: IdentityApi + ComputeApi + StorageApi + NetworkApi> CloudApi for T {}

// ---------------------------------------------------------------------------
// Session provider port (C2)
// ---------------------------------------------------------------------------

/// Returned by [`SessionProviderApi::get_project_session`] when per-project
/// scoping could not be established; the caller falls back to the admin
/// session and must log the degradation.
pub enum ProjectSession {
    Scoped(Session),
    Fallback { admin_session: Session, reason: String },
}

#[async_trait]
pub trait SessionProviderApi: Send + Sync {
    async fn get_admin_session(&self) -> Result<Session>;
    async fn get_project_session(&self, project_id: &ProjectId) -> Result<ProjectSession>;
    async fn invalidate(&self, project_id: &ProjectId);
}

// ---------------------------------------------------------------------------
// Job store port (C3)
// ---------------------------------------------------------------------------

#[async_trait]
pub trait JobStoreApi: Send + Sync {
    async fn insert_snapshot_run(&self, run: &SnapshotRun) -> Result<uuid::Uuid>;
    async fn append_snapshot_record(&self, run_id: uuid::Uuid, record: &SnapshotRecord) -> Result<()>;
    async fn finalize_snapshot_run(
        &self,
        run_id: uuid::Uuid,
        final_status: Option<RunFinalStatus>,
    ) -> Result<RunFinalStatus>;
    async fn has_snapshot_today(&self, volume_id: &VolumeId, policy_name: &str) -> Result<bool>;

    /// Upserts a chunk of policy assignments. Never overwrites a row whose
    /// `source` is `"operator"` (§4.4's preservation rule) — the caller is
    /// expected to have already filtered those out via
    /// [`crate::policy::engine::should_preserve_existing`], but the store
    /// enforces it too so a racing write can't clobber an operator override.
    async fn write_assignments(&self, assignments: &[Assignment]) -> Result<()>;
    /// All assignments currently bound to a policy set (i.e. not excluded,
    /// not unmatched) — the working set for Stage C / Stage D.
    async fn list_active_assignments(&self) -> Result<Vec<Assignment>>;
    async fn get_assignment(&self, volume_id: &VolumeId) -> Result<Option<Assignment>>;

    async fn insert_restore_job(&self, job: &RestoreJob, steps: &[RestoreStep]) -> Result<uuid::Uuid>;
    async fn get_restore_job(&self, job_id: uuid::Uuid) -> Result<Option<RestoreJob>>;
    async fn list_restore_jobs(&self, vm_id: Option<&VmId>) -> Result<Vec<RestoreJob>>;
    async fn list_restore_steps(&self, job_id: uuid::Uuid) -> Result<Vec<RestoreStep>>;
    async fn update_restore_job_status(
        &self,
        job_id: uuid::Uuid,
        status: RestoreJobStatus,
        result: Option<serde_json::Value>,
    ) -> Result<()>;
    async fn update_restore_step(
        &self,
        job_id: uuid::Uuid,
        ordinal: u32,
        status: RestoreStepStatus,
        detail: serde_json::Value,
    ) -> Result<()>;
    async fn observe_cancellation(&self, job_id: uuid::Uuid) -> Result<bool>;
    async fn request_cancellation(&self, job_id: uuid::Uuid) -> Result<()>;

    async fn insert_on_demand_trigger(&self, requested_by: &str) -> Result<uuid::Uuid>;
    async fn claim_next_on_demand_trigger(&self) -> Result<Option<OnDemandTrigger>>;
    async fn update_trigger_progress(
        &self,
        trigger_id: uuid::Uuid,
        step_progress: serde_json::Value,
    ) -> Result<()>;
    async fn finish_trigger(&self, trigger_id: uuid::Uuid, status: &str) -> Result<()>;
    async fn latest_trigger(&self) -> Result<Option<OnDemandTrigger>>;

    async fn recover_stale_jobs(&self) -> Result<u64>;
}

// ---------------------------------------------------------------------------
// Event publisher port
// ---------------------------------------------------------------------------

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: DomainEvent);
}

#[async_trait]
impl<T: EventPublisher + ?Sized> EventPublisher for std::sync::Arc<T> {
    async fn publish(&self, event: DomainEvent) {
        (**self).publish(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_newtype_display_and_conversion() {
        let v: VolumeId = "vol-1".into();
        assert_eq!(v.to_string(), "vol-1");
        assert_eq!(v.as_ref(), "vol-1");
    }

    #[test]
    fn session_expiry() {
        let expired = Session {
            token: "t".into(),
            project_id: "p".into(),
            expires_at: Utc::now() - chrono::Duration::seconds(1),
            dry_run: false,
        };
        assert!(expired.is_expired());
    }
}
