//! Row-shaped types for the durable job store. These are plain data; the
//! invariants around them (unique partial indexes, cascade deletes, atomic
//! counters) live in [`crate::store::postgres`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::domain::ports::{ProjectId, SnapshotId, VmId, VolumeId};
use crate::error::Error;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:expr),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq)]
        pub enum $name {
            $($variant),+
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                let s = match self {
                    $(Self::$variant => $text),+
                };
                write!(f, "{}", s)
            }
        }

        impl FromStr for $name {
            type Err = Error;
            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::Internal(format!("unrecognized {} value: {}", stringify!($name), other))),
                }
            }
        }

        // Serializes and parses on the wire tag (§6.1/§6.3), not the Rust
        // variant name, so JSON bodies and the rule file use the same
        // spelling as `Display`/`FromStr`.
        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

string_enum!(RunType { Scheduled => "scheduled", OnDemand => "on_demand" });

string_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Partial => "partial",
    Failed => "failed",
});

/// The subset of [`RunStatus`] a finalized run can settle into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunFinalStatus {
    Completed,
    Partial,
    Failed,
}

impl From<RunFinalStatus> for RunStatus {
    fn from(v: RunFinalStatus) -> Self {
        match v {
            RunFinalStatus::Completed => RunStatus::Completed,
            RunFinalStatus::Partial => RunStatus::Partial,
            RunFinalStatus::Failed => RunStatus::Failed,
        }
    }
}

string_enum!(SnapshotAction {
    Created => "created",
    Deleted => "deleted",
    Skipped => "skipped",
    Failed => "failed",
});

string_enum!(RestoreMode { New => "NEW", Replace => "REPLACE" });

string_enum!(IpStrategy {
    NewIps => "NEW_IPS",
    TrySameIps => "TRY_SAME_IPS",
    SameIpsOrFail => "SAME_IPS_OR_FAIL",
    ManualIp => "MANUAL_IP",
});

string_enum!(RestoreJobStatus {
    Planned => "PLANNED",
    Pending => "PENDING",
    Running => "RUNNING",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
    Canceled => "CANCELED",
    Interrupted => "INTERRUPTED",
});

impl RestoreJobStatus {
    /// Jobs the unique partial index on `(vm_id)` treats as "in flight".
    pub fn is_in_flight(self) -> bool {
        matches!(self, RestoreJobStatus::Pending | RestoreJobStatus::Running)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RestoreJobStatus::Succeeded
                | RestoreJobStatus::Failed
                | RestoreJobStatus::Canceled
                | RestoreJobStatus::Interrupted
        )
    }
}

string_enum!(RestoreStepStatus {
    Pending => "PENDING",
    Running => "RUNNING",
    Succeeded => "SUCCEEDED",
    Failed => "FAILED",
    Skipped => "SKIPPED",
});

string_enum!(StepKind {
    ValidateLiveState => "VALIDATE_LIVE_STATE",
    EnsureServiceUser => "ENSURE_SERVICE_USER",
    QuotaCheck => "QUOTA_CHECK",
    DeleteExistingVm => "DELETE_EXISTING_VM",
    WaitVmDeleted => "WAIT_VM_DELETED",
    CleanupOldPorts => "CLEANUP_OLD_PORTS",
    CreateVolumeFromSnapshot => "CREATE_VOLUME_FROM_SNAPSHOT",
    WaitVolumeAvailable => "WAIT_VOLUME_AVAILABLE",
    CreatePorts => "CREATE_PORTS",
    CreateServer => "CREATE_SERVER",
    WaitServerActive => "WAIT_SERVER_ACTIVE",
    Finalize => "FINALIZE",
    CleanupOldStorage => "CLEANUP_OLD_STORAGE",
});

/// A volume's binding to a policy set, as produced by Stage A (§4.4/§4.5).
/// `source = "operator"` rows are never overwritten by a fresh policy pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub volume_id: VolumeId,
    pub project_id: ProjectId,
    pub rule_name: String,
    pub policies: Vec<String>,
    pub retention: HashMap<String, u32>,
    pub source: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRun {
    pub id: uuid::Uuid,
    pub run_type: RunType,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: RunStatus,
    pub created: u32,
    pub deleted: u32,
    pub failed: u32,
    pub skipped: u32,
    pub dry_run: bool,
}

impl SnapshotRun {
    pub fn new(run_type: RunType, dry_run: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            run_type,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Running,
            created: 0,
            deleted: 0,
            failed: 0,
            skipped: 0,
            dry_run,
        }
    }

    /// §4.3: `failed` if nothing was created and something failed; `partial`
    /// if both created and failed are nonzero; `completed` otherwise. Skips
    /// (including size-rejected ones) never influence this.
    pub fn computed_final_status(&self) -> RunFinalStatus {
        if self.created == 0 && self.failed > 0 {
            RunFinalStatus::Failed
        } else if self.failed > 0 && self.created > 0 {
            RunFinalStatus::Partial
        } else {
            RunFinalStatus::Completed
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub run_id: uuid::Uuid,
    pub volume_id: VolumeId,
    pub policy_name: String,
    pub action: SnapshotAction,
    pub remote_snapshot_id: Option<String>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnDemandTrigger {
    pub id: uuid::Uuid,
    pub requested_by: String,
    pub status: String,
    pub step_progress: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreJob {
    pub id: uuid::Uuid,
    pub vm_id: VmId,
    pub snapshot_id: SnapshotId,
    pub project_id: ProjectId,
    pub mode: RestoreMode,
    pub ip_strategy: IpStrategy,
    pub manual_ips: Option<HashMap<String, String>>,
    pub cleanup_old_storage: bool,
    pub delete_source_snapshot: bool,
    pub security_group_ids: Vec<String>,
    pub status: RestoreJobStatus,
    pub plan: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub requested_by: String,
    pub last_heartbeat: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreStep {
    pub job_id: uuid::Uuid,
    pub ordinal: u32,
    pub kind: StepKind,
    pub status: RestoreStepStatus,
    pub detail: serde_json::Value,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_status_round_trips_through_display_and_fromstr() {
        assert_eq!(RunStatus::Partial.to_string(), "partial");
        assert_eq!("partial".parse::<RunStatus>().unwrap(), RunStatus::Partial);
    }

    #[test]
    fn computed_final_status_matches_spec_table() {
        let mut run = SnapshotRun::new(RunType::Scheduled, false);
        assert_eq!(run.computed_final_status(), RunFinalStatus::Completed);

        run.failed = 1;
        assert_eq!(run.computed_final_status(), RunFinalStatus::Failed);

        run.created = 3;
        assert_eq!(run.computed_final_status(), RunFinalStatus::Partial);
    }

    #[test]
    fn restore_job_status_in_flight() {
        assert!(RestoreJobStatus::Pending.is_in_flight());
        assert!(RestoreJobStatus::Running.is_in_flight());
        assert!(!RestoreJobStatus::Planned.is_in_flight());
        assert!(RestoreJobStatus::Succeeded.is_terminal());
    }
}
