//! Domain events — an audit-oriented record of everything the snapshot
//! worker and restore engine do, decoupled from whatever ends up consuming
//! them (today: structured logs via [`crate::domain::publisher`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::ports::{ProjectId, SnapshotId, VmId, VolumeId};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DomainEvent {
    SnapshotRunStarted {
        run_id: uuid::Uuid,
        run_type: String,
        timestamp: DateTime<Utc>,
    },
    SnapshotRunFinished {
        run_id: uuid::Uuid,
        status: String,
        created: u32,
        deleted: u32,
        failed: u32,
        skipped: u32,
        timestamp: DateTime<Utc>,
    },
    SnapshotCreated {
        run_id: uuid::Uuid,
        volume_id: VolumeId,
        policy_name: String,
        remote_snapshot_id: SnapshotId,
        timestamp: DateTime<Utc>,
    },
    SnapshotSkipped {
        run_id: uuid::Uuid,
        volume_id: VolumeId,
        policy_name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SnapshotFailed {
        run_id: uuid::Uuid,
        volume_id: VolumeId,
        policy_name: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    SnapshotPruned {
        volume_id: VolumeId,
        policy_name: String,
        remote_snapshot_id: SnapshotId,
        timestamp: DateTime<Utc>,
    },
    PolicyAssigned {
        volume_id: VolumeId,
        policy_set_name: String,
        source: String,
        timestamp: DateTime<Utc>,
    },
    PolicyExcluded {
        volume_id: VolumeId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    OnDemandTriggerClaimed {
        trigger_id: uuid::Uuid,
        timestamp: DateTime<Utc>,
    },
    OnDemandTriggerFinished {
        trigger_id: uuid::Uuid,
        status: String,
        timestamp: DateTime<Utc>,
    },
    SessionGrantDegraded {
        project_id: ProjectId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
    RestorePlanned {
        job_id: uuid::Uuid,
        vm_id: VmId,
        step_count: usize,
        timestamp: DateTime<Utc>,
    },
    RestoreJobTransitioned {
        job_id: uuid::Uuid,
        from: String,
        to: String,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },
    RestoreStepTransitioned {
        job_id: uuid::Uuid,
        ordinal: u32,
        kind: String,
        status: String,
        timestamp: DateTime<Utc>,
    },
    RestoreRollbackPerformed {
        job_id: uuid::Uuid,
        resource_kind: String,
        resource_id: String,
        timestamp: DateTime<Utc>,
    },
}

impl DomainEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            DomainEvent::SnapshotRunStarted { timestamp, .. }
            | DomainEvent::SnapshotRunFinished { timestamp, .. }
            | DomainEvent::SnapshotCreated { timestamp, .. }
            | DomainEvent::SnapshotSkipped { timestamp, .. }
            | DomainEvent::SnapshotFailed { timestamp, .. }
            | DomainEvent::SnapshotPruned { timestamp, .. }
            | DomainEvent::PolicyAssigned { timestamp, .. }
            | DomainEvent::PolicyExcluded { timestamp, .. }
            | DomainEvent::OnDemandTriggerClaimed { timestamp, .. }
            | DomainEvent::OnDemandTriggerFinished { timestamp, .. }
            | DomainEvent::SessionGrantDegraded { timestamp, .. }
            | DomainEvent::RestorePlanned { timestamp, .. }
            | DomainEvent::RestoreJobTransitioned { timestamp, .. }
            | DomainEvent::RestoreStepTransitioned { timestamp, .. }
            | DomainEvent::RestoreRollbackPerformed { timestamp, .. } => *timestamp,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::SnapshotRunStarted { .. } => "snapshot_run_started",
            DomainEvent::SnapshotRunFinished { .. } => "snapshot_run_finished",
            DomainEvent::SnapshotCreated { .. } => "snapshot_created",
            DomainEvent::SnapshotSkipped { .. } => "snapshot_skipped",
            DomainEvent::SnapshotFailed { .. } => "snapshot_failed",
            DomainEvent::SnapshotPruned { .. } => "snapshot_pruned",
            DomainEvent::PolicyAssigned { .. } => "policy_assigned",
            DomainEvent::PolicyExcluded { .. } => "policy_excluded",
            DomainEvent::OnDemandTriggerClaimed { .. } => "on_demand_trigger_claimed",
            DomainEvent::OnDemandTriggerFinished { .. } => "on_demand_trigger_finished",
            DomainEvent::SessionGrantDegraded { .. } => "session_grant_degraded",
            DomainEvent::RestorePlanned { .. } => "restore_planned",
            DomainEvent::RestoreJobTransitioned { .. } => "restore_job_transitioned",
            DomainEvent::RestoreStepTransitioned { .. } => "restore_step_transitioned",
            DomainEvent::RestoreRollbackPerformed { .. } => "restore_rollback_performed",
        }
    }
}

pub fn snapshot_created(
    run_id: uuid::Uuid,
    volume_id: VolumeId,
    policy_name: impl Into<String>,
    remote_snapshot_id: SnapshotId,
) -> DomainEvent {
    DomainEvent::SnapshotCreated {
        run_id,
        volume_id,
        policy_name: policy_name.into(),
        remote_snapshot_id,
        timestamp: Utc::now(),
    }
}

pub fn snapshot_skipped(
    run_id: uuid::Uuid,
    volume_id: VolumeId,
    policy_name: impl Into<String>,
    reason: impl Into<String>,
) -> DomainEvent {
    DomainEvent::SnapshotSkipped {
        run_id,
        volume_id,
        policy_name: policy_name.into(),
        reason: reason.into(),
        timestamp: Utc::now(),
    }
}

pub fn restore_job_transitioned(
    job_id: uuid::Uuid,
    from: impl Into<String>,
    to: impl Into<String>,
    reason: Option<String>,
) -> DomainEvent {
    DomainEvent::RestoreJobTransitioned {
        job_id,
        from: from.into(),
        to: to.into(),
        reason,
        timestamp: Utc::now(),
    }
}

pub fn restore_step_transitioned(
    job_id: uuid::Uuid,
    ordinal: u32,
    kind: impl Into<String>,
    status: impl Into<String>,
) -> DomainEvent {
    DomainEvent::RestoreStepTransitioned {
        job_id,
        ordinal,
        kind: kind.into(),
        status: status.into(),
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_and_timestamp_round_trip() {
        let ev = snapshot_created(uuid::Uuid::nil(), "vol-1".into(), "daily_5", "snap-1".into());
        assert_eq!(ev.event_type(), "snapshot_created");
        assert!(ev.timestamp() <= Utc::now());
    }

    #[test]
    fn serde_round_trip_preserves_tag() {
        let ev = restore_job_transitioned(uuid::Uuid::nil(), "PLANNED", "PENDING", None);
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"RestoreJobTransitioned\""));
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_type(), ev.event_type());
    }
}
