//! Postgres-backed implementation of [`JobStoreApi`]. All cross-process
//! signaling (on-demand triggers, the restore concurrency guard) is pushed
//! into the database rather than reasoned about in application code: a
//! partial unique index enforces "at most one trigger pending/running" and
//! "at most one restore per vm_id in flight", so the invariant holds
//! regardless of how many HTTP worker processes race against it.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use tracing::{info, instrument, warn};

use crate::domain::ports::{JobStoreApi, ProjectId, SnapshotId, VmId, VolumeId};
use crate::error::{Error, Result};
use crate::store::models::{
    Assignment, OnDemandTrigger, RestoreJob, RestoreJobStatus, RestoreStep, RestoreStepStatus,
    RunFinalStatus, RunStatus, SnapshotRecord, SnapshotRun,
};

/// Unique-violation SQLSTATE code — used to recognize the restore
/// concurrency guard firing instead of an arbitrary constraint failure.
const UNIQUE_VIOLATION: &str = "23505";

pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(2)
            .connect(database_url)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    #[cfg(test)]
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(SCHEMA).execute(&self.pool).await?;
        info!("job store schema verified");
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS snapshot_runs (
    id UUID PRIMARY KEY,
    run_type TEXT NOT NULL,
    started_at TIMESTAMPTZ NOT NULL,
    finished_at TIMESTAMPTZ,
    status TEXT NOT NULL,
    created INT NOT NULL DEFAULT 0,
    deleted INT NOT NULL DEFAULT 0,
    failed INT NOT NULL DEFAULT 0,
    skipped INT NOT NULL DEFAULT 0,
    dry_run BOOLEAN NOT NULL
);

CREATE TABLE IF NOT EXISTS snapshot_records (
    run_id UUID NOT NULL REFERENCES snapshot_runs(id) ON DELETE CASCADE,
    volume_id TEXT NOT NULL,
    policy_name TEXT NOT NULL,
    action TEXT NOT NULL,
    remote_snapshot_id TEXT,
    reason TEXT,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_snapshot_records_volume_policy_day
    ON snapshot_records (volume_id, policy_name, (created_at::date));

CREATE TABLE IF NOT EXISTS policy_assignments (
    volume_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    rule_name TEXT NOT NULL,
    policies JSONB NOT NULL,
    retention JSONB NOT NULL,
    source TEXT NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS on_demand_triggers (
    id UUID PRIMARY KEY,
    requested_by TEXT NOT NULL,
    status TEXT NOT NULL,
    step_progress JSONB NOT NULL DEFAULT '[]',
    created_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_live_trigger
    ON on_demand_triggers ((1))
    WHERE status IN ('pending', 'running');

CREATE TABLE IF NOT EXISTS restore_jobs (
    id UUID PRIMARY KEY,
    vm_id TEXT NOT NULL,
    snapshot_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    mode TEXT NOT NULL,
    ip_strategy TEXT NOT NULL,
    manual_ips JSONB,
    cleanup_old_storage BOOLEAN NOT NULL,
    delete_source_snapshot BOOLEAN NOT NULL,
    security_group_ids JSONB NOT NULL DEFAULT '[]',
    status TEXT NOT NULL,
    plan JSONB NOT NULL,
    result JSONB,
    requested_by TEXT NOT NULL,
    last_heartbeat TIMESTAMPTZ NOT NULL,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_one_restore_per_vm
    ON restore_jobs (vm_id)
    WHERE status IN ('PENDING', 'RUNNING');

CREATE TABLE IF NOT EXISTS restore_steps (
    job_id UUID NOT NULL REFERENCES restore_jobs(id) ON DELETE CASCADE,
    ordinal INT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    detail JSONB NOT NULL DEFAULT '{}',
    started_at TIMESTAMPTZ,
    finished_at TIMESTAMPTZ,
    PRIMARY KEY (job_id, ordinal)
);
"#;

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err.as_database_error().and_then(|e| e.code()), Some(code) if code == UNIQUE_VIOLATION)
}

#[async_trait]
impl JobStoreApi for PostgresJobStore {
    #[instrument(skip(self, run))]
    async fn insert_snapshot_run(&self, run: &SnapshotRun) -> Result<uuid::Uuid> {
        sqlx::query(
            "INSERT INTO snapshot_runs (id, run_type, started_at, finished_at, status, created, deleted, failed, skipped, dry_run)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(run.id)
        .bind(run.run_type.to_string())
        .bind(run.started_at)
        .bind(run.finished_at)
        .bind(run.status.to_string())
        .bind(run.created as i32)
        .bind(run.deleted as i32)
        .bind(run.failed as i32)
        .bind(run.skipped as i32)
        .bind(run.dry_run)
        .execute(&self.pool)
        .await?;
        Ok(run.id)
    }

    #[instrument(skip(self, record))]
    async fn append_snapshot_record(&self, run_id: uuid::Uuid, record: &SnapshotRecord) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO snapshot_records (run_id, volume_id, policy_name, action, remote_snapshot_id, reason, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(run_id)
        .bind(record.volume_id.as_ref())
        .bind(&record.policy_name)
        .bind(record.action.to_string())
        .bind(&record.remote_snapshot_id)
        .bind(&record.reason)
        .bind(record.created_at)
        .execute(&mut *tx)
        .await?;

        let column = match record.action {
            crate::store::models::SnapshotAction::Created => "created",
            crate::store::models::SnapshotAction::Deleted => "deleted",
            crate::store::models::SnapshotAction::Failed => "failed",
            crate::store::models::SnapshotAction::Skipped => "skipped",
        };
        sqlx::query(&format!(
            "UPDATE snapshot_runs SET {column} = {column} + 1 WHERE id = $1"
        ))
        .bind(run_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn finalize_snapshot_run(
        &self,
        run_id: uuid::Uuid,
        final_status: Option<RunFinalStatus>,
    ) -> Result<RunFinalStatus> {
        let row = sqlx::query("SELECT created, failed FROM snapshot_runs WHERE id = $1")
            .bind(run_id)
            .fetch_one(&self.pool)
            .await?;
        let created: i32 = row.try_get("created")?;
        let failed: i32 = row.try_get("failed")?;

        let status = final_status.unwrap_or_else(|| {
            if created == 0 && failed > 0 {
                RunFinalStatus::Failed
            } else if failed > 0 && created > 0 {
                RunFinalStatus::Partial
            } else {
                RunFinalStatus::Completed
            }
        });

        let run_status: RunStatus = status.into();
        sqlx::query("UPDATE snapshot_runs SET status = $1, finished_at = $2 WHERE id = $3")
            .bind(run_status.to_string())
            .bind(Utc::now())
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        Ok(status)
    }

    async fn has_snapshot_today(&self, volume_id: &VolumeId, policy_name: &str) -> Result<bool> {
        let row = sqlx::query(
            "SELECT EXISTS (
                SELECT 1 FROM snapshot_records
                WHERE volume_id = $1 AND policy_name = $2 AND action = 'created'
                  AND created_at::date = (now() AT TIME ZONE 'utc')::date
            ) AS exists",
        )
        .bind(volume_id.as_ref())
        .bind(policy_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("exists")?)
    }

    #[instrument(skip(self, assignments))]
    async fn write_assignments(&self, assignments: &[Assignment]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for a in assignments {
            sqlx::query(
                "INSERT INTO policy_assignments (volume_id, project_id, rule_name, policies, retention, source, updated_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)
                 ON CONFLICT (volume_id) DO UPDATE SET
                    project_id = EXCLUDED.project_id,
                    rule_name = EXCLUDED.rule_name,
                    policies = EXCLUDED.policies,
                    retention = EXCLUDED.retention,
                    source = EXCLUDED.source,
                    updated_at = EXCLUDED.updated_at
                 WHERE policy_assignments.source != 'operator'",
            )
            .bind(a.volume_id.as_ref())
            .bind(a.project_id.as_ref())
            .bind(&a.rule_name)
            .bind(serde_json::to_value(&a.policies).unwrap_or(serde_json::Value::Null))
            .bind(serde_json::to_value(&a.retention).unwrap_or(serde_json::Value::Null))
            .bind(&a.source)
            .bind(a.updated_at)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list_active_assignments(&self) -> Result<Vec<Assignment>> {
        let rows = sqlx::query("SELECT * FROM policy_assignments").fetch_all(&self.pool).await?;
        rows.into_iter().map(row_to_assignment).collect()
    }

    async fn get_assignment(&self, volume_id: &VolumeId) -> Result<Option<Assignment>> {
        let row = sqlx::query("SELECT * FROM policy_assignments WHERE volume_id = $1")
            .bind(volume_id.as_ref())
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_assignment).transpose()
    }

    #[instrument(skip(self, job, steps), fields(vm_id = %job.vm_id))]
    async fn insert_restore_job(&self, job: &RestoreJob, steps: &[RestoreStep]) -> Result<uuid::Uuid> {
        let mut tx = self.pool.begin().await?;

        let insert = sqlx::query(
            "INSERT INTO restore_jobs
             (id, vm_id, snapshot_id, project_id, mode, ip_strategy, manual_ips, cleanup_old_storage,
              delete_source_snapshot, security_group_ids, status, plan, result, requested_by,
              last_heartbeat, created_at, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17)",
        )
        .bind(job.id)
        .bind(job.vm_id.as_ref())
        .bind(job.snapshot_id.as_ref())
        .bind(job.project_id.as_ref())
        .bind(job.mode.to_string())
        .bind(job.ip_strategy.to_string())
        .bind(serde_json::to_value(&job.manual_ips).unwrap_or(serde_json::Value::Null))
        .bind(job.cleanup_old_storage)
        .bind(job.delete_source_snapshot)
        .bind(serde_json::to_value(&job.security_group_ids).unwrap_or(serde_json::Value::Null))
        .bind(job.status.to_string())
        .bind(&job.plan)
        .bind(&job.result)
        .bind(&job.requested_by)
        .bind(job.last_heartbeat)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&mut *tx)
        .await;

        if let Err(e) = insert {
            return if is_unique_violation(&e) {
                warn!(vm_id = %job.vm_id, "rejected concurrent restore attempt");
                Err(Error::ConcurrentRestore { vm_id: job.vm_id.to_string() })
            } else {
                Err(e.into())
            };
        }

        for step in steps {
            sqlx::query(
                "INSERT INTO restore_steps (job_id, ordinal, kind, status, detail, started_at, finished_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7)",
            )
            .bind(step.job_id)
            .bind(step.ordinal as i32)
            .bind(step.kind.to_string())
            .bind(step.status.to_string())
            .bind(&step.detail)
            .bind(step.started_at)
            .bind(step.finished_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(job.id)
    }

    async fn get_restore_job(&self, job_id: uuid::Uuid) -> Result<Option<RestoreJob>> {
        let row = sqlx::query("SELECT * FROM restore_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_restore_job).transpose()
    }

    async fn list_restore_jobs(&self, vm_id: Option<&VmId>) -> Result<Vec<RestoreJob>> {
        let rows = match vm_id {
            Some(vm) => {
                sqlx::query("SELECT * FROM restore_jobs WHERE vm_id = $1 ORDER BY created_at DESC")
                    .bind(vm.as_ref())
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM restore_jobs ORDER BY created_at DESC")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_restore_job).collect()
    }

    async fn list_restore_steps(&self, job_id: uuid::Uuid) -> Result<Vec<RestoreStep>> {
        let rows = sqlx::query("SELECT * FROM restore_steps WHERE job_id = $1 ORDER BY ordinal ASC")
            .bind(job_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_restore_step).collect()
    }

    #[instrument(skip(self, result))]
    async fn update_restore_job_status(
        &self,
        job_id: uuid::Uuid,
        status: RestoreJobStatus,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE restore_jobs SET status = $1, result = COALESCE($2, result), updated_at = $3, last_heartbeat = $3
             WHERE id = $4",
        )
        .bind(status.to_string())
        .bind(result)
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self, detail))]
    async fn update_restore_step(
        &self,
        job_id: uuid::Uuid,
        ordinal: u32,
        status: RestoreStepStatus,
        detail: serde_json::Value,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "UPDATE restore_steps SET
                status = $1,
                detail = $2,
                started_at = COALESCE(started_at, CASE WHEN $1 = 'RUNNING' THEN $3 END),
                finished_at = CASE WHEN $1 IN ('SUCCEEDED','FAILED','SKIPPED') THEN $3 ELSE finished_at END
             WHERE job_id = $4 AND ordinal = $5",
        )
        .bind(status.to_string())
        .bind(&detail)
        .bind(now)
        .bind(job_id)
        .bind(ordinal as i32)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE restore_jobs SET last_heartbeat = $1, updated_at = $1 WHERE id = $2")
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn observe_cancellation(&self, job_id: uuid::Uuid) -> Result<bool> {
        let row = sqlx::query("SELECT status FROM restore_jobs WHERE id = $1")
            .bind(job_id)
            .fetch_one(&self.pool)
            .await?;
        let status: String = row.try_get("status")?;
        Ok(status == RestoreJobStatus::Canceled.to_string())
    }

    async fn request_cancellation(&self, job_id: uuid::Uuid) -> Result<()> {
        // Idempotent: cancelling a terminal job is a no-op, never an error.
        sqlx::query(
            "UPDATE restore_jobs SET status = 'CANCELED', updated_at = $1
             WHERE id = $2 AND status IN ('PLANNED', 'PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_on_demand_trigger(&self, requested_by: &str) -> Result<uuid::Uuid> {
        let id = uuid::Uuid::new_v4();
        let result = sqlx::query(
            "INSERT INTO on_demand_triggers (id, requested_by, status, step_progress, created_at)
             VALUES ($1, $2, 'pending', '[]', $3)",
        )
        .bind(id)
        .bind(requested_by)
        .bind(Utc::now())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(id),
            Err(e) if is_unique_violation(&e) => {
                Err(Error::ConflictError("a snapshot trigger is already pending or running".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self))]
    async fn claim_next_on_demand_trigger(&self) -> Result<Option<OnDemandTrigger>> {
        let row = sqlx::query(
            "UPDATE on_demand_triggers SET status = 'running'
             WHERE id = (
                SELECT id FROM on_demand_triggers WHERE status = 'pending'
                ORDER BY created_at ASC LIMIT 1 FOR UPDATE SKIP LOCKED
             )
             RETURNING *",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_trigger).transpose()
    }

    async fn update_trigger_progress(
        &self,
        trigger_id: uuid::Uuid,
        step_progress: serde_json::Value,
    ) -> Result<()> {
        sqlx::query("UPDATE on_demand_triggers SET step_progress = $1 WHERE id = $2")
            .bind(step_progress)
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn finish_trigger(&self, trigger_id: uuid::Uuid, status: &str) -> Result<()> {
        sqlx::query("UPDATE on_demand_triggers SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(trigger_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn latest_trigger(&self) -> Result<Option<OnDemandTrigger>> {
        let row = sqlx::query("SELECT * FROM on_demand_triggers ORDER BY created_at DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_trigger).transpose()
    }

    #[instrument(skip(self))]
    async fn recover_stale_jobs(&self) -> Result<u64> {
        let jobs = sqlx::query(
            "UPDATE restore_jobs SET status = 'INTERRUPTED', updated_at = $1,
                result = jsonb_build_object('kind', 'Internal', 'message', 'process restarted')
             WHERE status IN ('PENDING', 'RUNNING')",
        )
        .bind(Utc::now())
        .execute(&self.pool)
        .await?
        .rows_affected();

        sqlx::query(
            "UPDATE on_demand_triggers SET status = 'failed' WHERE status = 'running'",
        )
        .execute(&self.pool)
        .await?;

        if jobs > 0 {
            warn!(count = jobs, "recovered restore jobs interrupted by process restart");
        }
        Ok(jobs)
    }
}

fn row_to_assignment(row: sqlx::postgres::PgRow) -> Result<Assignment> {
    Ok(Assignment {
        volume_id: VolumeId(row.try_get("volume_id")?),
        project_id: ProjectId(row.try_get("project_id")?),
        rule_name: row.try_get("rule_name")?,
        policies: serde_json::from_value(row.try_get("policies")?).unwrap_or_default(),
        retention: serde_json::from_value(row.try_get("retention")?).unwrap_or_default(),
        source: row.try_get("source")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_restore_job(row: sqlx::postgres::PgRow) -> Result<RestoreJob> {
    Ok(RestoreJob {
        id: row.try_get("id")?,
        vm_id: VmId(row.try_get("vm_id")?),
        snapshot_id: SnapshotId(row.try_get("snapshot_id")?),
        project_id: ProjectId(row.try_get("project_id")?),
        mode: row.try_get::<String, _>("mode")?.parse()?,
        ip_strategy: row.try_get::<String, _>("ip_strategy")?.parse()?,
        manual_ips: serde_json::from_value(row.try_get("manual_ips")?).unwrap_or(None),
        cleanup_old_storage: row.try_get("cleanup_old_storage")?,
        delete_source_snapshot: row.try_get("delete_source_snapshot")?,
        security_group_ids: serde_json::from_value(row.try_get("security_group_ids")?)
            .unwrap_or_default(),
        status: row.try_get::<String, _>("status")?.parse()?,
        plan: row.try_get("plan")?,
        result: row.try_get("result")?,
        requested_by: row.try_get("requested_by")?,
        last_heartbeat: row.try_get("last_heartbeat")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_restore_step(row: sqlx::postgres::PgRow) -> Result<RestoreStep> {
    Ok(RestoreStep {
        job_id: row.try_get("job_id")?,
        ordinal: row.try_get::<i32, _>("ordinal")? as u32,
        kind: row.try_get::<String, _>("kind")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        detail: row.try_get("detail")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
    })
}

fn row_to_trigger(row: sqlx::postgres::PgRow) -> Result<OnDemandTrigger> {
    Ok(OnDemandTrigger {
        id: row.try_get("id")?,
        requested_by: row.try_get("requested_by")?,
        status: row.try_get("status")?,
        step_progress: row.try_get("step_progress")?,
        created_at: row.try_get("created_at")?,
    })
}
