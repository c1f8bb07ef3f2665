use sqlx::Row;
use uuid::Uuid;

use crate::models::{
    ConcurrencyStrategy, WorkflowRun, WorkflowRunStatus, WorkflowVersion, WorkflowVersionConcurrency,
};
use crate::store::Store;

fn workflow_run_status_from_str(s: &str) -> WorkflowRunStatus {
    match s {
        "PENDING" => WorkflowRunStatus::Pending,
        "QUEUED" => WorkflowRunStatus::Queued,
        "RUNNING" => WorkflowRunStatus::Running,
        "SUCCEEDED" => WorkflowRunStatus::Succeeded,
        "FAILED" => WorkflowRunStatus::Failed,
        _ => WorkflowRunStatus::Cancelled,
    }
}

fn row_to_workflow_run(row: &sqlx::postgres::PgRow) -> WorkflowRun {
    WorkflowRun {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        workflow_version_id: row.get("workflow_version_id"),
        status: workflow_run_status_from_str(row.get::<String, _>("status").as_str()),
        group_key: row.get("group_key"),
        created_at: row.get("created_at"),
    }
}

impl Store {
    pub async fn get_workflow_run(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<WorkflowRun>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, workflow_version_id, status, group_key, created_at
             FROM workflow_runs WHERE id = $1 AND tenant_id = $2",
        )
        .bind(run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_workflow_run))
    }

    pub async fn get_workflow_version(
        &self,
        version_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<WorkflowVersion>> {
        let row = sqlx::query(
            "SELECT id, tenant_id, concurrency_max_runs, concurrency_strategy,
                    concurrency_group_action_id
             FROM workflow_versions WHERE id = $1 AND tenant_id = $2",
        )
        .bind(version_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else { return Ok(None) };

        let max_runs: Option<i32> = row.get("concurrency_max_runs");
        let concurrency = max_runs.map(|max_runs| {
            let strategy: String = row.get("concurrency_strategy");
            WorkflowVersionConcurrency {
                max_runs,
                limit_strategy: if strategy == "CANCEL_IN_PROGRESS" {
                    ConcurrencyStrategy::CancelInProgress
                } else {
                    ConcurrencyStrategy::GroupRoundRobin
                },
                get_concurrency_group_action_id: row.get("concurrency_group_action_id"),
            }
        });

        Ok(Some(WorkflowVersion {
            id: row.get("id"),
            tenant_id: row.get("tenant_id"),
            concurrency,
        }))
    }

    /// Sets the run's computed group key and moves it to QUEUED, as the
    /// reaction to `GetGroupKeyRunFinished` (§4.4).
    pub async fn set_workflow_run_group_key_and_queued(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
        group_key: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE workflow_runs SET group_key = $1, status = 'QUEUED', updated_at = NOW()
             WHERE id = $2 AND tenant_id = $3",
        )
        .bind(group_key)
        .bind(run_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_running_workflow_runs_for_group(
        &self,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        group_key: &str,
    ) -> anyhow::Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM workflow_runs
             WHERE tenant_id = $1 AND workflow_version_id = $2 AND group_key = $3 AND status = 'RUNNING'",
        )
        .bind(tenant_id)
        .bind(workflow_version_id)
        .bind(group_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Atomically admits a single QUEUED run to RUNNING, but only if the
    /// group's running count is still below `max_runs` at the moment of the
    /// update — re-reads the count inside the same statement so two
    /// concurrent `GetGroupKeyRunFinished` handlers for the same group can't
    /// both admit past the cap (P4).
    pub async fn try_admit_workflow_run(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        group_key: &str,
        max_runs: i32,
    ) -> anyhow::Result<bool> {
        let result = sqlx::query(
            "UPDATE workflow_runs
             SET status = 'RUNNING', updated_at = NOW()
             WHERE id = $1 AND tenant_id = $2 AND status = 'QUEUED'
               AND (
                 SELECT COUNT(*) FROM workflow_runs wr
                 WHERE wr.tenant_id = $2 AND wr.workflow_version_id = $3
                   AND wr.group_key = $4 AND wr.status = 'RUNNING'
               ) < $5",
        )
        .bind(run_id)
        .bind(tenant_id)
        .bind(workflow_version_id)
        .bind(group_key)
        .bind(max_runs)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Unconditionally admits a run already reserved a slot by
    /// `pop_workflow_runs_round_robin`'s atomic pop.
    pub async fn mark_workflow_run_running(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE workflow_runs SET status = 'RUNNING', updated_at = NOW()
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(run_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `popWorkflowRunsRoundRobin`: up to `max_runs` QUEUED runs, one per
    /// distinct group key, round-robin over group keys in insertion order.
    /// The pop and the PENDING transition happen in one statement so no
    /// other sweep can observe a half-popped state.
    pub async fn pop_workflow_runs_round_robin(
        &self,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        max_runs: i32,
    ) -> anyhow::Result<Vec<WorkflowRun>> {
        let rows = sqlx::query(
            "WITH ranked AS (
                 SELECT id, group_key, created_at,
                        ROW_NUMBER() OVER (PARTITION BY group_key ORDER BY created_at ASC) AS rn,
                        MIN(created_at) OVER (PARTITION BY group_key) AS group_first_seen
                 FROM workflow_runs
                 WHERE tenant_id = $1 AND workflow_version_id = $2 AND status = 'QUEUED'
             ),
             selected AS (
                 SELECT id FROM ranked
                 ORDER BY rn ASC, group_first_seen ASC
                 LIMIT $3
             )
             UPDATE workflow_runs
             SET status = 'PENDING', updated_at = NOW()
             WHERE id IN (SELECT id FROM selected)
             RETURNING id, tenant_id, workflow_version_id, status, group_key, created_at",
        )
        .bind(tenant_id)
        .bind(workflow_version_id)
        .bind(max_runs as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_workflow_run).collect())
    }

    /// For CANCEL_IN_PROGRESS: the finishing run's groupKey's RUNNING and
    /// QUEUED runs, each oldest-first.
    pub async fn list_running_and_queued_for_group(
        &self,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        group_key: &str,
    ) -> anyhow::Result<(Vec<WorkflowRun>, Vec<WorkflowRun>)> {
        let running = sqlx::query(
            "SELECT id, tenant_id, workflow_version_id, status, group_key, created_at
             FROM workflow_runs
             WHERE tenant_id = $1 AND workflow_version_id = $2 AND group_key = $3 AND status = 'RUNNING'
             ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .bind(workflow_version_id)
        .bind(group_key)
        .fetch_all(&self.pool)
        .await?;

        let queued = sqlx::query(
            "SELECT id, tenant_id, workflow_version_id, status, group_key, created_at
             FROM workflow_runs
             WHERE tenant_id = $1 AND workflow_version_id = $2 AND group_key = $3 AND status = 'QUEUED'
             ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .bind(workflow_version_id)
        .bind(group_key)
        .fetch_all(&self.pool)
        .await?;

        Ok((
            running.iter().map(row_to_workflow_run).collect(),
            queued.iter().map(row_to_workflow_run).collect(),
        ))
    }

    pub async fn cancel_workflow_run(&self, run_id: &Uuid, tenant_id: &Uuid) -> anyhow::Result<()> {
        sqlx::query(
            "UPDATE workflow_runs SET status = 'CANCELLED', updated_at = NOW()
             WHERE id = $1 AND tenant_id = $2",
        )
        .bind(run_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// StepRuns currently RUNNING for a WorkflowRun, via its JobRuns — used
    /// to target `step-run-cancelled` notifications for CANCEL_IN_PROGRESS.
    pub async fn list_running_step_run_ids_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
    ) -> anyhow::Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            "SELECT sr.id FROM step_runs sr
             INNER JOIN job_runs jr ON jr.id = sr.job_run_id
             WHERE jr.workflow_run_id = $1 AND sr.status = 'RUNNING'",
        )
        .bind(workflow_run_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// (jobRunId, jobId) pairs belonging to a WorkflowRun, used by
    /// `queueJobRuns` to populate the `JobRunQueued` task's payload (§6).
    pub async fn list_job_runs_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
    ) -> anyhow::Result<Vec<(Uuid, Uuid)>> {
        let rows = sqlx::query("SELECT id, job_id FROM job_runs WHERE workflow_run_id = $1")
            .bind(workflow_run_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(|r| (r.get("id"), r.get("job_id"))).collect())
    }
}
