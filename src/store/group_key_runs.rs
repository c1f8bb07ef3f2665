use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Assignment, GetGroupKeyRun, RunStatus};
use crate::store::step_runs::{run_status_from_str, run_status_str};
use crate::store::Store;

#[derive(Debug, Default)]
pub struct GroupKeyRunUpdate {
    pub status: Option<RunStatus>,
    pub worker_id: Option<Option<Uuid>>,
    pub ticker_id: Option<Option<Uuid>>,
    pub requeue_after: Option<DateTime<Utc>>,
    pub output: Option<Option<String>>,
    pub error: Option<Option<String>>,
    pub cancelled_reason: Option<Option<String>>,
}

impl Store {
    /// The `getConcurrencyGroupActionId` a GetGroupKeyRun's WorkflowVersion
    /// was published with — `None` if the run's workflow run or version
    /// vanished, or the version has no concurrency settings at all.
    pub async fn get_group_key_action_id(
        &self,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<String>> {
        let action_id = sqlx::query_scalar::<_, Option<String>>(
            "SELECT wv.concurrency_group_action_id
             FROM workflow_runs wr
             INNER JOIN workflow_versions wv ON wv.id = wr.workflow_version_id
             WHERE wr.id = $1 AND wr.tenant_id = $2",
        )
        .bind(workflow_run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?
        .flatten();

        Ok(action_id)
    }

    /// The GetGroupKeyRun created alongside a WorkflowRun whose version has
    /// concurrency settings (§3, §4.4 step 1).
    pub async fn get_group_key_run_id_for_workflow_run(
        &self,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM get_group_key_runs WHERE workflow_run_id = $1 AND tenant_id = $2",
        )
        .bind(workflow_run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// `listGetGroupKeyRunsToRequeue`: same shape as `listRunsToRequeue` but
    /// with no predecessor guard — a GetGroupKeyRun has no StepRunOrder.
    pub async fn list_group_key_runs_to_requeue(
        &self,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Vec<GetGroupKeyRun>> {
        let rows = sqlx::query(
            "SELECT id, workflow_run_id, tenant_id, status, worker_id, ticker_id,
                    requeue_after, schedule_timeout_at, input, output, error,
                    cancelled_reason, created_at
             FROM get_group_key_runs
             WHERE tenant_id = $1
               AND requeue_after < NOW()
               AND status IN ('PENDING', 'PENDING_ASSIGNMENT')
             ORDER BY created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_group_key_run).collect())
    }

    pub async fn list_group_key_runs_to_reassign(
        &self,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Vec<GetGroupKeyRun>> {
        let rows = sqlx::query(
            "SELECT ggr.id, ggr.workflow_run_id, ggr.tenant_id, ggr.status, ggr.worker_id,
                    ggr.ticker_id, ggr.requeue_after, ggr.schedule_timeout_at, ggr.input,
                    ggr.output, ggr.error, ggr.cancelled_reason, ggr.created_at
             FROM get_group_key_runs ggr
             LEFT JOIN workers w ON w.id = ggr.worker_id
             WHERE ggr.tenant_id = $1
               AND ggr.status = 'ASSIGNED'
               AND w.last_heartbeat_at < NOW() - INTERVAL '5 seconds'
             ORDER BY ggr.created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_group_key_run).collect())
    }

    /// Convenience path for group-key runs (§4.2): pick the live worker with
    /// the fewest currently-running step-runs, rather than paying for a
    /// skip-locked pool scan. Acceptable because contention is low — at most
    /// one GetGroupKeyRun per WorkflowRun. Draws its candidate pool from
    /// `list_live_workers_for_action`, the same liveness listing the plain
    /// worker registry exposes for callers that don't need the atomic
    /// skip-locked path.
    pub async fn assign_group_key_run_least_loaded(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
        action_id: &str,
    ) -> anyhow::Result<Option<Assignment>> {
        let candidates = self.list_live_workers_for_action(tenant_id, action_id, 6).await?;
        if candidates.is_empty() {
            return Ok(None);
        }

        let mut least_loaded: Option<(Uuid, Uuid, i64)> = None;
        for worker in &candidates {
            let load: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM step_runs WHERE worker_id = $1 AND status IN ('ASSIGNED', 'RUNNING')",
            )
            .bind(worker.id)
            .fetch_one(&self.pool)
            .await?;

            if least_loaded.as_ref().map_or(true, |(.., best_load)| load < *best_load) {
                least_loaded = Some((worker.id, worker.dispatcher_id, load));
            }
        }
        let (worker_id, dispatcher_id, _) = least_loaded.expect("candidates is non-empty");

        let updated = sqlx::query(
            "UPDATE get_group_key_runs
             SET worker_id = $1, status = 'ASSIGNED', updated_at = NOW()
             WHERE id = $2 AND tenant_id = $3 AND status = 'PENDING_ASSIGNMENT'
             RETURNING id",
        )
        .bind(worker_id)
        .bind(run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        if updated.is_none() {
            return Ok(None);
        }

        Ok(Some(Assignment {
            worker_id,
            dispatcher_id,
        }))
    }

    pub async fn update_group_key_run(
        &self,
        run_id: &Uuid,
        tenant_id: &Uuid,
        update: GroupKeyRunUpdate,
    ) -> anyhow::Result<Option<GetGroupKeyRun>> {
        let status_str = update.status.map(run_status_str);
        let (worker_set, worker_val) = match update.worker_id {
            Some(v) => (true, v),
            None => (false, None),
        };
        let (ticker_set, ticker_val) = match update.ticker_id {
            Some(v) => (true, v),
            None => (false, None),
        };
        let (output_set, output_val) = match update.output {
            Some(v) => (true, v),
            None => (false, None),
        };
        let (error_set, error_val) = match update.error {
            Some(v) => (true, v),
            None => (false, None),
        };
        let (cancelled_reason_set, cancelled_reason_val) = match update.cancelled_reason {
            Some(v) => (true, v),
            None => (false, None),
        };

        let row = sqlx::query(
            "UPDATE get_group_key_runs
             SET
               status = CASE
                   WHEN status IN ('SUCCEEDED', 'FAILED', 'CANCELLED') THEN status
                   ELSE COALESCE($1, status)
               END,
               worker_id = CASE WHEN $2 THEN $3 ELSE worker_id END,
               ticker_id = CASE WHEN $4 THEN $5 ELSE ticker_id END,
               requeue_after = COALESCE($6, requeue_after),
               output = CASE WHEN $7 THEN $8 ELSE output END,
               error = CASE WHEN $9 THEN $10 ELSE error END,
               cancelled_reason = CASE WHEN $11 THEN $12 ELSE cancelled_reason END,
               updated_at = NOW()
             WHERE id = $13 AND tenant_id = $14
             RETURNING id, workflow_run_id, tenant_id, status, worker_id, ticker_id,
                       requeue_after, schedule_timeout_at, input, output, error,
                       cancelled_reason, created_at",
        )
        .bind(status_str)
        .bind(worker_set)
        .bind(worker_val)
        .bind(ticker_set)
        .bind(ticker_val)
        .bind(update.requeue_after)
        .bind(output_set)
        .bind(output_val)
        .bind(error_set)
        .bind(error_val)
        .bind(cancelled_reason_set)
        .bind(cancelled_reason_val)
        .bind(run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_group_key_run))
    }
}

fn row_to_group_key_run(row: &sqlx::postgres::PgRow) -> GetGroupKeyRun {
    GetGroupKeyRun {
        id: row.get("id"),
        workflow_run_id: row.get("workflow_run_id"),
        tenant_id: row.get("tenant_id"),
        status: run_status_from_str(row.get::<String, _>("status").as_str()),
        worker_id: row.get("worker_id"),
        ticker_id: row.get("ticker_id"),
        requeue_after: row.get("requeue_after"),
        schedule_timeout_at: row.get("schedule_timeout_at"),
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        cancelled_reason: row.get("cancelled_reason"),
        created_at: row.get("created_at"),
    }
}
