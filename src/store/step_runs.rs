use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Assignment, CancelledReason, RunStatus, StepRun};
use crate::store::Store;

/// Fields a caller may want to change on a StepRun. `None` leaves the column
/// untouched (mirrors the store's `COALESCE($n, column)` update shape).
#[derive(Debug, Default)]
pub struct StepRunUpdate {
    pub status: Option<RunStatus>,
    pub worker_id: Option<Option<Uuid>>,
    pub ticker_id: Option<Option<Uuid>>,
    pub retry_count: Option<i32>,
    pub requeue_after: Option<DateTime<Utc>>,
    pub output: Option<Option<serde_json::Value>>,
    pub error: Option<Option<String>>,
    pub cancelled_reason: Option<Option<String>>,
    /// When true, a terminal status is allowed to move again; the caller is
    /// expected to have already archived the prior result.
    pub rerun: bool,
}

impl Store {
    /// `listRunsToRequeue`: StepRuns whose `requeueAfter` has elapsed, still
    /// in PENDING/PENDING_ASSIGNMENT, with every predecessor SUCCEEDED.
    pub async fn list_step_runs_to_requeue(&self, tenant_id: &Uuid) -> anyhow::Result<Vec<StepRun>> {
        let rows = sqlx::query(
            "SELECT sr.id, sr.tenant_id, sr.job_run_id, sr.step_id, sr.action_id, sr.order_num,
                    sr.status, sr.worker_id, sr.ticker_id, sr.retry_count, sr.retries,
                    sr.requeue_after, sr.schedule_timeout_at, sr.input, sr.output, sr.error,
                    sr.cancelled_reason, sr.created_at
             FROM step_runs sr
             WHERE sr.tenant_id = $1
               AND sr.requeue_after < NOW()
               AND sr.status IN ('PENDING', 'PENDING_ASSIGNMENT')
               AND NOT EXISTS (
                 SELECT 1 FROM step_run_order o
                 INNER JOIN step_runs pred ON pred.id = o.predecessor_id
                 WHERE o.successor_id = sr.id AND pred.status != 'SUCCEEDED'
               )
             ORDER BY sr.created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_step_run).collect())
    }

    /// `listRunsToReassign`: RUNNING with a stale worker and retry budget
    /// left, or ASSIGNED with a stale worker. Same predecessor guard as
    /// `listRunsToRequeue` — a reassigned run re-enters the Assigner, so it
    /// must still be eligible to run at all.
    pub async fn list_step_runs_to_reassign(&self, tenant_id: &Uuid) -> anyhow::Result<Vec<StepRun>> {
        let rows = sqlx::query(
            "SELECT sr.id, sr.tenant_id, sr.job_run_id, sr.step_id, sr.action_id, sr.order_num,
                    sr.status, sr.worker_id, sr.ticker_id, sr.retry_count, sr.retries,
                    sr.requeue_after, sr.schedule_timeout_at, sr.input, sr.output, sr.error,
                    sr.cancelled_reason, sr.created_at
             FROM step_runs sr
             LEFT JOIN workers w ON w.id = sr.worker_id
             WHERE sr.tenant_id = $1
               AND (
                 (sr.status = 'RUNNING' AND w.last_heartbeat_at < NOW() - INTERVAL '60 seconds'
                    AND sr.retry_count < sr.retries)
                 OR
                 (sr.status = 'ASSIGNED' AND w.last_heartbeat_at < NOW() - INTERVAL '5 seconds')
               )
               AND NOT EXISTS (
                 SELECT 1 FROM step_run_order o
                 INNER JOIN step_runs pred ON pred.id = o.predecessor_id
                 WHERE o.successor_id = sr.id AND pred.status != 'SUCCEEDED'
               )
             ORDER BY sr.created_at ASC",
        )
        .bind(tenant_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(row_to_step_run).collect())
    }

    /// `assignStepRunToWorker`: single-statement admission under
    /// `FOR UPDATE SKIP LOCKED`. Returns `None` (with no row mutated) if no
    /// worker currently qualifies.
    pub async fn assign_step_run_to_worker(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<Assignment>> {
        let mut tx = self.pool.begin().await?;
        crate::store::common::set_tenant_id_in_tx(&mut tx, tenant_id).await?;

        let target = sqlx::query(
            "SELECT status, action_id FROM step_runs WHERE id = $1 AND tenant_id = $2 FOR UPDATE",
        )
        .bind(step_run_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(target) = target else {
            tx.rollback().await?;
            return Ok(None);
        };

        let status: String = target.get("status");
        if status != "PENDING_ASSIGNMENT" {
            tx.rollback().await?;
            return Ok(None);
        }
        let action_id: String = target.get("action_id");

        let result = sqlx::query(
            "WITH candidate_worker AS (
                 SELECT w.id, w.dispatcher_id
                 FROM workers w
                 INNER JOIN worker_actions wa ON wa.worker_id = w.id
                 WHERE wa.action_id = $1
                   AND w.tenant_id = $2
                   AND w.is_active
                   AND w.last_heartbeat_at > NOW() - INTERVAL '5 seconds'
                   AND (
                     w.max_runs IS NULL
                     OR (
                       SELECT COUNT(*) FROM step_runs sr
                       WHERE sr.worker_id = w.id AND sr.status IN ('ASSIGNED', 'RUNNING')
                     ) < w.max_runs
                   )
                 ORDER BY random()
                 LIMIT 1
                 FOR UPDATE OF w SKIP LOCKED
             ),
             updated AS (
                 UPDATE step_runs
                 SET worker_id = (SELECT id FROM candidate_worker),
                     status = 'ASSIGNED',
                     updated_at = NOW()
                 WHERE id = $3
                   AND tenant_id = $2
                   AND EXISTS (SELECT 1 FROM candidate_worker)
                 RETURNING id
             )
             SELECT cw.id AS worker_id, cw.dispatcher_id
             FROM candidate_worker cw
             WHERE EXISTS (SELECT 1 FROM updated)",
        )
        .bind(&action_id)
        .bind(tenant_id)
        .bind(step_run_id)
        .fetch_optional(&mut *tx)
        .await?;

        match result {
            Some(row) => {
                tx.commit().await?;
                Ok(Some(Assignment {
                    worker_id: row.get("worker_id"),
                    dispatcher_id: row.get("dispatcher_id"),
                }))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// `assignStepRunToTicker`: analogous to worker assignment, selecting a
    /// live Ticker (6s heartbeat window) instead of an action-matched worker.
    pub async fn assign_step_run_to_ticker(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Option<Uuid>> {
        let mut tx = self.pool.begin().await?;

        let target = sqlx::query("SELECT status FROM step_runs WHERE id = $1 AND tenant_id = $2 FOR UPDATE")
            .bind(step_run_id)
            .bind(tenant_id)
            .fetch_optional(&mut *tx)
            .await?;

        let Some(target) = target else {
            tx.rollback().await?;
            return Ok(None);
        };
        let status: String = target.get("status");
        if status != "PENDING_ASSIGNMENT" {
            tx.rollback().await?;
            return Ok(None);
        }

        let result = sqlx::query(
            "WITH candidate_ticker AS (
                 SELECT id FROM tickers
                 WHERE is_active AND last_heartbeat_at > NOW() - INTERVAL '6 seconds'
                 ORDER BY random()
                 LIMIT 1
                 FOR UPDATE SKIP LOCKED
             ),
             updated AS (
                 UPDATE step_runs
                 SET ticker_id = (SELECT id FROM candidate_ticker), updated_at = NOW()
                 WHERE id = $1 AND tenant_id = $2 AND EXISTS (SELECT 1 FROM candidate_ticker)
                 RETURNING id
             )
             SELECT ct.id AS ticker_id FROM candidate_ticker ct WHERE EXISTS (SELECT 1 FROM updated)",
        )
        .bind(step_run_id)
        .bind(tenant_id)
        .fetch_optional(&mut *tx)
        .await?;

        match result {
            Some(row) => {
                tx.commit().await?;
                Ok(Some(row.get("ticker_id")))
            }
            None => {
                tx.rollback().await?;
                Ok(None)
            }
        }
    }

    /// `updateStepRun`: partial update with the terminal-status guard baked
    /// into the SQL itself, so a stray update issued after the row has
    /// already gone terminal is a no-op rather than a race.
    pub async fn update_step_run(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
        update: StepRunUpdate,
    ) -> anyhow::Result<Option<StepRun>> {
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
            "UPDATE step_runs
             SET
               status = CASE
                   WHEN status IN ('SUCCEEDED', 'FAILED', 'CANCELLED') AND NOT $1 THEN status
                   ELSE COALESCE($2, status)
               END,
               worker_id = CASE WHEN $3 THEN $4 ELSE worker_id END,
               ticker_id = CASE WHEN $5 THEN $6 ELSE ticker_id END,
               retry_count = COALESCE($7, retry_count),
               requeue_after = COALESCE($8, requeue_after),
               output = CASE
                   WHEN $9 THEN $10
                   WHEN $1 THEN NULL
                   ELSE output
               END,
               error = CASE
                   WHEN $11 THEN $12
                   WHEN $1 THEN NULL
                   ELSE error
               END,
               cancelled_reason = CASE
                   WHEN $13 THEN $14
                   WHEN $1 THEN NULL
                   ELSE cancelled_reason
               END,
               finished_at = CASE WHEN $1 THEN NULL ELSE finished_at END,
               cancelled_at = CASE WHEN $1 THEN NULL ELSE cancelled_at END,
               updated_at = NOW()
             WHERE id = $15 AND tenant_id = $16
             RETURNING id, tenant_id, job_run_id, step_id, action_id, order_num, status,
                       worker_id, ticker_id, retry_count, retries, requeue_after,
                       schedule_timeout_at, input, output, error, cancelled_reason, created_at",
        )
        .bind(update.rerun)
        .bind(status_str)
        .bind(worker_set)
        .bind(worker_val)
        .bind(ticker_set)
        .bind(ticker_val)
        .bind(update.retry_count)
        .bind(update.requeue_after)
        .bind(output_set)
        .bind(output_val)
        .bind(error_set)
        .bind(error_val)
        .bind(cancelled_reason_set)
        .bind(cancelled_reason_val)
        .bind(step_run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_step_run))
    }

    /// `resolveLaterStepRuns`: cascades a FAILED/CANCELLED StepRun onto every
    /// later StepRun in the same job run. Guarded by the terminal-status
    /// predicate, so a second call is a no-op (idempotent per §4.6).
    pub async fn resolve_later_step_runs(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<u64> {
        let source = sqlx::query(
            "SELECT job_run_id, order_num, status, cancelled_reason
             FROM step_runs WHERE id = $1 AND tenant_id = $2",
        )
        .bind(step_run_id)
        .bind(tenant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(source) = source else {
            return Ok(0);
        };
        let status: String = source.get("status");
        if status != "FAILED" && status != "CANCELLED" {
            return Ok(0);
        }

        let job_run_id: Uuid = source.get("job_run_id");
        let order_num: i32 = source.get("order_num");
        let ancestor_reason: Option<String> = source.get("cancelled_reason");
        let propagated = if ancestor_reason.as_deref() == Some(CancelledReason::TimedOut.as_str())
        {
            CancelledReason::PreviousStepTimedOut
        } else {
            CancelledReason::PreviousStepCancelled
        };

        let result = sqlx::query(
            "UPDATE step_runs
             SET status = 'CANCELLED', cancelled_reason = $1, cancelled_at = NOW(), updated_at = NOW()
             WHERE job_run_id = $2
               AND tenant_id = $3
               AND order_num > $4
               AND status NOT IN ('SUCCEEDED', 'FAILED', 'CANCELLED')",
        )
        .bind(propagated.as_str())
        .bind(job_run_id)
        .bind(tenant_id)
        .bind(order_num)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    /// `archiveStepRunResultFromStepRun`: snapshots the current result before
    /// a rerun clears it.
    pub async fn archive_step_run_result_from_step_run(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<Uuid> {
        let archive_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO step_run_result_archives
                 (id, step_run_id, order_num, input, output, error, cancelled_reason, archived_at)
             SELECT $1, id, order_num, input, output, error, cancelled_reason, NOW()
             FROM step_runs WHERE id = $2 AND tenant_id = $3",
        )
        .bind(archive_id)
        .bind(step_run_id)
        .bind(tenant_id)
        .execute(&self.pool)
        .await?;

        Ok(archive_id)
    }
}

pub(crate) fn run_status_str(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Pending => "PENDING",
        RunStatus::PendingAssignment => "PENDING_ASSIGNMENT",
        RunStatus::Assigned => "ASSIGNED",
        RunStatus::Running => "RUNNING",
        RunStatus::Succeeded => "SUCCEEDED",
        RunStatus::Failed => "FAILED",
        RunStatus::Cancelled => "CANCELLED",
    }
}

pub(crate) fn run_status_from_str(s: &str) -> RunStatus {
    match s {
        "PENDING" => RunStatus::Pending,
        "PENDING_ASSIGNMENT" => RunStatus::PendingAssignment,
        "ASSIGNED" => RunStatus::Assigned,
        "RUNNING" => RunStatus::Running,
        "SUCCEEDED" => RunStatus::Succeeded,
        "FAILED" => RunStatus::Failed,
        _ => RunStatus::Cancelled,
    }
}

fn row_to_step_run(row: &sqlx::postgres::PgRow) -> StepRun {
    use sqlx::Row;
    StepRun {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        job_run_id: row.get("job_run_id"),
        step_id: row.get("step_id"),
        action_id: row.get("action_id"),
        order_num: row.get("order_num"),
        status: run_status_from_str(row.get::<String, _>("status").as_str()),
        worker_id: row.get("worker_id"),
        ticker_id: row.get("ticker_id"),
        retry_count: row.get("retry_count"),
        retries: row.get("retries"),
        requeue_after: row.get("requeue_after"),
        schedule_timeout_at: row.get("schedule_timeout_at"),
        input: row.get("input"),
        output: row.get("output"),
        error: row.get("error"),
        cancelled_reason: row.get("cancelled_reason"),
        created_at: row.get("created_at"),
    }
}
