use chrono::Utc;
use sqlx::Row;
use uuid::Uuid;

use crate::models::{Ticker, Worker};
use crate::store::Store;

impl Store {
    pub async fn register_worker(
        &self,
        tenant_id: &Uuid,
        dispatcher_id: &Uuid,
        max_runs: Option<i32>,
        actions: &[String],
    ) -> anyhow::Result<Worker> {
        let worker_id = Uuid::new_v4();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO workers (id, tenant_id, dispatcher_id, last_heartbeat_at, max_runs, is_active)
             VALUES ($1, $2, $3, NOW(), $4, true)",
        )
        .bind(worker_id)
        .bind(tenant_id)
        .bind(dispatcher_id)
        .bind(max_runs)
        .execute(&mut *tx)
        .await?;

        for action_id in actions {
            sqlx::query(
                "INSERT INTO worker_actions (worker_id, action_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(worker_id)
            .bind(action_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        Ok(Worker {
            id: worker_id,
            tenant_id: *tenant_id,
            dispatcher_id: *dispatcher_id,
            last_heartbeat_at: Utc::now(),
            max_runs,
            is_active: true,
        })
    }

    /// Liveness Registry: a Worker is live iff its heartbeat is within the
    /// window the caller cares about (5s for ASSIGNED checks, 6s for
    /// group-key assignment, §3/§5).
    pub async fn update_worker_heartbeat(&self, worker_id: &Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE workers SET last_heartbeat_at = NOW() WHERE id = $1")
            .bind(worker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_ticker_heartbeat(&self, ticker_id: &Uuid) -> anyhow::Result<()> {
        sqlx::query("UPDATE tickers SET last_heartbeat_at = NOW() WHERE id = $1")
            .bind(ticker_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn register_ticker(&self) -> anyhow::Result<Ticker> {
        let ticker_id = Uuid::new_v4();
        sqlx::query(
            "INSERT INTO tickers (id, last_heartbeat_at, is_active) VALUES ($1, NOW(), true)",
        )
        .bind(ticker_id)
        .execute(&self.pool)
        .await?;

        Ok(Ticker {
            id: ticker_id,
            last_heartbeat_at: Utc::now(),
            is_active: true,
        })
    }

    /// `listWorkers(action, lastHeartbeatAfter, assignable)`: the convenience
    /// listing the Assigner's least-loaded group-key path reads from (§4.2).
    pub async fn list_live_workers_for_action(
        &self,
        tenant_id: &Uuid,
        action_id: &str,
        heartbeat_within_secs: i64,
    ) -> anyhow::Result<Vec<Worker>> {
        let rows = sqlx::query(
            "SELECT w.id, w.tenant_id, w.dispatcher_id, w.last_heartbeat_at, w.max_runs, w.is_active
             FROM workers w
             INNER JOIN worker_actions wa ON wa.worker_id = w.id
             WHERE wa.action_id = $1
               AND w.tenant_id = $2
               AND w.is_active
               AND w.last_heartbeat_at > NOW() - make_interval(secs => $3)",
        )
        .bind(action_id)
        .bind(tenant_id)
        .bind(heartbeat_within_secs as f64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| Worker {
                id: row.get("id"),
                tenant_id: row.get("tenant_id"),
                dispatcher_id: row.get("dispatcher_id"),
                last_heartbeat_at: row.get("last_heartbeat_at"),
                max_runs: row.get("max_runs"),
                is_active: row.get("is_active"),
            })
            .collect())
    }

    /// A single live ticker (heartbeat within `within_secs`) to own a
    /// timeout timer, picked at random among the currently-live set.
    pub async fn pick_live_ticker(&self, within: std::time::Duration) -> anyhow::Result<Option<Uuid>> {
        let id: Option<Uuid> = sqlx::query_scalar(
            "SELECT id FROM tickers
             WHERE is_active AND last_heartbeat_at > NOW() - make_interval(secs => $1)
             ORDER BY random() LIMIT 1",
        )
        .bind(within.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;
        Ok(id)
    }

    /// Deactivates workers that haven't heartbeat in a while and clears any
    /// assignment they still hold, so their step-runs become reassignable on
    /// the next sweep rather than waiting silently forever.
    pub async fn deactivate_stale_workers(&self, stale_after_secs: i64) -> anyhow::Result<u64> {
        let result = sqlx::query(
            "UPDATE workers SET is_active = false
             WHERE is_active AND last_heartbeat_at < NOW() - make_interval(secs => $1)",
        )
        .bind(stale_after_secs as f64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
