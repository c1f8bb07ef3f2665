pub mod common;
pub mod group_key_runs;
pub mod step_runs;
pub mod workers;
pub mod workflow_runs;

use sqlx::PgPool;
use std::time::Instant;

/// Wraps a connection pool and exposes the query contracts of §4.1: listing
/// candidates to requeue/reassign, atomic worker/ticker assignment, guarded
/// status updates, and round-robin workflow-run admission.
///
/// Cheap to clone; callers that serve different workloads (the dispatch loop,
/// the requeue sweep) are expected to hold their own pool sized for that
/// workload rather than share one pool's connection budget across both.
#[derive(Clone)]
pub struct Store {
    pub pool: PgPool,
}

impl Store {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_pool_metrics(&self, label: &str) {
        let size = self.pool.size();
        let num_idle = self.pool.num_idle();
        let active = size.saturating_sub(num_idle as u32);

        tracing::info!(
            pool = label,
            pool_size = size,
            idle_connections = num_idle,
            active_connections = active,
            "connection pool metrics"
        );
    }

    pub async fn sample_connection_acquisition_time(&self, label: &str) {
        let start = Instant::now();
        match self.pool.acquire().await {
            Ok(conn) => {
                let elapsed = start.elapsed();
                drop(conn);
                if elapsed.as_millis() > 10 {
                    tracing::warn!(
                        pool = label,
                        acquisition_time_ms = elapsed.as_millis(),
                        "slow connection acquisition"
                    );
                }
            }
            Err(e) => {
                tracing::error!(pool = label, error = %e, "failed to acquire connection");
            }
        }
    }
}
