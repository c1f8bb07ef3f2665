//! Shared fixtures for the integration suite. Every test gets its own
//! tenant (and usually its own everything-else) keyed by a fresh UUID, so
//! tests can run concurrently against one shared database without
//! colliding.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use uuid::Uuid;

use flowctl_core::models::ConcurrencyStrategy;
use flowctl_core::Store;

/// Connects to `TEST_DATABASE_URL` and runs migrations. Panics (via
/// `expect`) if the env var is unset — integration tests are meant to be
/// skipped by `cargo test` in an environment with no Postgres, not to pass
/// silently against nothing.
pub async fn setup_test_store() -> Store {
    dotenv::dotenv().ok();
    let database_url =
        std::env::var("TEST_DATABASE_URL").expect("TEST_DATABASE_URL must be set for integration tests");

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("connect to test database");

    sqlx::migrate!("./migrations").run(&pool).await.expect("run migrations");

    Store::new(pool)
}

pub async fn create_tenant(store: &Store) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tenants (id) VALUES ($1)")
        .bind(id)
        .execute(&store.pool)
        .await
        .expect("insert tenant");
    id
}

pub async fn create_action(store: &Store, tenant_id: Uuid, action_id: &str) {
    sqlx::query("INSERT INTO actions (action_id, tenant_id) VALUES ($1, $2)")
        .bind(action_id)
        .bind(tenant_id)
        .execute(&store.pool)
        .await
        .expect("insert action");
}

pub struct TestWorker {
    pub id: Uuid,
    pub dispatcher_id: Uuid,
}

pub async fn create_worker(
    store: &Store,
    tenant_id: Uuid,
    max_runs: Option<i32>,
    actions: &[&str],
) -> TestWorker {
    let id = Uuid::new_v4();
    let dispatcher_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO workers (id, tenant_id, dispatcher_id, last_heartbeat_at, max_runs, is_active)
         VALUES ($1, $2, $3, NOW(), $4, true)",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(dispatcher_id)
    .bind(max_runs)
    .execute(&store.pool)
    .await
    .expect("insert worker");

    for action_id in actions {
        sqlx::query("INSERT INTO worker_actions (worker_id, action_id) VALUES ($1, $2)")
            .bind(id)
            .bind(action_id)
            .execute(&store.pool)
            .await
            .expect("insert worker action");
    }

    TestWorker { id, dispatcher_id }
}

pub async fn set_worker_heartbeat(store: &Store, worker_id: Uuid, at: DateTime<Utc>) {
    sqlx::query("UPDATE workers SET last_heartbeat_at = $1 WHERE id = $2")
        .bind(at)
        .bind(worker_id)
        .execute(&store.pool)
        .await
        .expect("update worker heartbeat");
}

pub async fn create_ticker(store: &Store) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO tickers (id, last_heartbeat_at, is_active) VALUES ($1, NOW(), true)")
        .bind(id)
        .execute(&store.pool)
        .await
        .expect("insert ticker");
    id
}

pub struct WorkflowVersionConcurrencyFixture {
    pub max_runs: i32,
    pub strategy: ConcurrencyStrategy,
    pub group_action_id: String,
}

pub async fn create_workflow_version(
    store: &Store,
    tenant_id: Uuid,
    concurrency: Option<WorkflowVersionConcurrencyFixture>,
) -> Uuid {
    let id = Uuid::new_v4();
    let (max_runs, strategy, action_id) = match concurrency {
        Some(c) => {
            let strategy_str = match c.strategy {
                ConcurrencyStrategy::GroupRoundRobin => "GROUP_ROUND_ROBIN",
                ConcurrencyStrategy::CancelInProgress => "CANCEL_IN_PROGRESS",
            };
            (Some(c.max_runs), Some(strategy_str), Some(c.group_action_id))
        }
        None => (None, None, None),
    };

    sqlx::query(
        "INSERT INTO workflow_versions
             (id, tenant_id, concurrency_max_runs, concurrency_strategy, concurrency_group_action_id)
         VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(max_runs)
    .bind(strategy)
    .bind(action_id)
    .execute(&store.pool)
    .await
    .expect("insert workflow version");

    id
}

pub async fn create_workflow_run(store: &Store, tenant_id: Uuid, workflow_version_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO workflow_runs (id, tenant_id, workflow_version_id, status) VALUES ($1, $2, $3, 'PENDING')",
    )
    .bind(id)
    .bind(tenant_id)
    .bind(workflow_version_id)
    .execute(&store.pool)
    .await
    .expect("insert workflow run");
    id
}

pub async fn create_get_group_key_run(store: &Store, tenant_id: Uuid, workflow_run_id: Uuid) -> Uuid {
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO get_group_key_runs (id, workflow_run_id, tenant_id, status) VALUES ($1, $2, $3, 'PENDING')",
    )
    .bind(id)
    .bind(workflow_run_id)
    .bind(tenant_id)
    .execute(&store.pool)
    .await
    .expect("insert get group key run");
    id
}

pub async fn create_job_run(store: &Store, workflow_run_id: Uuid) -> Uuid {
    let job_id = Uuid::new_v4();
    sqlx::query("INSERT INTO jobs (id, workflow_version_id) SELECT $1, workflow_version_id FROM workflow_runs WHERE id = $2")
        .bind(job_id)
        .bind(workflow_run_id)
        .execute(&store.pool)
        .await
        .expect("insert job");

    let job_run_id = Uuid::new_v4();
    sqlx::query("INSERT INTO job_runs (id, job_id, workflow_run_id) VALUES ($1, $2, $3)")
        .bind(job_run_id)
        .bind(job_id)
        .bind(workflow_run_id)
        .execute(&store.pool)
        .await
        .expect("insert job run");

    job_run_id
}

pub struct StepRunFixture {
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub action_id: String,
    pub order_num: i32,
    pub retries: i32,
}

pub async fn create_step_run(store: &Store, fixture: StepRunFixture) -> Uuid {
    let id = Uuid::new_v4();
    let step_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO step_runs
             (id, tenant_id, job_run_id, step_id, action_id, order_num, status, retries, input)
         VALUES ($1, $2, $3, $4, $5, $6, 'PENDING_ASSIGNMENT', $7, '{}'::jsonb)",
    )
    .bind(id)
    .bind(fixture.tenant_id)
    .bind(fixture.job_run_id)
    .bind(step_id)
    .bind(fixture.action_id)
    .bind(fixture.order_num)
    .bind(fixture.retries)
    .execute(&store.pool)
    .await
    .expect("insert step run");
    id
}

pub async fn link_step_run_order(store: &Store, predecessor_id: Uuid, successor_id: Uuid) {
    sqlx::query("INSERT INTO step_run_order (predecessor_id, successor_id) VALUES ($1, $2)")
        .bind(predecessor_id)
        .bind(successor_id)
        .execute(&store.pool)
        .await
        .expect("insert step run order");
}

pub async fn step_run_status(store: &Store, step_run_id: Uuid) -> String {
    sqlx::query_scalar("SELECT status FROM step_runs WHERE id = $1")
        .bind(step_run_id)
        .fetch_one(&store.pool)
        .await
        .expect("fetch step run status")
}
