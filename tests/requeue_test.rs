#[path = "common.rs"]
mod common;

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use flowctl_core::bus::InMemoryBus;
use flowctl_core::requeue::RequeueLoop;
use flowctl_core::Config;

/// Scenario 2: a RUNNING StepRun whose worker has gone stale (heartbeat past
/// `workerHeartbeatRunning`) with retry budget left is bumped back to
/// PENDING_ASSIGNMENT with its retry count incremented and its worker
/// cleared, then reassigned.
#[tokio::test]
async fn stale_running_worker_reassigns_within_retry_budget() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    common::create_action(&store, tenant_id, "compute").await;

    let stale_worker = common::create_worker(&store, tenant_id, None, &["compute"]).await;
    common::set_worker_heartbeat(&store, stale_worker.id, Utc::now() - ChronoDuration::seconds(90)).await;

    let fresh_worker = common::create_worker(&store, tenant_id, None, &["compute"]).await;

    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let step_run_id = common::create_step_run(
        &store,
        StepRunFixture { tenant_id, job_run_id, action_id: "compute".to_string(), order_num: 0, retries: 3 },
    )
    .await;
    sqlx::query("UPDATE step_runs SET status = 'RUNNING', worker_id = $1, retry_count = 0 WHERE id = $2")
        .bind(stale_worker.id)
        .bind(step_run_id)
        .execute(&store.pool)
        .await
        .unwrap();

    let bus: Arc<dyn flowctl_core::bus::MessageBus> = InMemoryBus::shared();
    let requeue_loop = RequeueLoop::new(store.clone(), bus, Config::default());
    requeue_loop.sweep_tenant(&tenant_id).await.unwrap();

    assert_eq!(common::step_run_status(&store, step_run_id).await, "ASSIGNED");

    let retry_count: i32 = sqlx::query_scalar("SELECT retry_count FROM step_runs WHERE id = $1")
        .bind(step_run_id)
        .fetch_one(&store.pool)
        .await
        .unwrap();
    assert_eq!(retry_count, 1);

    let worker_id: Option<uuid::Uuid> = sqlx::query_scalar("SELECT worker_id FROM step_runs WHERE id = $1")
        .bind(step_run_id)
        .fetch_one(&store.pool)
        .await
        .unwrap();
    assert_eq!(worker_id, Some(fresh_worker.id), "should pick up the only live worker");
}

/// Scenario 3: a PENDING_ASSIGNMENT StepRun with no supporting worker ever
/// showing up times out to CANCELLED(SCHEDULING_TIMED_OUT) once its
/// `scheduleTimeoutAt` has passed, cascading to later steps.
#[tokio::test]
async fn scheduling_timeout_cancels_and_cascades() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;

    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let timed_out_step = common::create_step_run(
        &store,
        StepRunFixture { tenant_id, job_run_id, action_id: "no-such-action".to_string(), order_num: 0, retries: 0 },
    )
    .await;
    let later_step = common::create_step_run(
        &store,
        StepRunFixture { tenant_id, job_run_id, action_id: "compute".to_string(), order_num: 1, retries: 0 },
    )
    .await;

    sqlx::query("UPDATE step_runs SET schedule_timeout_at = $1, requeue_after = $1 WHERE id = $2")
        .bind(Utc::now() - ChronoDuration::seconds(1))
        .bind(timed_out_step)
        .execute(&store.pool)
        .await
        .unwrap();

    let bus: Arc<dyn flowctl_core::bus::MessageBus> = InMemoryBus::shared();
    let requeue_loop = RequeueLoop::new(store.clone(), bus, Config::default());
    requeue_loop.sweep_tenant(&tenant_id).await.unwrap();

    assert_eq!(common::step_run_status(&store, timed_out_step).await, "CANCELLED");
    let reason: Option<String> =
        sqlx::query_scalar("SELECT cancelled_reason FROM step_runs WHERE id = $1")
            .bind(timed_out_step)
            .fetch_one(&store.pool)
            .await
            .unwrap();
    assert_eq!(reason.as_deref(), Some("SCHEDULING_TIMED_OUT"));

    assert_eq!(common::step_run_status(&store, later_step).await, "CANCELLED");
    let later_reason: Option<String> =
        sqlx::query_scalar("SELECT cancelled_reason FROM step_runs WHERE id = $1")
            .bind(later_step)
            .fetch_one(&store.pool)
            .await
            .unwrap();
    assert_eq!(later_reason.as_deref(), Some("PREVIOUS_STEP_CANCELLED"));
}

/// P7: a PENDING_ASSIGNMENT StepRun with a worker that only becomes live
/// partway through is reassigned within one sweep after the heartbeat lands.
#[tokio::test]
async fn requeue_tick_picks_up_newly_live_worker() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    common::create_action(&store, tenant_id, "compute").await;

    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let step_run_id = common::create_step_run(
        &store,
        StepRunFixture { tenant_id, job_run_id, action_id: "compute".to_string(), order_num: 0, retries: 0 },
    )
    .await;
    // requeueAfter in the past so the first sweep is eligible to act on it.
    sqlx::query("UPDATE step_runs SET requeue_after = $1 WHERE id = $2")
        .bind(Utc::now() - ChronoDuration::seconds(1))
        .bind(step_run_id)
        .execute(&store.pool)
        .await
        .unwrap();

    let bus: Arc<dyn flowctl_core::bus::MessageBus> = InMemoryBus::shared();
    let requeue_loop = RequeueLoop::new(store.clone(), bus.clone(), Config::default());

    // No worker yet: sweep just pushes requeueAfter out, run stays parked.
    requeue_loop.sweep_tenant(&tenant_id).await.unwrap();
    assert_eq!(common::step_run_status(&store, step_run_id).await, "PENDING_ASSIGNMENT");

    // A live worker shows up; force requeueAfter due again and sweep once more.
    common::create_worker(&store, tenant_id, None, &["compute"]).await;
    sqlx::query("UPDATE step_runs SET requeue_after = $1 WHERE id = $2")
        .bind(Utc::now() - ChronoDuration::seconds(1))
        .bind(step_run_id)
        .execute(&store.pool)
        .await
        .unwrap();
    requeue_loop.sweep_tenant(&tenant_id).await.unwrap();

    assert_eq!(common::step_run_status(&store, step_run_id).await, "ASSIGNED");
}
