#[path = "common.rs"]
mod common;

use std::sync::Arc;

use flowctl_core::assigner::{AssignOutcome, Assigner};
use flowctl_core::bus::InMemoryBus;
use flowctl_core::Config;

use common::*;

/// P1 / scenario 5: a worker with `max_runs = 3` never carries more than 3
/// ASSIGNED+RUNNING step-runs, and the assigner correctly reports
/// `NoWorkerAvailable` once the slots fill up.
#[tokio::test]
async fn max_runs_bounds_concurrent_assignment() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    common::create_action(&store, tenant_id, "compute").await;
    let worker = common::create_worker(&store, tenant_id, Some(3), &["compute"]).await;

    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let bus: Arc<dyn flowctl_core::bus::MessageBus> = InMemoryBus::shared();
    let assigner = Assigner::new(store.clone(), bus, Config::default());

    let mut step_run_ids = Vec::new();
    for order_num in 0..10 {
        let id = common::create_step_run(
            &store,
            common::StepRunFixture {
                tenant_id,
                job_run_id,
                action_id: "compute".to_string(),
                order_num,
                retries: 0,
            },
        )
        .await;
        step_run_ids.push(id);
    }

    let mut assigned = 0;
    let mut rejected = 0;
    for step_run_id in &step_run_ids {
        match assigner.assign_step_run(step_run_id, &tenant_id).await.unwrap() {
            AssignOutcome::Assigned => assigned += 1,
            AssignOutcome::NoWorkerAvailable => rejected += 1,
        }
    }

    assert_eq!(assigned, 3, "only maxRuns slots should be filled");
    assert_eq!(rejected, 7);

    let occupied: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM step_runs WHERE worker_id = $1 AND status IN ('ASSIGNED', 'RUNNING')",
    )
    .bind(worker.id)
    .fetch_one(&store.pool)
    .await
    .unwrap();
    assert_eq!(occupied, 3);

    let parked: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM step_runs WHERE tenant_id = $1 AND status = 'PENDING_ASSIGNMENT'",
    )
    .bind(tenant_id)
    .fetch_one(&store.pool)
    .await
    .unwrap();
    assert_eq!(parked, 7);
}

/// A StepRun targeting an action no live worker supports gets parked in
/// PENDING_ASSIGNMENT with a future `requeueAfter`, untouched otherwise.
#[tokio::test]
async fn no_matching_worker_parks_without_mutating_worker_id() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    common::create_action(&store, tenant_id, "unsupported").await;

    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let step_run_id = common::create_step_run(
        &store,
        common::StepRunFixture {
            tenant_id,
            job_run_id,
            action_id: "unsupported".to_string(),
            order_num: 0,
            retries: 0,
        },
    )
    .await;

    let bus: Arc<dyn flowctl_core::bus::MessageBus> = InMemoryBus::shared();
    let assigner = Assigner::new(store.clone(), bus, Config::default());

    let outcome = assigner.assign_step_run(&step_run_id, &tenant_id).await.unwrap();
    assert_eq!(outcome, AssignOutcome::NoWorkerAvailable);

    let status = common::step_run_status(&store, step_run_id).await;
    assert_eq!(status, "PENDING_ASSIGNMENT");

    let worker_id: Option<uuid::Uuid> = sqlx::query_scalar("SELECT worker_id FROM step_runs WHERE id = $1")
        .bind(step_run_id)
        .fetch_one(&store.pool)
        .await
        .unwrap();
    assert!(worker_id.is_none());
}
