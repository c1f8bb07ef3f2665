#[path = "common.rs"]
mod common;

use common::*;
use flowctl_core::models::RunStatus;
use flowctl_core::store::step_runs::StepRunUpdate;

/// P3: without `rerun`, a terminal StepRun retains its status across any
/// number of further update attempts.
#[tokio::test]
async fn terminal_status_absorbs_updates_without_rerun() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let step_run_id = common::create_step_run(
        &store,
        StepRunFixture {
            tenant_id,
            job_run_id,
            action_id: "compute".to_string(),
            order_num: 0,
            retries: 0,
        },
    )
    .await;

    store
        .update_step_run(
            &step_run_id,
            &tenant_id,
            StepRunUpdate { status: Some(RunStatus::Succeeded), ..Default::default() },
        )
        .await
        .unwrap();
    assert_eq!(common::step_run_status(&store, step_run_id).await, "SUCCEEDED");

    for _ in 0..3 {
        store
            .update_step_run(
                &step_run_id,
                &tenant_id,
                StepRunUpdate { status: Some(RunStatus::PendingAssignment), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(common::step_run_status(&store, step_run_id).await, "SUCCEEDED");
    }
}

/// Scenario 6: rerunning a SUCCEEDED StepRun archives its result, clears
/// output/error/cancelled fields, and moves it back to PENDING. A second
/// rerun produces a second archive row.
#[tokio::test]
async fn rerun_archives_result_and_resets_status() {
    let store = common::setup_test_store().await;
    let tenant_id = common::create_tenant(&store).await;
    let version_id = common::create_workflow_version(&store, tenant_id, None).await;
    let workflow_run_id = common::create_workflow_run(&store, tenant_id, version_id).await;
    let job_run_id = common::create_job_run(&store, workflow_run_id).await;

    let step_run_id = common::create_step_run(
        &store,
        StepRunFixture {
            tenant_id,
            job_run_id,
            action_id: "compute".to_string(),
            order_num: 0,
            retries: 0,
        },
    )
    .await;

    store
        .update_step_run(
            &step_run_id,
            &tenant_id,
            StepRunUpdate {
                status: Some(RunStatus::Succeeded),
                output: Some(Some(serde_json::json!({"result": 42}))),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    store.archive_step_run_result_from_step_run(&step_run_id, &tenant_id).await.unwrap();
    store
        .update_step_run(
            &step_run_id,
            &tenant_id,
            StepRunUpdate { status: Some(RunStatus::Pending), rerun: true, ..Default::default() },
        )
        .await
        .unwrap();

    assert_eq!(common::step_run_status(&store, step_run_id).await, "PENDING");
    let output: Option<serde_json::Value> =
        sqlx::query_scalar("SELECT output FROM step_runs WHERE id = $1")
            .bind(step_run_id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
    assert!(output.is_none());

    // Second rerun, second archive.
    store
        .update_step_run(
            &step_run_id,
            &tenant_id,
            StepRunUpdate { status: Some(RunStatus::Succeeded), ..Default::default() },
        )
        .await
        .unwrap();
    store.archive_step_run_result_from_step_run(&step_run_id, &tenant_id).await.unwrap();
    store
        .update_step_run(
            &step_run_id,
            &tenant_id,
            StepRunUpdate { status: Some(RunStatus::Pending), rerun: true, ..Default::default() },
        )
        .await
        .unwrap();

    let archive_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM step_run_result_archives WHERE step_run_id = $1")
            .bind(step_run_id)
            .fetch_one(&store.pool)
            .await
            .unwrap();
    assert_eq!(archive_count, 2);
}
