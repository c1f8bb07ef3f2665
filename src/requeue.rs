//! The Requeue/Reassign Loop (§4.3): per-tenant sweeps over
//! `listRunsToRequeue`/`listRunsToReassign` for both StepRuns and
//! GetGroupKeyRuns. Grounded on `handleGroupKeyActionRequeue` in
//! `queue.go` — one `errgroup` goroutine per candidate, errors aggregated,
//! the sweep itself never fails outright (§7).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::assigner::Assigner;
use crate::bus::MessageBus;
use crate::cascade::CascadingResolver;
use crate::config::Config;
use crate::models::{CancelledReason, GetGroupKeyRun, RunStatus, StepRun};
use crate::state_machine::retry_budget_remaining;
use crate::store::group_key_runs::GroupKeyRunUpdate;
use crate::store::step_runs::StepRunUpdate;
use crate::store::Store;

/// Bounds how many candidates from one sweep are driven concurrently, so a
/// tenant with a large backlog doesn't exhaust the sweep pool's connections.
const SWEEP_FANOUT: usize = 16;

pub struct RequeueLoop {
    store: Store,
    assigner: Assigner,
    cascade: CascadingResolver,
    config: Config,
}

impl RequeueLoop {
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, config: Config) -> Self {
        let assigner = Assigner::new(store.clone(), bus, config.clone());
        let cascade = CascadingResolver::new(store.clone());
        Self { store, assigner, cascade, config }
    }

    /// Runs one full sweep (requeue pass + reassign pass) for a tenant.
    /// Per-item failures are logged and aggregated but never abort the
    /// sweep (§4.3, §7) — the function itself only errors if the initial
    /// listing queries fail.
    pub async fn sweep_tenant(&self, tenant_id: &Uuid) -> anyhow::Result<()> {
        self.deactivate_stale_workers().await;
        self.sweep_step_run_requeue(tenant_id).await?;
        self.sweep_step_run_reassign(tenant_id).await?;
        self.sweep_group_key_requeue(tenant_id).await?;
        self.sweep_group_key_reassign(tenant_id).await?;
        Ok(())
    }

    /// Not tenant-scoped — a worker is a process, not tenant data — so this
    /// runs once per sweep tick regardless of how many tenants call in.
    /// Logged rather than propagated: a failed deactivation pass shouldn't
    /// block the requeue/reassign work that follows it.
    async fn deactivate_stale_workers(&self) {
        match self.store.deactivate_stale_workers(self.config.worker_stale_after.as_secs() as i64).await {
            Ok(count) if count > 0 => {
                tracing::info!(count, "deactivated stale workers");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(error = %err, "failed to deactivate stale workers"),
        }
    }

    async fn sweep_step_run_requeue(&self, tenant_id: &Uuid) -> anyhow::Result<()> {
        let candidates = self.store.list_step_runs_to_requeue(tenant_id).await?;
        run_bounded(candidates, SWEEP_FANOUT, |sr| self.requeue_one_step_run(sr)).await;
        Ok(())
    }

    async fn requeue_one_step_run(&self, step_run: StepRun) {
        let tenant_id = step_run.tenant_id;
        let result: anyhow::Result<()> = async {
            let now = Utc::now();
            let timed_out = match step_run.schedule_timeout_at {
                Some(deadline) => deadline < now,
                None => now > step_run.created_at + self.config.default_schedule_timeout,
            };

            if timed_out {
                self.store
                    .update_step_run(
                        &step_run.id,
                        &tenant_id,
                        StepRunUpdate {
                            status: Some(RunStatus::Cancelled),
                            cancelled_reason: Some(Some(
                                CancelledReason::SchedulingTimedOut.as_str().to_string(),
                            )),
                            ..Default::default()
                        },
                    )
                    .await?;
                self.cascade.on_step_run_terminal(&step_run.id, &tenant_id).await?;
                return Ok(());
            }

            self.store
                .update_step_run(
                    &step_run.id,
                    &tenant_id,
                    StepRunUpdate {
                        requeue_after: Some(now + self.config.requeue_interval),
                        ..Default::default()
                    },
                )
                .await?;
            self.assigner.assign_step_run(&step_run.id, &tenant_id).await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(step_run_id = %step_run.id, tenant_id = %tenant_id, error = %err, "requeue sweep item failed");
        }
    }

    async fn sweep_step_run_reassign(&self, tenant_id: &Uuid) -> anyhow::Result<()> {
        let candidates = self.store.list_step_runs_to_reassign(tenant_id).await?;
        run_bounded(candidates, SWEEP_FANOUT, |sr| self.reassign_one_step_run(sr)).await;
        Ok(())
    }

    async fn reassign_one_step_run(&self, step_run: StepRun) {
        let tenant_id = step_run.tenant_id;
        let result: anyhow::Result<()> = async {
            let update = match step_run.status {
                RunStatus::Assigned => StepRunUpdate {
                    status: Some(RunStatus::PendingAssignment),
                    worker_id: Some(None),
                    ..Default::default()
                },
                RunStatus::Running if retry_budget_remaining(step_run.retry_count, step_run.retries) => {
                    StepRunUpdate {
                        status: Some(RunStatus::PendingAssignment),
                        worker_id: Some(None),
                        retry_count: Some(step_run.retry_count + 1),
                        ..Default::default()
                    }
                }
                // RUNNING with exhausted retry budget: left as-is (§7, §9 open question 1).
                _ => return Ok(()),
            };

            self.store.update_step_run(&step_run.id, &tenant_id, update).await?;
            self.assigner.assign_step_run(&step_run.id, &tenant_id).await?;
            Ok(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(step_run_id = %step_run.id, tenant_id = %tenant_id, error = %err, "reassign sweep item failed");
        }
    }

    async fn sweep_group_key_requeue(&self, tenant_id: &Uuid) -> anyhow::Result<()> {
        let candidates = self.store.list_group_key_runs_to_requeue(tenant_id).await?;
        run_bounded(candidates, SWEEP_FANOUT, |ggr| self.requeue_one_group_key_run(ggr)).await;
        Ok(())
    }

    async fn requeue_one_group_key_run(&self, run: GetGroupKeyRun) {
        let tenant_id = run.tenant_id;
        let result: anyhow::Result<()> = async {
            let now = Utc::now();
            let timed_out = match run.schedule_timeout_at {
                Some(deadline) => deadline < now,
                None => now > run.created_at + self.config.default_schedule_timeout,
            };

            if timed_out {
                self.store
                    .update_group_key_run(
                        &run.id,
                        &tenant_id,
                        GroupKeyRunUpdate {
                            status: Some(RunStatus::Cancelled),
                            cancelled_reason: Some(Some(
                                CancelledReason::SchedulingTimedOut.as_str().to_string(),
                            )),
                            ..Default::default()
                        },
                    )
                    .await?;
                return Ok(());
            }

            self.store
                .update_group_key_run(
                    &run.id,
                    &tenant_id,
                    GroupKeyRunUpdate {
                        requeue_after: Some(now + self.config.requeue_interval),
                        ..Default::default()
                    },
                )
                .await?;

            if let Some(action_id) = self.store.get_group_key_action_id(&run.workflow_run_id, &tenant_id).await? {
                self.assigner
                    .assign_group_key_run(&run.id, &run.workflow_run_id, &tenant_id, &action_id)
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(get_group_key_run_id = %run.id, tenant_id = %tenant_id, error = %err, "group-key requeue sweep item failed");
        }
    }

    async fn sweep_group_key_reassign(&self, tenant_id: &Uuid) -> anyhow::Result<()> {
        let candidates = self.store.list_group_key_runs_to_reassign(tenant_id).await?;
        run_bounded(candidates, SWEEP_FANOUT, |ggr| self.reassign_one_group_key_run(ggr)).await;
        Ok(())
    }

    async fn reassign_one_group_key_run(&self, run: GetGroupKeyRun) {
        let tenant_id = run.tenant_id;
        let result: anyhow::Result<()> = async {
            self.store
                .update_group_key_run(
                    &run.id,
                    &tenant_id,
                    GroupKeyRunUpdate {
                        status: Some(RunStatus::PendingAssignment),
                        worker_id: Some(None),
                        ..Default::default()
                    },
                )
                .await?;

            if let Some(action_id) = self.store.get_group_key_action_id(&run.workflow_run_id, &tenant_id).await? {
                self.assigner
                    .assign_group_key_run(&run.id, &run.workflow_run_id, &tenant_id, &action_id)
                    .await?;
            }
            Ok(())
        }
        .await;

        if let Err(err) = result {
            tracing::warn!(get_group_key_run_id = %run.id, tenant_id = %tenant_id, error = %err, "group-key reassign sweep item failed");
        }
    }

    /// Spawns the periodic sweep as a named background task, ticking
    /// independently of any bus-triggered `group-key-action-requeue-tick`
    /// message so the store, not the bus, stays authoritative (§4.3).
    pub fn spawn(self: Arc<Self>, tenant_id: Uuid) -> tokio::task::JoinHandle<()> {
        let interval = self.config.sweep_tick_interval;
        tokio::task::Builder::new()
            .name("requeue-sweep")
            .spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if let Err(err) = self.sweep_tenant(&tenant_id).await {
                        tracing::error!(tenant_id = %tenant_id, error = %err, "requeue sweep failed");
                    }
                }
            })
            .expect("spawn requeue-sweep task")
    }
}

/// Runs `f` over `items` with at most `limit` futures in flight at once,
/// mirroring the bounded concurrent group of §5 ("a bounded concurrent
/// group whose error is aggregated without aborting siblings" — here each
/// item already swallows and logs its own error, so there is nothing left
/// to aggregate at this layer).
async fn run_bounded<T, F, Fut>(items: Vec<T>, limit: usize, f: F)
where
    F: Fn(T) -> Fut,
    Fut: std::future::Future<Output = ()>,
{
    use futures::stream::StreamExt;

    futures::stream::iter(items)
        .for_each_concurrent(limit, |item| f(item))
        .await;
}
