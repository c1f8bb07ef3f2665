//! The Assigner (§4.2): atomic worker admission for a single StepRun or
//! GetGroupKeyRun, plus the bus side-effects that follow a successful pick.
//!
//! Grounded on `queue.go`'s `scheduleGetGroupAction` (list-workers +
//! least-loaded pick, dispatcher task, ticker timeout task) and on the
//! atomic `assignStepRunToWorker`/`assignStepRunToTicker` query contracts of
//! §4.1, which this module calls rather than duplicates.

use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::bus::{self, Envelope, MessageBus, Task};
use crate::config::Config;
use crate::models::RunStatus;
use crate::store::group_key_runs::GroupKeyRunUpdate;
use crate::store::step_runs::StepRunUpdate;
use crate::store::Store;

/// Outcome of a single assignment attempt, distinguished from a genuine
/// store failure per §7: "no eligible worker" is not an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignOutcome {
    Assigned,
    NoWorkerAvailable,
}

#[derive(Clone)]
pub struct Assigner {
    store: Store,
    bus: Arc<dyn MessageBus>,
    config: Config,
}

impl Assigner {
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, config: Config) -> Self {
        Self { store, bus, config }
    }

    /// Assigns one StepRun (§4.2 step 1-2, mandatory atomic path).
    pub async fn assign_step_run(
        &self,
        step_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<AssignOutcome> {
        match self.store.assign_step_run_to_worker(step_run_id, tenant_id).await? {
            Some(assignment) => {
                self.bus
                    .publish(
                        &bus::dispatcher_queue(&assignment.dispatcher_id),
                        Envelope::new(Task::StepRunAssigned {
                            step_run_id: *step_run_id,
                            worker_id: assignment.worker_id,
                            tenant_id: *tenant_id,
                        }),
                    )
                    .await?;

                if let Some(ticker_id) = self.store.assign_step_run_to_ticker(step_run_id, tenant_id).await? {
                    let timeout_at = Utc::now() + self.config.default_step_run_timeout;
                    self.bus
                        .publish(
                            &bus::ticker_queue(&ticker_id),
                            Envelope::new(Task::ScheduleStepRunTimeout {
                                step_run_id: *step_run_id,
                                timeout_at,
                                tenant_id: *tenant_id,
                            }),
                        )
                        .await?;
                }

                Ok(AssignOutcome::Assigned)
            }
            None => {
                self.push_requeue(step_run_id, tenant_id).await?;
                Ok(AssignOutcome::NoWorkerAvailable)
            }
        }
    }

    /// Assigns one GetGroupKeyRun via the least-loaded convenience path
    /// §4.2 sanctions for low-contention group-key scheduling.
    ///
    /// `get_group_key_run_id` and `workflow_run_id` are two distinct ids —
    /// the former keys the `get_group_key_runs` row this call assigns, the
    /// latter is the WorkflowRun it belongs to, carried separately in the
    /// published tasks because the dispatcher/ticker expect the run's own id
    /// there (§6).
    pub async fn assign_group_key_run(
        &self,
        get_group_key_run_id: &Uuid,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
        action_id: &str,
    ) -> anyhow::Result<AssignOutcome> {
        match self
            .store
            .assign_group_key_run_least_loaded(get_group_key_run_id, tenant_id, action_id)
            .await?
        {
            Some(assignment) => {
                self.bus
                    .publish(
                        &bus::dispatcher_queue(&assignment.dispatcher_id),
                        Envelope::new(Task::GroupKeyActionAssigned {
                            workflow_run_id: *workflow_run_id,
                            worker_id: assignment.worker_id,
                            tenant_id: *tenant_id,
                        }),
                    )
                    .await?;

                if let Some(ticker_id) = self.pick_ticker().await? {
                    let timeout_at = Utc::now() + self.config.default_step_run_timeout;
                    self.store
                        .update_group_key_run(
                            get_group_key_run_id,
                            tenant_id,
                            GroupKeyRunUpdate {
                                ticker_id: Some(Some(ticker_id)),
                                ..Default::default()
                            },
                        )
                        .await?;
                    self.bus
                        .publish(
                            &bus::ticker_queue(&ticker_id),
                            Envelope::new(Task::ScheduleGetGroupKeyRunTimeout {
                                get_group_key_run_id: *get_group_key_run_id,
                                workflow_run_id: *workflow_run_id,
                                timeout_at,
                                tenant_id: *tenant_id,
                            }),
                        )
                        .await?;
                }

                Ok(AssignOutcome::Assigned)
            }
            None => {
                self.store
                    .update_group_key_run(
                        get_group_key_run_id,
                        tenant_id,
                        GroupKeyRunUpdate {
                            status: Some(RunStatus::PendingAssignment),
                            requeue_after: Some(Utc::now() + self.config.requeue_interval),
                            ..Default::default()
                        },
                    )
                    .await?;
                Ok(AssignOutcome::NoWorkerAvailable)
            }
        }
    }

    /// §4.2 step 2: no worker available, push `requeueAfter` out and park in
    /// PENDING_ASSIGNMENT without touching `workerId`.
    async fn push_requeue(&self, step_run_id: &Uuid, tenant_id: &Uuid) -> anyhow::Result<()> {
        self.store
            .update_step_run(
                step_run_id,
                tenant_id,
                StepRunUpdate {
                    status: Some(RunStatus::PendingAssignment),
                    requeue_after: Some(Utc::now() + self.config.requeue_interval),
                    ..Default::default()
                },
            )
            .await?;
        Ok(())
    }

    /// A live ticker to own the timeout timer; `None` if none are currently
    /// heartbeating (mirrors `getValidTickers` returning an empty list).
    async fn pick_ticker(&self) -> anyhow::Result<Option<Uuid>> {
        self.store.pick_live_ticker(self.config.ticker_heartbeat).await
    }
}
