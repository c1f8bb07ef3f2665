//! The Concurrency Controller (§4.4): the workflow-level admission gate.
//! Grounded on `handleWorkflowRunQueued`/`handleWorkflowRunFinished`/
//! `scheduleGetGroupAction`/`queueByGroupRoundRobin`/`queueByCancelInProgress`
//! in `queue.go`, generalized from Hatchet's Prisma repository calls onto
//! the `Store` query contracts of §4.1.

use std::sync::Arc;

use uuid::Uuid;

use crate::assigner::Assigner;
use crate::bus::{self, Envelope, MessageBus, Task};
use crate::models::{ConcurrencyStrategy, RunStatus};
use crate::store::group_key_runs::GroupKeyRunUpdate;
use crate::store::Store;

#[derive(Clone)]
pub struct ConcurrencyController {
    store: Store,
    bus: Arc<dyn MessageBus>,
    assigner: Assigner,
}

impl ConcurrencyController {
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, assigner: Assigner) -> Self {
        Self { store, bus, assigner }
    }

    /// `WorkflowRunQueued(workflowRunId)` (§4.4 step 1).
    pub async fn handle_workflow_run_queued(
        &self,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<()> {
        let run = self
            .store
            .get_workflow_run(workflow_run_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow run {workflow_run_id} not found"))?;

        let version = self
            .store
            .get_workflow_version(&run.workflow_version_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow version {} not found", run.workflow_version_id))?;

        let Some(concurrency) = version.concurrency else {
            return self.queue_job_runs(workflow_run_id, tenant_id).await;
        };

        // The run has a GetGroupKeyRun created alongside it (§3); find and
        // schedule it via the Assigner rather than admitting the run
        // directly.
        let group_key_run_id = self
            .store
            .get_group_key_run_id_for_workflow_run(workflow_run_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow run {workflow_run_id} has concurrency but no group key run"))?;

        self.store
            .update_group_key_run(
                &group_key_run_id,
                tenant_id,
                GroupKeyRunUpdate {
                    status: Some(RunStatus::PendingAssignment),
                    ..Default::default()
                },
            )
            .await?;

        self.assigner
            .assign_group_key_run(
                &group_key_run_id,
                workflow_run_id,
                tenant_id,
                &concurrency.get_concurrency_group_action_id,
            )
            .await?;

        Ok(())
    }

    /// `GetGroupKeyRunFinished(groupKey, workflowRunId)` (§4.4): the worker
    /// has computed the group key; set it, move the run to QUEUED, and try
    /// to admit it immediately if the group has headroom.
    pub async fn handle_group_key_run_finished(
        &self,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
        group_key: &str,
    ) -> anyhow::Result<()> {
        self.store
            .set_workflow_run_group_key_and_queued(workflow_run_id, tenant_id, group_key)
            .await?;

        let run = self
            .store
            .get_workflow_run(workflow_run_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow run {workflow_run_id} not found"))?;

        let version = self
            .store
            .get_workflow_version(&run.workflow_version_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow version {} not found", run.workflow_version_id))?;

        let Some(concurrency) = version.concurrency else {
            return self.queue_job_runs(workflow_run_id, tenant_id).await;
        };

        let admitted = self
            .store
            .try_admit_workflow_run(
                workflow_run_id,
                tenant_id,
                &run.workflow_version_id,
                group_key,
                concurrency.max_runs,
            )
            .await?;

        if admitted {
            self.queue_job_runs(workflow_run_id, tenant_id).await?;
        }

        Ok(())
    }

    /// `WorkflowRunFinished(workflowRunId)` (§4.4): dispatch by
    /// `limitStrategy` to let queued successors in.
    pub async fn handle_workflow_run_finished(
        &self,
        workflow_run_id: &Uuid,
        tenant_id: &Uuid,
    ) -> anyhow::Result<()> {
        let run = self
            .store
            .get_workflow_run(workflow_run_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow run {workflow_run_id} not found"))?;

        let version = self
            .store
            .get_workflow_version(&run.workflow_version_id, tenant_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("workflow version {} not found", run.workflow_version_id))?;

        let Some(concurrency) = version.concurrency else {
            return Ok(());
        };

        match concurrency.limit_strategy {
            ConcurrencyStrategy::GroupRoundRobin => {
                self.queue_by_group_round_robin(tenant_id, &run.workflow_version_id, concurrency.max_runs)
                    .await
            }
            ConcurrencyStrategy::CancelInProgress => {
                let Some(group_key) = run.group_key.as_deref() else {
                    return Ok(());
                };
                self.queue_by_cancel_in_progress(tenant_id, &run.workflow_version_id, group_key, concurrency.max_runs)
                    .await
            }
        }
    }

    async fn queue_by_group_round_robin(
        &self,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        max_runs: i32,
    ) -> anyhow::Result<()> {
        let popped = self
            .store
            .pop_workflow_runs_round_robin(tenant_id, workflow_version_id, max_runs)
            .await?;

        let mut errors = Vec::new();
        for run in popped {
            self.store.mark_workflow_run_running(&run.id, tenant_id).await?;
            if let Err(err) = self.queue_job_runs(&run.id, tenant_id).await {
                errors.push(err);
            }
        }
        aggregate(errors)
    }

    /// CANCEL_IN_PROGRESS (§4.4): cancel up to `min(maxRuns, |queued|)`
    /// oldest running runs, admit the same number of oldest queued runs.
    /// The `min(maxRuns, |queued|)` bound — not `|queued|` outright — is
    /// implemented literally per the §9 open-question resolution in
    /// DESIGN.md.
    async fn queue_by_cancel_in_progress(
        &self,
        tenant_id: &Uuid,
        workflow_version_id: &Uuid,
        group_key: &str,
        max_runs: i32,
    ) -> anyhow::Result<()> {
        let (running, queued) = self
            .store
            .list_running_and_queued_for_group(tenant_id, workflow_version_id, group_key)
            .await?;

        let to_process = (max_runs as usize).min(queued.len());

        let mut errors = Vec::new();
        for run in running.into_iter().take(to_process) {
            if let Err(err) = self.cancel_workflow_run(&run.id, tenant_id).await {
                errors.push(err);
            }
        }

        for run in queued.into_iter().take(to_process) {
            self.store.mark_workflow_run_running(&run.id, tenant_id).await?;
            if let Err(err) = self.queue_job_runs(&run.id, tenant_id).await {
                errors.push(err);
            }
        }

        aggregate(errors)
    }

    /// Cancels a RUNNING workflow run by notifying each of its RUNNING
    /// StepRuns to stop, rather than mutating their status directly — the
    /// worker/job-processing side owns the actual transition (§4.4).
    async fn cancel_workflow_run(&self, workflow_run_id: &Uuid, tenant_id: &Uuid) -> anyhow::Result<()> {
        self.store.cancel_workflow_run(workflow_run_id, tenant_id).await?;

        let step_run_ids = self
            .store
            .list_running_step_run_ids_for_workflow_run(workflow_run_id)
            .await?;

        let mut errors = Vec::new();
        for step_run_id in step_run_ids {
            let publish = self
                .bus
                .publish(
                    bus::JOB_PROCESSING_QUEUE,
                    Envelope::new(Task::StepRunCancelled {
                        step_run_id,
                        cancelled_reason: crate::models::CancelledReason::CancelledByConcurrencyLimit
                            .as_str()
                            .to_string(),
                        tenant_id: *tenant_id,
                    }),
                )
                .await;
            if let Err(err) = publish {
                errors.push(err);
            }
        }
        aggregate(errors)
    }

    /// `queueJobRuns(workflowRun)` (§4.4): one `JobRunQueued` task per
    /// JobRun, onto the job-processing queue. Job-level logic (out of
    /// scope) is what emits the first StepRuns into PENDING.
    async fn queue_job_runs(&self, workflow_run_id: &Uuid, tenant_id: &Uuid) -> anyhow::Result<()> {
        let job_runs = self.store.list_job_runs_for_workflow_run(workflow_run_id).await?;

        let mut errors = Vec::new();
        for (job_run_id, job_id) in job_runs {
            let publish = self
                .bus
                .publish(
                    bus::JOB_PROCESSING_QUEUE,
                    Envelope::new(Task::JobRunQueued {
                        job_run_id,
                        job_id,
                        tenant_id: *tenant_id,
                    }),
                )
                .await;
            if let Err(err) = publish {
                errors.push(err);
            }
        }
        aggregate(errors)
    }
}

/// Folds a batch of per-item errors into one, mirroring the Go
/// `multierror.Append` pattern the original controller uses when fanning
/// out over runs/step-runs (§5: "error aggregated without aborting
/// siblings").
fn aggregate(errors: Vec<anyhow::Error>) -> anyhow::Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let joined = errors.into_iter().map(|e| e.to_string()).collect::<Vec<_>>().join("; ");
    Err(anyhow::anyhow!(joined))
}
