use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Static durable queues, one per process class (§6). Unlike the ephemeral
/// per-consumer queues below, these names are fixed and known at compile
/// time.
pub const EVENT_PROCESSING_QUEUE: &str = "event_processing";
pub const JOB_PROCESSING_QUEUE: &str = "job_processing";
pub const WORKFLOW_PROCESSING_QUEUE: &str = "workflow_processing";
pub const DISPATCHER_POOL_QUEUE: &str = "dispatcher_pool";
pub const SCHEDULING_QUEUE: &str = "scheduling";

/// Ephemeral, per-consumer queue keyed by a dispatcher id — non-durable,
/// auto-deleted, exclusive to that consumer.
pub fn dispatcher_queue(dispatcher_id: &Uuid) -> String {
    format!("dispatcher:{dispatcher_id}")
}

/// Ephemeral, per-consumer queue keyed by a ticker id.
pub fn ticker_queue(ticker_id: &Uuid) -> String {
    format!("ticker:{ticker_id}")
}

/// Ephemeral fanout queue bound to a tenant's pub/sub exchange.
pub fn tenant_fanout_queue(tenant_id: &Uuid) -> String {
    format!("tenant:{tenant_id}")
}

/// One tagged variant per task id (§9's Design Note: a statically-typed
/// rewrite of the duck-typed `payload`/`metadata` maps). Deserialized at the
/// point a consumer pulls a `Task` off a queue; an unrecognized `id` on the
/// wire falls through to `Task::Unrecognized` rather than failing the whole
/// envelope's decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "id", rename_all = "kebab-case")]
pub enum Task {
    WorkflowRunQueued {
        workflow_run_id: Uuid,
        tenant_id: Uuid,
    },
    WorkflowRunFinished {
        workflow_run_id: Uuid,
        tenant_id: Uuid,
    },
    GroupKeyActionAssigned {
        workflow_run_id: Uuid,
        worker_id: Uuid,
        tenant_id: Uuid,
    },
    GroupKeyActionRequeueTick {
        tenant_id: Uuid,
    },
    ScheduleGetGroupKeyRunTimeout {
        get_group_key_run_id: Uuid,
        workflow_run_id: Uuid,
        timeout_at: chrono::DateTime<chrono::Utc>,
        tenant_id: Uuid,
    },
    /// Same shape as `GroupKeyActionAssigned`, for a plain StepRun rather
    /// than a GetGroupKeyRun (§4.2's `task_assigned` event applies to both;
    /// only the group-key variant made the fixed table in §6).
    StepRunAssigned {
        step_run_id: Uuid,
        worker_id: Uuid,
        tenant_id: Uuid,
    },
    ScheduleStepRunTimeout {
        step_run_id: Uuid,
        timeout_at: chrono::DateTime<chrono::Utc>,
        tenant_id: Uuid,
    },
    StepRunCancelled {
        step_run_id: Uuid,
        cancelled_reason: String,
        tenant_id: Uuid,
    },
    JobRunQueued {
        job_run_id: Uuid,
        job_id: Uuid,
        tenant_id: Uuid,
    },
    /// Not part of the fixed task table, but the envelope is otherwise
    /// open-ended (free-form `payload`/`metadata` in the source); unknown
    /// ids decode into this variant instead of failing outright.
    #[serde(other)]
    Unrecognized,
}

impl Task {
    pub fn tenant_id(&self) -> Option<Uuid> {
        match self {
            Task::WorkflowRunQueued { tenant_id, .. }
            | Task::WorkflowRunFinished { tenant_id, .. }
            | Task::GroupKeyActionAssigned { tenant_id, .. }
            | Task::GroupKeyActionRequeueTick { tenant_id }
            | Task::ScheduleGetGroupKeyRunTimeout { tenant_id, .. }
            | Task::StepRunAssigned { tenant_id, .. }
            | Task::ScheduleStepRunTimeout { tenant_id, .. }
            | Task::StepRunCancelled { tenant_id, .. }
            | Task::JobRunQueued { tenant_id, .. } => Some(*tenant_id),
            Task::Unrecognized => None,
        }
    }
}

/// The envelope a `MessageBus` actually transports. `retries`/`retry_delay`
/// are consulted by the broker's retry machinery (out of scope here — the
/// message-broker implementation is an external collaborator, §1); the core
/// only ever sets sane defaults on publish.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub task: Task,
    pub retries: u32,
    pub retry_delay_secs: u64,
}

impl Envelope {
    pub fn new(task: Task) -> Self {
        Self {
            task,
            retries: 3,
            retry_delay_secs: 5,
        }
    }
}

/// Abstracts queue publish/consume so the core never depends on a concrete
/// broker client. A production deployment plugs in its real broker behind
/// this trait; the crate ships only the in-process implementation below for
/// local running and integration tests (§6 Bus transport).
#[async_trait::async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, queue: &str, envelope: Envelope) -> anyhow::Result<()>;
    async fn try_recv(&self, queue: &str) -> anyhow::Result<Option<Envelope>>;
}

/// `tokio::sync::mpsc`-backed bus. Queues are created lazily on first
/// publish or consume; this is adequate for local running and tests but
/// carries none of a real broker's durability guarantees, matching the
/// Non-goal that message queues are hints, not the source of truth (§1).
pub struct InMemoryBus {
    queues: Mutex<HashMap<String, (mpsc::UnboundedSender<Envelope>, mpsc::UnboundedReceiver<Envelope>)>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait::async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, queue: &str, envelope: Envelope) -> anyhow::Result<()> {
        let mut queues = self.queues.lock().await;
        let (tx, _) = queues
            .entry(queue.to_string())
            .or_insert_with(mpsc::unbounded_channel);
        tx.send(envelope)
            .map_err(|_| anyhow::anyhow!("queue {queue} receiver dropped"))?;
        Ok(())
    }

    async fn try_recv(&self, queue: &str) -> anyhow::Result<Option<Envelope>> {
        let mut queues = self.queues.lock().await;
        let Some((_, rx)) = queues.get_mut(queue) else {
            return Ok(None);
        };
        Ok(rx.try_recv().ok())
    }
}
