use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::Type;
use uuid::Uuid;

/// Shared status enum for StepRun and GetGroupKeyRun.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "run_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Pending,
    PendingAssignment,
    Assigned,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::Failed | RunStatus::Cancelled)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "workflow_run_status", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowRunStatus {
    Pending,
    Queued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Type)]
#[sqlx(type_name = "concurrency_strategy", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConcurrencyStrategy {
    GroupRoundRobin,
    CancelInProgress,
}

/// Reasons a run can end up CANCELLED; mirrors the fixed vocabulary the store writes
/// into `cancelled_reason` and the cascade reads back out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelledReason {
    SchedulingTimedOut,
    TimedOut,
    PreviousStepTimedOut,
    PreviousStepCancelled,
    CancelledByConcurrencyLimit,
    RequestedByUser,
}

impl CancelledReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CancelledReason::SchedulingTimedOut => "SCHEDULING_TIMED_OUT",
            CancelledReason::TimedOut => "TIMED_OUT",
            CancelledReason::PreviousStepTimedOut => "PREVIOUS_STEP_TIMED_OUT",
            CancelledReason::PreviousStepCancelled => "PREVIOUS_STEP_CANCELLED",
            CancelledReason::CancelledByConcurrencyLimit => "CANCELLED_BY_CONCURRENCY_LIMIT",
            CancelledReason::RequestedByUser => "REQUESTED_BY_USER",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Some(match s {
            "SCHEDULING_TIMED_OUT" => CancelledReason::SchedulingTimedOut,
            "TIMED_OUT" => CancelledReason::TimedOut,
            "PREVIOUS_STEP_TIMED_OUT" => CancelledReason::PreviousStepTimedOut,
            "PREVIOUS_STEP_CANCELLED" => CancelledReason::PreviousStepCancelled,
            "CANCELLED_BY_CONCURRENCY_LIMIT" => CancelledReason::CancelledByConcurrencyLimit,
            "REQUESTED_BY_USER" => CancelledReason::RequestedByUser,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub dispatcher_id: Uuid,
    pub last_heartbeat_at: DateTime<Utc>,
    pub max_runs: Option<i32>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub id: Uuid,
    pub last_heartbeat_at: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersionConcurrency {
    pub max_runs: i32,
    pub limit_strategy: ConcurrencyStrategy,
    pub get_concurrency_group_action_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowVersion {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub concurrency: Option<WorkflowVersionConcurrency>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub workflow_version_id: Uuid,
    pub status: WorkflowRunStatus,
    pub group_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetGroupKeyRun {
    pub id: Uuid,
    pub workflow_run_id: Uuid,
    pub tenant_id: Uuid,
    pub status: RunStatus,
    pub worker_id: Option<Uuid>,
    pub ticker_id: Option<Uuid>,
    pub requeue_after: DateTime<Utc>,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    pub input: serde_json::Value,
    pub output: Option<String>,
    pub error: Option<String>,
    pub cancelled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRun {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub job_run_id: Uuid,
    pub step_id: Uuid,
    pub action_id: String,
    pub order_num: i32,
    pub status: RunStatus,
    pub worker_id: Option<Uuid>,
    pub ticker_id: Option<Uuid>,
    pub retry_count: i32,
    pub retries: i32,
    pub requeue_after: DateTime<Utc>,
    pub schedule_timeout_at: Option<DateTime<Utc>>,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancelled_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRunResultArchive {
    pub id: Uuid,
    pub step_run_id: Uuid,
    pub order_num: i32,
    pub input: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
    pub cancelled_reason: Option<String>,
    pub archived_at: DateTime<Utc>,
}

/// Result of an assignment attempt: which worker (and its dispatcher) picked up the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assignment {
    pub worker_id: Uuid,
    pub dispatcher_id: Uuid,
}
