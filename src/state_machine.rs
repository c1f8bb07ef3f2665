//! The transition table of §4.5, expressed as a pure, I/O-free guard. The
//! same rule is also baked into the SQL `CASE`/`COALESCE` guard inside
//! `Store::update_step_run`/`update_group_key_run` so the database enforces
//! it even when a caller bypasses this in-process check — e.g. a retried bus
//! message racing a fresh transaction. Keeping both in sync is a conscious
//! duplication, not an oversight.

use crate::models::RunStatus;

/// Whether `next` is a legal transition out of `current`, given whether this
/// is an explicit rerun. Terminal states (SUCCEEDED, FAILED, CANCELLED) only
/// accept a further transition when `rerun` is set.
pub fn can_transition(current: RunStatus, next: RunStatus, rerun: bool) -> bool {
    use RunStatus::*;

    if current.is_terminal() {
        return rerun;
    }

    match (current, next) {
        (Pending, PendingAssignment) => true,
        (PendingAssignment, Assigned) => true,
        (PendingAssignment, Cancelled) => true,
        (Assigned, Running) => true,
        (Assigned, PendingAssignment) => true,
        (Running, Succeeded) => true,
        (Running, Failed) => true,
        (Running, PendingAssignment) => true,
        // any non-terminal state accepts an explicit cancel request
        (_, Cancelled) => true,
        _ => false,
    }
}

/// `retryCount < step.retries` guard for the RUNNING-with-stale-worker
/// reassignment path (§4.3, §4.5).
pub fn retry_budget_remaining(retry_count: i32, retries: i32) -> bool {
    retry_count < retries
}
