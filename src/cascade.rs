//! The Cascading Resolver (§4.6): the reaction to a StepRun entering
//! FAILED or CANCELLED. Thin wrapper over `resolveLaterStepRuns` — all the
//! cascade logic (which reason propagates, the `order_num` bound) lives in
//! the store query itself (§4.1), which is already idempotent by
//! construction (it only touches non-terminal successors).

use uuid::Uuid;

use crate::store::Store;

#[derive(Clone)]
pub struct CascadingResolver {
    store: Store,
}

impl CascadingResolver {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Call after any StepRun update that may have moved it to FAILED or
    /// CANCELLED. A no-op for any other status (P5).
    pub async fn on_step_run_terminal(&self, step_run_id: &Uuid, tenant_id: &Uuid) -> anyhow::Result<u64> {
        self.store.resolve_later_step_runs(step_run_id, tenant_id).await
    }
}
