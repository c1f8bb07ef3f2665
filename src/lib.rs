//! Workflow scheduling and concurrency core: the subsystem that admits
//! queued workflow runs under per-workflow concurrency policy, assigns
//! step-runs and group-key-runs to live workers, drives them through the
//! shared status state machine, and recovers from worker failure via
//! requeue/reassignment.
//!
//! The HTTP/gRPC API surface, the RPC transport to workers, the real
//! message-broker implementation, and authentication are external
//! collaborators and are not part of this crate; see the `bus` module for
//! the trait boundary a production deployment plugs a broker client into.

pub mod assigner;
pub mod bus;
pub mod cascade;
pub mod concurrency;
pub mod config;
pub mod models;
pub mod requeue;
pub mod state_machine;
pub mod store;

pub use config::Config;
pub use store::Store;

use std::sync::Arc;

use assigner::Assigner;
use bus::MessageBus;
use cascade::CascadingResolver;
use concurrency::ConcurrencyController;
use requeue::RequeueLoop;

/// Bundles the core's components, built once at process start and cloned
/// (cheaply — everything inside is an `Arc`/pooled handle) into each
/// background task and bus-consumer loop. Mirrors §9's "Global state" design
/// note: an explicit configuration structure passed at construction, no
/// process-wide mutable state.
#[derive(Clone)]
pub struct Core {
    pub store: Store,
    pub bus: Arc<dyn MessageBus>,
    pub config: Config,
    pub assigner: Assigner,
    pub concurrency: ConcurrencyController,
    pub cascade: CascadingResolver,
}

impl Core {
    pub fn new(store: Store, bus: Arc<dyn MessageBus>, config: Config) -> Self {
        let assigner = Assigner::new(store.clone(), bus.clone(), config.clone());
        let concurrency = ConcurrencyController::new(store.clone(), bus.clone(), assigner.clone());
        let cascade = CascadingResolver::new(store.clone());

        Self { store, bus, config, assigner, concurrency, cascade }
    }

    pub fn requeue_loop(&self) -> RequeueLoop {
        RequeueLoop::new(self.store.clone(), self.bus.clone(), self.config.clone())
    }
}
