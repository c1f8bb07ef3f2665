use std::sync::Arc;

use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{prelude::*, EnvFilter};

use flowctl_core::bus::{self, InMemoryBus, MessageBus, Task};
use flowctl_core::{Config, Core, Store};

/// Process shell: loads `Config`, opens the pools, runs migrations, installs
/// the `tracing` subscriber, and spawns the long-running loops (one
/// requeue-sweep per tenant, plus a dispatch loop draining the durable
/// queues the Concurrency Controller reacts to). This is ambient wiring,
/// not orchestration logic — see `flowctl_core::Core` for the pieces it
/// assembles.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let dev_mode = std::env::var("FLOWCTL_DEV_MODE")
        .unwrap_or_else(|_| "false".to_string())
        .to_lowercase()
        == "true";

    if dev_mode {
        let console_layer = console_subscriber::ConsoleLayer::builder()
            .server_addr(([127, 0, 0, 1], 6669))
            .spawn();

        tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(console_layer)
            .init();

        tracing::info!("tokio console enabled (connect with: tokio-console)");
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
            .init();
    }

    let config = Config::from_env();

    let pool_assigner = PgPoolOptions::new()
        .max_connections(config.pool_assigner_max)
        .min_connections(1)
        .connect(&config.database_url)
        .await?;

    let pool_sweep = PgPoolOptions::new()
        .max_connections(config.pool_sweep_max)
        .min_connections(1)
        .connect(&config.database_url)
        .await?;

    tracing::info!(
        assigner_max = config.pool_assigner_max,
        sweep_max = config.pool_sweep_max,
        "connected to database with 2 connection pools"
    );

    sqlx::migrate!("./migrations").run(&pool_assigner).await?;
    tracing::info!("migrations complete");

    let assigner_store = Store::new(pool_assigner);
    let sweep_store = Store::new(pool_sweep);

    let message_bus: Arc<dyn MessageBus> = InMemoryBus::shared();

    let core = Core::new(assigner_store, message_bus.clone(), config.clone());

    let tenant_ids = core.store.list_tenant_ids().await?;
    tracing::info!(tenants = tenant_ids.len(), "spawning requeue-sweep loops");

    let sweep_core = Core::new(sweep_store, message_bus.clone(), config.clone());
    let requeue_loop = Arc::new(sweep_core.requeue_loop());
    let mut sweep_handles = Vec::with_capacity(tenant_ids.len());
    for tenant_id in tenant_ids {
        sweep_handles.push(requeue_loop.clone().spawn(tenant_id));
    }

    let dispatch_handle = tokio::task::Builder::new()
        .name("workflow-dispatch")
        .spawn(run_dispatch_loop(core, message_bus))?;

    dispatch_handle.await??;
    for handle in sweep_handles {
        handle.await?;
    }

    Ok(())
}

/// Drains the durable queues the Concurrency Controller reacts to
/// (`workflow_processing`, `scheduling`) and routes each envelope to the
/// matching handler. Decode errors on an unrecognized task id are logged
/// and skipped rather than treated as fatal (§9 design note).
async fn run_dispatch_loop(core: Core, message_bus: Arc<dyn MessageBus>) -> anyhow::Result<()> {
    let mut ticker = tokio::time::interval(core.config.dispatch_tick_interval);
    loop {
        ticker.tick().await;

        for queue in [bus::WORKFLOW_PROCESSING_QUEUE, bus::SCHEDULING_QUEUE] {
            while let Some(envelope) = message_bus.try_recv(queue).await? {
                if let Err(err) = handle_task(&core, envelope.task).await {
                    tracing::warn!(queue, error = %err, "task handler failed");
                }
            }
        }
    }
}

async fn handle_task(core: &Core, task: Task) -> anyhow::Result<()> {
    match task {
        Task::WorkflowRunQueued { workflow_run_id, tenant_id } => {
            core.concurrency.handle_workflow_run_queued(&workflow_run_id, &tenant_id).await
        }
        Task::WorkflowRunFinished { workflow_run_id, tenant_id } => {
            core.concurrency.handle_workflow_run_finished(&workflow_run_id, &tenant_id).await
        }
        Task::GroupKeyActionRequeueTick { tenant_id } => core.requeue_loop().sweep_tenant(&tenant_id).await,
        Task::Unrecognized => {
            tracing::warn!("received unrecognized task id, skipping");
            Ok(())
        }
        other => {
            tracing::debug!(?other, "task not handled by the dispatch loop");
            Ok(())
        }
    }
}
