//! The `run`, `stop`, and `resume` commands.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use foreman_core::bus::MessageBus;
use foreman_core::config::CoreConfig;
use foreman_core::cycle::Orchestrator;
use foreman_core::provider::{CommandProvider, ProviderRegistry};
use foreman_core::runner::ProcessRunner;
use foreman_core::scheduler::Scheduler;
use foreman_core::vcs::CliVcsHost;

fn build_orchestrator(db: PgPool, config: &CoreConfig) -> Result<Arc<Orchestrator>> {
    let runner = ProcessRunner::new();

    let mut registry = ProviderRegistry::new();
    registry.register(CommandProvider::from_config(&config.provider, runner.clone()));
    let provider = registry
        .get("command")
        .context("no provider registered under 'command'")?;

    let vcs = Arc::new(CliVcsHost::new(
        "gh",
        std::env::current_dir().unwrap_or_else(|_| ".".into()),
        runner.clone(),
    ));
    let bus = MessageBus::default();
    Ok(Arc::new(Orchestrator::new(
        db,
        provider,
        vcs,
        bus,
        runner,
        config.clone(),
    )))
}

/// Run the scheduler until Ctrl-C.
pub async fn run(db: PgPool, config: CoreConfig) -> Result<()> {
    let orchestrator = build_orchestrator(db.clone(), &config)?;
    let cancel = CancellationToken::new();

    let ctrl_c_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            ctrl_c_cancel.cancel();
        }
    });

    println!("foreman scheduler running (Ctrl-C to stop)");
    let scheduler = Scheduler::new(db, orchestrator, config, cancel);
    scheduler.run().await
}

/// Emergency-stop one organization.
pub async fn stop(db: PgPool, config: CoreConfig, org_id: &str, reason: &str) -> Result<()> {
    let org_id: Uuid = org_id
        .parse()
        .with_context(|| format!("{org_id:?} is not a valid id"))?;

    let orchestrator = build_orchestrator(db, &config)?;
    let report = orchestrator.emergency_stop(org_id, reason).await?;
    println!(
        "stopped: {} agents paused, {} tasks reset to pending",
        report.paused_agents,
        report.reset_tasks.len()
    );
    Ok(())
}

/// Resume a stopped organization.
pub async fn resume(db: PgPool, config: CoreConfig, org_id: &str) -> Result<()> {
    let org_id: Uuid = org_id
        .parse()
        .with_context(|| format!("{org_id:?} is not a valid id"))?;

    let orchestrator = build_orchestrator(db, &config)?;
    let resumed = orchestrator.resume(org_id).await?;
    println!("resumed: {resumed} agents returned to idle");
    Ok(())
}
