//! Periodic drivers and the agent worker pool.
//!
//! One long-running driver per concern, each a single `tokio` interval
//! loop with a shared cancellation token: decompose (goals), execute
//! (agent cycles), review (parents + merge watch), team-distribute
//! (epics), stuck-sweep (limbo tasks, stalled escalations, orphan
//! worktrees), and progress-report. Drivers produce agent ids onto an
//! unbounded channel; a semaphore-bounded worker pool consumes them, with
//! an in-memory executing set so one agent never runs two cycles at once.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use sqlx::PgPool;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use foreman_db::queries::agents as agent_db;
use foreman_db::queries::goals as goal_db;
use foreman_db::queries::organizations as org_db;
use foreman_db::queries::projects as project_db;
use foreman_db::queries::task_events as event_db;
use foreman_db::queries::tasks as task_db;

use crate::config::CoreConfig;
use crate::cycle::Orchestrator;
use crate::escalation::Escalator;
use crate::workspace::WorkspaceManager;

/// The scheduler: drives every org's autonomous activity.
pub struct Scheduler {
    pool: PgPool,
    orchestrator: Arc<Orchestrator>,
    config: CoreConfig,
    cancel: CancellationToken,
    /// Agents with a cycle currently in flight.
    executing: Arc<Mutex<HashSet<Uuid>>>,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        orchestrator: Arc<Orchestrator>,
        config: CoreConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            pool,
            orchestrator,
            config,
            cancel,
            executing: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Run all drivers until the cancellation token fires.
    pub async fn run(self) -> Result<()> {
        let (tx, rx) = mpsc::unbounded_channel::<Uuid>();

        let mut handles = Vec::new();

        handles.push(tokio::spawn(worker_pool(
            rx,
            Arc::clone(&self.orchestrator),
            Arc::clone(&self.executing),
            self.config.limits.max_concurrent_agents,
            self.cancel.clone(),
        )));

        // Review requests on the bus wake the owning agent immediately,
        // ahead of the next review-driver tick.
        handles.push(tokio::spawn(review_request_listener(
            self.orchestrator.bus().subscribe(),
            tx.clone(),
            self.cancel.clone(),
        )));

        handles.push(self.spawn_driver(
            "decompose",
            self.config.scheduler.decompose_period_secs,
            {
                let scheduler = self.handle();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.drive_decompose().await }
                }
            },
        ));

        handles.push(self.spawn_driver(
            "execute",
            self.config.scheduler.execute_period_secs,
            {
                let scheduler = self.handle();
                let tx = tx.clone();
                move || {
                    let scheduler = scheduler.clone();
                    let tx = tx.clone();
                    async move { scheduler.drive_execute(&tx).await }
                }
            },
        ));

        handles.push(self.spawn_driver(
            "review",
            self.config.scheduler.review_period_secs,
            {
                let scheduler = self.handle();
                let tx = tx.clone();
                move || {
                    let scheduler = scheduler.clone();
                    let tx = tx.clone();
                    async move { scheduler.drive_review(&tx).await }
                }
            },
        ));

        handles.push(self.spawn_driver(
            "team-distribute",
            self.config.scheduler.team_distribute_period_secs,
            {
                let scheduler = self.handle();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.drive_distribute().await }
                }
            },
        ));

        handles.push(self.spawn_driver(
            "stuck-sweep",
            self.config.scheduler.stuck_sweep_period_secs,
            {
                let scheduler = self.handle();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.drive_stuck_sweep().await }
                }
            },
        ));

        handles.push(self.spawn_driver(
            "progress-report",
            self.config.scheduler.progress_report_period_secs,
            {
                let scheduler = self.handle();
                move || {
                    let scheduler = scheduler.clone();
                    async move { scheduler.drive_progress_report().await }
                }
            },
        ));

        self.cancel.cancelled().await;
        info!("scheduler cancelled, waiting for drivers to stop");
        drop(tx);
        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            pool: self.pool.clone(),
            orchestrator: Arc::clone(&self.orchestrator),
            config: self.config.clone(),
        }
    }

    /// Spawn one driver loop: tick, run, repeat until cancelled.
    fn spawn_driver<F, Fut>(
        &self,
        name: &'static str,
        period_secs: u64,
        mut make_pass: F,
    ) -> tokio::task::JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = Result<()>> + Send,
    {
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(period_secs.max(1)));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        debug!(driver = name, "driver tick");
                        if let Err(e) = make_pass().await {
                            warn!(driver = name, error = %e, "driver pass failed");
                        }
                    }
                    _ = cancel.cancelled() => {
                        debug!(driver = name, "driver stopped");
                        return;
                    }
                }
            }
        })
    }
}

/// The per-driver view of the scheduler.
#[derive(Clone)]
struct SchedulerHandle {
    pool: PgPool,
    orchestrator: Arc<Orchestrator>,
    config: CoreConfig,
}

impl SchedulerHandle {
    /// Orgs with autonomy enabled.
    async fn active_orgs(&self) -> Result<Vec<foreman_db::models::Organization>> {
        let orgs = org_db::list_organizations(&self.pool).await?;
        Ok(orgs
            .into_iter()
            .filter(|o| o.autonomous_execution_enabled)
            .collect())
    }

    /// Decompose driver: expand active goals that have not been expanded.
    async fn drive_decompose(&self) -> Result<()> {
        for org in self.active_orgs().await? {
            for goal in goal_db::list_undecomposed_goals(&self.pool, org.id).await? {
                if let Err(e) = self.orchestrator.decompose_goal(goal.id).await {
                    warn!(goal_id = %goal.id, error = %e, "goal decomposition failed");
                }
            }
        }
        Ok(())
    }

    /// Execute driver: promote unblocked tasks, then enqueue idle agents
    /// with work, respecting the per-org concurrency cap.
    async fn drive_execute(&self, tx: &mpsc::UnboundedSender<Uuid>) -> Result<()> {
        for org in self.active_orgs().await? {
            task_db::promote_unblocked_tasks(&self.pool, org.id).await?;

            let busy = agent_db::count_busy_agents(&self.pool, org.id).await?;
            let cap = org.max_concurrent_agents as i64;
            if busy >= cap {
                debug!(org = %org.name, busy, cap, "concurrency cap reached, skipping");
                continue;
            }

            let mut slots = cap - busy;
            for agent in agent_db::list_dispatchable_agents(&self.pool, org.id).await? {
                if slots == 0 {
                    break;
                }
                if tx.send(agent.id).is_ok() {
                    slots -= 1;
                }
            }
        }
        Ok(())
    }

    /// Review driver: enqueue owners of ready-for-review parents and
    /// process merged pull requests.
    async fn drive_review(&self, tx: &mpsc::UnboundedSender<Uuid>) -> Result<()> {
        for org in self.active_orgs().await? {
            match self.orchestrator.process_merged_pull_requests(org.id).await {
                Ok(0) => {}
                Ok(n) => info!(org = %org.name, merged = n, "processed merged pull requests"),
                Err(e) => warn!(org = %org.name, error = %e, "merge watch failed"),
            }
        }

        for task in task_db::list_ready_for_review(&self.pool).await? {
            if let Some(agent_id) = task.assigned_agent_id {
                let _ = tx.send(agent_id);
            }
        }
        Ok(())
    }

    /// Team-distribute driver: expand pending epics whose team has a
    /// manager.
    async fn drive_distribute(&self) -> Result<()> {
        let enabled: HashSet<Uuid> =
            self.active_orgs().await?.into_iter().map(|o| o.id).collect();

        for epic in task_db::list_distributable_epics(&self.pool).await? {
            if !enabled.contains(&epic.organization_id) {
                continue;
            }
            if let Err(e) = self.orchestrator.distribute_epic(epic.id).await {
                warn!(epic_id = %epic.id, error = %e, "distribution failed");
            }
        }
        Ok(())
    }

    /// Stuck sweep: block limbo tasks, promote stalled escalations, and
    /// remove orphaned worktrees.
    async fn drive_stuck_sweep(&self) -> Result<()> {
        let cutoff =
            Utc::now() - chrono::Duration::hours(self.config.scheduler.stuck_threshold_hours);
        for task in task_db::list_stuck_tasks(&self.pool, cutoff).await? {
            let message = format!(
                "stuck in progress since {}",
                task.started_at.map(|t| t.to_rfc3339()).unwrap_or_default()
            );
            warn!(task_id = %task.id, %message, "sweeping stuck task");
            task_db::block_task(&self.pool, task.id, &message).await?;
        }

        let escalator: &Escalator = self.orchestrator.escalator();
        let timeout = chrono::Duration::hours(self.config.escalation.level_timeout_hours);
        match escalator.promote_stalled(timeout).await {
            Ok(0) => {}
            Ok(n) => info!(promoted = n, "promoted stalled escalations"),
            Err(e) => warn!(error = %e, "stalled-escalation promotion failed"),
        }

        // Orphan worktrees, per project.
        let sweep_age = Duration::from_secs(
            self.config.workspace.orphan_sweep_hours.max(0) as u64 * 3600,
        );
        for org in org_db::list_organizations(&self.pool).await? {
            for project in project_db::list_projects(&self.pool, org.id).await? {
                let Ok(manager) = WorkspaceManager::new(
                    &project.working_directory,
                    &project.integration_branch,
                ) else {
                    continue;
                };
                match manager.sweep_orphans(sweep_age) {
                    Ok(removed) if !removed.is_empty() => {
                        info!(
                            project = %project.name,
                            removed = removed.len(),
                            "swept orphan worktrees"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!(project = %project.name, error = %e, "orphan sweep failed"),
                }
            }
        }

        Ok(())
    }

    /// Progress report: aggregate counts per org to the observability
    /// sink (structured logs).
    async fn drive_progress_report(&self) -> Result<()> {
        for org in org_db::list_organizations(&self.pool).await? {
            let progress = task_db::get_org_progress(&self.pool, org.id).await?;
            let busy = agent_db::count_busy_agents(&self.pool, org.id).await?;
            let events = event_db::count_events_by_kind(&self.pool, org.id).await?;
            info!(
                org = %org.name,
                autonomous = org.autonomous_execution_enabled,
                busy_agents = busy,
                pending = progress.pending,
                ready = progress.ready,
                in_progress = progress.in_progress,
                in_review = progress.in_review,
                ready_for_review = progress.ready_for_review,
                blocked = progress.blocked,
                failed = progress.failed,
                completed = progress.completed,
                total = progress.total,
                event_kinds = events.len(),
                "progress report"
            );
        }
        Ok(())
    }
}

/// Forward `REVIEW_REQUEST` messages from the bus to the worker pool.
async fn review_request_listener(
    mut rx: tokio::sync::broadcast::Receiver<crate::bus::Message>,
    tx: mpsc::UnboundedSender<Uuid>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            received = rx.recv() => received,
            _ = cancel.cancelled() => return,
        };
        match received {
            Ok(crate::bus::Message::ReviewRequest { agent_id, .. }) => {
                let _ = tx.send(agent_id);
            }
            Ok(_) => {}
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "review listener lagged, relying on the review driver");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
        }
    }
}

/// The bounded worker pool: consumes agent ids, runs cycles, dedupes
/// in-flight agents.
async fn worker_pool(
    mut rx: mpsc::UnboundedReceiver<Uuid>,
    orchestrator: Arc<Orchestrator>,
    executing: Arc<Mutex<HashSet<Uuid>>>,
    max_concurrent: usize,
    cancel: CancellationToken,
) {
    let semaphore = Arc::new(Semaphore::new(max_concurrent.max(1)));

    loop {
        let agent_id = tokio::select! {
            received = rx.recv() => match received {
                Some(agent_id) => agent_id,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };

        // Dedup: skip agents with a cycle already in flight.
        {
            let mut set = executing.lock().unwrap_or_else(|e| e.into_inner());
            if !set.insert(agent_id) {
                debug!(agent_id = %agent_id, "cycle already in flight, skipping");
                continue;
            }
        }

        let permit = match Arc::clone(&semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };

        let orchestrator = Arc::clone(&orchestrator);
        let executing = Arc::clone(&executing);
        tokio::spawn(async move {
            let result = orchestrator.run_cycle(agent_id).await;
            match &result {
                Ok(cycle) if cycle.no_task_available => {
                    debug!(agent_id = %agent_id, "cycle found no task");
                }
                Ok(cycle) => {
                    info!(
                        agent_id = %agent_id,
                        success = cycle.success,
                        task_id = ?cycle.task_id,
                        duration_ms = cycle.duration.as_millis() as u64,
                        error = cycle.error.as_deref().unwrap_or(""),
                        "cycle finished"
                    );
                }
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "cycle aborted");
                }
            }

            // Always free the slot, even when the launch or cycle failed.
            let mut set = executing.lock().unwrap_or_else(|e| e.into_inner());
            set.remove(&agent_id);
            drop(permit);
        });
    }
}
