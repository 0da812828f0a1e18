//! The per-agent orchestrator cycle: pull a task, execute it through the
//! provider inside an isolated worktree, gate the result, and route it to
//! review, distribution, delegation, or escalation.
//!
//! One cycle is sequential; concurrency comes from the scheduler running
//! cycles for many agents at once. All task and agent transitions are
//! compare-and-set, so a cycle that loses a race backs out instead of
//! corrupting state.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{Datelike, TimeZone, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{
    Agent, AgentStatus, ApprovalKind, Organization, Role, Task, TaskStatus, TaskType, Team,
};
use foreman_db::queries::agents as agent_db;
use foreman_db::queries::approvals::{self, NewApprovalRequest};
use foreman_db::queries::organizations as org_db;
use foreman_db::queries::projects as project_db;
use foreman_db::queries::pull_requests as pr_db;
use foreman_db::queries::roles as role_db;
use foreman_db::queries::task_events::{self, NewTaskEvent};
use foreman_db::queries::tasks as task_db;
use foreman_db::queries::teams as team_db;

use crate::bus::{Message, MessageBus};
use crate::config::CoreConfig;
use crate::cost::{self, BudgetVerdict};
use crate::delegation::{build_delegation_prompt, detect_complexity, DelegationOutcome, Delegator};
use crate::distributor::{build_distribution_prompt, Distributor, MemberInfo};
use crate::escalation::{EscalationLevel, Escalator};
use crate::knowledge;
use crate::pool::{PullClass, TaskPool};
use crate::prompt::{compose_review_prompt, compose_task_prompt, AgentContext, ComposedPrompt};
use crate::provider::{Provider, ProviderRequest};
use crate::response::parse_response;
use crate::review::Reviewer;
use crate::runner::{ProcessRequest, ProcessRunner};
use crate::state::TaskStateMachine;
use crate::vcs::{PullRequestSpec, VcsHost};
use crate::workspace::{Workspace, WorkspaceManager};

/// Outcome of one agent cycle.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub success: bool,
    pub task_id: Option<Uuid>,
    pub duration: Duration,
    pub error: Option<String>,
    pub no_task_available: bool,
}

impl CycleResult {
    fn no_task(start: Instant) -> Self {
        Self {
            success: true,
            task_id: None,
            duration: start.elapsed(),
            error: None,
            no_task_available: true,
        }
    }

    fn ok(task_id: Uuid, start: Instant) -> Self {
        Self {
            success: true,
            task_id: Some(task_id),
            duration: start.elapsed(),
            error: None,
            no_task_available: false,
        }
    }

    fn failed(task_id: Option<Uuid>, start: Instant, error: impl Into<String>) -> Self {
        Self {
            success: false,
            task_id,
            duration: start.elapsed(),
            error: Some(error.into()),
            no_task_available: false,
        }
    }
}

/// What an emergency stop touched.
#[derive(Debug, Clone)]
pub struct EmergencyStopReport {
    pub paused_agents: u64,
    pub reset_tasks: Vec<Uuid>,
}

/// Everything a cycle needs, shared across agents.
pub struct Orchestrator {
    pool: PgPool,
    task_pool: TaskPool,
    provider: Arc<dyn Provider>,
    vcs: Arc<dyn VcsHost>,
    runner: ProcessRunner,
    escalator: Escalator,
    reviewer: Reviewer,
    distributor: Distributor,
    delegator: Delegator,
    bus: MessageBus,
    config: CoreConfig,
}

impl Orchestrator {
    pub fn new(
        pool: PgPool,
        provider: Arc<dyn Provider>,
        vcs: Arc<dyn VcsHost>,
        bus: MessageBus,
        runner: ProcessRunner,
        config: CoreConfig,
    ) -> Self {
        let escalator = Escalator::new(pool.clone(), bus.clone(), config.orchestrator.max_retry);
        let reviewer = Reviewer::new(pool.clone(), config.orchestrator.max_review_count);
        let distributor = Distributor::new(pool.clone());
        let delegator = Delegator::new(pool.clone());
        let task_pool = TaskPool::new(pool.clone(), config.pool.clone());
        Self {
            pool,
            task_pool,
            provider,
            vcs,
            runner,
            escalator,
            reviewer,
            distributor,
            delegator,
            bus,
            config,
        }
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    pub fn bus(&self) -> &MessageBus {
        &self.bus
    }

    /// Run one cycle for an agent.
    pub async fn run_cycle(&self, agent_id: Uuid) -> Result<CycleResult> {
        let start = Instant::now();

        let agent = agent_db::get_agent(&self.pool, agent_id)
            .await?
            .with_context(|| format!("agent {agent_id} not found"))?;
        let org = org_db::get_organization(&self.pool, agent.organization_id)
            .await?
            .with_context(|| format!("organization {} not found", agent.organization_id))?;

        // 1. Permission gate: emergency stop wins over everything.
        if !org.autonomous_execution_enabled {
            return Ok(CycleResult::failed(
                None,
                start,
                "autonomous execution is disabled for this organization",
            ));
        }

        // Only the orchestrator moves an agent idle -> working; losing this
        // race means another cycle already owns the agent.
        let claimed = agent_db::transition_agent_status(
            &self.pool,
            agent.id,
            AgentStatus::Idle,
            AgentStatus::Working,
            None,
        )
        .await?;
        if claimed == 0 {
            return Ok(CycleResult::failed(None, start, "agent is not idle"));
        }

        let role = role_db::get_role(&self.pool, agent.role_id)
            .await?
            .with_context(|| format!("role {} not found", agent.role_id))?;

        // 2. Pull.
        let pulled = self.task_pool.pull_next_task(&agent, &role.capabilities).await?;
        let Some(pulled) = pulled else {
            self.return_agent(&agent, AgentStatus::Working).await;
            return Ok(CycleResult::no_task(start));
        };

        // 3. Review branch.
        if pulled.class == PullClass::ReviewDue {
            agent_db::transition_agent_status(
                &self.pool,
                agent.id,
                AgentStatus::Working,
                AgentStatus::Reviewing,
                Some(pulled.task.id),
            )
            .await?;
            let result = self.run_review(&agent, &org, &role, pulled.task, start).await;
            self.return_agent(&agent, AgentStatus::Reviewing).await;
            return result;
        }

        // 4..10. Execution branch; the task is already claimed.
        agent_db::set_current_task(&self.pool, agent.id, Some(pulled.task.id)).await?;
        self.record(pulled.task.id, Some(agent.id), "claimed", serde_json::json!({}))
            .await;

        let result = self
            .execute_task(&agent, &org, &role, pulled.task, start)
            .await;

        agent_db::set_current_task(&self.pool, agent.id, None).await?;
        self.return_agent(&agent, AgentStatus::Working).await;
        result
    }

    /// Flip the agent back to idle from wherever this cycle put it.
    ///
    /// CAS keeps hands off agents an emergency stop paused mid-cycle.
    async fn return_agent(&self, agent: &Agent, from: AgentStatus) {
        if let Err(e) =
            agent_db::transition_agent_status(&self.pool, agent.id, from, AgentStatus::Idle, None)
                .await
        {
            warn!(agent_id = %agent.id, error = %e, "failed to return agent to idle");
        }
    }

    // -----------------------------------------------------------------
    // Execution branch
    // -----------------------------------------------------------------

    async fn execute_task(
        &self,
        agent: &Agent,
        org: &Organization,
        role: &Role,
        task: Task,
        start: Instant,
    ) -> Result<CycleResult> {
        let task_id = task.id;

        // Team epics never reach here through the pool; one arriving means
        // an invariant broke upstream.
        if task.task_type == TaskType::TeamEpic {
            warn!(task_id = %task_id, "team epic reached the execution branch, releasing");
            self.task_pool.release(task_id, agent).await?;
            return Ok(CycleResult::failed(
                Some(task_id),
                start,
                "team epics are distributed, not executed",
            ));
        }

        // 6. Complexity detection -> delegation.
        if let Some(signal) = detect_complexity(
            &task,
            self.config.orchestrator.complexity_token_threshold,
        ) {
            if task.depth < 3
                && agent.may_delegate()
                && self.config.orchestrator.effective_temp_depth() >= 1
            {
                match self.try_delegate(agent, org, &task).await {
                    Ok(true) => {
                        info!(task_id = %task_id, ?signal, "task delegated to specialists");
                        return Ok(CycleResult::ok(task_id, start));
                    }
                    Ok(false) => {
                        info!(task_id = %task_id, "delegation refused, processing sequentially");
                    }
                    Err(e) => {
                        warn!(task_id = %task_id, error = %e, "delegation failed, processing sequentially");
                    }
                }
            }
        }

        // 7. Workspace.
        let Some(project_id) = task.project_id else {
            // An executable task with no project cannot have a worktree;
            // treat as an invariant violation.
            task_db::block_task(&self.pool, task_id, "task has no project").await?;
            self.escalator
                .escalate_from(task_id, Some(agent), "task has no project", EscalationLevel::HumanApproval)
                .await?;
            return Ok(CycleResult::failed(Some(task_id), start, "task has no project"));
        };
        let project = project_db::get_project(&self.pool, project_id)
            .await?
            .with_context(|| format!("project {project_id} not found"))?;

        let manager =
            match WorkspaceManager::new(&project.working_directory, &project.integration_branch) {
                Ok(manager) => manager,
                Err(e) => {
                    let reason = format!("workspace manager init failed: {e}");
                    self.retry_or_escalate(&task, agent, &reason, None).await?;
                    return Ok(CycleResult::failed(Some(task_id), start, reason));
                }
            };

        let workspace = match manager.create(agent.id, &agent.name, task_id) {
            Ok(workspace) => workspace,
            Err(e) => {
                // Worktree creation failures are retryable by contract.
                let reason = format!("worktree creation failed: {e}");
                self.retry_or_escalate(&task, agent, &reason, None).await?;
                return Ok(CycleResult::failed(Some(task_id), start, reason));
            }
        };

        // Compose the prompt (layers 1-6, knowledge injected).
        let team = match agent.team_id {
            Some(team_id) => team_db::get_team(&self.pool, team_id).await?,
            None => None,
        };
        let prompt = self
            .compose_execution_prompt(agent, org, role, team.as_ref(), &task)
            .await?;

        // Budget gate, on the real prompt estimate.
        if let Some(result) = self
            .check_budget(org, agent, &task, &prompt, &manager, &workspace, start)
            .await?
        {
            return Ok(result);
        }

        // Run the provider inside the worktree.
        let estimate = cost::estimate_tokens(&prompt.text, "");
        let estimated_cents = cost::estimate_cost_cents(
            &estimate,
            self.config.provider.input_rate_per_million_cents,
            self.config.provider.output_rate_per_million_cents,
        );
        self.record(
            task_id,
            Some(agent.id),
            "provider_invoked",
            serde_json::json!({
                "estimated_tokens": estimate.total(),
                "estimated_cents": estimated_cents,
            }),
        )
        .await;

        let response = match self
            .provider
            .invoke(&ProviderRequest {
                prompt: prompt.text,
                cwd: Some(workspace.path.clone()),
                timeout: Duration::from_secs(self.config.provider.timeout_secs),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                let reason = format!("provider invocation failed: {e}");
                self.cleanup(&manager, &workspace);
                self.retry_or_escalate(&task, agent, &reason, None).await?;
                return Ok(CycleResult::failed(Some(task_id), start, reason));
            }
        };

        // 8. Parse; provider-reported errors release with backoff.
        let parsed = parse_response(&response.stdout);
        if parsed.has_error || !response.success() {
            let reason = format!(
                "provider reported failure (exit {:?}): {}",
                response.exit_code,
                first_line(&response.stderr).unwrap_or_else(|| first_line(&parsed.text).unwrap_or_default()),
            );
            self.cleanup(&manager, &workspace);
            self.retry_or_escalate(&task, agent, &reason, None).await?;
            return Ok(CycleResult::failed(Some(task_id), start, reason));
        }

        // 9. Quality gate.
        if let Some(failure) = self.run_quality_gate(&workspace).await? {
            self.record(
                task_id,
                Some(agent.id),
                "gate_failed",
                serde_json::json!({ "failure": failure }),
            )
            .await;
            self.cleanup(&manager, &workspace);
            let reason = format!("quality gate failed: {failure}");
            // Gate exhaustion escalates at team level, not self-resolve.
            self.retry_or_escalate(&task, agent, &reason, Some(EscalationLevel::TeamCollaboration))
                .await?;
            return Ok(CycleResult::failed(Some(task_id), start, reason));
        }

        // 10. Open the pull request and park the task in review.
        let pr = self
            .vcs
            .create_pull_request(&PullRequestSpec {
                title: task.title.clone(),
                body: parsed.text.clone(),
                branch: workspace.branch.clone(),
                base: project.integration_branch.clone(),
            })
            .await
            .context("failed to create pull request")?;

        pr_db::insert_task_pull_request(&self.pool, task_id, pr.number, &workspace.branch).await?;
        TaskStateMachine::transition(
            &self.pool,
            task_id,
            TaskStatus::InProgress,
            TaskStatus::InReview,
        )
        .await?;
        self.record(
            task_id,
            Some(agent.id),
            "pr_opened",
            serde_json::json!({ "pr_number": pr.number, "branch": workspace.branch }),
        )
        .await;

        info!(
            task_id = %task_id,
            agent = %agent.name,
            pr_number = pr.number,
            "task executed, awaiting review"
        );

        Ok(CycleResult::ok(task_id, start))
    }

    /// Ask the provider for a delegation split and apply it. Returns
    /// whether the task was actually delegated.
    async fn try_delegate(&self, agent: &Agent, org: &Organization, task: &Task) -> Result<bool> {
        let roles = role_db::list_delegatable_roles(&self.pool, org.id).await?;
        if roles.is_empty() {
            return Ok(false);
        }

        let prompt = build_delegation_prompt(task, &roles);
        let response = self
            .provider
            .invoke(&ProviderRequest {
                prompt,
                cwd: None,
                timeout: Duration::from_secs(self.config.provider.timeout_secs),
            })
            .await?;

        let parsed = parse_response(&response.stdout);
        if parsed.has_error || !response.success() {
            return Ok(false);
        }

        match self.delegator.apply(task, agent, &roles, &parsed.text).await? {
            DelegationOutcome::Delegated {
                agent_ids,
                subtask_ids,
            } => {
                self.record(
                    task.id,
                    Some(agent.id),
                    "delegated",
                    serde_json::json!({
                        "temporary_agents": agent_ids.len(),
                        "subtasks": subtask_ids.len(),
                    }),
                )
                .await;
                Ok(true)
            }
            DelegationOutcome::Refused { .. } => Ok(false),
        }
    }

    async fn compose_execution_prompt(
        &self,
        agent: &Agent,
        org: &Organization,
        role: &Role,
        team: Option<&Team>,
        task: &Task,
    ) -> Result<ComposedPrompt> {
        let documents = knowledge::select_for_task(
            &self.pool,
            org.id,
            agent.team_id,
            task.project_id,
            agent.id,
            task,
            knowledge::DEFAULT_MAX_DOCUMENTS,
            self.config.provider.context_limit_chars / 2,
        )
        .await?;

        let mut dependencies = Vec::new();
        for dep_id in &task.blocked_by {
            if let Some(dep) = task_db::get_task(&self.pool, *dep_id).await? {
                dependencies.push(dep);
            }
        }

        let ctx = AgentContext {
            organization: org,
            team,
            role,
            agent,
            documents: &documents,
        };
        Ok(compose_task_prompt(&ctx, task, &dependencies))
    }

    /// Pre-invocation budget gate. A `Stop` verdict pauses the whole org,
    /// never just the current task. Returns the early cycle result when
    /// the invocation must not proceed.
    #[allow(clippy::too_many_arguments)]
    async fn check_budget(
        &self,
        org: &Organization,
        agent: &Agent,
        task: &Task,
        prompt: &ComposedPrompt,
        manager: &WorkspaceManager,
        workspace: &Workspace,
        start: Instant,
    ) -> Result<Option<CycleResult>> {
        let estimate = cost::estimate_tokens(&prompt.text, "");
        let proposed_cents = cost::estimate_cost_cents(
            &estimate,
            self.config.provider.input_rate_per_million_cents,
            self.config.provider.output_rate_per_million_cents,
        );

        let now = Utc::now();
        let day_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), now.day(), 0, 0, 0)
            .single()
            .unwrap_or(now);
        let month_start = Utc
            .with_ymd_and_hms(now.year(), now.month(), 1, 0, 0, 0)
            .single()
            .unwrap_or(now);

        let windows = [
            ("daily", org.daily_budget_cents, day_start),
            ("monthly", org.monthly_budget_cents, month_start),
        ];

        for (window, cap, since) in windows {
            let Some(cap) = cap else { continue };
            let spent =
                task_events::sum_estimated_cents_since(&self.pool, org.id, since).await?;
            match cost::check_budget(org, Some(cap), spent, proposed_cents) {
                BudgetVerdict::Ok => {}
                BudgetVerdict::Alert { spent_percent } => {
                    warn!(
                        org = %org.name,
                        window,
                        spent_percent = format!("{spent_percent:.1}"),
                        "budget alert threshold crossed"
                    );
                }
                BudgetVerdict::Stop { spent_percent } => {
                    let reason = format!(
                        "{window} budget stop threshold crossed ({spent_percent:.1}% of {cap} cents)"
                    );
                    warn!(org = %org.name, %reason, "pausing autonomous execution");

                    org_db::disable_autonomy(&self.pool, org.id, &reason).await?;
                    approvals::insert_approval_request(
                        &self.pool,
                        &NewApprovalRequest {
                            organization_id: org.id,
                            task_id: task.id,
                            agent_id: Some(agent.id),
                            kind: ApprovalKind::CostOverride,
                            reason: reason.clone(),
                            metadata: serde_json::json!({
                                "window": window,
                                "spent_cents": spent,
                                "proposed_cents": proposed_cents,
                            }),
                        },
                    )
                    .await?;

                    self.cleanup(manager, workspace);
                    self.task_pool.release(task.id, agent).await?;
                    return Ok(Some(CycleResult::failed(Some(task.id), start, reason)));
                }
            }
        }

        Ok(None)
    }

    /// Run the configured gate hooks in the worktree. Returns the first
    /// failure description, or `None` when the gate passes.
    async fn run_quality_gate(&self, workspace: &Workspace) -> Result<Option<String>> {
        for command_line in &self.config.quality_gate.commands {
            let mut parts = command_line.split_whitespace();
            let Some(command) = parts.next() else { continue };
            let args: Vec<String> = parts.map(str::to_owned).collect();

            let request = ProcessRequest {
                command: command.to_owned(),
                args,
                stdin: None,
                cwd: Some(workspace.path.clone()),
                timeout: Duration::from_secs(self.config.quality_gate.timeout_secs),
            };

            match self.runner.run(&request).await {
                Ok(output) if output.success() => {}
                Ok(output) => {
                    return Ok(Some(format!(
                        "{command_line:?} exited {:?}: {}",
                        output.exit_code,
                        first_line(&output.stderr).unwrap_or_default()
                    )));
                }
                Err(e) => return Ok(Some(format!("{command_line:?} failed to run: {e}"))),
            }
        }
        Ok(None)
    }

    /// Retry in place while budget remains, escalate otherwise.
    ///
    /// `floor` raises the starting escalation level once retries are
    /// exhausted (quality-gate failures start at team level).
    async fn retry_or_escalate(
        &self,
        task: &Task,
        agent: &Agent,
        reason: &str,
        floor: Option<EscalationLevel>,
    ) -> Result<()> {
        let level = match floor {
            Some(floor) => {
                if task.retry_count + 1 < self.config.orchestrator.max_retry {
                    self.escalator.escalate(task.id, Some(agent), reason).await?
                } else {
                    self.escalator
                        .escalate_from(task.id, Some(agent), reason, floor)
                        .await?
                }
            }
            None => self.escalator.escalate(task.id, Some(agent), reason).await?,
        };
        info!(
            task_id = %task.id,
            level = level.as_i32(),
            reason,
            "failure routed through escalation"
        );
        Ok(())
    }

    fn cleanup(&self, manager: &WorkspaceManager, workspace: &Workspace) {
        if let Err(e) = manager.remove(&workspace.path) {
            warn!(path = %workspace.path.display(), error = %e, "workspace cleanup failed");
        }
    }

    // -----------------------------------------------------------------
    // Review branch
    // -----------------------------------------------------------------

    async fn run_review(
        &self,
        agent: &Agent,
        org: &Organization,
        role: &Role,
        parent: Task,
        start: Instant,
    ) -> Result<CycleResult> {
        let parent_id = parent.id;

        TaskStateMachine::transition(
            &self.pool,
            parent_id,
            TaskStatus::ReadyForReview,
            TaskStatus::InReview,
        )
        .await?;

        let children = task_db::list_subtasks(&self.pool, parent_id).await?;
        let team = match agent.team_id {
            Some(team_id) => team_db::get_team(&self.pool, team_id).await?,
            None => None,
        };
        let documents = knowledge::select_for_task(
            &self.pool,
            org.id,
            agent.team_id,
            parent.project_id,
            agent.id,
            &parent,
            knowledge::DEFAULT_MAX_DOCUMENTS,
            self.config.provider.context_limit_chars / 2,
        )
        .await?;

        let ctx = AgentContext {
            organization: org,
            team: team.as_ref(),
            role,
            agent,
            documents: &documents,
        };
        let prompt = compose_review_prompt(&ctx, &parent, &children);

        let response = match self
            .provider
            .invoke(&ProviderRequest {
                prompt: prompt.text,
                cwd: None,
                timeout: Duration::from_secs(self.config.provider.timeout_secs),
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                // Put the parent back so a later review pass retries.
                let _ = TaskStateMachine::transition(
                    &self.pool,
                    parent_id,
                    TaskStatus::InReview,
                    TaskStatus::ReadyForReview,
                )
                .await;
                return Ok(CycleResult::failed(
                    Some(parent_id),
                    start,
                    format!("review invocation failed: {e}"),
                ));
            }
        };

        let parsed = parse_response(&response.stdout);
        let outcome = self.reviewer.apply(&parent, agent, &parsed.text).await?;
        self.record(
            parent_id,
            Some(agent.id),
            "reviewed",
            serde_json::json!({ "outcome": format!("{outcome:?}") }),
        )
        .await;

        Ok(CycleResult::ok(parent_id, start))
    }

    // -----------------------------------------------------------------
    // Distribution entry point (team-distribute driver)
    // -----------------------------------------------------------------

    /// Expand a pending team epic through its manager agent.
    pub async fn distribute_epic(&self, epic_id: Uuid) -> Result<()> {
        let epic = task_db::get_task(&self.pool, epic_id)
            .await?
            .with_context(|| format!("epic {epic_id} not found"))?;
        if epic.task_type != TaskType::TeamEpic || epic.status != TaskStatus::Pending {
            return Ok(());
        }

        let team_id = epic
            .assigned_team_id
            .context("team epic has no assigned team")?;
        let team = team_db::get_team(&self.pool, team_id)
            .await?
            .with_context(|| format!("team {team_id} not found"))?;
        let Some(manager_id) = team.manager_agent_id else {
            return Ok(());
        };
        let manager = agent_db::get_agent(&self.pool, manager_id)
            .await?
            .with_context(|| format!("manager agent {manager_id} not found"))?;

        let mut members = Vec::new();
        for agent in agent_db::list_team_agents(&self.pool, team_id).await? {
            let role = role_db::get_role(&self.pool, agent.role_id)
                .await?
                .with_context(|| format!("role {} not found", agent.role_id))?;
            let in_progress_load = agent_db::count_in_progress_load(&self.pool, agent.id).await?;
            let recent_files = task_db::recent_completed_files(
                &self.pool,
                agent.id,
                self.config.pool.file_affinity_window_hours,
            )
            .await?;
            members.push(MemberInfo {
                agent,
                role,
                in_progress_load,
                recent_files,
            });
        }

        let prompt = build_distribution_prompt(&epic, &members);
        let response = self
            .provider
            .invoke(&ProviderRequest {
                prompt,
                cwd: None,
                timeout: Duration::from_secs(self.config.provider.timeout_secs),
            })
            .await?;

        let parsed = parse_response(&response.stdout);
        let outcome = self
            .distributor
            .apply(&epic, &manager, &members, &parsed.text)
            .await?;
        self.record(
            epic_id,
            Some(manager.id),
            "distributed",
            serde_json::json!({ "outcome": format!("{outcome:?}") }),
        )
        .await;

        Ok(())
    }

    // -----------------------------------------------------------------
    // Goal decomposition entry point (decompose driver)
    // -----------------------------------------------------------------

    /// Expand one goal into projects and tasks through the provider.
    pub async fn decompose_goal(&self, goal_id: Uuid) -> Result<()> {
        let goal = foreman_db::queries::goals::get_goal(&self.pool, goal_id)
            .await?
            .with_context(|| format!("goal {goal_id} not found"))?;
        if goal.auto_decomposed {
            return Ok(());
        }

        let org = org_db::get_organization(&self.pool, goal.organization_id)
            .await?
            .with_context(|| format!("organization {} not found", goal.organization_id))?;
        let teams = team_db::list_teams(&self.pool, org.id).await?;

        let prompt = crate::decompose::build_goal_prompt(&org, &goal, &teams);
        let response = self
            .provider
            .invoke(&ProviderRequest {
                prompt,
                cwd: None,
                timeout: Duration::from_secs(self.config.provider.timeout_secs),
            })
            .await?;
        let parsed = parse_response(&response.stdout);

        let decomposer = crate::decompose::GoalDecomposer::new(
            self.pool.clone(),
            self.config.workspace.default_working_directory.clone(),
            self.config.workspace.integration_branch.clone(),
        );
        decomposer.apply(&org, &goal, &teams, &parsed.text).await?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Emergency stop
    // -----------------------------------------------------------------

    /// Kill-switch for one organization: gate the drivers, pause active
    /// agents, reset in-progress tasks to `pending` (intent preserved),
    /// and signal every live child process.
    pub async fn emergency_stop(
        &self,
        organization_id: Uuid,
        reason: &str,
    ) -> Result<EmergencyStopReport> {
        org_db::disable_autonomy(&self.pool, organization_id, reason).await?;
        let paused_agents = agent_db::pause_active_agents(&self.pool, organization_id).await?;
        let reset_tasks =
            task_db::reset_in_progress_to_pending(&self.pool, organization_id).await?;

        self.runner.kill_all().await;

        warn!(
            organization_id = %organization_id,
            reason,
            paused_agents,
            reset_tasks = reset_tasks.len(),
            "emergency stop executed"
        );

        Ok(EmergencyStopReport {
            paused_agents,
            reset_tasks,
        })
    }

    /// Undo an emergency stop: clear the flag and return paused agents to
    /// idle.
    pub async fn resume(&self, organization_id: Uuid) -> Result<u64> {
        org_db::enable_autonomy(&self.pool, organization_id).await?;
        let resumed = agent_db::resume_paused_agents(&self.pool, organization_id).await?;
        info!(organization_id = %organization_id, resumed, "autonomous execution resumed");
        Ok(resumed)
    }

    // -----------------------------------------------------------------
    // Merge watch (scheduler sweep)
    // -----------------------------------------------------------------

    /// Poll open pull requests; on merge, complete the task, clean up its
    /// worktree, and run the parent bookkeeping. Returns how many merges
    /// were processed.
    pub async fn process_merged_pull_requests(&self, organization_id: Uuid) -> Result<usize> {
        let open = pr_db::list_open_for_org(&self.pool, organization_id).await?;
        let mut processed = 0;

        for pr in open {
            let Some(info) = self.vcs.get_pull_request(pr.pr_number).await? else {
                continue;
            };
            if info.status != foreman_db::models::PullRequestStatus::Merged {
                continue;
            }

            pr_db::update_status(&self.pool, pr.id, info.status).await?;

            let Some(task) = task_db::get_task(&self.pool, pr.task_id).await? else {
                continue;
            };
            if task.status == TaskStatus::InReview {
                TaskStateMachine::transition(
                    &self.pool,
                    task.id,
                    TaskStatus::InReview,
                    TaskStatus::Completed,
                )
                .await?;
            }

            self.cleanup_task_workspace(&task, &pr.branch).await;
            self.record(
                task.id,
                task.assigned_agent_id,
                "merged",
                serde_json::json!({ "pr_number": pr.pr_number }),
            )
            .await;

            // 11. Parent bookkeeping.
            if let Some(parent_id) = task.parent_task_id {
                self.on_subtask_completed(parent_id).await?;
            }

            processed += 1;
        }

        Ok(processed)
    }

    /// When all siblings of a completed subtask are done, surface the
    /// parent for review and retire any temporary helpers.
    async fn on_subtask_completed(&self, parent_id: Uuid) -> Result<()> {
        let Some(parent) = task_db::get_task(&self.pool, parent_id).await? else {
            return Ok(());
        };

        if task_db::all_subtasks_completed(&self.pool, parent_id).await?
            && !matches!(
                parent.status,
                TaskStatus::ReadyForReview | TaskStatus::InReview | TaskStatus::Completed
            )
        {
            TaskStateMachine::mark_ready_for_review(&self.pool, parent_id).await?;
            if let Some(owner) = parent.assigned_agent_id {
                self.bus.send(Message::ReviewRequest {
                    task_id: parent_id,
                    agent_id: owner,
                });
            }
            info!(parent_id = %parent_id, "all subtasks completed, parent ready for review");
        }

        if let Some(owner) = parent.assigned_agent_id {
            self.delegator.cleanup_if_terminal(parent_id, owner).await?;
        }

        Ok(())
    }

    async fn cleanup_task_workspace(&self, task: &Task, branch: &str) {
        let Some(agent_id) = task.assigned_agent_id else { return };
        let Some(project_id) = task.project_id else { return };

        let Ok(Some(project)) = project_db::get_project(&self.pool, project_id).await else {
            return;
        };
        let Ok(manager) =
            WorkspaceManager::new(&project.working_directory, &project.integration_branch)
        else {
            return;
        };

        let path = manager.workspace_path(agent_id, task.id);
        if let Err(e) = manager.remove(&path) {
            warn!(path = %path.display(), error = %e, "post-merge workspace cleanup failed");
        }
        if let Err(e) = manager.delete_branch(branch) {
            warn!(branch, error = %e, "post-merge branch cleanup failed");
        }
    }

    /// Best-effort audit record.
    async fn record(
        &self,
        task_id: Uuid,
        agent_id: Option<Uuid>,
        kind: &str,
        payload: serde_json::Value,
    ) {
        let event = NewTaskEvent {
            task_id,
            agent_id,
            kind: kind.to_owned(),
            payload,
        };
        if let Err(e) = task_events::insert_task_event(&self.pool, &event).await {
            warn!(task_id = %task_id, kind, error = %e, "failed to record task event");
        }
    }
}

fn first_line(s: &str) -> Option<String> {
    s.lines().next().map(|l| l.trim().to_owned()).filter(|l| !l.is_empty())
}
