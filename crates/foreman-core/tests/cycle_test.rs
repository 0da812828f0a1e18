//! End-to-end cycle tests: a scripted provider stands in for the LLM, an
//! in-memory host plays the forge, and a throwaway git repository backs
//! the worktrees.

#![cfg(unix)]

mod common;

use std::sync::Arc;

use common::{create_temp_repo, status_of, write_script, Fixture};

use foreman_core::bus::{Message, MessageBus};
use foreman_core::config::CoreConfig;
use foreman_core::cycle::Orchestrator;
use foreman_core::provider::CommandProvider;
use foreman_core::runner::ProcessRunner;
use foreman_core::vcs::{InMemoryVcsHost, VcsHost};
use foreman_db::models::{AgentStatus, ApprovalKind, TaskStatus};
use foreman_db::queries::agents as agent_db;
use foreman_db::queries::approvals;
use foreman_db::queries::organizations as org_db;
use foreman_db::queries::pull_requests as pr_db;
use foreman_db::queries::tasks::{self as task_db, NewTask};

struct Harness {
    orchestrator: Orchestrator,
    vcs: Arc<InMemoryVcsHost>,
    bus: MessageBus,
    _script_dir: tempfile::TempDir,
}

/// Build an orchestrator whose provider is a shell script.
fn harness(fx: &Fixture, provider_body: &str, mutate: impl FnOnce(&mut CoreConfig)) -> Harness {
    let script_dir = tempfile::TempDir::new().unwrap();
    let script = write_script(script_dir.path(), "provider.sh", provider_body);

    let mut config = CoreConfig::default();
    config.provider.command = script.to_string_lossy().into_owned();
    config.provider.args = vec![];
    config.provider.timeout_secs = 30;
    mutate(&mut config);

    let runner = ProcessRunner::new();
    let provider = Arc::new(CommandProvider::from_config(&config.provider, runner.clone()));
    let vcs = Arc::new(InMemoryVcsHost::new());
    let bus = MessageBus::default();

    let orchestrator = Orchestrator::new(
        fx.pool.clone(),
        provider,
        Arc::clone(&vcs) as Arc<dyn VcsHost>,
        bus.clone(),
        runner,
        config,
    );

    Harness {
        orchestrator,
        vcs,
        bus,
        _script_dir: script_dir,
    }
}

/// A provider that swallows the prompt and reports success.
const HAPPY_PROVIDER: &str = "cat > /dev/null\necho 'Implemented the change.'\n";

#[tokio::test]
async fn happy_path_single_task() {
    let fx = Fixture::create().await;
    let (_repo_dir, repo_path) = create_temp_repo();
    let project = fx.project("app", &repo_path.to_string_lossy()).await;

    let mut new = NewTask::standard(fx.org.id, "add pagination", fx.agent.id);
    new.project_id = Some(project.id);
    let task = fx.task(&new).await;

    let h = harness(&fx, HAPPY_PROVIDER, |_| {});

    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(result.success, "cycle failed: {:?}", result.error);
    assert_eq!(result.task_id, Some(task.id));

    // Task parked in review with a pull request bound to it.
    assert_eq!(status_of(&fx.pool, task.id).await, TaskStatus::InReview);
    let pr = pr_db::get_latest_for_task(&fx.pool, task.id)
        .await
        .unwrap()
        .expect("a pull request should be bound to the task");

    // The worktree exists until the merge lands.
    let worktree_base = repo_path.parent().unwrap().join(".git-worktrees");
    assert!(worktree_base.exists());

    // Agent is back to idle.
    let agent = agent_db::get_agent(&fx.pool, fx.agent.id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);
    assert_eq!(agent.current_task_id, None);

    // Merge notification completes the task and removes the worktree.
    h.vcs.mark_merged(pr.pr_number);
    let processed = h
        .orchestrator
        .process_merged_pull_requests(fx.org.id)
        .await
        .unwrap();
    assert_eq!(processed, 1);
    assert_eq!(status_of(&fx.pool, task.id).await, TaskStatus::Completed);

    let leftovers: Vec<_> = std::fs::read_dir(&worktree_base)
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "worktree should be removed after merge");

    fx.teardown().await;
}

#[tokio::test]
async fn provider_error_releases_with_backoff() {
    let fx = Fixture::create().await;
    let (_repo_dir, repo_path) = create_temp_repo();
    let project = fx.project("app", &repo_path.to_string_lossy()).await;

    let mut new = NewTask::standard(fx.org.id, "doomed attempt", fx.agent.id);
    new.project_id = Some(project.id);
    let task = fx.task(&new).await;

    let h = harness(&fx, "cat > /dev/null\necho 'Error: model overloaded'\n", |_| {});

    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(!result.success);

    // Level-1 self-resolve: back to ready with a bumped counter and a
    // scheduled next attempt.
    let task = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.retry_count, 1);
    assert!(task.next_attempt_at.is_some());

    let agent = agent_db::get_agent(&fx.pool, fx.agent.id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);

    fx.teardown().await;
}

#[tokio::test]
async fn quality_gate_failure_retries_then_reassigns() {
    let fx = Fixture::create().await;
    fx.add_agent("worker-2").await;
    let (_repo_dir, repo_path) = create_temp_repo();
    let project = fx.project("app", &repo_path.to_string_lossy()).await;

    let mut new = NewTask::standard(fx.org.id, "gated work", fx.agent.id);
    new.project_id = Some(project.id);
    let task = fx.task(&new).await;

    let h = harness(&fx, HAPPY_PROVIDER, |config| {
        config.quality_gate.commands = vec!["false".to_owned()];
    });

    // First failure: plain retry.
    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(!result.success);
    let current = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Ready);
    assert_eq!(current.retry_count, 1);

    // Exhaust the budget, then the next failure goes to the team.
    sqlx::query("UPDATE tasks SET retry_count = 3, next_attempt_at = NULL WHERE id = $1")
        .bind(task.id)
        .execute(&fx.pool)
        .await
        .unwrap();

    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(!result.success);

    let current = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(current.status, TaskStatus::Ready);
    assert_eq!(current.assigned_agent_id, None, "assignment must be cleared");
    assert_eq!(current.assigned_team_id, Some(fx.team.id));
    assert!(current.description.contains("reassign-from worker-1"));

    fx.teardown().await;
}

#[tokio::test]
async fn budget_stop_pauses_the_whole_org() {
    let fx = Fixture::create().await;
    let (_repo_dir, repo_path) = create_temp_repo();
    let project = fx.project("app", &repo_path.to_string_lossy()).await;

    sqlx::query("UPDATE organizations SET daily_budget_cents = 1 WHERE id = $1")
        .bind(fx.org.id)
        .execute(&fx.pool)
        .await
        .unwrap();

    let mut new = NewTask::standard(fx.org.id, "expensive", fx.agent.id);
    new.project_id = Some(project.id);
    let task = fx.task(&new).await;

    // Prior spend recorded against another task in the same org.
    let prior = fx.ready_task("already paid for").await;
    foreman_db::queries::task_events::insert_task_event(
        &fx.pool,
        &foreman_db::queries::task_events::NewTaskEvent {
            task_id: prior.id,
            agent_id: None,
            kind: "provider_invoked".to_owned(),
            payload: serde_json::json!({ "estimated_cents": 100.0 }),
        },
    )
    .await
    .unwrap();

    let h = harness(&fx, HAPPY_PROVIDER, |_| {});
    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(!result.success);

    // The whole org is paused, not just the task.
    let org = org_db::get_organization(&fx.pool, fx.org.id).await.unwrap().unwrap();
    assert!(!org.autonomous_execution_enabled);
    assert!(org.emergency_stop_reason.is_some());

    let pending = approvals::list_pending(&fx.pool, fx.org.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ApprovalKind::CostOverride);

    // Intent preserved: the task went back to pending.
    assert_eq!(status_of(&fx.pool, task.id).await, TaskStatus::Pending);

    fx.teardown().await;
}

#[tokio::test]
async fn merged_siblings_surface_parent_for_review() {
    let fx = Fixture::create().await;
    let (_repo_dir, repo_path) = create_temp_repo();
    let project = fx.project("app", &repo_path.to_string_lossy()).await;

    let mut parent = NewTask::standard(fx.org.id, "the epic body", fx.agent.id);
    parent.project_id = Some(project.id);
    parent.status = TaskStatus::Pending;
    let parent = fx.task(&parent).await;

    let h = harness(&fx, HAPPY_PROVIDER, |_| {});
    let mut rx = h.bus.subscribe();

    // Two children already executed and awaiting merge.
    let mut pr_numbers = Vec::new();
    for title in ["child a", "child b"] {
        let mut new = NewTask::standard(fx.org.id, title, fx.agent.id);
        new.project_id = Some(project.id);
        new.parent_task_id = Some(parent.id);
        new.depth = 1;
        let child = fx.task(&new).await;
        sqlx::query("UPDATE tasks SET status = 'in_review' WHERE id = $1")
            .bind(child.id)
            .execute(&fx.pool)
            .await
            .unwrap();
        let info = h
            .vcs
            .create_pull_request(&foreman_core::vcs::PullRequestSpec {
                title: title.to_owned(),
                body: String::new(),
                branch: format!("feature/worker-1/task-{}", child.id),
                base: "main".to_owned(),
            })
            .await
            .unwrap();
        pr_db::insert_task_pull_request(&fx.pool, child.id, info.number, &info.branch)
            .await
            .unwrap();
        pr_numbers.push(info.number);
    }

    // First merge: parent unchanged.
    h.vcs.mark_merged(pr_numbers[0]);
    h.orchestrator
        .process_merged_pull_requests(fx.org.id)
        .await
        .unwrap();
    assert_eq!(status_of(&fx.pool, parent.id).await, TaskStatus::Pending);

    // Second merge: all siblings completed, parent flips and the bus
    // carries a review request for the owning agent.
    h.vcs.mark_merged(pr_numbers[1]);
    h.orchestrator
        .process_merged_pull_requests(fx.org.id)
        .await
        .unwrap();
    assert_eq!(
        status_of(&fx.pool, parent.id).await,
        TaskStatus::ReadyForReview
    );

    let message = rx.try_recv().expect("review request expected");
    assert_eq!(
        message,
        Message::ReviewRequest {
            task_id: parent.id,
            agent_id: fx.agent.id,
        }
    );

    fx.teardown().await;
}

#[tokio::test]
async fn review_branch_completes_parent() {
    let fx = Fixture::create().await;

    let mut parent = NewTask::standard(fx.org.id, "parent work", fx.agent.id);
    parent.status = TaskStatus::Pending;
    let parent = fx.task(&parent).await;
    let mut child = NewTask::standard(fx.org.id, "child work", fx.agent.id);
    child.parent_task_id = Some(parent.id);
    child.depth = 1;
    let child = fx.task(&child).await;
    sqlx::query("UPDATE tasks SET status = 'completed', completed_at = now() WHERE id = $1")
        .bind(child.id)
        .execute(&fx.pool)
        .await
        .unwrap();
    sqlx::query("UPDATE tasks SET status = 'ready_for_review' WHERE id = $1")
        .bind(parent.id)
        .execute(&fx.pool)
        .await
        .unwrap();

    let h = harness(
        &fx,
        "cat > /dev/null\necho '{\"action\": \"complete\", \"reasoning\": \"done\"}'\n",
        |_| {},
    );

    let result = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(result.success, "review cycle failed: {:?}", result.error);
    assert_eq!(result.task_id, Some(parent.id));
    assert_eq!(status_of(&fx.pool, parent.id).await, TaskStatus::Completed);

    let agent = agent_db::get_agent(&fx.pool, fx.agent.id).await.unwrap().unwrap();
    assert_eq!(agent.status, AgentStatus::Idle);

    fx.teardown().await;
}

#[tokio::test]
async fn emergency_stop_then_resume_roundtrip() {
    let fx = Fixture::create().await;
    let b = fx.add_agent("worker-2").await;
    let c = fx.add_agent("worker-3").await;

    // Three agents mid-flight.
    let mut tasks = Vec::new();
    for agent in [&fx.agent, &b, &c] {
        let task = fx
            .task(&NewTask::standard(fx.org.id, &format!("{} task", agent.name), agent.id))
            .await;
        task_db::claim_task(&fx.pool, task.id, agent.id, TaskStatus::Ready)
            .await
            .unwrap();
        agent_db::transition_agent_status(
            &fx.pool,
            agent.id,
            AgentStatus::Idle,
            AgentStatus::Working,
            Some(task.id),
        )
        .await
        .unwrap();
        tasks.push(task);
    }

    let h = harness(&fx, HAPPY_PROVIDER, |_| {});
    let report = h
        .orchestrator
        .emergency_stop(fx.org.id, "operator hit the button")
        .await
        .unwrap();
    assert_eq!(report.paused_agents, 3);
    assert_eq!(report.reset_tasks.len(), 3);

    // Tasks revert to pending (not failed); agents are paused; the org is
    // gated so the next cycle refuses to run.
    for task in &tasks {
        assert_eq!(status_of(&fx.pool, task.id).await, TaskStatus::Pending);
    }
    for agent in [&fx.agent, &b, &c] {
        let agent = agent_db::get_agent(&fx.pool, agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Paused);
    }

    let refused = h.orchestrator.run_cycle(fx.agent.id).await.unwrap();
    assert!(!refused.success);
    assert!(refused.error.unwrap().contains("disabled"));

    // Resume: everyone idle, nothing in progress.
    let resumed = h.orchestrator.resume(fx.org.id).await.unwrap();
    assert_eq!(resumed, 3);
    for agent in [&fx.agent, &b, &c] {
        let agent = agent_db::get_agent(&fx.pool, agent.id).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Idle);
    }
    let progress = task_db::get_org_progress(&fx.pool, fx.org.id).await.unwrap();
    assert_eq!(progress.in_progress, 0);

    fx.teardown().await;
}
