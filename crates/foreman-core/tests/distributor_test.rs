//! Integration tests for team-epic distribution.

mod common;

use common::{status_of, Fixture};

use foreman_core::distributor::{DistributionOutcome, Distributor, MemberInfo};
use foreman_db::models::{ApprovalKind, TaskStatus, TaskType};
use foreman_db::queries::approvals;
use foreman_db::queries::tasks::{self as task_db, NewTask};
use uuid::Uuid;

async fn epic_fixture(fx: &Fixture) -> foreman_db::models::Task {
    let mut epic = NewTask::standard(fx.org.id, "build the feature", Uuid::nil());
    epic.task_type = TaskType::TeamEpic;
    epic.status = TaskStatus::Pending;
    epic.assigned_agent_id = None;
    epic.assigned_team_id = Some(fx.team.id);
    fx.task(&epic).await
}

fn members_from(fx: &Fixture, extra: &[foreman_db::models::Agent]) -> Vec<MemberInfo> {
    let mut members = vec![MemberInfo {
        agent: fx.agent.clone(),
        role: fx.role.clone(),
        in_progress_load: 0,
        recent_files: vec![],
    }];
    for agent in extra {
        members.push(MemberInfo {
            agent: agent.clone(),
            role: fx.role.clone(),
            in_progress_load: 0,
            recent_files: vec![],
        });
    }
    members
}

fn plan_json(role_id: Uuid, titles_and_deps: &[(&str, &[&str])]) -> String {
    let subtasks: Vec<String> = titles_and_deps
        .iter()
        .map(|(title, deps)| {
            let deps = deps
                .iter()
                .map(|d| format!("\"{d}\""))
                .collect::<Vec<_>>()
                .join(", ");
            format!(
                r#"{{"title": "{title}", "description": "work", "roleId": "{role_id}", "dependencies": [{deps}]}}"#
            )
        })
        .collect();
    format!(r#"{{"subtasks": [{}], "reasoning": "split"}}"#, subtasks.join(", "))
}

#[tokio::test]
async fn accepted_distribution_creates_subtasks_and_starts_epic() {
    let fx = Fixture::create().await;
    let epic = epic_fixture(&fx).await;
    let members = members_from(&fx, &[]);
    let distributor = Distributor::new(fx.pool.clone());

    let output = plan_json(
        fx.role.id,
        &[("design", &[]), ("implement", &["design"]), ("verify", &["implement"])],
    );
    let outcome = distributor
        .apply(&epic, &fx.agent, &members, &output)
        .await
        .unwrap();

    let DistributionOutcome::Distributed { subtask_ids } = outcome else {
        panic!("expected distribution to be accepted");
    };
    assert_eq!(subtask_ids.len(), 3);
    assert_eq!(status_of(&fx.pool, epic.id).await, TaskStatus::InProgress);

    let subtasks = task_db::list_subtasks(&fx.pool, epic.id).await.unwrap();
    assert_eq!(subtasks.len(), 3);
    for subtask in &subtasks {
        assert_eq!(subtask.depth, epic.depth + 1);
        assert_eq!(subtask.parent_task_id, Some(epic.id));
        assert_eq!(subtask.assigned_agent_id, Some(fx.agent.id));
    }

    // Dependency-free subtasks start ready; the rest wait.
    let ready: Vec<_> = subtasks
        .iter()
        .filter(|t| t.status == TaskStatus::Ready)
        .collect();
    let pending: Vec<_> = subtasks
        .iter()
        .filter(|t| t.status == TaskStatus::Pending)
        .collect();
    assert_eq!(ready.len(), 1);
    assert_eq!(ready[0].title, "design");
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|t| !t.blocked_by.is_empty()));

    fx.teardown().await;
}

#[tokio::test]
async fn nine_subtasks_reject_and_leave_epic_pending() {
    let fx = Fixture::create().await;
    let epic = epic_fixture(&fx).await;
    let members = members_from(&fx, &[]);
    let distributor = Distributor::new(fx.pool.clone());

    let nine: Vec<(String, &[&str])> = (0..9).map(|i| (format!("t{i}"), &[][..])).collect();
    let nine_refs: Vec<(&str, &[&str])> =
        nine.iter().map(|(t, d)| (t.as_str(), *d)).collect();
    let output = plan_json(fx.role.id, &nine_refs);

    let outcome = distributor
        .apply(&epic, &fx.agent, &members, &output)
        .await
        .unwrap();
    assert!(matches!(outcome, DistributionOutcome::Rejected { .. }));

    // Epic untouched, no subtasks, a quality approval recorded.
    assert_eq!(status_of(&fx.pool, epic.id).await, TaskStatus::Pending);
    assert!(task_db::list_subtasks(&fx.pool, epic.id).await.unwrap().is_empty());

    let pending = approvals::list_pending(&fx.pool, fx.org.id).await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].kind, ApprovalKind::Quality);
    assert_eq!(pending[0].task_id, epic.id);

    fx.teardown().await;
}

#[tokio::test]
async fn cyclic_dependencies_reject() {
    let fx = Fixture::create().await;
    let epic = epic_fixture(&fx).await;
    let members = members_from(&fx, &[]);
    let distributor = Distributor::new(fx.pool.clone());

    let output = plan_json(
        fx.role.id,
        &[("a", &["c"]), ("b", &["a"]), ("c", &["b"])],
    );
    let outcome = distributor
        .apply(&epic, &fx.agent, &members, &output)
        .await
        .unwrap();
    assert!(matches!(outcome, DistributionOutcome::Rejected { .. }));
    assert_eq!(status_of(&fx.pool, epic.id).await, TaskStatus::Pending);

    fx.teardown().await;
}

#[tokio::test]
async fn prose_output_rejects() {
    let fx = Fixture::create().await;
    let epic = epic_fixture(&fx).await;
    let members = members_from(&fx, &[]);
    let distributor = Distributor::new(fx.pool.clone());

    let outcome = distributor
        .apply(&epic, &fx.agent, &members, "I would break this into parts.")
        .await
        .unwrap();
    assert!(matches!(outcome, DistributionOutcome::Rejected { .. }));
    assert_eq!(status_of(&fx.pool, epic.id).await, TaskStatus::Pending);

    fx.teardown().await;
}

#[tokio::test]
async fn assignment_spreads_by_load() {
    let fx = Fixture::create().await;
    let second = fx.add_agent("worker-2").await;
    let epic = epic_fixture(&fx).await;
    let distributor = Distributor::new(fx.pool.clone());

    // worker-1 is loaded; worker-2 is free.
    let mut members = members_from(&fx, &[second.clone()]);
    members[0].in_progress_load = 5;

    let output = plan_json(fx.role.id, &[("a", &[]), ("b", &[]), ("c", &[])]);
    let outcome = distributor
        .apply(&epic, &fx.agent, &members, &output)
        .await
        .unwrap();
    assert!(matches!(outcome, DistributionOutcome::Distributed { .. }));

    let subtasks = task_db::list_subtasks(&fx.pool, epic.id).await.unwrap();
    assert!(
        subtasks
            .iter()
            .all(|t| t.assigned_agent_id == Some(second.id)),
        "all subtasks should land on the unloaded member"
    );

    fx.teardown().await;
}
