//! Schema tests: migrations apply cleanly and the CHECK constraints
//! enforce the entity invariants.

use foreman_db::models::{AgentLifecycle, TaskPriority, TaskStatus, TaskType};
use foreman_db::queries::agents::{self, NewAgent};
use foreman_db::queries::organizations as orgs;
use foreman_db::queries::roles;
use foreman_db::queries::tasks::{self, NewTask};
use foreman_db::queries::teams;

#[tokio::test]
async fn migrations_apply_and_tables_exist() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;

    let tables: Vec<(String,)> = sqlx::query_as(
        "SELECT tablename::text FROM pg_tables WHERE schemaname = 'public' ORDER BY tablename",
    )
    .fetch_all(&pool)
    .await
    .unwrap();
    let names: Vec<&str> = tables.iter().map(|(n,)| n.as_str()).collect();

    for expected in [
        "organizations",
        "teams",
        "roles",
        "agents",
        "projects",
        "goals",
        "tasks",
        "task_pull_requests",
        "approval_requests",
        "documents",
        "task_events",
    ] {
        assert!(names.contains(&expected), "missing table {expected}");
    }

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_assignment_xor_is_enforced() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;
    let org = orgs::insert_organization(&pool, "o", "").await.unwrap();
    let team = teams::insert_team(&pool, org.id, "t", "", None).await.unwrap();
    let role = roles::insert_role(&pool, org.id, "r", &[], false, "").await.unwrap();
    let agent = agents::insert_agent(&pool, &NewAgent::permanent(org.id, team.id, role.id, "a"))
        .await
        .unwrap();

    // Neither assignee: rejected.
    let mut both_null = NewTask::standard(org.id, "orphan", agent.id);
    both_null.assigned_agent_id = None;
    assert!(tasks::insert_task(&pool, &both_null).await.is_err());

    // Both assignees: rejected.
    let mut both_set = NewTask::standard(org.id, "greedy", agent.id);
    both_set.assigned_team_id = Some(team.id);
    assert!(tasks::insert_task(&pool, &both_set).await.is_err());

    // Exactly one: accepted, either way round.
    assert!(tasks::insert_task(&pool, &NewTask::standard(org.id, "agent-owned", agent.id))
        .await
        .is_ok());
    let mut team_owned = NewTask::standard(org.id, "team-owned", agent.id);
    team_owned.assigned_agent_id = None;
    team_owned.assigned_team_id = Some(team.id);
    assert!(tasks::insert_task(&pool, &team_owned).await.is_ok());

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn task_depth_and_parent_are_coupled() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;
    let org = orgs::insert_organization(&pool, "o", "").await.unwrap();
    let team = teams::insert_team(&pool, org.id, "t", "", None).await.unwrap();
    let role = roles::insert_role(&pool, org.id, "r", &[], false, "").await.unwrap();
    let agent = agents::insert_agent(&pool, &NewAgent::permanent(org.id, team.id, role.id, "a"))
        .await
        .unwrap();

    let root = tasks::insert_task(&pool, &NewTask::standard(org.id, "root", agent.id))
        .await
        .unwrap();

    // Depth 1 without a parent: rejected.
    let mut no_parent = NewTask::standard(org.id, "floating", agent.id);
    no_parent.depth = 1;
    assert!(tasks::insert_task(&pool, &no_parent).await.is_err());

    // Parent at depth 0: rejected.
    let mut depth_zero_child = NewTask::standard(org.id, "grounded", agent.id);
    depth_zero_child.parent_task_id = Some(root.id);
    assert!(tasks::insert_task(&pool, &depth_zero_child).await.is_err());

    // Proper subtask: accepted. Depth beyond 3: rejected.
    let mut child = NewTask::standard(org.id, "child", agent.id);
    child.parent_task_id = Some(root.id);
    child.depth = 1;
    let child = tasks::insert_task(&pool, &child).await.unwrap();

    let mut too_deep = NewTask::standard(org.id, "abyss", agent.id);
    too_deep.parent_task_id = Some(child.id);
    too_deep.depth = 4;
    assert!(tasks::insert_task(&pool, &too_deep).await.is_err());

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn team_epics_must_be_team_assigned_roots() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;
    let org = orgs::insert_organization(&pool, "o", "").await.unwrap();
    let team = teams::insert_team(&pool, org.id, "t", "", None).await.unwrap();
    let role = roles::insert_role(&pool, org.id, "r", &[], false, "").await.unwrap();
    let agent = agents::insert_agent(&pool, &NewAgent::permanent(org.id, team.id, role.id, "a"))
        .await
        .unwrap();

    // Agent-assigned epic: rejected.
    let mut agent_epic = NewTask::standard(org.id, "bad epic", agent.id);
    agent_epic.task_type = TaskType::TeamEpic;
    assert!(tasks::insert_task(&pool, &agent_epic).await.is_err());

    // Team-assigned root epic: accepted.
    let mut epic = NewTask::standard(org.id, "good epic", agent.id);
    epic.task_type = TaskType::TeamEpic;
    epic.status = TaskStatus::Pending;
    epic.priority = TaskPriority::P2;
    epic.assigned_agent_id = None;
    epic.assigned_team_id = Some(team.id);
    assert!(tasks::insert_task(&pool, &epic).await.is_ok());

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn temporary_agents_need_depth_and_creator() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;
    let org = orgs::insert_organization(&pool, "o", "").await.unwrap();
    let team = teams::insert_team(&pool, org.id, "t", "", None).await.unwrap();
    let role = roles::insert_role(&pool, org.id, "r", &[], true, "").await.unwrap();
    let creator = agents::insert_agent(&pool, &NewAgent::permanent(org.id, team.id, role.id, "a"))
        .await
        .unwrap();

    // Temporary without creator: rejected.
    let mut lonely = NewAgent::permanent(org.id, team.id, role.id, "temp-1");
    lonely.lifecycle = AgentLifecycle::Temporary;
    lonely.depth = 1;
    assert!(agents::insert_agent(&pool, &lonely).await.is_err());

    // Temporary at depth 0: rejected.
    let mut shallow = NewAgent::permanent(org.id, team.id, role.id, "temp-2");
    shallow.lifecycle = AgentLifecycle::Temporary;
    shallow.created_by_agent_id = Some(creator.id);
    assert!(agents::insert_agent(&pool, &shallow).await.is_err());

    // Depth 1 with a creator: accepted. Depth 2 is out of range entirely.
    let mut proper = NewAgent::permanent(org.id, team.id, role.id, "temp-3");
    proper.lifecycle = AgentLifecycle::Temporary;
    proper.depth = 1;
    proper.created_by_agent_id = Some(creator.id);
    assert!(agents::insert_agent(&pool, &proper).await.is_ok());

    let mut too_deep = NewAgent::permanent(org.id, team.id, role.id, "temp-4");
    too_deep.lifecycle = AgentLifecycle::Temporary;
    too_deep.depth = 2;
    too_deep.created_by_agent_id = Some(creator.id);
    assert!(agents::insert_agent(&pool, &too_deep).await.is_err());

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}

#[tokio::test]
async fn cascade_delete_reaches_subtasks_and_events() {
    let (pool, db_name) = foreman_test_utils::create_test_db().await;
    let org = orgs::insert_organization(&pool, "o", "").await.unwrap();
    let team = teams::insert_team(&pool, org.id, "t", "", None).await.unwrap();
    let role = roles::insert_role(&pool, org.id, "r", &[], false, "").await.unwrap();
    let agent = agents::insert_agent(&pool, &NewAgent::permanent(org.id, team.id, role.id, "a"))
        .await
        .unwrap();

    let root = tasks::insert_task(&pool, &NewTask::standard(org.id, "root", agent.id))
        .await
        .unwrap();
    let mut sub = NewTask::standard(org.id, "sub", agent.id);
    sub.parent_task_id = Some(root.id);
    sub.depth = 1;
    let sub = tasks::insert_task(&pool, &sub).await.unwrap();

    sqlx::query("DELETE FROM tasks WHERE id = $1")
        .bind(root.id)
        .execute(&pool)
        .await
        .unwrap();

    assert!(tasks::get_task(&pool, sub.id).await.unwrap().is_none());

    pool.close().await;
    foreman_test_utils::drop_test_db(&db_name).await;
}
