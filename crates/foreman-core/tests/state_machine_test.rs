//! Integration tests for the task state machine.
//!
//! Each test creates a unique temporary database, runs migrations, and
//! drops it on completion so tests are fully isolated and idempotent.

mod common;

use common::{status_of, Fixture};

use foreman_core::state::TaskStateMachine;
use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as task_db;

#[tokio::test]
async fn claim_sets_started_at() {
    let fx = Fixture::create().await;
    let task = fx.ready_task("claimable").await;
    assert!(task.started_at.is_none());

    TaskStateMachine::transition(&fx.pool, task.id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .expect("transition should succeed");

    let task = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert!(task.started_at.is_some());
    assert!(task.completed_at.is_none());

    fx.teardown().await;
}

#[tokio::test]
async fn terminal_transition_sets_completed_at() {
    let fx = Fixture::create().await;
    let task = fx.ready_task("finishing").await;

    TaskStateMachine::transition(&fx.pool, task.id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .unwrap();
    TaskStateMachine::transition(
        &fx.pool,
        task.id,
        TaskStatus::InProgress,
        TaskStatus::InReview,
    )
    .await
    .unwrap();
    TaskStateMachine::transition(
        &fx.pool,
        task.id,
        TaskStatus::InReview,
        TaskStatus::Completed,
    )
    .await
    .unwrap();

    let task = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.completed_at.is_some());

    fx.teardown().await;
}

#[tokio::test]
async fn invalid_edge_is_rejected_without_mutation() {
    let fx = Fixture::create().await;
    let task = fx.ready_task("stubborn").await;

    let result = TaskStateMachine::transition(
        &fx.pool,
        task.id,
        TaskStatus::Ready,
        TaskStatus::Completed,
    )
    .await;
    assert!(result.is_err());
    assert_eq!(status_of(&fx.pool, task.id).await, TaskStatus::Ready);

    fx.teardown().await;
}

#[tokio::test]
async fn optimistic_lock_failure_reports_actual_status() {
    let fx = Fixture::create().await;
    let task = fx.ready_task("contended").await;

    // Someone else already claimed it.
    TaskStateMachine::transition(&fx.pool, task.id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .unwrap();

    let err = TaskStateMachine::transition(
        &fx.pool,
        task.id,
        TaskStatus::Ready,
        TaskStatus::InProgress,
    )
    .await
    .unwrap_err();
    let message = format!("{err:#}");
    assert!(message.contains("optimistic lock failed"), "got: {message}");
    assert!(message.contains("in_progress"), "got: {message}");

    fx.teardown().await;
}

#[tokio::test]
async fn missing_task_is_reported() {
    let fx = Fixture::create().await;

    let err = TaskStateMachine::transition(
        &fx.pool,
        uuid::Uuid::new_v4(),
        TaskStatus::Ready,
        TaskStatus::InProgress,
    )
    .await
    .unwrap_err();
    assert!(format!("{err:#}").contains("not found"));

    fx.teardown().await;
}

#[tokio::test]
async fn ready_for_review_requires_completed_subtasks() {
    let fx = Fixture::create().await;
    let parent = fx.ready_task("parent").await;

    // No subtasks at all: refused.
    let err = TaskStateMachine::mark_ready_for_review(&fx.pool, parent.id)
        .await
        .unwrap_err();
    assert!(format!("{err:#}").contains("not all subtasks completed"));

    // One incomplete subtask: still refused.
    let mut sub = foreman_db::queries::tasks::NewTask::standard(fx.org.id, "child", fx.agent.id);
    sub.parent_task_id = Some(parent.id);
    sub.depth = 1;
    let child = fx.task(&sub).await;
    assert!(TaskStateMachine::mark_ready_for_review(&fx.pool, parent.id)
        .await
        .is_err());

    // Complete the child through the lattice, then the parent flips.
    TaskStateMachine::transition(&fx.pool, child.id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .unwrap();
    TaskStateMachine::transition(
        &fx.pool,
        child.id,
        TaskStatus::InProgress,
        TaskStatus::InReview,
    )
    .await
    .unwrap();
    TaskStateMachine::transition(
        &fx.pool,
        child.id,
        TaskStatus::InReview,
        TaskStatus::Completed,
    )
    .await
    .unwrap();

    TaskStateMachine::mark_ready_for_review(&fx.pool, parent.id)
        .await
        .expect("parent should flip once all subtasks completed");
    assert_eq!(status_of(&fx.pool, parent.id).await, TaskStatus::ReadyForReview);

    fx.teardown().await;
}

#[tokio::test]
async fn retry_bumps_counter_under_cas() {
    let fx = Fixture::create().await;
    let task = fx.ready_task("retryable").await;

    TaskStateMachine::transition(&fx.pool, task.id, TaskStatus::Ready, TaskStatus::InProgress)
        .await
        .unwrap();

    let rows = task_db::retry_task(&fx.pool, task.id, 0, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 1);

    let task = task_db::get_task(&fx.pool, task.id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Ready);
    assert_eq!(task.retry_count, 1);
    assert!(task.next_attempt_at.is_some());

    // A stale retry (wrong expected counter) is a no-op.
    let rows = task_db::retry_task(&fx.pool, task.id, 0, chrono::Utc::now())
        .await
        .unwrap();
    assert_eq!(rows, 0);

    fx.teardown().await;
}
