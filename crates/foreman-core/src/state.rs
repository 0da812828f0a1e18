//! Task state machine transitions.
//!
//! Validates and executes state transitions for tasks, enforcing the
//! allowed transition graph, optimistic locking, and timestamp management.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::TaskStatus;
use foreman_db::queries::tasks as db;

/// The task state machine.
///
/// Enforces the valid transition graph:
///
/// ```text
/// pending          -> ready                      (blocked_by drained)
/// pending          -> in_progress                (direct claim)
/// ready            -> in_progress                (claim)
/// in_progress      -> in_review                  (pull request opened)
/// in_progress      -> blocked | failed | cancelled
/// in_progress      -> pending                    (release / emergency stop)
/// in_progress      -> ready_for_review           (all subtasks completed)
/// pending          -> ready_for_review           (parent after rework round)
/// in_review        -> ready_for_review           (parent with merged PR)
/// in_review        -> completed                  (merge / parent decision)
/// in_review        -> pending | cancelled        (parent decision)
/// ready_for_review -> in_review                  (parent review begins)
/// blocked          -> ready                      (escalation resolved)
/// blocked          -> cancelled                  (approval rejected)
/// failed           -> ready                      (retry after backoff)
/// ```
pub struct TaskStateMachine;

impl TaskStateMachine {
    /// Check whether a transition from `from` to `to` is a valid edge in
    /// the state graph.
    pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, Ready)
                | (Pending, InProgress)
                | (Pending, ReadyForReview)
                | (Ready, InProgress)
                | (InProgress, InReview)
                | (InProgress, Blocked)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (InProgress, Pending)
                | (InProgress, ReadyForReview)
                | (InReview, ReadyForReview)
                | (InReview, Completed)
                | (InReview, Pending)
                | (InReview, Cancelled)
                | (ReadyForReview, InReview)
                | (Blocked, Ready)
                | (Blocked, Cancelled)
                | (Failed, Ready)
        )
    }

    /// Execute a state transition with optimistic locking.
    ///
    /// - Validates the transition is legal.
    /// - Sets `started_at` when entering `in_progress`.
    /// - Sets `completed_at` when entering a terminal state.
    ///
    /// Returns an error if the transition is invalid, the task does not
    /// exist, or the current status in the database does not match `from`
    /// (optimistic lock failure).
    pub async fn transition(
        pool: &PgPool,
        task_id: Uuid,
        from: TaskStatus,
        to: TaskStatus,
    ) -> Result<()> {
        if !Self::is_valid_transition(from, to) {
            bail!(
                "invalid state transition: {} -> {} for task {}",
                from,
                to,
                task_id
            );
        }

        let started_at = if to == TaskStatus::InProgress {
            Some(Utc::now())
        } else {
            None
        };

        let completed_at = if to.is_terminal() {
            Some(Utc::now())
        } else {
            None
        };

        let rows = db::transition_task_status(pool, task_id, from, to, started_at, completed_at)
            .await
            .with_context(|| {
                format!(
                    "failed to transition task {} from {} to {}",
                    task_id, from, to
                )
            })?;

        if rows == 0 {
            let task = db::get_task(pool, task_id).await?;
            match task {
                None => bail!("task {} not found", task_id),
                Some(t) => bail!(
                    "optimistic lock failed: task {} has status {}, expected {}",
                    task_id,
                    t.status,
                    from
                ),
            }
        }

        Ok(())
    }

    /// Mark a parent `ready_for_review` from whatever non-terminal state it
    /// is currently in.
    ///
    /// Validates that the parent has at least one subtask and that all of
    /// them are `completed` before transitioning.
    pub async fn mark_ready_for_review(pool: &PgPool, parent_task_id: Uuid) -> Result<()> {
        if !db::all_subtasks_completed(pool, parent_task_id).await? {
            bail!(
                "task {} cannot enter ready_for_review: not all subtasks completed",
                parent_task_id
            );
        }

        let parent = db::get_task(pool, parent_task_id)
            .await?
            .with_context(|| format!("task {} not found", parent_task_id))?;

        Self::transition(pool, parent_task_id, parent.status, TaskStatus::ReadyForReview).await
    }
}
