//! The shared task pool: ranked pull with atomic claim.
//!
//! Pull classes are evaluated in priority order (review-due, direct,
//! file-affinity, team-unassigned, role-match); within a class candidates
//! order by `priority, created_at`. Every candidate has already passed the
//! file-conflict filter in SQL. Claims are compare-and-set on the status
//! that made the task eligible, so a race between concurrent agents
//! produces exactly one winner; losers retry the pull a bounded number of
//! times.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use foreman_db::models::{Agent, Task, TaskStatus};
use foreman_db::queries::tasks as task_db;

use crate::config::PoolConfig;

/// Which pull class produced a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullClass {
    /// A parent awaiting this agent's review. Not claimed; the cycle
    /// routes it to the reviewer.
    ReviewDue,
    Direct,
    FileAffinity,
    TeamUnassigned,
    RoleMatch,
}

/// A task handed to an agent by the pool.
#[derive(Debug, Clone)]
pub struct PulledTask {
    pub task: Task,
    pub class: PullClass,
}

/// The pull/claim/release surface over the tasks table.
#[derive(Debug, Clone)]
pub struct TaskPool {
    pool: PgPool,
    config: PoolConfig,
}

impl TaskPool {
    pub fn new(pool: PgPool, config: PoolConfig) -> Self {
        Self { pool, config }
    }

    /// Pull the next task for an agent.
    ///
    /// Returns `None` when no eligible task exists; no state is mutated in
    /// that case. For executable classes the returned task has been
    /// atomically claimed (`in_progress`, agent-assigned, `started_at`
    /// stamped). Review-due parents are returned unclaimed.
    pub async fn pull_next_task(
        &self,
        agent: &Agent,
        capabilities: &[String],
    ) -> Result<Option<PulledTask>> {
        // Class 0: a review owed by this agent takes precedence over new
        // work and is never claimed into in_progress.
        if let Some(task) = task_db::next_review_due(&self.pool, agent.id).await? {
            return Ok(Some(PulledTask {
                task,
                class: PullClass::ReviewDue,
            }));
        }

        for attempt in 0..self.config.claim_max_attempts {
            let Some((candidate, class)) = self.next_candidate(agent, capabilities).await? else {
                return Ok(None);
            };

            let expected = candidate.status;
            let rows =
                task_db::claim_task(&self.pool, candidate.id, agent.id, expected).await?;
            if rows == 1 {
                let task = task_db::get_task(&self.pool, candidate.id)
                    .await?
                    .expect("claimed task must exist");
                return Ok(Some(PulledTask { task, class }));
            }

            // Lost the race; back off briefly and re-evaluate the classes.
            debug!(
                agent = %agent.name,
                task_id = %candidate.id,
                attempt,
                "claim lost race, retrying pull"
            );
            let jitter_ms = rand::rng().random_range(10..50);
            tokio::time::sleep(Duration::from_millis(jitter_ms)).await;
        }

        Ok(None)
    }

    /// Evaluate the executable pull classes in order and return the first
    /// candidate.
    async fn next_candidate(
        &self,
        agent: &Agent,
        capabilities: &[String],
    ) -> Result<Option<(Task, PullClass)>> {
        if let Some(task) = task_db::next_direct(&self.pool, agent.id).await? {
            return Ok(Some((task, PullClass::Direct)));
        }

        if let Some(task) = task_db::next_file_affinity(
            &self.pool,
            agent.id,
            agent.organization_id,
            self.config.file_affinity_window_hours,
        )
        .await?
        {
            return Ok(Some((task, PullClass::FileAffinity)));
        }

        if let Some(team_id) = agent.team_id {
            if let Some(task) = task_db::next_team_unassigned(&self.pool, team_id).await? {
                return Ok(Some((task, PullClass::TeamUnassigned)));
            }
        }

        if !capabilities.is_empty() {
            if let Some(task) =
                task_db::next_role_match(&self.pool, agent.organization_id, capabilities).await?
            {
                return Ok(Some((task, PullClass::RoleMatch)));
            }
        }

        Ok(None)
    }

    /// Release a claimed task back to `pending` (retryable failure).
    ///
    /// The task falls back to the agent's team so the assignment XOR
    /// holds.
    pub async fn release(&self, task_id: Uuid, agent: &Agent) -> Result<()> {
        task_db::release_task(&self.pool, task_id, agent.team_id).await?;
        Ok(())
    }

    /// Whether a status is one the pool may claim from.
    pub fn is_claimable(status: TaskStatus) -> bool {
        matches!(status, TaskStatus::Ready | TaskStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claimable_statuses() {
        assert!(TaskPool::is_claimable(TaskStatus::Ready));
        assert!(TaskPool::is_claimable(TaskStatus::Pending));
        assert!(!TaskPool::is_claimable(TaskStatus::InProgress));
        assert!(!TaskPool::is_claimable(TaskStatus::ReadyForReview));
        assert!(!TaskPool::is_claimable(TaskStatus::Completed));
    }
}
