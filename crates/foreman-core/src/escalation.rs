//! Five-level escalation ladder.
//!
//! Each level either resolves the failure or promotes to the next:
//!
//! 1. Self-resolve: reset to `ready` with a bumped retry counter and an
//!    exponential-backoff next attempt.
//! 2. Team collaboration: clear the assignment, hand the task back to the
//!    team; requires at least one other available teammate.
//! 3. Team leader: mark `in_review` with an annotation requesting the
//!    leader's decision.
//! 4. Organization: mark `blocked` and broadcast on the org channel.
//! 5. Human approval: open an `ApprovalRequest` and block the task.
//!
//! Levels 3 and 4 are time-bounded; the scheduler's sweep promotes tasks
//! that sit there past the configured window.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{Agent, ApprovalKind, Task, TaskPriority, TaskStatus};
use foreman_db::queries::approvals::{self, NewApprovalRequest};
use foreman_db::queries::task_events::{self, NewTaskEvent};
use foreman_db::queries::tasks as task_db;
use foreman_db::queries::teams as team_db;

use crate::bus::{Message, MessageBus};

/// A rung on the escalation ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EscalationLevel {
    SelfResolve = 1,
    TeamCollaboration = 2,
    TeamLeader = 3,
    Organization = 4,
    HumanApproval = 5,
}

impl EscalationLevel {
    pub fn next(self) -> Option<Self> {
        match self {
            Self::SelfResolve => Some(Self::TeamCollaboration),
            Self::TeamCollaboration => Some(Self::TeamLeader),
            Self::TeamLeader => Some(Self::Organization),
            Self::Organization => Some(Self::HumanApproval),
            Self::HumanApproval => None,
        }
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    pub fn from_i32(level: i32) -> Option<Self> {
        match level {
            1 => Some(Self::SelfResolve),
            2 => Some(Self::TeamCollaboration),
            3 => Some(Self::TeamLeader),
            4 => Some(Self::Organization),
            5 => Some(Self::HumanApproval),
            _ => None,
        }
    }
}

/// Exponential backoff before a retried attempt: `min(60, 2^n)` minutes.
pub fn backoff(retry_count: i32) -> Duration {
    let minutes = 2i64
        .checked_pow(retry_count.max(0) as u32)
        .unwrap_or(i64::MAX)
        .min(60);
    Duration::minutes(minutes)
}

/// Choose the starting level from a task's state.
///
/// A missing task is an invariant violation and goes straight to human
/// approval; P1 criticality skips the local rungs.
pub fn determine_start_level(task: Option<&Task>) -> EscalationLevel {
    match task {
        None => EscalationLevel::HumanApproval,
        Some(task) if task.priority == TaskPriority::P1 => EscalationLevel::Organization,
        Some(_) => EscalationLevel::SelfResolve,
    }
}

/// Runs the ladder for failed tasks.
#[derive(Clone)]
pub struct Escalator {
    pool: PgPool,
    bus: MessageBus,
    max_retry: i32,
}

impl Escalator {
    pub fn new(pool: PgPool, bus: MessageBus, max_retry: i32) -> Self {
        Self {
            pool,
            bus,
            max_retry,
        }
    }

    /// Escalate a task starting from the determined level, walking upward
    /// until a level resolves. Returns the level that handled it.
    pub async fn escalate(
        &self,
        task_id: Uuid,
        agent: Option<&Agent>,
        reason: &str,
    ) -> Result<EscalationLevel> {
        self.escalate_from(task_id, agent, reason, EscalationLevel::SelfResolve)
            .await
    }

    /// Escalate with a floor on the starting level (e.g. quality-gate
    /// exhaustion starts at level 2). The determiner can still raise the
    /// start above the floor, never below it.
    pub async fn escalate_from(
        &self,
        task_id: Uuid,
        agent: Option<&Agent>,
        reason: &str,
        floor: EscalationLevel,
    ) -> Result<EscalationLevel> {
        let task = task_db::get_task(&self.pool, task_id).await?;
        let mut level = determine_start_level(task.as_ref()).max(floor);

        loop {
            let resolved = match level {
                EscalationLevel::SelfResolve => self.self_resolve(task.as_ref()).await?,
                EscalationLevel::TeamCollaboration => self.team_collaboration(task.as_ref(), agent).await?,
                EscalationLevel::TeamLeader => self.team_leader(task_id, reason).await?,
                EscalationLevel::Organization => self.organization(task.as_ref(), reason).await?,
                EscalationLevel::HumanApproval => {
                    self.human_approval(task.as_ref(), task_id, agent, reason).await?;
                    true
                }
            };

            self.record(task_id, agent, level, resolved, reason).await;

            if resolved {
                info!(task_id = %task_id, level = level.as_i32(), "escalation resolved");
                return Ok(level);
            }

            match level.next() {
                Some(next) => {
                    info!(
                        task_id = %task_id,
                        from = level.as_i32(),
                        to = next.as_i32(),
                        "escalation promoted"
                    );
                    level = next;
                }
                None => return Ok(level),
            }
        }
    }

    /// Promote tasks stalled at level 3 or 4 past the timeout window.
    pub async fn promote_stalled(&self, level_timeout: Duration) -> Result<usize> {
        let cutoff = Utc::now() - level_timeout;
        let latest = task_events::latest_escalations(&self.pool).await?;

        let mut promoted = 0;
        for (task_id, level, recorded_at) in latest {
            if recorded_at >= cutoff {
                continue;
            }
            let stalled_at = match EscalationLevel::from_i32(level) {
                Some(l @ (EscalationLevel::TeamLeader | EscalationLevel::Organization)) => l,
                _ => continue,
            };
            // Only promote tasks still sitting where the ladder left them.
            let Some(task) = task_db::get_task(&self.pool, task_id).await? else {
                continue;
            };
            let still_stalled = matches!(
                (stalled_at, task.status),
                (EscalationLevel::TeamLeader, TaskStatus::InReview)
                    | (EscalationLevel::Organization, TaskStatus::Blocked)
            ) && !task.requires_human_approval;
            if !still_stalled {
                continue;
            }

            warn!(
                task_id = %task_id,
                level = stalled_at.as_i32(),
                "escalation stalled past timeout, promoting"
            );

            let next = stalled_at.next().expect("levels 3 and 4 have successors");
            let resolved = match next {
                EscalationLevel::Organization => {
                    self.organization(Some(&task), "level timeout").await?
                }
                EscalationLevel::HumanApproval => {
                    self.human_approval(Some(&task), task_id, None, "level timeout")
                        .await?;
                    true
                }
                _ => unreachable!(),
            };
            self.record(task_id, None, next, resolved, "level timeout").await;
            if !resolved {
                self.human_approval(Some(&task), task_id, None, "level timeout")
                    .await?;
                self.record(task_id, None, EscalationLevel::HumanApproval, true, "level timeout")
                    .await;
            }
            promoted += 1;
        }

        Ok(promoted)
    }

    /// Level 1: retry in place when budget remains.
    async fn self_resolve(&self, task: Option<&Task>) -> Result<bool> {
        let Some(task) = task else { return Ok(false) };
        if task.retry_count >= self.max_retry {
            return Ok(false);
        }

        let next_attempt = Utc::now() + backoff(task.retry_count);
        let rows =
            task_db::retry_task(&self.pool, task.id, task.retry_count, next_attempt).await?;
        Ok(rows == 1)
    }

    /// Level 2: clear the assignment and hand back to the team, provided a
    /// teammate is available to pick it up.
    async fn team_collaboration(
        &self,
        task: Option<&Task>,
        agent: Option<&Agent>,
    ) -> Result<bool> {
        let Some(task) = task else { return Ok(false) };
        let Some(agent) = agent else { return Ok(false) };
        let Some(team_id) = agent.team_id else {
            return Ok(false);
        };

        let teammates =
            team_db::count_available_teammates(&self.pool, team_id, agent.id).await?;
        if teammates == 0 {
            return Ok(false);
        }

        let annotation = format!("reassign-from {}", agent.name);
        let rows = task_db::reassign_to_team(&self.pool, task.id, team_id, &annotation).await?;
        Ok(rows == 1)
    }

    /// Level 3: request the team leader's decision.
    async fn team_leader(&self, task_id: Uuid, reason: &str) -> Result<bool> {
        let annotation = format!("Leader decision requested: {reason}");
        let rows = task_db::set_status_with_annotation(
            &self.pool,
            task_id,
            TaskStatus::InReview,
            &annotation,
        )
        .await?;
        Ok(rows == 1)
    }

    /// Level 4: block the task and broadcast to the organization channel.
    async fn organization(&self, task: Option<&Task>, reason: &str) -> Result<bool> {
        let Some(task) = task else { return Ok(false) };

        let message = format!("Escalation on {:?}: {reason}", task.title);
        task_db::block_task(&self.pool, task.id, &message).await?;
        self.bus.send(Message::OrgBroadcast {
            organization_id: task.organization_id,
            task_id: task.id,
            text: message,
        });
        Ok(true)
    }

    /// Level 5: surface to humans.
    async fn human_approval(
        &self,
        task: Option<&Task>,
        task_id: Uuid,
        agent: Option<&Agent>,
        reason: &str,
    ) -> Result<()> {
        let Some(task) = task else {
            // The task vanished; there is nothing to annotate, but the
            // disappearance itself is worth a log line.
            warn!(task_id = %task_id, "escalating a missing task");
            return Ok(());
        };

        task_db::require_human_approval(&self.pool, task.id, reason).await?;

        approvals::insert_approval_request(
            &self.pool,
            &NewApprovalRequest {
                organization_id: task.organization_id,
                task_id: task.id,
                agent_id: agent.map(|a| a.id),
                kind: ApprovalKind::Escalation,
                reason: reason.to_owned(),
                metadata: serde_json::json!({ "retry_count": task.retry_count }),
            },
        )
        .await
        .context("failed to open approval request")?;

        Ok(())
    }

    /// Best-effort audit record.
    async fn record(
        &self,
        task_id: Uuid,
        agent: Option<&Agent>,
        level: EscalationLevel,
        resolved: bool,
        reason: &str,
    ) {
        let event = NewTaskEvent {
            task_id,
            agent_id: agent.map(|a| a.id),
            kind: "escalated".to_owned(),
            payload: serde_json::json!({
                "level": level.as_i32(),
                "resolved": resolved,
                "reason": reason,
            }),
        };
        if let Err(e) = task_events::insert_task_event(&self.pool, &event).await {
            warn!(task_id = %task_id, error = %e, "failed to record escalation event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_db::models::{TaskStatus, TaskType};

    fn make_task(priority: TaskPriority) -> Task {
        Task {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            project_id: None,
            title: "t".to_owned(),
            description: String::new(),
            task_type: TaskType::Standard,
            status: TaskStatus::Failed,
            priority,
            depth: 0,
            affected_files: vec![],
            required_skills: vec![],
            tags: vec![],
            assigned_agent_id: Some(Uuid::new_v4()),
            assigned_team_id: None,
            parent_task_id: None,
            retry_count: 0,
            review_count: 0,
            requires_human_approval: false,
            blocked_by: vec![],
            next_attempt_at: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    #[test]
    fn backoff_doubles_then_caps() {
        assert_eq!(backoff(0), Duration::minutes(1));
        assert_eq!(backoff(1), Duration::minutes(2));
        assert_eq!(backoff(3), Duration::minutes(8));
        assert_eq!(backoff(6), Duration::minutes(60));
        assert_eq!(backoff(30), Duration::minutes(60));
    }

    #[test]
    fn start_level_default_is_self_resolve() {
        let task = make_task(TaskPriority::P3);
        assert_eq!(
            determine_start_level(Some(&task)),
            EscalationLevel::SelfResolve
        );
    }

    #[test]
    fn start_level_p1_skips_to_organization() {
        let task = make_task(TaskPriority::P1);
        assert_eq!(
            determine_start_level(Some(&task)),
            EscalationLevel::Organization
        );
    }

    #[test]
    fn start_level_missing_task_is_human() {
        assert_eq!(determine_start_level(None), EscalationLevel::HumanApproval);
    }

    #[test]
    fn ladder_order() {
        let mut level = EscalationLevel::SelfResolve;
        let mut seen = vec![level];
        while let Some(next) = level.next() {
            seen.push(next);
            level = next;
        }
        assert_eq!(
            seen,
            vec![
                EscalationLevel::SelfResolve,
                EscalationLevel::TeamCollaboration,
                EscalationLevel::TeamLeader,
                EscalationLevel::Organization,
                EscalationLevel::HumanApproval,
            ]
        );
        assert_eq!(EscalationLevel::from_i32(4), Some(EscalationLevel::Organization));
        assert_eq!(EscalationLevel::from_i32(9), None);
    }
}
