//! Parent review of completed subtasks.
//!
//! When every subtask of a parent completes, the parent's agent re-reads
//! the children through the review-mode prompt and returns a JSON decision:
//! complete, rework, add_tasks, or redirect. The decision is applied here.
//! A parent that cycles through reviews more than the configured budget is
//! force-escalated as a quality problem instead of looping forever.

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{
    Agent, AgentLifecycle, ApprovalKind, Task, TaskStatus, TaskType,
};
use foreman_db::queries::agents as agent_db;
use foreman_db::queries::approvals::{self, NewApprovalRequest};
use foreman_db::queries::tasks::{self as task_db, NewTask};

use crate::response::extract_json_object;
use crate::state::TaskStateMachine;

/// Errors that prevent a review decision from being applied.
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error("review output is not a JSON decision object")]
    Unparseable,

    #[error("unknown review action {0:?}")]
    UnknownAction(String),

    #[error("decision targets unknown subtask {0}")]
    UnknownTarget(Uuid),

    #[error("decision target {0:?} is not a task id")]
    MalformedTarget(String),
}

/// The reviewer's verdict on a parent's subtasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewAction {
    Complete,
    Rework,
    AddTasks,
    Redirect,
}

impl ReviewAction {
    fn parse(s: &str) -> Result<Self, ReviewError> {
        match s {
            "complete" => Ok(Self::Complete),
            "rework" => Ok(Self::Rework),
            "add_tasks" => Ok(Self::AddTasks),
            "redirect" => Ok(Self::Redirect),
            other => Err(ReviewError::UnknownAction(other.to_owned())),
        }
    }
}

/// A replacement or additional subtask named by the decision.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewSubtaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

/// The raw decision JSON.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    action: String,
    #[serde(default)]
    reasoning: Option<String>,
    #[serde(default)]
    targets: Vec<String>,
    #[serde(default)]
    new_tasks: Vec<NewSubtaskSpec>,
}

/// A validated review decision.
#[derive(Debug, Clone)]
pub struct ReviewDecision {
    pub action: ReviewAction,
    pub reasoning: String,
    pub targets: Vec<Uuid>,
    pub new_tasks: Vec<NewSubtaskSpec>,
}

/// Parse and validate the provider's review output.
///
/// `known_children` are the parent's subtask ids; any target outside them
/// rejects the decision.
pub fn parse_review_decision(
    text: &str,
    known_children: &[Uuid],
) -> Result<ReviewDecision, ReviewError> {
    let value = extract_json_object(text).ok_or(ReviewError::Unparseable)?;
    let raw: RawDecision =
        serde_json::from_value(value).map_err(|_| ReviewError::Unparseable)?;

    let action = ReviewAction::parse(&raw.action)?;

    let mut targets = Vec::with_capacity(raw.targets.len());
    for t in &raw.targets {
        let id = t
            .parse::<Uuid>()
            .map_err(|_| ReviewError::MalformedTarget(t.clone()))?;
        if !known_children.contains(&id) {
            return Err(ReviewError::UnknownTarget(id));
        }
        targets.push(id);
    }

    Ok(ReviewDecision {
        action,
        reasoning: raw.reasoning.unwrap_or_default(),
        targets,
        new_tasks: raw.new_tasks,
    })
}

/// Outcome of applying one review.
#[derive(Debug)]
pub enum ReviewOutcome {
    /// Parent completed; temporary helpers soft-deleted.
    Completed,
    /// Targets reset to `ready` with guidance; parent back to `pending`.
    Reworked { targets: Vec<Uuid> },
    /// New subtasks created; parent back to `pending`.
    TasksAdded { created: Vec<Uuid> },
    /// Targets cancelled, replacements created; parent back to `pending`.
    Redirected { cancelled: Vec<Uuid>, created: Vec<Uuid> },
    /// Review budget exhausted or the decision was unusable.
    Escalated { reason: String },
}

/// Applies review decisions for ready-for-review parents.
#[derive(Debug, Clone)]
pub struct Reviewer {
    pool: PgPool,
    max_review_count: i32,
}

impl Reviewer {
    pub fn new(pool: PgPool, max_review_count: i32) -> Self {
        Self {
            pool,
            max_review_count,
        }
    }

    /// Apply the provider's review output for a parent currently in
    /// `in_review`.
    pub async fn apply(
        &self,
        parent: &Task,
        reviewer_agent: &Agent,
        provider_output: &str,
    ) -> Result<ReviewOutcome> {
        let review_count = task_db::increment_review_count(&self.pool, parent.id).await?;
        if review_count > self.max_review_count {
            let reason = format!(
                "review budget exhausted ({review_count} > {})",
                self.max_review_count
            );
            self.force_quality_escalation(parent, reviewer_agent, &reason)
                .await?;
            return Ok(ReviewOutcome::Escalated { reason });
        }

        let children = task_db::list_subtasks(&self.pool, parent.id).await?;
        let child_ids: Vec<Uuid> = children.iter().map(|c| c.id).collect();

        let decision = match parse_review_decision(provider_output, &child_ids) {
            Ok(decision) => decision,
            Err(error) => {
                let reason = error.to_string();
                self.force_quality_escalation(parent, reviewer_agent, &reason)
                    .await?;
                return Ok(ReviewOutcome::Escalated { reason });
            }
        };

        info!(
            parent_id = %parent.id,
            action = ?decision.action,
            reasoning = %decision.reasoning,
            "applying review decision"
        );

        match decision.action {
            ReviewAction::Complete => {
                TaskStateMachine::transition(
                    &self.pool,
                    parent.id,
                    TaskStatus::InReview,
                    TaskStatus::Completed,
                )
                .await?;
                self.release_temporary_helpers(&children).await?;
                Ok(ReviewOutcome::Completed)
            }
            ReviewAction::Rework => {
                for target in &decision.targets {
                    task_db::rework_task(&self.pool, *target, &decision.reasoning).await?;
                }
                TaskStateMachine::transition(
                    &self.pool,
                    parent.id,
                    TaskStatus::InReview,
                    TaskStatus::Pending,
                )
                .await?;
                Ok(ReviewOutcome::Reworked {
                    targets: decision.targets,
                })
            }
            ReviewAction::AddTasks => {
                let created = self
                    .create_subtasks(parent, reviewer_agent, &decision.new_tasks)
                    .await?;
                TaskStateMachine::transition(
                    &self.pool,
                    parent.id,
                    TaskStatus::InReview,
                    TaskStatus::Pending,
                )
                .await?;
                Ok(ReviewOutcome::TasksAdded { created })
            }
            ReviewAction::Redirect => {
                for target in &decision.targets {
                    task_db::cancel_task(&self.pool, *target).await?;
                }
                let created = self
                    .create_subtasks(parent, reviewer_agent, &decision.new_tasks)
                    .await?;
                TaskStateMachine::transition(
                    &self.pool,
                    parent.id,
                    TaskStatus::InReview,
                    TaskStatus::Pending,
                )
                .await?;
                Ok(ReviewOutcome::Redirected {
                    cancelled: decision.targets,
                    created,
                })
            }
        }
    }

    async fn create_subtasks(
        &self,
        parent: &Task,
        reviewer_agent: &Agent,
        specs: &[NewSubtaskSpec],
    ) -> Result<Vec<Uuid>> {
        let mut created = Vec::with_capacity(specs.len());
        for spec in specs {
            let new = NewTask {
                organization_id: parent.organization_id,
                project_id: parent.project_id,
                title: spec.title.clone(),
                description: spec.description.clone(),
                task_type: TaskType::Standard,
                priority: parent.priority,
                depth: parent.depth + 1,
                affected_files: spec.affected_files.clone(),
                required_skills: Vec::new(),
                tags: Vec::new(),
                assigned_agent_id: Some(reviewer_agent.id),
                assigned_team_id: None,
                parent_task_id: Some(parent.id),
                blocked_by: Vec::new(),
                status: TaskStatus::Ready,
            };
            let task = task_db::insert_task(&self.pool, &new).await?;
            created.push(task.id);
        }
        Ok(created)
    }

    /// Soft-delete temporary agents that were working the parent's
    /// subtasks.
    async fn release_temporary_helpers(&self, children: &[Task]) -> Result<()> {
        for child in children {
            let Some(agent_id) = child.assigned_agent_id else {
                continue;
            };
            let Some(agent) = agent_db::get_agent(&self.pool, agent_id).await? else {
                continue;
            };
            if agent.lifecycle == AgentLifecycle::Temporary && agent.deleted_at.is_none() {
                agent_db::soft_delete_temporary(&self.pool, agent.id).await?;
                info!(agent_id = %agent.id, "temporary agent released after review");
            }
        }
        Ok(())
    }

    async fn force_quality_escalation(
        &self,
        parent: &Task,
        reviewer_agent: &Agent,
        reason: &str,
    ) -> Result<()> {
        warn!(parent_id = %parent.id, reason, "forcing quality escalation");

        task_db::require_human_approval(&self.pool, parent.id, reason).await?;
        approvals::insert_approval_request(
            &self.pool,
            &NewApprovalRequest {
                organization_id: parent.organization_id,
                task_id: parent.id,
                agent_id: Some(reviewer_agent.id),
                kind: ApprovalKind::Quality,
                reason: reason.to_owned(),
                metadata: serde_json::json!({ "stage": "review" }),
            },
        )
        .await
        .context("failed to open quality approval request")?;

        Ok(())
    }
}
