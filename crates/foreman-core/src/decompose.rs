//! Goal decomposition: expand a human-authored goal into projects,
//! team-epics, and unit tasks.
//!
//! The provider proposes a project/task tree as JSON; accepted proposals
//! are created in one transaction and the goal is flagged
//! `auto_decomposed` (compare-and-set, so concurrent decompose drivers
//! expand a goal at most once).

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{Goal, Organization, TaskPriority, TaskStatus, TaskType, Team};
use foreman_db::queries::goals as goal_db;
use foreman_db::queries::projects as project_db;
use foreman_db::queries::tasks::{self as task_db, NewTask};

use crate::response::extract_json_object;

/// Errors that reject a goal decomposition.
#[derive(Debug, Error)]
pub enum DecomposeError {
    #[error("decomposition output is not a JSON object")]
    Unparseable,

    #[error("decomposition proposed no projects")]
    Empty,

    #[error("project {0:?} has no tasks")]
    EmptyProject(String),
}

/// A proposed unit of work within a project.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub team: Option<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

/// A proposed project grouping tasks.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectSpec {
    pub name: String,
    #[serde(default)]
    pub working_directory: Option<String>,
    pub tasks: Vec<TaskSpec>,
}

/// The provider's full decomposition.
#[derive(Debug, Clone, Deserialize)]
pub struct GoalPlan {
    pub projects: Vec<ProjectSpec>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

const GOAL_CONTRACT: &str = r#"Respond with a single JSON object:

```json
{
  "projects": [
    {
      "name": "string",
      "workingDirectory": "/abs/path (optional)",
      "tasks": [
        {
          "title": "string",
          "description": "string",
          "type": "standard" | "team_epic" | "bug" | "spike",
          "priority": "p1" | "p2" | "p3" | "p4",
          "team": "<team name>",
          "affectedFiles": ["path", ...],
          "requiredSkills": ["skill", ...]
        }
      ]
    }
  ],
  "reasoning": "how the goal maps to this backlog"
}
```

Use "team_epic" for work that a whole team must split up before execution;
use "standard" for work one agent can finish."#;

/// Build the decomposition prompt from the goal and org context.
pub fn build_goal_prompt(org: &Organization, goal: &Goal, teams: &[Team]) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Organization: {}\n\n", org.name));
    if !org.mission.is_empty() {
        out.push_str(&org.mission);
        out.push_str("\n\n");
    }
    out.push_str("Teams:\n");
    for team in teams {
        out.push_str(&format!("  - {}\n", team.name));
    }
    out.push_str(&format!("\n# Goal\n\n{}\n\n{}\n", goal.title, goal.description));
    if let Some(key_results) = goal.key_results.as_deref() {
        out.push_str(&format!("\nKey results:\n{key_results}\n"));
    }
    out.push('\n');
    out.push_str(GOAL_CONTRACT);
    out
}

/// Parse and sanity-check the provider's output.
pub fn parse_goal_plan(text: &str) -> Result<GoalPlan, DecomposeError> {
    let value = extract_json_object(text).ok_or(DecomposeError::Unparseable)?;
    let plan: GoalPlan =
        serde_json::from_value(value).map_err(|_| DecomposeError::Unparseable)?;

    if plan.projects.is_empty() {
        return Err(DecomposeError::Empty);
    }
    for project in &plan.projects {
        if project.tasks.is_empty() {
            return Err(DecomposeError::EmptyProject(project.name.clone()));
        }
    }
    Ok(plan)
}

/// Outcome of one decomposition.
#[derive(Debug)]
pub enum DecomposeOutcome {
    Created {
        project_ids: Vec<Uuid>,
        task_ids: Vec<Uuid>,
    },
    /// Proposal rejected; the goal stays undecomposed for a later pass.
    Rejected { error: DecomposeError },
}

/// Applies goal decompositions.
#[derive(Debug, Clone)]
pub struct GoalDecomposer {
    pool: PgPool,
    default_working_directory: String,
    integration_branch: String,
}

impl GoalDecomposer {
    pub fn new(
        pool: PgPool,
        default_working_directory: impl Into<String>,
        integration_branch: impl Into<String>,
    ) -> Self {
        Self {
            pool,
            default_working_directory: default_working_directory.into(),
            integration_branch: integration_branch.into(),
        }
    }

    /// Apply a provider response for a goal: create projects and root
    /// tasks, then flag the goal decomposed.
    ///
    /// Every created task is team-assigned (the named team, falling back
    /// to the first team) so the pool's team and role classes can hand
    /// them to agents.
    pub async fn apply(
        &self,
        org: &Organization,
        goal: &Goal,
        teams: &[Team],
        provider_output: &str,
    ) -> Result<DecomposeOutcome> {
        let plan = match parse_goal_plan(provider_output) {
            Ok(plan) => plan,
            Err(error) => {
                warn!(goal_id = %goal.id, error = %error, "goal decomposition rejected");
                return Ok(DecomposeOutcome::Rejected { error });
            }
        };

        let Some(fallback_team) = teams.first() else {
            warn!(goal_id = %goal.id, "organization has no teams, cannot decompose");
            return Ok(DecomposeOutcome::Rejected {
                error: DecomposeError::Empty,
            });
        };
        let teams_by_name: HashMap<&str, &Team> =
            teams.iter().map(|t| (t.name.as_str(), t)).collect();

        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let mut project_ids = Vec::new();
        let mut task_ids = Vec::new();

        for project_spec in &plan.projects {
            let working_directory = project_spec
                .working_directory
                .clone()
                .unwrap_or_else(|| self.default_working_directory.clone());

            let project = project_db::insert_project(
                &mut *tx,
                org.id,
                &project_spec.name,
                &working_directory,
                &self.integration_branch,
            )
            .await?;
            project_ids.push(project.id);

            for task_spec in &project_spec.tasks {
                let team = task_spec
                    .team
                    .as_deref()
                    .and_then(|name| teams_by_name.get(name).copied())
                    .unwrap_or(fallback_team);

                let task_type = parse_task_type(task_spec.task_type.as_deref());
                // Team epics wait for the distributor; unit tasks are
                // immediately claimable by the team's agents.
                let status = match task_type {
                    TaskType::TeamEpic => TaskStatus::Pending,
                    _ => TaskStatus::Ready,
                };

                let new = NewTask {
                    organization_id: org.id,
                    project_id: Some(project.id),
                    title: task_spec.title.clone(),
                    description: task_spec.description.clone(),
                    task_type,
                    priority: parse_priority(task_spec.priority.as_deref())
                        .unwrap_or(TaskPriority::P3),
                    depth: 0,
                    affected_files: task_spec.affected_files.clone(),
                    required_skills: task_spec.required_skills.clone(),
                    tags: Vec::new(),
                    assigned_agent_id: None,
                    assigned_team_id: Some(team.id),
                    parent_task_id: None,
                    blocked_by: Vec::new(),
                    status,
                };
                let task = task_db::insert_task(&mut *tx, &new).await?;
                task_ids.push(task.id);
            }
        }

        tx.commit().await.context("failed to commit decomposition")?;

        let marked = goal_db::mark_decomposed(&self.pool, goal.id).await?;
        if marked == 0 {
            warn!(goal_id = %goal.id, "goal was already flagged decomposed");
        }

        info!(
            goal_id = %goal.id,
            projects = project_ids.len(),
            tasks = task_ids.len(),
            "goal decomposed"
        );

        Ok(DecomposeOutcome::Created {
            project_ids,
            task_ids,
        })
    }
}

fn parse_task_type(s: Option<&str>) -> TaskType {
    match s.map(str::to_ascii_lowercase).as_deref() {
        Some("team_epic") => TaskType::TeamEpic,
        Some("epic") => TaskType::Epic,
        Some("bug") => TaskType::Bug,
        Some("spike") => TaskType::Spike,
        _ => TaskType::Standard,
    }
}

fn parse_priority(s: Option<&str>) -> Option<TaskPriority> {
    s.and_then(|p| p.to_ascii_lowercase().parse().ok())
}
