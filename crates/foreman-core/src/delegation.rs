//! Temporary-agent delegation for complex tasks.
//!
//! When the cycle detects a task too complex for one pass, a depth-0
//! permanent agent may split it across temporary specialists: one spawned
//! agent per needed role, each holding a slice of the work as a subtask of
//! the original task. Temporary agents live at depth 1, never spawn
//! further temporaries, and are soft-deleted once every subtask is
//! terminal.

use std::collections::HashMap;

use anyhow::{Context, Result};
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{Agent, AgentLifecycle, Role, Task, TaskStatus, TaskType};
use foreman_db::queries::agents::{self as agent_db, NewAgent};
use foreman_db::queries::tasks::{self as task_db, NewTask};

use crate::cost::estimate_tokens;
use crate::distributor::{parse_distribution, validate_distribution, DistributionError};

/// Keyword groups used for the multi-domain complexity signal.
const DOMAIN_KEYWORDS: &[(&str, &[&str])] = &[
    ("frontend", &["frontend", "ui", "css", "react", "component", "browser"]),
    ("backend", &["backend", "api", "endpoint", "server", "service"]),
    ("database", &["database", "migration", "schema", "sql", "index"]),
    ("infra", &["deploy", "docker", "kubernetes", "pipeline", "terraform"]),
    ("ml", &["model", "training", "inference", "embedding", "dataset"]),
];

/// Phrases that explicitly ask for decomposition.
const DECOMPOSITION_HINTS: &[&str] = &["decompose", "break down", "split into", "multi-step"];

/// Why a task was judged complex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ComplexitySignal {
    TokenEstimate { estimated: u64, threshold: u64 },
    MultiDomain { domains: Vec<String> },
    ExplicitHint { hint: String },
}

/// Detect whether a task is complex enough to delegate.
///
/// Signals, any one of which suffices: the prompt-size token estimate
/// exceeds the threshold, the text names keywords from two or more
/// domains, or the description explicitly asks for decomposition.
pub fn detect_complexity(task: &Task, token_threshold: u64) -> Option<ComplexitySignal> {
    let estimate = estimate_tokens(&task.description, &task.title);
    if estimate.total() > token_threshold {
        return Some(ComplexitySignal::TokenEstimate {
            estimated: estimate.total(),
            threshold: token_threshold,
        });
    }

    let haystack = format!("{} {}", task.title, task.description).to_lowercase();

    for hint in DECOMPOSITION_HINTS {
        if haystack.contains(hint) {
            return Some(ComplexitySignal::ExplicitHint {
                hint: (*hint).to_owned(),
            });
        }
    }

    let domains: Vec<String> = DOMAIN_KEYWORDS
        .iter()
        .filter(|(_, words)| words.iter().any(|w| haystack.contains(w)))
        .map(|(domain, _)| (*domain).to_owned())
        .collect();
    if domains.len() >= 2 {
        return Some(ComplexitySignal::MultiDomain { domains });
    }

    None
}

/// Outcome of one delegation attempt.
#[derive(Debug)]
pub enum DelegationOutcome {
    /// Specialists spawned and subtasks created.
    Delegated {
        agent_ids: Vec<Uuid>,
        subtask_ids: Vec<Uuid>,
    },
    /// Delegation refused; the task should be processed sequentially.
    Refused { reason: String },
}

/// Spawns and retires temporary specialist agents.
#[derive(Debug, Clone)]
pub struct Delegator {
    pool: PgPool,
}

const DELEGATION_CONTRACT: &str = r#"Respond with a single JSON object:

```json
{
  "subtasks": [
    {
      "title": "string (unique)",
      "description": "string",
      "roleId": "<uuid of an available specialist role>",
      "dependencies": ["<sibling title>", ...],
      "affectedFiles": ["path", ...]
    }
  ],
  "reasoning": "why this split"
}
```

Propose between 3 and 7 subtasks covering the whole task. Dependencies
reference sibling titles only and must not form a cycle."#;

/// Build the delegation prompt: the task plus the roles available for
/// temporary specialists.
pub fn build_delegation_prompt(task: &Task, roles: &[Role]) -> String {
    let mut out = String::new();
    out.push_str("# Task to delegate\n\n");
    out.push_str(&format!("Title: {}\n\n{}\n\n", task.title, task.description));
    out.push_str("# Available specialist roles\n\n");
    for role in roles {
        out.push_str(&format!(
            "  - {} ({}): [{}]\n",
            role.name,
            role.id,
            role.capabilities.join(", ")
        ));
    }
    out.push('\n');
    out.push_str(DELEGATION_CONTRACT);
    out
}

impl Delegator {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a provider decomposition: spawn one temporary agent per
    /// distinct role and create the subtasks under the parent task.
    ///
    /// Refuses (without error) when the parent agent may not delegate,
    /// when the task is already at the depth ceiling, or when the proposal
    /// fails validation -- the cycle then processes the task sequentially.
    pub async fn apply(
        &self,
        parent_task: &Task,
        parent_agent: &Agent,
        delegatable_roles: &[Role],
        provider_output: &str,
    ) -> Result<DelegationOutcome> {
        if !parent_agent.may_delegate() {
            return Ok(DelegationOutcome::Refused {
                reason: format!(
                    "agent {} (lifecycle {}, depth {}) may not spawn temporaries",
                    parent_agent.name, parent_agent.lifecycle, parent_agent.depth
                ),
            });
        }

        if parent_task.depth >= 3 {
            return Ok(DelegationOutcome::Refused {
                reason: format!("task depth {} is at the ceiling", parent_task.depth),
            });
        }

        if delegatable_roles.is_empty() {
            return Ok(DelegationOutcome::Refused {
                reason: "no roles are available for temporary agents".to_owned(),
            });
        }

        let role_ids: Vec<Uuid> = delegatable_roles.iter().map(|r| r.id).collect();

        let plan = match parse_distribution(provider_output) {
            Ok(plan) => plan,
            Err(error) => return Ok(refused(error)),
        };
        let order = match validate_distribution(&plan, &role_ids) {
            Ok(order) => order,
            Err(error) => return Ok(refused(error)),
        };

        let roles_by_id: HashMap<Uuid, &Role> =
            delegatable_roles.iter().map(|r| (r.id, r)).collect();

        // One temporary agent per distinct role in the plan.
        let mut agents_by_role: HashMap<Uuid, Agent> = HashMap::new();
        let mut agent_ids = Vec::new();
        for spec in &plan.subtasks {
            if agents_by_role.contains_key(&spec.role_id) {
                continue;
            }
            let role = roles_by_id[&spec.role_id];
            let name = format!(
                "{}-{}-{}",
                parent_agent.name,
                role.name,
                &parent_task.id.simple().to_string()[..8]
            );
            let agent = agent_db::insert_agent(
                &self.pool,
                &NewAgent {
                    organization_id: parent_agent.organization_id,
                    team_id: parent_agent.team_id,
                    role_id: role.id,
                    name,
                    lifecycle: AgentLifecycle::Temporary,
                    depth: 1,
                    manager_id: Some(parent_agent.id),
                    created_by_agent_id: Some(parent_agent.id),
                    persona: None,
                },
            )
            .await
            .context("failed to spawn temporary agent")?;

            info!(
                agent_id = %agent.id,
                role = %role.name,
                parent_agent = %parent_agent.name,
                "temporary agent spawned"
            );
            agent_ids.push(agent.id);
            agents_by_role.insert(role.id, agent);
        }

        // Create the subtasks in dependency order.
        let mut ids_by_title: HashMap<String, Uuid> = HashMap::new();
        let mut subtask_ids = Vec::with_capacity(order.len());
        for idx in order {
            let spec = &plan.subtasks[idx];
            let assignee = &agents_by_role[&spec.role_id];

            let blocked_by: Vec<Uuid> = spec
                .dependencies
                .iter()
                .map(|title| ids_by_title[title])
                .collect();
            let status = if blocked_by.is_empty() {
                TaskStatus::Ready
            } else {
                TaskStatus::Pending
            };

            let new = NewTask {
                organization_id: parent_task.organization_id,
                project_id: parent_task.project_id,
                title: spec.title.clone(),
                description: spec.description.clone(),
                task_type: TaskType::Standard,
                priority: parent_task.priority,
                depth: parent_task.depth + 1,
                affected_files: spec.affected_files.clone(),
                required_skills: roles_by_id[&spec.role_id].capabilities.clone(),
                tags: Vec::new(),
                assigned_agent_id: Some(assignee.id),
                assigned_team_id: None,
                parent_task_id: Some(parent_task.id),
                blocked_by,
                status,
            };
            let task = task_db::insert_task(&self.pool, &new).await?;
            ids_by_title.insert(spec.title.clone(), task.id);
            subtask_ids.push(task.id);
        }

        Ok(DelegationOutcome::Delegated {
            agent_ids,
            subtask_ids,
        })
    }

    /// Soft-delete the temporary agents working a parent task once every
    /// subtask is terminal. Idempotent. Returns the agents released.
    pub async fn cleanup_if_terminal(
        &self,
        parent_task_id: Uuid,
        parent_agent_id: Uuid,
    ) -> Result<Vec<Uuid>> {
        if !task_db::all_subtasks_terminal(&self.pool, parent_task_id).await? {
            return Ok(Vec::new());
        }

        let temporaries =
            agent_db::list_temporaries_created_by(&self.pool, parent_agent_id).await?;
        let mut released = Vec::new();
        for agent in temporaries {
            if agent_db::soft_delete_temporary(&self.pool, agent.id).await? == 1 {
                info!(agent_id = %agent.id, "temporary agent retired");
                released.push(agent.id);
            }
        }
        Ok(released)
    }
}

fn refused(error: DistributionError) -> DelegationOutcome {
    warn!(error = %error, "delegation proposal rejected, processing sequentially");
    DelegationOutcome::Refused {
        reason: error.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_db::models::TaskPriority;

    fn make_task(title: &str, description: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            project_id: None,
            title: title.to_owned(),
            description: description.to_owned(),
            task_type: TaskType::Standard,
            status: TaskStatus::InProgress,
            priority: TaskPriority::P3,
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
    fn huge_description_trips_token_signal() {
        let task = make_task("big", &"x".repeat(200_000));
        let signal = detect_complexity(&task, 20_000);
        assert!(matches!(signal, Some(ComplexitySignal::TokenEstimate { .. })));
    }

    #[test]
    fn multi_domain_keywords_trip_signal() {
        let task = make_task(
            "wire it up",
            "Add the API endpoint and the React component that consumes it.",
        );
        let signal = detect_complexity(&task, 20_000);
        match signal {
            Some(ComplexitySignal::MultiDomain { domains }) => {
                assert!(domains.contains(&"frontend".to_owned()));
                assert!(domains.contains(&"backend".to_owned()));
            }
            other => panic!("expected multi-domain signal, got {other:?}"),
        }
    }

    #[test]
    fn explicit_hint_trips_signal() {
        let task = make_task("plan", "Please break down this work before starting.");
        assert!(matches!(
            detect_complexity(&task, 20_000),
            Some(ComplexitySignal::ExplicitHint { .. })
        ));
    }

    #[test]
    fn single_domain_small_task_is_simple() {
        let task = make_task("tweak", "Rename the variable in the server handler.");
        assert!(detect_complexity(&task, 20_000).is_none());
    }

    #[test]
    fn delegation_prompt_lists_roles() {
        let task = make_task("t", "d");
        let role = Role {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            name: "db-specialist".to_owned(),
            capabilities: vec!["sql".to_owned()],
            available_for_temporary_agent: true,
            system_prompt: String::new(),
            created_at: Utc::now(),
        };
        let prompt = build_delegation_prompt(&task, &[role]);
        assert!(prompt.contains("db-specialist"));
        assert!(prompt.contains("between 3 and 7"));
    }
}
