//! Team-epic distribution: expand an epic into ranked subtasks assigned to
//! team members.
//!
//! The manager agent's provider invocation proposes 3-7 subtasks with a
//! dependency graph over sibling titles. The proposal is validated (count,
//! role reachability, acyclicity) before anything is written; acceptance
//! creates all subtasks and moves the epic to `in_progress` in one
//! transaction, so either the whole decomposition exists or none of it
//! does.

use std::collections::HashMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use sqlx::PgPool;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use foreman_db::models::{
    Agent, ApprovalKind, Role, Task, TaskPriority, TaskStatus, TaskType,
};
use foreman_db::queries::approvals::{self, NewApprovalRequest};
use foreman_db::queries::tasks::{self as task_db, NewTask};

use crate::response::extract_json_object;

/// Bounds on the number of subtasks in one decomposition.
pub const MIN_SUBTASKS: usize = 3;
pub const MAX_SUBTASKS: usize = 7;

/// Errors that reject a proposed decomposition. The epic remains `pending`
/// and a quality approval request is opened.
#[derive(Debug, Error)]
pub enum DistributionError {
    #[error("decomposition output is not a JSON object")]
    Unparseable,

    #[error("decomposition proposed {0} subtasks, expected {MIN_SUBTASKS}..={MAX_SUBTASKS}")]
    CountOutOfRange(usize),

    #[error("subtask {subtask:?} references role {role_id} not reachable from the team")]
    UnknownRole { subtask: String, role_id: Uuid },

    #[error("subtask {subtask:?} depends on unknown sibling {dependency:?}")]
    UnknownDependency { subtask: String, dependency: String },

    #[error("dependency graph contains a cycle")]
    DependencyCycle,

    #[error("duplicate subtask title {0:?}")]
    DuplicateTitle(String),
}

/// One proposed subtask, as emitted by the provider.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubtaskSpec {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "type")]
    pub task_type: Option<String>,
    pub role_id: Uuid,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub affected_files: Vec<String>,
}

/// The provider's full decomposition decision.
#[derive(Debug, Clone, Deserialize)]
pub struct DistributionPlan {
    pub subtasks: Vec<SubtaskSpec>,
    #[serde(default)]
    pub reasoning: Option<String>,
}

/// A team member with the context assignment needs.
#[derive(Debug, Clone)]
pub struct MemberInfo {
    pub agent: Agent,
    pub role: Role,
    /// Tasks currently on the member's plate.
    pub in_progress_load: i64,
    /// Files the member touched recently (affinity tie-break).
    pub recent_files: Vec<String>,
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

const DISTRIBUTION_CONTRACT: &str = r#"Respond with a single JSON object:

```json
{
  "subtasks": [
    {
      "title": "string (unique among siblings)",
      "description": "string",
      "type": "standard" | "bug" | "spike",
      "roleId": "<uuid of a team role>",
      "dependencies": ["<sibling title>", ...],
      "priority": "p1" | "p2" | "p3" | "p4",
      "affectedFiles": ["path", ...]
    }
  ],
  "reasoning": "why this split"
}
```

Propose between 3 and 7 subtasks. Dependencies must reference sibling
titles only and must not form a cycle."#;

/// Build the distribution prompt: the epic plus the team composition.
pub fn build_distribution_prompt(epic: &Task, members: &[MemberInfo]) -> String {
    let mut out = String::new();
    out.push_str("# Team epic to distribute\n\n");
    out.push_str(&format!("Title: {}\nPriority: {}\n\n", epic.title, epic.priority));
    out.push_str(&epic.description);
    out.push_str("\n\n# Team composition\n\n");
    for member in members {
        out.push_str(&format!(
            "  - {} (role {} / {}, capabilities: [{}], current load: {})\n",
            member.agent.name,
            member.role.name,
            member.role.id,
            member.role.capabilities.join(", "),
            member.in_progress_load,
        ));
    }
    out.push('\n');
    out.push_str(DISTRIBUTION_CONTRACT);
    out
}

// ---------------------------------------------------------------------------
// Parse + validate
// ---------------------------------------------------------------------------

/// Parse the provider's output into a plan.
pub fn parse_distribution(text: &str) -> Result<DistributionPlan, DistributionError> {
    let value = extract_json_object(text).ok_or(DistributionError::Unparseable)?;
    serde_json::from_value(value).map_err(|_| DistributionError::Unparseable)
}

/// Validate a plan against the bounds, the team's reachable roles, and
/// acyclicity. Returns subtask indices in a valid topological order.
pub fn validate_distribution(
    plan: &DistributionPlan,
    team_role_ids: &[Uuid],
) -> Result<Vec<usize>, DistributionError> {
    let n = plan.subtasks.len();
    if !(MIN_SUBTASKS..=MAX_SUBTASKS).contains(&n) {
        return Err(DistributionError::CountOutOfRange(n));
    }

    let mut index_by_title: HashMap<&str, usize> = HashMap::new();
    for (i, spec) in plan.subtasks.iter().enumerate() {
        if index_by_title.insert(spec.title.as_str(), i).is_some() {
            return Err(DistributionError::DuplicateTitle(spec.title.clone()));
        }
    }

    for spec in &plan.subtasks {
        if !team_role_ids.contains(&spec.role_id) {
            return Err(DistributionError::UnknownRole {
                subtask: spec.title.clone(),
                role_id: spec.role_id,
            });
        }
        for dep in &spec.dependencies {
            if !index_by_title.contains_key(dep.as_str()) {
                return Err(DistributionError::UnknownDependency {
                    subtask: spec.title.clone(),
                    dependency: dep.clone(),
                });
            }
        }
    }

    topological_order(plan, &index_by_title)
}

/// Kahn's algorithm over the title-dependency graph.
fn topological_order(
    plan: &DistributionPlan,
    index_by_title: &HashMap<&str, usize>,
) -> Result<Vec<usize>, DistributionError> {
    let n = plan.subtasks.len();
    let mut indegree = vec![0usize; n];
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];

    for (i, spec) in plan.subtasks.iter().enumerate() {
        for dep in &spec.dependencies {
            let dep_idx = index_by_title[dep.as_str()];
            indegree[i] += 1;
            dependents[dep_idx].push(i);
        }
    }

    let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
    // Deterministic order among unordered peers.
    queue.sort();

    let mut order = Vec::with_capacity(n);
    while let Some(i) = queue.pop() {
        order.push(i);
        for &dependent in &dependents[i] {
            indegree[dependent] -= 1;
            if indegree[dependent] == 0 {
                queue.push(dependent);
            }
        }
    }

    if order.len() == n {
        Ok(order)
    } else {
        Err(DistributionError::DependencyCycle)
    }
}

// ---------------------------------------------------------------------------
// Assignment
// ---------------------------------------------------------------------------

/// Pick the team member for a subtask.
///
/// Eligible members share at least one capability with the subtask's role;
/// the lowest current load wins, tie-broken by file affinity (overlap with
/// the member's recent files) and then agent name for determinism.
pub fn choose_assignee<'a>(
    spec: &SubtaskSpec,
    spec_role: &Role,
    members: &'a [MemberInfo],
) -> Option<&'a MemberInfo> {
    let eligible: Vec<&MemberInfo> = members
        .iter()
        .filter(|m| {
            m.role
                .capabilities
                .iter()
                .any(|c| spec_role.capabilities.contains(c))
        })
        .collect();

    eligible.into_iter().min_by(|a, b| {
        a.in_progress_load
            .cmp(&b.in_progress_load)
            .then_with(|| affinity(b, spec).cmp(&affinity(a, spec)))
            .then_with(|| a.agent.name.cmp(&b.agent.name))
    })
}

fn affinity(member: &MemberInfo, spec: &SubtaskSpec) -> usize {
    spec.affected_files
        .iter()
        .filter(|f| member.recent_files.contains(f))
        .count()
}

// ---------------------------------------------------------------------------
// Distributor
// ---------------------------------------------------------------------------

/// Outcome of one distribution attempt.
#[derive(Debug)]
pub enum DistributionOutcome {
    /// Subtasks created, epic now `in_progress`.
    Distributed { subtask_ids: Vec<Uuid> },
    /// The proposal was rejected; the epic remains `pending` and a quality
    /// approval request was opened.
    Rejected { error: DistributionError },
    /// Another distributor moved the epic first; nothing was written.
    Abandoned,
}

/// Applies validated decompositions to the database.
#[derive(Debug, Clone)]
pub struct Distributor {
    pool: PgPool,
}

impl Distributor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply a provider response for an epic.
    ///
    /// On a rejected proposal the epic is left untouched (still `pending`)
    /// and an `ApprovalRequest { kind: quality }` records why.
    pub async fn apply(
        &self,
        epic: &Task,
        manager: &Agent,
        members: &[MemberInfo],
        provider_output: &str,
    ) -> Result<DistributionOutcome> {
        let team_role_ids: Vec<Uuid> = members.iter().map(|m| m.role.id).collect();

        let plan = match parse_distribution(provider_output) {
            Ok(plan) => plan,
            Err(error) => return self.reject(epic, manager, error).await,
        };

        let order = match validate_distribution(&plan, &team_role_ids) {
            Ok(order) => order,
            Err(error) => return self.reject(epic, manager, error).await,
        };

        let roles_by_id: HashMap<Uuid, &Role> =
            members.iter().map(|m| (m.role.id, &m.role)).collect();

        // All inserts plus the epic transition commit or roll back together.
        let mut tx = self.pool.begin().await.context("failed to begin transaction")?;

        let mut ids_by_title: HashMap<String, Uuid> = HashMap::new();
        let mut subtask_ids = Vec::with_capacity(order.len());

        for idx in order {
            let spec = &plan.subtasks[idx];
            let spec_role = roles_by_id[&spec.role_id];

            let assignee = choose_assignee(spec, spec_role, members)
                .with_context(|| format!("no eligible member for subtask {:?}", spec.title))?;

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
                organization_id: epic.organization_id,
                project_id: epic.project_id,
                title: spec.title.clone(),
                description: spec.description.clone(),
                task_type: parse_task_type(spec.task_type.as_deref()),
                priority: parse_priority(spec.priority.as_deref()).unwrap_or(epic.priority),
                depth: epic.depth + 1,
                affected_files: spec.affected_files.clone(),
                required_skills: spec_role.capabilities.clone(),
                tags: Vec::new(),
                assigned_agent_id: Some(assignee.agent.id),
                assigned_team_id: None,
                parent_task_id: Some(epic.id),
                blocked_by,
                status,
            };

            let task = task_db::insert_task(&mut *tx, &new).await?;
            ids_by_title.insert(spec.title.clone(), task.id);
            subtask_ids.push(task.id);
        }

        // Epic pending -> in_progress, CAS inside the same transaction.
        let rows = sqlx::query(
            "UPDATE tasks SET status = 'in_progress', started_at = now() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(epic.id)
        .execute(&mut *tx)
        .await
        .context("failed to transition epic to in_progress")?
        .rows_affected();

        if rows == 0 {
            // Another distributor got here first; drop our subtasks.
            tx.rollback().await.ok();
            warn!(epic_id = %epic.id, "epic was no longer pending, distribution abandoned");
            return Ok(DistributionOutcome::Abandoned);
        }

        tx.commit().await.context("failed to commit distribution")?;

        info!(
            epic_id = %epic.id,
            subtasks = subtask_ids.len(),
            reasoning = plan.reasoning.as_deref().unwrap_or(""),
            "epic distributed"
        );

        Ok(DistributionOutcome::Distributed { subtask_ids })
    }

    async fn reject(
        &self,
        epic: &Task,
        manager: &Agent,
        error: DistributionError,
    ) -> Result<DistributionOutcome> {
        warn!(epic_id = %epic.id, error = %error, "distribution rejected");

        approvals::insert_approval_request(
            &self.pool,
            &NewApprovalRequest {
                organization_id: epic.organization_id,
                task_id: epic.id,
                agent_id: Some(manager.id),
                kind: ApprovalKind::Quality,
                reason: error.to_string(),
                metadata: serde_json::json!({ "stage": "distribution" }),
            },
        )
        .await?;

        Ok(DistributionOutcome::Rejected { error })
    }
}

fn parse_task_type(s: Option<&str>) -> TaskType {
    match s.map(str::to_ascii_lowercase).as_deref() {
        Some("bug") => TaskType::Bug,
        Some("spike") => TaskType::Spike,
        Some("epic") => TaskType::Epic,
        _ => TaskType::Standard,
    }
}

fn parse_priority(s: Option<&str>) -> Option<TaskPriority> {
    s.and_then(|p| p.to_ascii_lowercase().parse().ok())
}
