//! Database query functions for the `agents` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Agent, AgentLifecycle, AgentStatus};

/// Parameters for inserting a new agent row.
#[derive(Debug, Clone)]
pub struct NewAgent {
    pub organization_id: Uuid,
    pub team_id: Option<Uuid>,
    pub role_id: Uuid,
    pub name: String,
    pub lifecycle: AgentLifecycle,
    pub depth: i32,
    pub manager_id: Option<Uuid>,
    pub created_by_agent_id: Option<Uuid>,
    pub persona: Option<String>,
}

impl NewAgent {
    /// A permanent depth-0 agent.
    pub fn permanent(organization_id: Uuid, team_id: Uuid, role_id: Uuid, name: &str) -> Self {
        Self {
            organization_id,
            team_id: Some(team_id),
            role_id,
            name: name.to_owned(),
            lifecycle: AgentLifecycle::Permanent,
            depth: 0,
            manager_id: None,
            created_by_agent_id: None,
            persona: None,
        }
    }
}

/// Insert a new agent row.
pub async fn insert_agent(pool: &PgPool, new: &NewAgent) -> Result<Agent> {
    let agent = sqlx::query_as::<_, Agent>(
        "INSERT INTO agents (organization_id, team_id, role_id, name, lifecycle, depth, \
                             manager_id, created_by_agent_id, persona) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.team_id)
    .bind(new.role_id)
    .bind(&new.name)
    .bind(new.lifecycle)
    .bind(new.depth)
    .bind(new.manager_id)
    .bind(new.created_by_agent_id)
    .bind(&new.persona)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert agent {:?}", new.name))?;

    Ok(agent)
}

/// Fetch an agent by ID.
pub async fn get_agent(pool: &PgPool, id: Uuid) -> Result<Option<Agent>> {
    let agent = sqlx::query_as::<_, Agent>("SELECT * FROM agents WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch agent")?;

    Ok(agent)
}

/// List live (not soft-deleted) agents for a team.
pub async fn list_team_agents(pool: &PgPool, team_id: Uuid) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents WHERE team_id = $1 AND deleted_at IS NULL ORDER BY name",
    )
    .bind(team_id)
    .fetch_all(pool)
    .await
    .context("failed to list team agents")?;

    Ok(agents)
}

/// List live agents for an organization with a given status.
pub async fn list_agents_by_status(
    pool: &PgPool,
    organization_id: Uuid,
    status: AgentStatus,
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE organization_id = $1 AND status = $2 AND deleted_at IS NULL \
         ORDER BY name",
    )
    .bind(organization_id)
    .bind(status)
    .fetch_all(pool)
    .await
    .context("failed to list agents by status")?;

    Ok(agents)
}

/// Idle agents with something to do: a direct task in a claimable or
/// review-due status, or unassigned ready work in their team's pool.
/// The execute driver enqueues exactly these.
pub async fn list_dispatchable_agents(
    pool: &PgPool,
    organization_id: Uuid,
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT a.* FROM agents a \
         WHERE a.organization_id = $1 \
           AND a.status = 'idle' \
           AND a.deleted_at IS NULL \
           AND ( \
               EXISTS ( \
                   SELECT 1 FROM tasks t \
                   WHERE t.assigned_agent_id = a.id \
                     AND t.status IN ('ready', 'pending', 'ready_for_review') \
                     AND t.task_type <> 'team_epic' \
               ) \
               OR EXISTS ( \
                   SELECT 1 FROM tasks t \
                   WHERE t.assigned_team_id = a.team_id \
                     AND t.assigned_agent_id IS NULL \
                     AND t.status = 'ready' \
                     AND t.task_type <> 'team_epic' \
               ) \
           ) \
         ORDER BY a.name",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list dispatchable agents")?;

    Ok(agents)
}

/// Atomically transition an agent's status.
///
/// CAS on the previous status: only the orchestrator's `idle -> working`
/// edge claims an agent, and a concurrent claim loses the race with
/// `rows_affected == 0`.
pub async fn transition_agent_status(
    pool: &PgPool,
    agent_id: Uuid,
    from: AgentStatus,
    to: AgentStatus,
    current_task_id: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET status = $1, current_task_id = $2 \
         WHERE id = $3 AND status = $4",
    )
    .bind(to)
    .bind(current_task_id)
    .bind(agent_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition agent status")?;

    Ok(result.rows_affected())
}

/// Point an agent at its current task (or clear it with `None`).
pub async fn set_current_task(
    pool: &PgPool,
    agent_id: Uuid,
    task_id: Option<Uuid>,
) -> Result<u64> {
    let result = sqlx::query("UPDATE agents SET current_task_id = $1 WHERE id = $2")
        .bind(task_id)
        .bind(agent_id)
        .execute(pool)
        .await
        .context("failed to set current task")?;

    Ok(result.rows_affected())
}

/// Count agents in an organization occupying concurrency slots
/// (`working` or `blocked`).
pub async fn count_busy_agents(pool: &PgPool, organization_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM agents \
         WHERE organization_id = $1 \
           AND status IN ('working', 'blocked') \
           AND deleted_at IS NULL",
    )
    .bind(organization_id)
    .fetch_one(pool)
    .await
    .context("failed to count busy agents")?;

    Ok(row.0)
}

/// Count a team member's current in-progress load (distribution tie-break).
pub async fn count_in_progress_load(pool: &PgPool, agent_id: Uuid) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM tasks \
         WHERE assigned_agent_id = $1 AND status IN ('ready', 'in_progress')",
    )
    .bind(agent_id)
    .fetch_one(pool)
    .await
    .context("failed to count in-progress load")?;

    Ok(row.0)
}

/// Pause every working or reviewing agent in an org (emergency stop).
/// Returns the number of agents paused.
pub async fn pause_active_agents(pool: &PgPool, organization_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET status = 'paused', current_task_id = NULL \
         WHERE organization_id = $1 \
           AND status IN ('working', 'reviewing') \
           AND deleted_at IS NULL",
    )
    .bind(organization_id)
    .execute(pool)
    .await
    .context("failed to pause agents")?;

    Ok(result.rows_affected())
}

/// Flip every paused agent in an org back to idle (resume).
pub async fn resume_paused_agents(pool: &PgPool, organization_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET status = 'idle' \
         WHERE organization_id = $1 AND status = 'paused' AND deleted_at IS NULL",
    )
    .bind(organization_id)
    .execute(pool)
    .await
    .context("failed to resume agents")?;

    Ok(result.rows_affected())
}

/// Soft-delete a temporary agent once its parent task's subtasks are all
/// terminal. Permanent agents are never deleted through this path.
pub async fn soft_delete_temporary(pool: &PgPool, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE agents \
         SET deleted_at = now(), status = 'idle', current_task_id = NULL \
         WHERE id = $1 AND lifecycle = 'temporary' AND deleted_at IS NULL",
    )
    .bind(agent_id)
    .execute(pool)
    .await
    .context("failed to soft-delete temporary agent")?;

    Ok(result.rows_affected())
}

/// List live temporary agents created by a given agent.
pub async fn list_temporaries_created_by(
    pool: &PgPool,
    created_by_agent_id: Uuid,
) -> Result<Vec<Agent>> {
    let agents = sqlx::query_as::<_, Agent>(
        "SELECT * FROM agents \
         WHERE created_by_agent_id = $1 AND lifecycle = 'temporary' AND deleted_at IS NULL",
    )
    .bind(created_by_agent_id)
    .fetch_all(pool)
    .await
    .context("failed to list temporary agents")?;

    Ok(agents)
}
