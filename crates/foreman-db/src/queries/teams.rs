//! Database query functions for the `teams` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Team;

/// Insert a new team.
pub async fn insert_team(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    charter: &str,
    parent_team_id: Option<Uuid>,
) -> Result<Team> {
    let team = sqlx::query_as::<_, Team>(
        "INSERT INTO teams (organization_id, name, charter, parent_team_id) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(charter)
    .bind(parent_team_id)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert team {name:?}"))?;

    Ok(team)
}

/// Fetch a team by ID.
pub async fn get_team(pool: &PgPool, id: Uuid) -> Result<Option<Team>> {
    let team = sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch team")?;

    Ok(team)
}

/// List teams for an organization.
pub async fn list_teams(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Team>> {
    let teams =
        sqlx::query_as::<_, Team>("SELECT * FROM teams WHERE organization_id = $1 ORDER BY name")
            .bind(organization_id)
            .fetch_all(pool)
            .await
            .context("failed to list teams")?;

    Ok(teams)
}

/// Designate a team's manager agent.
pub async fn set_manager(pool: &PgPool, team_id: Uuid, agent_id: Uuid) -> Result<u64> {
    let result = sqlx::query("UPDATE teams SET manager_agent_id = $1 WHERE id = $2")
        .bind(agent_id)
        .bind(team_id)
        .execute(pool)
        .await
        .context("failed to set team manager")?;

    Ok(result.rows_affected())
}

/// Count teammates of an agent that are currently available for more work
/// (not paused/blocked/errored, not soft-deleted, and not the agent itself).
///
/// Escalation level 2 requires at least one.
pub async fn count_available_teammates(
    pool: &PgPool,
    team_id: Uuid,
    excluding_agent_id: Uuid,
) -> Result<i64> {
    let row: (i64,) = sqlx::query_as(
        "SELECT COUNT(*) FROM agents \
         WHERE team_id = $1 \
           AND id <> $2 \
           AND deleted_at IS NULL \
           AND status IN ('idle', 'working', 'reviewing')",
    )
    .bind(team_id)
    .bind(excluding_agent_id)
    .fetch_one(pool)
    .await
    .context("failed to count available teammates")?;

    Ok(row.0)
}
