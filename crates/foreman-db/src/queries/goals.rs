//! Database query functions for the `goals` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Goal;

/// Insert a new goal in `active` status.
pub async fn insert_goal(
    pool: &PgPool,
    organization_id: Uuid,
    title: &str,
    description: &str,
) -> Result<Goal> {
    let goal = sqlx::query_as::<_, Goal>(
        "INSERT INTO goals (organization_id, title, description) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(title)
    .bind(description)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert goal {title:?}"))?;

    Ok(goal)
}

/// Fetch a goal by ID.
pub async fn get_goal(pool: &PgPool, id: Uuid) -> Result<Option<Goal>> {
    let goal = sqlx::query_as::<_, Goal>("SELECT * FROM goals WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch goal")?;

    Ok(goal)
}

/// Active goals that have not been decomposed yet (decompose driver input).
pub async fn list_undecomposed_goals(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Goal>> {
    let goals = sqlx::query_as::<_, Goal>(
        "SELECT * FROM goals \
         WHERE organization_id = $1 AND status = 'active' AND auto_decomposed = FALSE \
         ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list undecomposed goals")?;

    Ok(goals)
}

/// Mark a goal as decomposed. CAS on the flag so concurrent decompose
/// drivers expand a goal at most once.
pub async fn mark_decomposed(pool: &PgPool, goal_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE goals SET auto_decomposed = TRUE \
         WHERE id = $1 AND auto_decomposed = FALSE",
    )
    .bind(goal_id)
    .execute(pool)
    .await
    .context("failed to mark goal decomposed")?;

    Ok(result.rows_affected())
}
