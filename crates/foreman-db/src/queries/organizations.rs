//! Database query functions for the `organizations` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Organization;

/// Insert a new organization with default configuration.
pub async fn insert_organization(pool: &PgPool, name: &str, mission: &str) -> Result<Organization> {
    let org = sqlx::query_as::<_, Organization>(
        "INSERT INTO organizations (name, mission) VALUES ($1, $2) RETURNING *",
    )
    .bind(name)
    .bind(mission)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert organization {name:?}"))?;

    Ok(org)
}

/// Fetch an organization by ID.
pub async fn get_organization(pool: &PgPool, id: Uuid) -> Result<Option<Organization>> {
    let org = sqlx::query_as::<_, Organization>("SELECT * FROM organizations WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch organization")?;

    Ok(org)
}

/// List all organizations, ordered by name.
pub async fn list_organizations(pool: &PgPool) -> Result<Vec<Organization>> {
    let orgs = sqlx::query_as::<_, Organization>("SELECT * FROM organizations ORDER BY name ASC")
        .fetch_all(pool)
        .await
        .context("failed to list organizations")?;

    Ok(orgs)
}

/// Disable autonomous execution for an organization (emergency stop or
/// budget stop). CAS on the flag so a concurrent stop is reported as a
/// no-op rather than overwriting the original reason.
pub async fn disable_autonomy(pool: &PgPool, id: Uuid, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE organizations \
         SET autonomous_execution_enabled = FALSE, emergency_stop_reason = $1 \
         WHERE id = $2 AND autonomous_execution_enabled = TRUE",
    )
    .bind(reason)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to disable autonomy")?;

    Ok(result.rows_affected())
}

/// Re-enable autonomous execution and clear the stop reason.
pub async fn enable_autonomy(pool: &PgPool, id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE organizations \
         SET autonomous_execution_enabled = TRUE, emergency_stop_reason = NULL \
         WHERE id = $1",
    )
    .bind(id)
    .execute(pool)
    .await
    .context("failed to enable autonomy")?;

    Ok(result.rows_affected())
}

/// Update the concurrency cap.
pub async fn set_max_concurrent_agents(pool: &PgPool, id: Uuid, max: i32) -> Result<u64> {
    let result = sqlx::query("UPDATE organizations SET max_concurrent_agents = $1 WHERE id = $2")
        .bind(max)
        .bind(id)
        .execute(pool)
        .await
        .context("failed to set max concurrent agents")?;

    Ok(result.rows_affected())
}
