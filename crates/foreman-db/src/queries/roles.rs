//! Database query functions for the `roles` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::Role;

/// Insert a new role.
pub async fn insert_role(
    pool: &PgPool,
    organization_id: Uuid,
    name: &str,
    capabilities: &[String],
    available_for_temporary_agent: bool,
    system_prompt: &str,
) -> Result<Role> {
    let role = sqlx::query_as::<_, Role>(
        "INSERT INTO roles (organization_id, name, capabilities, \
                            available_for_temporary_agent, system_prompt) \
         VALUES ($1, $2, $3, $4, $5) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(capabilities)
    .bind(available_for_temporary_agent)
    .bind(system_prompt)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert role {name:?}"))?;

    Ok(role)
}

/// Fetch a role by ID.
pub async fn get_role(pool: &PgPool, id: Uuid) -> Result<Option<Role>> {
    let role = sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch role")?;

    Ok(role)
}

/// List all roles for an organization.
pub async fn list_roles(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Role>> {
    let roles =
        sqlx::query_as::<_, Role>("SELECT * FROM roles WHERE organization_id = $1 ORDER BY name")
            .bind(organization_id)
            .fetch_all(pool)
            .await
            .context("failed to list roles")?;

    Ok(roles)
}

/// List roles eligible for temporary-agent delegation.
pub async fn list_delegatable_roles(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Role>> {
    let roles = sqlx::query_as::<_, Role>(
        "SELECT * FROM roles \
         WHERE organization_id = $1 AND available_for_temporary_agent = TRUE \
         ORDER BY name",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list delegatable roles")?;

    Ok(roles)
}
