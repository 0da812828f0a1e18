//! Database query functions for the `projects` table.

use anyhow::{Context, Result};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::Project;

/// Insert a new project. Accepts any executor so goal decomposition can
/// create projects and their tasks in one transaction.
pub async fn insert_project(
    executor: impl PgExecutor<'_>,
    organization_id: Uuid,
    name: &str,
    working_directory: &str,
    integration_branch: &str,
) -> Result<Project> {
    let project = sqlx::query_as::<_, Project>(
        "INSERT INTO projects (organization_id, name, working_directory, integration_branch) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(organization_id)
    .bind(name)
    .bind(working_directory)
    .bind(integration_branch)
    .fetch_one(executor)
    .await
    .with_context(|| format!("failed to insert project {name:?}"))?;

    Ok(project)
}

/// Fetch a project by ID.
pub async fn get_project(pool: &PgPool, id: Uuid) -> Result<Option<Project>> {
    let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch project")?;

    Ok(project)
}

/// List all projects for an organization.
pub async fn list_projects(pool: &PgPool, organization_id: Uuid) -> Result<Vec<Project>> {
    let projects = sqlx::query_as::<_, Project>(
        "SELECT * FROM projects WHERE organization_id = $1 ORDER BY name",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list projects")?;

    Ok(projects)
}
