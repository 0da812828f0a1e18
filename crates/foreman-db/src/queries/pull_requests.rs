//! Database query functions for the `task_pull_requests` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{PullRequestStatus, TaskPullRequest};

/// Bind a freshly created pull request to a task.
pub async fn insert_task_pull_request(
    pool: &PgPool,
    task_id: Uuid,
    pr_number: i64,
    branch: &str,
) -> Result<TaskPullRequest> {
    let pr = sqlx::query_as::<_, TaskPullRequest>(
        "INSERT INTO task_pull_requests (task_id, pr_number, branch) \
         VALUES ($1, $2, $3) \
         RETURNING *",
    )
    .bind(task_id)
    .bind(pr_number)
    .bind(branch)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert pull request for task {task_id}"))?;

    Ok(pr)
}

/// Fetch the most recent pull request bound to a task.
pub async fn get_latest_for_task(pool: &PgPool, task_id: Uuid) -> Result<Option<TaskPullRequest>> {
    let pr = sqlx::query_as::<_, TaskPullRequest>(
        "SELECT * FROM task_pull_requests \
         WHERE task_id = $1 \
         ORDER BY created_at DESC \
         LIMIT 1",
    )
    .bind(task_id)
    .fetch_optional(pool)
    .await
    .context("failed to fetch pull request for task")?;

    Ok(pr)
}

/// Update a pull request's status, stamping `merged_at` when it merges.
pub async fn update_status(pool: &PgPool, id: Uuid, status: PullRequestStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE task_pull_requests \
         SET status = $1, \
             merged_at = CASE WHEN $1 = 'merged' THEN now() ELSE merged_at END \
         WHERE id = $2",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to update pull request status")?;

    Ok(result.rows_affected())
}

/// List open pull requests across an organization (merge-watch sweep).
pub async fn list_open_for_org(pool: &PgPool, organization_id: Uuid) -> Result<Vec<TaskPullRequest>> {
    let prs = sqlx::query_as::<_, TaskPullRequest>(
        "SELECT pr.* FROM task_pull_requests pr \
         JOIN tasks t ON t.id = pr.task_id \
         WHERE t.organization_id = $1 AND pr.status = 'open' \
         ORDER BY pr.created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list open pull requests")?;

    Ok(prs)
}
