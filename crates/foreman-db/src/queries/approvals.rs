//! Database query functions for the `approval_requests` table.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{ApprovalKind, ApprovalRequest, ApprovalStatus};

/// Parameters for opening a new approval request.
#[derive(Debug, Clone)]
pub struct NewApprovalRequest {
    pub organization_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub kind: ApprovalKind,
    pub reason: String,
    pub metadata: Value,
}

/// Insert a new approval request in `pending` status.
pub async fn insert_approval_request(
    pool: &PgPool,
    new: &NewApprovalRequest,
) -> Result<ApprovalRequest> {
    let request = sqlx::query_as::<_, ApprovalRequest>(
        "INSERT INTO approval_requests (organization_id, task_id, agent_id, kind, reason, metadata) \
         VALUES ($1, $2, $3, $4, $5, $6) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.task_id)
    .bind(new.agent_id)
    .bind(new.kind)
    .bind(&new.reason)
    .bind(&new.metadata)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert approval request for task {}", new.task_id))?;

    Ok(request)
}

/// Fetch an approval request by ID.
pub async fn get_approval_request(pool: &PgPool, id: Uuid) -> Result<Option<ApprovalRequest>> {
    let request =
        sqlx::query_as::<_, ApprovalRequest>("SELECT * FROM approval_requests WHERE id = $1")
            .bind(id)
            .fetch_optional(pool)
            .await
            .context("failed to fetch approval request")?;

    Ok(request)
}

/// List pending approval requests for an organization, oldest first.
pub async fn list_pending(pool: &PgPool, organization_id: Uuid) -> Result<Vec<ApprovalRequest>> {
    let requests = sqlx::query_as::<_, ApprovalRequest>(
        "SELECT * FROM approval_requests \
         WHERE organization_id = $1 AND status = 'pending' \
         ORDER BY created_at ASC",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to list pending approval requests")?;

    Ok(requests)
}

/// Resolve a pending approval request. CAS on `pending` so a request is
/// resolved at most once. Returns the number of rows affected.
pub async fn resolve(pool: &PgPool, id: Uuid, status: ApprovalStatus) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE approval_requests \
         SET status = $1, resolved_at = now() \
         WHERE id = $2 AND status = 'pending'",
    )
    .bind(status)
    .bind(id)
    .execute(pool)
    .await
    .context("failed to resolve approval request")?;

    Ok(result.rows_affected())
}
