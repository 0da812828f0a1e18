//! Database query functions for the `task_events` audit log.

use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::TaskEvent;

/// Parameters for inserting a new task event row.
#[derive(Debug, Clone)]
pub struct NewTaskEvent {
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub kind: String,
    pub payload: Value,
}

/// Insert a new task event row. Returns the inserted row with
/// server-generated defaults (id, recorded_at).
pub async fn insert_task_event(pool: &PgPool, new: &NewTaskEvent) -> Result<TaskEvent> {
    let event = sqlx::query_as::<_, TaskEvent>(
        "INSERT INTO task_events (task_id, agent_id, kind, payload) \
         VALUES ($1, $2, $3, $4) \
         RETURNING *",
    )
    .bind(new.task_id)
    .bind(new.agent_id)
    .bind(&new.kind)
    .bind(&new.payload)
    .fetch_one(pool)
    .await
    .with_context(|| {
        format!(
            "failed to insert task event {} for task {}",
            new.kind, new.task_id
        )
    })?;

    Ok(event)
}

/// All events for a task, oldest first.
pub async fn list_events_for_task(pool: &PgPool, task_id: Uuid) -> Result<Vec<TaskEvent>> {
    let events = sqlx::query_as::<_, TaskEvent>(
        "SELECT * FROM task_events WHERE task_id = $1 ORDER BY recorded_at ASC",
    )
    .bind(task_id)
    .fetch_all(pool)
    .await
    .with_context(|| format!("failed to list task events for task {task_id}"))?;

    Ok(events)
}

/// Sum of estimated provider spend (cents) recorded for an organization
/// since a point in time. Reads the `estimated_cents` field of
/// `provider_invoked` events; the budget guard compares this against the
/// org's daily/monthly caps.
pub async fn sum_estimated_cents_since(
    pool: &PgPool,
    organization_id: Uuid,
    since: chrono::DateTime<chrono::Utc>,
) -> Result<f64> {
    let row: (Option<f64>,) = sqlx::query_as(
        "SELECT SUM((te.payload->>'estimated_cents')::float8) \
         FROM task_events te \
         JOIN tasks t ON t.id = te.task_id \
         WHERE t.organization_id = $1 \
           AND te.kind = 'provider_invoked' \
           AND te.payload ? 'estimated_cents' \
           AND te.recorded_at >= $2",
    )
    .bind(organization_id)
    .bind(since)
    .fetch_one(pool)
    .await
    .context("failed to sum estimated spend")?;

    Ok(row.0.unwrap_or(0.0))
}

/// The most recent `escalated` event per task, with its recorded level.
///
/// Drives level-timeout promotion: the escalator promotes tasks whose
/// latest escalation has sat unresolved past the configured window.
pub async fn latest_escalations(
    pool: &PgPool,
) -> Result<Vec<(Uuid, i32, chrono::DateTime<chrono::Utc>)>> {
    let rows: Vec<(Uuid, i32, chrono::DateTime<chrono::Utc>)> = sqlx::query_as(
        "SELECT DISTINCT ON (task_id) task_id, (payload->>'level')::int, recorded_at \
         FROM task_events \
         WHERE kind = 'escalated' AND payload ? 'level' \
         ORDER BY task_id, recorded_at DESC",
    )
    .fetch_all(pool)
    .await
    .context("failed to query latest escalations")?;

    Ok(rows)
}

/// Event counts by kind across an organization (progress reporting).
pub async fn count_events_by_kind(
    pool: &PgPool,
    organization_id: Uuid,
) -> Result<Vec<(String, i64)>> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT te.kind, COUNT(*) FROM task_events te \
         JOIN tasks t ON t.id = te.task_id \
         WHERE t.organization_id = $1 \
         GROUP BY te.kind \
         ORDER BY te.kind",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to count task events")?;

    Ok(rows)
}
