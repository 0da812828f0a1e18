//! Database query functions for the `tasks` table: CRUD, the ranked pull
//! classes, and the compare-and-set transitions the state machine builds on.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgExecutor, PgPool};
use uuid::Uuid;

use crate::models::{Task, TaskPriority, TaskStatus, TaskType};

/// Parameters for inserting a new task row.
///
/// Exactly one of `assigned_agent_id` / `assigned_team_id` must be set;
/// the CHECK constraint rejects anything else.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub organization_id: Uuid,
    pub project_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub priority: TaskPriority,
    pub depth: i32,
    pub affected_files: Vec<String>,
    pub required_skills: Vec<String>,
    pub tags: Vec<String>,
    pub assigned_agent_id: Option<Uuid>,
    pub assigned_team_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub blocked_by: Vec<Uuid>,
    pub status: TaskStatus,
}

impl NewTask {
    /// A ready, agent-assigned standard task with everything else defaulted.
    pub fn standard(organization_id: Uuid, title: &str, agent_id: Uuid) -> Self {
        Self {
            organization_id,
            project_id: None,
            title: title.to_owned(),
            description: String::new(),
            task_type: TaskType::Standard,
            priority: TaskPriority::P3,
            depth: 0,
            affected_files: Vec::new(),
            required_skills: Vec::new(),
            tags: Vec::new(),
            assigned_agent_id: Some(agent_id),
            assigned_team_id: None,
            parent_task_id: None,
            blocked_by: Vec::new(),
            status: TaskStatus::Ready,
        }
    }
}

/// Insert a new task row. Returns the inserted task with server-generated
/// defaults (id, created_at, counters).
///
/// Accepts any executor so the distributor can insert inside a transaction.
pub async fn insert_task(executor: impl PgExecutor<'_>, new: &NewTask) -> Result<Task> {
    let task = sqlx::query_as::<_, Task>(
        "INSERT INTO tasks (organization_id, project_id, title, description, task_type, \
                            priority, depth, affected_files, required_skills, tags, \
                            assigned_agent_id, assigned_team_id, parent_task_id, blocked_by, status) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.project_id)
    .bind(&new.title)
    .bind(&new.description)
    .bind(new.task_type)
    .bind(new.priority)
    .bind(new.depth)
    .bind(&new.affected_files)
    .bind(&new.required_skills)
    .bind(&new.tags)
    .bind(new.assigned_agent_id)
    .bind(new.assigned_team_id)
    .bind(new.parent_task_id)
    .bind(&new.blocked_by)
    .bind(new.status)
    .fetch_one(executor)
    .await
    .with_context(|| format!("failed to insert task {:?}", new.title))?;

    Ok(task)
}

/// Fetch a single task by ID.
pub async fn get_task(pool: &PgPool, id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>("SELECT * FROM tasks WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .context("failed to fetch task")?;

    Ok(task)
}

/// List all subtasks of a parent, ordered by creation time.
pub async fn list_subtasks(pool: &PgPool, parent_task_id: Uuid) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE parent_task_id = $1 ORDER BY created_at ASC",
    )
    .bind(parent_task_id)
    .fetch_all(pool)
    .await
    .context("failed to list subtasks")?;

    Ok(tasks)
}

/// Whether a parent has at least one subtask and all of them are terminal
/// (completed, cancelled, or failed). Gates temporary-agent cleanup.
pub async fn all_subtasks_terminal(pool: &PgPool, parent_task_id: Uuid) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), \
                COUNT(*) FILTER (WHERE status IN ('completed', 'cancelled', 'failed')) \
         FROM tasks WHERE parent_task_id = $1",
    )
    .bind(parent_task_id)
    .fetch_one(pool)
    .await
    .context("failed to count terminal subtasks")?;

    Ok(row.0 > 0 && row.0 == row.1)
}

/// Whether a parent has at least one subtask and all of them are completed.
pub async fn all_subtasks_completed(pool: &PgPool, parent_task_id: Uuid) -> Result<bool> {
    let row: (i64, i64) = sqlx::query_as(
        "SELECT COUNT(*), COUNT(*) FILTER (WHERE status = 'completed') \
         FROM tasks WHERE parent_task_id = $1",
    )
    .bind(parent_task_id)
    .fetch_one(pool)
    .await
    .context("failed to count subtasks")?;

    Ok(row.0 > 0 && row.0 == row.1)
}

// ---------------------------------------------------------------------------
// Compare-and-set transitions
// ---------------------------------------------------------------------------

/// Atomically transition a task from one status to another.
///
/// Optimistic locking: the UPDATE's WHERE clause includes `status = $from`,
/// so the row is only updated if the current status matches. Returns the
/// number of rows affected (0 means the status did not match).
pub async fn transition_task_status(
    pool: &PgPool,
    task_id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, \
             started_at = COALESCE($2, started_at), \
             completed_at = COALESCE($3, completed_at) \
         WHERE id = $4 AND status = $5",
    )
    .bind(to)
    .bind(started_at)
    .bind(completed_at)
    .bind(task_id)
    .bind(from)
    .execute(pool)
    .await
    .context("failed to transition task status")?;

    Ok(result.rows_affected())
}

/// Atomically claim a task for an agent.
///
/// The expected status must be the one that made the task eligible for the
/// pulling class (`ready`, `pending`). On success the task is
/// `in_progress`, agent-assigned, and `started_at` is stamped. Returns the
/// number of rows affected; 0 means another agent won the race.
pub async fn claim_task(
    pool: &PgPool,
    task_id: Uuid,
    agent_id: Uuid,
    expected_status: TaskStatus,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'in_progress', \
             assigned_agent_id = $1, \
             assigned_team_id = NULL, \
             started_at = now() \
         WHERE id = $2 AND status = $3",
    )
    .bind(agent_id)
    .bind(task_id)
    .bind(expected_status)
    .execute(pool)
    .await
    .context("failed to claim task")?;

    Ok(result.rows_affected())
}

/// Release a claimed task back to the pool.
///
/// Clears the agent assignment and resets status to `pending`. The task
/// falls back to team assignment to preserve the assignment XOR; when the
/// releasing agent has no team the agent assignment is kept.
pub async fn release_task(
    pool: &PgPool,
    task_id: Uuid,
    fallback_team_id: Option<Uuid>,
) -> Result<u64> {
    let result = match fallback_team_id {
        Some(team_id) => sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', \
                 assigned_agent_id = NULL, \
                 assigned_team_id = $1, \
                 started_at = NULL \
             WHERE id = $2 AND status = 'in_progress'",
        )
        .bind(team_id)
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to release task to team")?,
        None => sqlx::query(
            "UPDATE tasks \
             SET status = 'pending', started_at = NULL \
             WHERE id = $1 AND status = 'in_progress'",
        )
        .bind(task_id)
        .execute(pool)
        .await
        .context("failed to release task")?,
    };

    Ok(result.rows_affected())
}

/// Reset a failed or blocked task to `ready` with a bumped retry counter and
/// a scheduled next attempt. CAS on both status and the current counter.
pub async fn retry_task(
    pool: &PgPool,
    task_id: Uuid,
    current_retry_count: i32,
    next_attempt_at: DateTime<Utc>,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             retry_count = retry_count + 1, \
             next_attempt_at = $1, \
             started_at = NULL, \
             error_message = NULL \
         WHERE id = $2 AND status IN ('failed', 'in_progress', 'blocked') AND retry_count = $3",
    )
    .bind(next_attempt_at)
    .bind(task_id)
    .bind(current_retry_count)
    .execute(pool)
    .await
    .context("failed to retry task")?;

    Ok(result.rows_affected())
}

/// Mark a task `blocked` with a reason. A blocked task always carries a
/// populated `error_message`.
pub async fn block_task(pool: &PgPool, task_id: Uuid, error_message: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'blocked', error_message = $1 WHERE id = $2",
    )
    .bind(error_message)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to block task")?;

    Ok(result.rows_affected())
}

/// Clear the agent assignment on a task and hand it back to a team as
/// `ready`, appending a reassignment annotation to the description.
///
/// Used by escalation level 2 (team collaboration).
pub async fn reassign_to_team(
    pool: &PgPool,
    task_id: Uuid,
    team_id: Uuid,
    annotation: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             assigned_agent_id = NULL, \
             assigned_team_id = $1, \
             description = description || E'\\n\\n' || $2, \
             started_at = NULL \
         WHERE id = $3",
    )
    .bind(team_id)
    .bind(annotation)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to reassign task to team")?;

    Ok(result.rows_affected())
}

/// Append reviewer guidance to a task's description and reset it to
/// `ready` for rework.
pub async fn rework_task(pool: &PgPool, task_id: Uuid, guidance: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'ready', \
             description = description || E'\\n\\nReviewer guidance: ' || $1, \
             started_at = NULL, \
             completed_at = NULL \
         WHERE id = $2",
    )
    .bind(guidance)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to rework task")?;

    Ok(result.rows_affected())
}

/// Force a task into a status while appending an annotation to its
/// description. Used by the escalation ladder, which moves tasks that may
/// be in any non-terminal state.
pub async fn set_status_with_annotation(
    pool: &PgPool,
    task_id: Uuid,
    status: TaskStatus,
    annotation: &str,
) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = $1, description = description || E'\\n\\n' || $2 \
         WHERE id = $3",
    )
    .bind(status)
    .bind(annotation)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to set status with annotation")?;

    Ok(result.rows_affected())
}

/// Cancel a task outright.
///
/// Parent review decisions (redirect) may cancel subtasks regardless of
/// their current status, so this bypasses the transition graph.
pub async fn cancel_task(pool: &PgPool, task_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks SET status = 'cancelled', completed_at = now() WHERE id = $1",
    )
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to cancel task")?;

    Ok(result.rows_affected())
}

/// Bump the parent review counter. Returns the new value.
pub async fn increment_review_count(pool: &PgPool, task_id: Uuid) -> Result<i32> {
    let row: (i32,) = sqlx::query_as(
        "UPDATE tasks SET review_count = review_count + 1 WHERE id = $1 RETURNING review_count",
    )
    .bind(task_id)
    .fetch_one(pool)
    .await
    .context("failed to increment review count")?;

    Ok(row.0)
}

/// Flag a task as requiring human approval and block it (escalation
/// level 5).
pub async fn require_human_approval(pool: &PgPool, task_id: Uuid, reason: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks \
         SET status = 'blocked', requires_human_approval = TRUE, error_message = $1 \
         WHERE id = $2",
    )
    .bind(reason)
    .bind(task_id)
    .execute(pool)
    .await
    .context("failed to flag task for human approval")?;

    Ok(result.rows_affected())
}

/// Promote `pending` tasks whose `blocked_by` set is fully completed to
/// `ready`. Returns the number of promoted tasks.
pub async fn promote_unblocked_tasks(pool: &PgPool, organization_id: Uuid) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE tasks t \
         SET status = 'ready' \
         WHERE t.organization_id = $1 \
           AND t.status = 'pending' \
           AND t.task_type <> 'team_epic' \
           AND t.assigned_agent_id IS NOT NULL \
           AND NOT EXISTS ( \
               SELECT 1 FROM tasks b \
               WHERE b.id = ANY(t.blocked_by) AND b.status <> 'completed' \
           )",
    )
    .bind(organization_id)
    .execute(pool)
    .await
    .context("failed to promote unblocked tasks")?;

    Ok(result.rows_affected())
}

// ---------------------------------------------------------------------------
// Pull classes
//
// Each class query embeds the file-conflict filter: a candidate is skipped
// when any other in_progress task shares an affected file. Ordering within
// a class is `priority ASC, created_at ASC` (p1 sorts first).
// ---------------------------------------------------------------------------

const NO_FILE_CONFLICT: &str = "NOT EXISTS ( \
    SELECT 1 FROM tasks o \
    WHERE o.status = 'in_progress' \
      AND o.id <> t.id \
      AND o.affected_files && t.affected_files)";

const BACKOFF_ELAPSED: &str = "(t.next_attempt_at IS NULL OR t.next_attempt_at <= now())";

/// Class 0: a `ready_for_review` parent owned by this agent.
pub async fn next_review_due(pool: &PgPool, agent_id: Uuid) -> Result<Option<Task>> {
    let task = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         WHERE t.assigned_agent_id = $1 AND t.status = 'ready_for_review' \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1",
    )
    .bind(agent_id)
    .fetch_optional(pool)
    .await
    .context("failed to query review-due tasks")?;

    Ok(task)
}

/// Class 1: a task directly assigned to this agent in `ready` or `pending`.
pub async fn next_direct(pool: &PgPool, agent_id: Uuid) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT t.* FROM tasks t \
         WHERE t.assigned_agent_id = $1 \
           AND t.status IN ('ready', 'pending') \
           AND t.task_type <> 'team_epic' \
           AND {BACKOFF_ELAPSED} \
           AND {NO_FILE_CONFLICT} \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1"
    );
    let task = sqlx::query_as::<_, Task>(&sql)
        .bind(agent_id)
        .fetch_optional(pool)
        .await
        .context("failed to query direct tasks")?;

    Ok(task)
}

/// Class 2: an unassigned `ready` task whose `affected_files` overlap a
/// task this agent completed within the lookback window.
pub async fn next_file_affinity(
    pool: &PgPool,
    agent_id: Uuid,
    organization_id: Uuid,
    window_hours: i64,
) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT t.* FROM tasks t \
         WHERE t.organization_id = $2 \
           AND t.status = 'ready' \
           AND t.assigned_agent_id IS NULL \
           AND t.task_type <> 'team_epic' \
           AND {BACKOFF_ELAPSED} \
           AND EXISTS ( \
               SELECT 1 FROM tasks done \
               WHERE done.assigned_agent_id = $1 \
                 AND done.status = 'completed' \
                 AND done.completed_at >= now() - make_interval(hours => $3::int) \
                 AND done.affected_files && t.affected_files) \
           AND {NO_FILE_CONFLICT} \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1"
    );
    let task = sqlx::query_as::<_, Task>(&sql)
        .bind(agent_id)
        .bind(organization_id)
        .bind(window_hours)
        .fetch_optional(pool)
        .await
        .context("failed to query file-affinity tasks")?;

    Ok(task)
}

/// Class 3: a `ready` task assigned to the agent's team with no individual
/// assignee, excluding team epics (those go through the distributor).
pub async fn next_team_unassigned(pool: &PgPool, team_id: Uuid) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT t.* FROM tasks t \
         WHERE t.assigned_team_id = $1 \
           AND t.assigned_agent_id IS NULL \
           AND t.status = 'ready' \
           AND t.task_type <> 'team_epic' \
           AND {BACKOFF_ELAPSED} \
           AND {NO_FILE_CONFLICT} \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1"
    );
    let task = sqlx::query_as::<_, Task>(&sql)
        .bind(team_id)
        .fetch_optional(pool)
        .await
        .context("failed to query team-unassigned tasks")?;

    Ok(task)
}

/// Class 4: a `ready` unassigned task whose `required_skills` are covered
/// by the given capability set.
pub async fn next_role_match(
    pool: &PgPool,
    organization_id: Uuid,
    capabilities: &[String],
) -> Result<Option<Task>> {
    let sql = format!(
        "SELECT t.* FROM tasks t \
         WHERE t.organization_id = $1 \
           AND t.status = 'ready' \
           AND t.assigned_agent_id IS NULL \
           AND t.task_type <> 'team_epic' \
           AND t.required_skills <> '{{}}' \
           AND t.required_skills <@ $2 \
           AND {BACKOFF_ELAPSED} \
           AND {NO_FILE_CONFLICT} \
         ORDER BY t.priority ASC, t.created_at ASC \
         LIMIT 1"
    );
    let task = sqlx::query_as::<_, Task>(&sql)
        .bind(organization_id)
        .bind(capabilities)
        .fetch_optional(pool)
        .await
        .context("failed to query role-match tasks")?;

    Ok(task)
}

/// Distinct files touched by tasks an agent completed inside the lookback
/// window (distribution file-affinity tie-break).
pub async fn recent_completed_files(
    pool: &PgPool,
    agent_id: Uuid,
    window_hours: i64,
) -> Result<Vec<String>> {
    let rows: Vec<(String,)> = sqlx::query_as(
        "SELECT DISTINCT unnest(affected_files) FROM tasks \
         WHERE assigned_agent_id = $1 \
           AND status = 'completed' \
           AND completed_at >= now() - make_interval(hours => $2::int)",
    )
    .bind(agent_id)
    .bind(window_hours)
    .fetch_all(pool)
    .await
    .context("failed to fetch recently completed files")?;

    Ok(rows.into_iter().map(|(f,)| f).collect())
}

// ---------------------------------------------------------------------------
// Scheduler queries
// ---------------------------------------------------------------------------

/// Tasks stuck `in_progress` since before the cutoff.
pub async fn list_stuck_tasks(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks WHERE status = 'in_progress' AND started_at < $1",
    )
    .bind(cutoff)
    .fetch_all(pool)
    .await
    .context("failed to list stuck tasks")?;

    Ok(tasks)
}

/// Pending team epics whose team has a manager (distribution candidates).
pub async fn list_distributable_epics(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT t.* FROM tasks t \
         JOIN teams tm ON tm.id = t.assigned_team_id \
         WHERE t.task_type = 'team_epic' \
           AND t.status = 'pending' \
           AND tm.manager_agent_id IS NOT NULL \
         ORDER BY t.priority ASC, t.created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list distributable epics")?;

    Ok(tasks)
}

/// Tasks awaiting parent review with an assigned agent (review driver).
pub async fn list_ready_for_review(pool: &PgPool) -> Result<Vec<Task>> {
    let tasks = sqlx::query_as::<_, Task>(
        "SELECT * FROM tasks \
         WHERE status = 'ready_for_review' AND assigned_agent_id IS NOT NULL \
         ORDER BY priority ASC, created_at ASC",
    )
    .fetch_all(pool)
    .await
    .context("failed to list ready-for-review tasks")?;

    Ok(tasks)
}

/// Reset every `in_progress` task in an org back to `pending`.
///
/// Emergency-stop semantics: intent is preserved, nothing is failed.
/// Returns the reset task ids.
pub async fn reset_in_progress_to_pending(
    pool: &PgPool,
    organization_id: Uuid,
) -> Result<Vec<Uuid>> {
    let rows: Vec<(Uuid,)> = sqlx::query_as(
        "UPDATE tasks \
         SET status = 'pending', started_at = NULL \
         WHERE organization_id = $1 AND status = 'in_progress' \
         RETURNING id",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to reset in-progress tasks")?;

    Ok(rows.into_iter().map(|(id,)| id).collect())
}

/// Per-status task counts for an organization (progress reporting).
#[derive(Debug, Clone, Default)]
pub struct OrgProgress {
    pub pending: i64,
    pub ready: i64,
    pub in_progress: i64,
    pub in_review: i64,
    pub ready_for_review: i64,
    pub blocked: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub completed: i64,
    pub total: i64,
}

/// Get a summary of task counts by status for an organization.
pub async fn get_org_progress(pool: &PgPool, organization_id: Uuid) -> Result<OrgProgress> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT status::text, COUNT(*) FROM tasks WHERE organization_id = $1 GROUP BY status",
    )
    .bind(organization_id)
    .fetch_all(pool)
    .await
    .context("failed to get org progress")?;

    let mut progress = OrgProgress::default();
    for (status, count) in &rows {
        match status.as_str() {
            "pending" => progress.pending = *count,
            "ready" => progress.ready = *count,
            "in_progress" => progress.in_progress = *count,
            "in_review" => progress.in_review = *count,
            "ready_for_review" => progress.ready_for_review = *count,
            "blocked" => progress.blocked = *count,
            "failed" => progress.failed = *count,
            "cancelled" => progress.cancelled = *count,
            "completed" => progress.completed = *count,
            _ => {}
        }
        progress.total += count;
    }
    Ok(progress)
}
