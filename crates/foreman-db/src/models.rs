use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Reviewing,
    Paused,
    Blocked,
    Error,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Working => "working",
            Self::Reviewing => "reviewing",
            Self::Paused => "paused",
            Self::Blocked => "blocked",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(Self::Idle),
            "working" => Ok(Self::Working),
            "reviewing" => Ok(Self::Reviewing),
            "paused" => Ok(Self::Paused),
            "blocked" => Ok(Self::Blocked),
            "error" => Ok(Self::Error),
            other => Err(EnumParseError::new("agent status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Lifecycle class of an agent.
///
/// Temporary agents are spawned by the delegator on behalf of a parent task
/// and soft-deleted when the parent's subtasks reach a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AgentLifecycle {
    Permanent,
    Temporary,
}

impl fmt::Display for AgentLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Permanent => "permanent",
            Self::Temporary => "temporary",
        };
        f.write_str(s)
    }
}

impl FromStr for AgentLifecycle {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "permanent" => Ok(Self::Permanent),
            "temporary" => Ok(Self::Temporary),
            other => Err(EnumParseError::new("agent lifecycle", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    InReview,
    ReadyForReview,
    Blocked,
    Failed,
    Cancelled,
    Completed,
}

impl TaskStatus {
    /// Whether this status is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::InProgress => "in_progress",
            Self::InReview => "in_review",
            Self::ReadyForReview => "ready_for_review",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "ready" => Ok(Self::Ready),
            "in_progress" => Ok(Self::InProgress),
            "in_review" => Ok(Self::InReview),
            "ready_for_review" => Ok(Self::ReadyForReview),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            "completed" => Ok(Self::Completed),
            other => Err(EnumParseError::new("task status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Type of a task.
///
/// `team_epic` tasks are assigned to a team and must be split by the team's
/// manager before any individual agent can execute them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Standard,
    Epic,
    Bug,
    Spike,
    TeamEpic,
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Standard => "standard",
            Self::Epic => "epic",
            Self::Bug => "bug",
            Self::Spike => "spike",
            Self::TeamEpic => "team_epic",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskType {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(Self::Standard),
            "epic" => Ok(Self::Epic),
            "bug" => Ok(Self::Bug),
            "spike" => Ok(Self::Spike),
            "team_epic" => Ok(Self::TeamEpic),
            other => Err(EnumParseError::new("task type", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Priority of a task. `P1` is the most urgent.
///
/// The derived `Ord` follows declaration order, so `P1 < P2 < P3 < P4`
/// matches the SQL sort on the stored text values.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type,
)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    P1,
    P2,
    P3,
    P4,
}

impl fmt::Display for TaskPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::P1 => "p1",
            Self::P2 => "p2",
            Self::P3 => "p3",
            Self::P4 => "p4",
        };
        f.write_str(s)
    }
}

impl FromStr for TaskPriority {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p1" => Ok(Self::P1),
            "p2" => Ok(Self::P2),
            "p3" => Ok(Self::P3),
            "p4" => Ok(Self::P4),
            other => Err(EnumParseError::new("task priority", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl FromStr for GoalStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(EnumParseError::new("goal status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a pull request bound to a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PullRequestStatus {
    Open,
    Approved,
    ChangesRequested,
    Merged,
    Closed,
}

impl fmt::Display for PullRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Approved => "approved",
            Self::ChangesRequested => "changes_requested",
            Self::Merged => "merged",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for PullRequestStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(Self::Open),
            "approved" => Ok(Self::Approved),
            "changes_requested" => Ok(Self::ChangesRequested),
            "merged" => Ok(Self::Merged),
            "closed" => Ok(Self::Closed),
            other => Err(EnumParseError::new("pull request status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Kind of a human approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalKind {
    Escalation,
    CostOverride,
    Quality,
    Architectural,
}

impl fmt::Display for ApprovalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Escalation => "escalation",
            Self::CostOverride => "cost_override",
            Self::Quality => "quality",
            Self::Architectural => "architectural",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalKind {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "escalation" => Ok(Self::Escalation),
            "cost_override" => Ok(Self::CostOverride),
            "quality" => Ok(Self::Quality),
            "architectural" => Ok(Self::Architectural),
            other => Err(EnumParseError::new("approval kind", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Status of a human approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        };
        f.write_str(s)
    }
}

impl FromStr for ApprovalStatus {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            other => Err(EnumParseError::new("approval status", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Visibility scope of a knowledge document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum DocumentScope {
    Organization,
    Team,
    Project,
    Agent,
}

impl fmt::Display for DocumentScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Organization => "organization",
            Self::Team => "team",
            Self::Project => "project",
            Self::Agent => "agent",
        };
        f.write_str(s)
    }
}

impl FromStr for DocumentScope {
    type Err = EnumParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "organization" => Ok(Self::Organization),
            "team" => Ok(Self::Team),
            "project" => Ok(Self::Project),
            "agent" => Ok(Self::Agent),
            other => Err(EnumParseError::new("document scope", other)),
        }
    }
}

// ---------------------------------------------------------------------------

/// Error returned when parsing an invalid enum string.
#[derive(Debug, Clone)]
pub struct EnumParseError {
    kind: &'static str,
    value: String,
}

impl EnumParseError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_owned(),
        }
    }
}

impl fmt::Display for EnumParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid {}: {:?}", self.kind, self.value)
    }
}

impl std::error::Error for EnumParseError {}

// ---------------------------------------------------------------------------
// Row structs
// ---------------------------------------------------------------------------

/// An organization -- the root of the team hierarchy and the unit that
/// carries autonomy and budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Organization {
    pub id: Uuid,
    pub name: String,
    pub mission: String,
    /// Kill-switch: when false, every scheduler driver skips this org.
    pub autonomous_execution_enabled: bool,
    pub emergency_stop_reason: Option<String>,
    pub max_concurrent_agents: i32,
    pub daily_budget_cents: Option<i64>,
    pub monthly_budget_cents: Option<i64>,
    pub alert_percent: i32,
    pub stop_percent: i32,
    pub created_at: DateTime<Utc>,
}

/// A team of agents within an organization.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Team {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    /// Team charter and collaboration rules, injected as prompt layer 2.
    pub charter: String,
    pub manager_agent_id: Option<Uuid>,
    pub parent_team_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

/// A named capability set with a system-prompt fragment.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Role {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub capabilities: Vec<String>,
    pub available_for_temporary_agent: bool,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
}

/// A logical worker that claims and executes tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Agent {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub team_id: Option<Uuid>,
    pub role_id: Uuid,
    pub name: String,
    pub status: AgentStatus,
    pub lifecycle: AgentLifecycle,
    /// 0 for permanent agents, 1 for temporary agents. Never deeper.
    pub depth: i32,
    pub manager_id: Option<Uuid>,
    pub created_by_agent_id: Option<Uuid>,
    pub current_task_id: Option<Uuid>,
    pub persona: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    /// Whether this agent may spawn temporary specialists.
    pub fn may_delegate(&self) -> bool {
        self.lifecycle == AgentLifecycle::Permanent && self.depth == 0
    }
}

/// A project groups tasks and owns the VCS root worktrees are created from.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub name: String,
    pub working_directory: String,
    pub integration_branch: String,
    pub created_at: DateTime<Utc>,
}

/// A human-authored goal, decomposed into projects and tasks.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Goal {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub title: String,
    pub description: String,
    pub status: GoalStatus,
    pub auto_decomposed: bool,
    pub target_date: Option<DateTime<Utc>>,
    pub key_results: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A unit of work.
///
/// Exactly one of `assigned_agent_id` / `assigned_team_id` is non-null at
/// any time (enforced by a CHECK constraint and revalidated in the state
/// machine).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Task {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub project_id: Option<Uuid>,
    pub title: String,
    pub description: String,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub priority: TaskPriority,
    pub depth: i32,
    pub affected_files: Vec<String>,
    pub required_skills: Vec<String>,
    pub tags: Vec<String>,
    pub assigned_agent_id: Option<Uuid>,
    pub assigned_team_id: Option<Uuid>,
    pub parent_task_id: Option<Uuid>,
    pub retry_count: i32,
    pub review_count: i32,
    pub requires_human_approval: bool,
    pub blocked_by: Vec<Uuid>,
    /// Earliest time a retried task may be claimed again (backoff).
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Binds a task to its review artifact in the VCS host.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskPullRequest {
    pub id: Uuid,
    pub task_id: Uuid,
    pub pr_number: i64,
    pub branch: String,
    pub status: PullRequestStatus,
    pub created_at: DateTime<Utc>,
    pub merged_at: Option<DateTime<Utc>>,
}

/// A request surfaced to humans by the escalator or budget guard.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApprovalRequest {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub kind: ApprovalKind,
    pub reason: String,
    pub status: ApprovalStatus,
    pub metadata: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

/// Long-term memory injected into prompts by the knowledge selector.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Document {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub scope: DocumentScope,
    /// Team/project/agent the document is scoped to; null for org scope.
    pub scope_id: Option<Uuid>,
    pub title: String,
    pub keywords: Vec<String>,
    pub importance: i32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// An audit-log entry recorded at cycle milestones.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TaskEvent {
    pub id: i64,
    pub task_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub kind: String,
    pub payload: serde_json::Value,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
