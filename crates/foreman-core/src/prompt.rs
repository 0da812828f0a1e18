//! Six-layer prompt synthesis for task execution, and the review-mode
//! variant used when a parent judges its subtasks.
//!
//! Layer order: organization, team, role, persona, injected knowledge,
//! task. Review mode swaps the task layer for an enumeration of children
//! plus a JSON decision contract. This module is pure string assembly; the
//! knowledge selection itself happens in [`crate::knowledge`].

use foreman_db::models::{Agent, Document, Organization, Role, Task, Team};

/// JSON contract appended to review-mode prompts.
const REVIEW_DECISION_CONTRACT: &str = r#"Respond with a single JSON object:

```json
{
  "action": "complete" | "rework" | "add_tasks" | "redirect",
  "reasoning": "why you decided this",
  "targets": ["<subtask-id>", ...],          // rework/redirect only
  "newTasks": [                              // add_tasks/redirect only
    {
      "title": "string",
      "description": "string",
      "affectedFiles": ["path", ...]
    }
  ]
}
```

- "complete": every subtask met the acceptance criteria; the parent is done.
- "rework": the listed subtasks need another pass; explain what to fix in reasoning.
- "add_tasks": the decomposition missed work; create the listed new tasks.
- "redirect": cancel the listed subtasks and replace them with the new tasks."#;

/// A fully composed prompt ready to feed the provider on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComposedPrompt {
    pub text: String,
}

impl ComposedPrompt {
    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Everything the composer needs for the first five layers.
#[derive(Debug, Clone)]
pub struct AgentContext<'a> {
    pub organization: &'a Organization,
    pub team: Option<&'a Team>,
    pub role: &'a Role,
    pub agent: &'a Agent,
    pub documents: &'a [Document],
}

/// Compose the execution prompt for a task.
///
/// `dependencies` are the tasks named in the task's `blocked_by` set, shown
/// so the agent knows what it builds on.
pub fn compose_task_prompt(
    ctx: &AgentContext<'_>,
    task: &Task,
    dependencies: &[Task],
) -> ComposedPrompt {
    let mut out = String::new();

    push_shared_layers(&mut out, ctx);

    // Layer 6: task context.
    out.push_str("# Task\n\n");
    out.push_str(&format!("Title: {}\n", task.title));
    out.push_str(&format!("Priority: {}\n", task.priority));
    out.push_str(&format!("Type: {}\n\n", task.task_type));
    out.push_str(&task.description);
    out.push('\n');

    if !task.affected_files.is_empty() {
        out.push_str("\nAffected files:\n");
        for file in &task.affected_files {
            out.push_str(&format!("  - {file}\n"));
        }
    }

    if !task.required_skills.is_empty() {
        out.push_str("\nRequired skills: ");
        out.push_str(&task.required_skills.join(", "));
        out.push('\n');
    }

    if !dependencies.is_empty() {
        out.push_str("\nThis task builds on:\n");
        for dep in dependencies {
            out.push_str(&format!("  - {} ({})\n", dep.title, dep.status));
        }
    }

    ComposedPrompt { text: out }
}

/// Compose the review-mode prompt for a `ready_for_review` parent.
///
/// Replaces the task layer with an enumeration of the children (status and
/// a one-line summary each) and the JSON decision contract.
pub fn compose_review_prompt(
    ctx: &AgentContext<'_>,
    parent: &Task,
    children: &[Task],
) -> ComposedPrompt {
    let mut out = String::new();

    push_shared_layers(&mut out, ctx);

    out.push_str("# Review\n\n");
    out.push_str(&format!(
        "You are reviewing the completed subtasks of: {}\n\n{}\n\n",
        parent.title, parent.description
    ));

    out.push_str("Subtasks:\n");
    for child in children {
        out.push_str(&format!(
            "  - [{}] {} ({}): {}\n",
            child.status,
            child.title,
            child.id,
            summarize(&child.description)
        ));
    }
    out.push('\n');

    out.push_str(REVIEW_DECISION_CONTRACT);
    out.push('\n');

    ComposedPrompt { text: out }
}

/// Layers 1-5, shared between execution and review prompts.
fn push_shared_layers(out: &mut String, ctx: &AgentContext<'_>) {
    // Layer 1: organization context.
    out.push_str(&format!("# Organization: {}\n\n", ctx.organization.name));
    if !ctx.organization.mission.is_empty() {
        out.push_str(&ctx.organization.mission);
        out.push_str("\n\n");
    }

    // Layer 2: team context.
    if let Some(team) = ctx.team {
        out.push_str(&format!("# Team: {}\n\n", team.name));
        if !team.charter.is_empty() {
            out.push_str(&team.charter);
            out.push_str("\n\n");
        }
    }

    // Layer 3: role prompt.
    out.push_str(&format!("# Role: {}\n\n", ctx.role.name));
    if !ctx.role.system_prompt.is_empty() {
        out.push_str(&ctx.role.system_prompt);
        out.push_str("\n\n");
    }
    if !ctx.role.capabilities.is_empty() {
        out.push_str("Capabilities: ");
        out.push_str(&ctx.role.capabilities.join(", "));
        out.push_str("\n\n");
    }

    // Layer 4: agent persona (optional).
    if let Some(persona) = ctx.agent.persona.as_deref() {
        if !persona.is_empty() {
            out.push_str("# Persona\n\n");
            out.push_str(persona);
            out.push_str("\n\n");
        }
    }

    // Layer 5: injected knowledge.
    if !ctx.documents.is_empty() {
        out.push_str("# Relevant knowledge\n\n");
        for doc in ctx.documents {
            out.push_str(&format!("## {}\n\n{}\n\n", doc.title, doc.content));
        }
    }
}

/// First line of a description, truncated for the children enumeration.
fn summarize(description: &str) -> String {
    let first_line = description.lines().next().unwrap_or("");
    if first_line.len() <= 120 {
        first_line.to_owned()
    } else {
        let mut end = 120;
        while end > 0 && !first_line.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &first_line[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use foreman_db::models::{
        AgentLifecycle, AgentStatus, DocumentScope, TaskPriority, TaskStatus, TaskType,
    };
    use uuid::Uuid;

    fn fixtures() -> (Organization, Team, Role, Agent) {
        let org_id = Uuid::new_v4();
        let org = Organization {
            id: org_id,
            name: "acme".to_owned(),
            mission: "Ship robust tools.".to_owned(),
            autonomous_execution_enabled: true,
            emergency_stop_reason: None,
            max_concurrent_agents: 10,
            daily_budget_cents: None,
            monthly_budget_cents: None,
            alert_percent: 80,
            stop_percent: 100,
            created_at: Utc::now(),
        };
        let team = Team {
            id: Uuid::new_v4(),
            organization_id: org_id,
            name: "backend".to_owned(),
            charter: "Own the API surface.".to_owned(),
            manager_agent_id: None,
            parent_team_id: None,
            created_at: Utc::now(),
        };
        let role = Role {
            id: Uuid::new_v4(),
            organization_id: org_id,
            name: "rust-dev".to_owned(),
            capabilities: vec!["rust".to_owned(), "sql".to_owned()],
            available_for_temporary_agent: true,
            system_prompt: "You write idiomatic Rust.".to_owned(),
            created_at: Utc::now(),
        };
        let agent = Agent {
            id: Uuid::new_v4(),
            organization_id: org_id,
            team_id: Some(team.id),
            role_id: role.id,
            name: "worker-1".to_owned(),
            status: AgentStatus::Idle,
            lifecycle: AgentLifecycle::Permanent,
            depth: 0,
            manager_id: None,
            created_by_agent_id: None,
            current_task_id: None,
            persona: Some("Prefers small commits.".to_owned()),
            deleted_at: None,
            created_at: Utc::now(),
        };
        (org, team, role, agent)
    }

    fn make_task(org_id: Uuid, title: &str) -> Task {
        Task {
            id: Uuid::new_v4(),
            organization_id: org_id,
            project_id: None,
            title: title.to_owned(),
            description: "Do the thing.".to_owned(),
            task_type: TaskType::Standard,
            status: TaskStatus::Ready,
            priority: TaskPriority::P2,
            depth: 0,
            affected_files: vec!["src/lib.rs".to_owned()],
            required_skills: vec!["rust".to_owned()],
            tags: vec![],
            assigned_agent_id: Some(Uuid::new_v4()),
            assigned_team_id: None,
            parent_task_id: None,
            retry_count: 0,
            review_count: 0,
            requires_human_approval: false,
            blocked_by: vec![],
            next_attempt_at: None,
            error_message: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    fn make_doc(org_id: Uuid, title: &str) -> Document {
        Document {
            id: Uuid::new_v4(),
            organization_id: org_id,
            scope: DocumentScope::Organization,
            scope_id: None,
            title: title.to_owned(),
            keywords: vec!["rust".to_owned()],
            importance: 7,
            content: "Always run the tests.".to_owned(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn layers_appear_in_order() {
        let (org, team, role, agent) = fixtures();
        let docs = vec![make_doc(org.id, "conventions")];
        let task = make_task(org.id, "add pagination");

        let ctx = AgentContext {
            organization: &org,
            team: Some(&team),
            role: &role,
            agent: &agent,
            documents: &docs,
        };
        let prompt = compose_task_prompt(&ctx, &task, &[]);
        let text = &prompt.text;

        let positions: Vec<usize> = [
            "# Organization: acme",
            "# Team: backend",
            "# Role: rust-dev",
            "# Persona",
            "# Relevant knowledge",
            "# Task",
        ]
        .iter()
        .map(|needle| text.find(needle).unwrap_or_else(|| panic!("missing {needle}")))
        .collect();

        assert!(positions.windows(2).all(|w| w[0] < w[1]), "layers out of order");
        assert!(text.contains("add pagination"));
        assert!(text.contains("src/lib.rs"));
    }

    #[test]
    fn optional_layers_are_skipped() {
        let (org, _team, role, mut agent) = fixtures();
        agent.persona = None;
        let task = make_task(org.id, "no frills");

        let ctx = AgentContext {
            organization: &org,
            team: None,
            role: &role,
            agent: &agent,
            documents: &[],
        };
        let prompt = compose_task_prompt(&ctx, &task, &[]);
        assert!(!prompt.text.contains("# Team"));
        assert!(!prompt.text.contains("# Persona"));
        assert!(!prompt.text.contains("# Relevant knowledge"));
    }

    #[test]
    fn dependencies_are_listed() {
        let (org, team, role, agent) = fixtures();
        let task = make_task(org.id, "downstream");
        let mut dep = make_task(org.id, "upstream");
        dep.status = TaskStatus::Completed;

        let ctx = AgentContext {
            organization: &org,
            team: Some(&team),
            role: &role,
            agent: &agent,
            documents: &[],
        };
        let prompt = compose_task_prompt(&ctx, &task, &[dep]);
        assert!(prompt.text.contains("builds on"));
        assert!(prompt.text.contains("upstream (completed)"));
    }

    #[test]
    fn review_prompt_replaces_task_layer() {
        let (org, team, role, agent) = fixtures();
        let parent = make_task(org.id, "the epic");
        let mut child = make_task(org.id, "subtask one");
        child.status = TaskStatus::Completed;

        let ctx = AgentContext {
            organization: &org,
            team: Some(&team),
            role: &role,
            agent: &agent,
            documents: &[],
        };
        let prompt = compose_review_prompt(&ctx, &parent, &[child.clone()]);
        assert!(prompt.text.contains("# Review"));
        assert!(!prompt.text.contains("# Task\n"));
        assert!(prompt.text.contains(&child.id.to_string()));
        assert!(prompt.text.contains("[completed] subtask one"));
        assert!(prompt.text.contains("\"action\""));
        assert!(prompt.text.contains("redirect"));
    }

    #[test]
    fn summarize_truncates_long_first_line() {
        let long = "x".repeat(300);
        let s = summarize(&long);
        assert!(s.len() <= 124);
        assert!(s.ends_with("..."));
        assert_eq!(summarize("short one\nsecond line"), "short one");
    }
}
