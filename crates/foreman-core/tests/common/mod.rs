//! Shared fixtures for the core integration tests.
//!
//! Not every test binary uses every helper.
#![allow(dead_code)]

use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Agent, Organization, Project, Role, Task, TaskStatus, Team};
use foreman_db::queries::agents::{self, NewAgent};
use foreman_db::queries::organizations as orgs;
use foreman_db::queries::projects;
use foreman_db::queries::roles;
use foreman_db::queries::tasks::{self, NewTask};
use foreman_db::queries::teams;

/// A database with one org, team, role, and agent wired together.
pub struct Fixture {
    pub pool: PgPool,
    pub db_name: String,
    pub org: Organization,
    pub team: Team,
    pub role: Role,
    pub agent: Agent,
}

impl Fixture {
    pub async fn create() -> Self {
        let (pool, db_name) = foreman_test_utils::create_test_db().await;

        let org = orgs::insert_organization(&pool, "test-org", "Ship things.")
            .await
            .expect("insert org");
        let team = teams::insert_team(&pool, org.id, "core", "Own the core.", None)
            .await
            .expect("insert team");
        let role = roles::insert_role(
            &pool,
            org.id,
            "rust-dev",
            &["rust".to_owned(), "sql".to_owned()],
            true,
            "You write idiomatic Rust.",
        )
        .await
        .expect("insert role");
        let agent = agents::insert_agent(
            &pool,
            &NewAgent::permanent(org.id, team.id, role.id, "worker-1"),
        )
        .await
        .expect("insert agent");

        Self {
            pool,
            db_name,
            org,
            team,
            role,
            agent,
        }
    }

    /// Add another permanent agent to the fixture team.
    pub async fn add_agent(&self, name: &str) -> Agent {
        agents::insert_agent(
            &self.pool,
            &NewAgent::permanent(self.org.id, self.team.id, self.role.id, name),
        )
        .await
        .expect("insert agent")
    }

    /// Insert a ready task assigned to the fixture agent.
    pub async fn ready_task(&self, title: &str) -> Task {
        tasks::insert_task(
            &self.pool,
            &NewTask::standard(self.org.id, title, self.agent.id),
        )
        .await
        .expect("insert task")
    }

    /// Insert a ready task with explicit fields.
    pub async fn task(&self, new: &NewTask) -> Task {
        tasks::insert_task(&self.pool, new).await.expect("insert task")
    }

    /// Insert a project rooted at an existing git repository.
    pub async fn project(&self, name: &str, working_directory: &str) -> Project {
        projects::insert_project(&self.pool, self.org.id, name, working_directory, "main")
            .await
            .expect("insert project")
    }

    pub async fn teardown(self) {
        self.pool.close().await;
        foreman_test_utils::drop_test_db(&self.db_name).await;
    }
}

/// A ready, team-assigned task (no individual assignee).
pub fn team_task(org_id: Uuid, team_id: Uuid, title: &str) -> NewTask {
    NewTask {
        assigned_agent_id: None,
        assigned_team_id: Some(team_id),
        ..NewTask::standard(org_id, title, Uuid::nil())
    }
}

/// Fetch a task's current status.
pub async fn status_of(pool: &PgPool, task_id: Uuid) -> TaskStatus {
    tasks::get_task(pool, task_id)
        .await
        .expect("get task")
        .expect("task exists")
        .status
}

/// Create a temporary git repository with an initial commit on `main`.
/// Returns the TempDir (keep alive) and the repo path.
pub fn create_temp_repo() -> (tempfile::TempDir, std::path::PathBuf) {
    use std::process::Command;

    let dir = tempfile::TempDir::new().expect("create temp dir");
    let repo_path = dir.path().join("project");
    std::fs::create_dir(&repo_path).unwrap();

    let run = |args: &[&str]| {
        let output = Command::new("git")
            .args(args)
            .current_dir(&repo_path)
            .output()
            .unwrap_or_else(|e| panic!("git {} failed: {e}", args.join(" ")));
        assert!(
            output.status.success(),
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr)
        );
    };

    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@foreman.dev"]);
    run(&["config", "user.name", "Foreman Test"]);
    std::fs::write(repo_path.join("README.md"), "# Test\n").unwrap();
    run(&["add", "."]);
    run(&["commit", "-m", "Initial commit"]);

    (dir, repo_path)
}

/// Write an executable shell script and return its path.
#[cfg(unix)]
pub fn write_script(dir: &std::path::Path, name: &str, body: &str) -> std::path::PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
