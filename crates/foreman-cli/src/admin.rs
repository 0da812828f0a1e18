//! Admin subcommands: create and list the entities the orchestrator works
//! over, and resolve the human approval queue.

use anyhow::{bail, Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_core::state::TaskStateMachine;
use foreman_db::models::{ApprovalStatus, TaskStatus};
use foreman_db::queries::agents::{self, NewAgent};
use foreman_db::queries::approvals;
use foreman_db::queries::goals;
use foreman_db::queries::organizations as orgs;
use foreman_db::queries::projects;
use foreman_db::queries::roles;
use foreman_db::queries::tasks;
use foreman_db::queries::teams;

use crate::config::{self, ConfigFile, DatabaseSection};
use crate::{
    AgentCommands, ApprovalCommands, GoalCommands, OrgCommands, ProjectCommands, RoleCommands,
    TeamCommands,
};

pub fn init_config(db_url: &str, force: bool) -> Result<()> {
    let path = config::config_path();
    if path.exists() && !force {
        bail!(
            "config file already exists at {} (use --force to overwrite)",
            path.display()
        );
    }

    let file = ConfigFile {
        database: DatabaseSection {
            url: db_url.to_owned(),
        },
        ..Default::default()
    };
    config::save_config(&file)?;
    println!("wrote {}", path.display());
    Ok(())
}

fn parse_id(s: &str) -> Result<Uuid> {
    s.parse::<Uuid>()
        .with_context(|| format!("{s:?} is not a valid id"))
}

fn parse_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_owned)
        .collect()
}

pub async fn org(db: &PgPool, command: OrgCommands) -> Result<()> {
    match command {
        OrgCommands::Create { name, mission } => {
            let org = orgs::insert_organization(db, &name, &mission).await?;
            println!("created organization {} ({})", org.name, org.id);
        }
        OrgCommands::List => {
            for org in orgs::list_organizations(db).await? {
                println!(
                    "{}  {}  autonomous={}",
                    org.id, org.name, org.autonomous_execution_enabled
                );
            }
        }
    }
    Ok(())
}

pub async fn team(db: &PgPool, command: TeamCommands) -> Result<()> {
    match command {
        TeamCommands::Create {
            org_id,
            name,
            charter,
            parent,
        } => {
            let parent = parent.as_deref().map(parse_id).transpose()?;
            let team = teams::insert_team(db, parse_id(&org_id)?, &name, &charter, parent).await?;
            println!("created team {} ({})", team.name, team.id);
        }
        TeamCommands::SetManager { team_id, agent_id } => {
            let rows = teams::set_manager(db, parse_id(&team_id)?, parse_id(&agent_id)?).await?;
            if rows == 0 {
                bail!("team {team_id} not found");
            }
            println!("manager set");
        }
        TeamCommands::List { org_id } => {
            for team in teams::list_teams(db, parse_id(&org_id)?).await? {
                println!(
                    "{}  {}  manager={}",
                    team.id,
                    team.name,
                    team.manager_agent_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_owned())
                );
            }
        }
    }
    Ok(())
}

pub async fn role(db: &PgPool, command: RoleCommands) -> Result<()> {
    match command {
        RoleCommands::Create {
            org_id,
            name,
            capabilities,
            temporary,
            system_prompt,
        } => {
            let role = roles::insert_role(
                db,
                parse_id(&org_id)?,
                &name,
                &parse_list(&capabilities),
                temporary,
                &system_prompt,
            )
            .await?;
            println!("created role {} ({})", role.name, role.id);
        }
        RoleCommands::List { org_id } => {
            for role in roles::list_roles(db, parse_id(&org_id)?).await? {
                println!(
                    "{}  {}  capabilities=[{}]  temporary={}",
                    role.id,
                    role.name,
                    role.capabilities.join(", "),
                    role.available_for_temporary_agent
                );
            }
        }
    }
    Ok(())
}

pub async fn agent(db: &PgPool, command: AgentCommands) -> Result<()> {
    match command {
        AgentCommands::Create {
            org_id,
            team_id,
            role_id,
            name,
            persona,
        } => {
            let mut new = NewAgent::permanent(
                parse_id(&org_id)?,
                parse_id(&team_id)?,
                parse_id(&role_id)?,
                &name,
            );
            new.persona = persona;
            let agent = agents::insert_agent(db, &new).await?;
            println!("created agent {} ({})", agent.name, agent.id);
        }
        AgentCommands::List { team_id } => {
            for agent in agents::list_team_agents(db, parse_id(&team_id)?).await? {
                println!(
                    "{}  {}  {}  {}  depth={}",
                    agent.id, agent.name, agent.status, agent.lifecycle, agent.depth
                );
            }
        }
    }
    Ok(())
}

pub async fn project(db: &PgPool, command: ProjectCommands) -> Result<()> {
    match command {
        ProjectCommands::Create {
            org_id,
            name,
            working_directory,
            branch,
        } => {
            let project = projects::insert_project(
                db,
                parse_id(&org_id)?,
                &name,
                &working_directory,
                &branch,
            )
            .await?;
            println!("created project {} ({})", project.name, project.id);
        }
        ProjectCommands::List { org_id } => {
            for project in projects::list_projects(db, parse_id(&org_id)?).await? {
                println!(
                    "{}  {}  {}  base={}",
                    project.id, project.name, project.working_directory, project.integration_branch
                );
            }
        }
    }
    Ok(())
}

pub async fn goal(db: &PgPool, command: GoalCommands) -> Result<()> {
    match command {
        GoalCommands::Create {
            org_id,
            title,
            description,
        } => {
            let goal = goals::insert_goal(db, parse_id(&org_id)?, &title, &description).await?;
            println!("created goal {} ({})", goal.title, goal.id);
        }
        GoalCommands::List { org_id } => {
            for goal in goals::list_undecomposed_goals(db, parse_id(&org_id)?).await? {
                println!("{}  {}  decomposed={}", goal.id, goal.title, goal.auto_decomposed);
            }
        }
    }
    Ok(())
}

pub async fn approval(db: &PgPool, command: ApprovalCommands) -> Result<()> {
    match command {
        ApprovalCommands::List { org_id } => {
            for req in approvals::list_pending(db, parse_id(&org_id)?).await? {
                println!(
                    "{}  kind={}  task={}  {}",
                    req.id, req.kind, req.task_id, req.reason
                );
            }
        }
        ApprovalCommands::Approve { approval_id } => {
            resolve(db, &approval_id, ApprovalStatus::Approved).await?;
            println!("approved; task returned to ready");
        }
        ApprovalCommands::Reject { approval_id } => {
            resolve(db, &approval_id, ApprovalStatus::Rejected).await?;
            println!("rejected; task cancelled");
        }
    }
    Ok(())
}

/// Resolve an approval and apply the operator decision to its task:
/// approve puts the blocked task back to `ready`, reject cancels it.
async fn resolve(db: &PgPool, approval_id: &str, status: ApprovalStatus) -> Result<()> {
    let id = parse_id(approval_id)?;
    let request = approvals::get_approval_request(db, id)
        .await?
        .with_context(|| format!("approval request {approval_id} not found"))?;

    let rows = approvals::resolve(db, id, status).await?;
    if rows == 0 {
        bail!("approval request {approval_id} was already resolved");
    }

    let task = tasks::get_task(db, request.task_id)
        .await?
        .with_context(|| format!("task {} not found", request.task_id))?;

    if task.status == TaskStatus::Blocked {
        let to = match status {
            ApprovalStatus::Approved => TaskStatus::Ready,
            _ => TaskStatus::Cancelled,
        };
        TaskStateMachine::transition(db, task.id, TaskStatus::Blocked, to).await?;
    }

    Ok(())
}
