mod admin;
mod config;
mod run_cmd;
mod status_cmd;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use foreman_db::pool;

use config::ForemanConfig;

#[derive(Parser)]
#[command(name = "foreman", about = "Autonomous multi-agent work orchestrator")]
struct Cli {
    /// Database URL (overrides FOREMAN_DATABASE_URL env var)
    #[arg(long, global = true)]
    database_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Write a foreman config file (no database required)
    Init {
        /// PostgreSQL connection URL
        #[arg(long, default_value = "postgresql://localhost:5432/foreman")]
        db_url: String,
        /// Overwrite existing config file
        #[arg(long)]
        force: bool,
    },
    /// Initialize the foreman database (creates it and runs migrations)
    DbInit,
    /// Organization management
    Org {
        #[command(subcommand)]
        command: OrgCommands,
    },
    /// Team management
    Team {
        #[command(subcommand)]
        command: TeamCommands,
    },
    /// Role management
    Role {
        #[command(subcommand)]
        command: RoleCommands,
    },
    /// Agent management
    Agent {
        #[command(subcommand)]
        command: AgentCommands,
    },
    /// Project management
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Goal management
    Goal {
        #[command(subcommand)]
        command: GoalCommands,
    },
    /// Human approval queue
    Approval {
        #[command(subcommand)]
        command: ApprovalCommands,
    },
    /// Run the scheduler until interrupted
    Run,
    /// Emergency-stop an organization
    Stop {
        /// Organization ID
        org_id: String,
        /// Reason recorded on the organization
        #[arg(long, default_value = "operator stop")]
        reason: String,
    },
    /// Resume a stopped organization
    Resume {
        /// Organization ID
        org_id: String,
    },
    /// Show task progress for an organization (omit to list all orgs)
    Status {
        /// Organization ID
        org_id: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum OrgCommands {
    /// Create an organization
    Create {
        name: String,
        /// Mission statement (prompt layer 1)
        #[arg(long, default_value = "")]
        mission: String,
    },
    /// List organizations
    List,
}

#[derive(Subcommand)]
pub enum TeamCommands {
    /// Create a team
    Create {
        /// Organization ID
        org_id: String,
        name: String,
        /// Team charter (prompt layer 2)
        #[arg(long, default_value = "")]
        charter: String,
        /// Parent team ID
        #[arg(long)]
        parent: Option<String>,
    },
    /// Designate a team's manager agent
    SetManager {
        team_id: String,
        agent_id: String,
    },
    /// List teams in an organization
    List { org_id: String },
}

#[derive(Subcommand)]
pub enum RoleCommands {
    /// Create a role
    Create {
        /// Organization ID
        org_id: String,
        name: String,
        /// Comma-separated capability list
        #[arg(long, default_value = "")]
        capabilities: String,
        /// Allow temporary agents to use this role
        #[arg(long)]
        temporary: bool,
        /// System-prompt text (prompt layer 3)
        #[arg(long, default_value = "")]
        system_prompt: String,
    },
    /// List roles in an organization
    List { org_id: String },
}

#[derive(Subcommand)]
pub enum AgentCommands {
    /// Create a permanent agent
    Create {
        /// Organization ID
        org_id: String,
        /// Team ID
        team_id: String,
        /// Role ID
        role_id: String,
        name: String,
        /// Persona text (prompt layer 4)
        #[arg(long)]
        persona: Option<String>,
    },
    /// List agents in a team
    List { team_id: String },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Create a project
    Create {
        /// Organization ID
        org_id: String,
        name: String,
        /// VCS root directory
        #[arg(long)]
        working_directory: String,
        /// Integration branch
        #[arg(long, default_value = "main")]
        branch: String,
    },
    /// List projects in an organization
    List { org_id: String },
}

#[derive(Subcommand)]
pub enum GoalCommands {
    /// Create a goal (the decompose driver expands it)
    Create {
        /// Organization ID
        org_id: String,
        title: String,
        #[arg(long, default_value = "")]
        description: String,
    },
    /// List goals in an organization
    List { org_id: String },
}

#[derive(Subcommand)]
pub enum ApprovalCommands {
    /// List pending approval requests
    List { org_id: String },
    /// Approve a request (the task returns to ready)
    Approve { approval_id: String },
    /// Reject a request (the task is cancelled)
    Reject { approval_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    // Init needs no database.
    if let Commands::Init { db_url, force } = &cli.command {
        return admin::init_config(db_url, *force);
    }

    let config = ForemanConfig::resolve(cli.database_url.as_deref())?;

    if let Commands::DbInit = &cli.command {
        pool::ensure_database_exists(&config.db_config).await?;
        let db = pool::create_pool(&config.db_config).await?;
        pool::run_migrations(&db, pool::default_migrations_path()).await?;
        println!("database initialized at {}", config.db_config.database_url);
        return Ok(());
    }

    let db = pool::create_pool(&config.db_config)
        .await
        .context("failed to connect to database (run `foreman db-init` first?)")?;

    match cli.command {
        Commands::Init { .. } | Commands::DbInit => unreachable!("handled above"),
        Commands::Org { command } => admin::org(&db, command).await,
        Commands::Team { command } => admin::team(&db, command).await,
        Commands::Role { command } => admin::role(&db, command).await,
        Commands::Agent { command } => admin::agent(&db, command).await,
        Commands::Project { command } => admin::project(&db, command).await,
        Commands::Goal { command } => admin::goal(&db, command).await,
        Commands::Approval { command } => admin::approval(&db, command).await,
        Commands::Run => run_cmd::run(db, config.core).await,
        Commands::Stop { org_id, reason } => run_cmd::stop(db, config.core, &org_id, &reason).await,
        Commands::Resume { org_id } => run_cmd::resume(db, config.core, &org_id).await,
        Commands::Status { org_id } => status_cmd::status(&db, org_id.as_deref()).await,
    }
}
