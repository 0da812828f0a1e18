//! The `status` command: task progress per organization.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::queries::agents;
use foreman_db::queries::organizations as orgs;
use foreman_db::queries::tasks;

pub async fn status(db: &PgPool, org_id: Option<&str>) -> Result<()> {
    let organizations = match org_id {
        Some(id) => {
            let id: Uuid = id.parse().with_context(|| format!("{id:?} is not a valid id"))?;
            let org = orgs::get_organization(db, id)
                .await?
                .with_context(|| format!("organization {id} not found"))?;
            vec![org]
        }
        None => orgs::list_organizations(db).await?,
    };

    for org in organizations {
        let progress = tasks::get_org_progress(db, org.id).await?;
        let busy = agents::count_busy_agents(db, org.id).await?;

        println!("{} ({})", org.name, org.id);
        if !org.autonomous_execution_enabled {
            println!(
                "  STOPPED: {}",
                org.emergency_stop_reason.as_deref().unwrap_or("no reason recorded")
            );
        }
        println!("  busy agents:       {busy} / {}", org.max_concurrent_agents);
        println!("  pending:           {}", progress.pending);
        println!("  ready:             {}", progress.ready);
        println!("  in progress:       {}", progress.in_progress);
        println!("  in review:         {}", progress.in_review);
        println!("  ready for review:  {}", progress.ready_for_review);
        println!("  blocked:           {}", progress.blocked);
        println!("  failed:            {}", progress.failed);
        println!("  cancelled:         {}", progress.cancelled);
        println!("  completed:         {}", progress.completed);
        println!("  total:             {}", progress.total);
        println!();
    }

    Ok(())
}
