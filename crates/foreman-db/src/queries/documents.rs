//! Database query functions for the `documents` table.

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::{Document, DocumentScope};

/// Parameters for inserting a new document.
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub organization_id: Uuid,
    pub scope: DocumentScope,
    pub scope_id: Option<Uuid>,
    pub title: String,
    pub keywords: Vec<String>,
    pub importance: i32,
    pub content: String,
}

/// Insert a new document.
pub async fn insert_document(pool: &PgPool, new: &NewDocument) -> Result<Document> {
    let doc = sqlx::query_as::<_, Document>(
        "INSERT INTO documents (organization_id, scope, scope_id, title, keywords, importance, content) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         RETURNING *",
    )
    .bind(new.organization_id)
    .bind(new.scope)
    .bind(new.scope_id)
    .bind(&new.title)
    .bind(&new.keywords)
    .bind(new.importance)
    .bind(&new.content)
    .fetch_one(pool)
    .await
    .with_context(|| format!("failed to insert document {:?}", new.title))?;

    Ok(doc)
}

/// Select documents visible from an agent's scope hierarchy whose keywords
/// overlap the given set, ranked `importance DESC, created_at DESC`.
///
/// The hierarchy is: the organization itself, plus whichever of
/// team/project/agent ids are supplied. `limit` caps the result (the
/// knowledge selector budgets further by prompt size).
pub async fn select_relevant_documents(
    pool: &PgPool,
    organization_id: Uuid,
    team_id: Option<Uuid>,
    project_id: Option<Uuid>,
    agent_id: Uuid,
    keywords: &[String],
    limit: i64,
) -> Result<Vec<Document>> {
    let docs = sqlx::query_as::<_, Document>(
        "SELECT * FROM documents \
         WHERE organization_id = $1 \
           AND keywords && $5 \
           AND ( \
               scope = 'organization' \
               OR (scope = 'team' AND scope_id = $2) \
               OR (scope = 'project' AND scope_id = $3) \
               OR (scope = 'agent' AND scope_id = $4) \
           ) \
         ORDER BY importance DESC, created_at DESC \
         LIMIT $6",
    )
    .bind(organization_id)
    .bind(team_id)
    .bind(project_id)
    .bind(agent_id)
    .bind(keywords)
    .bind(limit)
    .fetch_all(pool)
    .await
    .context("failed to select relevant documents")?;

    Ok(docs)
}
