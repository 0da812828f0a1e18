//! Selection of long-term documents for prompt injection.
//!
//! Keywords come from the task's title/description tokens plus its declared
//! skills and tags. Candidate documents are fetched by scope and keyword
//! overlap, ranked `importance DESC, created_at DESC`, capped at a
//! configurable count, then trimmed to a character budget so the total
//! prompt stays below the provider's context limit.

use anyhow::Result;
use sqlx::PgPool;
use uuid::Uuid;

use foreman_db::models::{Document, Task};
use foreman_db::queries::documents as doc_db;

/// Default cap on injected documents.
pub const DEFAULT_MAX_DOCUMENTS: i64 = 8;

/// Tokens shorter than this never become keywords.
const MIN_KEYWORD_LEN: usize = 3;

/// Common words that carry no retrieval signal.
const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "that", "this", "from", "into", "add", "fix", "use", "when",
    "should", "must", "all", "any", "are", "not", "its", "their",
];

/// Extract the keyword set for a task: lowercased alphanumeric tokens from
/// the title and description, unioned with `required_skills` and `tags`.
pub fn task_keywords(task: &Task) -> Vec<String> {
    let mut keywords: Vec<String> = Vec::new();

    let mut push = |word: String| {
        if word.len() >= MIN_KEYWORD_LEN
            && !STOPWORDS.contains(&word.as_str())
            && !keywords.contains(&word)
        {
            keywords.push(word);
        }
    };

    for text in [&task.title, &task.description] {
        for token in text.split(|c: char| !c.is_alphanumeric() && c != '_' && c != '-') {
            push(token.to_lowercase());
        }
    }

    for skill in &task.required_skills {
        push(skill.to_lowercase());
    }
    for tag in &task.tags {
        push(tag.to_lowercase());
    }

    keywords
}

/// Trim a ranked candidate list to a character budget.
///
/// Documents arrive ranked best-first. When the combined content exceeds
/// the budget, the lowest-importance documents are dropped first
/// (ties broken by dropping the oldest).
pub fn budget_documents(mut docs: Vec<Document>, max_total_chars: usize) -> Vec<Document> {
    let total = |docs: &[Document]| docs.iter().map(|d| d.content.len()).sum::<usize>();

    while docs.len() > 1 && total(&docs) > max_total_chars {
        let drop_idx = docs
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.importance
                    .cmp(&b.importance)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|(i, _)| i)
            .expect("non-empty");
        docs.remove(drop_idx);
    }

    // A single oversized document still blows the budget; drop it too.
    if docs.len() == 1 && total(&docs) > max_total_chars {
        docs.clear();
    }

    docs
}

/// Select and budget the documents to inject for a task.
///
/// `team_id`/`project_id` widen the scope filter to the agent's hierarchy;
/// the organization level is always included.
#[allow(clippy::too_many_arguments)]
pub async fn select_for_task(
    pool: &PgPool,
    organization_id: Uuid,
    team_id: Option<Uuid>,
    project_id: Option<Uuid>,
    agent_id: Uuid,
    task: &Task,
    max_documents: i64,
    max_total_chars: usize,
) -> Result<Vec<Document>> {
    let keywords = task_keywords(task);
    if keywords.is_empty() {
        return Ok(Vec::new());
    }

    let candidates = doc_db::select_relevant_documents(
        pool,
        organization_id,
        team_id,
        project_id,
        agent_id,
        &keywords,
        max_documents,
    )
    .await?;

    Ok(budget_documents(candidates, max_total_chars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use foreman_db::models::{DocumentScope, TaskPriority, TaskStatus, TaskType};

    fn make_task(title: &str, description: &str, skills: &[&str], tags: &[&str]) -> Task {
        Task {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            project_id: None,
            title: title.to_owned(),
            description: description.to_owned(),
            task_type: TaskType::Standard,
            status: TaskStatus::Ready,
            priority: TaskPriority::P3,
            depth: 0,
            affected_files: vec![],
            required_skills: skills.iter().map(|s| (*s).to_owned()).collect(),
            tags: tags.iter().map(|s| (*s).to_owned()).collect(),
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

    fn make_doc(importance: i32, content_len: usize, age_hours: i64) -> Document {
        Document {
            id: Uuid::new_v4(),
            organization_id: Uuid::new_v4(),
            scope: DocumentScope::Organization,
            scope_id: None,
            title: format!("doc-{importance}"),
            keywords: vec![],
            importance,
            content: "x".repeat(content_len),
            created_at: Utc::now() - Duration::hours(age_hours),
        }
    }

    #[test]
    fn keywords_union_title_skills_tags() {
        let task = make_task(
            "Add pagination to the search API",
            "Cursor-based, stable ordering.",
            &["rust"],
            &["backend"],
        );
        let keywords = task_keywords(&task);
        assert!(keywords.contains(&"pagination".to_owned()));
        assert!(keywords.contains(&"search".to_owned()));
        assert!(keywords.contains(&"cursor-based".to_owned()));
        assert!(keywords.contains(&"rust".to_owned()));
        assert!(keywords.contains(&"backend".to_owned()));
        // Stopwords and short tokens are excluded.
        assert!(!keywords.contains(&"the".to_owned()));
        assert!(!keywords.contains(&"to".to_owned()));
    }

    #[test]
    fn keywords_are_deduplicated() {
        let task = make_task("rust rust rust", "more rust", &["rust"], &[]);
        let keywords = task_keywords(&task);
        assert_eq!(keywords.iter().filter(|k| *k == "rust").count(), 1);
    }

    #[test]
    fn budget_keeps_everything_that_fits() {
        let docs = vec![make_doc(9, 100, 0), make_doc(5, 100, 0)];
        let kept = budget_documents(docs, 1000);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn budget_drops_lowest_importance_first() {
        let docs = vec![
            make_doc(9, 400, 0),
            make_doc(7, 400, 0),
            make_doc(3, 400, 0),
        ];
        let kept = budget_documents(docs, 900);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|d| d.importance >= 7));
    }

    #[test]
    fn budget_tie_breaks_on_age() {
        let newer = make_doc(5, 400, 1);
        let older = make_doc(5, 400, 48);
        let kept = budget_documents(vec![newer.clone(), older], 500);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].id, newer.id);
    }

    #[test]
    fn budget_drops_single_oversized_document() {
        let kept = budget_documents(vec![make_doc(10, 5000, 0)], 1000);
        assert!(kept.is_empty());
    }
}
