//! Pull-request lifecycle seam for the VCS host.
//!
//! Worktree and branch plumbing lives in [`crate::workspace`]; this trait
//! covers the hosted side: opening a pull request for a task branch,
//! polling its state, submitting reviews, and merging. The orchestrator
//! only ever talks to a `dyn VcsHost`, so tests and offline runs use
//! [`InMemoryVcsHost`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;

use foreman_db::models::PullRequestStatus;

use crate::runner::{ProcessRequest, ProcessRunner};

/// Parameters for opening a pull request.
#[derive(Debug, Clone)]
pub struct PullRequestSpec {
    pub title: String,
    pub body: String,
    /// The task's feature branch.
    pub branch: String,
    /// The integration branch to merge into.
    pub base: String,
}

/// A pull request as seen by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequestInfo {
    pub number: i64,
    pub branch: String,
    pub status: PullRequestStatus,
}

/// A review decision submitted on a pull request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approve,
    ChangesRequested,
}

/// The pull-request lifecycle API of the VCS host.
#[async_trait]
pub trait VcsHost: Send + Sync {
    fn name(&self) -> &str;

    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequestInfo>;

    async fn get_pull_request(&self, number: i64) -> Result<Option<PullRequestInfo>>;

    async fn submit_review(
        &self,
        number: i64,
        verdict: ReviewVerdict,
        comment: &str,
    ) -> Result<()>;

    async fn merge(&self, number: i64) -> Result<()>;
}

const _: () = {
    fn _assert_object_safe(_: &dyn VcsHost) {}
};

// ---------------------------------------------------------------------------
// Command-backed host
// ---------------------------------------------------------------------------

/// A host driven through an external CLI (e.g. `gh`).
///
/// Subcommand conventions follow the common forge CLIs: `pr create`,
/// `pr view`, `pr review`, `pr merge`. The create call must print the new
/// pull request number as the last token of its output.
#[derive(Debug, Clone)]
pub struct CliVcsHost {
    command: String,
    project_root: std::path::PathBuf,
    runner: ProcessRunner,
}

impl CliVcsHost {
    pub fn new(
        command: impl Into<String>,
        project_root: impl Into<std::path::PathBuf>,
        runner: ProcessRunner,
    ) -> Self {
        Self {
            command: command.into(),
            project_root: project_root.into(),
            runner,
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<String> {
        let request = ProcessRequest {
            command: self.command.clone(),
            args,
            stdin: None,
            cwd: Some(self.project_root.clone()),
            timeout: std::time::Duration::from_secs(60),
        };
        let output = self.runner.run(&request).await?;
        if !output.success() {
            bail!(
                "{} exited with {:?}: {}",
                self.command,
                output.exit_code,
                output.stderr.trim()
            );
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl VcsHost for CliVcsHost {
    fn name(&self) -> &str {
        "cli"
    }

    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequestInfo> {
        let stdout = self
            .run(vec![
                "pr".into(),
                "create".into(),
                "--head".into(),
                spec.branch.clone(),
                "--base".into(),
                spec.base.clone(),
                "--title".into(),
                spec.title.clone(),
                "--body".into(),
                spec.body.clone(),
            ])
            .await
            .context("failed to create pull request")?;

        let number = stdout
            .split_whitespace()
            .last()
            .and_then(|tok| tok.trim_start_matches('#').parse::<i64>().ok())
            .with_context(|| format!("could not parse pull request number from {stdout:?}"))?;

        Ok(PullRequestInfo {
            number,
            branch: spec.branch.clone(),
            status: PullRequestStatus::Open,
        })
    }

    async fn get_pull_request(&self, number: i64) -> Result<Option<PullRequestInfo>> {
        let stdout = match self
            .run(vec![
                "pr".into(),
                "view".into(),
                number.to_string(),
                "--json".into(),
                "state,headRefName".into(),
            ])
            .await
        {
            Ok(out) => out,
            Err(_) => return Ok(None),
        };

        let v: serde_json::Value =
            serde_json::from_str(stdout.trim()).context("pr view returned invalid JSON")?;
        let state = v["state"].as_str().unwrap_or("open").to_ascii_lowercase();
        let status = match state.as_str() {
            "merged" => PullRequestStatus::Merged,
            "closed" => PullRequestStatus::Closed,
            _ => PullRequestStatus::Open,
        };

        Ok(Some(PullRequestInfo {
            number,
            branch: v["headRefName"].as_str().unwrap_or_default().to_owned(),
            status,
        }))
    }

    async fn submit_review(
        &self,
        number: i64,
        verdict: ReviewVerdict,
        comment: &str,
    ) -> Result<()> {
        let flag = match verdict {
            ReviewVerdict::Approve => "--approve",
            ReviewVerdict::ChangesRequested => "--request-changes",
        };
        self.run(vec![
            "pr".into(),
            "review".into(),
            number.to_string(),
            flag.into(),
            "--body".into(),
            comment.into(),
        ])
        .await
        .context("failed to submit review")?;
        Ok(())
    }

    async fn merge(&self, number: i64) -> Result<()> {
        self.run(vec![
            "pr".into(),
            "merge".into(),
            number.to_string(),
            "--squash".into(),
        ])
        .await
        .context("failed to merge pull request")?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// In-memory host
// ---------------------------------------------------------------------------

/// A host that tracks pull requests in memory. Used by tests and by local
/// runs without a forge.
#[derive(Debug, Default)]
pub struct InMemoryVcsHost {
    next_number: AtomicI64,
    requests: Mutex<HashMap<i64, PullRequestInfo>>,
}

impl InMemoryVcsHost {
    pub fn new() -> Self {
        Self {
            next_number: AtomicI64::new(1),
            requests: Mutex::new(HashMap::new()),
        }
    }

    /// Flip a pull request to merged out-of-band, as a human or CI would.
    pub fn mark_merged(&self, number: i64) {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(pr) = requests.get_mut(&number) {
            pr.status = PullRequestStatus::Merged;
        }
    }
}

#[async_trait]
impl VcsHost for InMemoryVcsHost {
    fn name(&self) -> &str {
        "in-memory"
    }

    async fn create_pull_request(&self, spec: &PullRequestSpec) -> Result<PullRequestInfo> {
        let number = self.next_number.fetch_add(1, Ordering::SeqCst);
        let info = PullRequestInfo {
            number,
            branch: spec.branch.clone(),
            status: PullRequestStatus::Open,
        };
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        requests.insert(number, info.clone());
        Ok(info)
    }

    async fn get_pull_request(&self, number: i64) -> Result<Option<PullRequestInfo>> {
        let requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        Ok(requests.get(&number).cloned())
    }

    async fn submit_review(
        &self,
        number: i64,
        verdict: ReviewVerdict,
        _comment: &str,
    ) -> Result<()> {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let pr = requests
            .get_mut(&number)
            .with_context(|| format!("pull request {number} not found"))?;
        pr.status = match verdict {
            ReviewVerdict::Approve => PullRequestStatus::Approved,
            ReviewVerdict::ChangesRequested => PullRequestStatus::ChangesRequested,
        };
        Ok(())
    }

    async fn merge(&self, number: i64) -> Result<()> {
        let mut requests = self.requests.lock().unwrap_or_else(|e| e.into_inner());
        let pr = requests
            .get_mut(&number)
            .with_context(|| format!("pull request {number} not found"))?;
        pr.status = PullRequestStatus::Merged;
        Ok(())
    }
}
