//! Typed runtime configuration for the core components.
//!
//! Every key the orchestrator recognizes lives here with its default;
//! unknown keys in the config file are ignored by serde. The CLI merges
//! the on-disk TOML with `FOREMAN_*` environment overrides and hands the
//! result to the scheduler.

use serde::{Deserialize, Serialize};

/// Top-level configuration. All sections are optional in the file; missing
/// sections take their defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub scheduler: SchedulerConfig,
    pub orchestrator: OrchestratorConfig,
    pub pool: PoolConfig,
    pub workspace: WorkspaceConfig,
    pub limits: LimitsConfig,
    pub budget: BudgetConfig,
    pub escalation: EscalationConfig,
    pub provider: ProviderConfig,
    pub quality_gate: QualityGateConfig,
}

/// Quality-gate hooks run inside the worktree after provider output.
///
/// Each entry is a command line (split on whitespace); all must exit 0 for
/// the gate to pass. An empty list passes trivially.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    pub commands: Vec<String>,
    /// Wall-clock limit per hook.
    pub timeout_secs: u64,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            commands: Vec::new(),
            timeout_secs: 600,
        }
    }
}

/// Driver cadences (§scheduler.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub decompose_period_secs: u64,
    pub execute_period_secs: u64,
    pub review_period_secs: u64,
    pub team_distribute_period_secs: u64,
    pub stuck_sweep_period_secs: u64,
    pub progress_report_period_secs: u64,
    /// Tasks in progress for longer than this are swept to `blocked`.
    pub stuck_threshold_hours: i64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            decompose_period_secs: 60,
            execute_period_secs: 120,
            review_period_secs: 180,
            team_distribute_period_secs: 30,
            stuck_sweep_period_secs: 1800,
            progress_report_period_secs: 1800,
            stuck_threshold_hours: 2,
        }
    }
}

/// Cycle behavior (§orchestrator.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Quality-gate retry budget.
    pub max_retry: i32,
    /// Parent review budget before a forced quality escalation.
    pub max_review_count: i32,
    /// Temporary-agent depth ceiling. Values above 1 are clamped.
    pub max_temp_depth: i32,
    /// Token estimate above which a task is considered complex.
    pub complexity_token_threshold: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_retry: 3,
            max_review_count: 3,
            max_temp_depth: 1,
            complexity_token_threshold: 20_000,
        }
    }
}

impl OrchestratorConfig {
    /// The effective temporary-agent depth ceiling.
    ///
    /// The ladder is capped at 1 regardless of configuration; a higher
    /// configured value is clamped with a warning at load time.
    pub fn effective_temp_depth(&self) -> i32 {
        self.max_temp_depth.clamp(0, 1)
    }
}

/// Task pool tuning (§pool.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// File-affinity lookback window.
    pub file_affinity_window_hours: i64,
    /// Bounded retry attempts for the claim CAS loop.
    pub claim_max_attempts: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            file_affinity_window_hours: 24,
            claim_max_attempts: 3,
        }
    }
}

/// Worktree lifecycle (§workspace.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Worktrees older than this are removed by the orphan sweep.
    pub orphan_sweep_hours: i64,
    /// Working directory for projects the goal decomposer creates without
    /// naming one.
    pub default_working_directory: String,
    /// Integration branch worktrees are checked out from.
    pub integration_branch: String,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            orphan_sweep_hours: 24,
            default_working_directory: ".".to_owned(),
            integration_branch: "main".to_owned(),
        }
    }
}

/// Concurrency limits (§limits.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    pub max_concurrent_agents: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_concurrent_agents: 10,
        }
    }
}

/// Budget thresholds (§budget.*). `None` disables the corresponding cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub daily_cents: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub monthly_cents: Option<i64>,
    pub alert_percent: u8,
    pub stop_percent: u8,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_cents: None,
            monthly_cents: None,
            alert_percent: 80,
            stop_percent: 100,
        }
    }
}

/// Escalation timing (§escalation.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// How long a task may sit at level 3 or 4 before promotion.
    pub level_timeout_hours: i64,
}

impl Default for EscalationConfig {
    fn default() -> Self {
        Self {
            level_timeout_hours: 24,
        }
    }
}

/// LLM command invocation (provider.*).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// The external command to invoke.
    pub command: String,
    /// Arguments passed before the prompt is fed on stdin.
    pub args: Vec<String>,
    /// Wall-clock limit for one invocation.
    pub timeout_secs: u64,
    /// Cost rate in cents per million input tokens.
    pub input_rate_per_million_cents: f64,
    /// Cost rate in cents per million output tokens.
    pub output_rate_per_million_cents: f64,
    /// Context limit used when budgeting knowledge injection.
    pub context_limit_chars: usize,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            command: "claude".to_owned(),
            args: vec!["-p".to_owned()],
            timeout_secs: 900,
            input_rate_per_million_cents: 300.0,
            output_rate_per_million_cents: 1500.0,
            context_limit_chars: 400_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.scheduler.decompose_period_secs, 60);
        assert_eq!(config.scheduler.execute_period_secs, 120);
        assert_eq!(config.scheduler.review_period_secs, 180);
        assert_eq!(config.scheduler.stuck_threshold_hours, 2);
        assert_eq!(config.orchestrator.max_retry, 3);
        assert_eq!(config.orchestrator.max_review_count, 3);
        assert_eq!(config.pool.file_affinity_window_hours, 24);
        assert_eq!(config.workspace.orphan_sweep_hours, 24);
        assert_eq!(config.limits.max_concurrent_agents, 10);
        assert_eq!(config.budget.alert_percent, 80);
        assert_eq!(config.budget.stop_percent, 100);
        assert_eq!(config.escalation.level_timeout_hours, 24);
    }

    #[test]
    fn temp_depth_is_clamped_to_one() {
        let config = OrchestratorConfig {
            max_temp_depth: 3,
            ..Default::default()
        };
        assert_eq!(config.effective_temp_depth(), 1);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let toml = r#"
            [scheduler]
            decompose_period_secs = 10
            not_a_real_key = "whatever"

            [shiny_new_section]
            x = 1
        "#;
        let config: CoreConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.scheduler.decompose_period_secs, 10);
        assert_eq!(config.scheduler.execute_period_secs, 120);
    }
}
