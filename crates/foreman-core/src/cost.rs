//! Token and cost estimation for provider invocations, plus the org-level
//! budget guard.

use foreman_db::models::Organization;

/// Pre-execution token estimate derived from prompt sizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenEstimate {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenEstimate {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Estimate tokens for a prompt/system pair: roughly four characters per
/// token for input, and half the input again for output.
pub fn estimate_tokens(prompt: &str, system: &str) -> TokenEstimate {
    let chars = (prompt.len() + system.len()) as u64;
    let input_tokens = chars.div_ceil(4);
    let output_tokens = input_tokens.div_ceil(2);
    TokenEstimate {
        input_tokens,
        output_tokens,
    }
}

/// Exact cost in cents from real token counts, rounded to 6 decimal cents.
pub fn cost_cents(tokens: u64, rate_per_million_cents: f64) -> f64 {
    let raw = (tokens as f64 / 1_000_000.0) * rate_per_million_cents;
    (raw * 1_000_000.0).round() / 1_000_000.0
}

/// Estimated cost of an invocation given separate input/output rates.
pub fn estimate_cost_cents(
    estimate: &TokenEstimate,
    input_rate_per_million_cents: f64,
    output_rate_per_million_cents: f64,
) -> f64 {
    cost_cents(estimate.input_tokens, input_rate_per_million_cents)
        + cost_cents(estimate.output_tokens, output_rate_per_million_cents)
}

/// Verdict from the budget guard for a proposed spend.
#[derive(Debug, Clone, PartialEq)]
pub enum BudgetVerdict {
    /// Within budget.
    Ok,
    /// Past the alert threshold; proceed but warn.
    Alert { spent_percent: f64 },
    /// Past the stop threshold; autonomous execution must pause org-wide.
    Stop { spent_percent: f64 },
}

/// Check a proposed additional spend against an org's daily or monthly cap.
///
/// `spent_cents` is the amount already consumed in the window. When the org
/// carries no cap for the window the verdict is always `Ok`.
pub fn check_budget(
    org: &Organization,
    cap_cents: Option<i64>,
    spent_cents: f64,
    proposed_cents: f64,
) -> BudgetVerdict {
    let Some(cap) = cap_cents else {
        return BudgetVerdict::Ok;
    };
    if cap <= 0 {
        return BudgetVerdict::Ok;
    }

    let projected = spent_cents + proposed_cents;
    let spent_percent = projected / cap as f64 * 100.0;

    if spent_percent >= org.stop_percent as f64 {
        BudgetVerdict::Stop { spent_percent }
    } else if spent_percent >= org.alert_percent as f64 {
        BudgetVerdict::Alert { spent_percent }
    } else {
        BudgetVerdict::Ok
    }
}
