//! Tool-call retry classification and budget/circuit-breaker bookkeeping
//! (SPEC_FULL §4.4 steps 8-9).

use std::collections::HashMap;
use std::time::Duration;

const GLOBAL_RETRY_BUDGET: u32 = 8;
const PER_SIGNATURE_RETRY_BUDGET: u32 = 3;
const AUTO_REPLAY_BASE_DELAY_MS: u64 = 300;
const AUTO_REPLAY_MAX_DELAY_MS: u64 = 2_000;
pub(crate) const AUTO_REPLAY_MAX_EXTRA_ATTEMPTS: u32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryAction {
    /// Retry in-place up to 2 extra times with exponential delay.
    AutoReplay,
    /// Return the failure to the model so it plans afresh.
    LlmReplan,
    /// Propagate the error; not retryable.
    FailFast,
}

/// Whether a tool is side-effecting — `E_CLIENT_TIMEOUT` is classified
/// differently depending on this (SPEC_FULL §4.4 step 8).
pub fn classify_tool_failure(code: &str, side_effecting: bool) -> RetryAction {
    match code {
        "E_BUSY" | "E_BRIDGE_DISCONNECTED" => RetryAction::AutoReplay,
        "E_CLIENT_TIMEOUT" if !side_effecting => RetryAction::AutoReplay,
        "E_CLIENT_TIMEOUT" if side_effecting => RetryAction::LlmReplan,
        "E_TIMEOUT" | "E_NO_TAB" | "E_VERIFY_FAILED" => RetryAction::LlmReplan,
        _ => RetryAction::FailFast,
    }
}

pub fn auto_replay_delay(attempt: u32) -> Duration {
    let ms = AUTO_REPLAY_BASE_DELAY_MS.saturating_mul(1u64 << attempt.min(8));
    Duration::from_millis(ms.min(AUTO_REPLAY_MAX_DELAY_MS))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitOutcome {
    Proceed,
    Open,
}

/// Tracks retryable tool failures for one run: a global cap of 8 and a
/// per-signature (tool+code+target) cap of 3.
pub struct RetryBudget {
    global_failures: u32,
    per_signature: HashMap<String, u32>,
}

impl Default for RetryBudget {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryBudget {
    pub fn new() -> Self {
        Self {
            global_failures: 0,
            per_signature: HashMap::new(),
        }
    }

    pub fn auto_replay_attempts_remaining(&self, signature: &str) -> u32 {
        let used = self.per_signature.get(signature).copied().unwrap_or(0);
        AUTO_REPLAY_MAX_EXTRA_ATTEMPTS.saturating_sub(used)
    }

    /// Record one retryable failure against `signature`, returning whether
    /// the run's retry budget still has room or the circuit should open.
    pub fn record_failure(&mut self, signature: &str) -> CircuitOutcome {
        self.global_failures += 1;
        let count = self.per_signature.entry(signature.to_string()).or_insert(0);
        *count += 1;

        if self.global_failures > GLOBAL_RETRY_BUDGET || *count > PER_SIGNATURE_RETRY_BUDGET {
            CircuitOutcome::Open
        } else {
            CircuitOutcome::Proceed
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn busy_and_disconnected_auto_replay() {
        assert_eq!(classify_tool_failure("E_BUSY", true), RetryAction::AutoReplay);
        assert_eq!(
            classify_tool_failure("E_BRIDGE_DISCONNECTED", false),
            RetryAction::AutoReplay
        );
    }

    #[test]
    fn client_timeout_depends_on_side_effects() {
        assert_eq!(
            classify_tool_failure("E_CLIENT_TIMEOUT", false),
            RetryAction::AutoReplay
        );
        assert_eq!(
            classify_tool_failure("E_CLIENT_TIMEOUT", true),
            RetryAction::LlmReplan
        );
    }

    #[test]
    fn unknown_code_fails_fast() {
        assert_eq!(classify_tool_failure("E_ARGS", false), RetryAction::FailFast);
    }

    #[test]
    fn circuit_opens_after_global_budget() {
        let mut budget = RetryBudget::new();
        for i in 0..GLOBAL_RETRY_BUDGET {
            let sig = format!("sig-{i}");
            assert_eq!(budget.record_failure(&sig), CircuitOutcome::Proceed);
        }
        assert_eq!(budget.record_failure("sig-last"), CircuitOutcome::Open);
    }

    #[test]
    fn circuit_opens_after_per_signature_budget() {
        let mut budget = RetryBudget::new();
        for _ in 0..PER_SIGNATURE_RETRY_BUDGET {
            assert_eq!(budget.record_failure("sig"), CircuitOutcome::Proceed);
        }
        assert_eq!(budget.record_failure("sig"), CircuitOutcome::Open);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(auto_replay_delay(0), Duration::from_millis(300));
        assert_eq!(auto_replay_delay(1), Duration::from_millis(600));
        assert_eq!(auto_replay_delay(5), Duration::from_millis(2_000));
    }
}
