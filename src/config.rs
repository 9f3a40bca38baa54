//! Engine configuration

use std::str::FromStr;
use std::time::Duration;

/// Limits, timeouts and fixed texts used by the state machine and runtime
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Consecutive clarifications tolerated before handing off
    pub max_clarification_depth: u32,
    /// Branch jumps a frame may take within one turn
    pub max_branch_jumps: u32,
    pub max_stack_depth: usize,
    /// Messages kept for the NLU
    pub history_limit: usize,
    pub min_command_confidence: f64,
    /// Used for flows that don't set `confirm_before_cancel`
    pub confirm_before_cancel: bool,
    pub action_timeout: Duration,
    pub generation_timeout: Duration,
    pub nlu_timeout: Duration,
    /// Turns queued per session before callers get a busy error
    pub turn_queue_capacity: usize,
    /// `{flow}` is replaced by the flow description
    pub cancel_confirmation_text: String,
    pub handoff_text: String,
    pub error_text: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_clarification_depth: 2,
            max_branch_jumps: 100,
            max_stack_depth: 32,
            history_limit: 20,
            min_command_confidence: 0.5,
            confirm_before_cancel: false,
            action_timeout: Duration::from_secs(30),
            generation_timeout: Duration::from_secs(30),
            nlu_timeout: Duration::from_secs(30),
            turn_queue_capacity: 8,
            cancel_confirmation_text: "Do you really want to stop {flow}?".to_string(),
            handoff_text: "Let me connect you with a human agent.".to_string(),
            error_text: "Sorry, something went wrong.".to_string(),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `FLOWSTACK_*` environment variables
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparsable values are logged and ignored
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let secs = |key: &str, default: Duration| {
            parsed::<u64>(&lookup, key).map_or(default, Duration::from_secs)
        };
        Self {
            max_clarification_depth: parsed(&lookup, "FLOWSTACK_MAX_CLARIFICATIONS")
                .unwrap_or(defaults.max_clarification_depth),
            max_branch_jumps: parsed(&lookup, "FLOWSTACK_MAX_BRANCH_JUMPS")
                .unwrap_or(defaults.max_branch_jumps),
            max_stack_depth: parsed(&lookup, "FLOWSTACK_MAX_STACK_DEPTH")
                .unwrap_or(defaults.max_stack_depth),
            history_limit: parsed(&lookup, "FLOWSTACK_HISTORY_LIMIT")
                .unwrap_or(defaults.history_limit),
            min_command_confidence: parsed(&lookup, "FLOWSTACK_MIN_CONFIDENCE")
                .unwrap_or(defaults.min_command_confidence),
            confirm_before_cancel: parsed(&lookup, "FLOWSTACK_CONFIRM_CANCEL")
                .unwrap_or(defaults.confirm_before_cancel),
            action_timeout: secs("FLOWSTACK_ACTION_TIMEOUT_SECS", defaults.action_timeout),
            generation_timeout: secs(
                "FLOWSTACK_GENERATION_TIMEOUT_SECS",
                defaults.generation_timeout,
            ),
            nlu_timeout: secs("FLOWSTACK_NLU_TIMEOUT_SECS", defaults.nlu_timeout),
            turn_queue_capacity: parsed::<usize>(&lookup, "FLOWSTACK_TURN_QUEUE")
                .filter(|n| *n > 0)
                .unwrap_or(defaults.turn_queue_capacity),
            cancel_confirmation_text: lookup("FLOWSTACK_CANCEL_TEXT")
                .unwrap_or(defaults.cancel_confirmation_text),
            handoff_text: lookup("FLOWSTACK_HANDOFF_TEXT").unwrap_or(defaults.handoff_text),
            error_text: lookup("FLOWSTACK_ERROR_TEXT").unwrap_or(defaults.error_text),
        }
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}
