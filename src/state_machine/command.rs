//! Commands produced by language understanding

use crate::expr::EvalError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Structured intent applied to the dialogue state, in order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum Command {
    StartFlow {
        flow: String,
    },
    CallFlowReturn,
    CancelFlow {
        #[serde(default)]
        reason: Option<String>,
    },
    SetSlot {
        name: String,
        value: Value,
    },
    CorrectSlot {
        name: String,
        value: Value,
    },
    Clarify {
        #[serde(default)]
        topic: Option<String>,
    },
    Affirm,
    Deny,
    HumanHandoff {
        #[serde(default)]
        reason: Option<String>,
    },
    OutOfScope,
}

impl Command {
    pub fn start(flow: impl Into<String>) -> Self {
        Command::StartFlow { flow: flow.into() }
    }

    pub fn set(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Command::SetSlot {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn correct(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Command::CorrectSlot {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn cancel() -> Self {
        Command::CancelFlow { reason: None }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Command::StartFlow { .. } => "start_flow",
            Command::CallFlowReturn => "call_flow_return",
            Command::CancelFlow { .. } => "cancel_flow",
            Command::SetSlot { .. } => "set_slot",
            Command::CorrectSlot { .. } => "correct_slot",
            Command::Clarify { .. } => "clarify",
            Command::Affirm => "affirm",
            Command::Deny => "deny",
            Command::HumanHandoff { .. } => "human_handoff",
            Command::OutOfScope => "out_of_scope",
        }
    }

    /// Slot named by `SetSlot`/`CorrectSlot`
    pub fn slot_name(&self) -> Option<&str> {
        match self {
            Command::SetSlot { name, .. } | Command::CorrectSlot { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A command as returned by the NLU, with its confidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoredCommand {
    #[serde(flatten)]
    pub command: Command,
    #[serde(default = "full_confidence")]
    pub confidence: f64,
}

fn full_confidence() -> f64 {
    1.0
}

impl ScoredCommand {
    pub fn certain(command: Command) -> Self {
        Self {
            command,
            confidence: 1.0,
        }
    }
}

impl From<Command> for ScoredCommand {
    fn from(command: Command) -> Self {
        Self::certain(command)
    }
}

/// Replace low-confidence commands: slot commands become a clarification
/// of that slot, anything else is dropped.
pub fn filter_by_confidence(commands: Vec<ScoredCommand>, threshold: f64) -> Vec<Command> {
    commands
        .into_iter()
        .filter_map(|scored| {
            if scored.confidence >= threshold {
                return Some(scored.command);
            }
            tracing::debug!(
                command = scored.command.kind(),
                confidence = scored.confidence,
                "Low-confidence command"
            );
            scored.command.slot_name().map(|slot| Command::Clarify {
                topic: Some(slot.to_string()),
            })
        })
        .collect()
}

/// Why a command was not applied. Never fatal: the state is left as it was.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CommandError {
    #[error("Unknown flow '{0}'")]
    UnknownFlow(String),
    #[error("Unknown step '{0}'")]
    UnknownStep(String),
    #[error("Trigger condition of flow '{0}' is false")]
    TriggerNotMet(String),
    #[error("Trigger condition of flow '{flow}' failed: {source}")]
    TriggerFailed { flow: String, source: EvalError },
    #[error("Flow '{0}' is already active")]
    AlreadyActive(String),
    #[error("Flow '{0}' cannot be interrupted")]
    NotInterruptible(String),
    #[error("Stack depth limit of {0} reached")]
    StackLimit(usize),
    #[error("No active flow")]
    NoActiveFlow,
    #[error("Nothing is waiting for a yes or no")]
    NothingToConfirm,
    #[error("No frame is waiting for a child flow")]
    NoAwaitingChild,
    #[error("Step '{0}' ignores this command")]
    IgnoredByStep(String),
    #[error("Value for slot '{slot}' could not be checked: {reason}")]
    InvalidValue { slot: String, reason: String },
    #[error("Flow '{flow}' needs input '{input}'")]
    MissingInput { flow: String, input: String },
}
