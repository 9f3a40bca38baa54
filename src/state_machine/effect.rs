//! Effects produced by state transitions

use super::state::FrameId;
use serde_json::{Map, Value};

/// Work for the runtime to carry out after a transition
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Say something to the user
    Utter { text: String },

    /// Run an external action; the result comes back as an event for `frame_id`
    InvokeAction {
        frame_id: FrameId,
        action: String,
        inputs: Map<String, Value>,
    },

    /// Ask the response generator for text; the result comes back as an event
    Generate {
        frame_id: FrameId,
        instruction: String,
        context: Value,
    },

    /// Explain what the active flow is asking for. Fire and forget.
    Explain {
        flow: String,
        topic: Option<String>,
        prompt: Option<String>,
    },

    /// The conversation was handed to a human
    Handoff { reason: Option<String> },
}

impl Effect {
    pub fn utter(text: impl Into<String>) -> Self {
        Effect::Utter { text: text.into() }
    }

    /// Whether the runtime must feed a result back before the turn ends
    pub fn awaits_result(&self) -> bool {
        matches!(self, Effect::InvokeAction { .. } | Effect::Generate { .. })
    }
}
