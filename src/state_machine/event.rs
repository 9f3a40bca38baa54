//! Events that drive the dialogue state machine

use super::command::Command;
use super::state::FrameId;
use serde_json::{Map, Value};

/// Inputs to [`transition`](super::transition)
#[derive(Debug, Clone)]
pub enum Event {
    /// A fresh session: push `welcome` and run it
    SessionStarted,

    /// One user turn, already understood and filtered
    Commands { commands: Vec<Command> },

    // Action results
    ActionCompleted {
        frame_id: FrameId,
        result: Map<String, Value>,
    },
    ActionFailed {
        frame_id: FrameId,
        error: String,
    },

    // Generation results
    GenerationCompleted {
        frame_id: FrameId,
        text: String,
    },
    GenerationFailed {
        frame_id: FrameId,
        error: String,
    },
}

impl Event {
    pub fn commands(commands: impl IntoIterator<Item = Command>) -> Self {
        Event::Commands {
            commands: commands.into_iter().collect(),
        }
    }
}
