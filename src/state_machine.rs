//! Flow-stack dialogue state machine
//!
//! Implements the Elm Architecture pattern with pure state transitions:
//! commands and external results go in, a new state and effects come out.

pub mod command;
mod effect;
pub mod event;
mod executor;
mod patterns;
mod processor;
pub mod scope;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
pub(crate) mod fixtures;
#[cfg(test)]
mod proptests;

pub use command::{filter_by_confidence, Command, CommandError, ScoredCommand};
pub use effect::Effect;
pub use event::Event;
pub use executor::LAST_ERROR_VAR;
pub use processor::LAST_COMMAND_VAR;
pub use state::{DialogueContext, DialogueState, FlowFrame, FrameId, Phase};
pub use transition::{transition, TransitionError, TransitionResult};
