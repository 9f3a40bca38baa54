//! Flowstack - declarative dialogue engine
//!
//! Conversations are driven by a stack of flows defined in YAML. A
//! language-understanding collaborator turns each user message into
//! commands, a pure state machine applies them and runs flow steps until it
//! needs the user again, and the runtime carries out the resulting effects.

#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::must_use_candidate,
    clippy::module_name_repetitions
)]

pub mod config;
pub mod db;
pub mod expr;
pub mod flows;
pub mod nlu;
pub mod runtime;
pub mod state_machine;
pub mod validators;
