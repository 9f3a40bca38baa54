//! Pure state transition function
//!
//! `transition` never performs I/O: actions and generation are requested
//! through effects, and their results come back as events.

use super::executor::{self, Awaited};
use super::processor;
use super::state::{DialogueContext, DialogueState, FrameId, FrameOrigin};
use super::{Effect, Event};
use crate::flows::WELCOME_FLOW;
use std::collections::BTreeMap;
use thiserror::Error;

/// Result of a state transition
#[derive(Debug)]
pub struct TransitionResult {
    pub new_state: DialogueState,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    /// Text to show the user, in order
    pub fn utterances(&self) -> impl Iterator<Item = &str> {
        self.effects.iter().filter_map(|effect| match effect {
            Effect::Utter { text } => Some(text.as_str()),
            _ => None,
        })
    }

    /// Whether the runtime must feed a result back before the turn ends
    pub fn awaits_result(&self) -> bool {
        self.effects.iter().any(Effect::awaits_result)
    }
}

/// Errors that can occur during transition
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("Session has been handed off to a human")]
    HandedOff,
    #[error("Frame {frame_id} is not waiting for {expected}")]
    UnexpectedResult {
        frame_id: FrameId,
        expected: &'static str,
    },
}

/// Pure transition function
///
/// Given the same state, context and event it always produces the same
/// state and effects.
pub fn transition(
    state: &DialogueState,
    ctx: &DialogueContext,
    event: Event,
) -> Result<TransitionResult, TransitionError> {
    if state.is_handed_off() {
        return Err(TransitionError::HandedOff);
    }
    let mut next = state.clone();
    let mut effects = Vec::new();

    match event {
        // ============================================================
        // Turn starts
        // ============================================================
        Event::SessionStarted => {
            if next.stack.is_empty() {
                if let Some(welcome) = ctx.flow(WELCOME_FLOW) {
                    next.push_frame(welcome, FrameOrigin::Started, BTreeMap::new());
                }
            }
        }

        Event::Commands { commands } => {
            processor::apply_all(&mut next, ctx, commands, &mut effects);
        }

        // ============================================================
        // External results
        // ============================================================
        Event::ActionCompleted { frame_id, result } => {
            executor::complete_action(&mut next, ctx, frame_id, &result)?;
        }

        Event::ActionFailed { frame_id, error } => {
            executor::awaited_step(&next, ctx, frame_id, Awaited::Action)?;
            executor::fail(&mut next, ctx, &mut effects, &format!("action failed: {error}"));
        }

        Event::GenerationCompleted { frame_id, text } => {
            executor::complete_generation(&mut next, ctx, frame_id, text, &mut effects)?;
        }

        Event::GenerationFailed { frame_id, error } => {
            executor::awaited_step(&next, ctx, frame_id, Awaited::Generation)?;
            executor::fail(
                &mut next,
                ctx,
                &mut effects,
                &format!("generation failed: {error}"),
            );
        }
    }

    if !next.is_handed_off() {
        executor::run(&mut next, ctx, &mut effects);
    }

    let result = TransitionResult {
        new_state: next,
        effects,
    };
    Ok(finish_turn(result))
}

/// Branch-jump counters are per turn; a turn ends when nothing is awaited
fn finish_turn(mut result: TransitionResult) -> TransitionResult {
    if !result.awaits_result() {
        for frame in &mut result.new_state.stack {
            frame.branch_jumps = 0;
        }
    }
    result.new_state.refresh_phase();
    result
}
