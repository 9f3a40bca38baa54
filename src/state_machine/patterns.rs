//! Conversation patterns: correction, cancellation, clarification,
//! confirmation, handoff and out-of-scope.
//!
//! `collect` and `confirm` steps may override cancellation and correction;
//! the override of the step the active frame is waiting at always wins.

use super::command::CommandError;
use super::effect::Effect;
use super::executor::{self, SlotCheck};
use super::processor::push_started;
use super::state::{DialogueContext, DialogueState, FrameOrigin, Suspension};
use crate::flows::step::{HandlerRef, Step, StepKind};
use crate::flows::{FALLBACK_FLOW, GOODBYE_FLOW, HELP_FLOW};
use serde_json::Value;

#[derive(Debug, Clone, Copy)]
enum Override {
    Cancel,
    Correction,
}

/// Override declared by the step the active frame is waiting at
fn step_override<'c>(
    state: &DialogueState,
    ctx: &'c DialogueContext,
    kind: Override,
) -> Option<(&'c Step, &'c HandlerRef)> {
    let top = state.top()?;
    if !matches!(
        top.suspension(),
        Some(Suspension::Collect { .. } | Suspension::Confirm)
    ) {
        return None;
    }
    let step = ctx.flow(&top.flow)?.step(top.cursor)?;
    let handler = match kind {
        Override::Cancel => step.on_cancel(),
        Override::Correction => step.on_correction(),
    }?;
    Some((step, handler))
}

fn route(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    step: &Step,
    handler: &HandlerRef,
) -> Result<(), CommandError> {
    tracing::debug!(
        session_id = %state.session_id,
        step = %step.id,
        handler = %handler,
        "Step override"
    );
    match handler {
        HandlerRef::Ignore => Err(CommandError::IgnoredByStep(step.id.clone())),
        HandlerRef::Goto(target) => {
            let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
            let index = ctx
                .flow(&top.flow)
                .and_then(|f| f.step_index(target))
                .ok_or_else(|| CommandError::UnknownStep(target.clone()))?;
            top.jump_to(index);
            Ok(())
        }
        HandlerRef::Flow(name) => {
            let flow = ctx
                .flow(name)
                .ok_or_else(|| CommandError::UnknownFlow(name.clone()))?;
            push_started(state, ctx, flow, FrameOrigin::Interjection)
        }
    }
}

/// Pop the frame at `position` and everything above it
fn pop_from(state: &mut DialogueState, position: usize) {
    while state.stack.len() > position {
        if let Some(frame) = state.pop_frame() {
            tracing::info!(
                session_id = %state.session_id,
                flow = %frame.flow,
                "Cancelled flow"
            );
        }
    }
    state.reissue_top_prompt();
}

/// Run a built-in flow while nothing else is active, if one is defined
fn start_idle_flow(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    name: &str,
) -> Result<(), CommandError> {
    let flow = ctx.flow(name).ok_or(CommandError::NoActiveFlow)?;
    push_started(state, ctx, flow, FrameOrigin::Interjection)
}

// ============================================================================
// Correction
// ============================================================================

pub(super) fn correct(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    name: &str,
    value: &Value,
    effects: &mut Vec<Effect>,
) -> Result<(), CommandError> {
    if !state.top().is_some_and(|top| top.declares(name)) {
        state.pending_slots.insert(name.to_string(), value.clone());
        return Ok(());
    }
    let handler = step_override(state, ctx, Override::Correction);
    if let Some((step, HandlerRef::Ignore)) = handler {
        return Err(CommandError::IgnoredByStep(step.id.clone()));
    }

    let collect_index = state
        .top()
        .and_then(|top| ctx.flow(&top.flow))
        .and_then(|f| f.collect_index(name));
    let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
    top.set_slot(name, value.clone());
    top.clarification_depth = 0;

    if let Some((step, handler)) = handler {
        return route(state, ctx, step, handler);
    }

    if matches!(top.suspension(), Some(Suspension::Confirm)) {
        return recheck_at_confirm(state, ctx, name, collect_index, effects);
    }
    match collect_index {
        Some(index) if index <= top.cursor => top.jump_to(index),
        _ => state.reissue_top_prompt(),
    }
    Ok(())
}

/// A value corrected at a `confirm` step goes through its `collect` checks
/// again: a rejected value is asked for anew, a valid one regenerates the
/// confirmation.
fn recheck_at_confirm(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    name: &str,
    collect_index: Option<usize>,
    effects: &mut Vec<Effect>,
) -> Result<(), CommandError> {
    let collect = collect_index.and_then(|index| {
        let step = state
            .top()
            .and_then(|top| ctx.flow(&top.flow))
            .and_then(|f| f.step(index))?;
        match &step.kind {
            StepKind::Collect(collect) => Some((index, collect)),
            _ => None,
        }
    });
    let Some((index, collect)) = collect else {
        let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
        top.jump_to(top.cursor);
        return Ok(());
    };

    let target = match executor::check_slot(state, ctx, collect) {
        SlotCheck::Valid => None,
        SlotCheck::Rejected(message) => {
            executor::reject_slot(state, collect, &message);
            effects.push(Effect::utter(message));
            Some(index)
        }
        SlotCheck::Failed(reason) => {
            return Err(CommandError::InvalidValue {
                slot: name.to_string(),
                reason,
            });
        }
    };
    let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
    top.jump_to(target.unwrap_or(top.cursor));
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

pub(super) fn cancel(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    reason: Option<&str>,
) -> Result<(), CommandError> {
    let Some(top) = state.top() else {
        return start_idle_flow(state, ctx, GOODBYE_FLOW);
    };

    // Asking to cancel again while confirming a cancel confirms it
    if let Some(Suspension::CancelConfirmation { target, .. }) = top.suspension() {
        let position = state
            .frame_position(*target)
            .ok_or(CommandError::NoActiveFlow)?;
        pop_from(state, position);
        return Ok(());
    }

    if let Some((step, handler)) = step_override(state, ctx, Override::Cancel) {
        return route(state, ctx, step, handler);
    }

    let position = state
        .stack
        .iter()
        .rposition(|frame| !frame.is_called())
        .ok_or(CommandError::NoActiveFlow)?;
    let target = &state.stack[position];
    let default = ctx.config.confirm_before_cancel;
    let confirm = ctx
        .flow(&target.flow)
        .map_or(default, |f| f.confirm_before_cancel(default));

    if confirm {
        let target = target.id;
        let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
        let previous = Box::new(top.status.clone());
        top.suspend(Suspension::CancelConfirmation {
            target,
            reason: reason.map(String::from),
            previous,
        });
        top.reissue_prompt = true;
        return Ok(());
    }

    pop_from(state, position);
    Ok(())
}

// ============================================================================
// Confirmation
// ============================================================================

pub(super) fn confirm(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    affirm: bool,
) -> Result<(), CommandError> {
    let top = state.top_mut().ok_or(CommandError::NothingToConfirm)?;
    match top.suspension().cloned() {
        Some(Suspension::CancelConfirmation {
            target, previous, ..
        }) => {
            if affirm {
                let position = state
                    .frame_position(target)
                    .ok_or(CommandError::NoActiveFlow)?;
                pop_from(state, position);
            } else {
                top.status = *previous;
                top.reissue_prompt = true;
            }
            Ok(())
        }
        Some(Suspension::Confirm) => {
            let slot = ctx
                .flow(&top.flow)
                .and_then(|f| f.step(top.cursor))
                .and_then(|step| match &step.kind {
                    StepKind::Confirm(confirm) => confirm.slot.clone(),
                    _ => None,
                });
            if let Some(slot) = slot {
                top.set_slot(&slot, Value::Bool(affirm));
            }
            top.advance();
            Ok(())
        }
        _ => Err(CommandError::NothingToConfirm),
    }
}

// ============================================================================
// Clarification, handoff, out of scope
// ============================================================================

pub(super) fn clarify(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    topic: Option<&str>,
    effects: &mut Vec<Effect>,
) -> Result<(), CommandError> {
    let Some(top) = state.top_mut() else {
        return start_idle_flow(state, ctx, HELP_FLOW);
    };
    top.clarification_depth += 1;
    if top.clarification_depth > ctx.config.max_clarification_depth {
        tracing::info!(
            session_id = %state.session_id,
            limit = ctx.config.max_clarification_depth,
            "Clarification limit reached"
        );
        hand_off(
            state,
            ctx,
            Some("clarification limit reached".to_string()),
            effects,
        );
        return Ok(());
    }

    let topic = topic.map(String::from).or_else(|| match top.suspension() {
        Some(Suspension::Collect { slot }) => Some(slot.clone()),
        _ => None,
    });
    effects.push(Effect::Explain {
        flow: top.flow.clone(),
        topic,
        prompt: top.pending_prompt.clone(),
    });
    state.reissue_top_prompt();
    Ok(())
}

pub(super) fn hand_off(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    reason: Option<String>,
    effects: &mut Vec<Effect>,
) {
    tracing::info!(
        session_id = %state.session_id,
        reason = reason.as_deref().unwrap_or(""),
        "Handing off to a human"
    );
    state.hand_off();
    effects.push(Effect::Handoff { reason });
    effects.push(Effect::utter(ctx.config.handoff_text.clone()));
}

pub(super) fn out_of_scope(
    state: &mut DialogueState,
    ctx: &DialogueContext,
) -> Result<(), CommandError> {
    if state.top().is_some_and(|top| top.flow == FALLBACK_FLOW) {
        return Ok(());
    }
    let fallback = ctx
        .flow(FALLBACK_FLOW)
        .ok_or_else(|| CommandError::UnknownFlow(FALLBACK_FLOW.to_string()))?;
    push_started(state, ctx, fallback, FrameOrigin::Interjection)
}
