//! Command processor
//!
//! Commands are applied strictly in order, each to a working copy of the
//! state. A rejected command leaves the state exactly as it was.

use super::command::{Command, CommandError};
use super::effect::Effect;
use super::executor;
use super::patterns;
use super::scope::FrameScope;
use super::state::{DialogueContext, DialogueState, FrameOrigin, FrameStatus, Suspension};
use crate::flows::FlowDefinition;
use serde_json::Value;
use std::collections::BTreeMap;

/// Session variable naming the kind of the last applied command
pub const LAST_COMMAND_VAR: &str = "last_command";

/// Apply commands in order. When every command is dropped the active
/// frame's open prompt is repeated.
pub(super) fn apply_all(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    commands: Vec<Command>,
    effects: &mut Vec<Effect>,
) {
    let attempted = !commands.is_empty();
    let mut applied = false;
    for command in commands {
        if state.is_handed_off() {
            tracing::debug!(
                session_id = %state.session_id,
                command = command.kind(),
                "Session handed off, ignoring remaining commands"
            );
            break;
        }
        let mut working = state.clone();
        let mut produced = Vec::new();
        match apply(&mut working, ctx, &command, &mut produced) {
            Ok(()) => {
                tracing::debug!(
                    session_id = %state.session_id,
                    command = command.kind(),
                    "Applied command"
                );
                working.session.insert(
                    LAST_COMMAND_VAR.to_string(),
                    Value::String(command.kind().to_string()),
                );
                *state = working;
                effects.extend(produced);
                applied = true;
            }
            Err(e) => {
                tracing::warn!(
                    session_id = %state.session_id,
                    command = command.kind(),
                    error = %e,
                    "Dropped command"
                );
            }
        }
    }
    if attempted && !applied && !state.is_handed_off() {
        state.reissue_top_prompt();
    }
}

fn apply(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    command: &Command,
    effects: &mut Vec<Effect>,
) -> Result<(), CommandError> {
    match command {
        Command::StartFlow { flow } => start_flow(state, ctx, flow),
        Command::CallFlowReturn => return_from_call(state, ctx),
        Command::SetSlot { name, value } => {
            set_slot(state, name, value);
            Ok(())
        }
        Command::CorrectSlot { name, value } => patterns::correct(state, ctx, name, value, effects),
        Command::CancelFlow { reason } => patterns::cancel(state, ctx, reason.as_deref()),
        Command::Clarify { topic } => patterns::clarify(state, ctx, topic.as_deref(), effects),
        Command::Affirm => patterns::confirm(state, ctx, true),
        Command::Deny => patterns::confirm(state, ctx, false),
        Command::HumanHandoff { reason } => {
            patterns::hand_off(state, ctx, reason.clone(), effects);
            Ok(())
        }
        Command::OutOfScope => patterns::out_of_scope(state, ctx),
    }
}

fn start_flow(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    name: &str,
) -> Result<(), CommandError> {
    let flow = ctx
        .flow(name)
        .ok_or_else(|| CommandError::UnknownFlow(name.to_string()))?;

    if let Some(top) = state.top() {
        if top.flow == name {
            return Err(CommandError::AlreadyActive(name.to_string()));
        }
        let locked = matches!(ctx.flow(&top.flow), Some(f) if !f.interruptible);
        if locked && top.is_waiting_on_user() {
            return Err(CommandError::NotInterruptible(top.flow.clone()));
        }
    }

    if let Some(condition) = flow.trigger_condition() {
        match condition.test(&FrameScope::top(state)) {
            Ok(true) => {}
            Ok(false) => return Err(CommandError::TriggerNotMet(name.to_string())),
            Err(source) => {
                return Err(CommandError::TriggerFailed {
                    flow: name.to_string(),
                    source,
                })
            }
        }
    }

    push_started(state, ctx, flow, FrameOrigin::Started)
}

/// Push a flow that is not a `call_flow` child, binding its inputs. A
/// required input nothing can bind rejects the push.
pub(super) fn push_started(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    flow: &FlowDefinition,
    origin: FrameOrigin,
) -> Result<(), CommandError> {
    if state.stack.len() >= ctx.config.max_stack_depth {
        return Err(CommandError::StackLimit(ctx.config.max_stack_depth));
    }
    let inputs = bind_inputs(state, flow);
    if let Some(input) = flow
        .inputs
        .iter()
        .find(|i| !i.optional && !inputs.contains_key(&i.name))
    {
        return Err(CommandError::MissingInput {
            flow: flow.name.clone(),
            input: input.name.clone(),
        });
    }
    state.push_frame(flow, origin, inputs);
    Ok(())
}

/// Pending values first, then session variables, then the active frame
fn bind_inputs(state: &mut DialogueState, flow: &FlowDefinition) -> BTreeMap<String, Value> {
    let mut inputs = BTreeMap::new();
    for input in &flow.inputs {
        let value = state
            .pending_slots
            .remove(&input.name)
            .or_else(|| state.session.get(&input.name).cloned())
            .or_else(|| state.top().and_then(|t| t.slot_value(&input.name)).cloned());
        if let Some(value) = value {
            inputs.insert(input.name.clone(), value);
        }
    }
    inputs
}

/// End an active `call_flow` child early, or resume a caller whose child has
/// already finished
fn return_from_call(state: &mut DialogueState, ctx: &DialogueContext) -> Result<(), CommandError> {
    let top = state.top().ok_or(CommandError::NoActiveFlow)?;
    if !top.is_called() {
        return call_flow_return(state);
    }
    let flow = ctx
        .flow(&top.flow)
        .ok_or_else(|| CommandError::UnknownFlow(top.flow.clone()))?;
    executor::complete(state, flow);
    Ok(())
}

/// Resume a caller past its `call_flow` step
pub(super) fn call_flow_return(state: &mut DialogueState) -> Result<(), CommandError> {
    let top = state.top_mut().ok_or(CommandError::NoActiveFlow)?;
    if !matches!(top.suspension(), Some(Suspension::AwaitingChild { .. })) {
        return Err(CommandError::NoAwaitingChild);
    }
    top.advance();
    Ok(())
}

/// Fill the slot on the active frame when it is being asked for or still
/// empty; otherwise keep the value for the next `collect` of that slot.
fn set_slot(state: &mut DialogueState, name: &str, value: &Value) {
    if let Some(top) = state.top_mut() {
        if top.declares(name) {
            let prompted =
                matches!(top.suspension(), Some(Suspension::Collect { slot }) if slot == name);
            if prompted {
                top.set_slot(name, value.clone());
                top.status = FrameStatus::Running;
                top.clarification_depth = 0;
                return;
            }
            match top.slot_value(name) {
                None => {
                    top.set_slot(name, value.clone());
                    return;
                }
                Some(current) if current == value => return,
                Some(_) => {}
            }
        }
    }
    state.pending_slots.insert(name.to_string(), value.clone());
}
