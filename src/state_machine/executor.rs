//! Step executor
//!
//! Advances the active frame until it has to wait: for the user (`collect`,
//! `confirm`), for an external result (`action`, `generate`), or because the
//! stack is empty. Frame completion, child output propagation and the error
//! path all live here.

use super::effect::Effect;
use super::processor::call_flow_return;
use super::scope::FrameScope;
use super::state::{
    DialogueContext, DialogueState, FrameId, FrameOrigin, FrameStatus, Suspension, Validation,
};
use super::transition::TransitionError;
use crate::flows::step::{
    ActionStep, BranchStep, CallFlowStep, CollectStep, ConfirmStep, GenerateStep, Step, StepKind,
};
use crate::flows::{template, FlowDefinition, FALLBACK_FLOW};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Session variable holding the last step failure
pub const LAST_ERROR_VAR: &str = "last_error";

enum Outcome {
    /// Keep executing
    Continue,
    /// The active frame is waiting
    Suspend,
    /// The step failed with a reason
    Fail(String),
}

/// Run the active frame until something has to wait
pub(super) fn run(state: &mut DialogueState, ctx: &DialogueContext, effects: &mut Vec<Effect>) {
    loop {
        let Some(top) = state.top() else {
            return;
        };
        let Some(flow) = ctx.flow(&top.flow) else {
            let reason = format!("flow '{}' is no longer defined", top.flow);
            fail(state, ctx, effects, &reason);
            continue;
        };
        let cursor = top.cursor;

        let outcome = match &top.status {
            FrameStatus::Pushed => {
                if let Some(top) = state.top_mut() {
                    top.status = FrameStatus::Running;
                }
                Outcome::Continue
            }
            FrameStatus::Suspended { .. } => {
                reissue_prompt(state, ctx, effects);
                return;
            }
            FrameStatus::Running => match flow.step(cursor) {
                None => {
                    complete(state, flow);
                    Outcome::Continue
                }
                Some(step) => execute(state, ctx, flow, step, effects),
            },
        };

        match outcome {
            Outcome::Continue => {}
            Outcome::Suspend => return,
            Outcome::Fail(reason) => fail(state, ctx, effects, &reason),
        }
    }
}

fn execute(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    flow: &FlowDefinition,
    step: &Step,
    effects: &mut Vec<Effect>,
) -> Outcome {
    tracing::debug!(
        session_id = %state.session_id,
        flow = %flow.name,
        step = %step.id,
        kind = step.kind.name(),
        "Executing step"
    );
    match &step.kind {
        StepKind::Say { text } => {
            let text = template::render(text, &FrameScope::top(state));
            effects.push(Effect::utter(text));
            advance(state);
            Outcome::Continue
        }
        StepKind::Collect(collect) => run_collect(state, ctx, collect, effects),
        StepKind::Confirm(confirm) => run_confirm(state, confirm, effects),
        StepKind::Action(action) => run_action(state, action, effects),
        StepKind::Generate(generate) => run_generate(state, generate, effects),
        StepKind::CallFlow(call) => run_call(state, ctx, call),
        StepKind::Branch(branch) => run_branch(state, ctx, flow, branch),
    }
}

fn advance(state: &mut DialogueState) {
    if let Some(top) = state.top_mut() {
        top.advance();
    }
}

// ============================================================================
// Steps that wait for the user
// ============================================================================

fn run_collect(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    collect: &CollectStep,
    effects: &mut Vec<Effect>,
) -> Outcome {
    if let Some(value) = state.pending_slots.remove(&collect.slot) {
        if let Some(top) = state.top_mut() {
            top.set_slot(&collect.slot, value);
        }
    }
    let Some(top) = state.top() else {
        return Outcome::Suspend;
    };
    let asked = top.pending_prompt.is_some();
    let Some(slot) = top.slots.get(&collect.slot).filter(|s| s.filled) else {
        return prompt_for(state, collect, effects);
    };
    if collect.ask_before_filling && !asked {
        return prompt_for(state, collect, effects);
    }
    if slot.validation == Validation::Valid {
        advance(state);
        return Outcome::Continue;
    }

    match check_slot(state, ctx, collect) {
        SlotCheck::Valid => {
            advance(state);
            Outcome::Continue
        }
        SlotCheck::Rejected(message) => {
            reject_slot(state, collect, &message);
            effects.push(Effect::utter(message));
            prompt_for(state, collect, effects)
        }
        SlotCheck::Failed(reason) => Outcome::Fail(reason),
    }
}

/// Result of checking a filled slot against its `collect` step
pub(super) enum SlotCheck {
    Valid,
    /// User-facing reason
    Rejected(String),
    /// The check itself could not run
    Failed(String),
}

/// Run the validator and rejection rules of `collect` on the value of its
/// slot in the active frame. A passing value is stored normalized and
/// marked valid.
pub(super) fn check_slot(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    collect: &CollectStep,
) -> SlotCheck {
    let Some(raw) = state
        .top()
        .and_then(|top| top.slot_value(&collect.slot))
        .cloned()
    else {
        return SlotCheck::Failed(format!("slot '{}' is not filled", collect.slot));
    };
    let value = match &collect.validator {
        None => raw,
        Some(name) => {
            let Some(validator) = ctx.validators.get(name) else {
                return SlotCheck::Failed(format!("validator '{name}' is not registered"));
            };
            match validator.validate(&raw) {
                Ok(value) => value,
                Err(message) => return SlotCheck::Rejected(message),
            }
        }
    };
    if let Some(slot) = state
        .top_mut()
        .and_then(|top| top.slots.get_mut(&collect.slot))
    {
        slot.value = value;
    }

    let scope = FrameScope::top(state);
    for rejection in &collect.rejections {
        match rejection.condition.test(&scope) {
            Ok(false) => {}
            Ok(true) => return SlotCheck::Rejected(template::render(&rejection.message, &scope)),
            Err(e) => {
                return SlotCheck::Failed(format!(
                    "rejection rule `{}`: {e}",
                    rejection.condition
                ));
            }
        }
    }

    if let Some(slot) = state
        .top_mut()
        .and_then(|top| top.slots.get_mut(&collect.slot))
    {
        slot.validation = Validation::Valid;
    }
    SlotCheck::Valid
}

/// Empty a rejected slot so its `collect` step asks again
pub(super) fn reject_slot(state: &mut DialogueState, collect: &CollectStep, message: &str) {
    tracing::debug!(
        session_id = %state.session_id,
        slot = %collect.slot,
        reason = message,
        "Slot value rejected"
    );
    if let Some(slot) = state
        .top_mut()
        .and_then(|top| top.slots.get_mut(&collect.slot))
    {
        slot.filled = false;
        slot.validation = Validation::Rejected {
            reason: message.to_string(),
        };
    }
}

fn prompt_for(
    state: &mut DialogueState,
    collect: &CollectStep,
    effects: &mut Vec<Effect>,
) -> Outcome {
    let text = template::render(&collect.prompt_template(), &FrameScope::top(state));
    suspend_with_prompt(
        state,
        text,
        Suspension::Collect {
            slot: collect.slot.clone(),
        },
        effects,
    )
}

fn run_confirm(
    state: &mut DialogueState,
    confirm: &ConfirmStep,
    effects: &mut Vec<Effect>,
) -> Outcome {
    let text = template::render(&confirm.prompt, &FrameScope::top(state));
    suspend_with_prompt(state, text, Suspension::Confirm, effects)
}

fn suspend_with_prompt(
    state: &mut DialogueState,
    text: String,
    on: Suspension,
    effects: &mut Vec<Effect>,
) -> Outcome {
    if let Some(top) = state.top_mut() {
        top.pending_prompt = Some(text.clone());
        top.reissue_prompt = false;
        top.suspend(on);
    }
    effects.push(Effect::Utter { text });
    Outcome::Suspend
}

/// Repeat what a suspended frame is waiting on, if it was asked to
fn reissue_prompt(state: &mut DialogueState, ctx: &DialogueContext, effects: &mut Vec<Effect>) {
    let Some(top) = state.top() else {
        return;
    };
    if !top.reissue_prompt {
        return;
    }
    let text = match top.suspension() {
        Some(Suspension::Collect { .. } | Suspension::Confirm) => top.pending_prompt.clone(),
        Some(Suspension::CancelConfirmation { target, .. }) => {
            let flow = state
                .frame_position(*target)
                .and_then(|p| ctx.flow(&state.stack[p].flow))
                .map_or_else(String::new, |f| {
                    if f.description.is_empty() {
                        f.name.clone()
                    } else {
                        f.description.clone()
                    }
                });
            Some(ctx.config.cancel_confirmation_text.replace("{flow}", &flow))
        }
        _ => None,
    };
    if let Some(top) = state.top_mut() {
        top.reissue_prompt = false;
    }
    if let Some(text) = text {
        effects.push(Effect::Utter { text });
    }
}

// ============================================================================
// Steps that wait for an external result
// ============================================================================

fn run_action(
    state: &mut DialogueState,
    action: &ActionStep,
    effects: &mut Vec<Effect>,
) -> Outcome {
    let scope = FrameScope::top(state);
    let mut inputs = Map::new();
    for (name, expression) in &action.inputs {
        match expression.evaluate(&scope) {
            Ok(value) => {
                inputs.insert(name.clone(), value);
            }
            Err(e) => return Outcome::Fail(format!("action input '{name}': {e}")),
        }
    }
    let Some(top) = state.top_mut() else {
        return Outcome::Suspend;
    };
    top.suspend(Suspension::AwaitingAction {
        action: action.action.clone(),
    });
    effects.push(Effect::InvokeAction {
        frame_id: top.id,
        action: action.action.clone(),
        inputs,
    });
    Outcome::Suspend
}

fn run_generate(
    state: &mut DialogueState,
    generate: &GenerateStep,
    effects: &mut Vec<Effect>,
) -> Outcome {
    let Some(top) = state.top() else {
        return Outcome::Suspend;
    };
    let instruction = template::render(&generate.instruction, &FrameScope::top(state));
    let context = json!({
        "flow": top.flow,
        "slots": top.slot_values(),
        "session": state.session,
    });
    let frame_id = top.id;
    if let Some(top) = state.top_mut() {
        top.suspend(Suspension::AwaitingGeneration);
    }
    effects.push(Effect::Generate {
        frame_id,
        instruction,
        context,
    });
    Outcome::Suspend
}

/// Store an action result and continue past the action step
pub(super) fn complete_action(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    frame_id: FrameId,
    result: &Map<String, Value>,
) -> Result<(), TransitionError> {
    let step = awaited_step(state, ctx, frame_id, Awaited::Action)?;
    let Some(top) = state.top_mut() else {
        return Ok(());
    };
    if let StepKind::Action(action) = &step.kind {
        for (field, slot) in &action.outputs {
            top.set_slot(slot, result.get(field).cloned().unwrap_or(Value::Null));
        }
    }
    top.advance();
    Ok(())
}

/// Say the generated text, store it if asked, and continue
pub(super) fn complete_generation(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    frame_id: FrameId,
    text: String,
    effects: &mut Vec<Effect>,
) -> Result<(), TransitionError> {
    let step = awaited_step(state, ctx, frame_id, Awaited::Generation)?;
    let Some(top) = state.top_mut() else {
        return Ok(());
    };
    if let StepKind::Generate(GenerateStep {
        slot: Some(slot), ..
    }) = &step.kind
    {
        top.set_slot(slot, Value::String(text.clone()));
    }
    top.advance();
    effects.push(Effect::Utter { text });
    Ok(())
}

/// External results the executor waits for
#[derive(Debug, Clone, Copy)]
pub(super) enum Awaited {
    Action,
    Generation,
}

impl Awaited {
    fn describe(self) -> &'static str {
        match self {
            Awaited::Action => "an action result",
            Awaited::Generation => "a generation result",
        }
    }
}

/// The step `frame_id` is waiting at, if it is the active frame and waiting
/// for `awaited`
pub(super) fn awaited_step<'c>(
    state: &DialogueState,
    ctx: &'c DialogueContext,
    frame_id: FrameId,
    awaited: Awaited,
) -> Result<&'c Step, TransitionError> {
    let unexpected = || TransitionError::UnexpectedResult {
        frame_id,
        expected: awaited.describe(),
    };
    let top = state
        .top()
        .filter(|top| top.id == frame_id)
        .ok_or_else(unexpected)?;
    let waiting = matches!(
        (top.suspension(), awaited),
        (Some(Suspension::AwaitingAction { .. }), Awaited::Action)
            | (Some(Suspension::AwaitingGeneration), Awaited::Generation)
    );
    if !waiting {
        return Err(unexpected());
    }
    ctx.flow(&top.flow)
        .and_then(|flow| flow.step(top.cursor))
        .ok_or_else(unexpected)
}

// ============================================================================
// Steps that move the cursor or the stack
// ============================================================================

fn run_call(state: &mut DialogueState, ctx: &DialogueContext, call: &CallFlowStep) -> Outcome {
    let Some(child) = ctx.flow(&call.flow) else {
        return Outcome::Fail(format!("flow '{}' is not defined", call.flow));
    };
    if state.stack.len() >= ctx.config.max_stack_depth {
        return Outcome::Fail(format!(
            "stack depth limit of {} reached",
            ctx.config.max_stack_depth
        ));
    }
    let scope = FrameScope::top(state);
    let mut inputs = BTreeMap::new();
    for (name, expression) in &call.inputs {
        match expression.evaluate(&scope) {
            Ok(value) => {
                inputs.insert(name.clone(), value);
            }
            Err(e) => return Outcome::Fail(format!("input '{name}' for '{}': {e}", call.flow)),
        }
    }
    let child_id = state.next_frame_id;
    if let Some(top) = state.top_mut() {
        top.suspend(Suspension::AwaitingChild { child: child_id });
    }
    state.push_frame(
        child,
        FrameOrigin::Called {
            outputs: call.outputs.clone(),
        },
        inputs,
    );
    Outcome::Continue
}

fn run_branch(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    flow: &FlowDefinition,
    branch: &BranchStep,
) -> Outcome {
    let taken = match branch.condition.test(&FrameScope::top(state)) {
        Ok(taken) => taken,
        Err(e) => return Outcome::Fail(format!("condition `{}`: {e}", branch.condition)),
    };
    let Some(top) = state.top_mut() else {
        return Outcome::Suspend;
    };
    let next = top.cursor + 1;
    let target = if taken {
        flow.target_index(&branch.then)
    } else {
        branch
            .otherwise
            .as_ref()
            .map_or(Some(next), |t| flow.target_index(t))
    };
    let Some(target) = target else {
        return Outcome::Fail("branch target is not defined".to_string());
    };
    if target != next {
        top.branch_jumps += 1;
        if top.branch_jumps > ctx.config.max_branch_jumps {
            return Outcome::Fail(format!(
                "more than {} branch jumps in one turn",
                ctx.config.max_branch_jumps
            ));
        }
    }
    top.jump_to(target);
    Outcome::Continue
}

// ============================================================================
// Completion and failure
// ============================================================================

/// Pop a finished frame and hand its declared outputs on
pub(super) fn complete(state: &mut DialogueState, flow: &FlowDefinition) {
    let Some(frame) = state.pop_frame() else {
        return;
    };
    match &frame.origin {
        FrameOrigin::Called { outputs } => {
            let Some(parent) = state.top_mut() else {
                return;
            };
            for name in &flow.outputs {
                let target = outputs.get(name).unwrap_or(name);
                let value = frame.slot_value(name).cloned().unwrap_or(Value::Null);
                parent.set_slot(target, value);
            }
            if let Err(e) = call_flow_return(state) {
                tracing::warn!(
                    session_id = %state.session_id,
                    flow = %frame.flow,
                    error = %e,
                    "Caller was not waiting for the returning flow"
                );
            }
        }
        FrameOrigin::Started => {
            for name in &flow.outputs {
                if let Some(value) = frame.slot_value(name) {
                    state.session.insert(name.clone(), value.clone());
                }
            }
            state.reissue_top_prompt();
        }
        FrameOrigin::Interjection => state.reissue_top_prompt(),
    }
}

/// Route a step failure: the flow's `on_error` step, else pop and let the
/// caller fail too, else `fallback`.
pub(super) fn fail(
    state: &mut DialogueState,
    ctx: &DialogueContext,
    effects: &mut Vec<Effect>,
    reason: &str,
) {
    loop {
        let Some(top) = state.top() else {
            return;
        };
        let flow = ctx.flow(&top.flow);
        let step = flow
            .and_then(|f| f.step(top.cursor))
            .map(|s| s.id.clone())
            .unwrap_or_default();
        tracing::warn!(
            session_id = %state.session_id,
            flow = %top.flow,
            step = %step,
            reason,
            "Step failed"
        );
        let marker = json!({ "flow": top.flow, "step": step, "reason": reason });
        let handler = if top.in_error_handler {
            None
        } else {
            flow.and_then(|f| f.on_error.as_deref().and_then(|t| f.step_index(t)))
        };
        state.session.insert(LAST_ERROR_VAR.to_string(), marker);

        if let Some(index) = handler {
            if let Some(top) = state.top_mut() {
                top.jump_to(index);
                top.in_error_handler = true;
            }
            return;
        }

        let Some(frame) = state.pop_frame() else {
            return;
        };
        if frame.is_called() && !state.stack.is_empty() {
            continue;
        }
        if frame.flow == FALLBACK_FLOW {
            effects.push(Effect::utter(ctx.config.error_text.clone()));
            state.reissue_top_prompt();
            return;
        }
        match ctx.flow(FALLBACK_FLOW) {
            Some(fallback) => {
                state.push_frame(fallback, FrameOrigin::Interjection, BTreeMap::new());
            }
            None => effects.push(Effect::utter(ctx.config.error_text.clone())),
        }
        return;
    }
}
