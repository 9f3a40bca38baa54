//! Load-time checks over a complete flow set

use super::step::{BranchMode, HandlerRef, Step, StepKind};
use super::{FlowConfigError, FlowDefinition, FlowsList, FALLBACK_FLOW, WELCOME_FLOW};
use crate::validators::ValidatorRegistry;

pub(super) fn validate(
    flows: &FlowsList,
    validators: &ValidatorRegistry,
) -> Result<(), FlowConfigError> {
    for required in [WELCOME_FLOW, FALLBACK_FLOW] {
        if !flows.contains(required) {
            return Err(FlowConfigError::MissingSpecialFlow(required));
        }
    }

    for flow in flows.iter() {
        if flow.steps.is_empty() {
            return Err(FlowConfigError::EmptyFlow(flow.name.clone()));
        }
        if let Some(target) = &flow.on_error {
            check_step(flow, target)?;
        }
        if let Some(condition) = flow.trigger_condition() {
            if condition.is_constant_true() {
                // Permitted, but the guard never filters anything.
                tracing::warn!(
                    flow = %flow.name,
                    condition = %condition,
                    "Trigger condition is always true"
                );
            }
        }
        for (index, step) in flow.steps.iter().enumerate() {
            validate_step(flows, validators, flow, index, step)?;
        }
    }
    Ok(())
}

fn validate_step(
    flows: &FlowsList,
    validators: &ValidatorRegistry,
    flow: &FlowDefinition,
    index: usize,
    step: &Step,
) -> Result<(), FlowConfigError> {
    for handler in [step.on_cancel(), step.on_correction()].into_iter().flatten() {
        match handler {
            HandlerRef::Ignore => {}
            HandlerRef::Goto(target) => {
                check_step(flow, target)?;
            }
            HandlerRef::Flow(target) => {
                check_flow(flows, flow, target)?;
            }
        }
    }

    match &step.kind {
        StepKind::Collect(collect) => {
            if let Some(validator) = &collect.validator {
                if !validators.contains(validator) {
                    return Err(FlowConfigError::UnknownValidator {
                        flow: flow.name.clone(),
                        step: step.id.clone(),
                        validator: validator.clone(),
                    });
                }
            }
        }
        StepKind::CallFlow(call) => {
            let callee = check_flow(flows, flow, &call.flow)?;
            for name in call.outputs.keys() {
                if !callee.declares_output(name) {
                    return Err(undeclared(flow, step, callee, name, "an output"));
                }
            }
            for name in call.inputs.keys() {
                if !callee.inputs.iter().any(|i| &i.name == name) {
                    return Err(undeclared(flow, step, callee, name, "an input"));
                }
            }
            if let Some(input) = callee
                .inputs
                .iter()
                .find(|i| !i.optional && !call.inputs.contains_key(&i.name))
            {
                return Err(FlowConfigError::UnboundInput {
                    flow: flow.name.clone(),
                    step: step.id.clone(),
                    callee: callee.name.clone(),
                    input: input.name.clone(),
                });
            }
        }
        StepKind::Branch(branch) => {
            let then = check_step_or_end(flow, &branch.then)?;
            if let Some(otherwise) = &branch.otherwise {
                check_step_or_end(flow, otherwise)?;
            }
            match branch.mode {
                BranchMode::If if then <= index => {
                    return Err(invalid_branch(flow, step, "`if` branches must jump forward"));
                }
                BranchMode::While if then > index => {
                    return Err(invalid_branch(
                        flow,
                        step,
                        "`while` branches must jump back to the loop head",
                    ));
                }
                _ => {}
            }
        }
        StepKind::Say { .. }
        | StepKind::Confirm(_)
        | StepKind::Action(_)
        | StepKind::Generate(_) => {}
    }
    Ok(())
}

fn check_flow<'a>(
    flows: &'a FlowsList,
    flow: &FlowDefinition,
    target: &str,
) -> Result<&'a FlowDefinition, FlowConfigError> {
    flows.get(target).ok_or_else(|| FlowConfigError::UnknownFlow {
        flow: flow.name.clone(),
        target: target.to_string(),
    })
}

fn check_step(flow: &FlowDefinition, target: &str) -> Result<usize, FlowConfigError> {
    flow.step_index(target)
        .ok_or_else(|| FlowConfigError::UnknownStep {
            flow: flow.name.clone(),
            target: target.to_string(),
        })
}

fn check_step_or_end(flow: &FlowDefinition, target: &str) -> Result<usize, FlowConfigError> {
    flow.target_index(target)
        .ok_or_else(|| FlowConfigError::UnknownStep {
            flow: flow.name.clone(),
            target: target.to_string(),
        })
}

fn undeclared(
    flow: &FlowDefinition,
    step: &Step,
    callee: &FlowDefinition,
    name: &str,
    direction: &'static str,
) -> FlowConfigError {
    FlowConfigError::UndeclaredBinding {
        flow: flow.name.clone(),
        step: step.id.clone(),
        callee: callee.name.clone(),
        name: name.to_string(),
        direction,
    }
}

fn invalid_branch(flow: &FlowDefinition, step: &Step, reason: &str) -> FlowConfigError {
    FlowConfigError::InvalidBranch {
        flow: flow.name.clone(),
        step: step.id.clone(),
        reason: reason.to_string(),
    }
}
