//! Step types

use crate::expr::Expression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reserved branch target that ends the flow
pub const END_TARGET: &str = "END";

/// One step of a flow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Unique within the flow; defaults to `<kind>_<index>` when omitted
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub kind: StepKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    Say { text: String },
    Collect(CollectStep),
    Confirm(ConfirmStep),
    Action(ActionStep),
    CallFlow(CallFlowStep),
    Generate(GenerateStep),
    Branch(BranchStep),
}

impl StepKind {
    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Say { .. } => "say",
            StepKind::Collect(_) => "collect",
            StepKind::Confirm(_) => "confirm",
            StepKind::Action(_) => "action",
            StepKind::CallFlow(_) => "call_flow",
            StepKind::Generate(_) => "generate",
            StepKind::Branch(_) => "branch",
        }
    }
}

impl Step {
    /// Cancel override, only `collect` and `confirm` carry one
    pub fn on_cancel(&self) -> Option<&HandlerRef> {
        match &self.kind {
            StepKind::Collect(c) => c.on_cancel.as_ref(),
            StepKind::Confirm(c) => c.on_cancel.as_ref(),
            _ => None,
        }
    }

    /// Correction override, only `collect` and `confirm` carry one
    pub fn on_correction(&self) -> Option<&HandlerRef> {
        match &self.kind {
            StepKind::Collect(c) => c.on_correction.as_ref(),
            StepKind::Confirm(c) => c.on_correction.as_ref(),
            _ => None,
        }
    }

    pub fn is_confirm(&self) -> bool {
        matches!(self.kind, StepKind::Confirm(_))
    }

    /// Slot filled by this step when it is a `collect` step
    pub fn collected_slot(&self) -> Option<&str> {
        match &self.kind {
            StepKind::Collect(c) => Some(&c.slot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectStep {
    pub slot: String,
    #[serde(default)]
    pub prompt: Option<String>,
    /// Name of a registered validator
    #[serde(default)]
    pub validator: Option<String>,
    #[serde(default)]
    pub rejections: Vec<Rejection>,
    /// Ask even when a value is already known
    #[serde(default)]
    pub ask_before_filling: bool,
    #[serde(default)]
    pub on_cancel: Option<HandlerRef>,
    #[serde(default)]
    pub on_correction: Option<HandlerRef>,
}

impl CollectStep {
    pub fn prompt_template(&self) -> String {
        self.prompt
            .clone()
            .unwrap_or_else(|| format!("Please provide a value for {}.", self.slot))
    }
}

/// Rejects the candidate value when `condition` holds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rejection {
    #[serde(rename = "if")]
    pub condition: Expression,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfirmStep {
    pub prompt: String,
    /// Slot that receives the boolean answer
    #[serde(default)]
    pub slot: Option<String>,
    #[serde(default)]
    pub on_cancel: Option<HandlerRef>,
    #[serde(default)]
    pub on_correction: Option<HandlerRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionStep {
    pub action: String,
    /// Action parameter name → expression evaluated in the frame scope
    #[serde(default)]
    pub inputs: BTreeMap<String, Expression>,
    /// Result field → slot name
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallFlowStep {
    pub flow: String,
    /// Child input name → expression evaluated in the caller scope
    #[serde(default)]
    pub inputs: BTreeMap<String, Expression>,
    /// Child output name → caller slot name
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerateStep {
    pub instruction: String,
    /// Slot that also receives the generated text
    #[serde(default)]
    pub slot: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchMode {
    /// Forward jump when the condition holds
    #[default]
    If,
    /// Backward jump to the loop head while the condition holds
    While,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BranchStep {
    #[serde(rename = "if")]
    pub condition: Expression,
    #[serde(default)]
    pub mode: BranchMode,
    /// Step id, or `END`
    pub then: String,
    /// Step id or `END`; defaults to the next step
    #[serde(default, rename = "else")]
    pub otherwise: Option<String>,
}

/// Per-step replacement for the global cancel/correction behavior.
///
/// Written in flow files as `ignore`, `goto:<step id>` or `flow:<flow name>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum HandlerRef {
    /// Drop the command
    Ignore,
    /// Jump to a step of the same flow
    Goto(String),
    /// Push another flow on top
    Flow(String),
}

impl TryFrom<String> for HandlerRef {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value == "ignore" {
            return Ok(HandlerRef::Ignore);
        }
        match value.split_once(':') {
            Some(("goto", step)) if !step.trim().is_empty() => {
                Ok(HandlerRef::Goto(step.trim().to_string()))
            }
            Some(("flow", flow)) if !flow.trim().is_empty() => {
                Ok(HandlerRef::Flow(flow.trim().to_string()))
            }
            _ => Err(format!(
                "invalid handler '{value}', expected `ignore`, `goto:<step>` or `flow:<name>`"
            )),
        }
    }
}

impl From<HandlerRef> for String {
    fn from(value: HandlerRef) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HandlerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerRef::Ignore => f.write_str("ignore"),
            HandlerRef::Goto(step) => write!(f, "goto:{step}"),
            HandlerRef::Flow(flow) => write!(f, "flow:{flow}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_ref_parsing() {
        assert_eq!(HandlerRef::try_from("ignore".to_string()), Ok(HandlerRef::Ignore));
        assert_eq!(
            HandlerRef::try_from("goto: summary".to_string()),
            Ok(HandlerRef::Goto("summary".to_string()))
        );
        assert_eq!(
            HandlerRef::try_from("flow:cancel_survey".to_string()),
            Ok(HandlerRef::Flow("cancel_survey".to_string()))
        );
        assert!(HandlerRef::try_from("goto:".to_string()).is_err());
        assert!(HandlerRef::try_from("jump:x".to_string()).is_err());
    }

    #[test]
    fn test_step_deserializes_from_tagged_map() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "id": "ask_amount",
            "kind": "collect",
            "slot": "amount",
            "validator": "number",
            "on_cancel": "goto:summary",
            "rejections": [{ "if": "slots.amount > 1000", "message": "Too much." }]
        }))
        .unwrap();
        assert_eq!(step.id, "ask_amount");
        assert_eq!(step.collected_slot(), Some("amount"));
        assert_eq!(step.on_cancel(), Some(&HandlerRef::Goto("summary".to_string())));
        let StepKind::Collect(collect) = &step.kind else {
            panic!("expected collect step");
        };
        assert_eq!(collect.rejections.len(), 1);
        assert_eq!(collect.prompt_template(), "Please provide a value for amount.");
    }

    #[test]
    fn test_branch_defaults_to_if() {
        let step: Step = serde_json::from_value(serde_json::json!({
            "kind": "branch",
            "if": "slots.confirmed",
            "then": "END"
        }))
        .unwrap();
        let StepKind::Branch(branch) = &step.kind else {
            panic!("expected branch step");
        };
        assert_eq!(branch.mode, BranchMode::If);
        assert!(branch.otherwise.is_none());
        assert!(step.id.is_empty());
    }
}
