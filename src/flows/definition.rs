//! Flow definitions as handed to the runtime

use super::step::{Step, StepKind, END_TARGET};
use crate::expr::Expression;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

fn default_true() -> bool {
    true
}

/// Declared flow input
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RawInput")]
pub struct InputDecl {
    pub name: String,
    pub optional: bool,
}

/// Inputs may be written as a bare name or as `{ name, optional }`
#[derive(Deserialize)]
#[serde(untagged)]
enum RawInput {
    Name(String),
    Full {
        name: String,
        #[serde(default)]
        optional: bool,
    },
}

impl From<RawInput> for InputDecl {
    fn from(raw: RawInput) -> Self {
        match raw {
            RawInput::Name(name) => Self {
                name,
                optional: false,
            },
            RawInput::Full { name, optional } => Self { name, optional },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Trigger {
    /// Example utterances, consumed by the NLU collaborator only
    #[serde(default)]
    pub intents: Vec<String>,
    /// Guard evaluated when the flow is started
    #[serde(default, rename = "if")]
    pub condition: Option<Expression>,
}

/// Immutable description of one named conversation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub inputs: Vec<InputDecl>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default = "default_true")]
    pub interruptible: bool,
    #[serde(default)]
    pub trigger: Option<Trigger>,
    /// Step id to jump to when a step fails
    #[serde(default)]
    pub on_error: Option<String>,
    /// Overrides the engine default when set
    #[serde(default)]
    pub confirm_before_cancel: Option<bool>,
    #[serde(skip)]
    step_index: HashMap<String, usize>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        let mut flow = Self {
            name: name.into(),
            description: String::new(),
            steps,
            inputs: Vec::new(),
            outputs: Vec::new(),
            interruptible: true,
            trigger: None,
            on_error: None,
            confirm_before_cancel: None,
            step_index: HashMap::new(),
        };
        flow.assign_step_ids();
        flow
    }

    /// Fill in missing step ids and rebuild the id → index table.
    ///
    /// Returns the first duplicated id, if any.
    pub(crate) fn assign_step_ids(&mut self) -> Option<String> {
        let mut duplicate = None;
        self.step_index.clear();
        for (index, step) in self.steps.iter_mut().enumerate() {
            if step.id.is_empty() {
                step.id = format!("{}_{index}", step.kind.name());
            }
            if self.step_index.insert(step.id.clone(), index).is_some() && duplicate.is_none() {
                duplicate = Some(step.id.clone());
            }
        }
        duplicate
    }

    pub fn step(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn step_index(&self, id: &str) -> Option<usize> {
        self.step_index.get(id).copied()
    }

    /// Resolve a branch target; `END` maps one past the last step
    pub fn target_index(&self, target: &str) -> Option<usize> {
        if target == END_TARGET {
            Some(self.steps.len())
        } else {
            self.step_index(target)
        }
    }

    /// Index of the `collect` step filling `slot`
    pub fn collect_index(&self, slot: &str) -> Option<usize> {
        self.steps
            .iter()
            .position(|step| step.collected_slot() == Some(slot))
    }

    pub fn declares_output(&self, name: &str) -> bool {
        self.outputs.iter().any(|o| o == name)
    }

    /// Every slot name this flow reads or writes in its own frame
    pub fn declared_slots(&self) -> BTreeSet<String> {
        let mut slots: BTreeSet<String> = self.inputs.iter().map(|i| i.name.clone()).collect();
        slots.extend(self.outputs.iter().cloned());
        for step in &self.steps {
            match &step.kind {
                StepKind::Collect(c) => {
                    slots.insert(c.slot.clone());
                }
                StepKind::Confirm(c) => slots.extend(c.slot.iter().cloned()),
                StepKind::Generate(g) => slots.extend(g.slot.iter().cloned()),
                StepKind::Action(a) => slots.extend(a.outputs.values().cloned()),
                StepKind::CallFlow(c) => slots.extend(c.outputs.values().cloned()),
                StepKind::Say { .. } | StepKind::Branch(_) => {}
            }
        }
        slots
    }

    pub fn confirm_before_cancel(&self, default: bool) -> bool {
        self.confirm_before_cancel.unwrap_or(default)
    }

    pub fn trigger_condition(&self) -> Option<&Expression> {
        self.trigger.as_ref().and_then(|t| t.condition.as_ref())
    }
}
