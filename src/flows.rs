//! Flow definitions, loading and load-time validation
//!
//! Flows arrive as data (YAML) and are checked once at load; anything that
//! would otherwise fail mid-conversation (unknown flow references, missing
//! special flows, dangling step ids) is a configuration error here.

mod definition;
mod loader;
pub mod step;
pub mod template;
mod validation;

pub use definition::{FlowDefinition, InputDecl, Trigger};
pub use loader::{load_flows, parse_flows};
pub use step::{HandlerRef, Step, StepKind};

use crate::validators::ValidatorRegistry;
use std::collections::BTreeMap;
use std::path::PathBuf;
use thiserror::Error;

pub const WELCOME_FLOW: &str = "welcome";
pub const FALLBACK_FLOW: &str = "fallback";
pub const GOODBYE_FLOW: &str = "goodbye";
pub const HELP_FLOW: &str = "help";

#[derive(Error, Debug)]
pub enum FlowConfigError {
    #[error("Failed to read flow file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid flow file: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Required flow '{0}' is not defined")]
    MissingSpecialFlow(&'static str),
    #[error("Flow '{0}' has no steps")]
    EmptyFlow(String),
    #[error("Flow '{flow}' defines step '{step}' more than once")]
    DuplicateStep { flow: String, step: String },
    #[error("Flow '{flow}' references unknown flow '{target}'")]
    UnknownFlow { flow: String, target: String },
    #[error("Flow '{flow}' references unknown step '{target}'")]
    UnknownStep { flow: String, target: String },
    #[error("Flow '{flow}' step '{step}' uses unknown validator '{validator}'")]
    UnknownValidator {
        flow: String,
        step: String,
        validator: String,
    },
    #[error(
        "Flow '{flow}' step '{step}' binds '{name}', \
         which flow '{callee}' does not declare as {direction}"
    )]
    UndeclaredBinding {
        flow: String,
        step: String,
        callee: String,
        name: String,
        direction: &'static str,
    },
    #[error("Flow '{flow}' step '{step}' does not bind required input '{input}' of '{callee}'")]
    UnboundInput {
        flow: String,
        step: String,
        callee: String,
        input: String,
    },
    #[error("Flow '{flow}' step '{step}': {reason}")]
    InvalidBranch {
        flow: String,
        step: String,
        reason: String,
    },
}

/// All flows known to the engine, validated and immutable
#[derive(Debug, Clone)]
pub struct FlowsList {
    flows: BTreeMap<String, FlowDefinition>,
}

impl FlowsList {
    /// Build and validate a flow set
    pub fn new(
        definitions: Vec<FlowDefinition>,
        validators: &ValidatorRegistry,
    ) -> Result<Self, FlowConfigError> {
        let mut flows = BTreeMap::new();
        for mut flow in definitions {
            if let Some(step) = flow.assign_step_ids() {
                return Err(FlowConfigError::DuplicateStep {
                    flow: flow.name,
                    step,
                });
            }
            flows.insert(flow.name.clone(), flow);
        }
        let list = Self { flows };
        validation::validate(&list, validators)?;
        Ok(list)
    }

    pub fn get(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.flows.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.flows.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FlowDefinition> {
        self.flows.values()
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }
}
