//! In-process collaborators: registered actions and template responses

use super::error::{ActionError, GenerationError};
use super::traits::{ActionExecutor, Clarification, ResponseGenerator};
use crate::expr::Scope;
use crate::flows::template::render;
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// A custom action callable from `action` steps
#[async_trait]
pub trait Action: Send + Sync {
    /// Long-running actions should watch `cancel` and return early
    async fn run(
        &self,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError>;
}

/// Synchronous closure as an action
struct FnAction<F>(F);

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Map<String, Value>) -> Result<Map<String, Value>, ActionError> + Send + Sync,
{
    async fn run(
        &self,
        inputs: Map<String, Value>,
        _cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        (self.0)(&inputs)
    }
}

/// Actions registered by name
#[derive(Clone, Default)]
pub struct ActionRegistry {
    actions: HashMap<String, Arc<dyn Action>>,
}

impl ActionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, action: impl Action + 'static) {
        self.actions.insert(name.into(), Arc::new(action));
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(&Map<String, Value>) -> Result<Map<String, Value>, ActionError>
            + Send
            + Sync
            + 'static,
    {
        self.register(name, FnAction(f));
    }

    pub fn contains(&self, name: &str) -> bool {
        self.actions.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }
}

#[async_trait]
impl ActionExecutor for ActionRegistry {
    async fn execute(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        let action = self
            .actions
            .get(name)
            .ok_or_else(|| ActionError::not_found(format!("Unknown action: {name}")))?;
        tracing::debug!(action = %name, "Running registered action");
        action.run(inputs, cancel).await
    }
}

// ============================================================================
// Template responses
// ============================================================================

/// Renders the instruction itself as a message template, with `{slot}` and
/// `{session.var}` taken from the generation context. Useful without a
/// language model and in tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResponseGenerator;

struct ContextScope<'a>(&'a Value);

impl Scope for ContextScope<'_> {
    fn resolve(&self, path: &[String]) -> Value {
        let lookup = |root: &Value, path: &[String]| {
            path.iter()
                .try_fold(root, |current, segment| current.get(segment.as_str()))
                .cloned()
        };
        let Some(head) = path.first() else {
            return Value::Null;
        };
        if head == "slots" || head == "session" {
            return lookup(self.0, path).unwrap_or(Value::Null);
        }
        ["slots", "session"]
            .iter()
            .find_map(|root| self.0.get(*root).and_then(|r| lookup(r, path)))
            .unwrap_or(Value::Null)
    }
}

#[async_trait]
impl ResponseGenerator for TemplateResponseGenerator {
    async fn generate(
        &self,
        instruction: &str,
        context: &Value,
    ) -> Result<String, GenerationError> {
        Ok(render(instruction, &ContextScope(context)))
    }

    async fn explain(&self, request: &Clarification) -> Result<String, GenerationError> {
        Ok(match &request.topic {
            Some(topic) => format!(
                "I need the {} to continue with {}.",
                topic.replace('_', " "),
                request.description
            ),
            None => format!("We are currently {}.", request.description),
        })
    }
}
