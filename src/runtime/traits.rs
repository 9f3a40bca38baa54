//! Trait abstractions for runtime I/O
//!
//! These traits enable testing the session runtime with mock implementations.

use super::error::{ActionError, GenerationError, NluError};
use crate::db::Database;
use crate::state_machine::state::HistoryEntry;
use crate::state_machine::{DialogueState, ScoredCommand};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything the NLU gets to see for one user message
#[derive(Debug, Clone, Serialize)]
pub struct NluRequest {
    pub session_id: String,
    pub message: String,
    pub history: Vec<HistoryEntry>,
    /// Active flow, prompted slot, filled slots and available flows
    pub context: Value,
    pub now: DateTime<Utc>,
}

/// Turns a user message into commands
#[async_trait]
pub trait CommandGenerator: Send + Sync {
    async fn generate(&self, request: &NluRequest) -> Result<Vec<ScoredCommand>, NluError>;
}

/// Runs custom actions on behalf of `action` steps
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    /// Execute an action by name with cancellation support
    async fn execute(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError>;
}

/// What the user asked to have explained
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Clarification {
    pub flow: String,
    /// Flow description, or its name when it has none
    pub description: String,
    pub topic: Option<String>,
    /// The question the user was asked last
    pub prompt: Option<String>,
}

impl Clarification {
    pub fn instruction(&self) -> String {
        let subject = self
            .topic
            .as_deref()
            .map_or_else(|| "the current step".to_string(), |t| format!("'{t}'"));
        format!(
            "The user is {} and asked for clarification about {subject}. \
             Explain briefly what is needed and why.",
            self.description
        )
    }

    fn context(&self) -> Value {
        json!({
            "flow": self.flow,
            "topic": self.topic,
            "prompt": self.prompt,
        })
    }
}

/// Produces free text for `generate` steps and clarifications
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, instruction: &str, context: &Value) -> Result<String, GenerationError>;

    async fn explain(&self, request: &Clarification) -> Result<String, GenerationError> {
        self.generate(&request.instruction(), &request.context()).await
    }
}

/// Storage for dialogue state
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), String>;

    /// `None` for a session never seen before
    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, String>;

    async fn delete(&self, session_id: &str) -> Result<(), String>;
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: CommandGenerator + ?Sized> CommandGenerator for Arc<T> {
    async fn generate(&self, request: &NluRequest) -> Result<Vec<ScoredCommand>, NluError> {
        (**self).generate(request).await
    }
}

#[async_trait]
impl<T: ActionExecutor + ?Sized> ActionExecutor for Arc<T> {
    async fn execute(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        (**self).execute(name, inputs, cancel).await
    }
}

#[async_trait]
impl<T: ResponseGenerator + ?Sized> ResponseGenerator for Arc<T> {
    async fn generate(
        &self,
        instruction: &str,
        context: &Value,
    ) -> Result<String, GenerationError> {
        (**self).generate(instruction, context).await
    }

    async fn explain(&self, request: &Clarification) -> Result<String, GenerationError> {
        (**self).explain(request).await
    }
}

#[async_trait]
impl<T: StateStore + ?Sized> StateStore for Arc<T> {
    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), String> {
        (**self).save(session_id, state).await
    }

    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, String> {
        (**self).load(session_id).await
    }

    async fn delete(&self, session_id: &str) -> Result<(), String> {
        (**self).delete(session_id).await
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

/// Adapter to use Database as `StateStore`
#[derive(Clone)]
pub struct DatabaseStore {
    db: Database,
}

impl DatabaseStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl StateStore for DatabaseStore {
    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), String> {
        self.db
            .save_state(session_id, state)
            .map_err(|e| e.to_string())
    }

    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, String> {
        self.db.load_state(session_id).map_err(|e| e.to_string())
    }

    async fn delete(&self, session_id: &str) -> Result<(), String> {
        self.db
            .delete_session(session_id)
            .map(|_| ())
            .map_err(|e| e.to_string())
    }
}
