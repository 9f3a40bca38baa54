//! Mock implementations for testing
//!
//! These mocks enable runtime testing without real I/O.

use super::error::{ActionError, GenerationError, NluError};
use super::traits::{
    ActionExecutor, Clarification, CommandGenerator, NluRequest, ResponseGenerator, StateStore,
};
use crate::state_machine::{Command, DialogueState, ScoredCommand};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Mock Command Generator
// ============================================================================

/// Returns queued command lists in order; an empty queue yields no commands
#[derive(Default)]
pub struct MockCommandGenerator {
    responses: Mutex<VecDeque<Result<Vec<ScoredCommand>, NluError>>>,
    /// Record of all requests made
    pub requests: Mutex<Vec<NluRequest>>,
}

impl MockCommandGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, commands: Vec<Command>) {
        self.queue_scored(commands.into_iter().map(ScoredCommand::certain).collect());
    }

    pub fn queue_scored(&self, commands: Vec<ScoredCommand>) {
        self.responses.lock().unwrap().push_back(Ok(commands));
    }

    pub fn queue_error(&self, error: NluError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<NluRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandGenerator for MockCommandGenerator {
    async fn generate(&self, request: &NluRequest) -> Result<Vec<ScoredCommand>, NluError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}

// ============================================================================
// Mock Action Executor
// ============================================================================

/// Action executor with predefined results
#[derive(Default)]
pub struct MockActionExecutor {
    results: HashMap<String, Result<Map<String, Value>, ActionError>>,
    /// Record of action calls
    pub executions: Mutex<Vec<(String, Map<String, Value>)>>,
}

impl MockActionExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_result(mut self, name: impl Into<String>, result: Map<String, Value>) -> Self {
        self.results.insert(name.into(), Ok(result));
        self
    }

    pub fn with_error(mut self, name: impl Into<String>, error: ActionError) -> Self {
        self.results.insert(name.into(), Err(error));
        self
    }

    pub fn recorded_executions(&self) -> Vec<(String, Map<String, Value>)> {
        self.executions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ActionExecutor for MockActionExecutor {
    async fn execute(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        _cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        self.executions
            .lock()
            .unwrap()
            .push((name.to_string(), inputs));
        self.results
            .get(name)
            .cloned()
            .unwrap_or_else(|| Err(ActionError::not_found(format!("Unknown action: {name}"))))
    }
}

// ============================================================================
// Delayed Mock Action Executor (for timeout testing)
// ============================================================================

/// Sleeps before answering, keeping the cancellation token of every call
pub struct DelayedActionExecutor {
    delay: Duration,
    pub tokens: Mutex<Vec<CancellationToken>>,
}

impl DelayedActionExecutor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            tokens: Mutex::new(Vec::new()),
        }
    }

    pub fn all_cancelled(&self) -> bool {
        let tokens = self.tokens.lock().unwrap();
        !tokens.is_empty() && tokens.iter().all(CancellationToken::is_cancelled)
    }
}

#[async_trait]
impl ActionExecutor for DelayedActionExecutor {
    async fn execute(
        &self,
        _name: &str,
        _inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        self.tokens.lock().unwrap().push(cancel);
        tokio::time::sleep(self.delay).await;
        Ok(Map::new())
    }
}

// ============================================================================
// Gated Mock Action Executor (for queueing tests)
// ============================================================================

/// Blocks every call until `release` is notified
#[derive(Default)]
pub struct GatedActionExecutor {
    pub started: Notify,
    pub release: Notify,
}

#[async_trait]
impl ActionExecutor for GatedActionExecutor {
    async fn execute(
        &self,
        _name: &str,
        _inputs: Map<String, Value>,
        _cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        self.started.notify_one();
        self.release.notified().await;
        Ok(Map::new())
    }
}

// ============================================================================
// Mock Response Generator
// ============================================================================

/// Returns queued texts, or the instruction itself once the queue is empty
#[derive(Default)]
pub struct MockResponseGenerator {
    responses: Mutex<VecDeque<Result<String, GenerationError>>>,
    pub instructions: Mutex<Vec<String>>,
    pub clarifications: Mutex<Vec<Clarification>>,
}

impl MockResponseGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn queue(&self, text: impl Into<String>) {
        self.responses.lock().unwrap().push_back(Ok(text.into()));
    }

    pub fn queue_error(&self, error: GenerationError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }
}

#[async_trait]
impl ResponseGenerator for MockResponseGenerator {
    async fn generate(
        &self,
        instruction: &str,
        _context: &Value,
    ) -> Result<String, GenerationError> {
        self.instructions
            .lock()
            .unwrap()
            .push(instruction.to_string());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(instruction.to_string()))
    }

    async fn explain(&self, request: &Clarification) -> Result<String, GenerationError> {
        self.clarifications.lock().unwrap().push(request.clone());
        Ok(format!("About {}", request.topic.as_deref().unwrap_or("this")))
    }
}

// ============================================================================
// In-memory State Store
// ============================================================================

#[derive(Default)]
pub struct InMemoryStateStore {
    states: Mutex<HashMap<String, DialogueState>>,
    fail_saves: AtomicBool,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: DialogueState) {
        self.states
            .lock()
            .unwrap()
            .insert(state.session_id.clone(), state);
    }

    pub fn get(&self, session_id: &str) -> Option<DialogueState> {
        self.states.lock().unwrap().get(session_id).cloned()
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn save(&self, session_id: &str, state: &DialogueState) -> Result<(), String> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err("disk full".to_string());
        }
        self.states
            .lock()
            .unwrap()
            .insert(session_id.to_string(), state.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<DialogueState>, String> {
        Ok(self.get(session_id))
    }

    async fn delete(&self, session_id: &str) -> Result<(), String> {
        self.states.lock().unwrap().remove(session_id);
        Ok(())
    }
}
