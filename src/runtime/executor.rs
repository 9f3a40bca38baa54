//! Session runtime: one user message in, assistant messages out

use super::error::{CallError, RuntimeError};
use super::traits::{
    ActionExecutor, Clarification, CommandGenerator, NluRequest, ResponseGenerator, StateStore,
};
use crate::state_machine::state::Speaker;
use crate::state_machine::{
    filter_by_confidence, transition, Command, DialogueContext, DialogueState, Effect, Event,
    FrameId, Phase, TransitionResult,
};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// What the assistant said in one turn
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnReply {
    pub session_id: String,
    pub messages: Vec<String>,
    pub phase: Phase,
    pub handed_off: bool,
}

/// Work queued for a session task
#[derive(Debug)]
pub enum SessionRequest {
    Turn {
        message: String,
        reply: oneshot::Sender<Result<TurnReply, RuntimeError>>,
    },
    /// Forget the stored state; the next message starts over with `welcome`
    Reset {
        reply: oneshot::Sender<Result<(), RuntimeError>>,
    },
}

/// Generic session runtime that can work with any storage, NLU, action and
/// generation implementations
pub struct SessionRuntime<S, N, A, G>
where
    S: StateStore,
    N: CommandGenerator,
    A: ActionExecutor,
    G: ResponseGenerator,
{
    session_id: String,
    context: Arc<DialogueContext>,
    /// Loaded lazily on the first turn
    state: Option<DialogueState>,
    store: S,
    nlu: N,
    actions: A,
    generator: G,
}

impl<S, N, A, G> SessionRuntime<S, N, A, G>
where
    S: StateStore,
    N: CommandGenerator,
    A: ActionExecutor,
    G: ResponseGenerator,
{
    pub fn new(
        session_id: impl Into<String>,
        context: Arc<DialogueContext>,
        store: S,
        nlu: N,
        actions: A,
        generator: G,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            context,
            state: None,
            store,
            nlu,
            actions,
            generator,
        }
    }

    pub fn state(&self) -> Option<&DialogueState> {
        self.state.as_ref()
    }

    /// Drain requests until every sender is gone
    pub async fn run(mut self, mut requests: mpsc::Receiver<SessionRequest>) {
        tracing::info!(session_id = %self.session_id, "Starting session runtime");
        while let Some(request) = requests.recv().await {
            match request {
                SessionRequest::Turn { message, reply } => {
                    let result = self.handle_message(&message).await;
                    if let Err(e) = &result {
                        tracing::error!(session_id = %self.session_id, error = %e, "Turn failed");
                    }
                    let _ = reply.send(result);
                }
                SessionRequest::Reset { reply } => {
                    let _ = reply.send(self.reset().await);
                }
            }
        }
        tracing::info!(session_id = %self.session_id, "Session runtime stopped");
    }

    pub async fn reset(&mut self) -> Result<(), RuntimeError> {
        self.store
            .delete(&self.session_id)
            .await
            .map_err(RuntimeError::Store)?;
        self.state = None;
        tracing::info!(session_id = %self.session_id, "Session reset");
        Ok(())
    }

    /// Run one user turn: understand, transition, carry out effects, persist
    pub async fn handle_message(&mut self, message: &str) -> Result<TurnReply, RuntimeError> {
        let mut messages = Vec::new();
        let mut state = match self.state.take() {
            Some(state) => state,
            None => self.load_or_start(&mut messages).await?,
        };

        if state.is_handed_off() {
            tracing::debug!(session_id = %self.session_id, "Session is handed off, not responding");
            return Ok(self.finish(state, messages).await);
        }

        let commands = self.understand(&state, message).await;
        state.record(Speaker::User, message, self.context.config.history_limit);
        let kinds: Vec<&str> = commands.iter().map(Command::kind).collect();
        tracing::debug!(session_id = %self.session_id, commands = ?kinds, "Understood message");

        let result = match transition(&state, &self.context, Event::Commands { commands }) {
            Ok(result) => result,
            Err(e) => {
                self.state = Some(state);
                return Err(e.into());
            }
        };
        let state = match self.drive(result, &mut messages).await {
            Ok(state) => state,
            Err((state, e)) => {
                self.state = Some(state);
                return Err(e);
            }
        };
        Ok(self.finish(state, messages).await)
    }

    async fn load_or_start(
        &mut self,
        messages: &mut Vec<String>,
    ) -> Result<DialogueState, RuntimeError> {
        if let Some(state) = self
            .store
            .load(&self.session_id)
            .await
            .map_err(RuntimeError::Store)?
        {
            tracing::debug!(
                session_id = %self.session_id,
                phase = state.phase.as_str(),
                "Restored session"
            );
            return Ok(state);
        }
        tracing::info!(session_id = %self.session_id, "New session");
        let fresh = DialogueState::new(self.session_id.clone());
        let result = transition(&fresh, &self.context, Event::SessionStarted)?;
        self.drive(result, messages).await.map_err(|(_, e)| e)
    }

    /// Record the assistant's messages, persist, and keep the state
    async fn finish(&mut self, mut state: DialogueState, messages: Vec<String>) -> TurnReply {
        let limit = self.context.config.history_limit;
        for text in &messages {
            state.record(Speaker::Assistant, text.clone(), limit);
        }
        if let Err(e) = self.store.save(&self.session_id, &state).await {
            tracing::error!(session_id = %self.session_id, error = %e, "Failed to persist state");
        }
        let reply = TurnReply {
            session_id: self.session_id.clone(),
            messages,
            phase: state.phase,
            handed_off: state.is_handed_off(),
        };
        self.state = Some(state);
        reply
    }

    // ========================================================================
    // Language understanding
    // ========================================================================

    async fn understand(&self, state: &DialogueState, message: &str) -> Vec<Command> {
        let request = NluRequest {
            session_id: self.session_id.clone(),
            message: message.to_string(),
            history: state.history.iter().cloned().collect(),
            context: snapshot(state, &self.context),
            now: chrono::Utc::now(),
        };
        let timeout = self.context.config.nlu_timeout;
        let result = match tokio::time::timeout(timeout, self.nlu.generate(&request)).await {
            Ok(result) => result,
            Err(_) => Err(CallError::timed_out(timeout)),
        };
        match result {
            Ok(scored) => filter_by_confidence(scored, self.context.config.min_command_confidence),
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    kind = ?e.kind,
                    error = %e,
                    "Command generation failed, treating message as out of scope"
                );
                vec![Command::OutOfScope]
            }
        }
    }

    // ========================================================================
    // Effects
    // ========================================================================

    /// Carry out effects, feeding action and generation results back in,
    /// until the machine waits on the user
    async fn drive(
        &self,
        mut result: TransitionResult,
        messages: &mut Vec<String>,
    ) -> Result<DialogueState, (DialogueState, RuntimeError)> {
        loop {
            let mut follow_up = None;
            for effect in result.effects {
                if let Some(event) = self.execute_effect(effect, messages).await {
                    follow_up = Some(event);
                }
            }
            let state = result.new_state;
            let Some(event) = follow_up else {
                return Ok(state);
            };
            result = match transition(&state, &self.context, event) {
                Ok(next) => next,
                Err(e) => return Err((state, e.into())),
            };
        }
    }

    async fn execute_effect(&self, effect: Effect, messages: &mut Vec<String>) -> Option<Event> {
        match effect {
            Effect::Utter { text } => {
                messages.push(text);
                None
            }
            Effect::InvokeAction {
                frame_id,
                action,
                inputs,
            } => Some(self.invoke_action(frame_id, &action, inputs).await),
            Effect::Generate {
                frame_id,
                instruction,
                context,
            } => Some(self.generate(frame_id, &instruction, &context).await),
            Effect::Explain {
                flow,
                topic,
                prompt,
            } => {
                if let Some(text) = self.explain(flow, topic, prompt).await {
                    messages.push(text);
                }
                None
            }
            Effect::Handoff { reason } => {
                tracing::info!(
                    session_id = %self.session_id,
                    reason = reason.as_deref().unwrap_or(""),
                    "Session handed off"
                );
                None
            }
        }
    }

    async fn invoke_action(
        &self,
        frame_id: FrameId,
        action: &str,
        inputs: Map<String, Value>,
    ) -> Event {
        tracing::info!(session_id = %self.session_id, action = %action, "Invoking action");
        let cancel = CancellationToken::new();
        let timeout = self.context.config.action_timeout;
        let call = self.actions.execute(action, inputs, cancel.clone());
        match with_timeout(timeout, &cancel, call).await {
            Ok(result) => Event::ActionCompleted { frame_id, result },
            Err(e) => {
                tracing::warn!(
                    session_id = %self.session_id,
                    action = %action,
                    error = %e,
                    "Action failed"
                );
                Event::ActionFailed {
                    frame_id,
                    error: e.to_string(),
                }
            }
        }
    }

    async fn generate(&self, frame_id: FrameId, instruction: &str, context: &Value) -> Event {
        let cancel = CancellationToken::new();
        let timeout = self.context.config.generation_timeout;
        let call = self.generator.generate(instruction, context);
        match with_timeout(timeout, &cancel, call).await {
            Ok(text) => Event::GenerationCompleted { frame_id, text },
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Generation failed");
                Event::GenerationFailed {
                    frame_id,
                    error: e.to_string(),
                }
            }
        }
    }

    /// Clarifications are best effort; the prompt is re-issued regardless
    async fn explain(
        &self,
        flow: String,
        topic: Option<String>,
        prompt: Option<String>,
    ) -> Option<String> {
        let description = self
            .context
            .flow(&flow)
            .filter(|f| !f.description.is_empty())
            .map_or_else(|| flow.replace('_', " "), |f| f.description.clone());
        let request = Clarification {
            flow,
            description,
            topic,
            prompt,
        };
        let cancel = CancellationToken::new();
        let timeout = self.context.config.generation_timeout;
        match with_timeout(timeout, &cancel, self.generator.explain(&request)).await {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!(session_id = %self.session_id, error = %e, "Clarification failed");
                None
            }
        }
    }
}

/// Bound a collaborator call; on timeout the token is cancelled
async fn with_timeout<T>(
    timeout: Duration,
    cancel: &CancellationToken,
    call: impl std::future::Future<Output = Result<T, CallError>>,
) -> Result<T, CallError> {
    if let Ok(result) = tokio::time::timeout(timeout, call).await {
        result
    } else {
        cancel.cancel();
        Err(CallError::timed_out(timeout))
    }
}

/// Context handed to the NLU
pub fn snapshot(state: &DialogueState, ctx: &DialogueContext) -> Value {
    let top = state.top();
    let prompted_slot = top.and_then(|frame| match frame.suspension() {
        Some(crate::state_machine::state::Suspension::Collect { slot }) => Some(slot.clone()),
        _ => None,
    });
    let flows: Vec<Value> = ctx
        .flows
        .iter()
        .map(|flow| {
            json!({
                "name": flow.name,
                "description": flow.description,
                "intents": flow.trigger.as_ref().map(|t| t.intents.clone()).unwrap_or_default(),
            })
        })
        .collect();
    json!({
        "active_flow": top.map(|frame| frame.flow.clone()),
        "prompted_slot": prompted_slot,
        "prompt": top.and_then(|frame| frame.pending_prompt.clone()),
        "slots": top.map(crate::state_machine::FlowFrame::slot_values).unwrap_or_default(),
        "session": state.session,
        "stack": state.stack.iter().map(|frame| frame.flow.clone()).collect::<Vec<_>>(),
        "phase": state.phase.as_str(),
        "flows": flows,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::runtime::testing::{
        DelayedActionExecutor, InMemoryStateStore, MockActionExecutor, MockCommandGenerator,
        MockResponseGenerator,
    };
    use crate::state_machine::fixtures::context_with;
    use crate::state_machine::ScoredCommand;

    type TestRuntime<A> = SessionRuntime<
        Arc<InMemoryStateStore>,
        Arc<MockCommandGenerator>,
        Arc<A>,
        Arc<MockResponseGenerator>,
    >;

    struct Harness<A: ActionExecutor> {
        runtime: TestRuntime<A>,
        store: Arc<InMemoryStateStore>,
        nlu: Arc<MockCommandGenerator>,
        actions: Arc<A>,
        generator: Arc<MockResponseGenerator>,
    }

    fn harness<A: ActionExecutor>(config: EngineConfig, actions: A) -> Harness<A> {
        let store = Arc::new(InMemoryStateStore::new());
        let nlu = Arc::new(MockCommandGenerator::new());
        let actions = Arc::new(actions);
        let generator = Arc::new(MockResponseGenerator::new());
        let runtime = SessionRuntime::new(
            "s1",
            Arc::new(context_with(config)),
            store.clone(),
            nlu.clone(),
            actions.clone(),
            generator.clone(),
        );
        Harness {
            runtime,
            store,
            nlu,
            actions,
            generator,
        }
    }

    fn transfer_commands() -> Vec<Command> {
        vec![
            Command::start("transfer_money"),
            Command::set("recipient", "Ada"),
            Command::set("amount", 10),
        ]
    }

    #[tokio::test]
    async fn test_transfer_runs_action_with_slot_inputs() {
        let actions = MockActionExecutor::new().with_result(
            "execute_transfer",
            Map::from_iter([("id".to_string(), json!("tx-9"))]),
        );
        let mut h = harness(EngineConfig::default(), actions);
        h.nlu.queue(transfer_commands());
        h.nlu.queue(vec![Command::Affirm]);

        let first = h.runtime.handle_message("send 10 to Ada").await.unwrap();
        assert_eq!(
            first.messages,
            vec!["Hi! How can I help?", "Send 10 to Ada?"]
        );
        assert_eq!(first.phase, Phase::Confirming);

        let second = h.runtime.handle_message("yes").await.unwrap();
        assert_eq!(second.messages, vec!["Sent! Reference tx-9."]);
        assert_eq!(second.phase, Phase::Idle);

        let executions = h.actions.recorded_executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].0, "execute_transfer");
        assert_eq!(executions[0].1.get("to"), Some(&json!("Ada")));
        assert_eq!(executions[0].1.get("amount"), Some(&json!(10)));

        let state = h.store.get("s1").unwrap();
        assert_eq!(state.session.get("transfer_id"), Some(&json!("tx-9")));
    }

    #[tokio::test]
    async fn test_action_timeout_cancels_and_runs_error_step() {
        let config = EngineConfig {
            action_timeout: Duration::from_millis(20),
            ..EngineConfig::default()
        };
        let mut h = harness(config, DelayedActionExecutor::new(Duration::from_secs(5)));
        h.nlu.queue(transfer_commands());
        h.nlu.queue(vec![Command::Affirm]);

        h.runtime.handle_message("send 10 to Ada").await.unwrap();
        let reply = h.runtime.handle_message("yes").await.unwrap();

        assert_eq!(reply.messages, vec!["The transfer failed, nothing was sent."]);
        assert!(h.actions.all_cancelled());
        let state = h.runtime.state().unwrap();
        let error = &state.session[crate::state_machine::LAST_ERROR_VAR];
        assert_eq!(error["flow"], json!("transfer_money"));
        assert!(error["reason"].as_str().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_nlu_failure_is_out_of_scope() {
        let mut h = harness(EngineConfig::default(), MockActionExecutor::new());
        h.nlu.queue(vec![Command::start("book_flight")]);
        h.nlu.queue_error(CallError::network("connection refused"));

        h.runtime.handle_message("fly").await.unwrap();
        let reply = h.runtime.handle_message("???").await.unwrap();
        assert_eq!(
            reply.messages,
            vec!["Sorry, I can't help with that.", "Where are you flying to?"]
        );
    }

    #[tokio::test]
    async fn test_low_confidence_slot_asks_for_clarification() {
        let mut h = harness(EngineConfig::default(), MockActionExecutor::new());
        h.nlu.queue(vec![Command::start("book_flight")]);
        h.nlu.queue_scored(vec![ScoredCommand {
            command: Command::set("destination", "Lama"),
            confidence: 0.2,
        }]);

        h.runtime.handle_message("fly").await.unwrap();
        let reply = h.runtime.handle_message("lama?").await.unwrap();

        assert_eq!(reply.messages.first().map(String::as_str), Some("About destination"));
        assert!(reply.messages.iter().any(|m| m == "Where are you flying to?"));
        let clarifications = h.generator.clarifications.lock().unwrap().clone();
        assert_eq!(clarifications.len(), 1);
        assert_eq!(clarifications[0].description, "booking a flight");
        assert!(h.runtime.state().unwrap().top().unwrap().slot_value("destination").is_none());
    }

    #[tokio::test]
    async fn test_nlu_sees_prompted_slot_and_history() {
        let mut h = harness(EngineConfig::default(), MockActionExecutor::new());
        h.nlu.queue(vec![Command::start("book_flight")]);

        h.runtime.handle_message("fly").await.unwrap();
        h.runtime.handle_message("Lima").await.unwrap();

        let requests = h.nlu.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].message, "Lima");
        assert_eq!(requests[1].context["prompted_slot"], json!("destination"));
        assert_eq!(requests[1].context["active_flow"], json!("book_flight"));
        let history: Vec<&str> = requests[1].history.iter().map(|e| e.text.as_str()).collect();
        assert!(history.contains(&"fly"));
        assert!(history.contains(&"Where are you flying to?"));
        assert!(!history.contains(&"Lima"));
    }

    #[tokio::test]
    async fn test_save_failure_still_replies() {
        let mut h = harness(EngineConfig::default(), MockActionExecutor::new());
        h.store.set_fail_saves(true);
        h.nlu.queue(vec![Command::start("book_flight")]);

        let reply = h.runtime.handle_message("fly").await.unwrap();
        assert_eq!(reply.messages.last().map(String::as_str), Some("Where are you flying to?"));
        assert!(h.store.get("s1").is_none());

        // The state survives in memory for the next turn
        h.nlu.queue(vec![Command::set("destination", "Oslo")]);
        let reply = h.runtime.handle_message("Oslo").await.unwrap();
        assert_eq!(reply.messages, vec!["Flying to Oslo."]);
    }

    #[tokio::test]
    async fn test_generation_failure_uses_error_text() {
        let mut h = harness(EngineConfig::default(), MockActionExecutor::new());
        h.nlu.queue(vec![Command::start("joke")]);
        h.generator.queue_error(CallError::network("model offline"));

        let reply = h.runtime.handle_message("tell me a joke").await.unwrap();
        assert_eq!(reply.phase, Phase::Idle);
        assert!(reply.messages.iter().any(|m| m == "Sorry, I can't help with that."));
    }
}
