//! Runtime for executing dialogue sessions
//!
//! Each session owns a task draining a bounded queue of turn requests, so a
//! session handles one turn at a time while distinct sessions run in
//! parallel.

pub mod error;
mod executor;
pub mod http;
pub mod local;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use error::{CallError, CallErrorKind, RuntimeError};
pub use executor::{snapshot, SessionRequest, SessionRuntime, TurnReply};
pub use traits::{
    ActionExecutor, Clarification, CommandGenerator, DatabaseStore, NluRequest, ResponseGenerator,
    StateStore,
};

use crate::state_machine::DialogueContext;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, RwLock};

/// The external services every session talks to
#[derive(Clone)]
pub struct Collaborators {
    pub store: Arc<dyn StateStore>,
    pub nlu: Arc<dyn CommandGenerator>,
    pub actions: Arc<dyn ActionExecutor>,
    pub generator: Arc<dyn ResponseGenerator>,
}

/// Session runtime over shared trait objects, as spawned by the manager
pub type SharedRuntime = SessionRuntime<
    Arc<dyn StateStore>,
    Arc<dyn CommandGenerator>,
    Arc<dyn ActionExecutor>,
    Arc<dyn ResponseGenerator>,
>;

/// Handle to interact with a running session
#[derive(Clone)]
pub struct SessionHandle {
    pub request_tx: mpsc::Sender<SessionRequest>,
}

/// Manager for all session runtimes
pub struct RuntimeManager {
    context: Arc<DialogueContext>,
    collaborators: Collaborators,
    sessions: RwLock<HashMap<String, SessionHandle>>,
}

impl RuntimeManager {
    pub fn new(context: DialogueContext, collaborators: Collaborators) -> Self {
        Self {
            context: Arc::new(context),
            collaborators,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &DialogueContext {
        &self.context
    }

    /// Get or create the runtime task of a session
    pub async fn get_or_create(&self, session_id: &str) -> SessionHandle {
        // Check if already running
        {
            let sessions = self.sessions.read().await;
            if let Some(handle) = sessions.get(session_id) {
                return handle.clone();
            }
        }

        let mut sessions = self.sessions.write().await;
        if let Some(handle) = sessions.get(session_id) {
            return handle.clone();
        }

        let (request_tx, request_rx) = mpsc::channel(self.context.config.turn_queue_capacity);
        let Collaborators {
            store,
            nlu,
            actions,
            generator,
        } = self.collaborators.clone();
        let runtime: SharedRuntime = SessionRuntime::new(
            session_id,
            Arc::clone(&self.context),
            store,
            nlu,
            actions,
            generator,
        );

        let id = session_id.to_string();
        tokio::spawn(async move {
            runtime.run(request_rx).await;
            tracing::debug!(session_id = %id, "Session task finished");
        });

        let handle = SessionHandle { request_tx };
        sessions.insert(session_id.to_string(), handle.clone());
        handle
    }

    /// Run one user turn. Fails with [`RuntimeError::Busy`] when the
    /// session's queue is full.
    pub async fn handle_message(
        &self,
        session_id: &str,
        message: impl Into<String>,
    ) -> Result<TurnReply, RuntimeError> {
        let handle = self.get_or_create(session_id).await;
        let (reply, reply_rx) = oneshot::channel();
        let request = SessionRequest::Turn {
            message: message.into(),
            reply,
        };
        match handle.request_tx.try_send(request) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = %session_id, "Turn queue full");
                return Err(RuntimeError::Busy(session_id.to_string()));
            }
            Err(TrySendError::Closed(_)) => {
                self.forget(session_id).await;
                return Err(RuntimeError::SessionClosed(session_id.to_string()));
            }
        }
        reply_rx
            .await
            .map_err(|_| RuntimeError::SessionClosed(session_id.to_string()))?
    }

    /// Delete the stored state of a session, lifting a handoff. Waits behind
    /// turns already queued.
    pub async fn reset(&self, session_id: &str) -> Result<(), RuntimeError> {
        let handle = self.get_or_create(session_id).await;
        let (reply, reply_rx) = oneshot::channel();
        if handle
            .request_tx
            .send(SessionRequest::Reset { reply })
            .await
            .is_err()
        {
            self.forget(session_id).await;
            return Err(RuntimeError::SessionClosed(session_id.to_string()));
        }
        reply_rx
            .await
            .map_err(|_| RuntimeError::SessionClosed(session_id.to_string()))?
    }

    /// Stop a session task once its queued turns are done
    pub async fn close(&self, session_id: &str) -> bool {
        self.forget(session_id).await
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn forget(&self, session_id: &str) -> bool {
        self.sessions.write().await.remove(session_id).is_some()
    }
}
