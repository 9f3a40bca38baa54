//! HTTP collaborators: NLU endpoint, action server and generation endpoint

use super::error::{ActionError, CallError, GenerationError, NluError};
use super::traits::{ActionExecutor, CommandGenerator, NluRequest, ResponseGenerator};
use crate::state_machine::ScoredCommand;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

fn build_client() -> Result<Client, CallError> {
    Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .map_err(|e| CallError::unknown(format!("Failed to create HTTP client: {e}")))
}

/// POST `body` as JSON and decode a JSON reply
async fn post_json<B, R>(client: &Client, url: &str, body: &B) -> Result<R, CallError>
where
    B: Serialize + Sync,
    R: DeserializeOwned,
{
    let response = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| CallError::from_request(&e))?;

    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| CallError::network(format!("Failed to read response: {e}")))?;

    if !status.is_success() {
        return Err(CallError::from_status(status, &text));
    }

    serde_json::from_str(&text).map_err(|e| {
        CallError::invalid_response(format!("Failed to parse response: {e} - body: {text}"))
    })
}

// ============================================================================
// NLU
// ============================================================================

/// NLU service answering with `{"commands": [...]}` or a bare command list
pub struct HttpCommandGenerator {
    client: Client,
    url: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NluResponse {
    Wrapped { commands: Vec<ScoredCommand> },
    Bare(Vec<ScoredCommand>),
}

impl HttpCommandGenerator {
    pub fn new(url: impl Into<String>) -> Result<Self, CallError> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CommandGenerator for HttpCommandGenerator {
    async fn generate(&self, request: &NluRequest) -> Result<Vec<ScoredCommand>, NluError> {
        let response: NluResponse = post_json(&self.client, &self.url, request).await?;
        Ok(match response {
            NluResponse::Wrapped { commands } | NluResponse::Bare(commands) => commands,
        })
    }
}

// ============================================================================
// Action server
// ============================================================================

/// Custom action server: `{"action", "inputs"}` in, result object out
pub struct HttpActionServer {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct ActionCall<'a> {
    action: &'a str,
    inputs: &'a Map<String, Value>,
}

impl HttpActionServer {
    pub fn new(url: impl Into<String>) -> Result<Self, CallError> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ActionExecutor for HttpActionServer {
    async fn execute(
        &self,
        name: &str,
        inputs: Map<String, Value>,
        cancel: CancellationToken,
    ) -> Result<Map<String, Value>, ActionError> {
        let call = ActionCall {
            action: name,
            inputs: &inputs,
        };
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                tracing::info!(action = %name, "Action request cancelled");
                Err(ActionError::unknown(format!("Action {name} was cancelled")))
            }

            result = post_json(&self.client, &self.url, &call) => result,
        }
    }
}

// ============================================================================
// Generation
// ============================================================================

/// Text generation endpoint: `{"instruction", "context"}` in, `{"text"}` out
pub struct HttpResponseGenerator {
    client: Client,
    url: String,
}

#[derive(Serialize)]
struct GenerationCall<'a> {
    instruction: &'a str,
    context: &'a Value,
}

#[derive(Deserialize)]
struct GenerationReply {
    text: String,
}

impl HttpResponseGenerator {
    pub fn new(url: impl Into<String>) -> Result<Self, CallError> {
        Ok(Self {
            client: build_client()?,
            url: url.into(),
        })
    }
}

#[async_trait]
impl ResponseGenerator for HttpResponseGenerator {
    async fn generate(
        &self,
        instruction: &str,
        context: &Value,
    ) -> Result<String, GenerationError> {
        let call = GenerationCall {
            instruction,
            context,
        };
        let reply: GenerationReply = post_json(&self.client, &self.url, &call).await?;
        Ok(reply.text)
    }
}
