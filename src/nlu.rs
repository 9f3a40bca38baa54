//! Deterministic command parser for local use without an NLU service
//!
//! Slash commands map one to one onto [`Command`]s and can be chained with
//! `;`, e.g. `/start transfer_money; /set recipient=Ada; /set amount=10`.
//! Plain text answers the prompted slot, a yes/no question, or starts a flow
//! whose name or trigger intent it mentions.

use crate::runtime::error::NluError;
use crate::runtime::traits::{CommandGenerator, NluRequest};
use crate::state_machine::{Command, ScoredCommand};
use async_trait::async_trait;
use serde_json::Value;

const YES_WORDS: &[&str] = &["yes", "y", "yeah", "yep", "sure", "ok", "okay", "correct"];
const NO_WORDS: &[&str] = &["no", "n", "nope", "nah", "cancel", "stop"];

#[derive(Debug, Clone, Copy, Default)]
pub struct DirectCommandParser;

impl DirectCommandParser {
    /// Parse one message against the NLU context snapshot
    pub fn parse(message: &str, context: &Value) -> Vec<Command> {
        let message = message.trim();
        if message.is_empty() {
            return Vec::new();
        }
        if message.starts_with('/') {
            return message
                .split(';')
                .map(str::trim)
                .filter(|part| !part.is_empty())
                .map(parse_slash)
                .collect();
        }
        vec![parse_text(message, context)]
    }
}

#[async_trait]
impl CommandGenerator for DirectCommandParser {
    async fn generate(&self, request: &NluRequest) -> Result<Vec<ScoredCommand>, NluError> {
        Ok(Self::parse(&request.message, &request.context)
            .into_iter()
            .map(ScoredCommand::certain)
            .collect())
    }
}

fn parse_slash(part: &str) -> Command {
    let part = part.trim_start_matches('/');
    let (name, rest) = match part.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (part, ""),
    };
    let argument = (!rest.is_empty()).then(|| rest.to_string());

    match name.to_lowercase().as_str() {
        "start" => argument.map_or(Command::OutOfScope, |flow| Command::StartFlow { flow }),
        "set" => assignment(rest).map_or(Command::OutOfScope, |(name, value)| {
            Command::SetSlot { name, value }
        }),
        "correct" => assignment(rest).map_or(Command::OutOfScope, |(name, value)| {
            Command::CorrectSlot { name, value }
        }),
        "cancel" => Command::CancelFlow { reason: argument },
        "yes" => Command::Affirm,
        "no" => Command::Deny,
        "help" => Command::Clarify { topic: argument },
        "human" | "agent" => Command::HumanHandoff { reason: argument },
        _ => Command::OutOfScope,
    }
}

/// `slot=value`, with the value read as JSON when it parses and as a string
/// otherwise
fn assignment(text: &str) -> Option<(String, Value)> {
    let (name, raw) = text.split_once('=')?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
    Some((name.to_string(), value))
}

fn parse_text(message: &str, context: &Value) -> Command {
    let lowered = message.to_lowercase();
    let word = lowered.trim_end_matches(['.', '!', '?']);

    let phase = context.get("phase").and_then(Value::as_str).unwrap_or("");
    if phase == "confirming" || phase == "inside_pattern" {
        if YES_WORDS.contains(&word) {
            return Command::Affirm;
        }
        if NO_WORDS.contains(&word) {
            return Command::Deny;
        }
    }

    if let Some(slot) = context.get("prompted_slot").and_then(Value::as_str) {
        return Command::SetSlot {
            name: slot.to_string(),
            value: Value::String(message.to_string()),
        };
    }

    matching_flow(&lowered, context).map_or(Command::OutOfScope, |flow| Command::StartFlow { flow })
}

fn matching_flow(lowered: &str, context: &Value) -> Option<String> {
    let flows = context.get("flows")?.as_array()?;
    flows.iter().find_map(|flow| {
        let name = flow.get("name")?.as_str()?;
        let mentioned = lowered.contains(&name.replace('_', " "));
        let intended = flow
            .get("intents")
            .and_then(Value::as_array)
            .is_some_and(|intents| {
                intents
                    .iter()
                    .filter_map(Value::as_str)
                    .any(|intent| lowered.contains(&intent.to_lowercase()))
            });
        (mentioned || intended).then(|| name.to_string())
    })
}
