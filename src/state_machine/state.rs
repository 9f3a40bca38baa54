//! Dialogue state types

use crate::config::EngineConfig;
use crate::flows::{FlowDefinition, FlowsList};
use crate::validators::ValidatorRegistry;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;

/// Frame ids are a per-session counter so replays are deterministic
pub type FrameId = u64;

pub type SlotMap = BTreeMap<String, Slot>;

// ============================================================================
// Slots
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Validation {
    #[default]
    Unvalidated,
    Valid,
    Rejected {
        reason: String,
    },
}

/// One declared variable of a frame
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Slot {
    pub value: Value,
    pub filled: bool,
    pub validation: Validation,
    /// Value before the last overwrite
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
}

impl Slot {
    pub fn filled_with(value: Value) -> Self {
        Self {
            value,
            filled: true,
            validation: Validation::Unvalidated,
            previous: None,
        }
    }

    pub fn get(&self) -> Option<&Value> {
        self.filled.then_some(&self.value)
    }

    /// Overwrite, keeping the old value when there was one
    pub fn set(&mut self, value: Value) {
        if self.filled {
            self.previous = Some(std::mem::replace(&mut self.value, value));
        } else {
            self.value = value;
        }
        self.filled = true;
        self.validation = Validation::Unvalidated;
    }
}

// ============================================================================
// Frames
// ============================================================================

/// Why a frame is not running
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "wait", rename_all = "snake_case")]
pub enum Suspension {
    /// Waiting for the user to provide `slot`
    Collect { slot: String },
    /// Waiting for a yes/no at a `confirm` step
    Confirm,
    /// The user asked to cancel `target` and must confirm first
    CancelConfirmation {
        target: FrameId,
        #[serde(default)]
        reason: Option<String>,
        /// Status to restore when the cancel is denied
        previous: Box<FrameStatus>,
    },
    AwaitingAction { action: String },
    AwaitingGeneration,
    AwaitingChild { child: FrameId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FrameStatus {
    Pushed,
    Running,
    Suspended { on: Suspension },
}

impl FrameStatus {
    pub fn suspended(on: Suspension) -> Self {
        FrameStatus::Suspended { on }
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        match self {
            FrameStatus::Suspended { on } => Some(on),
            _ => None,
        }
    }
}

/// How a frame came onto the stack
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FrameOrigin {
    /// `StartFlow` from the user
    Started,
    /// `call_flow` step of the frame below; child output → caller slot
    Called { outputs: BTreeMap<String, String> },
    /// Pushed by a pattern (out of scope, error fallback, step override)
    Interjection,
}

/// One active flow invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowFrame {
    pub id: FrameId,
    pub flow: String,
    pub slots: SlotMap,
    pub cursor: usize,
    pub status: FrameStatus,
    /// Prompt issued for the step at `cursor`, if any
    #[serde(default)]
    pub pending_prompt: Option<String>,
    /// Set when the outstanding prompt must be said again
    #[serde(default)]
    pub reissue_prompt: bool,
    #[serde(default)]
    pub clarification_depth: u32,
    /// Branch jumps taken during the current turn
    #[serde(default)]
    pub branch_jumps: u32,
    pub origin: FrameOrigin,
    #[serde(default)]
    pub in_error_handler: bool,
}

impl FlowFrame {
    pub fn new(id: FrameId, flow: &FlowDefinition, origin: FrameOrigin) -> Self {
        let slots = flow
            .declared_slots()
            .into_iter()
            .map(|name| (name, Slot::default()))
            .collect();
        Self {
            id,
            flow: flow.name.clone(),
            slots,
            cursor: 0,
            status: FrameStatus::Pushed,
            pending_prompt: None,
            reissue_prompt: false,
            clarification_depth: 0,
            branch_jumps: 0,
            origin,
            in_error_handler: false,
        }
    }

    pub fn declares(&self, slot: &str) -> bool {
        self.slots.contains_key(slot)
    }

    /// Value of a filled slot
    pub fn slot_value(&self, slot: &str) -> Option<&Value> {
        self.slots.get(slot).and_then(Slot::get)
    }

    pub fn set_slot(&mut self, slot: &str, value: Value) {
        self.slots.entry(slot.to_string()).or_default().set(value);
    }

    /// Move the cursor and start running from there. Progress ends any
    /// clarification streak.
    pub fn jump_to(&mut self, index: usize) {
        self.cursor = index;
        self.status = FrameStatus::Running;
        self.pending_prompt = None;
        self.reissue_prompt = false;
        self.clarification_depth = 0;
    }

    pub fn advance(&mut self) {
        self.jump_to(self.cursor + 1);
    }

    pub fn suspend(&mut self, on: Suspension) {
        self.status = FrameStatus::suspended(on);
    }

    pub fn suspension(&self) -> Option<&Suspension> {
        self.status.suspension()
    }

    /// Suspended on something only the user can resolve
    pub fn is_waiting_on_user(&self) -> bool {
        matches!(
            self.suspension(),
            Some(
                Suspension::Collect { .. }
                    | Suspension::Confirm
                    | Suspension::CancelConfirmation { .. }
            )
        )
    }

    pub fn is_called(&self) -> bool {
        matches!(self.origin, FrameOrigin::Called { .. })
    }

    /// Snapshot handed to generators
    pub fn slot_values(&self) -> Map<String, Value> {
        self.slots
            .iter()
            .filter_map(|(name, slot)| slot.get().map(|v| (name.clone(), v.clone())))
            .collect()
    }
}

// ============================================================================
// Dialogue state
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Idle,
    WaitingForSlot,
    Confirming,
    InsidePattern,
    HandedOff,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::WaitingForSlot => "waiting_for_slot",
            Phase::Confirming => "confirming",
            Phase::InsidePattern => "inside_pattern",
            Phase::HandedOff => "handed_off",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Speaker {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub speaker: Speaker,
    pub text: String,
}

/// Everything that is persisted for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialogueState {
    pub session_id: String,
    /// Last element is the active frame
    pub stack: Vec<FlowFrame>,
    #[serde(default)]
    pub session: BTreeMap<String, Value>,
    /// Values for slots no frame has declared yet
    #[serde(default)]
    pub pending_slots: BTreeMap<String, Value>,
    #[serde(default)]
    pub phase: Phase,
    #[serde(default)]
    pub history: VecDeque<HistoryEntry>,
    #[serde(default)]
    pub next_frame_id: FrameId,
}

impl DialogueState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stack: Vec::new(),
            session: BTreeMap::new(),
            pending_slots: BTreeMap::new(),
            phase: Phase::Idle,
            history: VecDeque::new(),
            next_frame_id: 0,
        }
    }

    pub fn top(&self) -> Option<&FlowFrame> {
        self.stack.last()
    }

    pub fn top_mut(&mut self) -> Option<&mut FlowFrame> {
        self.stack.last_mut()
    }

    pub fn frame_position(&self, id: FrameId) -> Option<usize> {
        self.stack.iter().position(|f| f.id == id)
    }

    pub fn is_handed_off(&self) -> bool {
        self.phase == Phase::HandedOff
    }

    /// Push a new frame for `flow` with `inputs` already filled
    pub fn push_frame(
        &mut self,
        flow: &FlowDefinition,
        origin: FrameOrigin,
        inputs: BTreeMap<String, Value>,
    ) -> FrameId {
        let id = self.next_frame_id;
        self.next_frame_id += 1;
        let mut frame = FlowFrame::new(id, flow, origin);
        for (name, value) in inputs {
            frame.set_slot(&name, value);
        }
        tracing::info!(
            session_id = %self.session_id,
            flow = %flow.name,
            frame_id = id,
            depth = self.stack.len() + 1,
            "Pushed frame"
        );
        self.stack.push(frame);
        id
    }

    pub fn pop_frame(&mut self) -> Option<FlowFrame> {
        let frame = self.stack.pop()?;
        tracing::info!(
            session_id = %self.session_id,
            flow = %frame.flow,
            frame_id = frame.id,
            depth = self.stack.len(),
            "Popped frame"
        );
        Some(frame)
    }

    /// Ask the new top to repeat whatever it is waiting on
    pub fn reissue_top_prompt(&mut self) {
        if let Some(top) = self.top_mut() {
            if top.is_waiting_on_user() {
                top.reissue_prompt = true;
            }
        }
    }

    /// Empty the stack and stop automated handling
    pub fn hand_off(&mut self) {
        while self.pop_frame().is_some() {}
        self.phase = Phase::HandedOff;
    }

    /// Recompute the phase from the active frame
    pub fn refresh_phase(&mut self) {
        if self.is_handed_off() {
            return;
        }
        self.phase = match self.top() {
            None => Phase::Idle,
            Some(frame) => match frame.suspension() {
                Some(Suspension::Collect { .. }) => Phase::WaitingForSlot,
                Some(Suspension::Confirm) => Phase::Confirming,
                Some(Suspension::CancelConfirmation { .. }) => Phase::InsidePattern,
                _ if frame.in_error_handler
                    || matches!(frame.origin, FrameOrigin::Interjection) =>
                {
                    Phase::InsidePattern
                }
                _ => Phase::Idle,
            },
        };
    }

    pub fn record(&mut self, speaker: Speaker, text: impl Into<String>, limit: usize) {
        self.history.push_back(HistoryEntry {
            speaker,
            text: text.into(),
        });
        while self.history.len() > limit {
            self.history.pop_front();
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// Immutable inputs to every transition
#[derive(Clone)]
pub struct DialogueContext {
    pub flows: Arc<FlowsList>,
    pub validators: Arc<ValidatorRegistry>,
    pub config: EngineConfig,
}

impl DialogueContext {
    pub fn new(
        flows: Arc<FlowsList>,
        validators: Arc<ValidatorRegistry>,
        config: EngineConfig,
    ) -> Self {
        Self {
            flows,
            validators,
            config,
        }
    }

    pub fn flow(&self, name: &str) -> Option<&FlowDefinition> {
        self.flows.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::{Step, StepKind};
    use serde_json::json;

    fn flow() -> FlowDefinition {
        let mut flow: FlowDefinition = serde_json::from_value(json!({
            "inputs": ["city"],
            "steps": [{ "kind": "collect", "slot": "date" }]
        }))
        .unwrap();
        flow.name = "weather".to_string();
        flow.steps.push(Step {
            id: "done".to_string(),
            kind: StepKind::Say {
                text: "ok".to_string(),
            },
        });
        flow
    }

    #[test]
    fn test_slot_set_keeps_previous() {
        let mut slot = Slot::default();
        slot.set(json!("Paris"));
        assert_eq!(slot.previous, None);
        slot.set(json!("Rome"));
        assert_eq!(slot.previous, Some(json!("Paris")));
        assert_eq!(slot.get(), Some(&json!("Rome")));
        assert_eq!(slot.validation, Validation::Unvalidated);
    }

    #[test]
    fn test_push_frame_declares_and_binds() {
        let mut state = DialogueState::new("s1");
        let inputs = BTreeMap::from([("city".to_string(), json!("Oslo"))]);
        let first = state.push_frame(&flow(), FrameOrigin::Started, inputs);
        let second = state.push_frame(&flow(), FrameOrigin::Started, BTreeMap::new());
        assert_eq!((first, second), (0, 1));
        let bottom = &state.stack[0];
        assert!(bottom.declares("date"));
        assert_eq!(bottom.slot_value("city"), Some(&json!("Oslo")));
        assert_eq!(bottom.slot_value("date"), None);
        assert_eq!(bottom.status, FrameStatus::Pushed);
    }

    #[test]
    fn test_phase_follows_top_frame() {
        let mut state = DialogueState::new("s1");
        state.refresh_phase();
        assert_eq!(state.phase, Phase::Idle);

        state.push_frame(&flow(), FrameOrigin::Started, BTreeMap::new());
        state.top_mut().unwrap().suspend(Suspension::Collect {
            slot: "date".to_string(),
        });
        state.refresh_phase();
        assert_eq!(state.phase, Phase::WaitingForSlot);

        state.hand_off();
        state.refresh_phase();
        assert!(state.stack.is_empty());
        assert_eq!(state.phase, Phase::HandedOff);
    }

    #[test]
    fn test_history_is_bounded() {
        let mut state = DialogueState::new("s1");
        for i in 0..5 {
            state.record(Speaker::User, format!("m{i}"), 3);
        }
        let texts: Vec<&str> = state.history.iter().map(|h| h.text.as_str()).collect();
        assert_eq!(texts, vec!["m2", "m3", "m4"]);
    }

    #[test]
    fn test_state_round_trips_through_json() {
        let mut state = DialogueState::new("s1");
        let origin = FrameOrigin::Called {
            outputs: BTreeMap::from([("x".to_string(), "y".to_string())]),
        };
        state.push_frame(&flow(), origin, BTreeMap::new());
        state.top_mut().unwrap().suspend(Suspension::CancelConfirmation {
            target: 0,
            reason: None,
            previous: Box::new(FrameStatus::suspended(Suspension::Confirm)),
        });
        let json = serde_json::to_string(&state).unwrap();
        let restored: DialogueState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }

    #[test]
    fn test_cancel_confirmation_keeps_reason() {
        let suspension = Suspension::CancelConfirmation {
            target: 3,
            reason: Some("changed my mind".to_string()),
            previous: Box::new(FrameStatus::suspended(Suspension::Collect {
                slot: "date".to_string(),
            })),
        };
        let value = serde_json::to_value(&suspension).unwrap();
        assert_eq!(value["wait"], json!("cancel_confirmation"));
        assert_eq!(value["reason"], json!("changed my mind"));
        let restored: Suspension = serde_json::from_value(value).unwrap();
        assert_eq!(restored, suspension);
    }
}
