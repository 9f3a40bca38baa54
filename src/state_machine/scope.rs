//! Variable lookup for conditions, bindings and templates

use super::state::DialogueState;
use crate::expr::Scope;
use serde_json::Value;

/// Read-only view from one frame: `slots.x`, `session.x`, `parent.x`, or a
/// bare `x` (own slot first, then session variable).
pub struct FrameScope<'a> {
    state: &'a DialogueState,
    /// Position in the stack, `None` when no frame is active
    position: Option<usize>,
}

impl<'a> FrameScope<'a> {
    pub fn new(state: &'a DialogueState, position: usize) -> Self {
        Self {
            state,
            position: Some(position),
        }
    }

    /// Scope of the active frame, or session-only on an empty stack
    pub fn top(state: &'a DialogueState) -> Self {
        Self {
            state,
            position: state.stack.len().checked_sub(1),
        }
    }

    fn slot(&self, position: Option<usize>, name: &str) -> Option<&'a Value> {
        self.state
            .stack
            .get(position?)
            .and_then(|frame| frame.slot_value(name))
    }
}

impl Scope for FrameScope<'_> {
    fn resolve(&self, path: &[String]) -> Value {
        let Some((head, rest)) = path.split_first() else {
            return Value::Null;
        };
        let found = match head.as_str() {
            "slots" | "session" | "parent" => {
                let Some((name, tail)) = rest.split_first() else {
                    return Value::Null;
                };
                let value = match head.as_str() {
                    "slots" => self.slot(self.position, name),
                    "session" => self.state.session.get(name),
                    _ => self.slot(self.position.and_then(|p| p.checked_sub(1)), name),
                };
                return descend(value, tail);
            }
            name => self
                .slot(self.position, name)
                .or_else(|| self.state.session.get(name)),
        };
        descend(found, rest)
    }
}

fn descend(value: Option<&Value>, path: &[String]) -> Value {
    let Some(mut current) = value else {
        return Value::Null;
    };
    for segment in path {
        let next = match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        };
        match next {
            Some(v) => current = v,
            None => return Value::Null,
        }
    }
    current.clone()
}
