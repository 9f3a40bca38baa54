//! Property-based tests for the state machine
//!
//! These tests drive the fixture flows with arbitrary command sequences and
//! check that the stack stays well formed.

use super::fixtures::{context, context_with, start_session, started, turn};
use super::state::{FrameOrigin, FrameStatus, Suspension};
use super::*;
use crate::config::EngineConfig;
use proptest::prelude::*;
use serde_json::{json, Map, Value};
use std::collections::HashSet;

// ============================================================================
// Test Helpers
// ============================================================================

/// Answer every awaited action or generation until the machine waits on the
/// user again
fn settle(ctx: &DialogueContext, mut result: TransitionResult) -> DialogueState {
    loop {
        let event = match result.effects.iter().find(|e| e.awaits_result()) {
            Some(Effect::InvokeAction { frame_id, .. }) => Event::ActionCompleted {
                frame_id: *frame_id,
                result: Map::from_iter([("id".to_string(), json!("tx-1"))]),
            },
            Some(Effect::Generate { frame_id, .. }) => Event::GenerationCompleted {
                frame_id: *frame_id,
                text: "generated".to_string(),
            },
            _ => return result.new_state,
        };
        result = transition(&result.new_state, ctx, event).expect("awaited result is accepted");
    }
}

fn play(ctx: &DialogueContext, turns: &[Vec<Command>]) -> DialogueState {
    let mut state = start_session(ctx);
    for commands in turns {
        if state.is_handed_off() {
            break;
        }
        state = settle(ctx, turn(&state, ctx, commands.clone()));
    }
    state
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_flow_name() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "transfer_money",
        "book_flight",
        "book_hotel",
        "book_trip",
        "verify_identity",
        "survey_host",
        "nowhere",
    ])
}

fn arb_slot_name() -> impl Strategy<Value = &'static str> {
    prop::sample::select(vec![
        "recipient",
        "amount",
        "destination",
        "hotel_city",
        "pin",
        "rating",
        "nothing",
    ])
}

fn arb_value() -> impl Strategy<Value = Value> {
    prop_oneof![
        (-5i64..2000).prop_map(Value::from),
        "[A-Za-z]{1,8}".prop_map(Value::from),
    ]
}

/// Everything except an explicit handoff, which ends the session
fn arb_command() -> impl Strategy<Value = Command> {
    prop_oneof![
        3 => arb_flow_name().prop_map(Command::start),
        3 => (arb_slot_name(), arb_value()).prop_map(|(name, value)| Command::set(name, value)),
        1 => (arb_slot_name(), arb_value()).prop_map(|(name, value)| Command::correct(name, value)),
        1 => Just(Command::cancel()),
        1 => Just(Command::Affirm),
        1 => Just(Command::Deny),
        1 => Just(Command::Clarify { topic: None }),
        1 => Just(Command::OutOfScope),
        1 => Just(Command::CallFlowReturn),
    ]
}

fn arb_turns() -> impl Strategy<Value = Vec<Vec<Command>>> {
    prop::collection::vec(prop::collection::vec(arb_command(), 0..3), 0..6)
}

// ============================================================================
// State Validity Checkers
// ============================================================================

fn check_invariants(state: &DialogueState) -> Result<(), TestCaseError> {
    if state.stack.is_empty() {
        prop_assert!(
            matches!(state.phase, Phase::Idle | Phase::HandedOff),
            "empty stack in phase {:?}",
            state.phase
        );
        return Ok(());
    }
    prop_assert!(!state.is_handed_off());

    let mut seen = HashSet::new();
    for (position, frame) in state.stack.iter().enumerate() {
        prop_assert!(seen.insert(frame.id), "duplicate frame id {}", frame.id);
        prop_assert!(frame.id < state.next_frame_id);
        prop_assert_eq!(frame.branch_jumps, 0);
        if frame.is_called() {
            prop_assert!(position > 0, "called frame at the bottom");
            let parent = &state.stack[position - 1];
            prop_assert_eq!(
                parent.suspension(),
                Some(&Suspension::AwaitingChild { child: frame.id })
            );
        }
    }

    let top = state.stack.last().expect("stack is non-empty");
    prop_assert!(
        top.is_waiting_on_user(),
        "turn ended with top frame {:?}",
        top.status
    );
    Ok(())
}

// ============================================================================
// Property Tests
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    // the stack is well formed after every turn
    #[test]
    fn prop_turns_preserve_validity(turns in arb_turns()) {
        let ctx = context();
        let mut state = start_session(&ctx);
        for commands in turns {
            if state.is_handed_off() {
                break;
            }
            state = settle(&ctx, turn(&state, &ctx, commands));
            check_invariants(&state)?;
        }
    }

    // setting a slot twice in one turn is the same as once
    #[test]
    fn prop_set_slot_is_idempotent(
        turns in arb_turns(),
        name in arb_slot_name(),
        value in arb_value()
    ) {
        let ctx = context();
        let state = play(&ctx, &turns);
        prop_assume!(!state.is_handed_off());

        let once = turn(&state, &ctx, vec![Command::set(name, value.clone())]);
        let twice = turn(
            &state,
            &ctx,
            vec![Command::set(name, value.clone()), Command::set(name, value)],
        );
        prop_assert_eq!(once.new_state, twice.new_state);
        prop_assert_eq!(once.effects, twice.effects);
    }

    // a restored snapshot behaves exactly like the live state
    #[test]
    fn prop_snapshot_roundtrip_behaves_identically(
        turns in arb_turns(),
        next in prop::collection::vec(arb_command(), 0..3)
    ) {
        let ctx = context();
        let state = play(&ctx, &turns);
        let json = serde_json::to_string(&state).unwrap();
        let restored: DialogueState = serde_json::from_str(&json).unwrap();
        prop_assert_eq!(&restored, &state);

        let live = transition(&state, &ctx, Event::Commands { commands: next.clone() });
        let revived = transition(&restored, &ctx, Event::Commands { commands: next });
        match (live, revived) {
            (Ok(a), Ok(b)) => {
                prop_assert_eq!(a.new_state, b.new_state);
                prop_assert_eq!(a.effects, b.effects);
            }
            (Err(a), Err(b)) => prop_assert_eq!(a.to_string(), b.to_string()),
            (a, b) => prop_assert!(false, "diverged: {:?} vs {:?}", a, b),
        }
    }

    // a finished child hands back exactly its declared outputs
    #[test]
    fn prop_child_returns_only_declared_outputs(
        rating in prop::option::of(arb_value()),
        comment in prop::option::of(arb_value()),
        note in prop::option::of(arb_value())
    ) {
        let ctx = context();
        let mut state = started(&ctx, "survey_host");
        prop_assert_eq!(state.stack.len(), 2);

        let child = state.top_mut().unwrap();
        let values = [("rating", &rating), ("comment", &comment), ("internal_note", &note)];
        for (slot, value) in values {
            if let Some(value) = value {
                child.set_slot(slot, value.clone());
            }
        }
        child.cursor = 2;
        child.status = FrameStatus::Running;

        let result = turn(&state, &ctx, vec![]);
        let parent = result.new_state.top().unwrap();
        prop_assert_eq!(&parent.flow, "survey_host");
        prop_assert_eq!(parent.slot_value("score"), Some(&rating.unwrap_or(Value::Null)));
        prop_assert_eq!(parent.slot_value("comment"), Some(&comment.unwrap_or(Value::Null)));
        prop_assert!(!parent.declares("internal_note"));
        prop_assert!(!parent.declares("rating"));
        prop_assert_eq!(result.utterances().last(), Some("Anything else?"));
    }

    // cancel then start replaces the active flow
    #[test]
    fn prop_cancel_then_start_replaces_flow(noise in prop::option::of(arb_value())) {
        let ctx = context();
        let mut state = started(&ctx, "book_hotel");
        if let Some(value) = noise {
            state = turn(&state, &ctx, vec![Command::set("amount", value)]).new_state;
        }
        let result = turn(&state, &ctx, vec![Command::cancel(), Command::start("book_flight")]);
        let flows: Vec<_> = result.new_state.stack.iter().map(|f| f.flow.as_str()).collect();
        prop_assert_eq!(flows, vec!["book_flight"]);
        prop_assert_eq!(result.utterances().last(), Some("Where are you flying to?"));
    }

    // the clarification limit is exact
    #[test]
    fn prop_clarification_limit_hands_off(limit in 0u32..5) {
        let ctx = context_with(EngineConfig {
            max_clarification_depth: limit,
            ..EngineConfig::default()
        });
        let mut state = started(&ctx, "book_flight");
        for _ in 0..limit {
            let result = turn(&state, &ctx, vec![Command::Clarify { topic: None }]);
            prop_assert!(
                result.effects.iter().any(|e| matches!(e, Effect::Explain { .. })),
                "clarification should be explained"
            );
            state = result.new_state;
            prop_assert!(!state.is_handed_off());
        }
        let result = turn(&state, &ctx, vec![Command::Clarify { topic: None }]);
        prop_assert!(result.new_state.is_handed_off());
        prop_assert!(result.new_state.stack.is_empty());
        prop_assert!(
            result.effects.iter().any(|e| matches!(e, Effect::Handoff { .. })),
            "handoff effect expected"
        );
    }

    // a denied cancel confirmation restores the frame untouched
    #[test]
    fn prop_denied_cancel_restores_frame(recipient in "[A-Z][a-z]{1,8}") {
        let ctx = context();
        let state = turn(
            &start_session(&ctx),
            &ctx,
            vec![Command::start("transfer_money"), Command::set("recipient", recipient.clone())],
        )
        .new_state;
        let before = state.top().unwrap().clone();

        let asked = turn(&state, &ctx, vec![Command::cancel()]).new_state;
        prop_assert_eq!(asked.phase, Phase::InsidePattern);

        let denied = turn(&asked, &ctx, vec![Command::Deny]);
        let top = denied.new_state.top().unwrap();
        prop_assert_eq!(top.id, before.id);
        prop_assert_eq!(top.cursor, before.cursor);
        prop_assert_eq!(&top.status, &before.status);
        prop_assert_eq!(top.slot_value("recipient"), Some(&Value::String(recipient.clone())));
        let expected = format!("How much should I send to {recipient}?");
        prop_assert_eq!(denied.utterances().last(), Some(expected.as_str()));

        let affirmed = turn(&asked, &ctx, vec![Command::Affirm]);
        prop_assert!(affirmed.new_state.stack.is_empty());
        prop_assert_eq!(affirmed.new_state.phase, Phase::Idle);
    }
}

// ============================================================================
// Sequence Tests - Multi-Step Scenarios
// ============================================================================

/// Money transfer from start to finish, with the action result flowing into
/// a session variable
#[test]
fn test_complete_transfer_cycle() {
    let ctx = context();
    let state = play(
        &ctx,
        &[
            vec![Command::start("transfer_money")],
            vec![Command::set("recipient", "Ada")],
            vec![Command::set("amount", 40)],
            vec![Command::Affirm],
        ],
    );
    assert!(state.stack.is_empty());
    assert_eq!(state.phase, Phase::Idle);
    assert_eq!(state.session.get("transfer_id"), Some(&json!("tx-1")));
    assert_eq!(state.session.get(LAST_COMMAND_VAR), Some(&json!("affirm")));
}

/// An interjection over a called child leaves the parent chain intact
#[test]
fn test_interjection_over_called_child() {
    let ctx = context();
    let state = play(
        &ctx,
        &[vec![Command::start("book_trip")], vec![Command::OutOfScope]],
    );
    let flows: Vec<_> = state.stack.iter().map(|f| f.flow.as_str()).collect();
    assert_eq!(flows, vec!["book_trip", "book_flight"]);
    assert!(matches!(
        state.stack[1].origin,
        FrameOrigin::Called { .. }
    ));
    assert_eq!(state.phase, Phase::WaitingForSlot);
}
