//! Shared flows and helpers for state machine tests

use super::command::Command;
use super::state::{DialogueContext, DialogueState};
use super::transition::{transition, TransitionResult};
use super::Event;
use crate::config::EngineConfig;
use crate::flows::{parse_flows, FlowsList};
use crate::validators::ValidatorRegistry;
use std::sync::Arc;

pub const FLOWS: &str = r#"
flows:
  welcome:
    steps:
      - kind: say
        text: Hi! How can I help?
  fallback:
    steps:
      - kind: say
        text: Sorry, I can't help with that.
  transfer_money:
    description: sending money
    confirm_before_cancel: true
    on_error: transfer_failed
    inputs:
      - name: recipient
        optional: true
    outputs: [transfer_id]
    steps:
      - kind: collect
        slot: recipient
        prompt: Who should receive the money?
        validator: not_empty
        on_cancel: ignore
      - kind: collect
        id: ask_amount
        slot: amount
        prompt: How much should I send to {recipient}?
        validator: number
        rejections:
          - if: slots.amount <= 0
            message: The amount has to be positive.
      - kind: confirm
        prompt: Send {amount} to {recipient}?
        slot: confirmed
      - kind: branch
        if: not slots.confirmed
        then: END
      - kind: action
        action: execute_transfer
        inputs:
          to: slots.recipient
          amount: slots.amount
        outputs:
          id: transfer_id
      - kind: say
        text: Sent! Reference {transfer_id}.
      - kind: branch
        if: 'true'
        then: END
      - kind: say
        id: transfer_failed
        text: The transfer failed, nothing was sent.
  book_hotel:
    steps:
      - kind: collect
        slot: hotel_city
        prompt: Which city?
  book_flight:
    description: booking a flight
    outputs: [destination]
    steps:
      - kind: collect
        slot: destination
        prompt: Where are you flying to?
      - kind: say
        text: Flying to {destination}.
  book_trip:
    steps:
      - kind: call_flow
        flow: book_flight
        outputs:
          destination: trip_destination
      - kind: say
        text: Trip to {trip_destination} booked.
  verify_identity:
    interruptible: false
    steps:
      - kind: collect
        slot: pin
        prompt: What is your PIN?
  vip_lounge:
    trigger:
      intents: [lounge access]
      if: session.tier == "gold"
    steps:
      - kind: say
        text: Welcome to the lounge.
  broken_parent:
    steps:
      - kind: call_flow
        flow: broken_child
      - kind: say
        text: unreachable
  broken_child:
    steps:
      - kind: branch
        if: '"abc" > 3'
        then: END
  spin:
    steps:
      - kind: branch
        id: head
        mode: while
        if: 'true'
        then: head
  survey_host:
    steps:
      - kind: call_flow
        flow: quick_survey
        outputs:
          rating: score
      - kind: collect
        slot: follow_up
        prompt: Anything else?
  quick_survey:
    outputs: [rating, comment]
    steps:
      - kind: collect
        slot: rating
        prompt: How would you rate us?
      - kind: collect
        slot: internal_note
        prompt: Any notes?
  joke:
    outputs: [joke_text]
    steps:
      - kind: generate
        instruction: Tell a short joke
        slot: joke_text
  greet_member:
    inputs: [member_name]
    steps:
      - kind: say
        text: Hello {member_name}.
  change_address:
    steps:
      - kind: collect
        id: ask_street
        slot: street
        prompt: What is the new street?
        on_cancel: goto:keep_address
      - kind: collect
        slot: city
        prompt: Which city is {street} in?
        ask_before_filling: true
        on_correction: ignore
      - kind: confirm
        prompt: Move to {street}, {city}?
        slot: address_ok
        on_cancel: flow:retention_offer
        on_correction: goto:ask_street
      - kind: say
        text: Address updated.
      - kind: branch
        if: 'true'
        then: END
      - kind: say
        id: keep_address
        text: Keeping your current address.
  retention_offer:
    steps:
      - kind: say
        text: Moving is free this month.
  help:
    steps:
      - kind: say
        text: I can send money or book travel.
  goodbye:
    steps:
      - kind: say
        text: Bye for now.
"#;

pub fn flows() -> Arc<FlowsList> {
    let definitions = parse_flows(FLOWS).expect("fixture flows parse");
    let flows = FlowsList::new(definitions, &ValidatorRegistry::new());
    Arc::new(flows.expect("fixture flows are valid"))
}

pub fn context_with(config: EngineConfig) -> DialogueContext {
    DialogueContext::new(flows(), Arc::new(ValidatorRegistry::new()), config)
}

pub fn context() -> DialogueContext {
    context_with(EngineConfig::default())
}

/// A session that has already been greeted
pub fn start_session(ctx: &DialogueContext) -> DialogueState {
    transition(&DialogueState::new("test-session"), ctx, Event::SessionStarted)
        .expect("welcome runs")
        .new_state
}

/// A greeted session with `flow` started
pub fn started(ctx: &DialogueContext, flow: &str) -> DialogueState {
    turn(&start_session(ctx), ctx, vec![Command::start(flow)]).new_state
}

pub fn turn(
    state: &DialogueState,
    ctx: &DialogueContext,
    commands: Vec<Command>,
) -> TransitionResult {
    transition(state, ctx, Event::Commands { commands }).expect("transition succeeds")
}
