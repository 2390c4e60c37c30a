//! The default call decision table

use super::types::{CallEvent, CallState, MasterStateTable, Transition};
use crate::types::TimerType;

use CallEvent as E;
use CallState as S;

const PRE_ORIGINATE: [CallState; 2] = [S::Queued, S::Reserved];

const POST_ANSWER: [CallState; 9] = [
    S::Answered,
    S::AmdProcessing,
    S::AmdHuman,
    S::AmdMachine,
    S::WaitingAgent,
    S::AgentRinging,
    S::Bridged,
    S::OnHold,
    S::Transferred,
];

const REJECTS: [CallEvent; 3] = [E::Reject4xx, E::Reject5xx, E::Reject6xx];

struct TableBuilder {
    table: MasterStateTable,
}

impl TableBuilder {
    fn new() -> Self {
        Self {
            table: MasterStateTable::new(),
        }
    }

    fn on(&mut self, state: CallState, event: CallEvent, next: CallState) -> &mut Self {
        self.table.insert(state, event, Transition::To(next));
        self
    }

    fn on_all(&mut self, states: &[CallState], events: &[CallEvent], next: CallState) -> &mut Self {
        for state in states {
            for event in events {
                self.on(*state, *event, next);
            }
        }
        self
    }

    fn internal(&mut self, state: CallState, event: CallEvent, cancel: TimerType) -> &mut Self {
        self.table.insert(state, event, Transition::Internal { cancel });
        self
    }

    fn build(self) -> MasterStateTable {
        self.table
    }
}

/// Build the default decision table
pub fn default_table() -> MasterStateTable {
    let mut b = TableBuilder::new();

    // Admission
    b.on(S::Queued, E::Reserve, S::Reserved)
        .on(S::Reserved, E::Originate, S::Originating)
        .on_all(&PRE_ORIGINATE, &[E::Cancel], S::Cancelled)
        .on_all(&PRE_ORIGINATE, &[E::Timeout], S::Timeout)
        .on_all(&PRE_ORIGINATE, &[E::Error], S::Failed);

    // Originating: no provisional response yet
    b.on(S::Originating, E::Ringing, S::Ringing)
        .on(S::Originating, E::EarlyMedia, S::EarlyMedia)
        .on(S::Originating, E::Answer, S::Answered)
        .on(S::Originating, E::NoAnswer, S::NoAnswer)
        .on(S::Originating, E::Busy, S::Busy)
        .on_all(&[S::Originating], &REJECTS, S::Failed)
        .on(S::Originating, E::Bye, S::Failed)
        .on(S::Originating, E::Timeout, S::Timeout)
        .on(S::Originating, E::Error, S::Failed)
        .on(S::Originating, E::Cancel, S::Cancelled);

    // Ringing / early media
    let alerting = [S::Ringing, S::EarlyMedia];
    b.on(S::Ringing, E::EarlyMedia, S::EarlyMedia)
        .on_all(&alerting, &[E::Answer], S::Answered)
        .on_all(&alerting, &[E::NoAnswer, E::Bye, E::Timeout], S::NoAnswer)
        .on_all(&alerting, &[E::Busy], S::Busy)
        .on_all(&alerting, &REJECTS, S::Failed)
        .on_all(&alerting, &[E::Error], S::Failed)
        .on_all(&alerting, &[E::Cancel], S::Cancelled)
        .on(S::EarlyMedia, E::RtpTimeout, S::NoRtp)
        .internal(S::EarlyMedia, E::RtpStarted, TimerType::RtpWatchdog);

    // Answered and answering-machine detection
    b.on(S::Answered, E::AmdStart, S::AmdProcessing)
        .on(S::Answered, E::AmdHuman, S::AmdHuman)
        .on(S::Answered, E::AmdMachine, S::AmdMachine)
        .on(S::Answered, E::QueueForAgent, S::WaitingAgent)
        .on(S::Answered, E::Bridge, S::Bridged)
        .on(S::Answered, E::RtpTimeout, S::NoRtp)
        .internal(S::Answered, E::RtpStarted, TimerType::RtpWatchdog)
        .on(S::AmdProcessing, E::AmdHuman, S::AmdHuman)
        // undecided AMD is treated as a person
        .on(S::AmdProcessing, E::AmdTimeout, S::AmdHuman)
        .on(S::AmdProcessing, E::AmdMachine, S::AmdMachine)
        .on(S::AmdHuman, E::QueueForAgent, S::WaitingAgent)
        .on(S::AmdHuman, E::AgentRing, S::AgentRinging)
        .on(S::AmdHuman, E::Bridge, S::Bridged);

    // Agent leg
    b.on(S::WaitingAgent, E::AgentRing, S::AgentRinging)
        .on(S::WaitingAgent, E::Bridge, S::Bridged)
        // abandon
        .on(S::WaitingAgent, E::Timeout, S::Timeout)
        .on(S::AgentRinging, E::Bridge, S::Bridged)
        .on(S::AgentRinging, E::AgentNoAnswer, S::WaitingAgent)
        .on(S::Bridged, E::Hold, S::OnHold)
        .on(S::Bridged, E::Transfer, S::Transferred)
        .on(S::Bridged, E::RtpTimeout, S::NoRtp)
        .internal(S::Bridged, E::RtpStarted, TimerType::RtpWatchdog)
        .on(S::OnHold, E::Resume, S::Bridged)
        .on(S::OnHold, E::Transfer, S::Transferred);

    // Any hangup after answer is a completed call
    b.on_all(&POST_ANSWER, &CallEvent::HANGUPS, S::Ended)
        .on_all(&POST_ANSWER, &[E::Error], S::Failed)
        .on_all(&POST_ANSWER, &[E::Cancel], S::Cancelled);

    b.build()
}
