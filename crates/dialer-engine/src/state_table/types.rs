use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;

use crate::error::DialerError;
use crate::types::{Phase, TimerType};

/// Call attempt lifecycle state
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallState {
    // Pre-originate
    Queued,
    Reserved,

    // Signaling
    Originating,
    Ringing,
    EarlyMedia,

    // Post-answer
    Answered,
    AmdProcessing,
    AmdHuman,
    AmdMachine,
    WaitingAgent,
    AgentRinging,
    Bridged,
    OnHold,
    Transferred,

    // Terminal
    Ended,
    Failed,
    NoAnswer,
    Busy,
    Timeout,
    Cancelled,
    NoRtp,
}

impl CallState {
    pub const ALL: [CallState; 21] = [
        CallState::Queued,
        CallState::Reserved,
        CallState::Originating,
        CallState::Ringing,
        CallState::EarlyMedia,
        CallState::Answered,
        CallState::AmdProcessing,
        CallState::AmdHuman,
        CallState::AmdMachine,
        CallState::WaitingAgent,
        CallState::AgentRinging,
        CallState::Bridged,
        CallState::OnHold,
        CallState::Transferred,
        CallState::Ended,
        CallState::Failed,
        CallState::NoAnswer,
        CallState::Busy,
        CallState::Timeout,
        CallState::Cancelled,
        CallState::NoRtp,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CallState::Ended
                | CallState::Failed
                | CallState::NoAnswer
                | CallState::Busy
                | CallState::Timeout
                | CallState::Cancelled
                | CallState::NoRtp
        )
    }

    /// The callee has picked up at some point
    pub fn is_post_answer(&self) -> bool {
        matches!(
            self,
            CallState::Answered
                | CallState::AmdProcessing
                | CallState::AmdHuman
                | CallState::AmdMachine
                | CallState::WaitingAgent
                | CallState::AgentRinging
                | CallState::Bridged
                | CallState::OnHold
                | CallState::Transferred
        )
    }

    /// Phase timestamp stamped when this state is entered
    pub fn phase(&self) -> Option<Phase> {
        match self {
            CallState::Originating => Some(Phase::Originate),
            CallState::Ringing | CallState::EarlyMedia => Some(Phase::Ring),
            CallState::Answered => Some(Phase::Answer),
            CallState::Bridged => Some(Phase::Bridge),
            s if s.is_terminal() => Some(Phase::End),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CallState::Queued => "QUEUED",
            CallState::Reserved => "RESERVED",
            CallState::Originating => "ORIGINATING",
            CallState::Ringing => "RINGING",
            CallState::EarlyMedia => "EARLY_MEDIA",
            CallState::Answered => "ANSWERED",
            CallState::AmdProcessing => "AMD_PROCESSING",
            CallState::AmdHuman => "AMD_HUMAN",
            CallState::AmdMachine => "AMD_MACHINE",
            CallState::WaitingAgent => "WAITING_AGENT",
            CallState::AgentRinging => "AGENT_RINGING",
            CallState::Bridged => "BRIDGED",
            CallState::OnHold => "ON_HOLD",
            CallState::Transferred => "TRANSFERRED",
            CallState::Ended => "ENDED",
            CallState::Failed => "FAILED",
            CallState::NoAnswer => "NO_ANSWER",
            CallState::Busy => "BUSY",
            CallState::Timeout => "TIMEOUT",
            CallState::Cancelled => "CANCELLED",
            CallState::NoRtp => "NO_RTP",
        }
    }
}

impl fmt::Display for CallState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallState {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallState::ALL
            .iter()
            .copied()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| DialerError::invalid_input(format!("unknown call state '{}'", s)))
    }
}

/// Input to the call state machine
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CallEvent {
    Reserve,
    Originate,
    Progress,
    Ringing,
    EarlyMedia,
    Answer,
    AmdStart,
    AmdHuman,
    AmdMachine,
    AmdTimeout,
    QueueForAgent,
    AgentRing,
    AgentNoAnswer,
    Bridge,
    Hold,
    Resume,
    Transfer,
    RtpStarted,
    RtpTimeout,
    Bye,
    NoAnswer,
    Busy,
    #[serde(rename = "REJECT_4XX")]
    Reject4xx,
    #[serde(rename = "REJECT_5XX")]
    Reject5xx,
    #[serde(rename = "REJECT_6XX")]
    Reject6xx,
    Timeout,
    Cancel,
    Error,
}

impl CallEvent {
    pub const ALL: [CallEvent; 28] = [
        CallEvent::Reserve,
        CallEvent::Originate,
        CallEvent::Progress,
        CallEvent::Ringing,
        CallEvent::EarlyMedia,
        CallEvent::Answer,
        CallEvent::AmdStart,
        CallEvent::AmdHuman,
        CallEvent::AmdMachine,
        CallEvent::AmdTimeout,
        CallEvent::QueueForAgent,
        CallEvent::AgentRing,
        CallEvent::AgentNoAnswer,
        CallEvent::Bridge,
        CallEvent::Hold,
        CallEvent::Resume,
        CallEvent::Transfer,
        CallEvent::RtpStarted,
        CallEvent::RtpTimeout,
        CallEvent::Bye,
        CallEvent::NoAnswer,
        CallEvent::Busy,
        CallEvent::Reject4xx,
        CallEvent::Reject5xx,
        CallEvent::Reject6xx,
        CallEvent::Timeout,
        CallEvent::Cancel,
        CallEvent::Error,
    ];

    /// Events that end a call from the far side or the network
    pub const HANGUPS: [CallEvent; 6] = [
        CallEvent::Bye,
        CallEvent::NoAnswer,
        CallEvent::Busy,
        CallEvent::Reject4xx,
        CallEvent::Reject5xx,
        CallEvent::Reject6xx,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CallEvent::Reserve => "RESERVE",
            CallEvent::Originate => "ORIGINATE",
            CallEvent::Progress => "PROGRESS",
            CallEvent::Ringing => "RINGING",
            CallEvent::EarlyMedia => "EARLY_MEDIA",
            CallEvent::Answer => "ANSWER",
            CallEvent::AmdStart => "AMD_START",
            CallEvent::AmdHuman => "AMD_HUMAN",
            CallEvent::AmdMachine => "AMD_MACHINE",
            CallEvent::AmdTimeout => "AMD_TIMEOUT",
            CallEvent::QueueForAgent => "QUEUE_FOR_AGENT",
            CallEvent::AgentRing => "AGENT_RING",
            CallEvent::AgentNoAnswer => "AGENT_NO_ANSWER",
            CallEvent::Bridge => "BRIDGE",
            CallEvent::Hold => "HOLD",
            CallEvent::Resume => "RESUME",
            CallEvent::Transfer => "TRANSFER",
            CallEvent::RtpStarted => "RTP_STARTED",
            CallEvent::RtpTimeout => "RTP_TIMEOUT",
            CallEvent::Bye => "BYE",
            CallEvent::NoAnswer => "NO_ANSWER",
            CallEvent::Busy => "BUSY",
            CallEvent::Reject4xx => "REJECT_4XX",
            CallEvent::Reject5xx => "REJECT_5XX",
            CallEvent::Reject6xx => "REJECT_6XX",
            CallEvent::Timeout => "TIMEOUT",
            CallEvent::Cancel => "CANCEL",
            CallEvent::Error => "ERROR",
        }
    }
}

impl fmt::Display for CallEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallEvent {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CallEvent::ALL
            .iter()
            .copied()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| DialerError::invalid_input(format!("unknown call event '{}'", s)))
    }
}

/// Key for state table lookups
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq)]
pub struct StateKey {
    pub state: CallState,
    pub event: CallEvent,
}

/// Outcome of a table lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Move to another (or the same) state
    To(CallState),
    /// Stay in the current state and cancel one timer type
    Internal { cancel: TimerType },
}

/// Decision table mapping (state, event) to a transition. Pairs that are
/// absent are ignored by the state machine.
#[derive(Debug, Clone, Default)]
pub struct MasterStateTable {
    transitions: HashMap<StateKey, Transition>,
}

pub type StateTable = MasterStateTable;

impl MasterStateTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: CallState, event: CallEvent, transition: Transition) {
        self.transitions.insert(StateKey { state, event }, transition);
    }

    pub fn get(&self, state: CallState, event: CallEvent) -> Option<Transition> {
        self.transitions.get(&StateKey { state, event }).copied()
    }

    pub fn len(&self) -> usize {
        self.transitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transitions.is_empty()
    }

    /// Target states reachable in one step from `state`
    pub fn successors(&self, state: CallState) -> impl Iterator<Item = CallState> + '_ {
        self.transitions.iter().filter_map(move |(key, t)| match t {
            Transition::To(next) if key.state == state => Some(*next),
            _ => None,
        })
    }

    /// Structural checks run once when the table is built:
    /// terminal states have no exits, every non-terminal state is reachable
    /// from QUEUED and can itself reach some terminal state.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        for key in self.transitions.keys() {
            if key.state.is_terminal() {
                errors.push(format!("terminal state {} has a transition on {}", key.state, key.event));
            }
        }

        let reachable = self.reachable_from(CallState::Queued);
        for state in CallState::ALL.iter().filter(|s| !s.is_terminal()) {
            if !reachable.contains(state) {
                errors.push(format!("state {} is unreachable from QUEUED", state));
            }
            if !self.reachable_from(*state).iter().any(|s| s.is_terminal()) {
                errors.push(format!("state {} cannot reach a terminal state", state));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort();
            Err(errors)
        }
    }

    fn reachable_from(&self, start: CallState) -> HashSet<CallState> {
        let mut seen = HashSet::from([start]);
        let mut queue = VecDeque::from([start]);
        while let Some(state) = queue.pop_front() {
            for next in self.successors(state) {
                if seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }
}
