use std::collections::HashMap;
use std::time::Duration;

use super::types::CallState;
use crate::config::TimerConfig;
use crate::types::{TimerScope, TimerType};

/// Which timers a state arms on entry and cancels on exit.
///
/// Exit cancels exactly the entry timers of the state being left; entering
/// a terminal state cancels everything outstanding.
#[derive(Debug, Clone)]
pub struct TimerPolicy {
    entry: HashMap<CallState, Vec<(TimerType, Duration)>>,
}

impl TimerPolicy {
    pub fn from_config(config: &TimerConfig) -> Self {
        let d = |t: TimerType| (t, config.duration_of(t));
        let early_media_watchdog = (
            TimerType::RtpWatchdog,
            Duration::from_secs(config.early_media_rtp_watchdog_secs),
        );

        let entry = HashMap::from([
            (CallState::Queued, vec![d(TimerType::QueueTimeout)]),
            (CallState::Reserved, vec![d(TimerType::ReserveTimeout)]),
            (CallState::Originating, vec![d(TimerType::OriginateTimeout)]),
            (CallState::Ringing, vec![d(TimerType::RingTimeout)]),
            (CallState::EarlyMedia, vec![d(TimerType::RingTimeout), early_media_watchdog]),
            (CallState::Answered, vec![d(TimerType::RtpWatchdog)]),
            (CallState::AmdProcessing, vec![d(TimerType::AmdTimeout)]),
            (CallState::WaitingAgent, vec![d(TimerType::AgentWaitTimeout)]),
            (CallState::AgentRinging, vec![d(TimerType::AgentRingTimeout)]),
            (CallState::Bridged, vec![d(TimerType::RtpWatchdog)]),
        ]);

        Self { entry }
    }

    /// Timers to arm when `state` is entered
    pub fn on_entry(&self, state: CallState) -> &[(TimerType, Duration)] {
        self.entry.get(&state).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Timers to cancel when moving from `from` to `to`
    pub fn on_exit(&self, from: CallState, to: CallState) -> TimerScope {
        if to.is_terminal() {
            return TimerScope::All;
        }
        TimerScope::Types(self.on_entry(from).iter().map(|(t, _)| *t).collect())
    }
}

impl Default for TimerPolicy {
    fn default() -> Self {
        Self::from_config(&TimerConfig::default())
    }
}
