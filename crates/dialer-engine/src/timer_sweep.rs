use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::state_machine::{CallStateMachine, TransitionData, TransitionKind};
use crate::state_table::{CallEvent, CallState};
use crate::storage::DialerStore;
use crate::types::{DialerTimer, TimerType};

/// Event a fired timer feeds to an attempt in `state`.
///
/// `None` means the timer is stale for that state and is dropped.
pub fn timer_event(timer_type: TimerType, state: CallState) -> Option<CallEvent> {
    use CallState as S;
    use TimerType as T;

    match (timer_type, state) {
        (T::QueueTimeout, S::Queued)
        | (T::ReserveTimeout, S::Reserved)
        | (T::OriginateTimeout, S::Originating)
        | (T::RingTimeout, S::Ringing | S::EarlyMedia)
        | (T::AgentWaitTimeout, S::WaitingAgent) => Some(CallEvent::Timeout),
        (T::RtpWatchdog, S::EarlyMedia | S::Answered | S::Bridged) => Some(CallEvent::RtpTimeout),
        (T::AmdTimeout, S::AmdProcessing) => Some(CallEvent::AmdTimeout),
        (T::AgentRingTimeout, S::AgentRinging) => Some(CallEvent::AgentNoAnswer),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub claimed: usize,
    pub applied: usize,
    pub dropped: usize,
    pub failed: usize,
}

/// Fires due timers into the state machine
pub struct TimerProcessor {
    store: Arc<dyn DialerStore>,
    state_machine: Arc<CallStateMachine>,
    batch_size: u32,
}

impl TimerProcessor {
    pub fn new(store: Arc<dyn DialerStore>, state_machine: Arc<CallStateMachine>, batch_size: u32) -> Self {
        Self {
            store,
            state_machine,
            batch_size,
        }
    }

    pub async fn tick(&self) -> Result<SweepReport> {
        self.tick_at(Utc::now()).await
    }

    /// Claim every timer due at `now` and fire each one independently
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let timers = self.store.claim_due_timers(now, self.batch_size).await?;
        let mut report = SweepReport {
            claimed: timers.len(),
            ..Default::default()
        };

        for timer in &timers {
            match self.fire(timer).await {
                Ok(true) => report.applied += 1,
                Ok(false) => report.dropped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(timer_id = %timer.id, attempt_id = %timer.attempt_id, error = %e, "Timer failed to fire");
                }
            }
        }

        if report.claimed > 0 {
            debug!(?report, "Timer sweep complete");
        }
        Ok(report)
    }

    async fn fire(&self, timer: &DialerTimer) -> Result<bool> {
        let Some(attempt) = self.store.get_attempt(&timer.attempt_id).await? else {
            debug!(timer_id = %timer.id, attempt_id = %timer.attempt_id, "Timer for unknown attempt");
            return Ok(false);
        };

        let Some(event) = timer_event(timer.timer_type, attempt.state) else {
            warn!(
                timer_id = %timer.id,
                attempt_id = %attempt.id,
                timer_type = %timer.timer_type,
                state = %attempt.state,
                "No event for timer in this state, dropping"
            );
            return Ok(false);
        };

        let data = TransitionData::new().with_reason(timer.timer_type.as_str());
        let result = self.state_machine.transition(&attempt.id, event, Some(data)).await?;
        Ok(result.kind == TransitionKind::Applied || result.kind == TransitionKind::Internal)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timer_event_table() {
        assert_eq!(timer_event(TimerType::RingTimeout, CallState::Ringing), Some(CallEvent::Timeout));
        assert_eq!(timer_event(TimerType::RtpWatchdog, CallState::Bridged), Some(CallEvent::RtpTimeout));
        assert_eq!(timer_event(TimerType::AmdTimeout, CallState::AmdProcessing), Some(CallEvent::AmdTimeout));
        assert_eq!(
            timer_event(TimerType::AgentRingTimeout, CallState::AgentRinging),
            Some(CallEvent::AgentNoAnswer)
        );
        assert_eq!(timer_event(TimerType::RingTimeout, CallState::Answered), None);
        assert_eq!(timer_event(TimerType::QueueTimeout, CallState::Ended), None);
    }

    #[test]
    fn test_every_mapped_event_has_a_transition() {
        let table = crate::state_table::MASTER_TABLE.clone();
        for timer_type in TimerType::ALL {
            for state in CallState::ALL {
                if let Some(event) = timer_event(timer_type, state) {
                    assert!(
                        table.get(state, event).is_some(),
                        "{} in {} maps to {} which has no transition",
                        timer_type,
                        state,
                        event
                    );
                }
            }
        }
    }
}
