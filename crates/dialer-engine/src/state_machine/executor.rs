use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::stats::TransitionStats;
use crate::error::{DialerError, Result};
use crate::state_table::{CallEvent, CallState, MasterStateTable, TimerPolicy, Transition, MASTER_TABLE};
use crate::storage::DialerStore;
use crate::types::{AmdResult, AttemptEvent, AttemptId, AttemptTransition, CallAttempt, DialerTimer, TimerScope, TimerType};

/// Re-reads allowed when another writer moved the attempt first
const MAX_CAS_ATTEMPTS: usize = 3;

/// Auxiliary data carried with an event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransitionData {
    pub response_code: Option<u16>,
    pub reason: Option<String>,
    pub amd_result: Option<AmdResult>,
    pub raw: Option<serde_json::Value>,
}

impl TransitionData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_amd(mut self, result: AmdResult) -> Self {
        self.amd_result = Some(result);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = Some(raw);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    /// State changed
    Applied,
    /// In-state event that only cancelled a timer
    Internal,
    /// No entry for (state, event)
    Ignored,
    /// Attempt does not exist
    NotFound,
}

/// Result of [`CallStateMachine::transition`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionResult {
    pub success: bool,
    pub kind: TransitionKind,
    pub from_state: Option<CallState>,
    pub to_state: Option<CallState>,
    pub timers_created: Vec<TimerType>,
    pub timers_cancelled: Vec<TimerType>,
}

impl TransitionResult {
    pub fn not_found() -> Self {
        Self {
            success: false,
            kind: TransitionKind::NotFound,
            from_state: None,
            to_state: None,
            timers_created: Vec::new(),
            timers_cancelled: Vec::new(),
        }
    }

    fn unchanged(kind: TransitionKind, state: CallState) -> Self {
        Self {
            success: true,
            kind,
            from_state: Some(state),
            to_state: Some(state),
            timers_created: Vec::new(),
            timers_cancelled: Vec::new(),
        }
    }

    /// True only when the attempt moved to a different state
    pub fn changed(&self) -> bool {
        self.kind == TransitionKind::Applied && self.from_state != self.to_state
    }
}

/// Drives call attempts through the decision table and owns every side
/// effect of a state change: phase stamps, persistence, audit events and
/// timers.
pub struct CallStateMachine {
    store: Arc<dyn DialerStore>,
    table: Arc<MasterStateTable>,
    timers: TimerPolicy,
    stats: Arc<TransitionStats>,
}

impl CallStateMachine {
    /// State machine over the process-wide master table
    pub fn new(store: Arc<dyn DialerStore>, timers: TimerPolicy) -> Self {
        Self::with_table(store, MASTER_TABLE.clone(), timers)
    }

    pub fn with_table(store: Arc<dyn DialerStore>, table: Arc<MasterStateTable>, timers: TimerPolicy) -> Self {
        Self {
            store,
            table,
            timers,
            stats: Arc::new(TransitionStats::new()),
        }
    }

    pub fn stats(&self) -> Arc<TransitionStats> {
        self.stats.clone()
    }

    pub fn timer_policy(&self) -> &TimerPolicy {
        &self.timers
    }

    /// Persist a new attempt and arm the entry timers of its initial state
    pub async fn create(&self, attempt: &CallAttempt) -> Result<Vec<TimerType>> {
        self.store.create_attempt(attempt).await?;

        let mut created = Vec::new();
        for (timer_type, after) in self.timers.on_entry(attempt.state) {
            self.store
                .create_timer(&DialerTimer::new(attempt.id.clone(), *timer_type, *after))
                .await?;
            created.push(*timer_type);
        }
        Ok(created)
    }

    /// Feed one event to an attempt.
    ///
    /// Unknown attempts and unmapped (state, event) pairs are soft no-ops.
    /// Persistence uses compare-and-set on the current state, so concurrent
    /// callers never apply two transitions from the same state.
    pub async fn transition(
        &self,
        attempt_id: &AttemptId,
        event: CallEvent,
        data: Option<TransitionData>,
    ) -> Result<TransitionResult> {
        let data = data.unwrap_or_default();

        for _ in 0..MAX_CAS_ATTEMPTS {
            let Some(attempt) = self.store.get_attempt(attempt_id).await? else {
                debug!(attempt_id = %attempt_id, event = %event, "Transition for unknown attempt");
                self.stats.record_not_found();
                return Ok(TransitionResult::not_found());
            };
            let from = attempt.state;

            match self.table.get(from, event) {
                None => {
                    debug!(attempt_id = %attempt_id, state = %from, event = %event, "Ignoring event with no transition");
                    self.stats.record_ignored(from, event);
                    return Ok(TransitionResult::unchanged(TransitionKind::Ignored, from));
                }
                Some(Transition::Internal { cancel }) => {
                    return self.apply_internal(&attempt, event, cancel, &data).await;
                }
                Some(Transition::To(next)) => {
                    let change = build_transition(&attempt, event, next, &data);
                    match self.store.apply_transition(&change).await {
                        Ok(true) => return self.after_applied(&attempt, event, change, &data).await,
                        Ok(false) => {
                            debug!(attempt_id = %attempt_id, expected = %from, "State changed underneath, re-reading");
                            self.stats.record_conflict();
                        }
                        Err(e) if e.is_not_found() => {
                            self.stats.record_not_found();
                            return Ok(TransitionResult::not_found());
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
        }

        Err(DialerError::storage(format!(
            "attempt {} kept changing state while applying {}",
            attempt_id, event
        )))
    }

    async fn apply_internal(
        &self,
        attempt: &CallAttempt,
        event: CallEvent,
        cancel: TimerType,
        data: &TransitionData,
    ) -> Result<TransitionResult> {
        let cancelled = self
            .store
            .cancel_timers(&attempt.id, &TimerScope::Types(vec![cancel]))
            .await?;
        self.audit(attempt, attempt.state, event, data).await;
        self.stats.record_internal();

        debug!(attempt_id = %attempt.id, state = %attempt.state, event = %event, cancelled = ?cancelled, "Internal transition");
        let mut result = TransitionResult::unchanged(TransitionKind::Internal, attempt.state);
        result.timers_cancelled = cancelled;
        Ok(result)
    }

    async fn after_applied(
        &self,
        attempt: &CallAttempt,
        event: CallEvent,
        change: AttemptTransition,
        data: &TransitionData,
    ) -> Result<TransitionResult> {
        let (from, to) = (change.from, change.to);
        self.audit(attempt, to, event, data).await;

        // cancel before create so a re-entered state keeps only fresh timers
        let scope = self.timers.on_exit(from, to);
        let timers_cancelled = if scope.is_empty() {
            Vec::new()
        } else {
            self.store.cancel_timers(&attempt.id, &scope).await?
        };

        let mut timers_created = Vec::new();
        if !to.is_terminal() {
            for (timer_type, after) in self.timers.on_entry(to) {
                let timer = DialerTimer::new(attempt.id.clone(), *timer_type, *after);
                self.store.create_timer(&timer).await?;
                timers_created.push(*timer_type);
            }
        }

        self.stats.record_applied();
        if to.is_terminal() {
            info!(attempt_id = %attempt.id, from = %from, to = %to, event = %event,
                  final_code = ?change.final_code, "Call attempt finished");
        } else {
            debug!(attempt_id = %attempt.id, from = %from, to = %to, event = %event, "Transition applied");
        }

        Ok(TransitionResult {
            success: true,
            kind: TransitionKind::Applied,
            from_state: Some(from),
            to_state: Some(to),
            timers_created,
            timers_cancelled,
        })
    }

    /// Audit records are best-effort; a failed write never undoes a transition
    async fn audit(&self, attempt: &CallAttempt, to: CallState, event: CallEvent, data: &TransitionData) {
        let record = AttemptEvent {
            attempt_id: attempt.id.clone(),
            from_state: attempt.state,
            to_state: to,
            event: event.as_str().to_string(),
            data: json!({
                "response_code": data.response_code,
                "reason": data.reason,
                "amd_result": data.amd_result,
                "raw": data.raw,
            }),
            at: Utc::now(),
        };
        if let Err(e) = self.store.record_event(&record).await {
            warn!(attempt_id = %attempt.id, error = %e, "Failed to record attempt event");
        }
    }
}

fn build_transition(attempt: &CallAttempt, event: CallEvent, next: CallState, data: &TransitionData) -> AttemptTransition {
    let terminal = next.is_terminal();
    let amd_result = match event {
        CallEvent::AmdHuman => Some(AmdResult::Human),
        CallEvent::AmdMachine => Some(AmdResult::Machine),
        CallEvent::AmdTimeout => Some(AmdResult::NotSure),
        _ => data.amd_result,
    };

    AttemptTransition {
        attempt_id: attempt.id.clone(),
        from: attempt.state,
        to: next,
        phase: next.phase(),
        at: Utc::now(),
        final_code: if terminal { data.response_code } else { None },
        final_reason: if terminal {
            Some(data.reason.clone().unwrap_or_else(|| event.as_str().to_string()))
        } else {
            None
        },
        amd_result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::types::{Campaign, DialerMode, Lead};

    async fn setup(state: CallState) -> (Arc<MemoryStore>, CallStateMachine, AttemptId) {
        let store = Arc::new(MemoryStore::new());
        let campaign = Campaign::new("test", DialerMode::Power);
        let lead = Lead::new(campaign.id.clone(), "+15551230001");
        let mut attempt = CallAttempt::queued(&campaign, &lead);
        attempt.state = state;
        let id = attempt.id.clone();
        store.create_attempt(&attempt).await.unwrap();
        let sm = CallStateMachine::new(store.clone(), TimerPolicy::default());
        (store, sm, id)
    }

    fn active_timers(store: &MemoryStore, id: &AttemptId) -> Vec<TimerType> {
        store
            .timers_for(id)
            .into_iter()
            .filter(|t| !t.cancelled && !t.fired)
            .map(|t| t.timer_type)
            .collect()
    }

    #[tokio::test]
    async fn test_missing_attempt_is_soft_noop() {
        let (_store, sm, _id) = setup(CallState::Queued).await;
        let result = sm.transition(&AttemptId::from("att-missing"), CallEvent::Reserve, None).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.kind, TransitionKind::NotFound);
    }

    #[tokio::test]
    async fn test_entry_timers_replace_exit_timers() {
        let (store, sm, id) = setup(CallState::Originating).await;

        let r = sm.transition(&id, CallEvent::EarlyMedia, None).await.unwrap();
        assert!(r.changed());
        assert_eq!(r.timers_created, vec![TimerType::RingTimeout, TimerType::RtpWatchdog]);

        let r = sm.transition(&id, CallEvent::RtpStarted, None).await.unwrap();
        assert_eq!(r.kind, TransitionKind::Internal);
        assert_eq!(r.timers_cancelled, vec![TimerType::RtpWatchdog]);
        assert_eq!(active_timers(&store, &id), vec![TimerType::RingTimeout]);

        let r = sm.transition(&id, CallEvent::Answer, Some(TransitionData::new().with_code(200))).await.unwrap();
        assert_eq!(r.to_state, Some(CallState::Answered));
        assert_eq!(r.timers_cancelled, vec![TimerType::RingTimeout]);
        assert_eq!(active_timers(&store, &id), vec![TimerType::RtpWatchdog]);
    }

    #[tokio::test]
    async fn test_terminal_cancels_everything_and_records_final() {
        let (store, sm, id) = setup(CallState::Ringing).await;
        store.create_timer(&DialerTimer::new(id.clone(), TimerType::RingTimeout, std::time::Duration::from_secs(45)))
            .await
            .unwrap();
        store.create_timer(&DialerTimer::new(id.clone(), TimerType::QueueTimeout, std::time::Duration::from_secs(60)))
            .await
            .unwrap();

        let data = TransitionData::new().with_code(486).with_reason("Busy Here");
        let r = sm.transition(&id, CallEvent::Busy, Some(data)).await.unwrap();
        assert_eq!(r.to_state, Some(CallState::Busy));
        assert!(r.timers_created.is_empty());
        assert!(active_timers(&store, &id).is_empty());

        let attempt = store.get_attempt(&id).await.unwrap().unwrap();
        assert_eq!(attempt.final_code, Some(486));
        assert_eq!(attempt.final_reason.as_deref(), Some("Busy Here"));
        assert!(attempt.timestamps.end_at.is_some());
    }

    #[tokio::test]
    async fn test_replayed_terminal_event_is_noop() {
        let (store, sm, id) = setup(CallState::Ringing).await;
        sm.transition(&id, CallEvent::NoAnswer, None).await.unwrap();
        let end_at = store.get_attempt(&id).await.unwrap().unwrap().timestamps.end_at;
        let events_before = store.events_for(&id).len();

        let r = sm.transition(&id, CallEvent::NoAnswer, None).await.unwrap();
        assert!(r.success);
        assert_eq!(r.kind, TransitionKind::Ignored);
        assert_eq!(r.from_state, r.to_state);
        assert_eq!(store.get_attempt(&id).await.unwrap().unwrap().timestamps.end_at, end_at);
        assert_eq!(store.events_for(&id).len(), events_before);
        assert_eq!(sm.stats().ignored_count(CallState::NoAnswer, CallEvent::NoAnswer), 1);
    }

    #[tokio::test]
    async fn test_amd_timeout_records_not_sure() {
        let (store, sm, id) = setup(CallState::AmdProcessing).await;
        let r = sm.transition(&id, CallEvent::AmdTimeout, None).await.unwrap();
        assert_eq!(r.to_state, Some(CallState::AmdHuman));
        let attempt = store.get_attempt(&id).await.unwrap().unwrap();
        assert_eq!(attempt.amd_result, Some(AmdResult::NotSure));
    }

    #[tokio::test]
    async fn test_create_arms_queue_timer_and_reserve_cancels_it() {
        let store = Arc::new(MemoryStore::new());
        let sm = CallStateMachine::new(store.clone(), TimerPolicy::default());
        let campaign = Campaign::new("test", DialerMode::Preview);
        let attempt = CallAttempt::queued(&campaign, &Lead::new(campaign.id.clone(), "+15551230002"));

        assert_eq!(sm.create(&attempt).await.unwrap(), vec![TimerType::QueueTimeout]);
        let r = sm.transition(&attempt.id, CallEvent::Reserve, None).await.unwrap();
        assert_eq!(r.timers_cancelled, vec![TimerType::QueueTimeout]);
        assert_eq!(active_timers(&store, &attempt.id), vec![TimerType::ReserveTimeout]);
    }

    #[tokio::test]
    async fn test_audit_event_written() {
        let (store, sm, id) = setup(CallState::Queued).await;
        sm.transition(&id, CallEvent::Reserve, None).await.unwrap();
        let events = store.events_for(&id);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].from_state, CallState::Queued);
        assert_eq!(events[0].to_state, CallState::Reserved);
        assert_eq!(events[0].event, "RESERVE");
    }
}
