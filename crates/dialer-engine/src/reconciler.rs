//! Signal reconciler
//!
//! Consumes adapter events, turns each into a call event for the owning
//! attempt, and feeds outcomes back into route health. Events arrive out of
//! order and may be duplicated; the state table absorbs both.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::adapter::{AdapterEvent, AdapterEventType};
use crate::error::Result;
use crate::route_health::RouteHealthTable;
use crate::state_machine::{CallStateMachine, TransitionData, TransitionKind};
use crate::state_table::{CallEvent, CallState};
use crate::storage::DialerStore;
use crate::types::{AmdResult, AttemptId, CallAttempt};

/// Call event for an adapter event. `Progress` is a ride-through that never
/// changes state; `None` means the event carries nothing usable.
pub fn map_event(event: &AdapterEvent) -> Option<CallEvent> {
    match event.event_type {
        AdapterEventType::Dial => Some(CallEvent::Progress),
        AdapterEventType::Ring => Some(match event.response_code {
            Some(183) => CallEvent::EarlyMedia,
            _ => CallEvent::Ringing,
        }),
        AdapterEventType::Answer => Some(CallEvent::Answer),
        AdapterEventType::Hangup => hangup_event(event.response_code),
        AdapterEventType::Bridge => Some(CallEvent::Bridge),
        AdapterEventType::RtpStart => Some(CallEvent::RtpStarted),
        AdapterEventType::RtpTimeout => Some(CallEvent::RtpTimeout),
        AdapterEventType::AmdResult => Some(match event.amd_result {
            Some(AmdResult::Human) => CallEvent::AmdHuman,
            Some(AmdResult::Machine) => CallEvent::AmdMachine,
            Some(AmdResult::NotSure) | None => CallEvent::AmdTimeout,
        }),
    }
}

/// Hangup classification by final response code
pub fn hangup_event(code: Option<u16>) -> Option<CallEvent> {
    match code {
        None | Some(200) => Some(CallEvent::Bye),
        Some(408) | Some(480) => Some(CallEvent::NoAnswer),
        Some(486) | Some(600) => Some(CallEvent::Busy),
        Some(487) => Some(CallEvent::Cancel),
        Some(300..=499) => Some(CallEvent::Reject4xx),
        Some(500..=599) => Some(CallEvent::Reject5xx),
        Some(601..=699) => Some(CallEvent::Reject6xx),
        Some(201..=299) => Some(CallEvent::Bye),
        Some(_) => None,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Applied {
        attempt_id: AttemptId,
        from: CallState,
        to: CallState,
    },
    /// The event was accepted but did not move the attempt
    Unchanged { attempt_id: AttemptId, state: CallState },
    RideThrough { attempt_id: AttemptId },
    NoAttempt { correlation_id: String },
    Unmapped { attempt_id: AttemptId },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcilerStats {
    pub received: u64,
    pub applied: u64,
    pub dropped: u64,
    pub errors: u64,
}

pub struct SignalReconciler {
    store: Arc<dyn DialerStore>,
    state_machine: Arc<CallStateMachine>,
    health: Arc<RouteHealthTable>,
    received: AtomicU64,
    applied: AtomicU64,
    dropped: AtomicU64,
    errors: AtomicU64,
}

impl SignalReconciler {
    pub fn new(
        store: Arc<dyn DialerStore>,
        state_machine: Arc<CallStateMachine>,
        health: Arc<RouteHealthTable>,
    ) -> Self {
        Self {
            store,
            state_machine,
            health,
            received: AtomicU64::new(0),
            applied: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> ReconcilerStats {
        ReconcilerStats {
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Handle events until every sender is gone
    pub async fn run(&self, mut events: mpsc::Receiver<AdapterEvent>) {
        info!("Signal reconciler started");
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle_event(event).await {
                self.errors.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, "Failed to reconcile adapter event");
            }
        }
        info!("Signal reconciler stopped, event channel closed");
    }

    pub async fn handle_event(&self, event: AdapterEvent) -> Result<ReconcileOutcome> {
        self.received.fetch_add(1, Ordering::Relaxed);

        let Some(attempt) = self.store.find_attempt_by_correlation(&event.correlation_id).await? else {
            debug!(correlation_id = %event.correlation_id, event_type = %event.event_type, "No attempt for event, dropping");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return Ok(ReconcileOutcome::NoAttempt {
                correlation_id: event.correlation_id,
            });
        };

        let outcome = self.apply(&attempt, &event).await;

        // the code history records what the adapter reported, whatever the transition did
        let vanished = matches!(outcome, Ok(ReconcileOutcome::NoAttempt { .. }));
        let appended = match event.response_code {
            Some(code) if !vanished => self.store.append_response_code(&attempt.id, code).await,
            _ => Ok(()),
        };
        let outcome = outcome?;
        appended?;
        Ok(outcome)
    }

    async fn apply(&self, attempt: &CallAttempt, event: &AdapterEvent) -> Result<ReconcileOutcome> {
        let outcome = match map_event(event) {
            None => {
                debug!(attempt_id = %attempt.id, event_type = %event.event_type, code = ?event.response_code, "Unmapped adapter event");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                ReconcileOutcome::Unmapped {
                    attempt_id: attempt.id.clone(),
                }
            }
            Some(CallEvent::Progress) => {
                debug!(attempt_id = %attempt.id, channel_id = ?event.channel_id, "Call progress");
                ReconcileOutcome::RideThrough {
                    attempt_id: attempt.id.clone(),
                }
            }
            Some(call_event) => {
                let mut data = TransitionData::new().with_raw(event.raw.clone());
                data.response_code = event.response_code;
                data.reason = event.reason.clone();
                data.amd_result = event.amd_result;

                let result = self.state_machine.transition(&attempt.id, call_event, Some(data)).await?;
                match (result.kind, result.from_state, result.to_state) {
                    (TransitionKind::Applied, Some(from), Some(to)) if from != to => {
                        self.applied.fetch_add(1, Ordering::Relaxed);
                        // only a real state change feeds health, so replays never count twice
                        if let Some(trunk_id) = &attempt.trunk_id {
                            self.health.record_outcome(trunk_id, to, event.response_code);
                        }
                        ReconcileOutcome::Applied {
                            attempt_id: attempt.id.clone(),
                            from,
                            to,
                        }
                    }
                    (TransitionKind::NotFound, ..) => {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        return Ok(ReconcileOutcome::NoAttempt {
                            correlation_id: event.correlation_id.clone(),
                        });
                    }
                    _ => ReconcileOutcome::Unchanged {
                        attempt_id: attempt.id.clone(),
                        state: result.to_state.unwrap_or(attempt.state),
                    },
                }
            }
        };

        Ok(outcome)
    }
}
