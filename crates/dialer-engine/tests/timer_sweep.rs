//! Timer sweep: due timers drive attempts, stale timers are dropped

mod common;

use chrono::{Duration as ChronoDuration, Utc};
use common::Fixture;
use pretty_assertions::assert_eq;
use std::time::Duration;

use rvoip_dialer_engine::state_table::{CallEvent, CallState};
use rvoip_dialer_engine::storage::DialerStore;
use rvoip_dialer_engine::timer_sweep::{SweepReport, TimerProcessor};
use rvoip_dialer_engine::types::{CallAttempt, Campaign, DialerMode, DialerTimer, Lead, TimerType};

fn processor(fx: &Fixture) -> TimerProcessor {
    TimerProcessor::new(fx.dyn_store(), fx.state_machine.clone(), 100)
}

fn secs_from_now(secs: i64) -> chrono::DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(secs)
}

#[tokio::test]
async fn test_ring_timeout_ends_in_no_answer() {
    let fx = Fixture::new();
    let attempt = fx.attempt_in(CallState::Originating);
    fx.state_machine
        .transition(&attempt.id, CallEvent::Ringing, None)
        .await
        .unwrap();

    // not due yet
    let early = processor(&fx).tick_at(secs_from_now(10)).await.unwrap();
    assert_eq!(early, SweepReport::default());

    let report = processor(&fx).tick_at(secs_from_now(46)).await.unwrap();
    assert_eq!(report.claimed, 1);
    assert_eq!(report.applied, 1);

    let stored = fx.store.attempts().into_iter().find(|a| a.id == attempt.id).unwrap();
    assert_eq!(stored.state, CallState::NoAnswer);
    assert_eq!(stored.final_reason.as_deref(), Some(TimerType::RingTimeout.as_str()));

    // fired timers are never claimed again
    let again = processor(&fx).tick_at(secs_from_now(120)).await.unwrap();
    assert_eq!(again.claimed, 0);
}

#[tokio::test]
async fn test_queue_timeout_from_creation() {
    let fx = Fixture::new();
    let campaign = Campaign::new("timers", DialerMode::Progressive);
    let lead = Lead::new(campaign.id.clone(), "+15550002222");
    fx.store.insert_lead(lead.clone());
    let attempt = CallAttempt::queued(&campaign, &lead);

    let armed = fx.state_machine.create(&attempt).await.unwrap();
    assert_eq!(armed, vec![TimerType::QueueTimeout]);

    processor(&fx).tick_at(secs_from_now(61)).await.unwrap();
    assert_eq!(fx.state_of(&attempt), CallState::Timeout);
}

#[tokio::test]
async fn test_early_media_without_rtp() {
    let fx = Fixture::new();
    let attempt = fx.attempt_in(CallState::Originating);
    fx.state_machine
        .transition(&attempt.id, CallEvent::EarlyMedia, None)
        .await
        .unwrap();

    // the 4s early-media watchdog beats the ring timeout
    let report = processor(&fx).tick_at(secs_from_now(5)).await.unwrap();
    assert_eq!(report.applied, 1);
    assert_eq!(fx.state_of(&attempt), CallState::NoRtp);
}

#[tokio::test]
async fn test_rtp_start_disarms_watchdog() {
    let fx = Fixture::new();
    let attempt = fx.attempt_in(CallState::Ringing);
    let sm = &fx.state_machine;
    sm.transition(&attempt.id, CallEvent::Answer, None).await.unwrap();
    sm.transition(&attempt.id, CallEvent::RtpStarted, None).await.unwrap();

    let report = processor(&fx).tick_at(secs_from_now(30)).await.unwrap();
    assert_eq!(report.claimed, 0);
    assert_eq!(fx.state_of(&attempt), CallState::Answered);
}

#[tokio::test]
async fn test_timer_for_wrong_state_is_dropped() {
    let fx = Fixture::new();
    let attempt = fx.attempt_in(CallState::Bridged);
    fx.dyn_store()
        .create_timer(&DialerTimer::new(attempt.id.clone(), TimerType::RingTimeout, Duration::ZERO))
        .await
        .unwrap();

    let report = processor(&fx).tick_at(secs_from_now(1)).await.unwrap();
    assert_eq!(
        report,
        SweepReport {
            claimed: 1,
            applied: 0,
            dropped: 1,
            failed: 0
        }
    );
    assert_eq!(fx.state_of(&attempt), CallState::Bridged);
}

#[tokio::test]
async fn test_agent_ring_timeout_requeues_for_agent() {
    let fx = Fixture::new();
    let attempt = fx.attempt_in(CallState::WaitingAgent);
    fx.state_machine
        .transition(&attempt.id, CallEvent::AgentRing, None)
        .await
        .unwrap();

    processor(&fx).tick_at(secs_from_now(21)).await.unwrap();
    assert_eq!(fx.state_of(&attempt), CallState::WaitingAgent);

    // and the caller abandons after the agent wait timeout
    processor(&fx).tick_at(secs_from_now(21 + 121)).await.unwrap();
    assert_eq!(fx.state_of(&attempt), CallState::Timeout);
}
