//! Dispatcher scenarios: claiming, rate limiting, routing and adapter failures

mod common;

use common::{adapter, Fixture};
use chrono::{Duration as ChronoDuration, Utc};
use pretty_assertions::assert_eq;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use rvoip_dialer_engine::adapter::{SimulatedAdapter, SimulatedOutcome, TelephonyAdapter};
use rvoip_dialer_engine::config::{RateLimitConfig, RouteHealthConfig, SchedulerConfig};
use rvoip_dialer_engine::dispatcher::{DispatchOutcome, Dispatcher, DispatcherSettings};
use rvoip_dialer_engine::rate_limit::RateLimiter;
use rvoip_dialer_engine::route_health::RouteHealthTable;
use rvoip_dialer_engine::scheduler::AdmissionScheduler;
use rvoip_dialer_engine::storage::DialerStore;
use rvoip_dialer_engine::state_table::CallState;
use rvoip_dialer_engine::types::{CallerIdNumber, DialerMode, JobStatus, TrunkId};

struct Rig {
    fx: Fixture,
    adapter: Arc<SimulatedAdapter>,
    limiter: Arc<RateLimiter>,
    health: Arc<RouteHealthTable>,
}

impl Rig {
    async fn new(leads: usize) -> Self {
        let fx = Fixture::new();
        fx.campaign(DialerMode::Power, 1.0, leads as u32, leads);
        AdmissionScheduler::new(fx.dyn_store(), fx.state_machine.clone(), SchedulerConfig::default(), "sched")
            .tick()
            .await
            .unwrap();

        let adapter = adapter(SimulatedOutcome::Silent);
        adapter.connect().await.unwrap();

        Self {
            fx,
            adapter,
            limiter: Arc::new(RateLimiter::new(&RateLimitConfig::default())),
            health: Arc::new(RouteHealthTable::new(RouteHealthConfig::default())),
        }
    }

    fn dispatcher(&self, owner: &str) -> Dispatcher {
        Dispatcher::new(
            self.fx.dyn_store(),
            self.fx.state_machine.clone(),
            self.adapter.clone(),
            self.limiter.clone(),
            self.health.clone(),
            DispatcherSettings {
                owner: owner.to_string(),
                batch_size: 20,
                job_timeout: Duration::from_secs(5),
                stale_job_after: Duration::from_secs(30),
                originate_timeout: Duration::from_secs(1),
                call_timeout: Duration::from_secs(45),
                default_caller_id: "+10000000000".to_string(),
            },
        )
    }
}

#[tokio::test(start_paused = true)]
async fn test_originates_reserved_attempts() {
    let rig = Rig::new(3).await;
    rig.fx.trunk("trunk-a", 10.0);
    rig.fx.store.insert_caller_id(CallerIdNumber::new("+15551230000"));

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(DispatchOutcome::is_originated));

    assert!(rig.fx.store.jobs().iter().all(|j| j.status == JobStatus::Completed));
    for attempt in rig.fx.store.attempts() {
        assert_eq!(attempt.state, CallState::Originating);
        assert_eq!(attempt.trunk_id, Some(TrunkId::from("trunk-a")));
        assert_eq!(attempt.caller_id.as_deref(), Some("+15551230000"));
    }

    let requests = rig.adapter.originated();
    assert_eq!(requests.len(), 3);
    assert!(requests[0].variables.contains_key("dialer_attempt_id"));
    assert_eq!(requests[0].timeout, Duration::from_secs(45));
}

#[tokio::test(start_paused = true)]
async fn test_two_dispatchers_never_process_the_same_job() {
    let rig = Rig::new(10).await;
    rig.fx.trunk("trunk-a", 100.0);

    let (a, b) = (rig.dispatcher("dialer-a"), rig.dispatcher("dialer-b"));
    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    let outcomes: Vec<_> = ra.unwrap().into_iter().chain(rb.unwrap()).collect();

    assert_eq!(outcomes.len(), 10);
    let jobs: HashSet<_> = outcomes.iter().map(|o| o.job_id().clone()).collect();
    assert_eq!(jobs.len(), 10);
    assert_eq!(rig.adapter.originated().len(), 10);
}

#[tokio::test(start_paused = true)]
async fn test_empty_bucket_requeues_instead_of_failing() {
    let rig = Rig::new(5).await;
    rig.fx.trunk("trunk-a", 2.0);

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    let originated = outcomes.iter().filter(|o| o.is_originated()).count();
    let requeued = outcomes
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Requeued { .. }))
        .count();
    assert_eq!(originated, 2);
    assert_eq!(requeued, 3);

    // requeued jobs are pending again and their attempts still RESERVED
    let pending = rig
        .fx
        .store
        .jobs()
        .into_iter()
        .filter(|j| j.status == JobStatus::Pending)
        .count();
    assert_eq!(pending, 3);
    let reserved = rig
        .fx
        .store
        .attempts()
        .into_iter()
        .filter(|a| a.state == CallState::Reserved)
        .count();
    assert_eq!(reserved, 3);

    // one second refills two tokens
    tokio::time::advance(Duration::from_secs(1)).await;
    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.is_originated()).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_no_route_requeues() {
    let rig = Rig::new(2).await;

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert!(outcomes
        .iter()
        .all(|o| matches!(o, DispatchOutcome::Requeued { .. })));
    assert!(rig.adapter.originated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_adapter_failure_fails_attempt_and_penalizes_trunk() {
    let rig = Rig::new(1).await;
    rig.fx.trunk("trunk-a", 10.0);
    rig.adapter.fail_next_originate(1);

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert!(matches!(outcomes[0], DispatchOutcome::Failed { .. }));

    let attempt = &rig.fx.store.attempts()[0];
    assert_eq!(attempt.state, CallState::Failed);
    assert_eq!(rig.fx.store.jobs()[0].status, JobStatus::Failed);

    let health = rig.health.get(&TrunkId::from("trunk-a")).unwrap();
    assert_eq!(health.score, 90.0);
}

#[tokio::test(start_paused = true)]
async fn test_job_for_moved_attempt_is_failed() {
    let rig = Rig::new(1).await;
    rig.fx.trunk("trunk-a", 10.0);

    let attempt = rig.fx.store.attempts()[0].clone();
    rig.fx
        .state_machine
        .transition(&attempt.id, rvoip_dialer_engine::state_table::CallEvent::Cancel, None)
        .await
        .unwrap();

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert!(matches!(outcomes[0], DispatchOutcome::Failed { .. }));
    assert!(rig.adapter.originated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_default_caller_id_when_pool_is_empty() {
    let rig = Rig::new(1).await;
    rig.fx.trunk("trunk-a", 10.0);

    rig.dispatcher("dialer-a").tick().await.unwrap();
    assert_eq!(rig.adapter.originated()[0].caller_id, "+10000000000");
}

#[tokio::test(start_paused = true)]
async fn test_lone_degraded_trunk_still_carries_calls() {
    let rig = Rig::new(2).await;
    rig.fx.trunk("trunk-a", 10.0);
    rig.health.penalize(&TrunkId::from("trunk-a"), 60.0);
    assert!(rig.health.is_degraded(&TrunkId::from("trunk-a")));

    let outcomes = rig.dispatcher("dialer-a").tick().await.unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.is_originated()).count(), 2);
    assert!(rig
        .adapter
        .originated()
        .iter()
        .all(|r| r.trunk_id == TrunkId::from("trunk-a")));
}

#[tokio::test(start_paused = true)]
async fn test_half_cps_trunk_dials_every_two_seconds() {
    let rig = Rig::new(2).await;
    rig.fx.trunk("trunk-slow", 0.5);
    let dispatcher = rig.dispatcher("dialer-a");

    let first = dispatcher.tick().await.unwrap();
    assert_eq!(first.iter().filter(|o| o.is_originated()).count(), 1);

    tokio::time::advance(Duration::from_secs(1)).await;
    let second = dispatcher.tick().await.unwrap();
    assert!(second.iter().all(|o| matches!(o, DispatchOutcome::Requeued { .. })));

    tokio::time::advance(Duration::from_secs(1)).await;
    let third = dispatcher.tick().await.unwrap();
    assert_eq!(third.iter().filter(|o| o.is_originated()).count(), 1);
    assert_eq!(rig.adapter.originated().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_jobs_stranded_by_a_dead_dispatcher_are_reclaimed() {
    let rig = Rig::new(2).await;
    rig.fx.trunk("trunk-a", 10.0);

    // claimed by a dispatcher that never settles them
    let stranded = rig.fx.store.claim_jobs("dialer-gone", 10).await.unwrap();
    assert_eq!(stranded.len(), 2);

    let dispatcher = rig.dispatcher("dialer-a");
    assert_eq!(dispatcher.reclaim_stale_jobs(Utc::now()).await, 0);
    assert!(dispatcher.tick().await.unwrap().is_empty());

    let later = Utc::now() + ChronoDuration::seconds(31);
    assert_eq!(dispatcher.reclaim_stale_jobs(later).await, 2);
    assert!(rig.fx.store.jobs().iter().all(|j| j.status == JobStatus::Pending));

    let outcomes = dispatcher.tick().await.unwrap();
    assert_eq!(outcomes.iter().filter(|o| o.is_originated()).count(), 2);
}
