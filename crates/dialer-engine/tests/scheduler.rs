//! Admission scheduler scenarios over the in-memory store

mod common;

use chrono::{TimeZone, Utc, Weekday};
use common::Fixture;
use pretty_assertions::assert_eq;
use std::collections::HashSet;

use rvoip_dialer_engine::config::SchedulerConfig;
use rvoip_dialer_engine::scheduler::{AdmissionScheduler, CampaignOutcome};
use rvoip_dialer_engine::state_table::CallState;
use rvoip_dialer_engine::storage::DialerStore;
use rvoip_dialer_engine::types::{DialerMode, JobStatus, LeadStatus, TimerType};

fn scheduler(fx: &Fixture, owner: &str) -> AdmissionScheduler {
    AdmissionScheduler::new(fx.dyn_store(), fx.state_machine.clone(), SchedulerConfig::default(), owner)
}

#[tokio::test]
async fn test_power_campaign_queues_agents_times_ratio() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Power, 2.0, 5, 50);

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();

    assert_eq!(
        report.outcome(&campaign.id),
        Some(&CampaignOutcome::Admitted {
            budget: 10,
            reserved: 10,
            queued: 10,
            failed: 0
        })
    );

    let attempts = fx.store.attempts();
    assert_eq!(attempts.len(), 10);
    assert!(attempts.iter().all(|a| a.state == CallState::Reserved));

    let jobs = fx.store.jobs();
    assert_eq!(jobs.len(), 10);
    assert!(jobs.iter().all(|j| j.status == JobStatus::Pending));

    // the queue timer is gone, the reserve timer is armed
    let timers = fx.store.timers_for(&attempts[0].id);
    assert!(timers
        .iter()
        .any(|t| t.timer_type == TimerType::QueueTimeout && t.cancelled));
    assert!(timers
        .iter()
        .any(|t| t.timer_type == TimerType::ReserveTimeout && !t.cancelled));

    for attempt in &attempts {
        assert_eq!(fx.store.lead(&attempt.lead_id).unwrap().status, LeadStatus::Dialed);
    }
}

#[tokio::test]
async fn test_predictive_campaign_without_history_keeps_its_ratio() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Predictive, 1.2, 10, 50);

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert_eq!(report.queued(), 12);
    assert!(matches!(
        report.outcome(&campaign.id),
        Some(CampaignOutcome::Admitted { budget: 12, .. })
    ));
}

#[tokio::test]
async fn test_budget_larger_than_pool_reserves_what_exists() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Power, 3.0, 4, 3);

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert_eq!(
        report.outcome(&campaign.id),
        Some(&CampaignOutcome::Admitted {
            budget: 12,
            reserved: 3,
            queued: 3,
            failed: 0
        })
    );

    // pool is empty now
    let again = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert!(matches!(
        again.outcome(&campaign.id),
        Some(CampaignOutcome::Admitted { reserved: 0, .. })
    ));
}

#[tokio::test]
async fn test_no_agents_means_no_budget() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Progressive, 1.0, 0, 10);

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert_eq!(report.outcome(&campaign.id), Some(&CampaignOutcome::NoBudget));
    assert!(fx.store.attempts().is_empty());
}

#[tokio::test]
async fn test_outside_work_hours_is_skipped() {
    let fx = Fixture::new();
    let mut campaign = fx.campaign(DialerMode::Progressive, 1.0, 5, 10);
    campaign.work_days = vec![Weekday::Mon];
    fx.store.insert_campaign(campaign.clone());

    // 2026-10-18 is a Sunday
    let sunday = Utc.with_ymd_and_hms(2026, 10, 18, 12, 0, 0).unwrap();
    let report = scheduler(&fx, "dialer-a").tick_at(sunday).await.unwrap();
    assert_eq!(report.outcome(&campaign.id), Some(&CampaignOutcome::OutsideWorkHours));

    let monday = Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap();
    let report = scheduler(&fx, "dialer-a").tick_at(monday).await.unwrap();
    assert_eq!(report.queued(), 6);
}

#[tokio::test]
async fn test_inactive_campaigns_are_not_listed() {
    let fx = Fixture::new();
    let mut campaign = fx.campaign(DialerMode::Power, 1.0, 5, 10);
    campaign.active = false;
    fx.store.insert_campaign(campaign.clone());

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert!(report.outcome(&campaign.id).is_none());
}

#[tokio::test]
async fn test_concurrent_schedulers_never_share_a_lead() {
    let fx = Fixture::new();
    fx.campaign(DialerMode::Power, 2.0, 5, 15);

    let a = scheduler(&fx, "dialer-a");
    let b = scheduler(&fx, "dialer-b");
    let (ra, rb) = tokio::join!(a.tick(), b.tick());
    assert_eq!(ra.unwrap().queued() + rb.unwrap().queued(), 15);

    let attempts = fx.store.attempts();
    let leads: HashSet<_> = attempts.iter().map(|a| a.lead_id.clone()).collect();
    assert_eq!(leads.len(), attempts.len());
}

#[tokio::test]
async fn test_release_returns_lead_to_pool() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Power, 1.0, 1, 1);
    let store = fx.dyn_store();

    let reserved = store.reserve_leads(&campaign.id, 5, "dialer-a").await.unwrap();
    assert_eq!(reserved.len(), 1);
    assert_eq!(reserved[0].reserved_by.as_deref(), Some("dialer-a"));
    assert!(store.reserve_leads(&campaign.id, 5, "dialer-b").await.unwrap().is_empty());

    store.release_lead(&reserved[0].id).await.unwrap();
    let lead = fx.store.lead(&reserved[0].id).unwrap();
    assert_eq!(lead.status, LeadStatus::Pending);
    assert!(lead.reserved_by.is_none());
    assert_eq!(store.reserve_leads(&campaign.id, 5, "dialer-b").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_failed_timer_write_leaves_no_live_attempt() {
    let fx = Fixture::new();
    let campaign = fx.campaign(DialerMode::Power, 1.0, 3, 3);
    fx.store.set_reject_timers(true);

    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert_eq!(
        report.outcome(&campaign.id),
        Some(&CampaignOutcome::Admitted {
            budget: 3,
            reserved: 3,
            queued: 0,
            failed: 3
        })
    );

    // every persisted attempt is closed and its lead is back in the pool
    let attempts = fx.store.attempts();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.state == CallState::Cancelled));
    for attempt in &attempts {
        assert_eq!(fx.store.lead(&attempt.lead_id).unwrap().status, LeadStatus::Pending);
    }
    assert!(fx.store.jobs().is_empty());

    let load = fx
        .store
        .campaign_load(&campaign.id, Utc::now() - chrono::Duration::minutes(15))
        .await
        .unwrap();
    assert_eq!(load.active_calls, 0);

    // capacity is intact once the store recovers
    fx.store.set_reject_timers(false);
    let report = scheduler(&fx, "dialer-a").tick().await.unwrap();
    assert_eq!(report.queued(), 3);
}
