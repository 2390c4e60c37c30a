//! Shared fixtures for the dialer integration tests

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rvoip_dialer_engine::adapter::{SimulatedAdapter, SimulatedOutcome, SimulationProfile};
use rvoip_dialer_engine::config::{DialerConfig, StorageBackend};
use rvoip_dialer_engine::state_machine::CallStateMachine;
use rvoip_dialer_engine::state_table::{CallState, TimerPolicy};
use rvoip_dialer_engine::storage::{DialerStore, MemoryStore};
use rvoip_dialer_engine::types::{CallAttempt, Campaign, DialerMode, Lead, Trunk};

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub state_machine: Arc<CallStateMachine>,
}

impl Fixture {
    pub fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        let state_machine = Arc::new(CallStateMachine::new(store.clone(), TimerPolicy::default()));
        Self { store, state_machine }
    }

    pub fn dyn_store(&self) -> Arc<dyn DialerStore> {
        self.store.clone()
    }

    /// Active campaign with `agents` idle agents and `leads` pending leads
    pub fn campaign(&self, mode: DialerMode, dial_ratio: f64, agents: u32, leads: usize) -> Campaign {
        let mut campaign = Campaign::new(format!("{} campaign", mode.as_str()), mode);
        campaign.dial_ratio = dial_ratio;
        campaign.max_concurrent_calls = 100;
        self.store.insert_campaign(campaign.clone());
        self.store.set_available_agents(&campaign.id, agents);
        self.store
            .insert_leads((0..leads).map(|i| Lead::new(campaign.id.clone(), format!("+1555{:07}", i))));
        campaign
    }

    pub fn trunk(&self, id: &str, cps: f64) -> Trunk {
        let trunk = Trunk::new(id, "carrier-a", cps);
        self.store.insert_trunk(trunk.clone());
        trunk
    }

    /// Attempt placed directly in `state`, bypassing the state machine
    pub fn attempt_in(&self, state: CallState) -> CallAttempt {
        let campaign = Campaign::new("fixture", DialerMode::Progressive);
        let lead = Lead::new(campaign.id.clone(), "+15550001111");
        self.store.insert_lead(lead.clone());

        let mut attempt = CallAttempt::queued(&campaign, &lead);
        attempt.state = state;
        self.store.overwrite_attempt(attempt.clone());
        attempt
    }

    /// Like [`attempt_in`](Self::attempt_in) but routed over `trunk_id`
    pub fn routed_attempt_in(&self, state: CallState, trunk_id: &str) -> CallAttempt {
        let mut attempt = self.attempt_in(state);
        attempt.trunk_id = Some(trunk_id.into());
        attempt.carrier_id = Some("carrier-a".into());
        self.store.overwrite_attempt(attempt.clone());
        attempt
    }

    pub fn state_of(&self, attempt: &CallAttempt) -> CallState {
        self.store
            .attempts()
            .into_iter()
            .find(|a| a.id == attempt.id)
            .map(|a| a.state)
            .expect("attempt exists")
    }
}

/// Config with fast loops over the in-memory backend
pub fn fast_config() -> DialerConfig {
    let mut config = DialerConfig::default();
    config.general.instance_id = "dialer-test".to_string();
    config.storage.backend = StorageBackend::Memory;
    config.scheduler.interval_ms = 20;
    config.dispatcher.interval_ms = 10;
    config.timers.sweep_interval_ms = 20;
    config.persistence.snapshot_interval_secs = 1;
    config
}

pub fn quick_profile(outcome: SimulatedOutcome) -> SimulationProfile {
    SimulationProfile {
        ring_delay: Duration::from_millis(10),
        answer_delay: Duration::from_millis(20),
        talk_time: Duration::from_millis(30),
        outcome,
        early_media: false,
        amd: false,
    }
}

pub fn adapter(outcome: SimulatedOutcome) -> Arc<SimulatedAdapter> {
    Arc::new(SimulatedAdapter::new(quick_profile(outcome)))
}
