use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use super::DialerStore;
use crate::error::{DialerError, Result};
use crate::rate_limit::BucketSnapshot;
use crate::route_health::RouteHealth;
use crate::state_table::CallState;
use crate::types::{
    pick_caller_id, AttemptEvent, AttemptId, AttemptTransition, CallAttempt, CallerIdNumber, Campaign,
    CampaignId, CampaignLoad, CarrierId, DialerTimer, JobId, JobStatus, Lead, LeadId, LeadStatus,
    OriginationJob, RouteAssignment, TimerId, TimerScope, TimerType, Trunk, TrunkId,
};

#[derive(Default)]
struct Tables {
    campaigns: HashMap<CampaignId, Campaign>,
    available_agents: HashMap<CampaignId, u32>,
    leads: HashMap<LeadId, Lead>,
    attempts: HashMap<AttemptId, CallAttempt>,
    events: Vec<AttemptEvent>,
    jobs: HashMap<JobId, OriginationJob>,
    timers: HashMap<TimerId, DialerTimer>,
    trunks: HashMap<TrunkId, Trunk>,
    caller_ids: Vec<CallerIdNumber>,
    buckets: Vec<BucketSnapshot>,
    health: Vec<RouteHealth>,
}

/// In-process store. One lock guards every table, so each operation is a
/// single atomic step.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    offline: AtomicBool,
    reject_timers: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Seeding

    pub fn insert_campaign(&self, campaign: Campaign) {
        self.tables.lock().campaigns.insert(campaign.id.clone(), campaign);
    }

    pub fn insert_lead(&self, lead: Lead) {
        self.tables.lock().leads.insert(lead.id.clone(), lead);
    }

    pub fn insert_leads(&self, leads: impl IntoIterator<Item = Lead>) {
        let mut t = self.tables.lock();
        for lead in leads {
            t.leads.insert(lead.id.clone(), lead);
        }
    }

    pub fn insert_trunk(&self, trunk: Trunk) {
        self.tables.lock().trunks.insert(trunk.id.clone(), trunk);
    }

    pub fn insert_caller_id(&self, number: CallerIdNumber) {
        self.tables.lock().caller_ids.push(number);
    }

    pub fn set_available_agents(&self, campaign_id: &CampaignId, agents: u32) {
        self.tables.lock().available_agents.insert(campaign_id.clone(), agents);
    }

    /// Make `ping` fail, as an unreachable datastore would
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Make `create_timer` fail, as a datastore that drops writes would
    pub fn set_reject_timers(&self, reject: bool) {
        self.reject_timers.store(reject, Ordering::SeqCst);
    }

    // Inspection

    pub fn lead(&self, lead_id: &LeadId) -> Option<Lead> {
        self.tables.lock().leads.get(lead_id).cloned()
    }

    pub fn attempts(&self) -> Vec<CallAttempt> {
        let mut all: Vec<_> = self.tables.lock().attempts.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn jobs(&self) -> Vec<OriginationJob> {
        let mut all: Vec<_> = self.tables.lock().jobs.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        all
    }

    pub fn timers_for(&self, attempt_id: &AttemptId) -> Vec<DialerTimer> {
        let mut all: Vec<_> = self
            .tables
            .lock()
            .timers
            .values()
            .filter(|t| &t.attempt_id == attempt_id)
            .cloned()
            .collect();
        all.sort_by(|a, b| a.fire_at.cmp(&b.fire_at));
        all
    }

    pub fn events_for(&self, attempt_id: &AttemptId) -> Vec<AttemptEvent> {
        self.tables
            .lock()
            .events
            .iter()
            .filter(|e| &e.attempt_id == attempt_id)
            .cloned()
            .collect()
    }

    /// Replace an attempt row wholesale
    pub fn overwrite_attempt(&self, attempt: CallAttempt) {
        self.tables.lock().attempts.insert(attempt.id.clone(), attempt);
    }
}

fn job_mut<'a>(t: &'a mut Tables, job_id: &JobId) -> Result<&'a mut OriginationJob> {
    t.jobs
        .get_mut(job_id)
        .ok_or_else(|| DialerError::not_found(format!("job {}", job_id)))
}

fn attempt_mut<'a>(t: &'a mut Tables, attempt_id: &AttemptId) -> Result<&'a mut CallAttempt> {
    t.attempts
        .get_mut(attempt_id)
        .ok_or_else(|| DialerError::not_found(format!("attempt {}", attempt_id)))
}

#[async_trait]
impl DialerStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(DialerError::storage("memory store is offline"));
        }
        Ok(())
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>> {
        let t = self.tables.lock();
        let mut campaigns: Vec<Campaign> = t.campaigns.values().filter(|c| c.active).cloned().collect();
        campaigns.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(campaigns)
    }

    async fn campaign_load(&self, campaign_id: &CampaignId, since: DateTime<Utc>) -> Result<CampaignLoad> {
        let t = self.tables.lock();
        let mut load = CampaignLoad {
            available_agents: t.available_agents.get(campaign_id).copied().unwrap_or(0),
            ..Default::default()
        };

        let (mut answered, mut abandoned, mut completed) = (0u32, 0u32, 0u32);
        for attempt in t.attempts.values().filter(|a| &a.campaign_id == campaign_id) {
            if !attempt.state.is_terminal() {
                load.active_calls += 1;
                continue;
            }
            if attempt.created_at < since {
                continue;
            }
            completed += 1;
            if attempt.timestamps.answer_at.is_some() {
                answered += 1;
                if attempt.state == CallState::Timeout {
                    abandoned += 1;
                }
            }
        }
        if answered > 0 {
            load.abandon_rate = f64::from(abandoned) / f64::from(answered);
        }
        if completed > 0 {
            load.answer_seizure_ratio = f64::from(answered) / f64::from(completed);
        }
        Ok(load)
    }

    async fn reserve_leads(&self, campaign_id: &CampaignId, limit: u32, owner: &str) -> Result<Vec<Lead>> {
        let mut t = self.tables.lock();
        let mut candidates: Vec<&Lead> = t
            .leads
            .values()
            .filter(|l| &l.campaign_id == campaign_id && l.status == LeadStatus::Pending)
            .collect();
        candidates.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ids: Vec<LeadId> = candidates.into_iter().take(limit as usize).map(|l| l.id.clone()).collect();

        let now = Utc::now();
        let mut reserved = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(lead) = t.leads.get_mut(&id) {
                lead.status = LeadStatus::Reserved;
                lead.reserved_by = Some(owner.to_string());
                lead.reserved_at = Some(now);
                reserved.push(lead.clone());
            }
        }
        Ok(reserved)
    }

    async fn release_lead(&self, lead_id: &LeadId) -> Result<()> {
        let mut t = self.tables.lock();
        if let Some(lead) = t.leads.get_mut(lead_id) {
            if lead.status != LeadStatus::Pending {
                lead.status = LeadStatus::Pending;
                lead.reserved_by = None;
                lead.reserved_at = None;
            }
        }
        Ok(())
    }

    async fn create_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        let mut t = self.tables.lock();
        if t.attempts.contains_key(&attempt.id) {
            return Err(DialerError::invalid_input(format!("attempt {} already exists", attempt.id)));
        }
        t.attempts.insert(attempt.id.clone(), attempt.clone());
        if let Some(lead) = t.leads.get_mut(&attempt.lead_id) {
            lead.status = LeadStatus::Dialed;
        }
        Ok(())
    }

    async fn get_attempt(&self, attempt_id: &AttemptId) -> Result<Option<CallAttempt>> {
        Ok(self.tables.lock().attempts.get(attempt_id).cloned())
    }

    async fn find_attempt_by_correlation(&self, correlation_id: &str) -> Result<Option<CallAttempt>> {
        Ok(self
            .tables
            .lock()
            .attempts
            .values()
            .find(|a| a.correlation_id == correlation_id)
            .cloned())
    }

    async fn apply_transition(&self, transition: &AttemptTransition) -> Result<bool> {
        let mut t = self.tables.lock();
        let attempt = attempt_mut(&mut t, &transition.attempt_id)?;
        if attempt.state != transition.from {
            return Ok(false);
        }
        transition.apply_to(attempt);
        Ok(true)
    }

    async fn assign_route(&self, attempt_id: &AttemptId, route: &RouteAssignment) -> Result<()> {
        let mut t = self.tables.lock();
        let attempt = attempt_mut(&mut t, attempt_id)?;
        attempt.trunk_id = Some(route.trunk_id.clone());
        attempt.carrier_id = Some(route.carrier_id.clone());
        attempt.caller_id = Some(route.caller_id.clone());
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn append_response_code(&self, attempt_id: &AttemptId, code: u16) -> Result<()> {
        let mut t = self.tables.lock();
        let attempt = attempt_mut(&mut t, attempt_id)?;
        attempt.response_codes.push(code);
        attempt.updated_at = Utc::now();
        Ok(())
    }

    async fn record_event(&self, event: &AttemptEvent) -> Result<()> {
        self.tables.lock().events.push(event.clone());
        Ok(())
    }

    async fn enqueue_job(&self, job: &OriginationJob) -> Result<()> {
        self.tables.lock().jobs.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn claim_jobs(&self, owner: &str, limit: u32) -> Result<Vec<OriginationJob>> {
        let mut t = self.tables.lock();
        let mut pending: Vec<&OriginationJob> =
            t.jobs.values().filter(|j| j.status == JobStatus::Pending).collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        let ids: Vec<JobId> = pending.into_iter().take(limit as usize).map(|j| j.id.clone()).collect();

        let now = Utc::now();
        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = t.jobs.get_mut(&id) {
                job.status = JobStatus::Processing;
                job.claimed_by = Some(owner.to_string());
                job.claimed_at = Some(now);
                job.updated_at = now;
                claimed.push(job.clone());
            }
        }
        Ok(claimed)
    }

    async fn complete_job(&self, job_id: &JobId) -> Result<()> {
        let mut t = self.tables.lock();
        let job = job_mut(&mut t, job_id)?;
        job.status = JobStatus::Completed;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<()> {
        let mut t = self.tables.lock();
        let job = job_mut(&mut t, job_id)?;
        job.status = JobStatus::Failed;
        job.error = Some(error.to_string());
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_job(&self, job_id: &JobId) -> Result<()> {
        let mut t = self.tables.lock();
        let job = job_mut(&mut t, job_id)?;
        job.status = JobStatus::Pending;
        job.claimed_by = None;
        job.claimed_at = None;
        job.updated_at = Utc::now();
        Ok(())
    }

    async fn requeue_stale_jobs(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let mut t = self.tables.lock();
        let now = Utc::now();
        let mut requeued = 0;
        for job in t.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.claimed_at.map_or(true, |at| at < claimed_before) {
                job.status = JobStatus::Pending;
                job.claimed_by = None;
                job.claimed_at = None;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn create_timer(&self, timer: &DialerTimer) -> Result<()> {
        if self.reject_timers.load(Ordering::SeqCst) {
            return Err(DialerError::storage("memory store rejected timer write"));
        }
        self.tables.lock().timers.insert(timer.id.clone(), timer.clone());
        Ok(())
    }

    async fn cancel_timers(&self, attempt_id: &AttemptId, scope: &TimerScope) -> Result<Vec<TimerType>> {
        let mut t = self.tables.lock();
        let mut cancelled = Vec::new();
        for timer in t.timers.values_mut() {
            if &timer.attempt_id == attempt_id
                && !timer.fired
                && !timer.cancelled
                && scope.includes(timer.timer_type)
            {
                timer.cancelled = true;
                cancelled.push(timer.timer_type);
            }
        }
        cancelled.sort();
        Ok(cancelled)
    }

    async fn claim_due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DialerTimer>> {
        let mut t = self.tables.lock();
        let mut due: Vec<&DialerTimer> = t.timers.values().filter(|timer| timer.is_due(now)).collect();
        due.sort_by(|a, b| a.fire_at.cmp(&b.fire_at).then_with(|| a.id.cmp(&b.id)));
        let ids: Vec<TimerId> = due.into_iter().take(limit as usize).map(|timer| timer.id.clone()).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(timer) = t.timers.get_mut(&id) {
                timer.fired = true;
                claimed.push(timer.clone());
            }
        }
        Ok(claimed)
    }

    async fn active_trunks(&self) -> Result<Vec<Trunk>> {
        let t = self.tables.lock();
        let mut trunks: Vec<Trunk> = t.trunks.values().filter(|tr| tr.active).cloned().collect();
        trunks.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(trunks)
    }

    async fn next_caller_id(&self, carrier_id: &CarrierId, destination: &str) -> Result<Option<String>> {
        let mut t = self.tables.lock();
        let picked = pick_caller_id(&t.caller_ids, carrier_id, destination).map(|c| c.number.clone());
        if let Some(number) = &picked {
            if let Some(entry) = t.caller_ids.iter_mut().find(|c| &c.number == number) {
                entry.last_used_at = Some(Utc::now());
            }
        }
        Ok(picked)
    }

    async fn save_bucket_snapshots(&self, snapshots: &[BucketSnapshot]) -> Result<()> {
        self.tables.lock().buckets = snapshots.to_vec();
        Ok(())
    }

    async fn load_bucket_snapshots(&self) -> Result<Vec<BucketSnapshot>> {
        Ok(self.tables.lock().buckets.clone())
    }

    async fn save_route_health(&self, snapshots: &[RouteHealth]) -> Result<()> {
        self.tables.lock().health = snapshots.to_vec();
        Ok(())
    }

    async fn load_route_health(&self) -> Result<Vec<RouteHealth>> {
        Ok(self.tables.lock().health.clone())
    }
}
