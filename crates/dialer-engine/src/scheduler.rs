//! Admission scheduler
//!
//! Once per tick, for every active campaign in priority order: check the
//! work-hours window, size a call budget from agent availability and the
//! dialer mode, atomically reserve that many leads, then create a QUEUED
//! attempt, reserve it and enqueue an origination job for each lead.

use chrono::{DateTime, Datelike, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::{DialerError, Result};
use crate::state_machine::{CallStateMachine, TransitionData};
use crate::state_table::CallEvent;
use crate::storage::DialerStore;
use crate::types::{CallAttempt, Campaign, CampaignId, CampaignLoad, DialerMode, Lead, OriginationJob};

/// Budget for one campaign on one tick
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BudgetDecision {
    pub budget: u32,
    /// Ratio actually applied; differs from the campaign's only in predictive mode
    pub adjusted_ratio: f64,
}

/// How many calls a campaign may start right now.
///
/// Every mode is capped by the campaign's remaining concurrency. A zero
/// budget is raised to one while an agent is idle and capacity remains.
pub fn compute_budget(campaign: &Campaign, load: &CampaignLoad, settings: &SchedulerConfig) -> BudgetDecision {
    let agents = load.available_agents;
    let remaining = campaign.max_concurrent_calls.saturating_sub(load.active_calls);
    let agents_f = f64::from(agents);

    let (wanted, adjusted_ratio) = match campaign.mode {
        DialerMode::Preview => (agents, 1.0),
        DialerMode::Progressive => {
            let ratio = settings.progressive_multiplier;
            ((agents_f * ratio).ceil() as u32, ratio)
        }
        DialerMode::Power => {
            let ratio = campaign.dial_ratio;
            ((agents_f * ratio).floor() as u32, ratio)
        }
        DialerMode::Predictive => {
            let ratio = predictive_ratio(campaign.dial_ratio, load, settings);
            ((agents_f * ratio).floor() as u32, ratio)
        }
    };

    let mut budget = wanted.min(remaining);
    if budget == 0 && agents > 0 && remaining > 0 {
        budget = 1;
    }

    BudgetDecision { budget, adjusted_ratio }
}

fn predictive_ratio(ratio: f64, load: &CampaignLoad, settings: &SchedulerConfig) -> f64 {
    if load.abandon_rate > settings.abandon_high_threshold {
        ratio * settings.ratio_decrease_factor
    } else if load.abandon_rate < settings.abandon_low_threshold && load.answer_seizure_ratio > settings.asr_threshold {
        ratio * settings.ratio_increase_factor
    } else {
        ratio
    }
}

/// Whether `now` falls inside the campaign's dialing window, evaluated in
/// the campaign's local time. A window whose end is before its start wraps
/// past midnight.
pub fn within_work_hours(campaign: &Campaign, now: DateTime<Utc>) -> bool {
    let local = now.naive_utc() + ChronoDuration::minutes(i64::from(campaign.utc_offset_minutes));

    if !campaign.work_days.is_empty() && !campaign.work_days.contains(&local.weekday()) {
        return false;
    }

    let time = local.time();
    match (campaign.work_start, campaign.work_end) {
        (None, None) => true,
        (Some(start), None) => time >= start,
        (None, Some(end)) => time < end,
        (Some(start), Some(end)) if start <= end => time >= start && time < end,
        (Some(start), Some(end)) => time >= start || time < end,
    }
}

/// Per-campaign result of a tick
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CampaignOutcome {
    OutsideWorkHours,
    NoBudget,
    Admitted { budget: u32, reserved: u32, queued: u32, failed: u32 },
    Error { message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TickReport {
    pub campaigns: Vec<(CampaignId, CampaignOutcome)>,
}

impl TickReport {
    /// Attempts queued across all campaigns
    pub fn queued(&self) -> u32 {
        self.campaigns
            .iter()
            .map(|(_, outcome)| match outcome {
                CampaignOutcome::Admitted { queued, .. } => *queued,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome(&self, campaign_id: &CampaignId) -> Option<&CampaignOutcome> {
        self.campaigns.iter().find(|(id, _)| id == campaign_id).map(|(_, o)| o)
    }
}

pub struct AdmissionScheduler {
    store: Arc<dyn DialerStore>,
    state_machine: Arc<CallStateMachine>,
    settings: SchedulerConfig,
    owner: String,
}

impl AdmissionScheduler {
    pub fn new(
        store: Arc<dyn DialerStore>,
        state_machine: Arc<CallStateMachine>,
        settings: SchedulerConfig,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            store,
            state_machine,
            settings,
            owner: owner.into(),
        }
    }

    pub async fn tick(&self) -> Result<TickReport> {
        self.tick_at(Utc::now()).await
    }

    /// Run one admission pass as of `now`. Only a failure to list campaigns
    /// fails the tick; each campaign's own errors are reported in place.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let mut campaigns = self.store.active_campaigns().await?;
        campaigns.sort_by(|a, b| b.priority.cmp(&a.priority));

        let mut report = TickReport::default();
        for campaign in &campaigns {
            let outcome = match self.schedule_campaign(campaign, now).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(campaign_id = %campaign.id, error = %e, "Campaign admission failed");
                    CampaignOutcome::Error { message: e.to_string() }
                }
            };
            report.campaigns.push((campaign.id.clone(), outcome));
        }

        let queued = report.queued();
        if queued > 0 {
            info!("Admission tick queued {} calls across {} campaigns", queued, campaigns.len());
        }
        Ok(report)
    }

    async fn schedule_campaign(&self, campaign: &Campaign, now: DateTime<Utc>) -> Result<CampaignOutcome> {
        if !within_work_hours(campaign, now) {
            debug!(campaign_id = %campaign.id, "Outside work hours");
            return Ok(CampaignOutcome::OutsideWorkHours);
        }

        let window = ChronoDuration::from_std(self.settings.stats_window())
            .map_err(|e| DialerError::configuration(format!("stats window: {}", e)))?;
        let load = self.store.campaign_load(&campaign.id, now - window).await?;
        let decision = compute_budget(campaign, &load, &self.settings);
        debug!(
            campaign_id = %campaign.id,
            mode = campaign.mode.as_str(),
            agents = load.available_agents,
            active = load.active_calls,
            ratio = decision.adjusted_ratio,
            budget = decision.budget,
            "Computed call budget"
        );
        if decision.budget == 0 {
            return Ok(CampaignOutcome::NoBudget);
        }

        let leads = self.store.reserve_leads(&campaign.id, decision.budget, &self.owner).await?;
        let mut queued = 0;
        let mut failed = 0;
        for lead in &leads {
            match self.admit_lead(campaign, lead).await {
                Ok(()) => queued += 1,
                Err(e) => {
                    failed += 1;
                    warn!(campaign_id = %campaign.id, lead_id = %lead.id, error = %e, "Failed to queue lead, releasing it");
                    if let Err(e) = self.store.release_lead(&lead.id).await {
                        warn!(lead_id = %lead.id, error = %e, "Failed to release lead");
                    }
                }
            }
        }

        Ok(CampaignOutcome::Admitted {
            budget: decision.budget,
            reserved: leads.len() as u32,
            queued,
            failed,
        })
    }

    async fn admit_lead(&self, campaign: &Campaign, lead: &Lead) -> Result<()> {
        let attempt = CallAttempt::queued(campaign, lead);

        let result = async {
            self.state_machine.create(&attempt).await?;
            let reserved = self.state_machine.transition(&attempt.id, CallEvent::Reserve, None).await?;
            if !reserved.changed() {
                return Err(DialerError::internal(format!(
                    "attempt {} did not move to RESERVED",
                    attempt.id
                )));
            }
            self.store
                .enqueue_job(&OriginationJob::new(attempt.id.clone(), campaign.id.clone(), campaign.priority))
                .await
        }
        .await;

        if result.is_err() {
            // never leave an attempt behind that no job will pick up
            let data = TransitionData::new().with_reason("admission failed");
            if let Err(e) = self.state_machine.transition(&attempt.id, CallEvent::Cancel, Some(data)).await {
                warn!(attempt_id = %attempt.id, error = %e, "Failed to cancel orphaned attempt");
            }
        }
        result
    }
}

/// Parse "HH:MM" or "HH:MM:SS"
pub fn parse_work_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| DialerError::invalid_input(format!("invalid work time '{}'", s)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Weekday};

    fn load(agents: u32, active: u32) -> CampaignLoad {
        CampaignLoad {
            available_agents: agents,
            active_calls: active,
            ..Default::default()
        }
    }

    fn campaign(mode: DialerMode, ratio: f64, max: u32) -> Campaign {
        let mut c = Campaign::new("c", mode);
        c.dial_ratio = ratio;
        c.max_concurrent_calls = max;
        c
    }

    #[test]
    fn test_power_budget() {
        let d = compute_budget(&campaign(DialerMode::Power, 2.0, 20), &load(5, 0), &SchedulerConfig::default());
        assert_eq!(d.budget, 10);
    }

    #[test]
    fn test_predictive_lowers_ratio_on_high_abandon() {
        let mut l = load(10, 0);
        l.abandon_rate = 0.04;
        let d = compute_budget(&campaign(DialerMode::Predictive, 1.5, 100), &l, &SchedulerConfig::default());
        assert!((d.adjusted_ratio - 1.2).abs() < 1e-9);
        assert_eq!(d.budget, 12);
    }

    #[test]
    fn test_predictive_raises_ratio_when_healthy() {
        let mut l = load(10, 0);
        l.abandon_rate = 0.005;
        l.answer_seizure_ratio = 0.4;
        let d = compute_budget(&campaign(DialerMode::Predictive, 2.0, 100), &l, &SchedulerConfig::default());
        assert!((d.adjusted_ratio - 2.2).abs() < 1e-9);
        assert_eq!(d.budget, 22);

        // low abandon alone is not enough
        l.answer_seizure_ratio = 0.2;
        let d = compute_budget(&campaign(DialerMode::Predictive, 2.0, 100), &l, &SchedulerConfig::default());
        assert_eq!(d.budget, 20);
    }

    #[test]
    fn test_preview_and_progressive() {
        let settings = SchedulerConfig::default();
        assert_eq!(compute_budget(&campaign(DialerMode::Preview, 3.0, 20), &load(4, 0), &settings).budget, 4);
        // ceil(3 * 1.2) = 4
        assert_eq!(compute_budget(&campaign(DialerMode::Progressive, 1.0, 20), &load(3, 0), &settings).budget, 4);
    }

    #[test]
    fn test_budget_capped_by_capacity_and_never_starved() {
        let settings = SchedulerConfig::default();
        assert_eq!(compute_budget(&campaign(DialerMode::Power, 3.0, 10), &load(5, 7), &settings).budget, 3);
        // floor(1 * 0.5) = 0 but an agent is idle
        assert_eq!(compute_budget(&campaign(DialerMode::Power, 0.5, 10), &load(1, 0), &settings).budget, 1);
        assert_eq!(compute_budget(&campaign(DialerMode::Power, 0.5, 10), &load(1, 10), &settings).budget, 0);
        assert_eq!(compute_budget(&campaign(DialerMode::Power, 2.0, 10), &load(0, 0), &settings).budget, 0);
    }

    #[test]
    fn test_work_hours_window() {
        let mut c = Campaign::new("c", DialerMode::Power);
        c.work_days = vec![Weekday::Mon, Weekday::Tue];
        c.work_start = Some(parse_work_time("09:00").unwrap());
        c.work_end = Some(parse_work_time("17:00").unwrap());

        // Monday 2024-01-01
        let at = |h, m| Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap();
        assert!(within_work_hours(&c, at(9, 0)));
        assert!(!within_work_hours(&c, at(17, 0)));
        assert!(!within_work_hours(&c, at(8, 59)));

        // 14:00 UTC is 09:00 at UTC-5
        c.utc_offset_minutes = -300;
        assert!(within_work_hours(&c, at(14, 0)));
        assert!(!within_work_hours(&c, at(13, 0)));

        // Wednesday is not a work day
        c.utc_offset_minutes = 0;
        assert!(!within_work_hours(&c, Utc.with_ymd_and_hms(2024, 1, 3, 10, 0, 0).unwrap()));
    }

    #[test]
    fn test_overnight_window() {
        let mut c = Campaign::new("c", DialerMode::Power);
        c.work_start = Some(parse_work_time("22:00").unwrap());
        c.work_end = Some(parse_work_time("02:00:00").unwrap());
        let at = |h| Utc.with_ymd_and_hms(2024, 1, 1, h, 0, 0).unwrap();
        assert!(within_work_hours(&c, at(23)));
        assert!(within_work_hours(&c, at(1)));
        assert!(!within_work_hours(&c, at(12)));
    }
}
