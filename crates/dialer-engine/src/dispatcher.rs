//! Rate-limited dispatcher
//!
//! Drains claimed origination jobs: picks the healthiest trunk, takes a token
//! from its bucket, picks a caller id, and asks the telephony adapter to
//! originate. Missing routes and empty buckets put the job back in the
//! queue; adapter rejections fail it and count against the trunk.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::adapter::{OriginateRequest, TelephonyAdapter};
use crate::config::DialerConfig;
use crate::error::{DialerError, Result};
use crate::rate_limit::RateLimiter;
use crate::route_health::RouteHealthTable;
use crate::state_machine::{CallStateMachine, TransitionData};
use crate::state_table::{CallEvent, CallState};
use crate::storage::DialerStore;
use crate::types::{AttemptId, JobId, OriginationJob, RouteAssignment, TimerType, Trunk, TrunkId};

#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Owner tag written on claimed jobs
    pub owner: String,
    pub batch_size: u32,
    /// Bound on processing one job, originate included
    pub job_timeout: Duration,
    /// Claims older than this belong to a dispatcher that never settled them
    pub stale_job_after: Duration,
    /// Bound on waiting for the platform to acknowledge an originate
    pub originate_timeout: Duration,
    /// How long the platform lets the far end ring
    pub call_timeout: Duration,
    /// Presented when the caller-id pool is exhausted
    pub default_caller_id: String,
}

impl DispatcherSettings {
    pub fn from_config(config: &DialerConfig) -> Self {
        Self {
            owner: config.general.instance_id.clone(),
            batch_size: config.dispatcher.batch_size,
            job_timeout: config.dispatcher.job_timeout(),
            stale_job_after: config.dispatcher.stale_job_after(),
            originate_timeout: config.adapter.originate_timeout(),
            call_timeout: config.timers.duration_of(TimerType::RingTimeout),
            default_caller_id: config.general.default_caller_id.clone(),
        }
    }
}

/// What happened to one claimed job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DispatchOutcome {
    Originated {
        job_id: JobId,
        attempt_id: AttemptId,
        trunk_id: TrunkId,
        channel_id: String,
    },
    /// Put back to pending; a later tick will retry
    Requeued { job_id: JobId, reason: String },
    Failed { job_id: JobId, error: String },
}

impl DispatchOutcome {
    pub fn job_id(&self) -> &JobId {
        match self {
            DispatchOutcome::Originated { job_id, .. }
            | DispatchOutcome::Requeued { job_id, .. }
            | DispatchOutcome::Failed { job_id, .. } => job_id,
        }
    }

    pub fn is_originated(&self) -> bool {
        matches!(self, DispatchOutcome::Originated { .. })
    }
}

/// Best trunk for the next call.
///
/// Healthy trunks rank by score, then priority. Trunks with no health data
/// yet come after them. Degraded trunks are used only when nothing else is
/// left, best score first, so a degraded route keeps carrying the calls
/// that let it recover.
pub fn select_route<'a>(trunks: &'a [Trunk], health: &RouteHealthTable) -> Option<&'a Trunk> {
    let mut scored: Vec<(&Trunk, f64)> = Vec::new();
    let mut unscored: Vec<&Trunk> = Vec::new();
    let mut degraded: Vec<(&Trunk, f64)> = Vec::new();

    for trunk in trunks.iter().filter(|t| t.active) {
        match health.get(&trunk.id) {
            Some(h) if h.degraded => degraded.push((trunk, h.score)),
            Some(h) => scored.push((trunk, h.score)),
            None => unscored.push(trunk),
        }
    }

    scored.sort_by(by_score);
    degraded.sort_by(by_score);
    unscored.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id)));

    scored
        .into_iter()
        .map(|(t, _)| t)
        .chain(unscored)
        .chain(degraded.into_iter().map(|(t, _)| t))
        .next()
}

fn by_score((a, sa): &(&Trunk, f64), (b, sb): &(&Trunk, f64)) -> Ordering {
    sb.total_cmp(sa)
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.id.cmp(&b.id))
}

pub struct Dispatcher {
    store: Arc<dyn DialerStore>,
    state_machine: Arc<CallStateMachine>,
    adapter: Arc<dyn TelephonyAdapter>,
    rate_limiter: Arc<RateLimiter>,
    health: Arc<RouteHealthTable>,
    settings: DispatcherSettings,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn DialerStore>,
        state_machine: Arc<CallStateMachine>,
        adapter: Arc<dyn TelephonyAdapter>,
        rate_limiter: Arc<RateLimiter>,
        health: Arc<RouteHealthTable>,
        settings: DispatcherSettings,
    ) -> Self {
        Self {
            store,
            state_machine,
            adapter,
            rate_limiter,
            health,
            settings,
        }
    }

    /// Claim one batch and process every job concurrently
    pub async fn tick(&self) -> Result<Vec<DispatchOutcome>> {
        self.reclaim_stale_jobs(Utc::now()).await;

        let jobs = self.store.claim_jobs(&self.settings.owner, self.settings.batch_size).await?;
        if jobs.is_empty() {
            return Ok(Vec::new());
        }
        debug!("Dispatching {} jobs", jobs.len());

        let outcomes = join_all(jobs.into_iter().map(|job| self.run_job(job))).await;

        let originated = outcomes.iter().filter(|o| o.is_originated()).count();
        if originated > 0 {
            info!("Originated {} of {} claimed jobs", originated, outcomes.len());
        }
        Ok(outcomes)
    }

    /// Hand back jobs whose claim outlived any live dispatcher
    pub async fn reclaim_stale_jobs(&self, now: DateTime<Utc>) -> u64 {
        let stale_ms = i64::try_from(self.settings.stale_job_after.as_millis()).unwrap_or(i64::MAX);
        let cutoff = now - ChronoDuration::milliseconds(stale_ms);
        match self.store.requeue_stale_jobs(cutoff).await {
            Ok(0) => 0,
            Ok(requeued) => {
                warn!(requeued, "Returned stale processing jobs to the queue");
                requeued
            }
            Err(e) => {
                warn!(error = %e, "Failed to reclaim stale jobs");
                0
            }
        }
    }

    /// Process one job and settle its status; never returns an error
    async fn run_job(&self, job: OriginationJob) -> DispatchOutcome {
        let job_id = job.id.clone();
        let result = match timeout(self.settings.job_timeout, self.process_job(&job)).await {
            Ok(result) => result,
            Err(_) => Err(DialerError::Timeout(format!(
                "job processing exceeded {:?}",
                self.settings.job_timeout
            ))),
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) if e.is_transient() => self.requeue(&job_id, e.to_string()).await,
            Err(e) => {
                warn!(job_id = %job_id, attempt_id = %job.attempt_id, error = %e, "Job processing failed");
                self.fail(&job_id, e.to_string()).await
            }
        }
    }

    pub async fn process_job(&self, job: &OriginationJob) -> Result<DispatchOutcome> {
        let Some(attempt) = self.store.get_attempt(&job.attempt_id).await? else {
            return Ok(self.fail(&job.id, format!("attempt {} not found", job.attempt_id)).await);
        };
        if attempt.state != CallState::Reserved {
            return Ok(self
                .fail(&job.id, format!("attempt {} is {}, not RESERVED", attempt.id, attempt.state))
                .await);
        }

        let trunks = self.store.active_trunks().await?;
        let trunk = select_route(&trunks, &self.health)
            .ok_or_else(|| DialerError::no_route("no active trunk"))?
            .clone();

        if !self.rate_limiter.try_acquire(&trunk) {
            return Err(DialerError::rate_limited(format!("trunk {} has no tokens", trunk.id)));
        }

        let caller_id = match self.store.next_caller_id(&trunk.carrier_id, &attempt.destination).await? {
            Some(number) => number,
            None => {
                debug!(carrier_id = %trunk.carrier_id, "Caller-id pool exhausted, using default");
                self.settings.default_caller_id.clone()
            }
        };

        let route = RouteAssignment {
            trunk_id: trunk.id.clone(),
            carrier_id: trunk.carrier_id.clone(),
            caller_id: caller_id.clone(),
        };
        self.store.assign_route(&attempt.id, &route).await?;

        let moved = self.state_machine.transition(&attempt.id, CallEvent::Originate, None).await?;
        if !moved.changed() {
            return Ok(self
                .fail(&job.id, format!("attempt {} left RESERVED before originate", attempt.id))
                .await);
        }

        let request = OriginateRequest {
            attempt_id: attempt.id.clone(),
            correlation_id: attempt.correlation_id.clone(),
            destination: attempt.destination.clone(),
            caller_id,
            trunk_id: trunk.id.clone(),
            carrier_id: trunk.carrier_id.clone(),
            timeout: self.settings.call_timeout,
            variables: BTreeMap::from([
                ("dialer_attempt_id".to_string(), attempt.id.to_string()),
                ("dialer_campaign_id".to_string(), attempt.campaign_id.to_string()),
                ("dialer_lead_id".to_string(), attempt.lead_id.to_string()),
            ]),
        };

        let originated = match timeout(self.settings.originate_timeout, self.adapter.originate(request)).await {
            Ok(result) => result,
            Err(_) => Err(DialerError::adapter("originate was not acknowledged in time")),
        };

        match originated {
            Ok(ack) => {
                self.store.complete_job(&job.id).await?;
                debug!(attempt_id = %attempt.id, trunk_id = %trunk.id, channel_id = %ack.channel_id, "Originated");
                Ok(DispatchOutcome::Originated {
                    job_id: job.id.clone(),
                    attempt_id: attempt.id.clone(),
                    trunk_id: trunk.id,
                    channel_id: ack.channel_id,
                })
            }
            Err(e) => {
                warn!(attempt_id = %attempt.id, trunk_id = %trunk.id, error = %e, "Originate failed");
                let data = TransitionData::new().with_reason(e.to_string());
                if let Err(te) = self.state_machine.transition(&attempt.id, CallEvent::Error, Some(data)).await {
                    warn!(attempt_id = %attempt.id, error = %te, "Failed to mark attempt failed");
                }
                self.health
                    .penalize(&trunk.id, self.health.weights().originate_failure_penalty);
                Ok(self.fail(&job.id, e.to_string()).await)
            }
        }
    }

    async fn requeue(&self, job_id: &JobId, reason: String) -> DispatchOutcome {
        debug!(job_id = %job_id, reason = %reason, "Requeueing job");
        if let Err(e) = self.store.requeue_job(job_id).await {
            warn!(job_id = %job_id, error = %e, "Failed to requeue job");
        }
        DispatchOutcome::Requeued {
            job_id: job_id.clone(),
            reason,
        }
    }

    async fn fail(&self, job_id: &JobId, error: String) -> DispatchOutcome {
        if let Err(e) = self.store.fail_job(job_id, &error).await {
            warn!(job_id = %job_id, error = %e, "Failed to mark job failed");
        }
        DispatchOutcome::Failed {
            job_id: job_id.clone(),
            error,
        }
    }
}
