use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

use super::facade::{
    AppliedResponse, ClaimJobsRequest, ClaimTimersRequest, FailJobRequest, NextCallerIdRequest,
    RequeueStaleRequest, RequeuedResponse, ReserveLeadsRequest, ResponseCodeRequest,
};
use super::DialerStore;
use crate::api::ErrorBody;
use crate::error::{DialerError, Result};
use crate::rate_limit::BucketSnapshot;
use crate::route_health::RouteHealth;
use crate::types::{
    AttemptEvent, AttemptId, AttemptTransition, CallAttempt, Campaign, CampaignId, CampaignLoad, CarrierId,
    DialerTimer, JobId, Lead, LeadId, OriginationJob, RouteAssignment, TimerScope, TimerType, Trunk,
};

/// Store backed by the remote call-attempt API
#[derive(Clone)]
pub struct HttpStore {
    client: Client,
    base_url: String,
}

impl HttpStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn check(request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorBody>().await {
            Ok(body) => body.error.message,
            Err(_) => status.to_string(),
        };
        Err(match status {
            StatusCode::NOT_FOUND => DialerError::not_found(message),
            StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY => DialerError::invalid_input(message),
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => DialerError::Timeout(message),
            _ => DialerError::storage(format!("{}: {}", status, message)),
        })
    }

    async fn fetch<T: DeserializeOwned>(request: RequestBuilder) -> Result<T> {
        Ok(Self::check(request).await?.json::<T>().await?)
    }

    async fn execute(request: RequestBuilder) -> Result<()> {
        Self::check(request).await?;
        Ok(())
    }
}

#[async_trait]
impl DialerStore for HttpStore {
    async fn ping(&self) -> Result<()> {
        Self::execute(self.client.get(self.url("/v1/ping"))).await
    }

    async fn active_campaigns(&self) -> Result<Vec<Campaign>> {
        Self::fetch(self.client.get(self.url("/v1/campaigns/active"))).await
    }

    async fn campaign_load(&self, campaign_id: &CampaignId, since: DateTime<Utc>) -> Result<CampaignLoad> {
        let request = self
            .client
            .get(self.url(&format!("/v1/campaigns/{}/load", campaign_id)))
            .query(&[("since_ms", since.timestamp_millis())]);
        Self::fetch(request).await
    }

    async fn reserve_leads(&self, campaign_id: &CampaignId, limit: u32, owner: &str) -> Result<Vec<Lead>> {
        let request = self
            .client
            .post(self.url(&format!("/v1/campaigns/{}/leads/reserve", campaign_id)))
            .json(&ReserveLeadsRequest {
                limit,
                owner: owner.to_string(),
            });
        Self::fetch(request).await
    }

    async fn release_lead(&self, lead_id: &LeadId) -> Result<()> {
        Self::execute(self.client.post(self.url(&format!("/v1/leads/{}/release", lead_id)))).await
    }

    async fn create_attempt(&self, attempt: &CallAttempt) -> Result<()> {
        Self::execute(self.client.post(self.url("/v1/attempts")).json(attempt)).await
    }

    async fn get_attempt(&self, attempt_id: &AttemptId) -> Result<Option<CallAttempt>> {
        Self::fetch(self.client.get(self.url(&format!("/v1/attempts/{}", attempt_id)))).await
    }

    async fn find_attempt_by_correlation(&self, correlation_id: &str) -> Result<Option<CallAttempt>> {
        Self::fetch(
            self.client
                .get(self.url(&format!("/v1/attempts/by-correlation/{}", correlation_id))),
        )
        .await
    }

    async fn apply_transition(&self, transition: &AttemptTransition) -> Result<bool> {
        let request = self
            .client
            .post(self.url(&format!("/v1/attempts/{}/transition", transition.attempt_id)))
            .json(transition);
        let response: AppliedResponse = Self::fetch(request).await?;
        Ok(response.applied)
    }

    async fn assign_route(&self, attempt_id: &AttemptId, route: &RouteAssignment) -> Result<()> {
        Self::execute(
            self.client
                .post(self.url(&format!("/v1/attempts/{}/route", attempt_id)))
                .json(route),
        )
        .await
    }

    async fn append_response_code(&self, attempt_id: &AttemptId, code: u16) -> Result<()> {
        Self::execute(
            self.client
                .post(self.url(&format!("/v1/attempts/{}/response-codes", attempt_id)))
                .json(&ResponseCodeRequest { code }),
        )
        .await
    }

    async fn record_event(&self, event: &AttemptEvent) -> Result<()> {
        Self::execute(
            self.client
                .post(self.url(&format!("/v1/attempts/{}/events", event.attempt_id)))
                .json(event),
        )
        .await
    }

    async fn enqueue_job(&self, job: &OriginationJob) -> Result<()> {
        Self::execute(self.client.post(self.url("/v1/jobs")).json(job)).await
    }

    async fn claim_jobs(&self, owner: &str, limit: u32) -> Result<Vec<OriginationJob>> {
        Self::fetch(self.client.post(self.url("/v1/jobs/claim")).json(&ClaimJobsRequest {
            owner: owner.to_string(),
            limit,
        }))
        .await
    }

    async fn complete_job(&self, job_id: &JobId) -> Result<()> {
        Self::execute(self.client.post(self.url(&format!("/v1/jobs/{}/complete", job_id)))).await
    }

    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<()> {
        Self::execute(
            self.client
                .post(self.url(&format!("/v1/jobs/{}/fail", job_id)))
                .json(&FailJobRequest {
                    error: error.to_string(),
                }),
        )
        .await
    }

    async fn requeue_job(&self, job_id: &JobId) -> Result<()> {
        Self::execute(self.client.post(self.url(&format!("/v1/jobs/{}/requeue", job_id)))).await
    }

    async fn requeue_stale_jobs(&self, claimed_before: DateTime<Utc>) -> Result<u64> {
        let response: RequeuedResponse = Self::fetch(
            self.client
                .post(self.url("/v1/jobs/requeue-stale"))
                .json(&RequeueStaleRequest { claimed_before }),
        )
        .await?;
        Ok(response.requeued)
    }

    async fn create_timer(&self, timer: &DialerTimer) -> Result<()> {
        Self::execute(self.client.post(self.url("/v1/timers")).json(timer)).await
    }

    async fn cancel_timers(&self, attempt_id: &AttemptId, scope: &TimerScope) -> Result<Vec<TimerType>> {
        Self::fetch(
            self.client
                .post(self.url(&format!("/v1/attempts/{}/timers/cancel", attempt_id)))
                .json(scope),
        )
        .await
    }

    async fn claim_due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DialerTimer>> {
        Self::fetch(
            self.client
                .post(self.url("/v1/timers/claim-due"))
                .json(&ClaimTimersRequest { now, limit }),
        )
        .await
    }

    async fn active_trunks(&self) -> Result<Vec<Trunk>> {
        Self::fetch(self.client.get(self.url("/v1/trunks/active"))).await
    }

    async fn next_caller_id(&self, carrier_id: &CarrierId, destination: &str) -> Result<Option<String>> {
        Self::fetch(
            self.client
                .post(self.url("/v1/caller-ids/next"))
                .json(&NextCallerIdRequest {
                    carrier_id: carrier_id.clone(),
                    destination: destination.to_string(),
                }),
        )
        .await
    }

    async fn save_bucket_snapshots(&self, snapshots: &[BucketSnapshot]) -> Result<()> {
        Self::execute(self.client.put(self.url("/v1/snapshots/buckets")).json(snapshots)).await
    }

    async fn load_bucket_snapshots(&self) -> Result<Vec<BucketSnapshot>> {
        Self::fetch(self.client.get(self.url("/v1/snapshots/buckets"))).await
    }

    async fn save_route_health(&self, snapshots: &[RouteHealth]) -> Result<()> {
        Self::execute(self.client.put(self.url("/v1/snapshots/route-health")).json(snapshots)).await
    }

    async fn load_route_health(&self) -> Result<Vec<RouteHealth>> {
        Self::fetch(self.client.get(self.url("/v1/snapshots/route-health"))).await
    }
}
