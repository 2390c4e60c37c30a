//! Remote call-attempt API server
//!
//! Serves any [`DialerStore`] over HTTP with exactly the routes
//! [`HttpStore`](super::HttpStore) calls. Lookups that may miss return
//! `200` with a JSON `null` body; a `404` always means the addressed row is
//! missing for a mutation.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use super::DialerStore;
use crate::api::ApiError;
use crate::rate_limit::BucketSnapshot;
use crate::route_health::RouteHealth;
use crate::types::{
    AttemptEvent, AttemptId, AttemptTransition, CallAttempt, Campaign, CampaignId, CampaignLoad, CarrierId,
    DialerTimer, JobId, Lead, LeadId, OriginationJob, RouteAssignment, TimerScope, TimerType, Trunk,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct LoadQuery {
    pub since_ms: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReserveLeadsRequest {
    pub limit: u32,
    pub owner: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimJobsRequest {
    pub owner: String,
    pub limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FailJobRequest {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequeueStaleRequest {
    pub claimed_before: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RequeuedResponse {
    pub requeued: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResponseCodeRequest {
    pub code: u16,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimTimersRequest {
    pub now: DateTime<Utc>,
    pub limit: u32,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NextCallerIdRequest {
    pub carrier_id: CarrierId,
    pub destination: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AppliedResponse {
    pub applied: bool,
}

type Store = Arc<dyn DialerStore>;
type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the API router over a store
pub fn router(store: Store) -> Router {
    Router::new()
        .route("/v1/ping", get(ping))
        .route("/v1/campaigns/active", get(active_campaigns))
        .route("/v1/campaigns/:id/load", get(campaign_load))
        .route("/v1/campaigns/:id/leads/reserve", post(reserve_leads))
        .route("/v1/leads/:id/release", post(release_lead))
        .route("/v1/attempts", post(create_attempt))
        .route("/v1/attempts/:id", get(get_attempt))
        .route("/v1/attempts/by-correlation/:correlation_id", get(find_by_correlation))
        .route("/v1/attempts/:id/transition", post(apply_transition))
        .route("/v1/attempts/:id/route", post(assign_route))
        .route("/v1/attempts/:id/response-codes", post(append_response_code))
        .route("/v1/attempts/:id/events", post(record_event))
        .route("/v1/attempts/:id/timers/cancel", post(cancel_timers))
        .route("/v1/jobs", post(enqueue_job))
        .route("/v1/jobs/claim", post(claim_jobs))
        .route("/v1/jobs/requeue-stale", post(requeue_stale_jobs))
        .route("/v1/jobs/:id/complete", post(complete_job))
        .route("/v1/jobs/:id/fail", post(fail_job))
        .route("/v1/jobs/:id/requeue", post(requeue_job))
        .route("/v1/timers", post(create_timer))
        .route("/v1/timers/claim-due", post(claim_due_timers))
        .route("/v1/trunks/active", get(active_trunks))
        .route("/v1/caller-ids/next", post(next_caller_id))
        .route("/v1/snapshots/buckets", put(save_buckets).get(load_buckets))
        .route("/v1/snapshots/route-health", put(save_route_health).get(load_route_health))
        .layer(TraceLayer::new_for_http())
        .with_state(store)
}

fn ensure_same_id(path_id: &str, body_id: &str) -> ApiResult<()> {
    if path_id != body_id {
        return Err(ApiError::BadRequest(format!(
            "path id {} does not match body id {}",
            path_id, body_id
        )));
    }
    Ok(())
}

async fn ping(State(store): State<Store>) -> ApiResult<StatusCode> {
    store.ping().await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn active_campaigns(State(store): State<Store>) -> ApiResult<Json<Vec<Campaign>>> {
    Ok(Json(store.active_campaigns().await?))
}

async fn campaign_load(
    State(store): State<Store>,
    Path(id): Path<String>,
    Query(query): Query<LoadQuery>,
) -> ApiResult<Json<CampaignLoad>> {
    let since = DateTime::<Utc>::from_timestamp_millis(query.since_ms)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid since_ms {}", query.since_ms)))?;
    Ok(Json(store.campaign_load(&CampaignId::from(id), since).await?))
}

async fn reserve_leads(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(req): Json<ReserveLeadsRequest>,
) -> ApiResult<Json<Vec<Lead>>> {
    Ok(Json(store.reserve_leads(&CampaignId::from(id), req.limit, &req.owner).await?))
}

async fn release_lead(State(store): State<Store>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    store.release_lead(&LeadId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn create_attempt(
    State(store): State<Store>,
    Json(attempt): Json<CallAttempt>,
) -> ApiResult<StatusCode> {
    store.create_attempt(&attempt).await?;
    Ok(StatusCode::CREATED)
}

async fn get_attempt(
    State(store): State<Store>,
    Path(id): Path<String>,
) -> ApiResult<Json<Option<CallAttempt>>> {
    Ok(Json(store.get_attempt(&AttemptId::from(id)).await?))
}

async fn find_by_correlation(
    State(store): State<Store>,
    Path(correlation_id): Path<String>,
) -> ApiResult<Json<Option<CallAttempt>>> {
    Ok(Json(store.find_attempt_by_correlation(&correlation_id).await?))
}

async fn apply_transition(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(transition): Json<AttemptTransition>,
) -> ApiResult<Json<AppliedResponse>> {
    ensure_same_id(&id, transition.attempt_id.as_str())?;
    let applied = store.apply_transition(&transition).await?;
    Ok(Json(AppliedResponse { applied }))
}

async fn assign_route(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(route): Json<RouteAssignment>,
) -> ApiResult<StatusCode> {
    store.assign_route(&AttemptId::from(id), &route).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn append_response_code(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(req): Json<ResponseCodeRequest>,
) -> ApiResult<StatusCode> {
    store.append_response_code(&AttemptId::from(id), req.code).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn record_event(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(event): Json<AttemptEvent>,
) -> ApiResult<StatusCode> {
    ensure_same_id(&id, event.attempt_id.as_str())?;
    store.record_event(&event).await?;
    Ok(StatusCode::CREATED)
}

async fn cancel_timers(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(scope): Json<TimerScope>,
) -> ApiResult<Json<Vec<TimerType>>> {
    Ok(Json(store.cancel_timers(&AttemptId::from(id), &scope).await?))
}

async fn enqueue_job(State(store): State<Store>, Json(job): Json<OriginationJob>) -> ApiResult<StatusCode> {
    store.enqueue_job(&job).await?;
    Ok(StatusCode::CREATED)
}

async fn claim_jobs(
    State(store): State<Store>,
    Json(req): Json<ClaimJobsRequest>,
) -> ApiResult<Json<Vec<OriginationJob>>> {
    Ok(Json(store.claim_jobs(&req.owner, req.limit).await?))
}

async fn complete_job(State(store): State<Store>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    store.complete_job(&JobId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn fail_job(
    State(store): State<Store>,
    Path(id): Path<String>,
    Json(req): Json<FailJobRequest>,
) -> ApiResult<StatusCode> {
    store.fail_job(&JobId::from(id), &req.error).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn requeue_job(State(store): State<Store>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    store.requeue_job(&JobId::from(id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn requeue_stale_jobs(
    State(store): State<Store>,
    Json(req): Json<RequeueStaleRequest>,
) -> ApiResult<Json<RequeuedResponse>> {
    let requeued = store.requeue_stale_jobs(req.claimed_before).await?;
    Ok(Json(RequeuedResponse { requeued }))
}

async fn create_timer(State(store): State<Store>, Json(timer): Json<DialerTimer>) -> ApiResult<StatusCode> {
    store.create_timer(&timer).await?;
    Ok(StatusCode::CREATED)
}

async fn claim_due_timers(
    State(store): State<Store>,
    Json(req): Json<ClaimTimersRequest>,
) -> ApiResult<Json<Vec<DialerTimer>>> {
    Ok(Json(store.claim_due_timers(req.now, req.limit).await?))
}

async fn active_trunks(State(store): State<Store>) -> ApiResult<Json<Vec<Trunk>>> {
    Ok(Json(store.active_trunks().await?))
}

async fn next_caller_id(
    State(store): State<Store>,
    Json(req): Json<NextCallerIdRequest>,
) -> ApiResult<Json<Option<String>>> {
    Ok(Json(store.next_caller_id(&req.carrier_id, &req.destination).await?))
}

async fn save_buckets(
    State(store): State<Store>,
    Json(snapshots): Json<Vec<BucketSnapshot>>,
) -> ApiResult<StatusCode> {
    store.save_bucket_snapshots(&snapshots).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_buckets(State(store): State<Store>) -> ApiResult<Json<Vec<BucketSnapshot>>> {
    Ok(Json(store.load_bucket_snapshots().await?))
}

async fn save_route_health(
    State(store): State<Store>,
    Json(snapshots): Json<Vec<RouteHealth>>,
) -> ApiResult<StatusCode> {
    store.save_route_health(&snapshots).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn load_route_health(State(store): State<Store>) -> ApiResult<Json<Vec<RouteHealth>>> {
    Ok(Json(store.load_route_health().await?))
}
