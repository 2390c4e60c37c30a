//! Persistence boundary
//!
//! [`DialerStore`] is the single seam between the engine and its data. Three
//! implementations exist: [`SqliteStore`] talks to the datastore directly,
//! [`HttpStore`] goes through the remote call-attempt API (served by
//! [`facade::router`]), and [`MemoryStore`] keeps everything in process.
//!
//! Every claim operation (`reserve_leads`, `claim_jobs`, `claim_due_timers`)
//! is an atomic conditional update: two engines claiming concurrently never
//! receive the same row. Job claims carry `claimed_at` as a lease; stale
//! claims go back to pending through `requeue_stale_jobs`.

pub mod facade;
pub mod http;
pub mod memory;
pub mod sqlite;

pub use http::HttpStore;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::info;

use crate::config::{StorageBackend, StorageConfig};
use crate::error::Result;
use crate::rate_limit::BucketSnapshot;
use crate::route_health::RouteHealth;
use crate::types::{
    AttemptEvent, AttemptId, AttemptTransition, CallAttempt, Campaign, CampaignId, CampaignLoad,
    CarrierId, DialerTimer, JobId, Lead, LeadId, OriginationJob, RouteAssignment, TimerScope,
    TimerType, Trunk,
};

/// Storage operations used by the engine
#[async_trait]
pub trait DialerStore: Send + Sync {
    /// Connectivity check; a failure at startup is fatal
    async fn ping(&self) -> Result<()>;

    // Campaigns and leads

    /// Active campaigns, highest priority first
    async fn active_campaigns(&self) -> Result<Vec<Campaign>>;
    async fn campaign_load(&self, campaign_id: &CampaignId, since: DateTime<Utc>) -> Result<CampaignLoad>;
    /// Atomically move up to `limit` pending leads to reserved for `owner`
    async fn reserve_leads(&self, campaign_id: &CampaignId, limit: u32, owner: &str) -> Result<Vec<Lead>>;
    /// Return a reserved or dialed lead to the pending pool
    async fn release_lead(&self, lead_id: &LeadId) -> Result<()>;

    // Attempts

    /// Insert a new attempt and mark its lead dialed
    async fn create_attempt(&self, attempt: &CallAttempt) -> Result<()>;
    async fn get_attempt(&self, attempt_id: &AttemptId) -> Result<Option<CallAttempt>>;
    async fn find_attempt_by_correlation(&self, correlation_id: &str) -> Result<Option<CallAttempt>>;
    /// Persist a state change if the attempt is still in `transition.from`.
    /// Returns `false` when the compare-and-set lost.
    async fn apply_transition(&self, transition: &AttemptTransition) -> Result<bool>;
    async fn assign_route(&self, attempt_id: &AttemptId, route: &RouteAssignment) -> Result<()>;
    async fn append_response_code(&self, attempt_id: &AttemptId, code: u16) -> Result<()>;
    async fn record_event(&self, event: &AttemptEvent) -> Result<()>;

    // Origination jobs

    async fn enqueue_job(&self, job: &OriginationJob) -> Result<()>;
    /// Atomically claim pending jobs, highest priority then oldest first
    async fn claim_jobs(&self, owner: &str, limit: u32) -> Result<Vec<OriginationJob>>;
    async fn complete_job(&self, job_id: &JobId) -> Result<()>;
    async fn fail_job(&self, job_id: &JobId, error: &str) -> Result<()>;
    /// Put a claimed job back to pending
    async fn requeue_job(&self, job_id: &JobId) -> Result<()>;
    /// Return processing jobs claimed before `claimed_before` to pending.
    /// Reclaims work left behind by a dispatcher that died mid-tick.
    async fn requeue_stale_jobs(&self, claimed_before: DateTime<Utc>) -> Result<u64>;

    // Timers

    async fn create_timer(&self, timer: &DialerTimer) -> Result<()>;
    /// Cancel outstanding timers in scope; returns the types cancelled
    async fn cancel_timers(&self, attempt_id: &AttemptId, scope: &TimerScope) -> Result<Vec<TimerType>>;
    /// Atomically mark due, uncancelled timers fired and return them
    async fn claim_due_timers(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<DialerTimer>>;

    // Routing

    async fn active_trunks(&self) -> Result<Vec<Trunk>>;
    /// Take the least recently used caller id for the carrier, preferring
    /// numbers local to `destination`, and mark it used
    async fn next_caller_id(&self, carrier_id: &CarrierId, destination: &str) -> Result<Option<String>>;

    // Snapshots

    async fn save_bucket_snapshots(&self, snapshots: &[BucketSnapshot]) -> Result<()>;
    async fn load_bucket_snapshots(&self) -> Result<Vec<BucketSnapshot>>;
    async fn save_route_health(&self, snapshots: &[RouteHealth]) -> Result<()>;
    async fn load_route_health(&self) -> Result<Vec<RouteHealth>>;
}

/// Build the configured backend and verify it answers
pub async fn connect_store(config: &StorageConfig) -> Result<Arc<dyn DialerStore>> {
    let store: Arc<dyn DialerStore> = match config.backend {
        StorageBackend::Sqlite => Arc::new(SqliteStore::connect(&config.database_url, config.max_connections).await?),
        StorageBackend::Http => Arc::new(HttpStore::new(&config.api_base_url, config.request_timeout())?),
        StorageBackend::Memory => Arc::new(MemoryStore::new()),
    };

    store.ping().await?;
    info!("Connected to {:?} storage backend", config.backend);
    Ok(store)
}
