//! Telephony adapter contract
//!
//! The engine never speaks a telephony wire protocol itself. An adapter
//! places calls (`originate`), tears them down (`hangup`) and reports
//! normalized signaling events to exactly one subscriber through a bounded
//! channel.

pub mod events;
pub mod reconnect;
pub mod simulated;

pub use events::{AdapterEvent, AdapterEventType, EventPublisher};
pub use reconnect::ReconnectPolicy;
pub use simulated::{SimulatedAdapter, SimulatedOutcome, SimulationProfile};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::types::{AttemptId, CarrierId, TrunkId};

/// Request to place one outbound call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginateRequest {
    pub attempt_id: AttemptId,
    pub correlation_id: String,
    pub destination: String,
    pub caller_id: String,
    pub trunk_id: TrunkId,
    pub carrier_id: CarrierId,
    /// How long the platform should try before giving up on the call
    pub timeout: Duration,
    /// Channel variables passed through to the platform
    pub variables: BTreeMap<String, String>,
}

/// Platform acknowledgement of an originate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginateResult {
    pub channel_id: String,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait TelephonyAdapter: Send + Sync {
    fn name(&self) -> &str;

    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Place a call. An `Err` means the platform rejected or never
    /// acknowledged the request.
    async fn originate(&self, request: OriginateRequest) -> Result<OriginateResult>;

    async fn hangup(&self, channel_id: &str) -> Result<()>;

    async fn active_channels(&self) -> Result<Vec<String>>;

    /// Start delivering events into a new bounded channel, replacing any
    /// previous subscriber
    fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AdapterEvent>;

    fn unsubscribe(&self);
}
