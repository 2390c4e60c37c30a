//! Core types for the dialer engine
//!
//! Identifiers, campaigns, leads, call attempts, origination jobs, timers and
//! trunks. Every enum that is persisted is stored as text through `as_str` /
//! `FromStr`, and every struct is serde-serializable so the same shapes travel
//! over the remote call-attempt API.

use chrono::{DateTime, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::DialerError;
use crate::state_table::CallState;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            pub fn new() -> Self {
                Self(format!("{}-{}", $prefix, uuid::Uuid::new_v4()))
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }
    };
}

define_id!(
    /// Call attempt identifier
    AttemptId, "att"
);
define_id!(
    /// Campaign identifier
    CampaignId, "cmp"
);
define_id!(
    /// Lead identifier
    LeadId, "lead"
);
define_id!(
    /// Origination job identifier
    JobId, "job"
);
define_id!(
    /// Timer identifier
    TimerId, "tmr"
);
define_id!(
    /// Outbound trunk identifier
    TrunkId, "trunk"
);
define_id!(
    /// Carrier (telephony provider) identifier
    CarrierId, "carrier"
);

/// Generate a fresh correlation identifier for an originate request
pub fn new_correlation_id() -> String {
    format!("dlr-{}", uuid::Uuid::new_v4().simple())
}

/// Parse helper shared by the text-persisted enums
fn unknown(kind: &str, value: &str) -> DialerError {
    DialerError::invalid_input(format!("unknown {} '{}'", kind, value))
}

// ---------------------------------------------------------------------------
// Campaigns
// ---------------------------------------------------------------------------

/// Dialer mode of a campaign
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DialerMode {
    /// Agent previews the lead first, one call per available agent
    Preview,
    /// Slightly more calls than agents
    Progressive,
    /// Fixed dial ratio per agent
    Power,
    /// Dial ratio adapted to abandon rate and answer-seizure ratio
    Predictive,
}

impl DialerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DialerMode::Preview => "preview",
            DialerMode::Progressive => "progressive",
            DialerMode::Power => "power",
            DialerMode::Predictive => "predictive",
        }
    }
}

impl FromStr for DialerMode {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "preview" => Ok(DialerMode::Preview),
            "progressive" => Ok(DialerMode::Progressive),
            "power" => Ok(DialerMode::Power),
            "predictive" => Ok(DialerMode::Predictive),
            other => Err(unknown("dialer mode", other)),
        }
    }
}

/// Admission-control configuration of a campaign. Read-only to the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Campaign {
    pub id: CampaignId,
    pub name: String,
    pub account_id: Option<String>,
    pub mode: DialerMode,
    pub dial_ratio: f64,
    pub max_concurrent_calls: u32,
    pub priority: i32,
    pub active: bool,
    /// Days the campaign may dial; empty means every day
    pub work_days: Vec<Weekday>,
    pub work_start: Option<NaiveTime>,
    pub work_end: Option<NaiveTime>,
    /// Offset of the campaign's local time from UTC
    pub utc_offset_minutes: i32,
}

impl Campaign {
    pub fn new(name: impl Into<String>, mode: DialerMode) -> Self {
        Self {
            id: CampaignId::new(),
            name: name.into(),
            account_id: None,
            mode,
            dial_ratio: 1.0,
            max_concurrent_calls: 10,
            priority: 0,
            active: true,
            work_days: Vec::new(),
            work_start: None,
            work_end: None,
            utc_offset_minutes: 0,
        }
    }
}

/// Live load figures the scheduler needs for one campaign
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignLoad {
    pub available_agents: u32,
    /// Non-terminal attempts currently owned by the campaign
    pub active_calls: u32,
    /// Answered calls with no agent in time, over answered calls (0.0 - 1.0)
    pub abandon_rate: f64,
    /// Answered calls over completed calls (0.0 - 1.0)
    pub answer_seizure_ratio: f64,
}

// ---------------------------------------------------------------------------
// Leads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeadStatus {
    Pending,
    Reserved,
    Dialed,
}

impl LeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeadStatus::Pending => "pending",
            LeadStatus::Reserved => "reserved",
            LeadStatus::Dialed => "dialed",
        }
    }
}

impl FromStr for LeadStatus {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(LeadStatus::Pending),
            "reserved" => Ok(LeadStatus::Reserved),
            "dialed" => Ok(LeadStatus::Dialed),
            other => Err(unknown("lead status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lead {
    pub id: LeadId,
    pub campaign_id: CampaignId,
    pub phone_number: String,
    pub priority: i32,
    pub status: LeadStatus,
    pub reserved_by: Option<String>,
    pub reserved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Lead {
    pub fn new(campaign_id: CampaignId, phone_number: impl Into<String>) -> Self {
        Self {
            id: LeadId::new(),
            campaign_id,
            phone_number: phone_number.into(),
            priority: 0,
            status: LeadStatus::Pending,
            reserved_by: None,
            reserved_at: None,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Call attempts
// ---------------------------------------------------------------------------

/// Answering-machine detection outcome
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AmdResult {
    Human,
    Machine,
    NotSure,
}

impl AmdResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            AmdResult::Human => "human",
            AmdResult::Machine => "machine",
            AmdResult::NotSure => "not_sure",
        }
    }
}

impl FromStr for AmdResult {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "human" => Ok(AmdResult::Human),
            "machine" => Ok(AmdResult::Machine),
            "not_sure" | "notsure" | "timeout" | "unknown" => Ok(AmdResult::NotSure),
            other => Err(unknown("amd result", other)),
        }
    }
}

/// Lifecycle phase whose timestamp is stamped on entry to a state
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Originate,
    Ring,
    Answer,
    Bridge,
    End,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PhaseTimestamps {
    pub originate_at: Option<DateTime<Utc>>,
    pub ring_at: Option<DateTime<Utc>>,
    pub answer_at: Option<DateTime<Utc>>,
    pub bridge_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

impl PhaseTimestamps {
    /// Stamp a phase unless it already carries a timestamp
    pub fn stamp(&mut self, phase: Phase, at: DateTime<Utc>) {
        let slot = match phase {
            Phase::Originate => &mut self.originate_at,
            Phase::Ring => &mut self.ring_at,
            Phase::Answer => &mut self.answer_at,
            Phase::Bridge => &mut self.bridge_at,
            Phase::End => &mut self.end_at,
        };
        if slot.is_none() {
            *slot = Some(at);
        }
    }
}

/// One outbound call lifecycle instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub id: AttemptId,
    /// Key linking the originate request to later signaling events
    pub correlation_id: String,
    pub campaign_id: CampaignId,
    pub lead_id: LeadId,
    pub account_id: Option<String>,
    pub destination: String,
    pub state: CallState,
    pub trunk_id: Option<TrunkId>,
    pub carrier_id: Option<CarrierId>,
    pub caller_id: Option<String>,
    pub response_codes: Vec<u16>,
    pub final_code: Option<u16>,
    pub final_reason: Option<String>,
    pub timestamps: PhaseTimestamps,
    pub amd_result: Option<AmdResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl CallAttempt {
    /// New attempt in the initial QUEUED state
    pub fn queued(campaign: &Campaign, lead: &Lead) -> Self {
        let now = Utc::now();
        Self {
            id: AttemptId::new(),
            correlation_id: new_correlation_id(),
            campaign_id: campaign.id.clone(),
            lead_id: lead.id.clone(),
            account_id: campaign.account_id.clone(),
            destination: lead.phone_number.clone(),
            state: CallState::Queued,
            trunk_id: None,
            carrier_id: None,
            caller_id: None,
            response_codes: Vec::new(),
            final_code: None,
            final_reason: None,
            timestamps: PhaseTimestamps::default(),
            amd_result: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }
}

/// A state change to persist with compare-and-set on `from`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptTransition {
    pub attempt_id: AttemptId,
    pub from: CallState,
    pub to: CallState,
    pub phase: Option<Phase>,
    pub at: DateTime<Utc>,
    pub final_code: Option<u16>,
    pub final_reason: Option<String>,
    pub amd_result: Option<AmdResult>,
}

impl AttemptTransition {
    /// Apply the transition to an in-memory copy of the attempt
    pub fn apply_to(&self, attempt: &mut CallAttempt) {
        attempt.state = self.to;
        if let Some(phase) = self.phase {
            attempt.timestamps.stamp(phase, self.at);
        }
        if self.to.is_terminal() {
            if self.final_code.is_some() {
                attempt.final_code = self.final_code;
            }
            if self.final_reason.is_some() {
                attempt.final_reason = self.final_reason.clone();
            }
        }
        if self.amd_result.is_some() {
            attempt.amd_result = self.amd_result;
        }
        attempt.updated_at = self.at;
    }
}

/// Trunk, carrier and caller-id chosen by the dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteAssignment {
    pub trunk_id: TrunkId,
    pub carrier_id: CarrierId,
    pub caller_id: String,
}

/// Audit record of one state-machine step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptEvent {
    pub attempt_id: AttemptId,
    pub from_state: CallState,
    pub to_state: CallState,
    pub event: String,
    pub data: serde_json::Value,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Origination jobs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(unknown("job status", other)),
        }
    }
}

/// Queued unit of work pairing one attempt with its campaign
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OriginationJob {
    pub id: JobId,
    pub attempt_id: AttemptId,
    pub campaign_id: CampaignId,
    pub priority: i32,
    pub status: JobStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl OriginationJob {
    pub fn new(attempt_id: AttemptId, campaign_id: CampaignId, priority: i32) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            attempt_id,
            campaign_id,
            priority,
            status: JobStatus::Pending,
            claimed_by: None,
            claimed_at: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ---------------------------------------------------------------------------
// Timers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerType {
    QueueTimeout,
    ReserveTimeout,
    OriginateTimeout,
    RingTimeout,
    RtpWatchdog,
    AmdTimeout,
    AgentRingTimeout,
    AgentWaitTimeout,
}

impl TimerType {
    pub const ALL: [TimerType; 8] = [
        TimerType::QueueTimeout,
        TimerType::ReserveTimeout,
        TimerType::OriginateTimeout,
        TimerType::RingTimeout,
        TimerType::RtpWatchdog,
        TimerType::AmdTimeout,
        TimerType::AgentRingTimeout,
        TimerType::AgentWaitTimeout,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimerType::QueueTimeout => "QUEUE_TIMEOUT",
            TimerType::ReserveTimeout => "RESERVE_TIMEOUT",
            TimerType::OriginateTimeout => "ORIGINATE_TIMEOUT",
            TimerType::RingTimeout => "RING_TIMEOUT",
            TimerType::RtpWatchdog => "RTP_WATCHDOG",
            TimerType::AmdTimeout => "AMD_TIMEOUT",
            TimerType::AgentRingTimeout => "AGENT_RING_TIMEOUT",
            TimerType::AgentWaitTimeout => "AGENT_WAIT_TIMEOUT",
        }
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerType {
    type Err = DialerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimerType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| unknown("timer type", s))
    }
}

/// Which outstanding timers of an attempt to cancel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scope", content = "types", rename_all = "snake_case")]
pub enum TimerScope {
    All,
    Types(Vec<TimerType>),
}

impl TimerScope {
    pub fn includes(&self, timer_type: TimerType) -> bool {
        match self {
            TimerScope::All => true,
            TimerScope::Types(types) => types.contains(&timer_type),
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, TimerScope::Types(types) if types.is_empty())
    }
}

/// Scheduled future event tied to one attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DialerTimer {
    pub id: TimerId,
    pub attempt_id: AttemptId,
    pub timer_type: TimerType,
    pub fire_at: DateTime<Utc>,
    pub fired: bool,
    pub cancelled: bool,
    pub created_at: DateTime<Utc>,
}

impl DialerTimer {
    pub fn new(attempt_id: AttemptId, timer_type: TimerType, after: Duration) -> Self {
        let now = Utc::now();
        let after = chrono::Duration::from_std(after).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            id: TimerId::new(),
            attempt_id,
            timer_type,
            fire_at: now + after,
            fired: false,
            cancelled: false,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.fired && !self.cancelled && self.fire_at <= now
    }
}

// ---------------------------------------------------------------------------
// Trunks and caller ids
// ---------------------------------------------------------------------------

/// Outbound signaling path
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trunk {
    pub id: TrunkId,
    pub carrier_id: CarrierId,
    pub name: String,
    /// Calls-per-second ceiling; also the bucket burst capacity
    pub cps_limit: f64,
    pub priority: i32,
    pub active: bool,
}

impl Trunk {
    pub fn new(id: impl Into<TrunkId>, carrier_id: impl Into<CarrierId>, cps_limit: f64) -> Self {
        let id = id.into();
        Self {
            name: id.to_string(),
            id,
            carrier_id: carrier_id.into(),
            cps_limit,
            priority: 0,
            active: true,
        }
    }
}

/// Presentable caller-id number in the pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallerIdNumber {
    pub number: String,
    /// Restrict to one carrier; `None` means usable on every carrier
    pub carrier_id: Option<CarrierId>,
    /// Destination prefix this number gives local presence for
    pub area_prefix: Option<String>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub active: bool,
}

impl CallerIdNumber {
    pub fn new(number: impl Into<String>) -> Self {
        Self {
            number: number.into(),
            carrier_id: None,
            area_prefix: None,
            last_used_at: None,
            active: true,
        }
    }

    pub fn usable_on(&self, carrier_id: &CarrierId) -> bool {
        self.active && self.carrier_id.as_ref().map_or(true, |c| c == carrier_id)
    }

    pub fn is_local_to(&self, destination: &str) -> bool {
        self.area_prefix
            .as_deref()
            .map_or(false, |prefix| !prefix.is_empty() && destination.starts_with(prefix))
    }
}

/// Pick the best caller id from a candidate pool: local-presence numbers
/// first, least recently used within each group (never-used sorts first).
pub fn pick_caller_id<'a>(
    pool: impl IntoIterator<Item = &'a CallerIdNumber>,
    carrier_id: &CarrierId,
    destination: &str,
) -> Option<&'a CallerIdNumber> {
    pool.into_iter()
        .filter(|c| c.usable_on(carrier_id))
        .min_by(|a, b| {
            let local_a = !a.is_local_to(destination);
            let local_b = !b.is_local_to(destination);
            local_a
                .cmp(&local_b)
                .then_with(|| a.last_used_at.cmp(&b.last_used_at))
                .then_with(|| a.number.cmp(&b.number))
        })
}
