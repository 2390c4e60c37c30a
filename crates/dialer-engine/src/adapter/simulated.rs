//! In-process telephony adapter
//!
//! Plays scripted signaling sequences for every originated call according to
//! a [`SimulationProfile`]. Used by the `rvoip-dialer` binary when no real
//! platform is configured, and by the tests.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use super::events::{AdapterEvent, AdapterEventType, EventPublisher};
use super::reconnect::ReconnectPolicy;
use super::{OriginateRequest, OriginateResult, TelephonyAdapter};
use crate::error::{DialerError, Result};
use crate::types::AmdResult;

/// How a simulated call ends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulatedOutcome {
    /// Person answers, talks, hangs up normally
    Answer,
    /// Answering machine picks up
    AnswerMachine,
    /// Answered but media never starts
    AnswerNoRtp,
    /// Rings until the far side gives up (480)
    NoAnswer,
    Busy,
    /// Rejected with the given final response
    Reject(u16),
    /// Nothing after DIAL; the engine's own timers must end the call
    Silent,
}

#[derive(Debug, Clone)]
pub struct SimulationProfile {
    pub ring_delay: Duration,
    pub answer_delay: Duration,
    pub talk_time: Duration,
    pub outcome: SimulatedOutcome,
    /// Send 183 instead of 180
    pub early_media: bool,
    /// Report an AMD verdict after answer
    pub amd: bool,
}

impl Default for SimulationProfile {
    fn default() -> Self {
        Self {
            ring_delay: Duration::from_millis(200),
            answer_delay: Duration::from_millis(800),
            talk_time: Duration::from_secs(2),
            outcome: SimulatedOutcome::Answer,
            early_media: false,
            amd: false,
        }
    }
}

struct Channel {
    correlation_id: String,
}

pub struct SimulatedAdapter {
    connected: AtomicBool,
    publisher: Arc<EventPublisher>,
    profile: RwLock<SimulationProfile>,
    channels: Arc<DashMap<String, Channel>>,
    originated: Mutex<Vec<OriginateRequest>>,
    scripts: Mutex<Vec<JoinHandle<()>>>,
    fail_originates: AtomicU32,
    fail_connects: AtomicU32,
    next_channel: AtomicU64,
    reconnect: ReconnectPolicy,
}

impl SimulatedAdapter {
    pub fn new(profile: SimulationProfile) -> Self {
        Self::with_reconnect_policy(profile, ReconnectPolicy::default())
    }

    pub fn with_reconnect_policy(profile: SimulationProfile, reconnect: ReconnectPolicy) -> Self {
        Self {
            connected: AtomicBool::new(false),
            publisher: Arc::new(EventPublisher::new()),
            profile: RwLock::new(profile),
            channels: Arc::new(DashMap::new()),
            originated: Mutex::new(Vec::new()),
            scripts: Mutex::new(Vec::new()),
            fail_originates: AtomicU32::new(0),
            fail_connects: AtomicU32::new(0),
            next_channel: AtomicU64::new(1),
            reconnect,
        }
    }

    pub fn set_profile(&self, profile: SimulationProfile) {
        *self.profile.write() = profile;
    }

    /// Reject the next `count` originate requests
    pub fn fail_next_originate(&self, count: u32) {
        self.fail_originates.store(count, Ordering::SeqCst);
    }

    /// Refuse the next `count` connection attempts
    pub fn fail_next_connect(&self, count: u32) {
        self.fail_connects.store(count, Ordering::SeqCst);
    }

    /// Every request accepted so far
    pub fn originated(&self) -> Vec<OriginateRequest> {
        self.originated.lock().clone()
    }

    /// Push an arbitrary event to the subscriber
    pub async fn inject(&self, event: AdapterEvent) -> bool {
        self.publisher.publish(event).await
    }

    /// Drop the connection and reconnect with backoff. Returns the number of
    /// connection attempts it took.
    pub async fn simulate_connection_loss(&self) -> Result<u32> {
        warn!("Simulated adapter lost its connection");
        self.connected.store(false, Ordering::SeqCst);
        self.reconnect
            .reconnect_with_backoff(self.name(), || self.connect())
            .await
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn spawn_script(&self, correlation_id: String, channel_id: String) {
        let profile = self.profile.read().clone();
        let publisher = self.publisher.clone();
        let channels = self.channels.clone();

        let handle = tokio::spawn(async move {
            run_script(profile, publisher, channels, correlation_id, channel_id).await;
        });

        let mut scripts = self.scripts.lock();
        scripts.retain(|h| !h.is_finished());
        scripts.push(handle);
    }
}

async fn run_script(
    profile: SimulationProfile,
    publisher: Arc<EventPublisher>,
    channels: Arc<DashMap<String, Channel>>,
    correlation_id: String,
    channel_id: String,
) {
    let event = |t: AdapterEventType| AdapterEvent::new(t, correlation_id.clone()).with_channel(channel_id.clone());
    let hangup = |code: u16, reason: &str| event(AdapterEventType::Hangup).with_code(code).with_reason(reason);

    publisher.publish(event(AdapterEventType::Dial)).await;
    if profile.outcome == SimulatedOutcome::Silent {
        return;
    }

    sleep(profile.ring_delay).await;
    match profile.outcome {
        SimulatedOutcome::Busy => {
            channels.remove(&channel_id);
            publisher.publish(hangup(486, "Busy Here")).await;
            return;
        }
        SimulatedOutcome::Reject(code) => {
            channels.remove(&channel_id);
            publisher.publish(hangup(code, "Rejected")).await;
            return;
        }
        _ => {}
    }

    let ring_code = if profile.early_media { 183 } else { 180 };
    publisher.publish(event(AdapterEventType::Ring).with_code(ring_code)).await;
    if profile.early_media {
        publisher.publish(event(AdapterEventType::RtpStart)).await;
    }

    sleep(profile.answer_delay).await;
    if profile.outcome == SimulatedOutcome::NoAnswer {
        channels.remove(&channel_id);
        publisher.publish(hangup(480, "Temporarily Unavailable")).await;
        return;
    }

    publisher.publish(event(AdapterEventType::Answer).with_code(200)).await;
    if profile.outcome == SimulatedOutcome::AnswerNoRtp {
        return;
    }
    publisher.publish(event(AdapterEventType::RtpStart)).await;

    if profile.amd || profile.outcome == SimulatedOutcome::AnswerMachine {
        let verdict = if profile.outcome == SimulatedOutcome::AnswerMachine {
            AmdResult::Machine
        } else {
            AmdResult::Human
        };
        publisher.publish(event(AdapterEventType::AmdResult).with_amd(verdict)).await;
    }

    sleep(profile.talk_time).await;
    if channels.remove(&channel_id).is_some() {
        publisher.publish(hangup(200, "Normal Clearing")).await;
    }
}

#[async_trait]
impl TelephonyAdapter for SimulatedAdapter {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn connect(&self) -> Result<()> {
        if Self::take_failure(&self.fail_connects) {
            return Err(DialerError::adapter("simulated connection refused"));
        }
        self.connected.store(true, Ordering::SeqCst);
        info!("Simulated adapter connected");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        for handle in self.scripts.lock().drain(..) {
            handle.abort();
        }
        self.channels.clear();
        info!("Simulated adapter disconnected");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn originate(&self, request: OriginateRequest) -> Result<OriginateResult> {
        if !self.is_connected() {
            return Err(DialerError::adapter("simulated adapter is not connected"));
        }
        if Self::take_failure(&self.fail_originates) {
            debug!(correlation_id = %request.correlation_id, "Simulated originate rejected");
            return Err(DialerError::adapter("originate rejected by platform"));
        }

        let channel_id = format!("SIM/{}", self.next_channel.fetch_add(1, Ordering::SeqCst));
        self.channels.insert(
            channel_id.clone(),
            Channel {
                correlation_id: request.correlation_id.clone(),
            },
        );
        let correlation_id = request.correlation_id.clone();
        self.originated.lock().push(request);
        self.spawn_script(correlation_id, channel_id.clone());

        Ok(OriginateResult {
            channel_id,
            accepted_at: Utc::now(),
        })
    }

    async fn hangup(&self, channel_id: &str) -> Result<()> {
        let (_, channel) = self
            .channels
            .remove(channel_id)
            .ok_or_else(|| DialerError::not_found(format!("channel {}", channel_id)))?;
        self.publisher
            .publish(
                AdapterEvent::new(AdapterEventType::Hangup, channel.correlation_id)
                    .with_channel(channel_id)
                    .with_code(200)
                    .with_reason("Hangup requested"),
            )
            .await;
        Ok(())
    }

    async fn active_channels(&self) -> Result<Vec<String>> {
        let mut channels: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        channels.sort();
        Ok(channels)
    }

    fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AdapterEvent> {
        self.publisher.subscribe(capacity)
    }

    fn unsubscribe(&self) {
        self.publisher.unsubscribe();
    }
}
