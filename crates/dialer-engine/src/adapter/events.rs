use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::types::AmdResult;

/// Normalized signaling event kinds
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AdapterEventType {
    Dial,
    Ring,
    Answer,
    Hangup,
    Bridge,
    RtpStart,
    RtpTimeout,
    AmdResult,
}

impl fmt::Display for AdapterEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AdapterEventType::Dial => "DIAL",
            AdapterEventType::Ring => "RING",
            AdapterEventType::Answer => "ANSWER",
            AdapterEventType::Hangup => "HANGUP",
            AdapterEventType::Bridge => "BRIDGE",
            AdapterEventType::RtpStart => "RTP_START",
            AdapterEventType::RtpTimeout => "RTP_TIMEOUT",
            AdapterEventType::AmdResult => "AMD_RESULT",
        };
        f.write_str(s)
    }
}

/// One signaling event from the telephony platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterEvent {
    pub event_type: AdapterEventType,
    /// Correlation id sent with the originate request
    pub correlation_id: String,
    pub channel_id: Option<String>,
    pub response_code: Option<u16>,
    pub reason: Option<String>,
    pub amd_result: Option<AmdResult>,
    /// Platform-specific payload, kept for the audit trail
    pub raw: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl AdapterEvent {
    pub fn new(event_type: AdapterEventType, correlation_id: impl Into<String>) -> Self {
        Self {
            event_type,
            correlation_id: correlation_id.into(),
            channel_id: None,
            response_code: None,
            reason: None,
            amd_result: None,
            raw: serde_json::Value::Null,
            received_at: Utc::now(),
        }
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_code(mut self, code: u16) -> Self {
        self.response_code = Some(code);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_amd(mut self, result: AmdResult) -> Self {
        self.amd_result = Some(result);
        self
    }

    pub fn with_raw(mut self, raw: serde_json::Value) -> Self {
        self.raw = raw;
        self
    }
}

/// Single-subscriber event fan-out with a bounded channel.
///
/// `publish` waits for channel capacity, so a slow subscriber applies
/// backpressure to the adapter. With no subscriber, events are dropped.
#[derive(Default)]
pub struct EventPublisher {
    sender: Mutex<Option<mpsc::Sender<AdapterEvent>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any existing subscriber with a new one
    pub fn subscribe(&self, capacity: usize) -> mpsc::Receiver<AdapterEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        *self.sender.lock() = Some(tx);
        rx
    }

    pub fn unsubscribe(&self) {
        self.sender.lock().take();
    }

    pub fn has_subscriber(&self) -> bool {
        self.sender.lock().as_ref().map_or(false, |tx| !tx.is_closed())
    }

    /// Deliver an event; returns whether a subscriber received it
    pub async fn publish(&self, event: AdapterEvent) -> bool {
        let sender = self.sender.lock().clone();
        let Some(sender) = sender else {
            debug!(event_type = %event.event_type, correlation_id = %event.correlation_id,
                   "No subscriber, dropping adapter event");
            return false;
        };

        match sender.send(event).await {
            Ok(()) => true,
            Err(mpsc::error::SendError(event)) => {
                debug!(event_type = %event.event_type, "Subscriber went away, dropping adapter event");
                let mut guard = self.sender.lock();
                if guard.as_ref().map_or(false, |tx| tx.same_channel(&sender)) {
                    *guard = None;
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_without_subscriber_drops() {
        let publisher = EventPublisher::new();
        assert!(!publisher.publish(AdapterEvent::new(AdapterEventType::Dial, "c-1")).await);
    }

    #[tokio::test]
    async fn test_resubscribe_replaces_previous() {
        let publisher = EventPublisher::new();
        let mut first = publisher.subscribe(4);
        let mut second = publisher.subscribe(4);

        assert!(publisher.publish(AdapterEvent::new(AdapterEventType::Ring, "c-1").with_code(180)).await);
        assert!(first.recv().await.is_none());
        let event = second.recv().await.unwrap();
        assert_eq!(event.response_code, Some(180));
    }

    #[tokio::test]
    async fn test_dropped_receiver_clears_subscription() {
        let publisher = EventPublisher::new();
        let rx = publisher.subscribe(1);
        drop(rx);
        assert!(!publisher.publish(AdapterEvent::new(AdapterEventType::Answer, "c-1")).await);
        assert!(!publisher.has_subscriber());
    }

    #[test]
    fn test_event_type_wire_names() {
        let json = serde_json::to_string(&AdapterEventType::RtpStart).unwrap();
        assert_eq!(json, "\"RTP_START\"");
        assert_eq!(AdapterEventType::AmdResult.to_string(), "AMD_RESULT");
    }
}
