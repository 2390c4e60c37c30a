//! Reconnect backoff for telephony adapter connections

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, warn};

use crate::config::AdapterConfig;
use crate::error::Result;

/// Exponential backoff for re-establishing an adapter connection
///
/// ```
/// use rvoip_dialer_engine::adapter::ReconnectPolicy;
/// use std::time::Duration;
///
/// let policy = ReconnectPolicy::default().without_jitter();
/// assert_eq!(policy.delay_for(0), Duration::from_millis(500));
/// assert_eq!(policy.delay_for(3), Duration::from_secs(4));
/// assert_eq!(policy.delay_for(20), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub use_jitter: bool,
    /// `None` retries forever
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            use_jitter: true,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_initial_ms),
            max_delay: Duration::from_millis(config.reconnect_max_ms),
            backoff_multiplier: config.reconnect_multiplier,
            use_jitter: config.reconnect_jitter,
            max_attempts: (config.reconnect_max_attempts > 0).then_some(config.reconnect_max_attempts),
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Delay before retry number `attempt` (0-based), capped at `max_delay`.
    /// Jitter is ±10% and never pushes the delay past the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let capped = base.min(self.max_delay.as_millis() as f64);
        let millis = if self.use_jitter {
            let jitter = (rand::random::<f64>() - 0.5) * 0.2;
            (capped * (1.0 + jitter)).min(self.max_delay.as_millis() as f64)
        } else {
            capped
        };
        Duration::from_millis(millis.max(0.0) as u64)
    }

    /// Run `connect` until it succeeds, sleeping between failures.
    /// Returns the number of attempts it took.
    pub async fn reconnect_with_backoff<F, Fut>(&self, name: &str, mut connect: F) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            debug!(adapter = name, attempt, "Connecting");
            match connect().await {
                Ok(()) => {
                    if attempt > 1 {
                        debug!(adapter = name, attempt, "Reconnected after retries");
                    }
                    return Ok(attempt);
                }
                Err(e) if self.max_attempts.map_or(true, |max| attempt < max) => {
                    let delay = self.delay_for(attempt - 1);
                    warn!(
                        adapter = name,
                        attempt,
                        error = %e,
                        next_delay_ms = delay.as_millis() as u64,
                        "Connection failed, will retry"
                    );
                    sleep(delay).await;
                }
                Err(e) => {
                    error!(adapter = name, attempt, error = %e, "Giving up reconnecting");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DialerError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_delay_growth_and_cap() {
        let policy = ReconnectPolicy::default().without_jitter();
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(5), Duration::from_millis(16_000));
        assert_eq!(policy.delay_for(6), Duration::from_secs(30));
        assert_eq!(policy.delay_for(1000), Duration::from_secs(30));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = ReconnectPolicy::default();
        for _ in 0..100 {
            let d = policy.delay_for(2).as_millis();
            assert!((1799..=2200).contains(&d), "{}", d);
            assert!(policy.delay_for(30) <= Duration::from_secs(30));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_retries_until_success() {
        let failures = Arc::new(AtomicU32::new(3));
        let policy = ReconnectPolicy::default().without_jitter();
        let f = failures.clone();
        let attempts = policy
            .reconnect_with_backoff("test", move || {
                let f = f.clone();
                async move {
                    if f.load(Ordering::SeqCst) > 0 {
                        f.fetch_sub(1, Ordering::SeqCst);
                        Err(DialerError::adapter("refused"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();
        assert_eq!(attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_gives_up() {
        let policy = ReconnectPolicy::default().without_jitter().with_max_attempts(2);
        let result = policy
            .reconnect_with_backoff("test", || async { Err(DialerError::adapter("refused")) })
            .await;
        assert!(result.is_err());
    }
}
