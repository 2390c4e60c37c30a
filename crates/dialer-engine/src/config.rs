//! Dialer engine configuration
//!
//! Sectioned, serde-deserializable configuration with defaults for every
//! field. [`DialerConfig::load`] reads an optional TOML file and then applies
//! environment overrides with the `DIALER` prefix and `__` as the section
//! separator, e.g. `DIALER__STORAGE__BACKEND=http`.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::error::{DialerError, Result};
use crate::logging::LoggingConfig;
use crate::types::TimerType;

/// Top-level engine configuration
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::config::DialerConfig;
///
/// let mut config = DialerConfig::default();
/// config.dispatcher.batch_size = 50;
/// config.validate().expect("defaults are valid");
/// assert_eq!(config.scheduler.interval(), std::time::Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DialerConfig {
    pub general: GeneralConfig,
    pub scheduler: SchedulerConfig,
    pub dispatcher: DispatcherConfig,
    pub timers: TimerConfig,
    pub rate_limit: RateLimitConfig,
    pub route_health: RouteHealthConfig,
    pub persistence: PersistenceConfig,
    pub storage: StorageConfig,
    pub adapter: AdapterConfig,
    pub api: ApiConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Owner tag written on reserved leads and claimed jobs
    pub instance_id: String,
    /// Presented when the caller-id pool has no usable number
    pub default_caller_id: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            instance_id: format!("dialer-{}", std::process::id()),
            default_caller_id: "+10000000000".to_string(),
        }
    }
}

/// Admission scheduler tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub interval_ms: u64,
    /// Progressive mode dials this many calls per available agent
    pub progressive_multiplier: f64,
    /// Predictive ratio is lowered above this abandon rate
    pub abandon_high_threshold: f64,
    /// Predictive ratio is raised below this abandon rate...
    pub abandon_low_threshold: f64,
    /// ...when the answer-seizure ratio is above this
    pub asr_threshold: f64,
    pub ratio_decrease_factor: f64,
    pub ratio_increase_factor: f64,
    /// Window for abandon rate and ASR
    pub stats_window_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            progressive_multiplier: 1.2,
            abandon_high_threshold: 0.03,
            abandon_low_threshold: 0.01,
            asr_threshold: 0.30,
            ratio_decrease_factor: 0.8,
            ratio_increase_factor: 1.1,
            stats_window_secs: 900,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn stats_window(&self) -> Duration {
        Duration::from_secs(self.stats_window_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub interval_ms: u64,
    pub batch_size: u32,
    /// Upper bound on processing one claimed job, originate included
    pub job_timeout_ms: u64,
    /// A job still processing this long after its claim is handed back
    pub stale_job_after_ms: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            batch_size: 20,
            job_timeout_ms: 5_000,
            stale_job_after_ms: 30_000,
        }
    }
}

impl DispatcherConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn stale_job_after(&self) -> Duration {
        Duration::from_millis(self.stale_job_after_ms)
    }
}

/// Timer sweep settings and the per-state timer durations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerConfig {
    pub sweep_interval_ms: u64,
    pub batch_size: u32,
    pub queue_timeout_secs: u64,
    pub reserve_timeout_secs: u64,
    pub originate_timeout_secs: u64,
    pub ring_timeout_secs: u64,
    pub early_media_rtp_watchdog_secs: u64,
    pub rtp_watchdog_secs: u64,
    pub amd_timeout_secs: u64,
    pub agent_ring_timeout_secs: u64,
    pub agent_wait_timeout_secs: u64,
}

impl Default for TimerConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 500,
            batch_size: 100,
            queue_timeout_secs: 60,
            reserve_timeout_secs: 5,
            originate_timeout_secs: 60,
            ring_timeout_secs: 45,
            early_media_rtp_watchdog_secs: 4,
            rtp_watchdog_secs: 5,
            amd_timeout_secs: 5,
            agent_ring_timeout_secs: 20,
            agent_wait_timeout_secs: 120,
        }
    }
}

impl TimerConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    /// Default duration of a timer type outside early media
    pub fn duration_of(&self, timer_type: TimerType) -> Duration {
        let secs = match timer_type {
            TimerType::QueueTimeout => self.queue_timeout_secs,
            TimerType::ReserveTimeout => self.reserve_timeout_secs,
            TimerType::OriginateTimeout => self.originate_timeout_secs,
            TimerType::RingTimeout => self.ring_timeout_secs,
            TimerType::RtpWatchdog => self.rtp_watchdog_secs,
            TimerType::AmdTimeout => self.amd_timeout_secs,
            TimerType::AgentRingTimeout => self.agent_ring_timeout_secs,
            TimerType::AgentWaitTimeout => self.agent_wait_timeout_secs,
        };
        Duration::from_secs(secs)
    }
}

/// How token buckets come back after a restart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BucketRestorePolicy {
    /// Start every bucket full
    FullCapacity,
    /// Resume from the last persisted token count
    Persisted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// CPS used for a trunk whose own limit is missing or non-positive
    pub default_cps: f64,
    pub restore_policy: BucketRestorePolicy,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default_cps: 1.0,
            restore_policy: BucketRestorePolicy::Persisted,
        }
    }
}

/// Penalty and recovery weights applied to trunk health scores
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteHealthConfig {
    pub originate_failure_penalty: f64,
    pub failed_penalty: f64,
    pub timeout_penalty: f64,
    pub no_answer_penalty: f64,
    pub no_rtp_penalty: f64,
    /// Extra penalty when the final response code is 5xx or 6xx
    pub server_error_penalty: f64,
    /// Credit for a cleanly completed call
    pub clean_end_recovery: f64,
    pub degrade_below: f64,
    pub recover_at: f64,
}

impl Default for RouteHealthConfig {
    fn default() -> Self {
        Self {
            originate_failure_penalty: 10.0,
            failed_penalty: 10.0,
            timeout_penalty: 5.0,
            no_answer_penalty: 5.0,
            no_rtp_penalty: 20.0,
            server_error_penalty: 10.0,
            clean_end_recovery: 1.0,
            degrade_below: 50.0,
            recover_at: 60.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub snapshot_interval_secs: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: 5,
        }
    }
}

impl PersistenceConfig {
    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_interval_secs)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// Direct SQLite datastore
    Sqlite,
    /// Remote call-attempt API over HTTP
    Http,
    /// In-process store, for development and tests
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: String,
    pub max_connections: u32,
    pub api_base_url: String,
    pub request_timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sqlite,
            database_url: "sqlite://dialer.db".to_string(),
            max_connections: 8,
            api_base_url: "http://127.0.0.1:8700".to_string(),
            request_timeout_ms: 3_000,
        }
    }
}

impl StorageConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    pub event_channel_capacity: usize,
    pub originate_timeout_ms: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub reconnect_multiplier: f64,
    pub reconnect_jitter: bool,
    /// Zero means retry forever
    pub reconnect_max_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            kind: AdapterKind::Simulated,
            event_channel_capacity: 1024,
            originate_timeout_ms: 3_000,
            reconnect_initial_ms: 500,
            reconnect_max_ms: 30_000,
            reconnect_multiplier: 2.0,
            reconnect_jitter: true,
            reconnect_max_attempts: 0,
        }
    }
}

impl AdapterConfig {
    /// How long to wait for the platform to acknowledge an originate
    pub fn originate_timeout(&self) -> Duration {
        Duration::from_millis(self.originate_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8710)),
        }
    }
}

impl DialerConfig {
    /// Load from an optional TOML file plus `DIALER__*` environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix("DIALER")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: DialerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.instance_id.trim().is_empty() {
            return Err(DialerError::configuration("general.instance_id must not be empty"));
        }
        if self.general.default_caller_id.trim().is_empty() {
            return Err(DialerError::configuration("general.default_caller_id must not be empty"));
        }

        for (name, value) in [
            ("scheduler.interval_ms", self.scheduler.interval_ms),
            ("dispatcher.interval_ms", self.dispatcher.interval_ms),
            ("dispatcher.job_timeout_ms", self.dispatcher.job_timeout_ms),
            ("timers.sweep_interval_ms", self.timers.sweep_interval_ms),
            ("persistence.snapshot_interval_secs", self.persistence.snapshot_interval_secs),
        ] {
            if value == 0 {
                return Err(DialerError::configuration(format!("{} must be greater than 0", name)));
            }
        }

        if self.dispatcher.stale_job_after_ms <= self.dispatcher.job_timeout_ms {
            return Err(DialerError::configuration(
                "dispatcher.stale_job_after_ms must exceed dispatcher.job_timeout_ms",
            ));
        }

        if self.dispatcher.batch_size == 0 || self.timers.batch_size == 0 {
            return Err(DialerError::configuration("batch sizes must be greater than 0"));
        }

        if self.scheduler.progressive_multiplier < 1.0 {
            return Err(DialerError::configuration(
                "scheduler.progressive_multiplier must be at least 1.0",
            ));
        }
        if self.scheduler.abandon_low_threshold > self.scheduler.abandon_high_threshold {
            return Err(DialerError::configuration(
                "scheduler.abandon_low_threshold must not exceed abandon_high_threshold",
            ));
        }
        if self.scheduler.ratio_decrease_factor <= 0.0 || self.scheduler.ratio_decrease_factor > 1.0 {
            return Err(DialerError::configuration(
                "scheduler.ratio_decrease_factor must be in (0, 1]",
            ));
        }
        if self.scheduler.ratio_increase_factor < 1.0 {
            return Err(DialerError::configuration(
                "scheduler.ratio_increase_factor must be at least 1.0",
            ));
        }

        if self.rate_limit.default_cps <= 0.0 {
            return Err(DialerError::configuration("rate_limit.default_cps must be positive"));
        }

        let health = &self.route_health;
        if !(0.0..=100.0).contains(&health.degrade_below)
            || !(0.0..=100.0).contains(&health.recover_at)
            || health.recover_at < health.degrade_below
        {
            return Err(DialerError::configuration(
                "route_health thresholds must satisfy 0 <= degrade_below <= recover_at <= 100",
            ));
        }

        match self.storage.backend {
            StorageBackend::Sqlite if self.storage.database_url.is_empty() => {
                return Err(DialerError::configuration("storage.database_url is required for sqlite"));
            }
            StorageBackend::Http if self.storage.api_base_url.is_empty() => {
                return Err(DialerError::configuration("storage.api_base_url is required for http"));
            }
            _ => {}
        }

        if self.adapter.event_channel_capacity == 0 {
            return Err(DialerError::configuration("adapter.event_channel_capacity must be greater than 0"));
        }
        if self.adapter.reconnect_multiplier < 1.0
            || self.adapter.reconnect_initial_ms == 0
            || self.adapter.reconnect_max_ms < self.adapter.reconnect_initial_ms
        {
            return Err(DialerError::configuration("adapter reconnect backoff is inconsistent"));
        }

        crate::logging::parse_log_level(&self.logging.level)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = DialerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.interval(), Duration::from_millis(100));
        assert_eq!(config.timers.sweep_interval(), Duration::from_millis(500));
        assert_eq!(config.persistence.snapshot_interval(), Duration::from_secs(5));
        assert_eq!(config.timers.duration_of(TimerType::AgentWaitTimeout), Duration::from_secs(120));
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = DialerConfig::default();
        config.dispatcher.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = DialerConfig::default();
        config.dispatcher.stale_job_after_ms = config.dispatcher.job_timeout_ms;
        assert!(config.validate().is_err());

        let mut config = DialerConfig::default();
        config.route_health.recover_at = 40.0;
        assert!(config.validate().is_err());

        let mut config = DialerConfig::default();
        config.logging.level = "loud".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[general]
instance_id = "dialer-a"

[storage]
backend = "memory"

[rate_limit]
restore_policy = "full_capacity"

[timers]
ring_timeout_secs = 30
"#
        )
        .unwrap();

        let config = DialerConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.general.instance_id, "dialer-a");
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.rate_limit.restore_policy, BucketRestorePolicy::FullCapacity);
        assert_eq!(config.timers.ring_timeout_secs, 30);
        // untouched sections keep their defaults
        assert_eq!(config.scheduler.interval_ms, 250);
    }
}
