use thiserror::Error;

/// Error types for dialer engine operations
///
/// The variants follow the engine's failure taxonomy: not-found conditions are
/// usually absorbed as soft no-ops by the caller, transient resource
/// conditions (`RateLimited`, `NoRoute`) lead to a requeue, adapter failures
/// are recorded against the job and the route, and configuration or
/// connectivity failures at startup are fatal.
///
/// # Examples
///
/// ```
/// use rvoip_dialer_engine::{DialerError, Result};
///
/// fn pick_trunk() -> Result<()> {
///     Err(DialerError::no_route("no active trunk"))
/// }
///
/// match pick_trunk() {
///     Err(e) if e.is_transient() => println!("retry on next tick: {}", e),
///     Err(e) => println!("hard failure: {}", e),
///     Ok(()) => {}
/// }
/// ```
#[derive(Error, Debug)]
pub enum DialerError {
    /// Persistence layer errors (direct datastore or remote API)
    #[error("Storage error: {0}")]
    Storage(String),

    /// Telephony adapter errors (connection, originate rejected, protocol)
    #[error("Adapter error: {0}")]
    Adapter(String),

    /// Configuration validation and loading errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Requested attempt, job, trunk or campaign does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Caller supplied an invalid value
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Trunk has no rate-limit token available right now
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// No selectable outbound route
    #[error("No route: {0}")]
    NoRoute(String),

    /// Operation did not finish in time
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Unexpected internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<sqlx::Error> for DialerError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => Self::NotFound(err.to_string()),
            _ => Self::Storage(err.to_string()),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for DialerError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        Self::Storage(format!("migration failed: {}", err))
    }
}

impl From<reqwest::Error> for DialerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_decode() {
            Self::Serialization(err.to_string())
        } else {
            Self::Storage(err.to_string())
        }
    }
}

impl From<serde_json::Error> for DialerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<config::ConfigError> for DialerError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

impl From<anyhow::Error> for DialerError {
    fn from(err: anyhow::Error) -> Self {
        // anyhow errors come from lower-level glue code and are unexpected
        Self::Internal(err.to_string())
    }
}

impl DialerError {
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        Self::Storage(msg.into())
    }

    pub fn adapter<S: Into<String>>(msg: S) -> Self {
        Self::Adapter(msg.into())
    }

    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn invalid_input<S: Into<String>>(msg: S) -> Self {
        Self::InvalidInput(msg.into())
    }

    pub fn rate_limited<S: Into<String>>(msg: S) -> Self {
        Self::RateLimited(msg.into())
    }

    pub fn no_route<S: Into<String>>(msg: S) -> Self {
        Self::NoRoute(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Transient resource conditions are retried implicitly by the next tick
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited(_) | Self::NoRoute(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for dialer engine operations
pub type Result<T> = std::result::Result<T, DialerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(DialerError::rate_limited("trunk-a").is_transient());
        assert!(DialerError::no_route("none").is_transient());
        assert!(!DialerError::adapter("rejected").is_transient());
        assert!(!DialerError::storage("down").is_transient());
    }

    #[test]
    fn test_display_prefixes() {
        assert_eq!(
            DialerError::not_found("attempt att-1").to_string(),
            "Not found: attempt att-1"
        );
        assert_eq!(
            DialerError::configuration("bad interval").to_string(),
            "Configuration error: bad interval"
        );
    }

    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err: DialerError = sqlx::Error::RowNotFound.into();
        assert!(err.is_not_found());
    }
}
