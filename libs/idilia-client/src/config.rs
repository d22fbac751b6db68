use crate::error::ConfigError;
use std::time::{Duration, Instant};

/// Default User-Agent string for API requests
pub const DEFAULT_USER_AGENT: &str = concat!("idilia-client/", env!("CARGO_PKG_VERSION"));

/// Default endpoint of the Idilia API
pub const DEFAULT_SERVICE_URL: &str = "http://api.idilia.com";

/// TLS root certificate configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[non_exhaustive]
pub enum TlsRootConfig {
    /// Use Mozilla's root certificates (webpki-roots, no OS dependency)
    #[default]
    WebPki,
    /// Use OS native root certificate store
    Native,
}

/// Retry settings shared by the blocking and non-blocking dispatchers
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total physical attempts allowed for one logical request (default: 3)
    pub max_attempts: u32,

    /// Minimum delay before an asynchronous resubmission (default: 200ms)
    ///
    /// Applied when the policy asks for an immediate retry or a zero
    /// `Retry-After`. A late answer to the previous attempt must not be able
    /// to race the resubmitted one.
    pub min_resubmit_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            min_resubmit_delay: Duration::from_millis(200),
        }
    }
}

impl RetryConfig {
    /// Create config with no retries (a single attempt)
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }
}

/// Connection pool configuration
///
/// The pool is shared process-wide; these limits are fixed once the pool is
/// built.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum connections leased at the same time across all routes (default: 200)
    ///
    /// Bounds requests in flight. Idle connections hold no lease; they are
    /// capped separately at the same number across all routes, so up to twice
    /// this many sockets can be open at once.
    pub max_total_connections: usize,

    /// Maximum connections leased at the same time per destination (default: 200)
    ///
    /// Also caps the idle connections kept for one destination.
    pub max_connections_per_route: usize,

    /// Socket timeout for one physical attempt, including body read (default: 1 hour)
    ///
    /// Some API operations run for a long time on the server, so this is
    /// deliberately generous.
    pub socket_timeout: Duration,

    /// TCP connect timeout (default: none, bounded by `socket_timeout`)
    pub connect_timeout: Option<Duration>,

    /// Lease given to an idle connection when the server sent no usable
    /// `Keep-Alive` header (default: 90 seconds)
    ///
    /// `None` keeps such connections until the peer closes them.
    pub default_keep_alive: Option<Duration>,

    /// Period of the idle-connection eviction sweep (default: 30 seconds)
    pub eviction_interval: Duration,

    /// Number of I/O worker threads (default: tokio's choice, one per core)
    pub worker_threads: Option<usize>,

    /// User-Agent header value
    pub user_agent: String,

    /// TLS root certificate strategy (default: `WebPki`)
    pub tls_roots: TlsRootConfig,

    /// Retry policy configuration
    pub retry: RetryConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_connections: 200,
            max_connections_per_route: 200,
            socket_timeout: Duration::from_secs(3600),
            connect_timeout: None,
            default_keep_alive: Some(Duration::from_secs(90)),
            eviction_interval: Duration::from_secs(30),
            worker_threads: None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            tls_roots: TlsRootConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Check values the pool cannot run with
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidSetting` if the eviction interval is zero
    /// or too large to schedule
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.eviction_interval.is_zero() {
            return Err(ConfigError::InvalidSetting {
                name: "eviction_interval",
                reason: "must be greater than zero".to_owned(),
            });
        }
        if Instant::now().checked_add(self.eviction_interval).is_none() {
            return Err(ConfigError::InvalidSetting {
                name: "eviction_interval",
                reason: format!("{}s is out of range", self.eviction_interval.as_secs()),
            });
        }
        Ok(())
    }

    /// Create configuration for testing with local mock servers
    ///
    /// Small worker pool, short timeouts, and a fast eviction sweep.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            max_total_connections: 16,
            max_connections_per_route: 8,
            socket_timeout: Duration::from_secs(10),
            connect_timeout: Some(Duration::from_secs(2)),
            default_keep_alive: Some(Duration::from_secs(5)),
            eviction_interval: Duration::from_secs(1),
            worker_threads: Some(2),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            tls_roots: TlsRootConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_total_connections, 200);
        assert_eq!(config.max_connections_per_route, 200);
        assert_eq!(config.socket_timeout, Duration::from_secs(3600));
        assert_eq!(config.eviction_interval, Duration::from_secs(30));
        assert_eq!(config.user_agent, DEFAULT_USER_AGENT);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn test_eviction_interval_validated() {
        assert!(PoolConfig::default().validate().is_ok());
        assert!(PoolConfig::for_testing().validate().is_ok());

        for interval in [Duration::ZERO, Duration::MAX] {
            let config = PoolConfig {
                eviction_interval: interval,
                ..PoolConfig::default()
            };
            assert!(matches!(
                config.validate(),
                Err(ConfigError::InvalidSetting {
                    name: "eviction_interval",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_retry_config_default_floor() {
        let retry = RetryConfig::default();
        assert_eq!(retry.min_resubmit_delay, Duration::from_millis(200));
    }

    #[test]
    fn test_retry_config_disabled() {
        assert_eq!(RetryConfig::disabled().max_attempts, 1);
    }

    #[test]
    fn test_default_user_agent_format() {
        assert!(DEFAULT_USER_AGENT.starts_with("idilia-client/"));
    }
}
