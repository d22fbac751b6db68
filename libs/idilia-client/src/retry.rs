use crate::config::RetryConfig;
use crate::error::TransportError;
use crate::response::RawResponse;
use http::{HeaderMap, StatusCode};
use std::time::Duration;

/// What the last physical attempt produced
#[derive(Debug, Clone, Copy)]
pub enum AttemptOutcome<'a> {
    /// The attempt failed before a response was received
    Failed(&'a TransportError),
    /// The server answered
    Responded(&'a RawResponse),
}

/// Retry decision for one completed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Stop; surface the error or hand the response to the caller
    Abort,
    /// Send again without waiting
    RetryImmediate,
    /// Send again once the server-requested delay has elapsed
    RetryAfter(Duration),
}

impl Decision {
    /// Whether another attempt should be made
    #[must_use]
    pub fn is_retry(self) -> bool {
        !matches!(self, Self::Abort)
    }

    /// Delay before an asynchronous resubmission, never shorter than `floor`
    ///
    /// Returns `None` for `Abort`.
    #[must_use]
    pub fn resubmit_delay(self, floor: Duration) -> Option<Duration> {
        match self {
            Self::Abort => None,
            Self::RetryImmediate => Some(floor),
            Self::RetryAfter(delay) => Some(delay.max(floor)),
        }
    }
}

/// Per-logical-request retry bookkeeping
///
/// Owned by the dispatcher running one logical request and never shared.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Physical attempts completed so far
    pub attempts: u32,
    /// Immediate resubmissions made after transport failures
    pub transport_retries: u32,
}

impl RetryState {
    /// Record a completed attempt and return the new count
    pub fn record_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }
}

/// Pure retry decision function shared by both dispatchers
///
/// Rules, in order:
/// 1. attempt cap reached: abort
/// 2. timeout, unknown host, refused connection, TLS failure: abort
/// 3. 503 with an integer `Retry-After`: retry after that many seconds
/// 4. any other 5xx, or a plain I/O failure: retry immediately
/// 5. anything else: abort, the caller inspects the response itself
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Create a policy from the retry configuration
    #[must_use]
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
        }
    }

    /// Decide what to do after `attempts` physical attempts ended in `outcome`
    #[must_use]
    pub fn decide(&self, outcome: AttemptOutcome<'_>, attempts: u32) -> Decision {
        if attempts >= self.max_attempts {
            return Decision::Abort;
        }

        match outcome {
            AttemptOutcome::Failed(err) if err.kind().is_terminal() => Decision::Abort,
            AttemptOutcome::Failed(_) => Decision::RetryImmediate,
            AttemptOutcome::Responded(resp) => {
                if resp.status() == StatusCode::SERVICE_UNAVAILABLE
                    && let Some(secs) = retry_after_secs(resp.headers())
                {
                    return Decision::RetryAfter(Duration::from_secs(secs));
                }
                if resp.status().is_server_error() {
                    Decision::RetryImmediate
                } else {
                    Decision::Abort
                }
            }
        }
    }
}

/// Parse an integer `Retry-After` header (seconds)
///
/// HTTP-date values and negative numbers are ignored.
#[must_use]
pub fn retry_after_secs(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(http::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::error::TransportErrorKind;
    use bytes::Bytes;

    fn response(status: u16, retry_after: Option<&str>) -> RawResponse {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(http::header::RETRY_AFTER, value.parse().unwrap());
        }
        RawResponse::new(
            StatusCode::from_u16(status).unwrap(),
            headers,
            Bytes::from_static(b"{}"),
        )
    }

    fn transport(kind: TransportErrorKind) -> TransportError {
        TransportError::new(kind, "boom")
    }

    #[test]
    fn test_success_never_retried() {
        let policy = RetryPolicy::default();
        for status in [200, 201, 204, 302, 400, 401, 404, 429] {
            for attempts in 1..=5 {
                let resp = response(status, None);
                assert_eq!(
                    policy.decide(AttemptOutcome::Responded(&resp), attempts),
                    Decision::Abort,
                    "status {status} must not be retried"
                );
            }
        }
    }

    #[test]
    fn test_server_error_retried_until_cap() {
        let policy = RetryPolicy::default();
        let resp = response(500, None);
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 1),
            Decision::RetryImmediate
        );
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 2),
            Decision::RetryImmediate
        );
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 3),
            Decision::Abort
        );
    }

    #[test]
    fn test_cap_applies_to_every_cause() {
        let policy = RetryPolicy::default();
        let resp = response(503, Some("1"));
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 3),
            Decision::Abort
        );
        let err = transport(TransportErrorKind::Io);
        assert_eq!(policy.decide(AttemptOutcome::Failed(&err), 3), Decision::Abort);
    }

    #[test]
    fn test_unavailable_with_retry_after() {
        let policy = RetryPolicy::default();
        let resp = response(503, Some("5"));
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 1),
            Decision::RetryAfter(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_unparseable_retry_after_falls_back_to_immediate() {
        let policy = RetryPolicy::default();
        let resp = response(503, Some("Wed, 21 Oct 2015 07:28:00 GMT"));
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 1),
            Decision::RetryImmediate
        );
    }

    #[test]
    fn test_retry_after_ignored_on_other_statuses() {
        let policy = RetryPolicy::default();
        let resp = response(502, Some("5"));
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 1),
            Decision::RetryImmediate
        );
    }

    #[test]
    fn test_terminal_transport_errors_abort() {
        let policy = RetryPolicy::default();
        for kind in [
            TransportErrorKind::Timeout,
            TransportErrorKind::UnknownHost,
            TransportErrorKind::ConnectionRefused,
            TransportErrorKind::Tls,
        ] {
            let err = transport(kind);
            assert_eq!(
                policy.decide(AttemptOutcome::Failed(&err), 1),
                Decision::Abort,
                "{kind} must not be retried"
            );
        }
    }

    #[test]
    fn test_io_error_retried_immediately() {
        let policy = RetryPolicy::default();
        let err = transport(TransportErrorKind::Io);
        assert_eq!(
            policy.decide(AttemptOutcome::Failed(&err), 1),
            Decision::RetryImmediate
        );
    }

    #[test]
    fn test_resubmit_delay_floor() {
        let floor = Duration::from_millis(200);
        assert_eq!(Decision::Abort.resubmit_delay(floor), None);
        assert_eq!(Decision::RetryImmediate.resubmit_delay(floor), Some(floor));
        assert_eq!(
            Decision::RetryAfter(Duration::ZERO).resubmit_delay(floor),
            Some(floor)
        );
        assert_eq!(
            Decision::RetryAfter(Duration::from_secs(5)).resubmit_delay(floor),
            Some(Duration::from_secs(5))
        );
    }

    #[test]
    fn test_disabled_config_never_retries() {
        let policy = RetryPolicy::new(&RetryConfig::disabled());
        let resp = response(500, None);
        assert_eq!(
            policy.decide(AttemptOutcome::Responded(&resp), 1),
            Decision::Abort
        );
    }

    #[test]
    fn test_retry_state_counts() {
        let mut state = RetryState::default();
        assert_eq!(state.record_attempt(), 1);
        assert_eq!(state.record_attempt(), 2);
        assert_eq!(state.attempts, 2);
    }
}
