use crate::response::RawResponse;
use std::error::Error as StdError;
use std::fmt;
use thiserror::Error;

type BoxError = Box<dyn StdError + Send + Sync>;

/// Classification of transport failures
///
/// The retry policy uses the kind to tell failures that will not heal at the
/// client's timescale from ones worth another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum TransportErrorKind {
    /// Connect or socket timeout
    Timeout,
    /// DNS resolution failed
    UnknownHost,
    /// The peer refused the connection
    ConnectionRefused,
    /// TLS handshake or certificate failure
    Tls,
    /// Any other I/O failure (reset, broken pipe, premature close)
    Io,
    /// The connection pool was shut down
    Closed,
}

impl TransportErrorKind {
    /// Whether a failure of this kind must never be retried
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::UnknownHost | Self::ConnectionRefused | Self::Tls | Self::Closed
        )
    }
}

impl fmt::Display for TransportErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::UnknownHost => "unknown host",
            Self::ConnectionRefused => "connection refused",
            Self::Tls => "tls",
            Self::Io => "i/o",
            Self::Closed => "pool closed",
        };
        f.write_str(name)
    }
}

/// Failure of one physical attempt before a response was received
#[derive(Error, Debug)]
#[error("Transport error ({kind}): {source}")]
pub struct TransportError {
    kind: TransportErrorKind,
    #[source]
    source: BoxError,
}

impl TransportError {
    /// Create a transport error of a known kind
    #[must_use]
    pub fn new(kind: TransportErrorKind, source: impl Into<BoxError>) -> Self {
        Self {
            kind,
            source: source.into(),
        }
    }

    /// Classify an opaque error from the connector or the HTTP stack
    ///
    /// Walks the source chain looking for timeouts, refused connections,
    /// DNS failures and TLS errors. Anything unrecognised is `Io`.
    #[must_use]
    pub fn classify(source: BoxError) -> Self {
        let kind = classify_chain(source.as_ref());
        Self { kind, source }
    }

    /// Error reported when the pool has been shut down
    #[must_use]
    pub fn closed() -> Self {
        Self::new(TransportErrorKind::Closed, "connection pool is shut down")
    }

    /// The failure classification
    #[must_use]
    pub fn kind(&self) -> TransportErrorKind {
        self.kind
    }
}

fn classify_chain(err: &(dyn StdError + 'static)) -> TransportErrorKind {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        if e.is::<tokio::time::error::Elapsed>() || e.is::<tower::timeout::error::Elapsed>() {
            return TransportErrorKind::Timeout;
        }
        if e.is::<rustls::Error>() {
            return TransportErrorKind::Tls;
        }
        if let Some(hyper_err) = e.downcast_ref::<hyper::Error>()
            && hyper_err.is_timeout()
        {
            return TransportErrorKind::Timeout;
        }
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            match io.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    return TransportErrorKind::ConnectionRefused;
                }
                std::io::ErrorKind::TimedOut => return TransportErrorKind::Timeout,
                _ => {}
            }
        }
        // hyper-util reports resolver failures as a ConnectError with this message
        let message = e.to_string();
        if message.contains("dns error") || message.contains("failed to lookup address") {
            return TransportErrorKind::UnknownHost;
        }
        current = e.source();
    }
    TransportErrorKind::Io
}

/// Fatal setup errors. Never retried.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    /// Access or secret key failed validation
    #[error("Invalid credentials: {reason}")]
    InvalidCredentials { reason: String },

    /// Service URL or request path does not form a valid URL
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Invalid header name
    #[error("Invalid header name: {0}")]
    InvalidHeaderName(#[from] http::header::InvalidHeaderName),

    /// Invalid header value
    #[error("Invalid header value: {0}")]
    InvalidHeaderValue(#[from] http::header::InvalidHeaderValue),

    /// The HMAC key was rejected
    #[error("Request signing failed: {0}")]
    Signing(String),

    /// Form URL encoding error
    #[error("Form encoding failed: {0}")]
    FormEncode(#[from] serde_urlencoded::ser::Error),

    /// TLS configuration could not be built
    #[error("TLS setup failed: {0}")]
    Tls(#[source] BoxError),

    /// A pool setting is out of range
    #[error("Invalid setting '{name}': {reason}")]
    InvalidSetting {
        /// Name of the `PoolConfig` field
        name: &'static str,
        /// Why the value was rejected
        reason: String,
    },

    /// Worker or scheduler threads could not be started
    #[error("Runtime setup failed: {0}")]
    Runtime(#[source] std::io::Error),
}

/// A response the retry mechanism cannot fix
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The server answered without an entity
    #[error("No response body received from the server")]
    MissingBody,

    /// The response has no `Content-Type`
    #[error("Response has no content type")]
    MissingContentType,

    /// The decoder does not understand the response content type
    #[error("Unexpected content type: {0}")]
    UnexpectedContentType(String),

    /// The body claimed an encoding but could not be decompressed
    #[error("Failed to decompress response body: {0}")]
    Decompress(#[source] std::io::Error),

    /// JSON parsing error
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Any other decoder failure
    #[error("Malformed response: {0}")]
    Malformed(#[source] BoxError),
}

/// Non-success status reported inside a decoded API response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// Status code carried by the response body (HTTP semantics)
    pub status: u16,
    /// Server-provided description of the failure
    pub error_msg: Option<String>,
    /// Request id echoed by the server
    pub request_id: Option<String>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.error_msg.as_deref() {
            Some(msg) if !msg.is_empty() => write!(f, "{msg} (status {})", self.status),
            _ => write!(f, "API request failed with status {}", self.status),
        }
    }
}

impl StdError for ApiError {}

/// Client error types
///
/// Every failure surfaced by [`SyncClient`](crate::SyncClient) and
/// [`AsyncClient`](crate::AsyncClient) is one of these variants; the original
/// cause stays reachable through [`std::error::Error::source`].
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ClientError {
    /// Fatal configuration problem
    #[error(transparent)]
    Configuration(#[from] ConfigError),

    /// Transport failure of the last attempt
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Server kept answering 5xx until the retry policy gave up
    #[error("HTTP {status} from server after {attempts} attempt(s)")]
    Server {
        status: http::StatusCode,
        attempts: u32,
        /// Last `Retry-After` value in seconds, if the server sent one
        retry_after: Option<u64>,
        /// The last response, body decompressed
        response: Box<RawResponse>,
    },

    /// Response could not be turned into a result
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// Server processed the request and reported a failure
    #[error("API error: {0}")]
    Application(#[source] ApiError),

    /// The caller cancelled the request
    #[error("Request cancelled")]
    Cancelled,

    /// The connection pool was shut down before the request completed
    #[error("Service unavailable: connection pool shut down")]
    ServiceClosed,
}

impl ClientError {
    /// Whether this error is the cancellation outcome
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The final 5xx response of a [`ClientError::Server`] failure
    ///
    /// Run a decoder over it to read the diagnostic the server sent.
    #[must_use]
    pub fn server_response(&self) -> Option<&RawResponse> {
        match self {
            Self::Server { response, .. } => Some(&**response),
            _ => None,
        }
    }
}

impl From<http::header::InvalidHeaderValue> for ClientError {
    fn from(err: http::header::InvalidHeaderValue) -> Self {
        ClientError::Configuration(ConfigError::InvalidHeaderValue(err))
    }
}

impl From<http::header::InvalidHeaderName> for ClientError {
    fn from(err: http::header::InvalidHeaderName) -> Self {
        ClientError::Configuration(ConfigError::InvalidHeaderName(err))
    }
}
