use crate::error::{ClientError, ConfigError};
use bytes::Bytes;
use http::header::{HeaderMap, HeaderName, HeaderValue};
use uuid::Uuid;

/// Content type of form-encoded API payloads
pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// One logical API request
///
/// The payload is fully materialized so every physical attempt can resend it.
/// Builder methods never fail; an invalid header is remembered and reported
/// when the request is executed.
///
/// # Example
///
/// ```ignore
/// let request = SignableRequest::new("/1/text/match.json", "text=hello")
///     .header("x-trace", "abc");
/// ```
#[derive(Debug)]
pub struct SignableRequest {
    path: String,
    payload: Bytes,
    content_type: String,
    headers: HeaderMap,
    signed_bytes: Option<Bytes>,
    error: Option<ClientError>,
}

impl SignableRequest {
    /// Create a request posting `payload` to `path` (relative to the service URL)
    #[must_use]
    pub fn new(path: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            path: path.into(),
            payload: payload.into(),
            content_type: FORM_CONTENT_TYPE.to_owned(),
            headers: HeaderMap::new(),
            signed_bytes: None,
            error: None,
        }
    }

    /// Create a request carrying a form-encoded body
    ///
    /// # Errors
    /// Returns `ConfigError::FormEncode` if the form cannot be encoded
    pub fn from_form(path: impl Into<String>, form: &FormBody) -> Result<Self, ConfigError> {
        Ok(Self::new(path, form.encode()?))
    }

    /// Add a header to the request
    ///
    /// If the name or value is invalid, the error is deferred until execution.
    #[must_use]
    pub fn header(mut self, name: &str, value: &str) -> Self {
        if self.error.is_some() {
            return self;
        }

        match (HeaderName::try_from(name), HeaderValue::try_from(value)) {
            (Ok(name), Ok(value)) => {
                self.headers.insert(name, value);
            }
            (Err(e), _) => self.error = Some(e.into()),
            (_, Err(e)) => self.error = Some(e.into()),
        }
        self
    }

    /// Set the payload content type (default: form URL encoded)
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    /// Sign these bytes instead of the payload
    ///
    /// Used by multipart requests, where only the primary part enters the
    /// signature. Empty bytes drop the digest from the signature.
    #[must_use]
    pub fn with_signed_bytes(mut self, bytes: impl Into<Bytes>) -> Self {
        self.signed_bytes = Some(bytes.into());
        self
    }

    /// Resource path relative to the service URL
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Body sent on every attempt
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Bytes whose MD5 enters the signature
    #[must_use]
    pub fn signed_bytes(&self) -> &[u8] {
        self.signed_bytes.as_ref().unwrap_or(&self.payload)
    }

    /// Payload content type
    #[must_use]
    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Caller-supplied headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Take the error deferred by a builder method, if any
    pub(crate) fn take_error(&mut self) -> Option<ClientError> {
        self.error.take()
    }
}

/// Form-encoded API payload
///
/// Keeps parameters in insertion order. `requestId` and `customerId` are the
/// tracking parameters accepted by every API operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FormBody {
    params: Vec<(String, String)>,
}

impl FormBody {
    /// Create an empty form
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a parameter
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Identifier echoed back by the server in its response
    #[must_use]
    pub fn request_id(self, id: impl Into<String>) -> Self {
        self.param("requestId", id)
    }

    /// Customer the request is made on behalf of
    #[must_use]
    pub fn customer_id(self, id: Uuid) -> Self {
        self.param("customerId", id.urn().to_string())
    }

    /// Parameters in insertion order
    #[must_use]
    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// Encode as `application/x-www-form-urlencoded`
    ///
    /// # Errors
    /// Returns `ConfigError::FormEncode` if encoding fails
    pub fn encode(&self) -> Result<String, ConfigError> {
        Ok(serde_urlencoded::to_string(&self.params)?)
    }
}
