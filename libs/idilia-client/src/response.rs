use crate::error::{ApiError, ProtocolError};
use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::fmt;
use std::marker::PhantomData;

/// Outcome of decoding a response entity
///
/// `Ok` carries the typed result; `Err` carries the failure the server
/// reported inside an otherwise well-formed response.
pub type Decoded<T> = Result<T, ApiError>;

/// Response of one physical attempt, body fully read
#[derive(Debug, Clone)]
pub struct RawResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Bytes,
}

impl RawResponse {
    /// Create a response from its parts
    #[must_use]
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// The response status code
    #[must_use]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers
    #[must_use]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The body bytes (decompressed once the response left the dispatcher)
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// `Content-Type` header, if present and valid UTF-8
    #[must_use]
    pub fn content_type(&self) -> Option<&str> {
        self.header_str(http::header::CONTENT_TYPE)
    }

    /// `Content-Encoding` header, if present and valid UTF-8
    #[must_use]
    pub fn content_encoding(&self) -> Option<&str> {
        self.header_str(http::header::CONTENT_ENCODING)
    }

    /// Split into status, headers, and body
    #[must_use]
    pub fn into_parts(self) -> (StatusCode, HeaderMap, Bytes) {
        (self.status, self.headers, self.body)
    }

    fn header_str(&self, name: http::header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

/// Turns a received entity into a typed result
///
/// Implemented by the endpoint-specific layer. Return
/// `Ok(Err(ApiError))` when the server reported a failure in a well-formed
/// response, and `Err(ProtocolError)` when the content cannot be understood.
pub trait ResponseDecoder: Send + Sync + 'static {
    /// Decoded result type
    type Output: Send + 'static;

    /// Decode a decompressed, non-empty response
    ///
    /// # Errors
    /// Returns a `ProtocolError` on a malformed body or unexpected content type.
    fn decode(&self, response: &RawResponse) -> Result<Decoded<Self::Output>, ProtocolError>;
}

/// Decoder built from a closure, see [`decode_fn`]
#[derive(Clone)]
pub struct DecodeFn<F> {
    f: F,
}

impl<F> fmt::Debug for DecodeFn<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DecodeFn").finish_non_exhaustive()
    }
}

/// Use a closure as a [`ResponseDecoder`]
#[must_use]
pub fn decode_fn<F, T>(f: F) -> DecodeFn<F>
where
    F: Fn(&RawResponse) -> Result<Decoded<T>, ProtocolError> + Send + Sync + 'static,
    T: Send + 'static,
{
    DecodeFn { f }
}

impl<F, T> ResponseDecoder for DecodeFn<F>
where
    F: Fn(&RawResponse) -> Result<Decoded<T>, ProtocolError> + Send + Sync + 'static,
    T: Send + 'static,
{
    type Output = T;

    fn decode(&self, response: &RawResponse) -> Result<Decoded<T>, ProtocolError> {
        (self.f)(response)
    }
}

/// Status envelope present in every JSON API response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusEnvelope {
    #[serde(default)]
    status: u16,
    #[serde(default)]
    error_msg: Option<String>,
    #[serde(default)]
    request_id: Option<String>,
}

/// Decoder for single-part `application/json` API responses
///
/// The body must carry the `{status, errorMsg, requestId}` envelope. A status
/// other than 200 decodes to an [`ApiError`]; otherwise the whole document is
/// deserialized into `T`.
pub struct JsonDecoder<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonDecoder<T> {
    /// Create a JSON decoder
    #[must_use]
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonDecoder<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for JsonDecoder<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonDecoder<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonDecoder").finish_non_exhaustive()
    }
}

impl<T> ResponseDecoder for JsonDecoder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    type Output = T;

    fn decode(&self, response: &RawResponse) -> Result<Decoded<T>, ProtocolError> {
        let content_type = response
            .content_type()
            .ok_or(ProtocolError::MissingContentType)?;
        if !content_type.starts_with("application/json") {
            return Err(ProtocolError::UnexpectedContentType(content_type.to_owned()));
        }

        let document: serde_json::Value = serde_json::from_slice(response.body())?;
        let envelope = StatusEnvelope::deserialize(&document)?;
        if envelope.status != StatusCode::OK.as_u16() {
            return Ok(Err(ApiError {
                status: envelope.status,
                error_msg: envelope.error_msg,
                request_id: envelope.request_id,
            }));
        }

        Ok(Ok(T::deserialize(document)?))
    }
}
