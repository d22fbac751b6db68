//! Response decompression.
//!
//! Requests advertise `Accept-Encoding: gzip` through
//! [`DefaultHeadersLayer`](crate::DefaultHeadersLayer). The body of the final
//! response is inflated here, once, after the retry decision has been made.

use crate::error::ProtocolError;
use crate::response::RawResponse;
use bytes::Bytes;
use flate2::read::GzDecoder;
use http::header::CONTENT_ENCODING;
use std::io::Read;

/// Encoding token advertised in `Accept-Encoding`
pub const GZIP: &str = "gzip";

/// Whether a `Content-Encoding` value lists gzip
#[must_use]
pub fn is_gzip(content_encoding: &str) -> bool {
    content_encoding
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case(GZIP))
}

/// Inflate a gzip-encoded response body
///
/// The `Content-Encoding` header is removed from the returned response, so
/// calling this on an already decoded response is a no-op. Responses with no
/// or another encoding are returned unchanged.
///
/// # Errors
/// Returns `ProtocolError::Decompress` if the body is not valid gzip
pub fn decompress(response: RawResponse) -> Result<RawResponse, ProtocolError> {
    if !response.content_encoding().is_some_and(is_gzip) {
        return Ok(response);
    }

    let (status, mut headers, body) = response.into_parts();
    let mut inflated = Vec::with_capacity(body.len().saturating_mul(4));
    GzDecoder::new(body.as_ref())
        .read_to_end(&mut inflated)
        .map_err(ProtocolError::Decompress)?;

    headers.remove(CONTENT_ENCODING);
    headers.remove(http::header::CONTENT_LENGTH);
    Ok(RawResponse::new(status, headers, Bytes::from(inflated)))
}
