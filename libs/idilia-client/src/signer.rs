//! Request signing.
//!
//! The server authenticates a request by recomputing
//! `HMAC-SHA256(secret_key, date + "-" + host + "-" + path [+ "-" + base64(md5(payload))])`
//! from the `Date` header it receives. The date string is therefore part of
//! the signed material and must be RFC 1123 in GMT, stamped when the attempt
//! is actually transmitted.

use crate::credentials::Credentials;
use crate::error::{ClientError, ConfigError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hmac::{Hmac, Mac};
use http::header::{AUTHORIZATION, DATE, HeaderMap, HeaderValue};
use sha2::Sha256;
use std::sync::Arc;
use std::time::SystemTime;
use url::Url;

/// Scheme name used in the `Authorization` header
pub const AUTH_SCHEME: &str = "IDILIA";

/// Signature material of one logical request
///
/// Built once before the first attempt. The immutable tail (host, path,
/// payload digest) is reused by every physical attempt; only the timestamp
/// changes between attempts.
#[derive(Debug, Clone)]
pub struct SignatureContext {
    sign_tail: String,
    url: Url,
    credentials: Arc<Credentials>,
}

impl SignatureContext {
    /// Create the context for a request to `resource_path` on `service_url`
    ///
    /// `signed_bytes` is the content whose MD5 enters the signature; an empty
    /// slice omits the digest segment.
    #[must_use]
    pub fn new(
        credentials: Arc<Credentials>,
        service_url: &Url,
        resource_path: &str,
        signed_bytes: &[u8],
    ) -> Self {
        let host = service_url.host_str().unwrap_or_default();
        let mut sign_tail = format!("-{host}-{resource_path}");
        if !signed_bytes.is_empty() {
            let digest = md5::compute(signed_bytes);
            sign_tail.push('-');
            sign_tail.push_str(&STANDARD.encode(digest.0));
        }

        Self {
            sign_tail,
            url: service_url.clone(),
            credentials,
        }
    }

    /// The part of the string-to-sign that follows the date
    #[must_use]
    pub fn sign_tail(&self) -> &str {
        &self.sign_tail
    }

    /// Service URL the request is addressed to
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Credentials used for the signature
    #[must_use]
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }
}

/// Headers produced by one signing operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    /// RFC 1123 GMT timestamp sent as `Date`
    pub date: String,
    /// Value of the `Authorization` header
    pub authorization: String,
}

impl SignedHeaders {
    /// Set `Date` and `Authorization`, replacing earlier values
    ///
    /// # Errors
    /// Returns `ClientError::Configuration` if a value is not a valid header value
    pub fn apply(&self, headers: &mut HeaderMap) -> Result<(), ClientError> {
        headers.insert(DATE, HeaderValue::from_str(&self.date)?);
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&self.authorization)?);
        Ok(())
    }
}

/// Computes the authentication headers of each physical attempt
#[derive(Debug, Clone)]
pub struct RequestSigner {
    clock: fn() -> SystemTime,
}

impl Default for RequestSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestSigner {
    /// Create a signer using the system clock
    #[must_use]
    pub fn new() -> Self {
        Self {
            clock: SystemTime::now,
        }
    }

    /// Create a signer reading the time from `clock`
    #[must_use]
    pub fn with_clock(clock: fn() -> SystemTime) -> Self {
        Self { clock }
    }

    /// Sign with the signer's clock
    ///
    /// # Errors
    /// Returns `ConfigError::Signing` if the HMAC key is rejected
    pub fn sign(&self, ctx: &SignatureContext) -> Result<SignedHeaders, ClientError> {
        Self::sign_at(ctx, (self.clock)())
    }

    /// Sign as if the request were sent at `now`
    ///
    /// # Errors
    /// Returns `ConfigError::Signing` if the HMAC key is rejected
    pub fn sign_at(ctx: &SignatureContext, now: SystemTime) -> Result<SignedHeaders, ClientError> {
        let date = httpdate::fmt_http_date(now);
        let to_sign = format!("{date}{}", ctx.sign_tail);

        let mut mac = Hmac::<Sha256>::new_from_slice(ctx.credentials.secret_key())
            .map_err(|e| ConfigError::Signing(e.to_string()))?;
        mac.update(to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        let authorization = format!(
            "{AUTH_SCHEME} {}:{signature}",
            ctx.credentials.access_key()
        );
        Ok(SignedHeaders {
            date,
            authorization,
        })
    }
}
