#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
#![warn(warnings)]

//! Client pipeline for the Idilia REST API
//!
//! This crate provides the transport core shared by every Idilia API client:
//! - HMAC-SHA256 request signing with per-attempt `Date` stamping
//! - A single retry policy used by both execution modes
//! - Transparent gzip negotiation and response decompression
//! - A bounded pool of persistent HTTP/1.1 connections with keep-alive leases
//! - A blocking dispatcher ([`SyncClient`]) and a non-blocking one ([`AsyncClient`])
//!
//! Endpoint-specific payloads and response schemas live outside this crate.
//! Callers hand over a [`SignableRequest`] and a [`ResponseDecoder`].
//!
//! # Lifetime of the pool
//!
//! A [`ConnectionPool`] is created once at startup and handed to every client.
//! Cloning it is cheap. Call [`ConnectionPool::shutdown`] (or drop the last
//! handle) at process exit to stop its worker threads.
//!
//! # Example
//!
//! ```ignore
//! use idilia_client::{ConnectionPool, Credentials, JsonDecoder, SignableRequest, SyncClient};
//! use std::sync::Arc;
//!
//! let pool = ConnectionPool::builder().build()?;
//! let creds = Arc::new(Credentials::new("Idi1234567890", "k".repeat(30))?);
//! let client = SyncClient::new(creds, pool.clone())?;
//!
//! let request = SignableRequest::new("/1/kb/query.json", payload);
//! let answer: serde_json::Value = client.perform(request, &JsonDecoder::new())?;
//!
//! pool.shutdown();
//! ```

mod async_client;
mod client;
pub mod compression;
mod config;
mod credentials;
mod error;
pub mod keep_alive;
mod layers;
mod pool;
mod request;
mod response;
mod retry;
mod scheduler;
mod signer;
mod sync_client;
mod tls;

pub use async_client::{AsyncClient, ResponseFuture};
pub use config::{
    DEFAULT_SERVICE_URL, DEFAULT_USER_AGENT, PoolConfig, RetryConfig, TlsRootConfig,
};
pub use credentials::{ACCESS_KEY_LEN, ACCESS_KEY_PREFIX, Credentials, SECRET_KEY_LEN};
pub use error::{
    ApiError, ClientError, ConfigError, ProtocolError, TransportError, TransportErrorKind,
};
pub use layers::{DefaultHeadersLayer, DefaultHeadersService};
pub use pool::{ConnectionPool, ConnectionPoolBuilder};
pub use request::{FormBody, SignableRequest};
pub use response::{DecodeFn, Decoded, JsonDecoder, RawResponse, ResponseDecoder, decode_fn};
pub use retry::{AttemptOutcome, Decision, RetryPolicy, RetryState};
pub use scheduler::Scheduler;
pub use signer::{AUTH_SCHEME, RequestSigner, SignatureContext, SignedHeaders};
pub use sync_client::SyncClient;
