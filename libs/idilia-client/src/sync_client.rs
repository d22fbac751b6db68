use crate::client::ClientCore;
use crate::credentials::Credentials;
use crate::error::{ClientError, ConfigError};
use crate::pool::ConnectionPool;
use crate::request::SignableRequest;
use crate::response::{RawResponse, ResponseDecoder};
use crate::retry::{AttemptOutcome, Decision, RetryState};
use crate::signer::RequestSigner;
use std::sync::Arc;
use url::Url;

/// Blocking dispatcher
///
/// Runs every attempt of a logical request on the calling thread, waiting
/// out server-requested retry delays in place. Cheap to clone; all clones
/// share the same pool.
///
/// Must not be used from inside an asynchronous task; use
/// [`AsyncClient`](crate::AsyncClient) there.
///
/// # Example
///
/// ```ignore
/// let client = SyncClient::new(credentials, pool)?;
/// let request = SignableRequest::from_form("/1/text/match.json", &form)?;
/// let result: MatchResponse = client.perform(request, &JsonDecoder::new())?;
/// ```
#[derive(Clone, Debug)]
pub struct SyncClient {
    core: ClientCore,
}

impl SyncClient {
    /// Create a client for the default service URL
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidUrl` if the default URL cannot be parsed
    pub fn new(credentials: Arc<Credentials>, pool: ConnectionPool) -> Result<Self, ConfigError> {
        Ok(Self {
            core: ClientCore::new(credentials, pool, None)?,
        })
    }

    /// Create a client for another service URL (e.g. a test server)
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidUrl` if the URL is not an `http` or
    /// `https` URL with a host
    pub fn with_service_url(
        credentials: Arc<Credentials>,
        pool: ConnectionPool,
        service_url: &str,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            core: ClientCore::new(credentials, pool, Some(service_url))?,
        })
    }

    /// Replace the signer, e.g. to sign with another clock
    #[must_use]
    pub fn with_signer(mut self, signer: RequestSigner) -> Self {
        self.core.set_signer(signer);
        self
    }

    /// Service URL requests are sent to
    #[must_use]
    pub fn service_url(&self) -> &Url {
        self.core.service_url()
    }

    /// Send a request, retrying as the policy allows
    ///
    /// Returns the final non-5xx response with its body decompressed.
    ///
    /// # Errors
    /// - `ClientError::Transport` when the last attempt failed without a response
    /// - `ClientError::Server` when the server kept answering 5xx
    /// - `ClientError::Protocol` for an empty or undecodable body
    /// - `ClientError::ServiceClosed` after the pool was shut down
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn execute(&self, request: SignableRequest) -> Result<RawResponse, ClientError> {
        let call = self.core.prepare(request)?;
        let pool = self.core.pool();
        let policy = pool.retry_policy();
        let mut state = RetryState::default();

        loop {
            if pool.is_shut_down() {
                return Err(ClientError::ServiceClosed);
            }

            let attempt = self.core.build_attempt(&call)?;
            let result = pool.block_on(pool.send(attempt));
            let attempts = state.record_attempt();

            let decision = match &result {
                Err(err) => policy.decide(AttemptOutcome::Failed(err), attempts),
                Ok(raw) => policy.decide(AttemptOutcome::Responded(raw), attempts),
            };

            match (result, decision) {
                (Err(err), Decision::Abort) => return Err(ClientCore::transport_error(err)),
                (Err(err), _) => {
                    state.transport_retries += 1;
                    tracing::debug!(
                        attempt = attempts,
                        error = %err,
                        "retrying after transport failure",
                    );
                }
                (Ok(raw), Decision::Abort) if raw.status().is_server_error() => {
                    return Err(ClientCore::server_error(raw, attempts));
                }
                (Ok(raw), Decision::Abort) => return ClientCore::complete(raw),
                (Ok(raw), Decision::RetryImmediate) => {
                    tracing::debug!(
                        attempt = attempts,
                        status = %raw.status(),
                        "retrying after server error",
                    );
                }
                (Ok(raw), Decision::RetryAfter(delay)) => {
                    tracing::debug!(
                        attempt = attempts,
                        status = %raw.status(),
                        delay_ms = delay.as_millis(),
                        "retrying after server-requested delay"
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Send a request and decode the final response
    ///
    /// # Errors
    /// Everything [`execute`](Self::execute) returns, plus
    /// `ClientError::Application` when the server reported a failure in the
    /// response body and `ClientError::Protocol` when decoding fails.
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub fn perform<D: ResponseDecoder>(
        &self,
        request: SignableRequest,
        decoder: &D,
    ) -> Result<D::Output, ClientError> {
        let raw = self.execute(request)?;
        ClientCore::decode(&raw, decoder)
    }
}
