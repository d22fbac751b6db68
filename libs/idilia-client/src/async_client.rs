use crate::client::{ClientCore, PreparedCall};
use crate::credentials::Credentials;
use crate::error::{ClientError, ConfigError, TransportError};
use crate::pool::ConnectionPool;
use crate::request::SignableRequest;
use crate::response::{RawResponse, ResponseDecoder};
use crate::retry::{AttemptOutcome, RetryState};
use crate::signer::RequestSigner;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Non-blocking dispatcher
///
/// Each attempt runs as a task on the pool's worker runtime, delayed retries
/// are fired by the pool's scheduler thread, and the caller gets a
/// [`ResponseFuture`] right away. The future can be awaited on any executor.
///
/// Compared with [`SyncClient`](crate::SyncClient), a failure without a
/// response is retried at most once, and every resubmission after a 5xx
/// waits at least `RetryConfig::min_resubmit_delay`.
#[derive(Clone, Debug)]
pub struct AsyncClient {
    core: ClientCore,
}

impl AsyncClient {
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

    /// Submit a request; the result is delivered through the returned future
    ///
    /// Returns immediately. Configuration errors are delivered through the
    /// future as well.
    pub fn execute_async<D>(
        &self,
        request: SignableRequest,
        decoder: D,
    ) -> ResponseFuture<D::Output>
    where
        D: ResponseDecoder,
    {
        let (tx, rx) = oneshot::channel();
        let cancel = CancellationToken::new();
        let future = ResponseFuture {
            rx,
            cancel: cancel.clone(),
        };

        match self.core.prepare(request) {
            Ok(call) => PendingCall {
                tx,
                retry: RetryState::default(),
                call,
                decoder,
                cancel,
                core: self.core.clone(),
            }
            .submit(),
            Err(err) => {
                if tx.send(Err(err)).is_err() {
                    tracing::trace!("response future dropped before delivery");
                }
            }
        }
        future
    }

    /// Submit a request and wait for its decoded result
    ///
    /// # Errors
    /// See [`SyncClient::perform`](crate::SyncClient::perform); additionally
    /// `ClientError::ServiceClosed` if the pool shuts down first.
    pub async fn perform<D>(
        &self,
        request: SignableRequest,
        decoder: D,
    ) -> Result<D::Output, ClientError>
    where
        D: ResponseDecoder,
    {
        self.execute_async(request, decoder).await
    }
}

/// Handle to an in-flight logical request
///
/// Resolves with the decoded result or the final error. Dropping the future
/// cancels the request.
#[must_use = "dropping a ResponseFuture cancels the request"]
pub struct ResponseFuture<T> {
    rx: oneshot::Receiver<Result<T, ClientError>>,
    cancel: CancellationToken,
}

impl<T> ResponseFuture<T> {
    /// Cancel the request
    ///
    /// A resubmission that is scheduled but has not fired is skipped, and a
    /// result that arrives later is discarded. Awaiting a cancelled future
    /// yields `ClientError::Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether [`cancel`](Self::cancel) has been called
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl<T> Future for ResponseFuture<T> {
    type Output = Result<T, ClientError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.cancel.is_cancelled() {
            return Poll::Ready(Err(ClientError::Cancelled));
        }
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) if this.cancel.is_cancelled() => {
                Poll::Ready(Err(ClientError::Cancelled))
            }
            Poll::Ready(Err(_)) => Poll::Ready(Err(ClientError::ServiceClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for ResponseFuture<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl<T> fmt::Debug for ResponseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseFuture")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// What to do after an attempt completed
enum Step<T> {
    Resubmit(Duration),
    Resolve(Result<T, ClientError>),
}

/// A logical request owned by the dispatcher until it resolves
///
/// Moves from task to task: one task per attempt, with scheduler timers in
/// between. Dropping it without resolving makes the caller's future yield
/// `ClientError::ServiceClosed`.
struct PendingCall<D: ResponseDecoder> {
    tx: oneshot::Sender<Result<D::Output, ClientError>>,
    retry: RetryState,
    call: PreparedCall,
    decoder: D,
    cancel: CancellationToken,
    core: ClientCore,
}

impl<D: ResponseDecoder> PendingCall<D> {
    /// Sign and send the next attempt on the worker runtime
    fn submit(self) {
        if self.cancel.is_cancelled() {
            tracing::trace!(
                attempt = self.retry.attempts + 1,
                "skipping attempt of cancelled request",
            );
            return;
        }

        let attempt = match self.core.build_attempt(&self.call) {
            Ok(attempt) => attempt,
            Err(err) => {
                self.resolve(Err(err));
                return;
            }
        };

        let pool = self.core.pool().clone();
        let send = pool.send(attempt);
        let cancel = self.cancel.clone();
        // A rejected task drops `self`, so the caller sees ServiceClosed
        let accepted = pool.spawn(async move {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => return,
                result = send => result,
            };
            self.on_completed(result);
        });
        if !accepted {
            tracing::trace!("connection pool shut down; request abandoned");
        }
    }

    fn on_completed(mut self, result: Result<RawResponse, TransportError>) {
        match self.next_step(result) {
            Step::Resolve(result) => self.resolve(result),
            Step::Resubmit(delay) if delay.is_zero() => self.submit(),
            Step::Resubmit(delay) => {
                let scheduler = self.core.pool().scheduler().clone();
                let cancel = self.cancel.clone();
                if !scheduler.schedule(delay, cancel, move || self.submit()) {
                    tracing::trace!("scheduler shut down; resubmission abandoned");
                }
            }
        }
    }

    fn next_step(&mut self, result: Result<RawResponse, TransportError>) -> Step<D::Output> {
        let attempts = self.retry.record_attempt();
        let pool = self.core.pool();
        let policy = pool.retry_policy();

        match result {
            Err(err) => {
                let decision = policy.decide(AttemptOutcome::Failed(&err), attempts);
                if decision.is_retry() && self.retry.transport_retries == 0 {
                    self.retry.transport_retries += 1;
                    tracing::debug!(
                        attempt = attempts,
                        error = %err,
                        "resubmitting after transport failure",
                    );
                    Step::Resubmit(Duration::ZERO)
                } else {
                    Step::Resolve(Err(ClientCore::transport_error(err)))
                }
            }
            Ok(raw) if raw.status().is_server_error() => {
                let floor = pool.retry_config().min_resubmit_delay;
                match policy
                    .decide(AttemptOutcome::Responded(&raw), attempts)
                    .resubmit_delay(floor)
                {
                    Some(delay) => {
                        tracing::debug!(
                            attempt = attempts,
                            status = %raw.status(),
                            delay_ms = delay.as_millis(),
                            "scheduling resubmission after server error"
                        );
                        Step::Resubmit(delay)
                    }
                    None => Step::Resolve(Err(ClientCore::server_error(raw, attempts))),
                }
            }
            Ok(raw) => Step::Resolve(ClientCore::finish(raw, &self.decoder)),
        }
    }

    fn resolve(self, result: Result<D::Output, ClientError>) {
        if self.cancel.is_cancelled() {
            tracing::trace!("dropping result of cancelled request");
            return;
        }
        if self.tx.send(result).is_err() {
            tracing::trace!("caller went away before the result arrived");
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::compression::tests::gzip;
    use crate::config::PoolConfig;
    use crate::error::{ProtocolError, TransportErrorKind};
    use crate::pool::tests::closing_listener;
    use crate::response::JsonDecoder;
    use futures::executor::block_on;
    use http::StatusCode;
    use httpmock::prelude::*;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{Instant, SystemTime, UNIX_EPOCH};

    #[derive(Debug, Deserialize, PartialEq)]
    struct Answer {
        result: String,
    }

    fn setup(server: &MockServer) -> (AsyncClient, ConnectionPool) {
        let creds = Arc::new(Credentials::new("Idi1234567890", "k".repeat(30)).unwrap());
        let pool = ConnectionPool::new(PoolConfig::for_testing()).unwrap();
        let client =
            AsyncClient::with_service_url(creds, pool.clone(), &server.base_url()).unwrap();
        (client, pool)
    }

    static CLOCK_TICKS: AtomicU64 = AtomicU64::new(0);

    /// Advances one second on every reading
    fn ticking_clock() -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(1_300_000_000 + CLOCK_TICKS.fetch_add(1, Ordering::SeqCst))
    }

    fn wait_for_calls(mock: &httpmock::Mock<'_>, calls: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while mock.calls() < calls && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn test_success_decodes() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/1/kb/query.json")
                .header_exists("authorization")
                .header_exists("date");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status":200,"result":"async"}"#);
        });

        let (client, pool) = setup(&server);
        let future = client.execute_async(
            SignableRequest::new("/1/kb/query.json", "q=1"),
            JsonDecoder::<Answer>::new(),
        );
        let answer = block_on(future).unwrap();

        assert_eq!(answer.result, "async");
        mock.assert_calls(1);
        pool.shutdown();
    }

    #[test]
    fn test_server_error_resubmitted_with_floor() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/fail");
            then.status(500).body("oops");
        });

        let (client, pool) = setup(&server);
        let started = Instant::now();
        let result = block_on(client.execute_async(
            SignableRequest::new("/fail", "x=1"),
            JsonDecoder::<Answer>::new(),
        ));

        // Two resubmissions, each at least 200ms after the previous answer
        assert!(started.elapsed() >= Duration::from_millis(400));
        assert!(matches!(
            result,
            Err(ClientError::Server {
                status: StatusCode::INTERNAL_SERVER_ERROR,
                attempts: 3,
                ..
            })
        ));
        mock.assert_calls(3);
        pool.shutdown();
    }

    #[test]
    fn test_retry_after_delays_resubmission_without_blocking() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/busy");
            then.status(503).header("Retry-After", "1").body("busy");
        });

        let (client, pool) = setup(&server);
        let started = Instant::now();
        let future = client.execute_async(
            SignableRequest::new("/busy", "x=1"),
            JsonDecoder::<Answer>::new(),
        );
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "submission must return before any retry delay"
        );

        wait_for_calls(&mock, 1);
        std::thread::sleep(Duration::from_millis(500));
        assert_eq!(mock.calls(), 1, "resubmitted before Retry-After elapsed");

        let result = block_on(future);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert!(matches!(
            result,
            Err(ClientError::Server {
                status: StatusCode::SERVICE_UNAVAILABLE,
                attempts: 3,
                retry_after: Some(1),
                ..
            })
        ));
        mock.assert_calls(3);
        pool.shutdown();
    }

    #[test]
    fn test_transport_failure_retried_once() {
        let (url, accepted) = closing_listener();
        let creds = Arc::new(Credentials::new("Idi1234567890", "k".repeat(30)).unwrap());
        let pool = ConnectionPool::new(PoolConfig::for_testing()).unwrap();
        let client = AsyncClient::with_service_url(creds, pool.clone(), &url).unwrap();

        let result = block_on(client.execute_async(
            SignableRequest::new("/reset", "x=1"),
            JsonDecoder::<Answer>::new(),
        ));

        let Err(ClientError::Transport(err)) = result else {
            panic!("expected transport error, got {result:?}");
        };
        assert_eq!(err.kind(), TransportErrorKind::Io);
        assert_eq!(accepted.load(Ordering::SeqCst), 2);
        pool.shutdown();
    }

    #[test]
    fn test_every_resubmission_is_signed_again() {
        let server = MockServer::start();
        let mocks: Vec<_> = ["07:06:40", "07:06:41", "07:06:42"]
            .iter()
            .map(|time| {
                let date = format!("Sun, 13 Mar 2011 {time} GMT");
                server.mock(move |when, then| {
                    when.path("/fail")
                        .header("date", date)
                        .header_exists("authorization");
                    then.status(500).body("oops");
                })
            })
            .collect();

        let (client, pool) = setup(&server);
        let client = client.with_signer(RequestSigner::with_clock(ticking_clock));
        let result = block_on(client.execute_async(
            SignableRequest::new("/fail", "x=1"),
            JsonDecoder::<Answer>::new(),
        ));

        assert!(matches!(result, Err(ClientError::Server { attempts: 3, .. })));
        for mock in &mocks {
            mock.assert_calls(1);
        }
        pool.shutdown();
    }

    #[test]
    fn test_cancel_skips_scheduled_resubmission() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.path("/busy");
            then.status(503).header("Retry-After", "2").body("busy");
        });

        let (client, pool) = setup(&server);
        let future = client.execute_async(
            SignableRequest::new("/busy", "x=1"),
            JsonDecoder::<Answer>::new(),
        );

        wait_for_calls(&mock, 1);
        future.cancel();
        assert!(future.is_cancelled());

        std::thread::sleep(Duration::from_millis(2500));
        assert_eq!(mock.calls(), 1, "cancelled request must not be resubmitted");
        assert!(matches!(block_on(future), Err(ClientError::Cancelled)));
        pool.shutdown();
    }

    #[test]
    fn test_gzip_response_is_transparent() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/gz");
            then.status(200)
                .header("content-type", "application/json")
                .header("content-encoding", "gzip")
                .body(gzip(br#"{"status":200,"result":"inflated"}"#));
        });

        let (client, pool) = setup(&server);
        let answer = block_on(client.execute_async(
            SignableRequest::new("/gz", "x=1"),
            JsonDecoder::<Answer>::new(),
        ))
        .unwrap();
        assert_eq!(answer.result, "inflated");
        pool.shutdown();
    }

    #[test]
    fn test_refused_connection_resolves_with_transport_error() {
        let creds = Arc::new(Credentials::new("Idi1234567890", "k".repeat(30)).unwrap());
        let pool = ConnectionPool::new(PoolConfig::for_testing()).unwrap();
        let client =
            AsyncClient::with_service_url(creds, pool.clone(), "http://127.0.0.1:9").unwrap();

        let result = block_on(client.execute_async(
            SignableRequest::new("/x", "x=1"),
            JsonDecoder::<Answer>::new(),
        ));
        assert!(matches!(result, Err(ClientError::Transport(_))));
        pool.shutdown();
    }

    #[test]
    fn test_configuration_error_delivered_through_future() {
        let server = MockServer::start();
        let (client, pool) = setup(&server);
        let result = block_on(client.execute_async(
            SignableRequest::new("/x", "x=1").header("bad header", "v"),
            JsonDecoder::<Answer>::new(),
        ));
        assert!(matches!(result, Err(ClientError::Configuration(_))));
        pool.shutdown();
    }

    #[test]
    fn test_protocol_error_resolves_future() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/html");
            then.status(200)
                .header("content-type", "text/html")
                .body("<html/>");
        });

        let (client, pool) = setup(&server);
        let result = block_on(client.execute_async(
            SignableRequest::new("/html", "x=1"),
            JsonDecoder::<Answer>::new(),
        ));
        assert!(matches!(
            result,
            Err(ClientError::Protocol(ProtocolError::UnexpectedContentType(_)))
        ));
        pool.shutdown();
    }

    #[test]
    fn test_shutdown_resolves_pending_calls() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/busy");
            then.status(503).header("Retry-After", "5").body("busy");
        });

        let (client, pool) = setup(&server);
        let future = client.execute_async(
            SignableRequest::new("/busy", "x=1"),
            JsonDecoder::<Answer>::new(),
        );
        std::thread::sleep(Duration::from_millis(500));
        pool.shutdown();

        assert!(matches!(block_on(future), Err(ClientError::ServiceClosed)));
    }

    #[test]
    fn test_perform_awaits_result() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.path("/ok");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{"status":200,"result":"done"}"#);
        });

        let (client, pool) = setup(&server);
        let answer = block_on(client.perform(
            SignableRequest::new("/ok", "x=1"),
            JsonDecoder::<Answer>::new(),
        ))
        .unwrap();
        assert_eq!(answer, Answer { result: "done".to_owned() });
        pool.shutdown();
    }
}
