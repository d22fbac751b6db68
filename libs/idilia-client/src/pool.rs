use crate::config::{PoolConfig, RetryConfig, TlsRootConfig};
use crate::error::{ConfigError, TransportError, TransportErrorKind};
use crate::keep_alive::keep_alive_duration;
use crate::layers::DefaultHeadersLayer;
use crate::response::RawResponse;
use crate::retry::RetryPolicy;
use crate::scheduler::Scheduler;
use crate::tls;
use bytes::Bytes;
use http::header::{CONNECTION, HOST};
use http::uri::PathAndQuery;
use http::{HeaderMap, HeaderValue, Request, Uri};
use http_body_util::{BodyExt, Full};
use hyper::client::conn::http1;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::runtime::{Handle, Runtime};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tower::{Service, ServiceBuilder, ServiceExt};

type PooledSender = http1::SendRequest<Full<Bytes>>;

type DispatchFuture = Pin<Box<dyn Future<Output = Result<RawResponse, TransportError>> + Send>>;

/// Destination of a connection: scheme plus authority
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct Route {
    scheme: String,
    authority: String,
}

impl Route {
    fn of(uri: &Uri) -> Result<Self, TransportError> {
        match (uri.scheme_str(), uri.authority()) {
            (Some(scheme), Some(authority)) => Ok(Self {
                scheme: scheme.to_owned(),
                authority: authority.as_str().to_owned(),
            }),
            _ => Err(TransportError::new(
                TransportErrorKind::UnknownHost,
                format!("request URI '{uri}' has no host"),
            )),
        }
    }
}

struct IdleConnection {
    sender: PooledSender,
    expires_at: Option<Instant>,
}

impl IdleConnection {
    fn is_usable(&self, now: Instant) -> bool {
        !self.sender.is_closed() && self.expires_at.is_none_or(|at| at > now)
    }
}

/// Shared pool of persistent HTTP/1.1 connections
///
/// Owns the I/O worker runtime, the idle connections grouped by route, and a
/// [`Scheduler`] thread that evicts expired connections and fires delayed
/// retries. Create one at startup and clone the handle into every client.
///
/// # Connection limits
///
/// At most `max_total_connections` connections are leased at any time, and
/// at most `max_connections_per_route` to the same destination. Further
/// requests wait for a lease to be released.
///
/// # Keep-alive
///
/// A connection returned to the pool stays reusable for the duration the
/// server announced in its `Keep-Alive` header, or for `default_keep_alive`
/// when it announced none. A response with `Connection: close` is never
/// pooled.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    config: PoolConfig,
    connector: HttpsConnector<HttpConnector>,
    idle: Mutex<HashMap<Route, Vec<IdleConnection>>>,
    total: Arc<Semaphore>,
    per_route: Mutex<HashMap<Route, Arc<Semaphore>>>,
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    scheduler: Scheduler,
    closed: CancellationToken,
    default_headers: DefaultHeadersLayer,
    retry: RetryPolicy,
}

impl ConnectionPool {
    /// Create a builder with default configuration
    #[must_use]
    pub fn builder() -> ConnectionPoolBuilder {
        ConnectionPoolBuilder::new()
    }

    /// Create a pool from a configuration
    ///
    /// Starts the worker runtime and the scheduler thread.
    ///
    /// # Errors
    /// Returns an error if a setting is out of range, the user agent is not a
    /// valid header value, TLS setup fails, or the threads cannot be started
    pub fn new(config: PoolConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let default_headers = DefaultHeadersLayer::try_new(&config.user_agent)?;
        let connector = tls::build_connector(config.tls_roots, config.connect_timeout)?;

        let mut runtime = tokio::runtime::Builder::new_multi_thread();
        runtime.enable_all().thread_name("idilia-io");
        if let Some(threads) = config.worker_threads {
            runtime.worker_threads(threads.max(1));
        }
        let runtime = runtime.build().map_err(ConfigError::Runtime)?;
        let handle = runtime.handle().clone();
        let scheduler = Scheduler::start("idilia-scheduler")?;

        let inner = Arc::new(PoolInner {
            total: Arc::new(Semaphore::new(config.max_total_connections.max(1))),
            retry: RetryPolicy::new(&config.retry),
            config,
            connector,
            idle: Mutex::new(HashMap::new()),
            per_route: Mutex::new(HashMap::new()),
            runtime: Mutex::new(Some(runtime)),
            handle,
            scheduler,
            closed: CancellationToken::new(),
            default_headers,
        });

        let weak: Weak<PoolInner> = Arc::downgrade(&inner);
        let sweeping = inner
            .scheduler
            .schedule_at_fixed_rate(inner.config.eviction_interval, move || {
                if let Some(pool) = weak.upgrade() {
                    pool.evict_idle();
                }
            });
        if !sweeping {
            tracing::error!("scheduler stopped before idle eviction was registered");
        }

        tracing::debug!(
            max_total = inner.config.max_total_connections,
            max_per_route = inner.config.max_connections_per_route,
            "connection pool started"
        );
        Ok(Self { inner })
    }

    /// The configuration the pool was built with
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Number of idle connections currently kept for reuse
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.inner.idle.lock().values().map(Vec::len).sum()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Stop the scheduler and the worker runtime and close idle connections
    ///
    /// Requests in flight are abandoned; their futures resolve with
    /// `ClientError::ServiceClosed`. Also happens when the last handle is dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    /// Retry policy shared by every client using this pool
    pub(crate) fn retry_policy(&self) -> &RetryPolicy {
        &self.inner.retry
    }

    pub(crate) fn retry_config(&self) -> &RetryConfig {
        &self.inner.config.retry
    }

    pub(crate) fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Run a task on the worker runtime; `false` once the pool is shut down
    pub(crate) fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shut_down() {
            return false;
        }
        drop(self.inner.handle.spawn(task));
        true
    }

    /// Drive `future` to completion on the calling thread
    ///
    /// # Panics
    /// Panics if called from within an asynchronous execution context.
    pub(crate) fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.inner.handle.block_on(future)
    }

    /// Send one physical attempt and read the whole response body
    ///
    /// The request URI must be absolute. Default headers are filled in and the
    /// attempt, body included, is bounded by the socket timeout.
    pub(crate) fn send(
        &self,
        request: Request<Full<Bytes>>,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send + 'static {
        let service = ServiceBuilder::new()
            .map_err(map_tower_error as fn(tower::BoxError) -> TransportError)
            .timeout(self.inner.config.socket_timeout)
            .layer(self.inner.default_headers.clone())
            .service(PoolService {
                inner: Arc::clone(&self.inner),
            });
        service.oneshot(request)
    }
}

impl fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.inner.config)
            .field("idle_connections", &self.idle_connections())
            .field("shut_down", &self.is_shut_down())
            .finish_non_exhaustive()
    }
}

/// Recover the pool's own error, otherwise classify the layer error
fn map_tower_error(err: tower::BoxError) -> TransportError {
    match err.downcast::<TransportError>() {
        Ok(err) => *err,
        Err(other) => TransportError::classify(other),
    }
}

/// Innermost service of the request stack: leases a connection and sends
#[derive(Clone)]
struct PoolService {
    inner: Arc<PoolInner>,
}

impl Service<Request<Full<Bytes>>> for PoolService {
    type Response = RawResponse;
    type Error = TransportError;
    type Future = DispatchFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request<Full<Bytes>>) -> Self::Future {
        Box::pin(Arc::clone(&self.inner).dispatch(request))
    }
}

impl PoolInner {
    async fn dispatch(
        self: Arc<Self>,
        mut request: Request<Full<Bytes>>,
    ) -> Result<RawResponse, TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::closed());
        }

        let target = request.uri().clone();
        let route = Route::of(&target)?;

        let _route_permit = self
            .route_semaphore(&route)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::closed())?;
        let _total_permit = Arc::clone(&self.total)
            .acquire_owned()
            .await
            .map_err(|_| TransportError::closed())?;

        let mut sender = self.lease(&route, &target).await?;

        to_origin_form(&mut request, &route)?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| TransportError::classify(Box::new(e)))?;
        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| TransportError::classify(Box::new(e)))?
            .to_bytes();

        if is_reusable(&parts.headers) {
            self.release(route, sender, &parts.headers);
        }
        Ok(RawResponse::new(parts.status, parts.headers, body))
    }

    /// Reuse an idle connection to `route` or open a new one
    async fn lease(&self, route: &Route, target: &Uri) -> Result<PooledSender, TransportError> {
        if let Some(mut sender) = self.checkout(route) {
            if sender.ready().await.is_ok() {
                tracing::trace!(route = %route.authority, "reusing pooled connection");
                return Ok(sender);
            }
            tracing::trace!(route = %route.authority, "pooled connection went stale");
        }

        let mut sender = self.connect(target).await?;
        sender
            .ready()
            .await
            .map_err(|e| TransportError::classify(Box::new(e)))?;
        Ok(sender)
    }

    async fn connect(&self, target: &Uri) -> Result<PooledSender, TransportError> {
        let stream = self
            .connector
            .clone()
            .oneshot(target.clone())
            .await
            .map_err(TransportError::classify)?;
        let (sender, connection) = http1::handshake(stream)
            .await
            .map_err(|e| TransportError::classify(Box::new(e)))?;

        self.handle.spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!(error = %e, "pooled connection closed with error");
            }
        });
        Ok(sender)
    }

    fn route_semaphore(&self, route: &Route) -> Arc<Semaphore> {
        let max = self.config.max_connections_per_route.max(1);
        Arc::clone(
            self.per_route
                .lock()
                .entry(route.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(max))),
        )
    }

    fn checkout(&self, route: &Route) -> Option<PooledSender> {
        let now = Instant::now();
        let mut idle = self.idle.lock();
        let connections = idle.get_mut(route)?;
        while let Some(conn) = connections.pop() {
            if conn.is_usable(now) {
                return Some(conn.sender);
            }
        }
        None
    }

    fn release(&self, route: Route, sender: PooledSender, headers: &HeaderMap) {
        if self.closed.is_cancelled() || sender.is_closed() {
            return;
        }
        let lease = keep_alive_duration(headers).or(self.config.default_keep_alive);
        if lease == Some(Duration::ZERO) {
            return;
        }

        // A lease past the end of the clock never expires
        let conn = IdleConnection {
            sender,
            expires_at: lease.and_then(|d| Instant::now().checked_add(d)),
        };
        let mut idle = self.idle.lock();
        let total_idle: usize = idle.values().map(Vec::len).sum();
        if total_idle >= self.config.max_total_connections {
            return;
        }
        let connections = idle.entry(route).or_default();
        if connections.len() < self.config.max_connections_per_route {
            connections.push(conn);
        }
    }

    /// Drop idle connections whose lease expired or whose peer closed
    fn evict_idle(&self) {
        let now = Instant::now();
        let mut evicted = 0usize;
        let mut idle = self.idle.lock();
        idle.retain(|_, connections| {
            let before = connections.len();
            connections.retain(|conn| conn.is_usable(now));
            evicted += before - connections.len();
            !connections.is_empty()
        });
        if evicted > 0 {
            tracing::trace!(evicted, "evicted idle connections");
        }
    }

    fn shutdown(&self) {
        self.closed.cancel();
        self.total.close();
        for semaphore in self.per_route.lock().values() {
            semaphore.close();
        }
        self.scheduler.shutdown();
        self.idle.lock().clear();

        let runtime = self.runtime.lock().take();
        if let Some(runtime) = runtime {
            runtime.shutdown_background();
            tracing::debug!("connection pool shut down");
        }
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Rewrite an absolute-form request for sending over an established connection
fn to_origin_form(request: &mut Request<Full<Bytes>>, route: &Route) -> Result<(), TransportError> {
    if !request.headers().contains_key(HOST) {
        let host = HeaderValue::from_str(&route.authority)
            .map_err(|e| TransportError::new(TransportErrorKind::UnknownHost, e))?;
        request.headers_mut().insert(HOST, host);
    }
    let path = request
        .uri()
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    *request.uri_mut() = Uri::from(path);
    Ok(())
}

fn is_reusable(headers: &HeaderMap) -> bool {
    !headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("close"))
}

/// Builder for a [`ConnectionPool`]
#[derive(Debug, Clone, Default)]
pub struct ConnectionPoolBuilder {
    config: PoolConfig,
}

impl ConnectionPoolBuilder {
    /// Create a new builder with default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder with a specific configuration
    #[must_use]
    pub fn with_config(config: PoolConfig) -> Self {
        Self { config }
    }

    /// Set the maximum number of connections leased at once
    #[must_use]
    pub fn max_total_connections(mut self, max: usize) -> Self {
        self.config.max_total_connections = max;
        self
    }

    /// Set the maximum number of connections leased at once per destination
    #[must_use]
    pub fn max_connections_per_route(mut self, max: usize) -> Self {
        self.config.max_connections_per_route = max;
        self
    }

    /// Set the socket timeout of one physical attempt
    #[must_use]
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.config.socket_timeout = timeout;
        self
    }

    /// Set the TCP connect timeout
    #[must_use]
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    /// Set the lease of connections whose response carried no `Keep-Alive` header
    ///
    /// `None` keeps them until the peer closes them.
    #[must_use]
    pub fn default_keep_alive(mut self, lease: Option<Duration>) -> Self {
        self.config.default_keep_alive = lease;
        self
    }

    /// Set the period of the idle-connection eviction sweep
    #[must_use]
    pub fn eviction_interval(mut self, interval: Duration) -> Self {
        self.config.eviction_interval = interval;
        self
    }

    /// Set the number of I/O worker threads
    #[must_use]
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.config.worker_threads = Some(threads);
        self
    }

    /// Set the user agent string
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    /// Set the TLS root certificate strategy
    #[must_use]
    pub fn tls_roots(mut self, tls_roots: TlsRootConfig) -> Self {
        self.config.tls_roots = tls_roots;
        self
    }

    /// Set the retry configuration
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Build the pool
    ///
    /// # Errors
    /// Returns an error if TLS setup fails, the user agent is invalid, or the
    /// worker threads cannot be started
    pub fn build(self) -> Result<ConnectionPool, ConfigError> {
        ConnectionPool::new(self.config)
    }
}
