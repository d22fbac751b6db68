use crate::compression::GZIP;
use crate::error::ConfigError;
use http::header::{ACCEPT_ENCODING, USER_AGENT};
use http::{HeaderValue, Request};
use std::task::{Context, Poll};
use tower::{Layer, Service};

/// Tower layer that adds `User-Agent` and `Accept-Encoding: gzip` to all requests
///
/// Values already set by the caller are left untouched.
#[derive(Clone, Debug)]
pub struct DefaultHeadersLayer {
    user_agent: HeaderValue,
    accept_encoding: HeaderValue,
}

impl DefaultHeadersLayer {
    /// Create a layer with the given user agent string
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidHeaderValue` if the user agent string is not valid
    pub fn try_new(user_agent: impl AsRef<str>) -> Result<Self, ConfigError> {
        let user_agent = HeaderValue::from_str(user_agent.as_ref())?;
        Ok(Self {
            user_agent,
            accept_encoding: HeaderValue::from_static(GZIP),
        })
    }
}

impl<S> Layer<S> for DefaultHeadersLayer {
    type Service = DefaultHeadersService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DefaultHeadersService {
            inner,
            user_agent: self.user_agent.clone(),
            accept_encoding: self.accept_encoding.clone(),
        }
    }
}

/// Service that fills in default request headers
#[derive(Clone, Debug)]
pub struct DefaultHeadersService<S> {
    inner: S,
    user_agent: HeaderValue,
    accept_encoding: HeaderValue,
}

impl<S, ReqBody> Service<Request<ReqBody>> for DefaultHeadersService<S>
where
    S: Service<Request<ReqBody>>,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = S::Future;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        let headers = req.headers_mut();
        if !headers.contains_key(USER_AGENT) {
            headers.insert(USER_AGENT, self.user_agent.clone());
        }
        if !headers.contains_key(ACCEPT_ENCODING) {
            headers.insert(ACCEPT_ENCODING, self.accept_encoding.clone());
        }
        self.inner.call(req)
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{Method, Response, StatusCode};
    use http_body_util::Full;
    use tower::ServiceExt;

    /// Echoes the request headers back as response headers
    #[derive(Clone)]
    struct EchoHeaders;

    impl Service<Request<Full<Bytes>>> for EchoHeaders {
        type Response = Response<Full<Bytes>>;
        type Error = Box<dyn std::error::Error + Send + Sync>;
        type Future = std::future::Ready<Result<Self::Response, Self::Error>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
            let mut resp = Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .unwrap();
            *resp.headers_mut() = req.headers().clone();
            std::future::ready(Ok(resp))
        }
    }

    fn request() -> http::request::Builder {
        Request::builder()
            .method(Method::POST)
            .uri("http://api.idilia.com/1/kb/query.json")
    }

    #[tokio::test]
    async fn test_defaults_added() {
        let layer = DefaultHeadersLayer::try_new("test-agent/1.0").unwrap();
        let service = layer.layer(EchoHeaders);

        let req = request().body(Full::new(Bytes::new())).unwrap();
        let resp = service.oneshot(req).await.unwrap();

        assert_eq!(resp.headers().get(USER_AGENT).unwrap(), "test-agent/1.0");
        assert_eq!(resp.headers().get(ACCEPT_ENCODING).unwrap(), "gzip");
    }

    #[tokio::test]
    async fn test_caller_values_not_overwritten() {
        let layer = DefaultHeadersLayer::try_new("test-agent/1.0").unwrap();
        let service = layer.layer(EchoHeaders);

        let req = request()
            .header(USER_AGENT, "custom-agent/2.0")
            .header(ACCEPT_ENCODING, "identity")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = service.oneshot(req).await.unwrap();

        assert_eq!(resp.headers().get(USER_AGENT).unwrap(), "custom-agent/2.0");
        assert_eq!(resp.headers().get(ACCEPT_ENCODING).unwrap(), "identity");
        assert_eq!(resp.headers().get_all(ACCEPT_ENCODING).iter().count(), 1);
    }

    #[test]
    fn test_invalid_user_agent() {
        // Control characters are invalid in header values
        let result = DefaultHeadersLayer::try_new("bad\x00agent");
        assert!(matches!(result, Err(ConfigError::InvalidHeaderValue(_))));
    }
}
