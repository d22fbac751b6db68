use crate::compression::decompress;
use crate::config::DEFAULT_SERVICE_URL;
use crate::credentials::Credentials;
use crate::error::{ClientError, ConfigError, ProtocolError, TransportError, TransportErrorKind};
use crate::pool::ConnectionPool;
use crate::request::SignableRequest;
use crate::response::{RawResponse, ResponseDecoder};
use crate::retry::retry_after_secs;
use crate::signer::{RequestSigner, SignatureContext};
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Method, Request, Uri};
use http_body_util::Full;
use std::sync::Arc;
use url::Url;

/// A logical request ready for its first attempt
#[derive(Debug)]
pub struct PreparedCall {
    request: SignableRequest,
    uri: Uri,
    context: SignatureContext,
}

/// State shared by both dispatchers: pool, signer, credentials, endpoint
#[derive(Clone, Debug)]
pub struct ClientCore {
    pool: ConnectionPool,
    signer: RequestSigner,
    credentials: Arc<Credentials>,
    service_url: Url,
}

impl ClientCore {
    pub(crate) fn new(
        credentials: Arc<Credentials>,
        pool: ConnectionPool,
        service_url: Option<&str>,
    ) -> Result<Self, ConfigError> {
        let service_url = parse_service_url(service_url.unwrap_or(DEFAULT_SERVICE_URL))?;
        Ok(Self {
            pool,
            signer: RequestSigner::new(),
            credentials,
            service_url,
        })
    }

    pub(crate) fn set_signer(&mut self, signer: RequestSigner) {
        self.signer = signer;
    }

    pub(crate) fn pool(&self) -> &ConnectionPool {
        &self.pool
    }

    pub(crate) fn service_url(&self) -> &Url {
        &self.service_url
    }

    pub(crate) fn credentials(&self) -> &Arc<Credentials> {
        &self.credentials
    }

    /// Resolve the target URI and the signature material once per logical request
    pub(crate) fn prepare(
        &self,
        mut request: SignableRequest,
    ) -> Result<PreparedCall, ClientError> {
        if let Some(err) = request.take_error() {
            return Err(err);
        }

        let path = request.path();
        let target = if path.starts_with('/') {
            format!("{}{path}", self.service_url.as_str().trim_end_matches('/'))
        } else {
            format!("{}/{path}", self.service_url.as_str().trim_end_matches('/'))
        };
        let uri = target.parse::<Uri>().map_err(|e| ConfigError::InvalidUrl {
            url: target.clone(),
            reason: e.to_string(),
        })?;
        let context = SignatureContext::new(
            Arc::clone(&self.credentials),
            &self.service_url,
            path,
            request.signed_bytes(),
        );

        Ok(PreparedCall {
            request,
            uri,
            context,
        })
    }

    /// Build one physical attempt, signed with the current time
    pub(crate) fn build_attempt(
        &self,
        call: &PreparedCall,
    ) -> Result<Request<Full<Bytes>>, ClientError> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(call.uri.clone());
        if let Some(headers) = builder.headers_mut() {
            headers.extend(
                call.request
                    .headers()
                    .iter()
                    .map(|(name, value)| (name.clone(), value.clone())),
            );
            headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_str(call.request.content_type())?,
            );
            self.signer.sign(&call.context)?.apply(headers)?;
        }

        builder
            .body(Full::new(call.request.payload().clone()))
            .map_err(|e| {
                ClientError::Configuration(ConfigError::InvalidUrl {
                    url: call.uri.to_string(),
                    reason: e.to_string(),
                })
            })
    }

    /// Decompress the final response and reject an empty entity
    pub(crate) fn complete(raw: RawResponse) -> Result<RawResponse, ClientError> {
        let raw = decompress(raw)?;
        if raw.body().is_empty() {
            return Err(ProtocolError::MissingBody.into());
        }
        Ok(raw)
    }

    /// Decode a completed response
    pub(crate) fn decode<D: ResponseDecoder>(
        raw: &RawResponse,
        decoder: &D,
    ) -> Result<D::Output, ClientError> {
        decoder.decode(raw)?.map_err(ClientError::Application)
    }

    /// Decompress, check and decode the final response
    pub(crate) fn finish<D: ResponseDecoder>(
        raw: RawResponse,
        decoder: &D,
    ) -> Result<D::Output, ClientError> {
        let raw = Self::complete(raw)?;
        Self::decode(&raw, decoder)
    }

    /// Error for a 5xx the retry policy gave up on
    ///
    /// The response is kept; its body is inflated when that succeeds.
    pub(crate) fn server_error(raw: RawResponse, attempts: u32) -> ClientError {
        let retry_after = retry_after_secs(raw.headers());
        let response = decompress(raw.clone()).unwrap_or(raw);
        ClientError::Server {
            status: response.status(),
            attempts,
            retry_after,
            response: Box::new(response),
        }
    }

    /// Error for a transport failure the retry policy gave up on
    pub(crate) fn transport_error(err: TransportError) -> ClientError {
        if err.kind() == TransportErrorKind::Closed {
            ClientError::ServiceClosed
        } else {
            ClientError::Transport(err)
        }
    }
}

fn parse_service_url(raw: &str) -> Result<Url, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: raw.to_owned(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| invalid(e.to_string()))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(invalid(format!("unsupported scheme '{}'", url.scheme())));
    }
    if url.host_str().is_none_or(str::is_empty) {
        return Err(invalid("missing host".to_owned()));
    }
    Ok(url)
}
