//! TLS and connector setup for the connection pool.
//!
//! Native root certificates are loaded from the OS store once per process and
//! cached; the lookup can be slow on some platforms.

use crate::config::TlsRootConfig;
use crate::error::ConfigError;
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use rustls_pki_types::CertificateDer;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

/// Cached native root certificates. Empty means none were found.
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

fn load_native_certs() -> Vec<CertificateDer<'static>> {
    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }
    result.certs
}

/// Native root certificates, loaded on first use
fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE.get_or_init(load_native_certs).as_slice()
}

/// Globally installed crypto provider, or aws-lc-rs without installing it
fn crypto_provider() -> Arc<rustls::crypto::CryptoProvider> {
    rustls::crypto::CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn native_roots_client_config() -> Result<rustls::ClientConfig, ConfigError> {
    let certs = native_root_certs();
    if certs.is_empty() {
        return Err(ConfigError::Tls(
            "no native root CA certificates found in OS certificate store".into(),
        ));
    }

    let mut root_store = rustls::RootCertStore::empty();
    let (added, ignored) = root_store.add_parsable_certificates(certs.iter().cloned());
    if ignored > 0 {
        tracing::warn!(added, ignored, "some native root certificates could not be parsed");
    }
    if added == 0 {
        return Err(ConfigError::Tls(
            format!("none of the {} native root certificates could be parsed", certs.len()).into(),
        ));
    }

    let config = rustls::ClientConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| ConfigError::Tls(Box::new(e)))?
        .with_root_certificates(root_store)
        .with_no_client_auth();
    Ok(config)
}

/// Build the HTTP/1.1 connector used for every pooled connection
///
/// Both `http` and `https` service URLs are accepted; the Idilia endpoint is
/// plain HTTP by default.
///
/// # Errors
/// Returns `ConfigError::Tls` if the TLS client configuration cannot be built
pub fn build_connector(
    tls_roots: TlsRootConfig,
    connect_timeout: Option<Duration>,
) -> Result<HttpsConnector<HttpConnector>, ConfigError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);
    http.set_connect_timeout(connect_timeout);

    let connector = match tls_roots {
        TlsRootConfig::WebPki => hyper_rustls::HttpsConnectorBuilder::new()
            .with_provider_and_webpki_roots(crypto_provider())
            .map_err(|e| ConfigError::Tls(Box::new(e)))?
            .https_or_http()
            .enable_http1()
            .wrap_connector(http),
        TlsRootConfig::Native => hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(native_roots_client_config()?)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http),
    };
    Ok(connector)
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_native_roots_cached() {
        let first = native_root_certs();
        let second = native_root_certs();
        assert!(std::ptr::eq(first, second), "should return the cached slice");
    }

    #[test]
    fn test_webpki_connector_builds() {
        assert!(build_connector(TlsRootConfig::WebPki, Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn test_native_connector_does_not_panic() {
        // Minimal containers may have no OS certificates; only Err is acceptable then
        if let Err(err) = build_connector(TlsRootConfig::Native, None) {
            assert!(matches!(err, ConfigError::Tls(_)));
        }
    }
}
