//! Upstream HTTP executor backed by Hyper with Rustls (HTTP/1.1 + HTTP/2).
//!
//! Responsibilities:
//! * Shares one connection pool across all backends to the same host
//! * Sets the gateway User-Agent and the Host header
//! * Buffers response bodies for the decoding pipeline
//!
//! This adapter is intentionally minimal; retries and circuit breaking can be
//! layered on a different abstraction if required.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;
use http_body_util::{BodyExt, Full};
use hyper::{Request, Response, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{ExecutorError, ExecutorResult, HttpRequestExecutor};

const USER_AGENT: &str = concat!("Conflux-Gateway/", env!("CARGO_PKG_VERSION"));

/// Hyper-based executor shared by every backend proxy.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
}

impl HttpClientAdapter {
    /// Create the shared upstream client. Idle pooled connections are reaped
    /// after `idle_timeout`.
    pub fn new(idle_timeout: Duration) -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        for cert in native_certs.certs {
            if root_cert_store.add(cert).is_err() {
                tracing::warn!("Failed to add native certificate to rustls RootCertStore");
            }
        }
        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_http1()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(idle_timeout)
            .build::<_, Full<Bytes>>(https_connector);

        Ok(Self { client })
    }

    /// Inject the gateway identity and the Host header derived from the URI.
    fn prepare_headers(req: &mut Request<Full<Bytes>>) -> ExecutorResult<()> {
        let host_value = {
            let uri = req.uri();
            let host = uri.host().ok_or_else(|| {
                ExecutorError::InvalidRequest(format!("outgoing URI has no host: {uri}"))
            })?;
            let rendered = match uri.port() {
                Some(port) => format!("{host}:{}", port.as_u16()),
                None => host.to_string(),
            };
            HeaderValue::from_str(&rendered)
                .map_err(|e| ExecutorError::InvalidRequest(format!("invalid host header: {e}")))?
        };

        let headers = req.headers_mut();
        headers.insert(header::HOST, host_value);
        headers.insert(header::USER_AGENT, HeaderValue::from_static(USER_AGENT));
        Ok(())
    }
}

#[async_trait]
impl HttpRequestExecutor for HttpClientAdapter {
    async fn execute(&self, req: Request<Bytes>) -> ExecutorResult<Response<Bytes>> {
        let (parts, body) = req.into_parts();
        let mut outgoing = Request::from_parts(parts, Full::new(body));
        Self::prepare_headers(&mut outgoing)?;

        tracing::debug!(
            method = %outgoing.method(),
            uri = %outgoing.uri(),
            "sending backend request"
        );

        let response = self
            .client
            .request(outgoing)
            .await
            .map_err(|e| ExecutorError::ConnectionError(e.to_string()))?;

        let (mut parts, incoming) = response.into_parts();
        let body = incoming
            .collect()
            .await
            .map_err(|e| ExecutorError::ConnectionError(format!("reading body: {e}")))?
            .to_bytes();

        // The body is fully buffered; framing headers no longer apply.
        parts.headers.remove(header::TRANSFER_ENCODING);
        parts.headers.remove(header::CONTENT_LENGTH);

        Ok(Response::from_parts(parts, body))
    }
}
