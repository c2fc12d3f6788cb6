//! Per-endpoint request handling.
//!
//! An [`EndpointHandler`] is assembled once per endpoint at snapshot-build
//! time: the composed proxy tree, the compiled rate limiter and the metric
//! flags all live for the lifetime of one route-table snapshot. At request
//! time it parses the client request into a pipeline request (path params,
//! filtered query and headers), enforces the rate limit, runs the proxy tree
//! under the endpoint deadline and renders the merged response.
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Duration};

use axum::{
    body::Body,
    extract::ConnectInfo,
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    response::Response,
};
use bytes::Bytes;
use serde_json::Value;

use crate::{
    config::models::{Encoding, EndpointConfig},
    core::{
        formatter::COLLECTION_KEY,
        pipeline::{PipelineError, PipelineRequest, PipelineResponse, Proxy},
        sharded::ShardedCache,
        token_bucket::TokenBucket,
    },
    metrics::{self, MetricsFlags},
};

/// Middleware namespace carrying rate-limit settings.
pub const RATELIMIT_MW_NAMESPACE: &str = "mw-ratelimit";

/// Marks whether every required backend contributed to the response.
pub const COMPLETED_HEADER: &str = "x-conflux-completed";
/// Joined backend error messages, set only on incomplete responses.
pub const MESSAGES_HEADER: &str = "x-conflux-messages";

const MAX_BODY_BYTES: usize = 8 * 1024 * 1024;

/// Endpoint-scoped rate limiter: one bucket for the whole endpoint, or one
/// bucket per client IP held in the sharded cache.
pub enum EndpointRateLimiter {
    Global(Arc<TokenBucket>),
    PerClient {
        cache: Arc<ShardedCache<Arc<TokenBucket>>>,
        rate: f64,
        burst: i64,
    },
}

impl EndpointRateLimiter {
    /// Read `mw-ratelimit: {rate, burst, strategy}` from an endpoint's
    /// middleware block. A missing or non-positive rate disables limiting.
    pub fn from_endpoint(endpoint: &EndpointConfig) -> Option<Self> {
        let mw = endpoint.middleware.get(RATELIMIT_MW_NAMESPACE)?;
        let rate = parse_rate(mw.get("rate")?)?;
        if rate <= 0.0 {
            return None;
        }
        let burst = mw.get("burst").and_then(|v| v.as_i64()).unwrap_or(1).max(1);
        let per_client = mw
            .get("strategy")
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.eq_ignore_ascii_case("ip"));

        Some(if per_client {
            Self::PerClient {
                cache: ShardedCache::with_config(
                    crate::core::sharded::DEFAULT_SHARDS,
                    Duration::from_secs(10 * 60),
                ),
                rate,
                burst,
            }
        } else {
            Self::Global(Arc::new(TokenBucket::with_rate(rate, burst)))
        })
    }

    /// Non-blocking permit check.
    pub fn allow(&self, client: Option<SocketAddr>) -> bool {
        match self {
            Self::Global(bucket) => bucket.take_available(1) > 0,
            Self::PerClient { cache, rate, burst } => {
                let key = client
                    .map(|addr| addr.ip().to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                let bucket =
                    cache.load(&key, || Arc::new(TokenBucket::with_rate(*rate, *burst)));
                bucket.take_available(1) > 0
            }
        }
    }
}

/// Accept `rate: 100` (per second) or `rate: "2/s"`, `"300/m"`, `"1000/h"`.
fn parse_rate(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    let text = value.as_str()?;
    let (count, unit) = text.split_once('/')?;
    let count: f64 = count.trim().parse().ok()?;
    let per_second = match unit.trim() {
        "s" | "sec" => count,
        "m" | "min" => count / 60.0,
        "h" | "hour" => count / 3600.0,
        _ => return None,
    };
    Some(per_second)
}

/// Request handler for one endpoint, assembled at snapshot-build time.
pub struct EndpointHandler {
    endpoint: Arc<EndpointConfig>,
    proxy: Proxy,
    limiter: Option<EndpointRateLimiter>,
    metrics_flags: MetricsFlags,
}

impl EndpointHandler {
    pub fn new(endpoint: Arc<EndpointConfig>, proxy: Proxy) -> Self {
        let limiter = EndpointRateLimiter::from_endpoint(&endpoint);
        let metrics_flags = MetricsFlags::from_middleware(&endpoint.middleware);
        Self {
            endpoint,
            proxy,
            limiter,
            metrics_flags,
        }
    }

    pub fn endpoint(&self) -> &EndpointConfig {
        &self.endpoint
    }

    /// Serve one client request end to end.
    pub async fn handle(
        self: Arc<Self>,
        path_params: HashMap<String, String>,
        request: axum::extract::Request,
    ) -> Response {
        let started = std::time::Instant::now();
        let method = request.method().to_string();

        if self.metrics_flags.router_enabled {
            metrics::adjust_active_requests(1);
        }

        let response = self.serve(path_params, request).await;

        if self.metrics_flags.router_enabled {
            metrics::adjust_active_requests(-1);
            metrics::increment_request_total(
                &self.endpoint.endpoint,
                &method,
                response.status().as_u16(),
            );
            metrics::record_request_duration(&self.endpoint.endpoint, &method, started.elapsed());
        }

        response
    }

    async fn serve(
        &self,
        path_params: HashMap<String, String>,
        request: axum::extract::Request,
    ) -> Response {
        let client_addr = request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|info| info.0);

        if let Some(limiter) = &self.limiter {
            if !limiter.allow(client_addr) {
                return error_response(
                    StatusCode::TOO_MANY_REQUESTS,
                    "RATE_LIMIT_EXCEEDED",
                    "Too many requests",
                );
            }
        }

        let pipeline_request = match self.parse_request(path_params, request).await {
            Ok(req) => req,
            Err(response) => return response,
        };

        // The merger runs under 0.85x of this; the remainder covers rendering.
        let deadline = self.endpoint.resolved_timeout();
        let result = match tokio::time::timeout(deadline, (self.proxy)(pipeline_request)).await {
            Ok(result) => result,
            Err(_) => Err(PipelineError::DeadlineExceeded),
        };

        match result {
            Ok(response) => self.render(response),
            Err(error) => self.render_error(error),
        }
    }

    /// Build the pipeline request: path params from the route match, query
    /// and headers filtered by the endpoint's except lists, buffered body.
    async fn parse_request(
        &self,
        path_params: HashMap<String, String>,
        request: axum::extract::Request,
    ) -> Result<PipelineRequest, Response> {
        let (parts, body) = request.into_parts();

        let query: Vec<(String, String)> = parts
            .uri
            .query()
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .filter(|(key, _)| {
                        !self
                            .endpoint
                            .except_querystrings
                            .iter()
                            .any(|except| except.eq_ignore_ascii_case(key))
                    })
                    .map(|(k, v)| (k.into_owned(), v.into_owned()))
                    .collect()
            })
            .unwrap_or_default();

        let mut headers = HeaderMap::with_capacity(parts.headers.len());
        for (name, value) in &parts.headers {
            let excluded = *name == header::HOST
                || *name == header::CONTENT_LENGTH
                || self
                    .endpoint
                    .except_headers
                    .iter()
                    .any(|except| except.eq_ignore_ascii_case(name.as_str()));
            if !excluded {
                headers.append(name.clone(), value.clone());
            }
        }

        let body = match axum::body::to_bytes(body, MAX_BODY_BYTES).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::warn!(error = %e, "failed to read request body");
                return Err(error_response(
                    StatusCode::BAD_REQUEST,
                    "INVALID_BODY",
                    "Could not read request body",
                ));
            }
        };

        Ok(PipelineRequest {
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
            params: path_params,
            query,
            headers,
            body,
            is_bypass: self.endpoint.is_bypass,
        })
    }

    /// Encode the pipeline response per the endpoint's output encoding and
    /// attach the completion headers.
    fn render(&self, response: PipelineResponse) -> Response {
        // Bypass and no-op flows stream the upstream bytes through untouched.
        if let Some(raw) = response.io {
            let status = response
                .metadata
                .status_code
                .and_then(|code| StatusCode::from_u16(code).ok())
                .unwrap_or(StatusCode::OK);
            let mut builder = Response::builder().status(status);
            if let Some(headers) = builder.headers_mut() {
                headers.extend(response.metadata.headers.clone());
            }
            let mut rendered = builder
                .body(Body::from(raw))
                .unwrap_or_else(|_| fallback_error());
            set_completion_headers(&mut rendered, response.is_complete, &response.errors);
            return rendered;
        }

        let status = response
            .metadata
            .status_code
            .and_then(|code| StatusCode::from_u16(code).ok())
            .unwrap_or(if response.is_complete {
                StatusCode::OK
            } else {
                StatusCode::INTERNAL_SERVER_ERROR
            });

        let (content_type, body) = match self.encode_body(&response) {
            Ok(rendered) => rendered,
            Err(message) => {
                tracing::error!(error = %message, "response encoding failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "ENCODING_FAILED",
                    "Could not encode the response",
                );
            }
        };

        let mut rendered = Response::builder()
            .status(status)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap_or_else(|_| fallback_error());
        set_completion_headers(&mut rendered, response.is_complete, &response.errors);
        rendered
    }

    fn encode_body(&self, response: &PipelineResponse) -> Result<(&'static str, Bytes), String> {
        let root = self.render_root(response);
        match self.endpoint.output_encoding {
            Encoding::Json | Encoding::Noop => {
                let body = serde_json::to_vec(&root).map_err(|e| e.to_string())?;
                Ok(("application/json; charset=utf-8", Bytes::from(body)))
            }
            Encoding::Xml => {
                let body = quick_xml::se::to_string_with_root("response", &root)
                    .map_err(|e| e.to_string())?;
                Ok(("application/xml; charset=utf-8", Bytes::from(body)))
            }
            Encoding::String => {
                let text = match &root {
                    Value::Object(map) => match map.get("content") {
                        Some(Value::String(s)) => s.clone(),
                        _ => root.to_string(),
                    },
                    other => other.to_string(),
                };
                Ok(("text/plain; charset=utf-8", Bytes::from(text)))
            }
        }
    }

    /// Unwrap single-backend collections configured to render as a bare
    /// array; everything else renders the object form.
    fn render_root(&self, response: &PipelineResponse) -> Value {
        if let [backend] = self.endpoint.backend.as_slice() {
            if backend.is_collection && !backend.wrap_collection_to_json {
                if let Some(collection) = response.data.get(COLLECTION_KEY) {
                    return collection.clone();
                }
            }
        }
        Value::Object(response.data.clone())
    }

    fn render_error(&self, error: PipelineError) -> Response {
        let (status, code) = match &error {
            PipelineError::DeadlineExceeded => (StatusCode::GATEWAY_TIMEOUT, "GATEWAY_TIMEOUT"),
            PipelineError::RateLimitExceeded => {
                (StatusCode::SERVICE_UNAVAILABLE, "BACKEND_RATE_LIMIT")
            }
            PipelineError::Upstream(_) | PipelineError::Merge { .. } => {
                (StatusCode::BAD_GATEWAY, "BACKEND_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "PIPELINE_ERROR"),
        };

        tracing::warn!(
            endpoint = %self.endpoint.endpoint,
            error = %error,
            status = status.as_u16(),
            "pipeline failed"
        );

        let mut response = error_response(status, code, &error.to_string());
        set_completion_headers(&mut response, false, &[error.to_string()]);
        response
    }
}

fn set_completion_headers(response: &mut Response, is_complete: bool, errors: &[String]) {
    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static(COMPLETED_HEADER),
        HeaderValue::from_static(if is_complete { "true" } else { "false" }),
    );
    if !is_complete && !errors.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&errors.join("; ").replace(['\r', '\n'], " ")) {
            headers.insert(HeaderName::from_static(MESSAGES_HEADER), value);
        }
    }
}

/// Gateway-originated JSON error body.
pub fn error_response(status: StatusCode, code: &str, message: &str) -> Response {
    let body = serde_json::json!({"code": code, "message": message});
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json; charset=utf-8")
        .body(Body::from(body.to_string()))
        .unwrap_or_else(|_| fallback_error())
}

fn fallback_error() -> Response {
    let mut response = Response::new(Body::from("internal error"));
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}
