//! Proxy composition: the per-backend call pipeline.
//!
//! A [`Proxy`] is an async function from a pipeline request to a pipeline
//! response. Backend proxies wrap the HTTP executor with status
//! classification, body decoding and entity formatting; call chains compose
//! proxies with request rewriting, per-backend rate limiting and (for
//! multi-backend endpoints) the merger.
use std::{collections::HashMap, sync::Arc, time::Duration};

use bytes::Bytes;
use futures_util::future::BoxFuture;
use http::HeaderMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    adapters::{
        encoding::{DecodeError, decode_body},
        status::{StatusError, StatusPolicy, classify},
    },
    config::models::{BackendConfig, Encoding, EndpointConfig},
    core::{
        balancer::{self, Balancer, BalancerError},
        formatter::EntityFormatter,
        merger,
        token_bucket::TokenBucket,
    },
    metrics,
    ports::http_client::{ExecutorError, HttpRequestExecutor},
};

/// Substitutable segments: `{param}` path placeholders and `{{.Key}}`
/// back-references injected by the sequential merger.
static PARAM_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{([\w-]+)\}").expect("valid param pattern"));
static BACKREF_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\.([\w\.\-]+)\}\}").expect("valid backref pattern"));

/// A request flowing through one pipeline invocation. `Clone` yields a deep
/// copy that is safe to mutate per backend.
#[derive(Debug, Clone)]
pub struct PipelineRequest {
    pub method: String,
    /// Path sent upstream. Starts as the client path; the request rewriter
    /// replaces it with the backend's resolved URL pattern.
    pub path: String,
    /// Path parameters plus back-reference values (`Resp<i>_<field>`).
    pub params: HashMap<String, String>,
    /// Query parameters after `except_querystrings` filtering.
    pub query: Vec<(String, String)>,
    /// Headers after `except_headers` filtering.
    pub headers: HeaderMap,
    pub body: Bytes,
    pub is_bypass: bool,
}

impl PipelineRequest {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            params: HashMap::new(),
            query: Vec::new(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            is_bypass: false,
        }
    }
}

/// Response metadata surfaced to the renderer.
#[derive(Debug, Clone, Default)]
pub struct Metadata {
    /// Status chosen by the pipeline; `None` lets the renderer pick the
    /// default (200 complete, 500 incomplete).
    pub status_code: Option<u16>,
    pub headers: HeaderMap,
    pub message: String,
}

/// A decoded (or raw, for bypass/no-op) backend response.
#[derive(Debug, Clone)]
pub struct PipelineResponse {
    pub data: Map<String, Value>,
    /// False when any contributing backend failed or returned partial data.
    pub is_complete: bool,
    pub metadata: Metadata,
    /// Raw body for bypass / no-op flows; skips rendering entirely.
    pub io: Option<Bytes>,
    /// Messages from backends that failed but still left usable output.
    pub errors: Vec<String>,
}

impl PipelineResponse {
    pub fn with_data(data: Map<String, Value>) -> Self {
        Self {
            data,
            is_complete: true,
            metadata: Metadata::default(),
            io: None,
            errors: Vec::new(),
        }
    }

    pub fn raw(status: u16, headers: HeaderMap, body: Bytes, is_complete: bool) -> Self {
        Self {
            data: Map::new(),
            is_complete,
            metadata: Metadata {
                status_code: Some(status),
                headers,
                message: String::new(),
            },
            io: Some(body),
            errors: Vec::new(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum PipelineError {
    #[error("endpoint has no backends")]
    NoBackends,

    #[error("not enough proxies for the call chain")]
    NotEnoughProxies,

    #[error("too many proxies for this call chain")]
    TooManyProxies,

    #[error("invalid response")]
    NullResult,

    #[error("missing URL parameter '{0}'")]
    MissingParam(String),

    #[error("backend call exceeded its deadline")]
    DeadlineExceeded,

    #[error("backend rate limit exceeded")]
    RateLimitExceeded,

    #[error("invalid upstream target: {0}")]
    InvalidTarget(String),

    #[error(transparent)]
    Balancer(#[from] BalancerError),

    #[error(transparent)]
    Upstream(#[from] ExecutorError),

    #[error(transparent)]
    UpstreamStatus(#[from] StatusError),

    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("merge produced no usable data: {}", messages.join("; "))]
    Merge { messages: Vec<String> },
}

pub type ProxyResult = Result<PipelineResponse, PipelineError>;

/// An async request → response function, cheaply cloneable and shared across
/// request workers.
pub type Proxy = Arc<dyn Fn(PipelineRequest) -> BoxFuture<'static, ProxyResult> + Send + Sync>;

/// A composition step: takes the inner proxies and yields the wrapped proxy.
pub type CallChain = Box<dyn Fn(Vec<Proxy>) -> Result<Proxy, PipelineError> + Send + Sync>;

/// Substitute `{{.Key}}` back-references and `{param}` placeholders in a URL
/// pattern. Unknown back-references stay in place (and are logged); a missing
/// `{param}` is an error.
pub fn generate_path(
    pattern: &str,
    params: &HashMap<String, String>,
) -> Result<String, PipelineError> {
    let mut path = String::with_capacity(pattern.len());
    let mut last = 0;
    for caps in BACKREF_PATTERN.captures_iter(pattern) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        path.push_str(&pattern[last..whole.start()]);
        match params.get(key) {
            Some(value) => path.push_str(value),
            None => {
                tracing::warn!(placeholder = key, pattern, "unresolved back-reference");
                path.push_str(whole.as_str());
            }
        }
        last = whole.end();
    }
    path.push_str(&pattern[last..]);

    let mut out = String::with_capacity(path.len());
    let mut last = 0;
    for caps in PARAM_PATTERN.captures_iter(&path) {
        let whole = caps.get(0).expect("capture 0 always present");
        let key = &caps[1];
        let value = params
            .get(key)
            .ok_or_else(|| PipelineError::MissingParam(key.to_string()))?;
        out.push_str(&path[last..whole.start()]);
        out.push_str(value);
        last = whole.end();
    }
    out.push_str(&path[last..]);
    Ok(out)
}

/// Rewriter chain: before the inner proxy runs, clone the request and (unless
/// bypassing) swap in the backend's method and resolved URL pattern.
pub fn new_request_builder_chain(backend: &BackendConfig) -> CallChain {
    let method = backend.method.clone();
    let pattern = backend.url_pattern.clone();
    Box::new(move |mut next: Vec<Proxy>| {
        if next.len() > 1 {
            return Err(PipelineError::TooManyProxies);
        }
        let inner = next.pop().ok_or(PipelineError::NotEnoughProxies)?;
        let method = method.clone();
        let pattern = pattern.clone();
        Ok(Arc::new(move |req: PipelineRequest| {
            let inner = inner.clone();
            let method = method.clone();
            let pattern = pattern.clone();
            Box::pin(async move {
                let mut r = req.clone();
                if !req.is_bypass {
                    r.path = generate_path(&pattern, &r.params)?;
                    r.method = method;
                }
                inner(r).await
            })
        }))
    })
}

/// Backend rate-limit chain (`mw-ratelimit` on the backend): a token bucket
/// shared by every call through this backend.
pub fn new_backend_ratelimit_chain(rate: f64, capacity: i64) -> CallChain {
    let bucket = Arc::new(TokenBucket::with_rate(rate, capacity.max(1)));
    Box::new(move |mut next: Vec<Proxy>| {
        if next.len() > 1 {
            return Err(PipelineError::TooManyProxies);
        }
        let inner = next.pop().ok_or(PipelineError::NotEnoughProxies)?;
        let bucket = bucket.clone();
        Ok(Arc::new(move |req: PipelineRequest| {
            let inner = inner.clone();
            let bucket = bucket.clone();
            Box::pin(async move {
                if bucket.take_available(1) == 0 {
                    return Err(PipelineError::RateLimitExceeded);
                }
                inner(req).await
            })
        }))
    })
}

/// The innermost proxy: one upstream HTTP call plus classification, decoding
/// and entity formatting.
pub fn new_http_proxy(
    backend: &BackendConfig,
    executor: Arc<dyn HttpRequestExecutor>,
    emit_metrics: bool,
) -> Proxy {
    let targets = balancer::targets_from_hosts(&backend.hosts, &backend.weights);
    let balancer: Arc<dyn Balancer> = Arc::from(balancer::for_targets(backend.balancing, &targets));
    let targets = Arc::new(targets);
    let policy = StatusPolicy::from_backend(backend);
    let formatter = Arc::new(EntityFormatter::from_backend(backend));
    let encoding = backend.resolved_encoding();
    let is_collection = backend.is_collection;
    let timeout = backend.resolved_timeout();

    Arc::new(move |req: PipelineRequest| {
        let executor = executor.clone();
        let balancer = balancer.clone();
        let targets = targets.clone();
        let policy = policy.clone();
        let formatter = formatter.clone();
        Box::pin(async move {
            let target = balancer.elect(&targets)?;
            let response = execute_backend_call(
                &*executor,
                &target.host,
                &req,
                timeout,
                emit_metrics,
            )
            .await?;

            // Raw passthrough: no classification, no decoding, no formatting.
            if encoding == Encoding::Noop || req.is_bypass {
                let (parts, body) = response.into_parts();
                return Ok(PipelineResponse::raw(
                    parts.status.as_u16(),
                    parts.headers,
                    body,
                    parts.status.is_success(),
                ));
            }

            if let Err(status_error) = classify(&policy, &response, &req.path) {
                if policy.is_detailed() {
                    // Forward the upstream's error payload instead of failing
                    // the call.
                    let name = status_error.name.clone().unwrap_or_default();
                    let mut data = Map::new();
                    data.insert(
                        format!("error_{name}"),
                        serde_json::to_value(&status_error).unwrap_or(Value::Null),
                    );
                    return Ok(PipelineResponse {
                        data,
                        is_complete: false,
                        metadata: Metadata {
                            status_code: Some(status_error.code),
                            headers: HeaderMap::new(),
                            message: status_error.to_string(),
                        },
                        io: None,
                        errors: vec![status_error.to_string()],
                    });
                }
                return Err(status_error.into());
            }

            let decoded = decode_body(encoding, response.body(), is_collection)?;
            let data = if formatter.is_identity() {
                decoded
            } else {
                formatter.format(decoded)
            };
            Ok(PipelineResponse::with_data(data))
        })
    })
}

async fn execute_backend_call(
    executor: &dyn HttpRequestExecutor,
    host: &str,
    req: &PipelineRequest,
    timeout: Duration,
    emit_metrics: bool,
) -> Result<http::Response<Bytes>, PipelineError> {
    let uri = build_target_uri(host, &req.path, &req.query)?;
    let method = http::Method::from_bytes(req.method.as_bytes())
        .map_err(|e| PipelineError::InvalidTarget(format!("method '{}': {e}", req.method)))?;

    let mut builder = http::Request::builder().method(method.clone()).uri(&uri);
    if let Some(headers) = builder.headers_mut() {
        headers.extend(req.headers.clone());
    }
    let request = builder
        .body(req.body.clone())
        .map_err(|e| PipelineError::InvalidTarget(e.to_string()))?;

    let span = crate::tracing_setup::create_backend_span(host, method.as_str(), &req.path);

    let started = std::time::Instant::now();
    let result = {
        use tracing::Instrument;
        tokio::time::timeout(timeout, executor.execute(request))
            .instrument(span.clone())
            .await
    };
    let elapsed = started.elapsed();

    match result {
        Ok(Ok(response)) => {
            span.record("http.status_code", response.status().as_u16());
            if emit_metrics {
                metrics::increment_backend_request_total(
                    host,
                    &req.path,
                    method.as_str(),
                    response.status().as_u16(),
                );
                metrics::record_backend_request_duration(host, &req.path, elapsed);
            }
            Ok(response)
        }
        Ok(Err(e)) => {
            tracing::warn!(backend = host, error = %e, "backend call failed");
            if emit_metrics {
                metrics::increment_backend_request_total(host, &req.path, method.as_str(), 599);
            }
            Err(e.into())
        }
        Err(_) => {
            tracing::warn!(backend = host, ?timeout, "backend call timed out");
            if emit_metrics {
                metrics::increment_backend_request_total(host, &req.path, method.as_str(), 504);
            }
            Err(PipelineError::DeadlineExceeded)
        }
    }
}

fn build_target_uri(
    host: &str,
    path: &str,
    query: &[(String, String)],
) -> Result<String, PipelineError> {
    let base = host.trim_end_matches('/');
    if !base.starts_with("http://") && !base.starts_with("https://") {
        return Err(PipelineError::InvalidTarget(format!(
            "host '{host}' is not an absolute http(s) URL"
        )));
    }
    let mut uri = format!("{base}{path}");
    if !query.is_empty() {
        let encoded = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .finish();
        // The resolved pattern may already carry its own query string.
        uri.push(if uri.contains('?') { '&' } else { '?' });
        uri.push_str(&encoded);
    }
    Ok(uri)
}

/// Assembles complete endpoint proxies from validated endpoint configs.
pub struct ProxyFactory {
    executor: Arc<dyn HttpRequestExecutor>,
}

impl ProxyFactory {
    pub fn new(executor: Arc<dyn HttpRequestExecutor>) -> Self {
        Self { executor }
    }

    /// Build the composed proxy tree for one endpoint: per-backend pipelines
    /// (rewriter → optional rate limit → HTTP call) joined by the merger when
    /// more than one backend contributes.
    pub fn endpoint_proxy(&self, endpoint: &EndpointConfig) -> Result<Proxy, PipelineError> {
        if endpoint.backend.is_empty() {
            return Err(PipelineError::NoBackends);
        }

        let flags = metrics::MetricsFlags::from_middleware(&endpoint.middleware);

        let mut proxies = Vec::with_capacity(endpoint.backend.len());
        for backend in &endpoint.backend {
            let mut proxy = new_http_proxy(backend, self.executor.clone(), flags.backend_enabled);

            if let Some((rate, burst)) = backend_ratelimit(backend) {
                proxy = new_backend_ratelimit_chain(rate, burst)(vec![proxy])?;
            }

            proxy = new_request_builder_chain(backend)(vec![proxy])?;
            proxies.push(proxy);
        }

        merger::new_merge_chain(endpoint)(proxies)
    }
}

/// Read `mw-ratelimit: {rate, burst}` from a backend's middleware block.
fn backend_ratelimit(backend: &BackendConfig) -> Option<(f64, i64)> {
    let mw = backend.middleware.get(crate::adapters::handler::RATELIMIT_MW_NAMESPACE)?;
    let rate = mw.get("rate")?.as_f64()?;
    if rate <= 0.0 {
        return None;
    }
    let burst = mw.get("burst").and_then(|v| v.as_i64()).unwrap_or(1);
    Some((rate, burst))
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::ports::http_client::ExecutorResult;

    struct StaticExecutor {
        status: u16,
        body: &'static [u8],
    }

    #[async_trait]
    impl HttpRequestExecutor for StaticExecutor {
        async fn execute(&self, _req: http::Request<Bytes>) -> ExecutorResult<http::Response<Bytes>> {
            Ok(http::Response::builder()
                .status(self.status)
                .body(Bytes::from_static(self.body))
                .unwrap())
        }
    }

    fn backend(yaml: &str) -> BackendConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn generate_path_substitutes_params() {
        let mut params = HashMap::new();
        params.insert("id".to_string(), "42".to_string());
        params.insert("kind".to_string(), "user".to_string());
        let path = generate_path("/v1/{kind}/{id}", &params).unwrap();
        assert_eq!(path, "/v1/user/42");
    }

    #[test]
    fn generate_path_missing_param_is_an_error() {
        let err = generate_path("/v1/{id}", &HashMap::new()).unwrap_err();
        assert!(matches!(err, PipelineError::MissingParam(p) if p == "id"));
    }

    #[test]
    fn generate_path_substitutes_backrefs() {
        let mut params = HashMap::new();
        params.insert("Resp0_token".to_string(), "abc".to_string());
        let path = generate_path("/data?t={{.Resp0_token}}", &params).unwrap();
        assert_eq!(path, "/data?t=abc");
    }

    #[test]
    fn generate_path_leaves_unknown_backrefs() {
        let path = generate_path("/data?t={{.Resp0_token}}", &HashMap::new()).unwrap();
        assert_eq!(path, "/data?t={{.Resp0_token}}");
    }

    #[test]
    fn build_target_uri_appends_query() {
        let uri = build_target_uri(
            "http://svc:8080/",
            "/users",
            &[("a".to_string(), "1".to_string()), ("b".to_string(), "x y".to_string())],
        )
        .unwrap();
        assert_eq!(uri, "http://svc:8080/users?a=1&b=x+y");
    }

    #[test]
    fn build_target_uri_rejects_relative_host() {
        assert!(build_target_uri("svc:8080", "/users", &[]).is_err());
    }

    #[tokio::test]
    async fn http_proxy_decodes_and_formats() {
        let b = backend(
            r#"
hosts: ["http://svc:1"]
url_pattern: /u
group: user
"#,
        );
        let proxy = new_http_proxy(
            &b,
            Arc::new(StaticExecutor {
                status: 200,
                body: br#"{"id": 7}"#,
            }),
            false,
        );

        let res = proxy(PipelineRequest::new("GET", "/u")).await.unwrap();
        assert!(res.is_complete);
        assert_eq!(Value::Object(res.data), json!({"user": {"id": 7}}));
    }

    #[tokio::test]
    async fn http_proxy_default_policy_errors_on_500() {
        let b = backend("hosts: [\"http://svc:1\"]\nurl_pattern: /u\n");
        let proxy = new_http_proxy(
            &b,
            Arc::new(StaticExecutor {
                status: 500,
                body: b"boom",
            }),
            false,
        );

        let err = proxy(PipelineRequest::new("GET", "/u")).await.unwrap_err();
        match err {
            PipelineError::UpstreamStatus(status) => {
                assert_eq!(status.code, 500);
                assert_eq!(status.body, "boom");
            }
            other => panic!("expected status error, got {other}"),
        }
    }

    #[tokio::test]
    async fn http_proxy_detailed_policy_forwards_error_payload() {
        let b = backend(
            r#"
hosts: ["http://svc:1"]
url_pattern: /u
middleware:
  mw-http:
    return_error_details: backend-a
"#,
        );
        let proxy = new_http_proxy(
            &b,
            Arc::new(StaticExecutor {
                status: 418,
                body: b"teapot",
            }),
            false,
        );

        let res = proxy(PipelineRequest::new("GET", "/u")).await.unwrap();
        assert!(!res.is_complete);
        assert_eq!(res.metadata.status_code, Some(418));
        assert!(res.data.contains_key("error_backend-a"));
    }

    #[tokio::test]
    async fn noop_encoding_returns_raw_body() {
        let b = backend("hosts: [\"http://svc:1\"]\nurl_pattern: /u\nencoding: no-op\n");
        let proxy = new_http_proxy(
            &b,
            Arc::new(StaticExecutor {
                status: 200,
                body: b"raw bytes",
            }),
            false,
        );

        let res = proxy(PipelineRequest::new("GET", "/u")).await.unwrap();
        assert_eq!(res.io.as_deref(), Some(&b"raw bytes"[..]));
        assert!(res.data.is_empty());
    }

    #[tokio::test]
    async fn rewriter_applies_method_and_pattern() {
        let b = backend("hosts: [\"http://svc:1\"]\nurl_pattern: /u/{id}\nmethod: POST\n");
        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_inner = seen.clone();
        let probe: Proxy = Arc::new(move |req| {
            let seen = seen_inner.clone();
            Box::pin(async move {
                *seen.lock().unwrap() = Some((req.method.clone(), req.path.clone()));
                Ok(PipelineResponse::with_data(Map::new()))
            })
        });

        let chained = new_request_builder_chain(&b)(vec![probe]).unwrap();
        let mut req = PipelineRequest::new("GET", "/users/42");
        req.params.insert("id".to_string(), "42".to_string());
        chained(req).await.unwrap();

        assert_eq!(
            seen.lock().unwrap().clone(),
            Some(("POST".to_string(), "/u/42".to_string()))
        );
    }

    #[tokio::test]
    async fn rewriter_rejects_multiple_proxies() {
        let b = backend("hosts: [\"http://svc:1\"]\nurl_pattern: /u\n");
        let noop: Proxy = Arc::new(|_| {
            Box::pin(async { Ok(PipelineResponse::with_data(Map::new())) })
        });
        let result = new_request_builder_chain(&b)(vec![noop.clone(), noop]);
        assert!(matches!(result, Err(PipelineError::TooManyProxies)));
    }

    #[tokio::test]
    async fn backend_ratelimit_chain_rejects_when_drained() {
        let inner: Proxy = Arc::new(|_| {
            Box::pin(async { Ok(PipelineResponse::with_data(Map::new())) })
        });
        let limited = new_backend_ratelimit_chain(1.0, 2)(vec![inner]).unwrap();

        assert!(limited(PipelineRequest::new("GET", "/x")).await.is_ok());
        assert!(limited(PipelineRequest::new("GET", "/x")).await.is_ok());
        let err = limited(PipelineRequest::new("GET", "/x")).await.unwrap_err();
        assert!(matches!(err, PipelineError::RateLimitExceeded));
    }
}
