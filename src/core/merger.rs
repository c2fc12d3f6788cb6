//! Composition of multiple backend proxies into one response.
//!
//! Endpoints with a single backend use its proxy directly. With more, the
//! `sequential` middleware flag selects between:
//!
//! * **Parallel** — every backend is called concurrently under a deadline of
//!   0.85 × the endpoint timeout; results are combined in configured backend
//!   order (later index wins on key conflicts).
//! * **Sequential** — backends run in configured order; the URL pattern of
//!   call i may reference fields of earlier responses with
//!   `{{.Resp<k>_<field>}}`, which are stringified and injected into the
//!   request's parameter map before the call.
//!
//! A merged response is complete only when every backend produced a complete
//! response; anything less surfaces as `is_complete = false` with the
//! collected error messages.
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::{
    config::models::EndpointConfig,
    core::pipeline::{CallChain, PipelineError, PipelineRequest, PipelineResponse, Proxy, ProxyResult},
};

/// Middleware namespace carrying the merger selection.
pub const PROXY_MW_NAMESPACE: &str = "mw-proxy";
const SEQUENTIAL_KEY: &str = "sequential";

/// Fan-out budget fraction of the endpoint timeout; the remainder is left
/// for rendering.
const MERGE_TIMEOUT_FRACTION: f64 = 0.85;

static MERGE_KEY_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{\{\.Resp(\d+)_([\w\.\-]+)\}\}").expect("valid merge key pattern"));

/// Incremental merge of backend results, in configured backend order.
struct MergeAccumulator {
    pending: usize,
    data: Option<PipelineResponse>,
    errs: Vec<String>,
}

impl MergeAccumulator {
    fn new(backend_count: usize) -> Self {
        Self {
            pending: backend_count,
            data: None,
            errs: Vec::new(),
        }
    }

    fn merge(&mut self, result: ProxyResult) {
        self.pending = self.pending.saturating_sub(1);
        match result {
            Err(e) => {
                self.errs.push(e.to_string());
                if let Some(data) = &mut self.data {
                    data.is_complete = false;
                }
            }
            Ok(response) => {
                self.errs.extend(response.errors.iter().cloned());
                match &mut self.data {
                    None => self.data = Some(response),
                    Some(merged) => combine(merged, response),
                }
            }
        }
    }

    fn result(self) -> ProxyResult {
        match self.data {
            None => Err(PipelineError::Merge {
                messages: if self.errs.is_empty() {
                    vec!["invalid response".to_string()]
                } else {
                    self.errs
                },
            }),
            Some(mut response) => {
                if self.pending != 0 || !self.errs.is_empty() {
                    response.is_complete = false;
                }
                response.errors = self.errs;
                Ok(response)
            }
        }
    }
}

/// Merge `next` into `merged`: top-level fields of later backends overwrite
/// earlier ones; completeness is conjunctive; the strongest status sticks.
fn combine(merged: &mut PipelineResponse, next: PipelineResponse) {
    merged.is_complete = merged.is_complete && next.is_complete;
    for (key, value) in next.data {
        merged.data.insert(key, value);
    }
    if merged.metadata.status_code.is_none() {
        merged.metadata.status_code = next.metadata.status_code;
    }
    if merged.metadata.message.is_empty() {
        merged.metadata.message = next.metadata.message;
    }
}

/// Build the merging chain for an endpoint. Single-backend endpoints get an
/// identity chain; multi-backend endpoints get the parallel or sequential
/// merger.
pub fn new_merge_chain(endpoint: &EndpointConfig) -> CallChain {
    let total_backends = endpoint.backend.len();
    let merge_timeout = endpoint.resolved_timeout().mul_f64(MERGE_TIMEOUT_FRACTION);
    let sequential = is_sequential(endpoint);
    let patterns: Vec<String> = endpoint
        .backend
        .iter()
        .map(|b| b.url_pattern.clone())
        .collect();

    Box::new(move |next: Vec<Proxy>| {
        if total_backends == 0 {
            return Err(PipelineError::NoBackends);
        }
        if next.len() != total_backends {
            return Err(PipelineError::NotEnoughProxies);
        }
        if total_backends == 1 {
            return Ok(next.into_iter().next().expect("one proxy"));
        }

        if sequential {
            Ok(sequential_merge(patterns.clone(), merge_timeout, next))
        } else {
            Ok(parallel_merge(merge_timeout, next))
        }
    })
}

fn is_sequential(endpoint: &EndpointConfig) -> bool {
    endpoint
        .middleware
        .get(PROXY_MW_NAMESPACE)
        .and_then(|mw| mw.get(SEQUENTIAL_KEY))
        .and_then(|v| v.as_bool())
        .unwrap_or(false)
}

/// Call every backend concurrently; combine results in backend index order.
fn parallel_merge(timeout: Duration, next: Vec<Proxy>) -> Proxy {
    let next = Arc::new(next);
    Arc::new(move |req: PipelineRequest| {
        let next = next.clone();
        Box::pin(async move {
            let total = next.len();
            let (tx, mut rx) = tokio::sync::mpsc::channel::<(usize, ProxyResult)>(total);

            for (index, proxy) in next.iter().enumerate() {
                let proxy = proxy.clone();
                let req = req.clone();
                let tx = tx.clone();
                tokio::spawn(async move {
                    let result = proxy(req).await;
                    let _ = tx.send((index, result)).await;
                });
            }
            drop(tx);

            let mut slots: Vec<Option<ProxyResult>> = (0..total).map(|_| None).collect();
            let deadline = Instant::now() + timeout;
            let mut received = 0;
            while received < total {
                let remaining = deadline.saturating_duration_since(Instant::now());
                match tokio::time::timeout(remaining, rx.recv()).await {
                    Ok(Some((index, result))) => {
                        slots[index] = Some(result);
                        received += 1;
                    }
                    Ok(None) => break,
                    Err(_) => break, // deadline fired; pending calls count as errors
                }
            }

            let mut acc = MergeAccumulator::new(total);
            for slot in slots {
                acc.merge(slot.unwrap_or(Err(PipelineError::DeadlineExceeded)));
            }
            acc.result()
        })
    })
}

/// Call backends in configured order, feeding earlier responses into later
/// URL patterns via `{{.Resp<k>_<field>}}` back-references.
fn sequential_merge(patterns: Vec<String>, timeout: Duration, next: Vec<Proxy>) -> Proxy {
    let next = Arc::new(next);
    let patterns = Arc::new(patterns);
    Arc::new(move |req: PipelineRequest| {
        let next = next.clone();
        let patterns = patterns.clone();
        Box::pin(async move {
            let total = next.len();
            let deadline = Instant::now() + timeout;
            let mut parts: Vec<Option<PipelineResponse>> = (0..total).map(|_| None).collect();
            let mut acc = MergeAccumulator::new(total);
            let mut req = req;

            for (i, proxy) in next.iter().enumerate() {
                if i > 0 {
                    inject_backrefs(&mut req, &patterns[i], i, &parts);
                }

                let remaining = deadline.saturating_duration_since(Instant::now());
                let result = match tokio::time::timeout(remaining, proxy(req.clone())).await {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::DeadlineExceeded),
                };

                match result {
                    Err(e) if i == 0 => return Err(e),
                    Err(e) => {
                        acc.merge(Err(e));
                        break;
                    }
                    Ok(response) => {
                        parts[i] = Some(response.clone());
                        acc.merge(Ok(response));
                    }
                }
            }

            acc.result()
        })
    })
}

/// Populate `Resp<k>_<field>` parameters referenced by `pattern` from the
/// responses gathered so far. Missing fields leave the placeholder alone; the
/// unresolved reference is logged by path generation.
fn inject_backrefs(
    req: &mut PipelineRequest,
    pattern: &str,
    current_index: usize,
    parts: &[Option<PipelineResponse>],
) {
    for caps in MERGE_KEY_PATTERN.captures_iter(pattern) {
        let Ok(source_index) = caps[1].parse::<usize>() else {
            continue;
        };
        if source_index >= current_index {
            continue;
        }
        let Some(Some(part)) = parts.get(source_index) else {
            continue;
        };

        let field_path = &caps[2];
        let Some(value) = lookup_field(&part.data, field_path) else {
            continue;
        };

        let key = format!("Resp{source_index}_{field_path}");
        req.params.insert(key, stringify(value));
    }
}

/// Descend a dotted path through object maps only; a non-map intermediate
/// aborts the lookup.
fn lookup_field<'a>(data: &'a Map<String, Value>, path: &str) -> Option<&'a Value> {
    let mut keys = path.split('.');
    let mut current = data.get(keys.next()?)?;
    for key in keys {
        current = current.as_object()?.get(key)?;
    }
    Some(current)
}

/// Stringify a response field for URL injection. Floats keep the historical
/// exponent format at 32-bit precision, which can lose digits on round-trip.
fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                format_float_e32(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

/// `1.5` → `1.5E+00`, matching exponent notation at `f32` precision.
fn format_float_e32(value: f64) -> String {
    let formatted = format!("{:E}", value as f32);
    // Normalize the exponent to a signed, zero-padded form.
    match formatted.split_once('E') {
        Some((mantissa, exponent)) => {
            let (sign, digits) = match exponent.strip_prefix('-') {
                Some(rest) => ('-', rest),
                None => ('+', exponent),
            };
            format!("{mantissa}E{sign}{digits:0>2}")
        }
        None => formatted,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    };

    use serde_json::json;

    use super::*;

    fn endpoint(yaml: &str) -> EndpointConfig {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn data_proxy(value: Value) -> Proxy {
        Arc::new(move |_req| {
            let value = value.clone();
            Box::pin(async move {
                match value {
                    Value::Object(map) => Ok(PipelineResponse::with_data(map)),
                    _ => panic!("data_proxy needs an object"),
                }
            })
        })
    }

    fn failing_proxy() -> Proxy {
        Arc::new(|_req| Box::pin(async { Err(PipelineError::DeadlineExceeded) }))
    }

    fn two_backend_endpoint(sequential: bool) -> EndpointConfig {
        endpoint(&format!(
            r#"
name: merged
endpoint: /merged
timeout: 1s
middleware:
  mw-proxy:
    sequential: {sequential}
backend:
  - hosts: ["http://a:1"]
    url_pattern: /a
  - hosts: ["http://b:1"]
    url_pattern: /b
"#
        ))
    }

    #[tokio::test]
    async fn single_backend_is_identity() {
        let e = endpoint(
            "name: one\nendpoint: /one\nbackend:\n  - hosts: [\"http://a:1\"]\n    url_pattern: /a\n",
        );
        let proxy = new_merge_chain(&e)(vec![data_proxy(json!({"a": 1}))]).unwrap();
        let res = proxy(PipelineRequest::new("GET", "/one")).await.unwrap();
        assert_eq!(Value::Object(res.data), json!({"a": 1}));
        assert!(res.is_complete);
    }

    #[tokio::test]
    async fn chain_rejects_mismatched_proxy_count() {
        let e = two_backend_endpoint(false);
        let result = new_merge_chain(&e)(vec![data_proxy(json!({}))]);
        assert!(matches!(result, Err(PipelineError::NotEnoughProxies)));
    }

    #[tokio::test]
    async fn parallel_merge_combines_all_fields() {
        let e = two_backend_endpoint(false);
        let proxy = new_merge_chain(&e)(vec![
            data_proxy(json!({"a": 1})),
            data_proxy(json!({"b": 2})),
        ])
        .unwrap();

        let res = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap();
        assert_eq!(Value::Object(res.data), json!({"a": 1, "b": 2}));
        assert!(res.is_complete);
        assert!(res.errors.is_empty());
    }

    #[tokio::test]
    async fn parallel_merge_later_index_wins_conflicts() {
        let e = two_backend_endpoint(false);
        // The first backend is slower, so it arrives last; index order must
        // still decide the conflict.
        let slow_first: Proxy = Arc::new(|_req| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(50)).await;
                Ok(PipelineResponse::with_data(
                    json!({"k": "first"}).as_object().unwrap().clone(),
                ))
            })
        });
        let proxy =
            new_merge_chain(&e)(vec![slow_first, data_proxy(json!({"k": "second"}))]).unwrap();

        let res = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap();
        assert_eq!(res.data["k"], json!("second"));
    }

    #[tokio::test]
    async fn parallel_merge_partial_failure_is_incomplete() {
        let e = two_backend_endpoint(false);
        let proxy =
            new_merge_chain(&e)(vec![data_proxy(json!({"a": 1})), failing_proxy()]).unwrap();

        let res = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap();
        assert!(!res.is_complete);
        assert_eq!(Value::Object(res.data), json!({"a": 1}));
        assert_eq!(res.errors.len(), 1);
    }

    #[tokio::test]
    async fn parallel_merge_total_failure_is_an_error() {
        let e = two_backend_endpoint(false);
        let proxy = new_merge_chain(&e)(vec![failing_proxy(), failing_proxy()]).unwrap();

        let err = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Merge { .. }));
    }

    #[tokio::test]
    async fn parallel_merge_enforces_deadline() {
        let e = endpoint(
            r#"
name: merged
endpoint: /merged
timeout: 100ms
backend:
  - hosts: ["http://a:1"]
    url_pattern: /a
  - hosts: ["http://b:1"]
    url_pattern: /b
"#,
        );
        let hung: Proxy = Arc::new(|_req| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(PipelineResponse::with_data(Map::new()))
            })
        });
        let proxy = new_merge_chain(&e)(vec![data_proxy(json!({"a": 1})), hung]).unwrap();

        let started = Instant::now();
        let res = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap();
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(!res.is_complete);
        assert_eq!(Value::Object(res.data), json!({"a": 1}));
    }

    #[tokio::test]
    async fn sequential_merge_injects_backref_params() {
        let e = endpoint(
            r#"
name: chained
endpoint: /chained
timeout: 1s
middleware:
  mw-proxy:
    sequential: true
backend:
  - hosts: ["http://a:1"]
    url_pattern: /tok
  - hosts: ["http://b:1"]
    url_pattern: /data?t={{.Resp0_token}}
"#,
        );

        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen_inner = seen.clone();
        let second: Proxy = Arc::new(move |req| {
            let seen = seen_inner.clone();
            Box::pin(async move {
                *seen.lock().unwrap() = req.params.get("Resp0_token").cloned();
                Ok(PipelineResponse::with_data(
                    json!({"data": "ok"}).as_object().unwrap().clone(),
                ))
            })
        });

        let proxy = new_merge_chain(&e)(vec![data_proxy(json!({"token": "abc"})), second]).unwrap();
        let res = proxy(PipelineRequest::new("GET", "/chained")).await.unwrap();

        assert_eq!(seen.lock().unwrap().as_deref(), Some("abc"));
        assert_eq!(Value::Object(res.data), json!({"token": "abc", "data": "ok"}));
        assert!(res.is_complete);
    }

    #[tokio::test]
    async fn sequential_merge_first_error_propagates_as_is() {
        let e = two_backend_endpoint(true);
        let never_called = Arc::new(AtomicUsize::new(0));
        let counter = never_called.clone();
        let second: Proxy = Arc::new(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(PipelineResponse::with_data(Map::new())) })
        });

        let proxy = new_merge_chain(&e)(vec![failing_proxy(), second]).unwrap();
        let err = proxy(PipelineRequest::new("GET", "/merged")).await.unwrap_err();

        assert!(matches!(err, PipelineError::DeadlineExceeded));
        assert_eq!(never_called.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn sequential_merge_later_error_keeps_partial_data() {
        let e = endpoint(
            r#"
name: chained
endpoint: /chained
timeout: 1s
middleware:
  mw-proxy:
    sequential: true
backend:
  - hosts: ["http://a:1"]
    url_pattern: /a
  - hosts: ["http://b:1"]
    url_pattern: /b
  - hosts: ["http://c:1"]
    url_pattern: /c
"#,
        );
        let third_called = Arc::new(AtomicUsize::new(0));
        let counter = third_called.clone();
        let third: Proxy = Arc::new(move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(PipelineResponse::with_data(Map::new())) })
        });

        let proxy =
            new_merge_chain(&e)(vec![data_proxy(json!({"a": 1})), failing_proxy(), third]).unwrap();
        let res = proxy(PipelineRequest::new("GET", "/chained")).await.unwrap();

        assert!(!res.is_complete);
        assert_eq!(Value::Object(res.data), json!({"a": 1}));
        // The error stops the chain before the third backend runs.
        assert_eq!(third_called.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn lookup_descends_maps_only() {
        let data = json!({"a": {"b": {"c": 1}}, "arr": [1, 2]});
        let map = data.as_object().unwrap();
        assert_eq!(lookup_field(map, "a.b.c"), Some(&json!(1)));
        assert_eq!(lookup_field(map, "a.x"), None);
        assert_eq!(lookup_field(map, "arr.0"), None);
    }

    #[test]
    fn stringify_by_type() {
        assert_eq!(stringify(&json!("abc")), "abc");
        assert_eq!(stringify(&json!(42)), "42");
        assert_eq!(stringify(&json!(true)), "true");
        assert_eq!(stringify(&json!(1.5)), "1.5E+00");
    }

    #[test]
    fn float_format_loses_precision_beyond_f32() {
        // Documented compatibility quirk of the exponent format.
        let formatted = stringify(&json!(1.000_000_1));
        assert!(formatted.starts_with('1'), "{formatted}");
        assert!(formatted.contains('E'), "{formatted}");
    }
}
