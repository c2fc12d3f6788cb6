//! End-to-end pipeline scenarios against mock upstreams.
use std::{sync::Arc, time::Duration};

use axum::body::Body;
use conflux::{
    adapters::{
        HttpClientAdapter,
        handler::{COMPLETED_HEADER, MESSAGES_HEADER},
        router::{Dispatcher, RouteTable},
    },
    core::ProxyFactory,
    ports::repository::{Configuration, DefinitionMap},
};
use serde_json::{Value, json};
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path, query_param},
};

fn configuration_from(defs: &[String]) -> Configuration {
    let mut group = DefinitionMap::new("apis");
    for def in defs {
        group
            .definitions
            .push(serde_yaml::from_str(def).expect("test definition parses"));
    }
    Configuration::new(vec![group])
}

fn dispatcher_for(defs: &[String]) -> Arc<Dispatcher> {
    let executor =
        Arc::new(HttpClientAdapter::new(Duration::from_secs(30)).expect("client builds"));
    let factory = ProxyFactory::new(executor);
    let table = RouteTable::build(&configuration_from(defs), &factory).expect("table builds");
    Dispatcher::new(table)
}

async fn get(dispatcher: &Dispatcher, path_and_query: &str) -> axum::response::Response {
    let request = axum::extract::Request::builder()
        .uri(path_and_query)
        .body(Body::empty())
        .expect("request builds");
    dispatcher.dispatch(request).await
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body reads");
    serde_json::from_slice(&bytes).expect("body is JSON")
}

#[tokio::test(flavor = "multi_thread")]
async fn single_backend_get_passes_body_through() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/u/42"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 42, "name": "kim"})))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: users
endpoint: /users/{{id}}
timeout: 2s
backend:
  - hosts: ["{}"]
    url_pattern: /u/{{id}}
"#,
        server.uri()
    )]);

    let response = get(&dispatcher, "/users/42").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[COMPLETED_HEADER], "true");
    assert_eq!(json_body(response).await, json!({"id": 42, "name": "kim"}));
}

#[tokio::test(flavor = "multi_thread")]
async fn two_backend_parallel_merge_combines_bodies() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"b": 2})))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: merged
endpoint: /merged
timeout: 2s
backend:
  - hosts: ["{uri}"]
    url_pattern: /a
  - hosts: ["{uri}"]
    url_pattern: /b
"#,
        uri = server.uri()
    )]);

    let response = get(&dispatcher, "/merged").await;
    assert_eq!(response.status(), 200);
    assert_eq!(response.headers()[COMPLETED_HEADER], "true");
    assert_eq!(json_body(response).await, json!({"a": 1, "b": 2}));
}

#[tokio::test(flavor = "multi_thread")]
async fn sequential_merge_feeds_backref_into_second_call() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/tok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"token": "abc"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .and(query_param("t", "abc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"data": "ok"})))
        .expect(1)
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: chained
endpoint: /chained
timeout: 2s
middleware:
  mw-proxy:
    sequential: true
backend:
  - hosts: ["{uri}"]
    url_pattern: /tok
  - hosts: ["{uri}"]
    url_pattern: /data?t={{{{.Resp0_token}}}}
"#,
        uri = server.uri()
    )]);

    let response = get(&dispatcher, "/chained").await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        json_body(response).await,
        json!({"token": "abc", "data": "ok"})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_timeout_renders_504_within_budget() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"late": true}))
                .set_delay(Duration::from_millis(500)),
        )
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: slow
endpoint: /slow
timeout: 100ms
backend:
  - hosts: ["{}"]
    url_pattern: /slow
"#,
        server.uri()
    )]);

    let started = std::time::Instant::now();
    let response = get(&dispatcher, "/slow").await;
    let elapsed = started.elapsed();

    assert_eq!(response.status(), 504);
    assert_eq!(response.headers()[COMPLETED_HEADER], "false");
    assert!(
        elapsed < Duration::from_millis(400),
        "took {elapsed:?}, expected ~100ms"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn rate_limited_endpoint_rejects_third_rapid_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: limited
endpoint: /limited
timeout: 2s
middleware:
  mw-ratelimit:
    rate: "2/s"
    burst: 2
backend:
  - hosts: ["{}"]
    url_pattern: /ok
"#,
        server.uri()
    )]);

    let mut statuses = Vec::new();
    for _ in 0..3 {
        statuses.push(get(&dispatcher, "/limited").await.status().as_u16());
    }
    assert_eq!(statuses, vec![200, 200, 429]);
}

#[tokio::test(flavor = "multi_thread")]
async fn partial_parallel_failure_returns_data_with_messages() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"good": 1})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/bad"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: partial
endpoint: /partial
timeout: 2s
backend:
  - hosts: ["{uri}"]
    url_pattern: /good
  - hosts: ["{uri}"]
    url_pattern: /bad
"#,
        uri = server.uri()
    )]);

    let response = get(&dispatcher, "/partial").await;
    assert_eq!(response.status(), 500);
    assert_eq!(response.headers()[COMPLETED_HEADER], "false");
    assert!(response.headers().contains_key(MESSAGES_HEADER));
    assert_eq!(json_body(response).await, json!({"good": 1}));
}

#[tokio::test(flavor = "multi_thread")]
async fn projections_shape_the_merged_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/profile"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7, "email": "a@b.c", "password": "nope"
        })))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: projected
endpoint: /projected
timeout: 2s
backend:
  - hosts: ["{}"]
    url_pattern: /profile
    whitelist: [id, email]
    mapping:
      email: contact
    group: user
"#,
        server.uri()
    )]);

    let response = get(&dispatcher, "/projected").await;
    assert_eq!(
        json_body(response).await,
        json!({"user": {"id": 7, "contact": "a@b.c"}})
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn bypass_endpoint_streams_upstream_verbatim() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/thing"))
        .respond_with(
            ResponseTemplate::new(203)
                .set_body_string("not json at all")
                .insert_header("x-upstream-header", "kept"),
        )
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: passthrough
endpoint: /raw/{{rest}}
timeout: 2s
is_bypass: true
backend:
  - hosts: ["{}"]
    url_pattern: /ignored
    encoding: no-op
"#,
        server.uri()
    )]);

    let response = get(&dispatcher, "/raw/thing").await;
    assert_eq!(response.status(), 203);
    assert_eq!(response.headers()["x-upstream-header"], "kept");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    assert_eq!(&bytes[..], b"not json at all");
}

#[tokio::test(flavor = "multi_thread")]
async fn detailed_status_policy_forwards_upstream_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(418).set_body_string("teapot says no"))
        .mount(&server)
        .await;

    let dispatcher = dispatcher_for(&[format!(
        r#"
name: detailed
endpoint: /detailed
timeout: 2s
backend:
  - hosts: ["{}"]
    url_pattern: /flaky
    middleware:
      mw-http:
        return_error_details: flaky-backend
"#,
        server.uri()
    )]);

    let response = get(&dispatcher, "/detailed").await;
    assert_eq!(response.status(), 418);
    assert_eq!(response.headers()[COMPLETED_HEADER], "false");
    let body = json_body(response).await;
    assert_eq!(body["error_flaky-backend"]["http_status_code"], json!(418));
    assert_eq!(body["error_flaky-backend"]["http_body"], json!("teapot says no"));
}
