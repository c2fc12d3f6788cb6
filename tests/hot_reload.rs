//! Zero-downtime reload: file repository changes reach the dispatcher while
//! traffic keeps flowing.
use std::{sync::Arc, time::Duration};

use axum::body::Body;
use conflux::{
    ReloadSupervisor,
    adapters::{HttpClientAdapter, repository::build_repository, router::Dispatcher},
    config::models::ServiceConfig,
    core::ProxyFactory,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc;
use wiremock::{
    Mock, MockServer, ResponseTemplate,
    matchers::{method, path},
};

struct Gateway {
    dispatcher: Arc<Dispatcher>,
    apis_dir: std::path::PathBuf,
    _root: TempDir,
    _stop_tx: mpsc::Sender<()>,
    _admin_tx: mpsc::Sender<conflux::admin::AdminMessage>,
}

fn group_yaml(name: &str, listen: &str, upstream: &str, pattern: &str) -> String {
    format!(
        r#"definitions:
  - name: {name}
    endpoint: {listen}
    timeout: 2s
    backend:
      - hosts: ["{upstream}"]
        url_pattern: {pattern}
"#
    )
}

async fn start_gateway(initial_groups: &[(&str, String)]) -> Gateway {
    let root = TempDir::new().expect("tempdir");
    let apis_dir = root.path().join("apis");
    std::fs::create_dir(&apis_dir).expect("apis dir");
    for (group, content) in initial_groups {
        std::fs::write(apis_dir.join(format!("{group}.yaml")), content).expect("seed group");
    }

    let mut service = ServiceConfig::default();
    service.repository.dsn = format!("file://{}", root.path().display());

    let repository = build_repository(&service, None).await.expect("repository");
    let executor = Arc::new(HttpClientAdapter::new(Duration::from_secs(30)).expect("client"));
    let factory = Arc::new(ProxyFactory::new(executor));

    let (admin_tx, admin_rx) = mpsc::channel(8);
    let (stop_tx, stop_rx) = mpsc::channel(1);
    let (supervisor, dispatcher, _view) =
        ReloadSupervisor::new(service.clone(), repository, factory, admin_rx, stop_rx)
            .await
            .expect("supervisor");
    tokio::spawn(supervisor.run());

    Gateway {
        dispatcher,
        apis_dir,
        _root: root,
        _stop_tx: stop_tx,
        _admin_tx: admin_tx,
    }
}

async fn get_status(dispatcher: &Dispatcher, path_and_query: &str) -> u16 {
    let request = axum::extract::Request::builder()
        .uri(path_and_query)
        .body(Body::empty())
        .expect("request");
    dispatcher.dispatch(request).await.status().as_u16()
}

/// Poll until the dispatcher returns the expected status or time runs out.
async fn wait_for_status(
    dispatcher: &Dispatcher,
    path_and_query: &str,
    expected: u16,
) -> bool {
    for _ in 0..100 {
        if get_status(dispatcher, path_and_query).await == expected {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread")]
async fn new_group_file_goes_live_without_dropping_traffic() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&upstream)
        .await;
    Mock::given(method("GET"))
        .and(path("/b"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"b": 2})))
        .mount(&upstream)
        .await;

    let gateway = start_gateway(&[(
        "alpha",
        group_yaml("alpha", "/a", &upstream.uri(), "/a"),
    )])
    .await;

    assert_eq!(get_status(&gateway.dispatcher, "/a").await, 200);
    assert_eq!(get_status(&gateway.dispatcher, "/b").await, 404);

    // Sustained traffic on /a while /b goes live.
    let dispatcher = gateway.dispatcher.clone();
    let traffic = tokio::spawn(async move {
        let mut failures = 0u32;
        for _ in 0..200 {
            if get_status(&dispatcher, "/a").await != 200 {
                failures += 1;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        failures
    });

    std::fs::write(
        gateway.apis_dir.join("beta.yaml"),
        group_yaml("beta", "/b", &upstream.uri(), "/b"),
    )
    .expect("write beta group");

    assert!(
        wait_for_status(&gateway.dispatcher, "/b", 200).await,
        "/b never went live"
    );

    let failures = traffic.await.expect("traffic task");
    assert_eq!(failures, 0, "{failures} requests to /a failed during reload");
}

#[tokio::test(flavor = "multi_thread")]
async fn removed_group_file_stops_serving() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&upstream)
        .await;

    let gateway = start_gateway(&[(
        "alpha",
        group_yaml("alpha", "/a", &upstream.uri(), "/a"),
    )])
    .await;
    assert_eq!(get_status(&gateway.dispatcher, "/a").await, 200);

    std::fs::remove_file(gateway.apis_dir.join("alpha.yaml")).expect("remove group");
    assert!(
        wait_for_status(&gateway.dispatcher, "/a", 404).await,
        "/a still serving after its group was removed"
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn invalid_group_edit_keeps_previous_snapshot() {
    let upstream = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/a"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"a": 1})))
        .mount(&upstream)
        .await;

    let gateway = start_gateway(&[(
        "alpha",
        group_yaml("alpha", "/a", &upstream.uri(), "/a"),
    )])
    .await;

    // An endpoint with no backends never validates; the live table must
    // keep serving the old definition.
    std::fs::write(
        gateway.apis_dir.join("alpha.yaml"),
        "definitions:\n  - name: alpha\n    endpoint: /a\n    backend: []\n",
    )
    .expect("write broken group");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(get_status(&gateway.dispatcher, "/a").await, 200);
}
