//! Route table snapshots and the atomic dispatcher.
//!
//! A [`RouteTable`] is an immutable axum router compiled from one
//! [`Configuration`]: every endpoint becomes a method route whose handler is
//! the endpoint's assembled [`EndpointHandler`]. The [`Dispatcher`] holds the
//! live table behind an `ArcSwap`; readers load it lock-free on every request
//! while the reload supervisor publishes replacement snapshots. In-flight
//! requests keep the snapshot they started with.
use std::{collections::HashMap, sync::Arc};

use arc_swap::ArcSwap;
use axum::{
    Router,
    body::Body,
    extract::{Path, State},
    http::StatusCode,
    response::Response,
    routing::{MethodFilter, on},
};
use eyre::{Result, WrapErr, eyre};
use tower::util::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;

use crate::{
    adapters::{handler::EndpointHandler, middleware::request_id_middleware},
    core::pipeline::ProxyFactory,
    ports::repository::Configuration,
};

/// Immutable snapshot mapping (method, listen path) to endpoint handlers.
pub struct RouteTable {
    router: Router,
    endpoint_count: usize,
}

impl RouteTable {
    /// Compile a configuration into a snapshot. Fails when any endpoint
    /// cannot be assembled, so a broken configuration never goes live.
    pub fn build(config: &Configuration, factory: &ProxyFactory) -> Result<Self> {
        let mut router = Router::new();
        let mut endpoint_count = 0;

        for endpoint_config in config.all_definitions() {
            let endpoint = Arc::new(endpoint_config.clone());
            let proxy = factory
                .endpoint_proxy(&endpoint)
                .wrap_err_with(|| format!("assembling endpoint '{}'", endpoint.name))?;
            let handler = Arc::new(EndpointHandler::new(endpoint.clone(), proxy));
            let filter = method_filter(&endpoint.method)?;

            router = router.route(
                &endpoint.endpoint,
                on(
                    filter,
                    move |Path(params): Path<HashMap<String, String>>,
                          request: axum::extract::Request| {
                        let handler = handler.clone();
                        async move { handler.handle(params, request).await }
                    },
                ),
            );
            endpoint_count += 1;
        }

        let router = router
            .fallback(api_not_found)
            .layer(axum::middleware::from_fn(request_id_middleware))
            .layer(CatchPanicLayer::custom(recover_panic));

        Ok(Self {
            router,
            endpoint_count,
        })
    }

    /// An empty table serving only the not-found fallback.
    pub fn empty() -> Self {
        Self {
            router: Router::new()
                .fallback(api_not_found)
                .layer(axum::middleware::from_fn(request_id_middleware)),
            endpoint_count: 0,
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoint_count
    }
}

async fn api_not_found() -> Response {
    crate::adapters::handler::error_response(
        StatusCode::NOT_FOUND,
        "API_NOT_FOUND",
        "API not found",
    )
}

fn recover_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response<Body> {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    tracing::error!(panic = detail, "request handler panicked");
    crate::adapters::handler::error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL_ERROR",
        "Internal server error",
    )
}

fn method_filter(method: &str) -> Result<MethodFilter> {
    match method {
        "GET" => Ok(MethodFilter::GET),
        "POST" => Ok(MethodFilter::POST),
        "PUT" => Ok(MethodFilter::PUT),
        "DELETE" => Ok(MethodFilter::DELETE),
        "PATCH" => Ok(MethodFilter::PATCH),
        other => Err(eyre!("unsupported endpoint method '{other}'")),
    }
}

/// Lock-free pointer to the live route table.
pub struct Dispatcher {
    table: ArcSwap<RouteTable>,
}

impl Dispatcher {
    pub fn new(table: RouteTable) -> Arc<Self> {
        Arc::new(Self {
            table: ArcSwap::from_pointee(table),
        })
    }

    /// Publish a new snapshot. Readers that already loaded the previous one
    /// finish their requests against it.
    pub fn swap(&self, table: RouteTable) {
        self.table.store(Arc::new(table));
        crate::metrics::increment_route_table_reloads();
    }

    pub fn endpoint_count(&self) -> usize {
        self.table.load().endpoint_count
    }

    /// Route one request through the current snapshot.
    pub async fn dispatch(&self, request: axum::extract::Request) -> Response {
        let table = self.table.load_full();
        match table.router.clone().oneshot(request).await {
            Ok(response) => response,
            Err(infallible) => match infallible {},
        }
    }

    /// The outer axum router every listener serves: a catch-all that defers
    /// to whatever snapshot is live at arrival time.
    pub fn into_router(self: Arc<Self>) -> Router {
        Router::new()
            .fallback(
                |State(dispatcher): State<Arc<Dispatcher>>, request: axum::extract::Request| async move {
                    dispatcher.dispatch(request).await
                },
            )
            .with_state(self)
    }
}
