//! Conflux - a response-composing REST API gateway.
//!
//! Conflux terminates client HTTP requests on configured endpoints and
//! composes one or more upstream backend responses into a single reply. It
//! follows a **hexagonal architecture**: business logic lives in `core`,
//! trait seams in `ports`, and the hyper/axum/notify implementations in
//! `adapters`. This library exposes the building blocks so the gateway can
//! be embedded or partially reused.
//!
//! # Features
//! - Endpoint pipelines fanning out to N backends with parallel or
//!   sequential merging (including `{{.Resp<i>_<field>}}` back-references)
//! - Response projection: target pluck, whitelist, blacklist, field
//!   renaming, grouping, collection handling
//! - Pluggable endpoint repositories (`file://` with a directory watcher,
//!   `cbstore://` over a key-value store) with zero-downtime reloads via an
//!   atomically swapped route table
//! - Admin API for runtime catalog mutation, persisted on demand
//! - Token-bucket rate limiting per endpoint, per client or per backend
//! - Structured tracing via `tracing` and metrics via the `metrics` facade
//! - Graceful shutdown honoring the configured grace timeout
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use conflux::{
//!     adapters::{HttpClientAdapter, repository::build_repository},
//!     config::load_service_config,
//!     core::ProxyFactory,
//! };
//!
//! # async fn example() -> eyre::Result<()> {
//! let service = load_service_config("conflux.yaml")?;
//! let repository = build_repository(&service, None).await?;
//! let executor = Arc::new(HttpClientAdapter::new(service.idle_connection_timeout)?);
//! let factory = Arc::new(ProxyFactory::new(executor));
//! // Wire these into the reload supervisor and serve the dispatcher router
//! // (see the binary crate).
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Application-level fallible paths return `eyre::Result<T>`; the ports use
//! domain error types (`PipelineError`, `RepositoryError`, `ExecutorError`).
//!
//! # License
//! Dual-licensed under either MIT or Apache-2.0 at your option.
pub mod admin;
pub mod config;
pub mod metrics;
pub mod ports;
pub mod supervisor;
pub mod tracing_setup;
pub mod utils;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate
pub use crate::{
    adapters::{Dispatcher, HttpClientAdapter, RouteTable},
    core::ProxyFactory,
    supervisor::ReloadSupervisor,
    utils::GracefulShutdown,
};
