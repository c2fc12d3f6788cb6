//! Configuration data structures for Conflux.
//!
//! These types map directly to the service configuration file (YAML / JSON /
//! TOML) and to the per-group endpoint definition files. They are
//! intentionally serde-friendly and include defaults so that minimal configs
//! remain concise. Inheritance (service → endpoint → backend) is resolved at
//! load time by [`EndpointConfig::inherit_from_service`], so the in-memory
//! structs are fully self-contained once a configuration has been accepted.
use std::{collections::HashMap, time::Duration};

use serde::{Deserialize, Serialize};

use crate::config::duration_format;

/// Opaque per-middleware configuration, keyed by middleware name
/// (`mw-ratelimit`, `mw-auth`, `mw-http`, `mw-metrics`, ...). Values stay
/// uninterpreted until the owning middleware factory reads them.
pub type MwConfig = HashMap<String, serde_json::Value>;

fn default_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(90)
}

fn default_grace_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_refresh_time() -> Duration {
    Duration::from_secs(30)
}

fn default_port() -> u16 {
    8000
}

fn default_admin_port() -> u16 {
    8001
}

/// Top-level service configuration, created once at startup and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Port the gateway listener binds to.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Socket read timeout.
    #[serde(with = "duration_format", default = "default_timeout")]
    pub read_timeout: Duration,
    /// Socket write timeout.
    #[serde(with = "duration_format", default = "default_timeout")]
    pub write_timeout: Duration,
    /// Keep-alive idle timeout for client connections.
    #[serde(with = "duration_format", default = "default_idle_timeout")]
    pub idle_timeout: Duration,
    /// How long in-flight requests may drain after a shutdown signal.
    #[serde(with = "duration_format", default = "default_grace_timeout")]
    pub grace_timeout: Duration,
    /// Default endpoint timeout, inherited where an endpoint sets none.
    #[serde(with = "duration_format", default = "default_timeout")]
    pub timeout: Duration,
    /// Default backend hosts, inherited where a backend lists none.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// TLS listener settings. Carried for the outer listener plumbing; the
    /// core never reads past presence.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
    /// Endpoint definition store.
    pub repository: RepositoryConfig,
    /// Admin API listener settings.
    #[serde(default)]
    pub admin: AdminConfig,
    /// Service-wide middleware defaults, merged under endpoint middleware.
    #[serde(default)]
    pub middleware: MwConfig,
    /// Idle upstream connections are reaped after this long in the pool.
    #[serde(with = "duration_format", default = "default_idle_timeout")]
    pub idle_connection_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            read_timeout: default_timeout(),
            write_timeout: default_timeout(),
            idle_timeout: default_idle_timeout(),
            grace_timeout: default_grace_timeout(),
            timeout: default_timeout(),
            hosts: Vec::new(),
            tls: None,
            repository: RepositoryConfig::default(),
            admin: AdminConfig::default(),
            middleware: MwConfig::new(),
            idle_connection_timeout: default_idle_timeout(),
        }
    }
}

/// TLS configuration for the gateway listener.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    pub port: u16,
    pub cert_path: String,
    pub key_path: String,
    #[serde(default)]
    pub redirect: bool,
}

/// Where endpoint definitions live and how often remote stores are polled.
///
/// The DSN scheme selects the implementation: `file://<dir>` loads one YAML
/// file per group from `<dir>/apis/`; `cbstore://<prefix>` reads group keys
/// beneath a prefix in a key-value store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub dsn: String,
    #[serde(with = "duration_format", default = "default_refresh_time")]
    pub refresh_time: Duration,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            dsn: "file://.".to_string(),
            refresh_time: default_refresh_time(),
        }
    }
}

/// Admin API listener configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    pub port: u16,
    pub enabled: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            port: default_admin_port(),
            enabled: true,
        }
    }
}

/// Body encodings understood by the pipeline.
///
/// `Noop` bypasses decoding entirely: the raw upstream bytes are streamed
/// through and the entity formatter never runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    #[default]
    Json,
    Xml,
    String,
    #[serde(rename = "no-op", alias = "noop")]
    Noop,
}

/// Upstream balancing modes for a backend's host list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BalancingMode {
    #[default]
    #[serde(rename = "roundrobin", alias = "round-robin")]
    RoundRobin,
    #[serde(rename = "weight", alias = "weighted")]
    Weighted,
}

fn default_method() -> String {
    "GET".to_string()
}

/// A client-facing endpoint: one listen path served by one or more backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Unique identifier within its group. Must match
    /// `^[A-Za-z0-9]+(-[A-Za-z0-9]+)*$`.
    pub name: String,
    /// Listen path exposed to clients; must start with `/` and be unique
    /// across all groups. May embed `{param}` placeholders.
    pub endpoint: String,
    #[serde(default = "default_method")]
    pub method: String,
    /// Per-endpoint pipeline deadline. Inherits the service default when
    /// absent.
    #[serde(with = "duration_format::opt", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub output_encoding: Encoding,
    /// Query parameters stripped before forwarding to backends.
    #[serde(default)]
    pub except_querystrings: Vec<String>,
    /// Headers stripped before forwarding to backends.
    #[serde(default)]
    pub except_headers: Vec<String>,
    /// Passthrough mode: stream the single upstream response verbatim.
    #[serde(default)]
    pub is_bypass: bool,
    #[serde(default)]
    pub middleware: MwConfig,
    /// Ordered backend calls composed into this endpoint's response.
    #[serde(default)]
    pub backend: Vec<BackendConfig>,
}

/// One upstream HTTP call and the projection applied to its decoded body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Candidate upstream base URLs. Inherits the service hosts when empty.
    #[serde(default)]
    pub hosts: Vec<String>,
    /// Host selection mode when more than one host is listed.
    #[serde(default)]
    pub balancing: BalancingMode,
    /// Per-host weights for [`BalancingMode::Weighted`], aligned by index
    /// with `hosts`; missing entries weigh 1.
    #[serde(default)]
    pub weights: Vec<u32>,
    #[serde(default = "default_method")]
    pub method: String,
    /// Upstream path. May embed `{param}` placeholders and
    /// `{{.Resp<i>_<field>}}` back-references (sequential merging).
    pub url_pattern: String,
    /// Body decoding. Inherits the endpoint's output encoding when absent.
    #[serde(default)]
    pub encoding: Option<Encoding>,
    /// Key under which this backend's data nests in the merged response;
    /// empty merges at the root.
    #[serde(default)]
    pub group: String,
    /// Dotted field paths dropped from the decoded body.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Dotted field paths kept in the decoded body (everything else dropped).
    #[serde(default)]
    pub whitelist: Vec<String>,
    /// Field renames applied after white/blacklisting.
    #[serde(default)]
    pub mapping: HashMap<String, String>,
    /// The decoded body is a JSON array rather than an object.
    #[serde(default)]
    pub is_collection: bool,
    /// When the body is a collection: `true` keeps it wrapped under the
    /// `"collection"` key, `false` renders the bare array at the root.
    #[serde(default)]
    pub wrap_collection_to_json: bool,
    /// Pluck a single sub-document before other projections.
    #[serde(default)]
    pub target: String,
    /// Per-backend deadline. Inherits the endpoint timeout when absent.
    #[serde(with = "duration_format::opt", default)]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub middleware: MwConfig,
}

impl EndpointConfig {
    /// Resolve inherited values so the endpoint is self-contained: endpoint
    /// timeout from the service, backend hosts / timeout / encoding from the
    /// endpoint. Called once by the repository loader before validation.
    pub fn inherit_from_service(&mut self, service: &ServiceConfig) {
        if self.timeout.is_none() {
            self.timeout = Some(service.timeout);
        }
        let endpoint_timeout = self.timeout;
        for backend in &mut self.backend {
            if backend.hosts.is_empty() {
                backend.hosts = service.hosts.clone();
            }
            if backend.timeout.is_none() {
                backend.timeout = endpoint_timeout;
            }
            if backend.encoding.is_none() {
                backend.encoding = Some(self.output_encoding);
            }
        }
        for (name, value) in &service.middleware {
            self.middleware
                .entry(name.clone())
                .or_insert_with(|| value.clone());
        }
    }

    /// The resolved pipeline deadline; load-time resolution makes the
    /// fallback unreachable for accepted configurations.
    pub fn resolved_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(default_timeout)
    }
}

impl BackendConfig {
    pub fn resolved_timeout(&self) -> Duration {
        self.timeout.unwrap_or_else(default_timeout)
    }

    pub fn resolved_encoding(&self) -> Encoding {
        self.encoding.unwrap_or_default()
    }
}
