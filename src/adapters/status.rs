//! Upstream HTTP status classification.
//!
//! Two policies decide what a backend's status code means for the pipeline:
//!
//! * **Default** — only 200/201 are success. Other statuses become a
//!   [`StatusError`] carrying the status code and, when the body is
//!   non-empty, its text.
//! * **Detailed** — selected by `mw-http.return_error_details = <name>`. The
//!   error additionally carries the configured name and the request path, and
//!   the pipeline forwards the upstream's error body to the client instead of
//!   failing the backend call.
use bytes::Bytes;
use http::{Response, StatusCode};
use serde::Serialize;

use crate::config::models::BackendConfig;

/// Middleware namespace carrying the classifier selection.
pub const HTTP_MW_NAMESPACE: &str = "mw-http";
const RETURN_ERROR_DETAILS_KEY: &str = "return_error_details";

/// How upstream statuses are interpreted for one backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusPolicy {
    /// 200/201 → success, anything else is an error.
    Default,
    /// Like `Default`, but failures are packaged (with the configured name)
    /// so the client sees the upstream's error payload.
    Detailed { name: String },
    /// No classification (the `no-op` encoding path).
    NoOp,
}

impl StatusPolicy {
    /// Read the policy out of a backend's `mw-http` middleware block.
    pub fn from_backend(backend: &BackendConfig) -> Self {
        let name = backend
            .middleware
            .get(HTTP_MW_NAMESPACE)
            .and_then(|mw| mw.get(RETURN_ERROR_DETAILS_KEY))
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty());
        match name {
            Some(name) => Self::Detailed {
                name: name.to_string(),
            },
            None => Self::Default,
        }
    }

    /// True for policies that forward the upstream error body downstream.
    pub fn is_detailed(&self) -> bool {
        matches!(self, Self::Detailed { .. })
    }
}

/// A non-success upstream status, preserving whatever the upstream said.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("Invalid status code {code}: {body}")]
pub struct StatusError {
    #[serde(rename = "http_status_code")]
    pub code: u16,
    #[serde(rename = "http_body", skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(rename = "http_path")]
    pub path: String,
    #[serde(skip)]
    pub name: Option<String>,
}

/// Classify an upstream response under the given policy. `Ok(())` means the
/// pipeline may decode the body; `Err` carries the preserved status detail.
pub fn classify(
    policy: &StatusPolicy,
    response: &Response<Bytes>,
    path: &str,
) -> Result<(), StatusError> {
    if matches!(policy, StatusPolicy::NoOp) {
        return Ok(());
    }

    let status = response.status();
    if status == StatusCode::OK || status == StatusCode::CREATED {
        return Ok(());
    }

    let body = String::from_utf8_lossy(response.body()).into_owned();
    Err(StatusError {
        code: status.as_u16(),
        body,
        path: path.to_string(),
        name: match policy {
            StatusPolicy::Detailed { name } => Some(name.clone()),
            _ => None,
        },
    })
}
