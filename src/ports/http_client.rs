use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use thiserror::Error;

/// Error type for upstream HTTP calls
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ExecutorError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the call exceeds its deadline
    #[error("Timeout error after {0:?}")]
    Timeout(std::time::Duration),

    /// Error when the outgoing request cannot be built
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream HTTP calls
pub type ExecutorResult<T> = Result<T, ExecutorError>;

/// HttpRequestExecutor defines the port (interface) for issuing a single
/// upstream HTTP call. Bodies are buffered: the pipeline re-reads them for
/// decoding and merging, so streaming would buy nothing here.
#[async_trait]
pub trait HttpRequestExecutor: Send + Sync + 'static {
    /// Issue one HTTP call and return the buffered response.
    async fn execute(&self, req: Request<Bytes>) -> ExecutorResult<Response<Bytes>>;
}
