pub mod encoding;
pub mod handler;
pub mod http_client;
pub mod middleware;
pub mod repository;
pub mod router;
pub mod status;

/// Re-export commonly used types from adapters
pub use handler::EndpointHandler;
pub use http_client::HttpClientAdapter;
pub use repository::{FileSystemRepository, InMemoryRepository, KvStoreRepository};
pub use router::{Dispatcher, RouteTable};
