pub mod file;
pub mod memory;
pub mod store;

use std::{path::PathBuf, sync::Arc};

pub use file::FileSystemRepository;
pub use memory::InMemoryRepository;
pub use store::{KvStore, KvStoreRepository, MemoryKvStore};

use crate::{
    config::models::ServiceConfig,
    ports::repository::{RepoResult, Repository, RepositoryError},
};

/// Directory (under the `file://` DSN root) holding one YAML file per group.
pub const APIS_DIR: &str = "apis";

/// Build the repository selected by the service DSN scheme.
///
/// `file://<dir>` loads group files from `<dir>/apis/`. `cbstore://<prefix>`
/// reads group keys beneath the prefix from `kv_store` (an in-memory store
/// when none is supplied).
pub async fn build_repository(
    service: &ServiceConfig,
    kv_store: Option<Arc<dyn KvStore>>,
) -> RepoResult<Arc<dyn Repository>> {
    let dsn = &service.repository.dsn;
    let url = url::Url::parse(dsn).map_err(|e| RepositoryError::InvalidDsn {
        dsn: dsn.clone(),
        reason: e.to_string(),
    })?;

    // `file://./x` parses the dot as a host; fold it back into the path.
    let base = match url.host_str() {
        Some(host) if !host.is_empty() => format!("{host}{}", url.path()),
        _ => url.path().to_string(),
    };
    if base.is_empty() {
        return Err(RepositoryError::InvalidDsn {
            dsn: dsn.clone(),
            reason: "path not found in DSN".to_string(),
        });
    }

    match url.scheme() {
        "file" => {
            let api_path = PathBuf::from(base).join(APIS_DIR);
            tracing::debug!(path = %api_path.display(), "loading file repository");
            let repo = FileSystemRepository::new(service, &api_path)?;
            Ok(Arc::new(repo))
        }
        "cbstore" => {
            tracing::debug!(prefix = %base, "loading kv-store repository");
            let store: Arc<dyn KvStore> = match kv_store {
                Some(store) => store,
                None => MemoryKvStore::new(),
            };
            let repo =
                KvStoreRepository::new(service, store, &base, service.repository.refresh_time)
                    .await?;
            Ok(Arc::new(repo))
        }
        other => Err(RepositoryError::InvalidDsn {
            dsn: dsn.clone(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}
