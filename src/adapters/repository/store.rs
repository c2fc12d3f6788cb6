//! Key-value-store-backed definition store (`cbstore://<prefix>`).
//!
//! Groups live as YAML documents under `<prefix>/<group>`. The store itself
//! is pluggable through [`KvStore`]; deployments wire in their backend, tests
//! and single-node setups use [`MemoryKvStore`]. External changes surface via
//! polling: every `refresh_time` the watcher re-lists the prefix, compares
//! content hashes and emits the same change events the file watcher does.
use std::{
    collections::HashMap,
    hash::{Hash, Hasher},
    sync::{Arc, Mutex, RwLock},
    time::Duration,
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    adapters::repository::{file::parse_group, memory::InMemoryRepository},
    config::models::ServiceConfig,
    ports::repository::{
        ConfigurationState, DefinitionMap, GroupDefinitions, RepoChangeEvent, RepoResult,
        Repository, RepositoryError,
    },
};

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Minimal key-value store surface the repository needs.
#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> RepoResult<Option<Vec<u8>>>;
    async fn put(&self, key: &str, value: Vec<u8>) -> RepoResult<()>;
    async fn delete(&self, key: &str) -> RepoResult<()>;
    /// Keys beneath a prefix, in stable order.
    async fn list(&self, prefix: &str) -> RepoResult<Vec<String>>;
}

/// In-memory [`KvStore`] used by tests and single-node deployments.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKvStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> RepoResult<Option<Vec<u8>>> {
        Ok(self.entries.read().expect("store lock").get(key).cloned())
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> RepoResult<()> {
        self.entries
            .write()
            .expect("store lock")
            .insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> RepoResult<()> {
        self.entries.write().expect("store lock").remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> RepoResult<Vec<String>> {
        let mut keys: Vec<String> = self
            .entries
            .read()
            .expect("store lock")
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

fn content_hash(bytes: &[u8]) -> u64 {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    bytes.hash(&mut hasher);
    hasher.finish()
}

/// Definition store reading groups from a key prefix.
pub struct KvStoreRepository {
    store: Arc<dyn KvStore>,
    prefix: String,
    refresh_time: Duration,
    inner: InMemoryRepository,
    event_rx: Mutex<Option<mpsc::Receiver<RepoChangeEvent>>>,
    poller: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl KvStoreRepository {
    /// Load every group under the prefix and start the polling watcher.
    pub async fn new(
        service: &ServiceConfig,
        store: Arc<dyn KvStore>,
        prefix: &str,
        refresh_time: Duration,
    ) -> RepoResult<Self> {
        let prefix = prefix.trim_end_matches('/').to_string();
        let inner = InMemoryRepository::new();
        let mut seen = HashMap::new();

        for key in store.list(&prefix).await? {
            let Some(bytes) = store.get(&key).await? else {
                continue;
            };
            let group = Self::group_from_key(&prefix, &key);
            let definitions = parse_group(service, &bytes)?;
            inner.ensure_group(&group);
            for definition in definitions {
                inner.add(&group, definition)?;
            }
            seen.insert(group, content_hash(&bytes));
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let poller = Self::spawn_poller(
            store.clone(),
            prefix.clone(),
            service.clone(),
            refresh_time,
            seen,
            tx,
        );

        Ok(Self {
            store,
            prefix,
            refresh_time,
            inner,
            event_rx: Mutex::new(Some(rx)),
            poller: Mutex::new(Some(poller)),
        })
    }

    fn group_from_key(prefix: &str, key: &str) -> String {
        key.strip_prefix(prefix)
            .map(|rest| rest.trim_start_matches('/'))
            .filter(|rest| !rest.is_empty())
            .unwrap_or(key)
            .to_string()
    }

    fn group_key(&self, group: &str) -> String {
        format!("{}/{}", self.prefix, group)
    }

    pub fn refresh_time(&self) -> Duration {
        self.refresh_time
    }

    fn spawn_poller(
        store: Arc<dyn KvStore>,
        prefix: String,
        service: ServiceConfig,
        refresh_time: Duration,
        mut seen: HashMap<String, u64>,
        tx: mpsc::Sender<RepoChangeEvent>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(refresh_time);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // immediate first tick carries no news

            loop {
                ticker.tick().await;

                let keys = match store.list(&prefix).await {
                    Ok(keys) => keys,
                    Err(e) => {
                        tracing::error!(error = %e, "store poll failed");
                        continue;
                    }
                };

                let mut current = HashMap::new();
                for key in keys {
                    let group = Self::group_from_key(&prefix, &key);
                    let Ok(Some(bytes)) = store.get(&key).await else {
                        continue;
                    };
                    let hash = content_hash(&bytes);
                    let previous = seen.get(&group).copied();
                    current.insert(group.clone(), hash);

                    if previous == Some(hash) {
                        continue;
                    }
                    let definitions = match parse_group(&service, &bytes) {
                        Ok(defs) => defs,
                        Err(e) => {
                            tracing::error!(group, error = %e, "couldn't parse stored definitions");
                            continue;
                        }
                    };
                    let event = RepoChangeEvent {
                        group,
                        state: if previous.is_none() {
                            ConfigurationState::Added
                        } else {
                            ConfigurationState::Changed
                        },
                        definitions,
                    };
                    if tx.send(event).await.is_err() {
                        return;
                    }
                }

                for group in seen.keys() {
                    if !current.contains_key(group) {
                        let event = RepoChangeEvent {
                            group: group.clone(),
                            state: ConfigurationState::Removed,
                            definitions: Vec::new(),
                        };
                        if tx.send(event).await.is_err() {
                            return;
                        }
                    }
                }

                seen = current;
            }
        })
    }
}

#[async_trait]
impl Repository for KvStoreRepository {
    async fn find_all(&self) -> RepoResult<Vec<DefinitionMap>> {
        self.inner.find_all().await
    }

    async fn write(&self, maps: &mut [DefinitionMap]) -> RepoResult<()> {
        let mut kept = Vec::with_capacity(maps.len());
        for dm in maps.iter_mut() {
            let key = self.group_key(&dm.name);
            match dm.state {
                ConfigurationState::Removed => {
                    self.store.delete(&key).await?;
                    dm.state = ConfigurationState::None;
                    continue;
                }
                ConfigurationState::Added | ConfigurationState::Changed => {
                    let group = GroupDefinitions {
                        definitions: dm.definitions.clone(),
                    };
                    let data = serde_yaml::to_string(&group)?;
                    self.store.put(&key, data.into_bytes()).await?;
                }
                ConfigurationState::None => {}
            }
            dm.state = ConfigurationState::None;
            kept.push(dm.clone());
        }

        self.inner.replace_all(kept);
        Ok(())
    }

    fn close(&self) -> RepoResult<()> {
        if let Some(poller) = self.poller.lock().expect("poller lock").take() {
            poller.abort();
        }
        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<RepoChangeEvent>> {
        self.event_rx.lock().expect("event receiver lock").take()
    }
}

impl Drop for KvStoreRepository {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
