//! Filesystem-backed definition store: one YAML file per group under
//! `<root>/apis/`, watched for external edits.
//!
//! The watcher observes the directory and classifies events per file: a write
//! to a known file emits `Changed`, a write to a new file `Added`, a remove
//! or rename `Removed` (which also stops tracking the file). Group names are
//! the file stems.
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use notify::{RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::{
    adapters::repository::memory::InMemoryRepository,
    config::models::ServiceConfig,
    ports::repository::{
        ConfigurationState, DefinitionMap, GroupDefinitions, RepoChangeEvent, RepoResult,
        Repository, RepositoryError,
    },
};

const GROUP_FILE_EXTENSION: &str = "yaml";
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Parse one group file's bytes, resolving service-level inheritance.
pub(crate) fn parse_group(
    service: &ServiceConfig,
    bytes: &[u8],
) -> Result<Vec<crate::config::models::EndpointConfig>, RepositoryError> {
    let group: GroupDefinitions = serde_yaml::from_slice(bytes)?;
    let mut definitions = group.definitions;
    for def in &mut definitions {
        def.inherit_from_service(service);
    }
    Ok(definitions)
}

fn group_name(path: &Path) -> Option<String> {
    if path.extension().and_then(|e| e.to_str()) != Some(GROUP_FILE_EXTENSION) {
        return None;
    }
    path.file_stem()
        .and_then(|s| s.to_str())
        .map(str::to_string)
}

/// Definition store rooted at a directory of per-group YAML files.
pub struct FileSystemRepository {
    inner: InMemoryRepository,
    source_path: PathBuf,
    // The watcher must stay alive for events to flow.
    _watcher: Mutex<notify::RecommendedWatcher>,
    watched: Arc<Mutex<HashSet<String>>>,
    event_rx: Mutex<Option<mpsc::Receiver<RepoChangeEvent>>>,
}

impl FileSystemRepository {
    /// Load every `<group>.yaml` under `dir` and start watching the
    /// directory for changes.
    pub fn new(service: &ServiceConfig, dir: &Path) -> RepoResult<Self> {
        let inner = InMemoryRepository::new();
        let watched = Arc::new(Mutex::new(HashSet::new()));

        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            let Some(group) = group_name(&path) else {
                continue;
            };
            let bytes = std::fs::read(&path)?;
            let definitions = parse_group(service, &bytes)?;
            inner.ensure_group(&group);
            for definition in definitions {
                inner.add(&group, definition)?;
            }
            watched.lock().expect("watched lock").insert(group);
        }

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let watcher = Self::init_watcher(dir, service.clone(), watched.clone(), tx)?;

        Ok(Self {
            inner,
            source_path: dir.to_path_buf(),
            _watcher: Mutex::new(watcher),
            watched,
            event_rx: Mutex::new(Some(rx)),
        })
    }

    fn init_watcher(
        dir: &Path,
        service: ServiceConfig,
        watched: Arc<Mutex<HashSet<String>>>,
        tx: mpsc::Sender<RepoChangeEvent>,
    ) -> RepoResult<notify::RecommendedWatcher> {
        let mut watcher = notify::recommended_watcher(
            move |res: Result<notify::Event, notify::Error>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = %e, "file watch error");
                        return;
                    }
                };

                for path in &event.paths {
                    let Some(group) = group_name(path) else {
                        continue;
                    };

                    let change = if event.kind.is_remove()
                        || matches!(
                            event.kind,
                            notify::EventKind::Modify(notify::event::ModifyKind::Name(_))
                        ) && !path.exists()
                    {
                        watched.lock().expect("watched lock").remove(&group);
                        Some(RepoChangeEvent {
                            group,
                            state: ConfigurationState::Removed,
                            definitions: Vec::new(),
                        })
                    } else if event.kind.is_modify() || event.kind.is_create() {
                        match std::fs::read(path) {
                            Ok(bytes) => match parse_group(&service, &bytes) {
                                Ok(definitions) => {
                                    let newly_watched =
                                        watched.lock().expect("watched lock").insert(group.clone());
                                    Some(RepoChangeEvent {
                                        group,
                                        state: if newly_watched {
                                            ConfigurationState::Added
                                        } else {
                                            ConfigurationState::Changed
                                        },
                                        definitions,
                                    })
                                }
                                Err(e) => {
                                    tracing::error!(group, error = %e, "couldn't parse definition file");
                                    None
                                }
                            },
                            Err(e) => {
                                tracing::error!(group, error = %e, "couldn't read definition file");
                                None
                            }
                        }
                    } else {
                        None
                    };

                    if let Some(change) = change {
                        if tx.blocking_send(change).is_err() {
                            tracing::debug!("repository event channel closed");
                        }
                    }
                }
            },
        )
        .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RepositoryError::Io(std::io::Error::other(e)))?;

        Ok(watcher)
    }

    fn group_path(&self, group: &str) -> PathBuf {
        self.source_path.join(format!("{group}.{GROUP_FILE_EXTENSION}"))
    }
}

#[async_trait]
impl Repository for FileSystemRepository {
    async fn find_all(&self) -> RepoResult<Vec<DefinitionMap>> {
        self.inner.find_all().await
    }

    async fn write(&self, maps: &mut [DefinitionMap]) -> RepoResult<()> {
        let mut kept = Vec::with_capacity(maps.len());
        for dm in maps.iter_mut() {
            let path = self.group_path(&dm.name);
            match dm.state {
                ConfigurationState::Removed => {
                    // A group can be created and dropped without ever being
                    // persisted.
                    if let Err(e) = std::fs::remove_file(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            return Err(e.into());
                        }
                    }
                    self.watched.lock().expect("watched lock").remove(&dm.name);
                    dm.state = ConfigurationState::None;
                    continue;
                }
                ConfigurationState::Added | ConfigurationState::Changed => {
                    let group = GroupDefinitions {
                        definitions: dm.definitions.clone(),
                    };
                    let data = serde_yaml::to_string(&group)?;
                    std::fs::write(&path, data)?;
                    self.watched
                        .lock()
                        .expect("watched lock")
                        .insert(dm.name.clone());
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
        Ok(())
    }

    fn watch(&self) -> Option<mpsc::Receiver<RepoChangeEvent>> {
        self.event_rx.lock().expect("event receiver lock").take()
    }
}
