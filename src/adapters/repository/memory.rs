//! In-memory definition store underlying the file and kv-store repositories.
use std::sync::RwLock;

use async_trait::async_trait;

use crate::{
    config::{models::EndpointConfig, validation::EndpointValidator},
    ports::repository::{ConfigurationState, DefinitionMap, RepoResult, Repository},
};

/// Definition groups held in memory behind a readers-writer lock. Duplicate
/// checks run on every insert: names per group, listen paths globally.
#[derive(Default)]
pub struct InMemoryRepository {
    groups: RwLock<Vec<DefinitionMap>>,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and insert one definition, creating its group on first use.
    pub fn add(&self, group: &str, endpoint: EndpointConfig) -> RepoResult<()> {
        EndpointValidator::validate(&endpoint)?;

        let mut groups = self.groups.write().expect("repository lock");

        for dm in groups.iter() {
            EndpointValidator::check_duplicates(group, &dm.name, &dm.definitions, &endpoint)?;
        }

        match groups.iter_mut().find(|dm| dm.name.eq_ignore_ascii_case(group)) {
            Some(dm) => dm.definitions.push(endpoint),
            None => {
                let mut dm = DefinitionMap::new(group);
                dm.definitions.push(endpoint);
                groups.push(dm);
            }
        }
        Ok(())
    }

    /// Register an empty group so later additions have somewhere to land.
    pub fn ensure_group(&self, group: &str) {
        let mut groups = self.groups.write().expect("repository lock");
        if !groups.iter().any(|dm| dm.name.eq_ignore_ascii_case(group)) {
            groups.push(DefinitionMap::new(group));
        }
    }

    /// Replace the whole content (used by stores reloading from disk).
    pub fn replace_all(&self, maps: Vec<DefinitionMap>) {
        *self.groups.write().expect("repository lock") = maps;
    }

    pub fn snapshot(&self) -> Vec<DefinitionMap> {
        self.groups.read().expect("repository lock").clone()
    }
}

#[async_trait]
impl Repository for InMemoryRepository {
    async fn find_all(&self) -> RepoResult<Vec<DefinitionMap>> {
        Ok(self.snapshot())
    }

    async fn write(&self, maps: &mut [DefinitionMap]) -> RepoResult<()> {
        // Nothing durable behind memory: accept the new content as-is.
        let kept: Vec<DefinitionMap> = maps
            .iter()
            .filter(|dm| dm.state != ConfigurationState::Removed)
            .cloned()
            .map(|mut dm| {
                dm.state = ConfigurationState::None;
                dm
            })
            .collect();
        self.replace_all(kept);
        for dm in maps.iter_mut() {
            dm.state = ConfigurationState::None;
        }
        Ok(())
    }

    fn close(&self) -> RepoResult<()> {
        Ok(())
    }
}
