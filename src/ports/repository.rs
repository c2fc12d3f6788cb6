//! Ports and shared types for the endpoint definition store.
//!
//! A repository owns groups of endpoint definitions (one group per file or
//! store key) and persists them on demand. Stores that can observe external
//! changes also implement the watcher side, emitting [`RepoChangeEvent`]s the
//! reload supervisor consumes.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::config::{
    models::EndpointConfig,
    validation::{EndpointValidator, ValidationError},
};

/// Pending persistence state of a definition group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConfigurationState {
    #[default]
    None,
    Added,
    Changed,
    Removed,
}

/// A named group of endpoint definitions, persisted as one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionMap {
    pub name: String,
    #[serde(skip)]
    pub state: ConfigurationState,
    pub definitions: Vec<EndpointConfig>,
}

impl DefinitionMap {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: ConfigurationState::None,
            definitions: Vec::new(),
        }
    }
}

/// On-disk / on-store shape of one group: `{definitions: [...]}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupDefinitions {
    pub definitions: Vec<EndpointConfig>,
}

/// The live route configuration: an ordered list of definition groups.
///
/// Invariant: listen paths are unique across every group, names within one.
#[derive(Debug, Clone, Default)]
pub struct Configuration {
    pub definition_maps: Vec<DefinitionMap>,
}

impl Configuration {
    pub fn new(definition_maps: Vec<DefinitionMap>) -> Self {
        Self { definition_maps }
    }

    /// Structural equality over group names and definitions, ignoring the
    /// transient persistence state. The supervisor uses this to short-circuit
    /// no-op reloads.
    pub fn equals_to(&self, other: &Configuration) -> bool {
        self.definition_maps.len() == other.definition_maps.len()
            && self
                .definition_maps
                .iter()
                .zip(&other.definition_maps)
                .all(|(a, b)| a.name == b.name && a.definitions == b.definitions)
    }

    pub fn all_definitions(&self) -> impl Iterator<Item = &EndpointConfig> {
        self.definition_maps.iter().flat_map(|dm| &dm.definitions)
    }

    pub fn group(&self, name: &str) -> Option<&DefinitionMap> {
        self.definition_maps
            .iter()
            .find(|dm| dm.name.eq_ignore_ascii_case(name))
    }

    pub fn group_mut(&mut self, name: &str) -> Option<&mut DefinitionMap> {
        self.definition_maps
            .iter_mut()
            .find(|dm| dm.name.eq_ignore_ascii_case(name))
    }

    pub fn find_by_name(&self, group: &str, name: &str) -> Option<&EndpointConfig> {
        self.group(group)?.definitions.iter().find(|d| d.name == name)
    }

    /// Validate every definition and both uniqueness invariants (names per
    /// group, listen paths globally). Used on full snapshots arriving from
    /// repository watchers before they can go live.
    pub fn validate(&self) -> Result<(), ValidationError> {
        for dm in &self.definition_maps {
            for (i, def) in dm.definitions.iter().enumerate() {
                EndpointValidator::validate(def)?;
                EndpointValidator::check_duplicates(&dm.name, &dm.name, &dm.definitions[..i], def)?;
            }
        }
        // Listen paths across distinct groups.
        for (i, dm) in self.definition_maps.iter().enumerate() {
            for other in &self.definition_maps[..i] {
                for def in &dm.definitions {
                    EndpointValidator::check_duplicates(
                        &dm.name,
                        &other.name,
                        &other.definitions,
                        def,
                    )?;
                }
            }
        }
        Ok(())
    }

    /// Reject the candidate when its name exists in the target group or its
    /// listen path exists anywhere. Listen-path uniqueness is global by
    /// design, even for mutations scoped to a single group.
    pub fn check_duplicates(
        &self,
        group: &str,
        candidate: &EndpointConfig,
    ) -> Result<(), ValidationError> {
        for dm in &self.definition_maps {
            EndpointValidator::check_duplicates(group, &dm.name, &dm.definitions, candidate)?;
        }
        Ok(())
    }

    /// Validate and insert a definition into an existing group.
    pub fn add_definition(
        &mut self,
        group: &str,
        definition: EndpointConfig,
    ) -> Result<(), RepositoryError> {
        EndpointValidator::validate(&definition)?;
        self.check_duplicates(group, &definition)?;
        let dm = self
            .group_mut(group)
            .ok_or_else(|| RepositoryError::GroupNotFound(group.to_string()))?;
        dm.definitions.push(definition);
        dm.state = ConfigurationState::Changed;
        Ok(())
    }

    /// Validate and replace the definition with the same name.
    pub fn update_definition(
        &mut self,
        group: &str,
        definition: EndpointConfig,
    ) -> Result<(), RepositoryError> {
        EndpointValidator::validate(&definition)?;

        // The replaced definition must not collide with anything but itself.
        for dm in &self.definition_maps {
            for def in &dm.definitions {
                if dm.name.eq_ignore_ascii_case(group) && def.name == definition.name {
                    continue;
                }
                if def.endpoint.eq_ignore_ascii_case(&definition.endpoint) {
                    return Err(ValidationError::Conflict {
                        name: definition.name.clone(),
                        message: format!(
                            "listen path '{}' already registered (group '{}')",
                            definition.endpoint, dm.name
                        ),
                    }
                    .into());
                }
            }
        }

        let dm = self
            .group_mut(group)
            .ok_or_else(|| RepositoryError::GroupNotFound(group.to_string()))?;
        let slot = dm
            .definitions
            .iter_mut()
            .find(|d| d.name == definition.name)
            .ok_or_else(|| RepositoryError::DefinitionNotFound(definition.name.clone()))?;
        *slot = definition;
        dm.state = ConfigurationState::Changed;
        Ok(())
    }

    /// Remove the named definition from a group.
    pub fn remove_definition(&mut self, group: &str, name: &str) -> Result<(), RepositoryError> {
        let dm = self
            .group_mut(group)
            .ok_or_else(|| RepositoryError::GroupNotFound(group.to_string()))?;
        let before = dm.definitions.len();
        dm.definitions.retain(|d| d.name != name);
        if dm.definitions.len() == before {
            return Err(RepositoryError::DefinitionNotFound(name.to_string()));
        }
        dm.state = ConfigurationState::Changed;
        Ok(())
    }

    pub fn add_group(&mut self, name: &str) -> Result<(), RepositoryError> {
        if self.group(name).is_some() {
            return Err(RepositoryError::GroupExists(name.to_string()));
        }
        let mut dm = DefinitionMap::new(name);
        dm.state = ConfigurationState::Added;
        self.definition_maps.push(dm);
        Ok(())
    }

    pub fn remove_group(&mut self, name: &str) -> Result<(), RepositoryError> {
        let dm = self
            .group_mut(name)
            .ok_or_else(|| RepositoryError::GroupNotFound(name.to_string()))?;
        dm.state = ConfigurationState::Removed;
        dm.definitions.clear();
        Ok(())
    }

    /// Drop groups marked removed and reset remaining states. Called after a
    /// successful persist.
    pub fn compact(&mut self) {
        self.definition_maps
            .retain(|dm| dm.state != ConfigurationState::Removed);
        for dm in &mut self.definition_maps {
            dm.state = ConfigurationState::None;
        }
    }
}

/// A change observed by a repository watcher: the affected group and its new
/// contents.
#[derive(Debug, Clone)]
pub struct RepoChangeEvent {
    pub group: String,
    pub state: ConfigurationState,
    pub definitions: Vec<EndpointConfig>,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum RepositoryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Definition parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Invalid repository DSN '{dsn}': {reason}")]
    InvalidDsn { dsn: String, reason: String },

    #[error("Definition group not found: {0}")]
    GroupNotFound(String),

    #[error("Definition group already exists: {0}")]
    GroupExists(String),

    #[error("API definition not found: {0}")]
    DefinitionNotFound(String),
}

pub type RepoResult<T> = Result<T, RepositoryError>;

/// Load / persist side of a definition store.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
    /// Every group currently in the store, validated and inheritance-resolved.
    async fn find_all(&self) -> RepoResult<Vec<DefinitionMap>>;

    /// Persist groups according to their pending state (`Removed` deletes,
    /// `Added`/`Changed` serializes and writes), then reset states to `None`.
    async fn write(&self, maps: &mut [DefinitionMap]) -> RepoResult<()>;

    /// Release watchers and sessions.
    fn close(&self) -> RepoResult<()>;

    /// Take the change-event receiver, when this store can observe external
    /// changes. Yields `None` for passive stores and on repeated calls.
    fn watch(&self) -> Option<mpsc::Receiver<RepoChangeEvent>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, path: &str) -> EndpointConfig {
        serde_yaml::from_str(&format!(
            "name: {name}\nendpoint: {path}\nbackend:\n  - url_pattern: /x\n    hosts: [\"http://s:1\"]\n"
        ))
        .unwrap()
    }

    fn configuration() -> Configuration {
        let mut group = DefinitionMap::new("apis");
        group.definitions.push(endpoint("users", "/users"));
        Configuration::new(vec![group])
    }

    #[test]
    fn add_rejects_global_listen_path_collision() {
        let mut config = configuration();
        config.definition_maps.push(DefinitionMap::new("other"));

        let err = config
            .add_definition("other", endpoint("different-name", "/users"))
            .unwrap_err();
        assert!(matches!(err, RepositoryError::Validation(_)), "{err}");
    }

    #[test]
    fn add_rejects_duplicate_name_in_group() {
        let mut config = configuration();
        assert!(config.add_definition("apis", endpoint("users", "/other")).is_err());
    }

    #[test]
    fn update_keeps_own_listen_path() {
        let mut config = configuration();
        let mut updated = endpoint("users", "/users");
        updated.method = "GET".to_string();
        assert!(config.update_definition("apis", updated).is_ok());
    }

    #[test]
    fn update_rejects_stealing_listen_path() {
        let mut config = configuration();
        config
            .add_definition("apis", endpoint("orders", "/orders"))
            .unwrap();
        let stolen = endpoint("orders", "/users");
        assert!(config.update_definition("apis", stolen).is_err());
    }

    #[test]
    fn remove_unknown_definition_is_not_found() {
        let mut config = configuration();
        let err = config.remove_definition("apis", "ghost").unwrap_err();
        assert!(matches!(err, RepositoryError::DefinitionNotFound(_)));
    }

    #[test]
    fn equality_ignores_persistence_state() {
        let a = configuration();
        let mut b = configuration();
        b.definition_maps[0].state = ConfigurationState::Changed;
        assert!(a.equals_to(&b));

        b.definition_maps[0].definitions.push(endpoint("extra", "/extra"));
        assert!(!a.equals_to(&b));
    }

    #[test]
    fn compact_drops_removed_groups() {
        let mut config = configuration();
        config.add_group("doomed").unwrap();
        config.remove_group("doomed").unwrap();
        config.compact();
        assert!(config.group("doomed").is_none());
        assert_eq!(config.definition_maps[0].state, ConfigurationState::None);
    }
}
