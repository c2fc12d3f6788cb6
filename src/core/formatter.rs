//! Projection of decoded backend bodies.
//!
//! An [`EntityFormatter`] is compiled once per backend from its config and
//! applied to every decoded response. Operations run in a fixed order:
//! target pluck, whitelist, blacklist, mapping, group wrap. Dotted paths
//! descend object maps only; any non-map intermediate stops the descent.
//!
//! Collection bodies reach the formatter already wrapped under the synthetic
//! `"collection"` key by the decoder.
use serde_json::{Map, Value};

use crate::config::models::BackendConfig;

/// Synthetic key under which collection (array) bodies are wrapped.
pub const COLLECTION_KEY: &str = "collection";

/// Compiled projection pipeline for one backend's responses.
#[derive(Debug, Clone, Default)]
pub struct EntityFormatter {
    target: Option<Vec<String>>,
    whitelist: Vec<Vec<String>>,
    blacklist: Vec<Vec<String>>,
    mapping: Vec<(String, String)>,
    group: Option<String>,
}

fn split_path(path: &str) -> Vec<String> {
    path.split('.').map(str::to_string).collect()
}

impl EntityFormatter {
    pub fn from_backend(backend: &BackendConfig) -> Self {
        Self {
            target: (!backend.target.is_empty()).then(|| split_path(&backend.target)),
            whitelist: backend.whitelist.iter().map(|p| split_path(p)).collect(),
            blacklist: backend.blacklist.iter().map(|p| split_path(p)).collect(),
            mapping: backend
                .mapping
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            group: (!backend.group.is_empty()).then(|| backend.group.clone()),
        }
    }

    /// True when no projection is configured and `format` would be identity.
    pub fn is_identity(&self) -> bool {
        self.target.is_none()
            && self.whitelist.is_empty()
            && self.blacklist.is_empty()
            && self.mapping.is_empty()
            && self.group.is_none()
    }

    /// Apply the compiled projections to a decoded body.
    pub fn format(&self, data: Map<String, Value>) -> Map<String, Value> {
        let mut data = data;

        if let Some(target) = &self.target {
            data = pluck(&data, target);
        }

        if !self.whitelist.is_empty() {
            let mut kept = Map::new();
            for path in &self.whitelist {
                copy_path(&data, &mut kept, path);
            }
            data = kept;
        }

        for path in &self.blacklist {
            remove_path(&mut data, path);
        }

        for (from, to) in &self.mapping {
            if let Some(value) = data.remove(from) {
                data.insert(to.clone(), value);
            }
        }

        if let Some(group) = &self.group {
            let mut wrapped = Map::new();
            wrapped.insert(group.clone(), Value::Object(data));
            data = wrapped;
        }

        data
    }
}

/// Replace the document with the object at `path`; anything else (missing
/// path, non-object leaf) yields an empty document.
fn pluck(data: &Map<String, Value>, path: &[String]) -> Map<String, Value> {
    let mut current = data;
    for (i, key) in path.iter().enumerate() {
        match current.get(key) {
            Some(Value::Object(next)) if i + 1 == path.len() => return next.clone(),
            Some(Value::Object(next)) => current = next,
            _ => return Map::new(),
        }
    }
    data.clone()
}

/// Copy the value at `path` from `source` into `dest`, recreating the
/// intermediate objects.
fn copy_path(source: &Map<String, Value>, dest: &mut Map<String, Value>, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = source;
    for key in parents {
        match current.get(key) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    let Some(value) = current.get(last) else {
        return;
    };

    let mut slot = dest;
    for key in parents {
        slot = slot
            .entry(key.clone())
            .or_insert_with(|| Value::Object(Map::new()))
            .as_object_mut()
            .expect("intermediate nodes are created as objects");
    }
    slot.insert(last.clone(), value.clone());
}

/// Remove the value at `path`, leaving intermediates in place.
fn remove_path(data: &mut Map<String, Value>, path: &[String]) {
    let Some((last, parents)) = path.split_last() else {
        return;
    };

    let mut current = data;
    for key in parents {
        match current.get_mut(key) {
            Some(Value::Object(next)) => current = next,
            _ => return,
        }
    }
    current.remove(last);
}
