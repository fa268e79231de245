//! Detection Engine Configuration
//!
//! A YAML document tree addressed by dotted paths (`detect-engine.profile`).
//! Sections may be plain maps or Suricata-style lists of single-key maps;
//! lookups descend into both. Reloads load their file under a unique prefix
//! (`detect-engine-reloads.<n>`) and read through a [`ConfigView`] bound to
//! that prefix.

use crate::error::{DetectError, Result};
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Read access to a configuration tree
pub trait ConfigSource: Send + Sync {
    /// Scalar at `path` rendered as text; an empty node yields `""`
    fn get_scalar(&self, path: &str) -> Option<String>;

    /// Node at `path`
    fn get_subtree(&self, path: &str) -> Option<Value>;

    /// Boolean scalar (`yes`/`true`/`on`/`1`)
    fn get_bool(&self, path: &str) -> Option<bool> {
        self.get_scalar(path).map(|v| is_true(&v))
    }
}

pub fn is_true(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "yes" | "true" | "on" | "1"
    )
}

/// Process-wide configuration store
pub struct ConfigStore {
    root: ArcSwap<Value>,
    writer: Mutex<()>,
}

impl ConfigStore {
    pub fn new() -> Self {
        Self {
            root: ArcSwap::from_pointee(Value::Mapping(Mapping::new())),
            writer: Mutex::new(()),
        }
    }

    /// Build a store from YAML text
    pub fn from_yaml(text: &str) -> Result<Self> {
        let store = Self::new();
        store.load_str(text)?;
        Ok(store)
    }

    /// Replace the whole document
    pub fn load_str(&self, text: &str) -> Result<()> {
        let doc = parse_document(text)?;
        let _guard = self.writer.lock();
        self.root.store(Arc::new(doc));
        Ok(())
    }

    pub fn load_file(&self, path: &Path) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.load_str(&content)
    }

    /// Load a document under `prefix`; the prefix must not exist yet
    pub fn load_str_with_prefix(&self, text: &str, prefix: &str) -> Result<()> {
        let doc = parse_document(text)?;
        let _guard = self.writer.lock();
        let current = self.root.load_full();
        if lookup(&current, prefix).is_some() {
            return Err(DetectError::PrefixExists(prefix.to_string()));
        }
        let mut root = (*current).clone();
        insert(&mut root, prefix, doc)?;
        self.root.store(Arc::new(root));
        tracing::debug!(prefix, "Loaded configuration under prefix");
        Ok(())
    }

    pub fn load_file_with_prefix(&self, path: &Path, prefix: &str) -> Result<()> {
        let content = std::fs::read_to_string(path)?;
        self.load_str_with_prefix(&content, prefix)
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        lookup(&self.root.load(), prefix).is_some()
    }

    /// Remove the subtree at `prefix`; returns whether it existed
    pub fn remove_prefix(&self, prefix: &str) -> bool {
        let _guard = self.writer.lock();
        let mut root = (*self.root.load_full()).clone();
        let removed = remove(&mut root, prefix);
        if removed {
            self.root.store(Arc::new(root));
            tracing::debug!(prefix, "Removed configuration prefix");
        }
        removed
    }

    /// Set a scalar, creating intermediate maps
    pub fn set(&self, path: &str, value: &str) -> Result<()> {
        let _guard = self.writer.lock();
        let mut root = (*self.root.load_full()).clone();
        insert(&mut root, path, Value::String(value.to_string()))?;
        self.root.store(Arc::new(root));
        Ok(())
    }
}

impl Default for ConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSource for ConfigStore {
    fn get_scalar(&self, path: &str) -> Option<String> {
        lookup(&self.root.load(), path).and_then(scalar_to_string)
    }

    fn get_subtree(&self, path: &str) -> Option<Value> {
        lookup(&self.root.load(), path).cloned()
    }
}

/// A source read through an optional prefix
#[derive(Clone, Copy)]
pub struct ConfigView<'a> {
    source: &'a dyn ConfigSource,
    prefix: Option<&'a str>,
}

impl<'a> ConfigView<'a> {
    pub fn new(source: &'a dyn ConfigSource, prefix: Option<&'a str>) -> Self {
        Self { source, prefix }
    }

    pub fn prefix(&self) -> Option<&'a str> {
        self.prefix
    }

    fn full_path(&self, path: &str) -> String {
        match self.prefix {
            Some(prefix) => format!("{}.{}", prefix, path),
            None => path.to_string(),
        }
    }
}

impl ConfigSource for ConfigView<'_> {
    fn get_scalar(&self, path: &str) -> Option<String> {
        self.source.get_scalar(&self.full_path(path))
    }

    fn get_subtree(&self, path: &str) -> Option<Value> {
        self.source.get_subtree(&self.full_path(path))
    }
}

/// Removes a loaded prefix from the store when dropped
pub struct PrefixGuard {
    store: Arc<ConfigStore>,
    prefix: String,
}

impl PrefixGuard {
    pub fn new(store: Arc<ConfigStore>, prefix: String) -> Self {
        Self { store, prefix }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Drop for PrefixGuard {
    fn drop(&mut self) {
        self.store.remove_prefix(&self.prefix);
    }
}

impl std::fmt::Debug for PrefixGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("PrefixGuard").field(&self.prefix).finish()
    }
}

/// Reload tunables, read from `detect-engine.reload`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReloadConfig {
    /// Adoption wait granularity
    pub poll_interval_ms: u64,
    /// Per worker adoption wait; 0 waits until shutdown
    pub adoption_timeout_ms: u64,
    /// Worker input queue depth
    pub queue_depth: usize,
}

impl Default for ReloadConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            adoption_timeout_ms: 10_000,
            queue_depth: 1024,
        }
    }
}

impl ReloadConfig {
    pub fn from_source(source: &dyn ConfigSource) -> Result<Self> {
        match source.get_subtree("detect-engine.reload") {
            Some(Value::Null) | None => Ok(Self::default()),
            Some(node) => Ok(serde_yaml::from_value(node)?),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn adoption_timeout(&self) -> Option<Duration> {
        (self.adoption_timeout_ms > 0).then(|| Duration::from_millis(self.adoption_timeout_ms))
    }
}

fn parse_document(text: &str) -> Result<Value> {
    let doc: Value = serde_yaml::from_str(text)?;
    Ok(match doc {
        Value::Null => Value::Mapping(Mapping::new()),
        other => other,
    })
}

fn scalar_to_string(node: &Value) -> Option<String> {
    match node {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}

fn lookup<'a>(mut node: &'a Value, path: &str) -> Option<&'a Value> {
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        node = child(node, segment)?;
    }
    Some(node)
}

fn child<'a>(node: &'a Value, key: &str) -> Option<&'a Value> {
    match node {
        Value::Mapping(map) => map.get(key),
        Value::Sequence(seq) => match key.parse::<usize>() {
            Ok(idx) => seq.get(idx),
            // List of single-key maps: `- profile: medium`
            Err(_) => seq
                .iter()
                .find_map(|item| item.as_mapping().and_then(|m| m.get(key))),
        },
        _ => None,
    }
}

fn insert(root: &mut Value, path: &str, value: Value) -> Result<()> {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return Err(DetectError::Config("empty configuration path".into()));
    };

    let mut node = root;
    for segment in parents {
        let map = node
            .as_mapping_mut()
            .ok_or_else(|| DetectError::Config(format!("{} is not a map", path)))?;
        node = map
            .entry(Value::String(segment.to_string()))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
    }
    node.as_mapping_mut()
        .ok_or_else(|| DetectError::Config(format!("{} is not a map", path)))?
        .insert(Value::String(last.to_string()), value);
    Ok(())
}

fn remove(root: &mut Value, path: &str) -> bool {
    let segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    let Some((last, parents)) = segments.split_last() else {
        return false;
    };

    let mut node = root;
    for segment in parents {
        match node.as_mapping_mut().and_then(|m| m.get_mut(*segment)) {
            Some(next) => node = next,
            None => return false,
        }
    }
    node.as_mapping_mut()
        .map(|m| m.remove(*last).is_some())
        .unwrap_or(false)
}
