//! Hierarchical test tags.
//!
//! Tags are a multimap from name to values. Every nesting level of a test
//! file copies its parent's tags and adds its own `tag:`/`tags:` entries, so
//! a child never changes what its siblings see.

use crate::loader::{self, LoadError};
use crate::yaml::{self, Node};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Name/value tags attached to a test, in insertion order per name.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
#[serde(transparent)]
pub struct Tags(BTreeMap<String, Vec<String>>);

impl Tags {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `value` under `name`; empty names or values are ignored.
    pub fn add(&mut self, name: &str, value: &str) {
        if name.is_empty() || value.is_empty() {
            return;
        }
        self.0
            .entry(name.to_string())
            .or_default()
            .push(value.to_string());
    }

    /// The most recently added value for `name`.
    pub fn last(&self, name: &str) -> Option<&str> {
        self.0.get(name).and_then(|v| v.last()).map(String::as_str)
    }

    /// Flattened `(name, value)` pairs.
    pub fn traits(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Whether any tag name or value equals `marker`, ignoring case.
    pub fn has_trait(&self, marker: &str) -> bool {
        self.traits()
            .any(|(k, v)| k.eq_ignore_ascii_case(marker) || v.eq_ignore_ascii_case(marker))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// A copy of these tags updated with the `tag:`/`tags:` keys of `mapping`.
    pub fn update_copy(&self, mapping: &Mapping) -> Tags {
        let tag = mapping.get("tag");
        let tags = mapping.get("tags");
        if tag.is_none() && tags.is_none() {
            return self.clone();
        }

        let mut updated = self.clone();
        if let Some(value) = tag.and_then(yaml::scalar_string) {
            updated.add("tag", &value);
        }
        if let Some(node) = tags {
            updated.add_tags_node(node);
        }
        updated
    }

    /// Apply a `tags:`-shaped node: comma list, name/value mapping, or a
    /// sequence mixing both.
    fn add_tags_node(&mut self, node: &Value) {
        match Node::classify(node) {
            Node::Scalar(value) => {
                let text = yaml::scalar_string(value).unwrap_or_default();
                for tag in text.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                    self.add("tag", tag);
                }
            }
            Node::Mapping(mapping) => self.add_name_value_tags(mapping),
            Node::Sequence(items) => {
                for item in items {
                    match Node::classify(item) {
                        Node::Scalar(value) => {
                            if let Some(tag) = yaml::scalar_string(value) {
                                self.add("tag", &tag);
                            }
                        }
                        Node::Mapping(mapping) => self.add_name_value_tags(mapping),
                        _ => {}
                    }
                }
            }
            Node::Null => {}
        }
    }

    fn add_name_value_tags(&mut self, mapping: &Mapping) {
        for (key, value) in mapping {
            let Some(name) = yaml::scalar_string(key) else {
                continue;
            };
            match Node::classify(value) {
                Node::Scalar(_) => {
                    if let Some(v) = yaml::scalar_string(value) {
                        self.add(&name, &v);
                    }
                }
                Node::Sequence(_) | Node::Mapping(_) => {
                    self.add(&name, &yaml::to_json_string(value));
                }
                Node::Null => {}
            }
        }
    }
}

/// Find the nearest default-tags file at or above `dir`.
pub fn find_default_tags_file(dir: &Path) -> Option<PathBuf> {
    dir.ancestors()
        .map(|d| d.join(loader::DEFAULT_TAGS_FILENAME))
        .find(|candidate| candidate.is_file())
}

/// Default tags and the raw root mapping of the nearest default-tags file.
#[derive(Debug, Clone, Default)]
pub struct DefaultTags {
    pub tags: Tags,
    pub root: Mapping,
    pub path: Option<PathBuf>,
}

/// Load the default tags that apply to test files in `dir`.
///
/// The root node of the defaults file is treated like a `tags:` value, so
/// every top-level key becomes a tag of the same name.
pub fn load_default_tags(dir: &Path) -> Result<DefaultTags, LoadError> {
    let Some(path) = find_default_tags_file(dir) else {
        return Ok(DefaultTags::default());
    };

    tracing::debug!("loading default tags from {}", path.display());
    let documents = loader::load_yaml_documents(&path)?;
    let shown = path.display().to_string();
    let mut defaults = DefaultTags {
        path: Some(path),
        ..DefaultTags::default()
    };
    if let Some(root) = documents.first() {
        defaults.tags.add_tags_node(root);
        if let Some(mapping) = root.as_mapping() {
            defaults.root = mapping.clone();
        }
    }
    if defaults.tags.is_empty() {
        tracing::warn!("default tags file {shown} has no tags");
    }
    Ok(defaults)
}
