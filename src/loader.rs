//! Test file discovery and loading.
//!
//! Finds YAML test files on disk, reads multi-document YAML streams, and
//! locates the optional per-tree configuration.

use crate::schema::TestConfig;
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};

/// Error type for loading operations.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// Failed to read a file or directory.
    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// Failed to parse YAML.
    #[error("invalid YAML in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// The default-tags file applied to every test file at or below its directory.
pub const DEFAULT_TAGS_FILENAME: &str = "yamltest-defaults.yaml";

/// Directory holding the per-tree configuration file.
pub const CONFIG_DIRNAME: &str = ".yamltest";

/// The configuration file inside [`CONFIG_DIRNAME`].
pub const CONFIG_FILENAME: &str = "config";

/// Read a file into a string.
pub fn read_text(path: &Path) -> Result<String, LoadError> {
    std::fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Load every document of a YAML stream. Empty documents are dropped.
pub fn load_yaml_documents(path: &Path) -> Result<Vec<Value>, LoadError> {
    let contents = read_text(path)?;
    parse_yaml_documents(path, &contents)
}

/// Parse every document of a YAML stream held in memory.
pub fn parse_yaml_documents(path: &Path, contents: &str) -> Result<Vec<Value>, LoadError> {
    let mut documents = Vec::new();
    for document in serde_yaml::Deserializer::from_str(contents) {
        let value = Value::deserialize(document).map_err(|source| LoadError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        if !value.is_null() {
            documents.push(value);
        }
    }
    Ok(documents)
}

/// Find all test files in a directory, or return the single file.
pub fn find_test_files(path: &Path) -> Result<Vec<PathBuf>, LoadError> {
    if path.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut files = Vec::new();
    collect_test_files_recursive(path, &mut files)?;
    files.sort();
    Ok(files)
}

fn collect_test_files_recursive(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), LoadError> {
    let entries = std::fs::read_dir(dir).map_err(|source| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    for entry in entries {
        let entry = entry.map_err(|source| LoadError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();

        if path.is_dir() {
            if path.file_name().is_some_and(|f| f == CONFIG_DIRNAME) {
                continue;
            }
            collect_test_files_recursive(&path, files)?;
        } else if let Some(ext) = path.extension().and_then(|e| e.to_str())
            && (ext == "yaml" || ext == "yml")
        {
            // Skip the default tags file
            if path.file_name().is_some_and(|f| f == DEFAULT_TAGS_FILENAME) {
                continue;
            }
            files.push(path);
        }
    }
    Ok(())
}

/// Configuration found by searching upward from a directory.
#[derive(Debug, Clone)]
pub struct FoundConfig {
    /// Directory that contains the `.yamltest` directory.
    pub root: PathBuf,
    pub config: TestConfig,
}

/// Load `.yamltest/config` from `start` or its nearest ancestor that has one.
///
/// Returns `None` if no config exists, `Err` if one exists but is invalid.
pub fn find_test_config(start: &Path) -> Result<Option<FoundConfig>, LoadError> {
    for dir in start.ancestors() {
        let config_path = dir.join(CONFIG_DIRNAME).join(CONFIG_FILENAME);
        if !config_path.is_file() {
            continue;
        }

        let contents = read_text(&config_path)?;
        let config: TestConfig = if contents.trim().is_empty() {
            TestConfig::default()
        } else {
            serde_yaml::from_str(&contents).map_err(|source| LoadError::Yaml {
                path: config_path.clone(),
                source,
            })?
        };
        tracing::debug!("loaded test config from {}", config_path.display());
        return Ok(Some(FoundConfig {
            root: dir.to_path_buf(),
            config,
        }));
    }
    Ok(None)
}

/// Decide where tests live when no path is given.
///
/// Uses the config's `testDirectory` (relative to the config's root), then
/// the directory of the nearest default-tags file, then `cwd`.
pub fn default_test_directory(cwd: &Path, config: Option<&FoundConfig>) -> PathBuf {
    if let Some(found) = config
        && let Some(dir) = &found.config.test_directory
    {
        return found.root.join(dir);
    }

    crate::tags::find_default_tags_file(cwd)
        .and_then(|file| file.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| cwd.to_path_buf())
}
