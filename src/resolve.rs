//! Locating the CLI a test runs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// CLIs tried, in order, when a test names none.
pub const DEFAULT_KNOWN_CLIS: &[&str] = &["ai", "spx", "vz"];

/// Resolves CLI names to executables and remembers the answers.
///
/// Candidate directories are searched in order: the runner's own
/// directory, the current directory, then `PATH`. Each directory is also
/// searched in its `net*` subfolders. A candidate is accepted if a
/// `<name>.dll` sits beside it, or if it is the only match below the
/// directory.
#[derive(Debug, Default)]
pub struct ExecutableResolver {
    search_dirs: Vec<PathBuf>,
    cache: Mutex<HashMap<String, Option<PathBuf>>>,
}

impl ExecutableResolver {
    /// A resolver over the standard search directories.
    pub fn new() -> Self {
        let mut dirs = Vec::new();
        if let Ok(exe) = std::env::current_exe()
            && let Some(dir) = exe.parent()
        {
            dirs.push(dir.to_path_buf());
        }
        if let Ok(cwd) = std::env::current_dir() {
            dirs.push(cwd);
        }
        if let Some(path) = std::env::var_os("PATH") {
            dirs.extend(std::env::split_paths(&path));
        }
        Self::with_search_dirs(dirs)
    }

    pub fn with_search_dirs(search_dirs: Vec<PathBuf>) -> Self {
        Self {
            search_dirs,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Full path of `name`, or `None` if no candidate qualifies.
    pub fn resolve(&self, name: &str) -> Option<PathBuf> {
        if let Ok(cache) = self.cache.lock()
            && let Some(found) = cache.get(name)
        {
            return found.clone();
        }

        let found = self.search(name);
        match &found {
            Some(path) => tracing::debug!("resolved '{name}' to {}", path.display()),
            None => tracing::debug!("cannot resolve '{name}'"),
        }
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(name.to_string(), found.clone());
        }
        found
    }

    /// The only one of `known` that resolves, else the first of `known`.
    pub fn pick_default_cli(&self, known: &[String]) -> Option<String> {
        let resolved: Vec<&String> = known.iter().filter(|cli| self.resolve(cli).is_some()).collect();
        if let [only] = resolved.as_slice() {
            return Some((*only).clone());
        }

        let first = known.first()?;
        tracing::warn!(
            "{} of the known CLIs ({}) found; using '{first}'",
            resolved.len(),
            known.join(", ")
        );
        Some(first.clone())
    }

    fn search(&self, name: &str) -> Option<PathBuf> {
        let path = Path::new(name);
        if path.components().count() > 1 {
            return path.is_file().then(|| path.to_path_buf());
        }

        let file_names = executable_names(name);
        let library = format!("{name}.dll");
        for dir in &self.search_dirs {
            for sub in std::iter::once(dir.clone()).chain(net_subfolders(dir)) {
                for file_name in &file_names {
                    let candidate = sub.join(file_name);
                    if !candidate.is_file() {
                        continue;
                    }
                    if sub.join(&library).is_file() || count_matches(&sub, &library, 3) == 1 {
                        return Some(candidate);
                    }
                    tracing::debug!(
                        "skipping {}: no {library} beside it",
                        candidate.display()
                    );
                }
            }
        }
        None
    }
}

fn executable_names(name: &str) -> Vec<String> {
    if cfg!(windows) && Path::new(name).extension().is_none() {
        vec![format!("{name}.exe"), name.to_string()]
    } else {
        vec![name.to_string()]
    }
}

fn net_subfolders(dir: &Path) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<PathBuf> = entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.is_dir()
                && p.file_name()
                    .and_then(|f| f.to_str())
                    .is_some_and(|f| f.starts_with("net"))
        })
        .collect();
    found.sort();
    found
}

/// Count files named `file_name` below `dir`, stopping past 1 match and
/// after `depth` levels.
fn count_matches(dir: &Path, file_name: &str, depth: usize) -> usize {
    let mut count = usize::from(dir.join(file_name).is_file());
    if depth == 0 || count > 1 {
        return count;
    }
    let Ok(entries) = std::fs::read_dir(dir) else {
        return count;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            count += count_matches(&path, file_name, depth - 1);
            if count > 1 {
                break;
            }
        }
    }
    count
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "").unwrap();
    }

    #[test]
    fn resolves_with_colocated_library() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("mycli"));
        touch(&dir.path().join("mycli.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("mycli"), Some(dir.path().join("mycli")));
    }

    #[test]
    fn executable_without_library_is_rejected() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("mycli"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("mycli"), None);
    }

    #[test]
    fn resolves_with_single_library_below() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("mycli"));
        touch(&dir.path().join("lib").join("mycli.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("mycli"), Some(dir.path().join("mycli")));
    }

    #[test]
    fn library_found_twice_below_is_rejected() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("mycli"));
        touch(&dir.path().join("a").join("mycli.dll"));
        touch(&dir.path().join("b").join("mycli.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("mycli"), None);
    }

    #[test]
    fn resolves_in_net_subfolder() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("net8.0").join("mycli"));
        touch(&dir.path().join("net8.0").join("mycli.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(
            resolver.resolve("mycli"),
            Some(dir.path().join("net8.0").join("mycli"))
        );
    }

    #[test]
    fn ambiguous_without_dll_is_rejected() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("net6.0").join("mycli"));
        touch(&dir.path().join("net8.0").join("mycli"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("mycli"), None);
    }

    #[test]
    fn ambiguous_with_dll_is_accepted() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("net6.0").join("mycli"));
        touch(&dir.path().join("net8.0").join("mycli"));
        touch(&dir.path().join("net8.0").join("mycli.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(
            resolver.resolve("mycli"),
            Some(dir.path().join("net8.0").join("mycli"))
        );
    }

    #[test]
    fn missing_is_none_and_cached() {
        let dir = tempdir().unwrap();
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        assert_eq!(resolver.resolve("nope"), None);
        touch(&dir.path().join("nope"));
        assert_eq!(resolver.resolve("nope"), None);
    }

    #[test]
    fn pick_default_cli_takes_only_resolvable() {
        let dir = tempdir().unwrap();
        touch(&dir.path().join("spx"));
        touch(&dir.path().join("spx.dll"));
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        let known: Vec<String> = DEFAULT_KNOWN_CLIS.iter().map(|s| s.to_string()).collect();
        assert_eq!(resolver.pick_default_cli(&known).as_deref(), Some("spx"));
    }

    #[test]
    fn pick_default_cli_falls_back_to_first_known() {
        let dir = tempdir().unwrap();
        for name in ["spx", "spx.dll", "vz", "vz.dll"] {
            touch(&dir.path().join(name));
        }
        let resolver = ExecutableResolver::with_search_dirs(vec![dir.path().to_path_buf()]);
        let known: Vec<String> = DEFAULT_KNOWN_CLIS.iter().map(|s| s.to_string()).collect();
        assert_eq!(resolver.pick_default_cli(&known).as_deref(), Some("ai"));
        assert_eq!(resolver.pick_default_cli(&[]), None);
    }
}
