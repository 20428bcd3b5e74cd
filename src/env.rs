//! Environment layering for test processes.
//!
//! A test's environment starts from the current process, is overlaid with
//! the working directory's `.env` file, then with every `env:` node on the
//! way down to the test. Only the variables that differ from the current
//! process are stored on the test.

use crate::yaml::{self, Node};
use serde_yaml::{Mapping, Value};
use std::collections::BTreeMap;
use std::path::Path;

/// Environment variables keyed by name.
pub type Environment = BTreeMap<String, String>;

/// The name of the per-directory environment file.
pub const DOT_ENV_FILENAME: &str = ".env";

/// Snapshot of the current process environment.
///
/// Variables whose name or value is not valid Unicode are skipped.
pub fn current_process_environment() -> Environment {
    std::env::vars_os()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
        .collect()
}

/// The current process environment overlaid with `{dir}/.env`, if present.
pub fn default_environment(working_directory: &Path) -> Environment {
    let mut env = current_process_environment();
    env.extend(environment_from_directory(working_directory));
    env
}

/// Read `{dir}/.env`. A missing or unreadable file yields an empty set.
pub fn environment_from_directory(dir: &Path) -> Environment {
    let path = dir.join(DOT_ENV_FILENAME);
    match std::fs::read_to_string(&path) {
        Ok(content) => parse_dot_env(&content),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Environment::new(),
        Err(e) => {
            tracing::warn!("cannot read {}: {e}", path.display());
            Environment::new()
        }
    }
}

/// Parse `KEY=VALUE` lines. Lines without `=` and `#` comments are ignored.
pub fn parse_dot_env(content: &str) -> Environment {
    content
        .split(['\n', '\r'])
        .filter(|line| !line.trim().is_empty() && !line.trim_start().starts_with('#'))
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

/// A copy of `env` updated with the `env:` node of `mapping`.
///
/// The node may be a mapping or a sequence of mappings; anything else
/// leaves the environment unchanged.
pub fn update_copy(env: &Environment, mapping: &Mapping) -> Environment {
    let Some(node) = mapping.get("env") else {
        return env.clone();
    };

    let mut updated = env.clone();
    match Node::classify(node) {
        Node::Mapping(m) => apply(&mut updated, m),
        Node::Sequence(items) => {
            for item in items.iter().filter_map(Value::as_mapping) {
                apply(&mut updated, item);
            }
        }
        _ => {}
    }
    updated
}

fn apply(env: &mut Environment, mapping: &Mapping) {
    for (key, value) in mapping {
        let (Some(key), Some(value)) = (yaml::scalar_string(key), yaml::scalar_string(value))
        else {
            continue;
        };
        let value = expand_inline(&value, env);
        env.insert(key, value);
    }
}

/// Expand `$(NAME)` references against `env`.
///
/// Unknown names and unterminated references are kept literally.
pub fn expand_inline(s: &str, env: &Environment) -> String {
    if !s.contains("$(") {
        return s.to_string();
    }

    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'(') {
            chars.next(); // consume '('
            let mut var_name = String::new();
            let mut closed = false;
            for c in chars.by_ref() {
                if c == ')' {
                    closed = true;
                    break;
                }
                var_name.push(c);
            }
            match env.get(&var_name) {
                Some(value) if closed => result.push_str(value),
                _ => {
                    result.push_str("$(");
                    result.push_str(&var_name);
                    if closed {
                        result.push(')');
                    }
                }
            }
        } else {
            result.push(c);
        }
    }

    result
}

/// Variables in `check` that are missing from, or differ in, `original`.
pub fn new_and_updated(original: &Environment, check: &Environment) -> Environment {
    check
        .iter()
        .filter(|(k, v)| original.get(*k) != Some(*v))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn env(pairs: &[(&str, &str)]) -> Environment {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_expand_inline() {
        let e = env(&[("HOME", "/home/me"), ("NAME", "x")]);
        assert_eq!(expand_inline("$(HOME)/bin", &e), "/home/me/bin");
        assert_eq!(expand_inline("a-$(NAME)-$(NAME)", &e), "a-x-x");
        assert_eq!(expand_inline("no refs", &e), "no refs");
        assert_eq!(expand_inline("", &e), "");
    }

    #[test]
    fn test_expand_inline_keeps_unknown_and_unclosed() {
        let e = env(&[("A", "1")]);
        assert_eq!(expand_inline("$(MISSING)", &e), "$(MISSING)");
        assert_eq!(expand_inline("$(A", &e), "$(A");
        assert_eq!(expand_inline("$A $(A)", &e), "$A 1");
    }

    #[test]
    fn test_parse_dot_env() {
        let parsed = parse_dot_env("A=1\r\nB=x=y\n\n# comment\nNOEQUALS\nC=\n");
        assert_eq!(parsed, env(&[("A", "1"), ("B", "x=y"), ("C", "")]));
    }

    #[test]
    fn test_dot_env_overrides_process_env() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join(".env"), "PATH=overridden\nYAMLTEST_DOTENV=1\n").unwrap();
        let e = default_environment(dir.path());
        assert_eq!(e.get("PATH").map(String::as_str), Some("overridden"));
        assert_eq!(e.get("YAMLTEST_DOTENV").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_update_copy_mapping_and_sequence() {
        let base = env(&[("ROOT", "/r")]);

        let m: Mapping = serde_yaml::from_str("env:\n  BIN: $(ROOT)/bin\n  N: 3").unwrap();
        let updated = update_copy(&base, &m);
        assert_eq!(updated.get("BIN").map(String::as_str), Some("/r/bin"));
        assert_eq!(updated.get("N").map(String::as_str), Some("3"));
        assert!(!base.contains_key("BIN"));

        let m: Mapping = serde_yaml::from_str("env:\n- A: a\n- B: $(A)b").unwrap();
        let updated = update_copy(&base, &m);
        assert_eq!(updated.get("B").map(String::as_str), Some("ab"));
    }

    #[test]
    fn test_update_copy_ignores_scalar_env() {
        let base = env(&[("X", "1")]);
        let m: Mapping = serde_yaml::from_str("env: nope").unwrap();
        assert_eq!(update_copy(&base, &m), base);
    }

    #[test]
    fn test_new_and_updated() {
        let original = env(&[("A", "1"), ("B", "2")]);
        let check = env(&[("A", "1"), ("B", "3"), ("C", "4")]);
        assert_eq!(new_and_updated(&original, &check), env(&[("B", "3"), ("C", "4")]));
    }
}
