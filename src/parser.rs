//! YAML test case parser.
//!
//! Walks YAML documents and turns every leaf test node into a [`TestCase`].
//! Container nodes (`tests:` and `steps:`) pass their area, class, tags,
//! environment, working directory and matrix down to their children.
//!
//! Malformed test nodes never abort a parse: the test is still produced,
//! with its display name replaced by the error text.

use crate::env::{self, Environment};
use crate::loader::{self, LoadError};
use crate::matrix;
use crate::model::{
    ArgumentSpec, DEFAULT_TIMEOUT_MS, KeyValues, MatrixRow, TestCase, TestId, TestProperties,
};
use crate::tags::{self, Tags};
use crate::yaml::{self, LineLocator, Node};
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};

/// Keys with a meaning of their own at a test node.
pub const RESERVED_KEYS: &[&str] = &[
    "area",
    "class",
    "name",
    "cli",
    "command",
    "script",
    "bash",
    "timeout",
    "foreach",
    "arguments",
    "input",
    "expect",
    "expect-regex",
    "expect-gpt",
    "not-expect",
    "not-expect-regex",
    "parallelize",
    "simulate",
    "skipOnFailure",
    "tag",
    "tags",
    "matrix",
    "matrix-file",
    "workingDirectory",
    "env",
    "sanitize",
    "steps",
    "tests",
];

const DEFAULT_CLASS_NAME: &str = "TestCases";

/// Characters that rule out reading an `@name` value as a file reference.
const INVALID_FILE_NAME_CHARS: &[char] = &['\0', '<', '>', ':', '"', '|', '?', '*'];

fn is_reserved(key: &str) -> bool {
    RESERVED_KEYS.contains(&key)
}

/// Tests parsed from a tree, plus files that could not be loaded.
#[derive(Debug, Default)]
pub struct ParseOutput {
    pub tests: Vec<TestCase>,
    pub errors: Vec<LoadError>,
}

/// Inherited state while descending a YAML document.
#[derive(Debug, Clone)]
struct ParseContext {
    file: PathBuf,
    area: String,
    class: String,
    tags: Tags,
    environment: Environment,
    working_directory: PathBuf,
    matrix: Vec<MatrixRow>,
}

impl ParseContext {
    /// Context for the children of a container node.
    fn child(&self, mapping: &Mapping) -> ParseContext {
        ParseContext {
            file: self.file.clone(),
            area: update_area(mapping, &self.area),
            class: yaml::get_scalar(mapping, "class").unwrap_or_else(|| self.class.clone()),
            tags: self.tags.update_copy(mapping),
            environment: env::update_copy(&self.environment, mapping),
            working_directory: update_working_directory(mapping, &self.working_directory),
            matrix: self.matrix.clone(),
        }
    }

    fn location(&self, line: usize) -> String {
        format!("{}({line})", self.file.display())
    }
}

/// Parses test files, handing out ids that are unique across every file
/// parsed by the same instance.
pub struct TestCaseParser {
    next_id: usize,
    process_env: Environment,
}

impl Default for TestCaseParser {
    fn default() -> Self {
        Self::new()
    }
}

impl TestCaseParser {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            process_env: env::current_process_environment(),
        }
    }

    /// Parse every test file under `path` (or `path` itself if it is a file).
    ///
    /// Files that cannot be read or are not valid YAML are logged and
    /// collected in [`ParseOutput::errors`]; the remaining files are parsed.
    pub fn parse_directory(&mut self, path: &Path) -> Result<ParseOutput, LoadError> {
        let mut output = ParseOutput::default();
        for file in loader::find_test_files(path)? {
            match self.parse_file(&file) {
                Ok(tests) => output.tests.extend(tests),
                Err(e) => {
                    tracing::error!("{e}");
                    output.errors.push(e);
                }
            }
        }
        Ok(output)
    }

    /// Parse the tests of one YAML file.
    pub fn parse_file(&mut self, path: &Path) -> Result<Vec<TestCase>, LoadError> {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let source = loader::read_text(&path)?;
        let documents = loader::parse_yaml_documents(&path, &source)?;

        let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let defaults = tags::load_default_tags(&dir)?;
        if let Some(defaults_path) = &defaults.path {
            tracing::debug!(
                "{} uses default tags from {}",
                path.display(),
                defaults_path.display()
            );
        }
        let working_directory = match defaults.tags.last("workingDirectory") {
            Some(wd) => dir.join(wd),
            None => dir.clone(),
        };
        let environment = env::update_copy(
            &env::default_environment(&working_directory),
            &defaults.root,
        );

        let context = ParseContext {
            area: root_area(&path),
            class: defaults
                .tags
                .last("class")
                .unwrap_or(DEFAULT_CLASS_NAME)
                .to_string(),
            tags: defaults.tags,
            environment,
            working_directory,
            matrix: matrix::new_matrix(),
            file: path,
        };

        let mut locator = LineLocator::new(&source);
        let mut tests = Vec::new();
        for document in &documents {
            match Node::classify(document) {
                Node::Mapping(mapping) => {
                    let line = locator.locate_mapping(mapping);
                    self.tests_from_mapping(&context, mapping, line, &mut locator, &mut tests)
                }
                Node::Sequence(items) => {
                    self.tests_from_sequence(&context, items, &mut locator, &mut tests)
                }
                _ => tracing::error!(
                    "Error parsing YAML: expected mapping or sequence at {}",
                    context.file.display()
                ),
            }
        }

        tracing::debug!("parsed {} test(s) from {}", tests.len(), context.file.display());
        Ok(tests)
    }

    fn tests_from_sequence(
        &mut self,
        context: &ParseContext,
        items: &[Value],
        locator: &mut LineLocator<'_>,
        tests: &mut Vec<TestCase>,
    ) {
        for item in items {
            let Some(mapping) = item.as_mapping() else {
                tracing::error!(
                    "Error parsing YAML: expected mapping at {}",
                    context.file.display()
                );
                continue;
            };
            let line = locator.locate_item(mapping);
            self.tests_from_mapping(context, mapping, line, locator, tests);
        }
    }

    fn tests_from_mapping(
        &mut self,
        context: &ParseContext,
        mapping: &Mapping,
        line: usize,
        locator: &mut LineLocator<'_>,
        tests: &mut Vec<TestCase>,
    ) {
        let mut context = context.clone();
        context.matrix = update_context_matrix(&context, mapping, line);

        if let Some(Node::Sequence(steps)) = mapping.get("steps").map(Node::classify) {
            let child = context.child(mapping);
            self.tests_from_steps(&child, steps, locator, tests);
            return;
        }

        if let Some(Node::Sequence(children)) = mapping.get("tests").map(Node::classify) {
            let child = context.child(mapping);
            self.tests_from_sequence(&child, children, locator, tests);
            return;
        }

        let test = self.test_from_node(&context, mapping, line, 0);
        tests.push(test);
    }

    /// Parse a `steps:` block into a chain: each step links to the next and
    /// only the first may run in parallel with other tests.
    fn tests_from_steps(
        &mut self,
        context: &ParseContext,
        items: &[Value],
        locator: &mut LineLocator<'_>,
        tests: &mut Vec<TestCase>,
    ) {
        let start = tests.len();
        for (i, item) in items.iter().enumerate() {
            let Some(mapping) = item.as_mapping() else {
                tracing::error!(
                    "Error parsing YAML: expected mapping for step {} at {}",
                    i + 1,
                    context.file.display()
                );
                continue;
            };
            let line = locator.locate_item(mapping);
            let test = self.test_from_node(context, mapping, line, i + 1);
            tests.push(test);
        }

        let chain = &mut tests[start..];
        for i in 0..chain.len() {
            chain[i].properties.parallelize = i == 0;
            chain[i].next_step = chain.get(i + 1).map(|next| next.id);
        }
    }

    fn test_from_node(
        &mut self,
        context: &ParseContext,
        mapping: &Mapping,
        line: usize,
        step_number: usize,
    ) -> TestCase {
        let location = context.location(line);
        let id = TestId(self.next_id);
        self.next_id += 1;

        let tag_or = |key: &str| {
            yaml::get_scalar(mapping, key).or_else(|| context.tags.last(key).map(str::to_string))
        };
        let cli = tag_or("cli");
        let parallelize = tag_or("parallelize").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let skip_on_failure =
            tag_or("skipOnFailure").is_some_and(|v| v.eq_ignore_ascii_case("true"));
        let timeout = tag_or("timeout").unwrap_or_else(|| DEFAULT_TIMEOUT_MS.to_string());
        let working_directory = update_working_directory(mapping, &context.working_directory);

        let mut command = yaml::get_scalar(mapping, "command");
        let script = yaml::get_scalar(mapping, "script");
        let bash = yaml::get_scalar(mapping, "bash");
        let simulate = yaml::get_scalar(mapping, "simulate");

        let name = if command.is_none() && script.is_none() && bash.is_none() {
            short_form(mapping, &location)
                .map(|(name, short_command)| {
                    command = short_command;
                    name
                })
                .or_else(|| yaml::get_scalar(mapping, "name"))
        } else {
            yaml::get_scalar(mapping, "name")
        };

        let area = update_area(mapping, &context.area);
        let class = yaml::get_scalar(mapping, "class").unwrap_or_else(|| context.class.clone());
        let mut parse_error = None;
        let name = name.unwrap_or_else(|| {
            let error = format!("Expected YAML node ('name') at {location}");
            parse_error = Some(error.clone());
            error
        });
        let fully_qualified_name = if step_number > 0 {
            format!("{area}.{class}.{step_number:02}.{name}")
        } else {
            format!("{area}.{class}.{name}")
        };
        let mut display_name = name;

        let neither_or_both = command.is_none() == (script.is_none() && bash.is_none());
        if neither_or_both && simulate.is_none() {
            let error = format!(
                "Error parsing YAML: expected/unexpected key ('name', 'command', 'script', 'bash', 'arguments') at {location}"
            );
            tracing::error!("{error}");
            display_name = error.clone();
            parse_error = Some(error);
        }

        let test_env = env::update_copy(&context.environment, mapping);
        let foreach = match normalize_key_values(mapping.get("foreach"), &working_directory, &location)
        {
            Some(ArgumentSpec::Pairs(pairs)) => Some(pairs),
            Some(ArgumentSpec::Text(_)) => {
                tracing::warn!("foreach at {location} must be a mapping or sequence; ignored");
                None
            }
            None => None,
        };
        let input = match normalize_key_values(mapping.get("input"), &working_directory, &location)
        {
            Some(ArgumentSpec::Text(text)) => Some(text),
            Some(ArgumentSpec::Pairs(pairs)) => Some(matrix::pairs_to_json(&pairs)),
            None => None,
        };

        let properties = TestProperties {
            cli,
            command,
            script_is_bash: bash.is_some(),
            script: bash.or(script),
            arguments: normalize_key_values(mapping.get("arguments"), &working_directory, &location),
            input,
            expect_regex: yaml::get_scalar(mapping, "expect-regex")
                .or_else(|| yaml::get_scalar(mapping, "expect")),
            not_expect_regex: yaml::get_scalar(mapping, "not-expect-regex")
                .or_else(|| yaml::get_scalar(mapping, "not-expect")),
            expect_gpt: yaml::get_scalar(mapping, "expect-gpt"),
            env: env::new_and_updated(&self.process_env, &test_env),
            working_directory,
            timeout,
            skip_on_failure,
            foreach,
            matrix: context.matrix.clone(),
            parallelize,
            simulate,
        };

        let mut test = TestCase {
            id,
            fully_qualified_name,
            display_name,
            source: context.file.clone(),
            line,
            properties,
            tags: context.tags.update_copy(mapping),
            next_step: None,
            parse_error,
        };
        check_invalid_keys(&mut test, mapping, &location);
        tracing::debug!("new test case '{}'", test.fully_qualified_name);
        test
    }
}

/// `{ext}.{stem}` of a test file, e.g. `yaml.smoke`.
fn root_area(path: &Path) -> String {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    format!("{ext}.{stem}")
}

fn update_area(mapping: &Mapping, area: &str) -> String {
    match yaml::get_scalar(mapping, "area") {
        Some(sub) if !sub.is_empty() => format!("{area}.{sub}"),
        _ => area.to_string(),
    }
}

fn update_working_directory(mapping: &Mapping, current: &Path) -> PathBuf {
    match yaml::get_scalar(mapping, "workingDirectory") {
        Some(wd) if !wd.is_empty() => current.join(wd),
        _ => current.to_path_buf(),
    }
}

/// Apply `matrix-file:` then `matrix:` of `mapping` to the context matrix.
fn update_context_matrix(context: &ParseContext, mapping: &Mapping, line: usize) -> Vec<MatrixRow> {
    let location = context.location(line);
    let mut rows = context.matrix.clone();

    if let Some(file_name) = yaml::get_scalar(mapping, "matrix-file")
        && !file_name.is_empty()
    {
        let base = context.file.parent().unwrap_or(Path::new(""));
        let path = base.join(&file_name);
        match loader::load_yaml_documents(&path) {
            Ok(documents) => {
                if let Some(node) = documents.first() {
                    rows = matrix::update_matrix(&rows, node, &path.display().to_string());
                }
            }
            Err(e) => tracing::error!("cannot load matrix-file at {location}: {e}"),
        }
    }

    if let Some(node) = mapping.get("matrix") {
        rows = matrix::update_matrix(&rows, node, &location);
    }
    rows
}

/// A node with exactly one unrecognized key is a test named by that key
/// whose value is the command.
fn short_form(mapping: &Mapping, location: &str) -> Option<(String, Option<String>)> {
    let mut invalid = yaml::scalar_keys(mapping).filter(|key| !is_reserved(key));
    let name = invalid.next()?;
    if invalid.next().is_some() {
        return None;
    }

    if mapping.contains_key("name") {
        tracing::warn!(
            "'{name}' at {location} is treated as a short-form test although the node has a name; check for a misspelled key"
        );
    }
    let command = yaml::get_scalar(mapping, &name);
    Some((name, command))
}

/// Flag keys that are neither reserved nor the short-form name.
fn check_invalid_keys(test: &mut TestCase, mapping: &Mapping, location: &str) {
    for key in yaml::scalar_keys(mapping) {
        if is_reserved(&key) || test.display_name.ends_with(key.as_str()) {
            continue;
        }
        let error = format!(
            "Error parsing YAML: Unexpected YAML key/value ('{key}', '{}') in {location}",
            test.display_name
        );
        tracing::error!("{error}");
        test.display_name = error.clone();
        test.parse_error = Some(error);
    }
}

/// Normalize `arguments:`/`input:`/`foreach:` into text or key/value pairs.
fn normalize_key_values(
    value: Option<&Value>,
    working_directory: &Path,
    location: &str,
) -> Option<ArgumentSpec> {
    match Node::classify(value?) {
        Node::Null => None,
        Node::Scalar(v) => yaml::scalar_string(v).map(ArgumentSpec::Text),
        Node::Mapping(mapping) => Some(ArgumentSpec::Pairs(
            mapping
                .iter()
                .map(|(k, v)| normalize_pair(k, v, working_directory, location))
                .collect(),
        )),
        Node::Sequence(items) => {
            let rows: Vec<KeyValues> = items
                .iter()
                .filter_map(Value::as_mapping)
                .map(|mapping| {
                    mapping
                        .iter()
                        .map(|(k, v)| normalize_pair(k, v, working_directory, location))
                        .collect()
                })
                .collect();
            Some(ArgumentSpec::Pairs(merge_rows(rows)))
        }
    }
}

/// Flatten rows of pairs. When keys repeat across rows, merge them into a
/// single composite key whose value holds one tab-separated line per row.
fn merge_rows(rows: Vec<KeyValues>) -> KeyValues {
    let flat: KeyValues = rows.iter().flatten().cloned().collect();
    let mut keys: Vec<&str> = Vec::new();
    for (key, _) in &flat {
        if !keys.contains(&key.as_str()) {
            keys.push(key);
        }
    }
    if keys.len() == flat.len() {
        return flat;
    }

    tracing::debug!("merging repeated keys '{}' into one composite key", keys.join(","));
    let lines: Vec<String> = rows
        .iter()
        .map(|row| {
            keys.iter()
                .map(|key| {
                    row.iter()
                        .find(|(k, _)| k == key)
                        .map(|(_, v)| v.replace('\n', "\x0c"))
                        .unwrap_or_default()
                })
                .collect::<Vec<_>>()
                .join("\t")
        })
        .collect();
    vec![(keys.join("\t"), lines.join("\n"))]
}

fn normalize_pair(key: &Value, value: &Value, working_directory: &Path, location: &str) -> (String, String) {
    let (key, columns) = match Node::classify(key) {
        Node::Scalar(k) => (yaml::scalar_string(k).unwrap_or_default(), 1),
        Node::Sequence(items) => match items.iter().map(yaml::scalar_string).collect::<Option<Vec<_>>>() {
            Some(parts) => (parts.join("\t"), parts.len()),
            None => (format!("Invalid key at {location}"), 1),
        },
        _ => (format!("Invalid key at {location}"), 1),
    };

    let value = match Node::classify(value) {
        Node::Null => String::new(),
        Node::Scalar(v) => {
            let text = yaml::scalar_string(v).unwrap_or_default();
            file_content_from_scalar(&text, working_directory).unwrap_or(text)
        }
        Node::Sequence(items) => items
            .iter()
            .map(|item| match Node::classify(item) {
                Node::Sequence(cells) => tsv_row(cells, columns),
                Node::Mapping(_) => yaml::to_json_string(item).replace('\n', "\x0c"),
                _ => yaml::scalar_string(item).unwrap_or_default().replace('\n', "\x0c"),
            })
            .collect::<Vec<_>>()
            .join("\n"),
        Node::Mapping(_) => yaml::to_json_string(value),
    };

    (key, value)
}

/// Join scalar cells with tabs, padded to `columns` cells.
fn tsv_row(cells: &[Value], columns: usize) -> String {
    let mut parts: Vec<String> = cells
        .iter()
        .map(|cell| yaml::scalar_string(cell).unwrap_or_default().replace('\n', "\x0c"))
        .collect();
    while parts.len() < columns {
        parts.push(String::new());
    }
    parts.join("\t")
}

/// Read `@file` references, relative to the working directory if not
/// found as given.
fn file_content_from_scalar(scalar: &str, working_directory: &Path) -> Option<String> {
    let file_name = scalar.strip_prefix('@')?;
    let last_component = Path::new(file_name)
        .file_name()
        .and_then(|f| f.to_str())
        .unwrap_or(file_name);
    if file_name.is_empty() || last_component.contains(INVALID_FILE_NAME_CHARS) {
        return None;
    }

    let as_given = PathBuf::from(file_name);
    let path = if as_given.is_file() {
        as_given
    } else {
        working_directory.join(file_name)
    };
    if !path.is_file() {
        return None;
    }

    tracing::debug!("reading value from {}", path.display());
    match std::fs::read_to_string(&path) {
        Ok(content) => Some(content),
        Err(e) => {
            tracing::warn!("cannot read {}: {e}", path.display());
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::{TempDir, tempdir};

    fn write(dir: &TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn parse(contents: &str) -> Vec<TestCase> {
        let dir = tempdir().unwrap();
        let path = write(&dir, "smoke.yaml", contents);
        TestCaseParser::new().parse_file(&path).unwrap()
    }

    // ==================== Basic Tests ====================

    #[test]
    fn test_single_command_test() {
        let tests = parse("name: smoke\ncommand: --version\n");
        assert_eq!(tests.len(), 1);
        assert_eq!(tests[0].fully_qualified_name, "yaml.smoke.TestCases.smoke");
        assert_eq!(tests[0].display_name, "smoke");
        assert_eq!(tests[0].properties.command.as_deref(), Some("--version"));
        assert_eq!(tests[0].properties.timeout, DEFAULT_TIMEOUT_MS);
        assert_eq!(tests[0].line, 1);
        assert!(tests[0].parse_error.is_none());
    }

    #[test]
    fn test_short_form() {
        let tests = parse("- version check: --version\n- help: --help\n");
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].display_name, "version check");
        assert_eq!(tests[0].properties.command.as_deref(), Some("--version"));
        assert_eq!(tests[1].fully_qualified_name, "yaml.smoke.TestCases.help");
        assert_eq!(tests[1].line, 2);
        assert!(tests[1].parse_error.is_none());
    }

    #[test]
    fn test_command_and_script_is_an_error() {
        let tests = parse("name: both\ncommand: x\nscript: y\n");
        assert_eq!(tests.len(), 1);
        assert!(tests[0].parse_error.is_some());
        assert!(tests[0].display_name.starts_with("Error parsing YAML"));
    }

    #[test]
    fn test_neither_command_nor_script_is_an_error() {
        let tests = parse("name: nothing\ntimeout: 5\n");
        assert_eq!(tests.len(), 1);
        assert!(tests[0].parse_error.is_some());
    }

    #[test]
    fn test_simulate_allows_missing_command() {
        let tests = parse("name: fake\nsimulate: passed\n");
        assert!(tests[0].parse_error.is_none(), "{:?}", tests[0].parse_error);
        assert_eq!(tests[0].display_name, "fake");
        assert!(tests[0].fully_qualified_name.ends_with(".fake"));
        assert_eq!(tests[0].properties.simulate.as_deref(), Some("passed"));
    }

    #[test]
    fn test_unknown_key_is_flagged() {
        let tests = parse("name: typo\ncommand: x\ncomand: y\n");
        assert!(tests[0].display_name.contains("Unexpected YAML key/value ('comand'"));
        assert!(tests[0].parse_error.is_some());
    }

    #[test]
    fn test_bash_sets_script() {
        let tests = parse("name: b\nbash: echo hi\n");
        assert_eq!(tests[0].properties.script.as_deref(), Some("echo hi"));
        assert!(tests[0].properties.script_is_bash);
    }

    // ==================== Containers ====================

    #[test]
    fn test_tests_container_propagates_context() {
        let tests = parse(
            r#"
area: speech
class: Recognize
tags: [slow]
env:
  LANG_UNDER_TEST: en
tests:
- name: a
  command: recognize
- name: b
  class: Other
  command: recognize
"#,
        );
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].fully_qualified_name, "yaml.smoke.speech.Recognize.a");
        assert_eq!(tests[1].fully_qualified_name, "yaml.smoke.speech.Other.b");
        assert_eq!(tests[0].tags.last("tag"), Some("slow"));
        assert_eq!(
            tests[0].properties.env.get("LANG_UNDER_TEST").map(String::as_str),
            Some("en")
        );
    }

    #[test]
    fn test_sibling_contexts_do_not_leak() {
        let tests = parse(
            r#"
- area: first
  tests:
  - name: a
    command: x
- name: b
  command: y
"#,
        );
        assert_eq!(tests[0].fully_qualified_name, "yaml.smoke.first.TestCases.a");
        assert_eq!(tests[1].fully_qualified_name, "yaml.smoke.TestCases.b");
    }

    #[test]
    fn test_steps_are_chained() {
        let tests = parse(
            r#"
name: flow
steps:
- name: create
  command: create
- name: use
  command: use
- name: delete
  command: delete
"#,
        );
        assert_eq!(tests.len(), 3);
        assert_eq!(tests[0].next_step, Some(tests[1].id));
        assert_eq!(tests[1].next_step, Some(tests[2].id));
        assert_eq!(tests[2].next_step, None);
        assert!(tests[0].properties.parallelize);
        assert!(!tests[1].properties.parallelize);
        assert!(!tests[2].properties.parallelize);
        assert_eq!(tests[1].fully_qualified_name, "yaml.smoke.TestCases.02.use");
    }

    #[test]
    fn test_non_mapping_sequence_entry_is_skipped() {
        let tests = parse("- name: a\n  command: x\n- just a string\n- name: b\n  command: y\n");
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].display_name, "a");
        assert_eq!(tests[1].display_name, "b");
    }

    #[test]
    fn test_line_skips_nested_name_of_previous_test() {
        let tests = parse(
            r#"tests:
- name: first
  command: run
  arguments:
    name: nested
- name: second
  command: run
"#,
        );
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[0].line, 2);
        assert_eq!(tests[1].line, 6);
    }

    #[test]
    fn test_multiple_documents() {
        let tests = parse("name: a\ncommand: x\n---\nname: b\ncommand: y\n");
        assert_eq!(tests.len(), 2);
        assert_eq!(tests[1].line, 4);
        assert_ne!(tests[0].id, tests[1].id);
    }

    // ==================== Properties ====================

    #[test]
    fn test_arguments_mapping_and_text() {
        let tests = parse(
            r#"
- name: pairs
  command: synthesize
  arguments:
    text: hello
    voice: jenny
- name: text
  command: synthesize
  arguments: --quiet
"#,
        );
        assert_eq!(
            tests[0].properties.arguments,
            Some(ArgumentSpec::Pairs(vec![
                ("text".into(), "hello".into()),
                ("voice".into(), "jenny".into()),
            ]))
        );
        assert_eq!(
            tests[1].properties.arguments,
            Some(ArgumentSpec::Text("--quiet".into()))
        );
    }

    #[test]
    fn test_foreach_sequence_value_becomes_lines() {
        let tests = parse(
            r#"
name: t-{lang}
command: --lang
foreach:
  lang: [en, fr]
"#,
        );
        assert_eq!(
            tests[0].properties.foreach,
            Some(vec![("lang".to_string(), "en\nfr".to_string())])
        );
    }

    #[test]
    fn test_sequence_of_rows_with_repeated_keys_merges() {
        let tests = parse(
            r#"
name: rows
command: x
foreach:
- {lang: en, voice: a}
- {lang: fr}
"#,
        );
        assert_eq!(
            tests[0].properties.foreach,
            Some(vec![("lang\tvoice".to_string(), "en\ta\nfr\t".to_string())])
        );
    }

    #[test]
    fn test_sequence_key_becomes_composite() {
        let tests = parse(
            r#"
name: cols
command: x
foreach:
  [lang, voice]:
  - [en, a]
  - [fr]
"#,
        );
        assert_eq!(
            tests[0].properties.foreach,
            Some(vec![("lang\tvoice".to_string(), "en\ta\nfr\t".to_string())])
        );
    }

    #[test]
    fn test_at_file_reference() {
        let dir = tempdir().unwrap();
        write(&dir, "data/words.txt", "alpha\nbeta");
        let path = write(
            &dir,
            "t.yaml",
            "name: f\ncommand: x\nworkingDirectory: data\narguments:\n  words: \"@words.txt\"\n  missing: \"@nope.txt\"\n",
        );
        let tests = TestCaseParser::new().parse_file(&path).unwrap();
        assert_eq!(
            tests[0].properties.arguments,
            Some(ArgumentSpec::Pairs(vec![
                ("words".into(), "alpha\nbeta".into()),
                ("missing".into(), "@nope.txt".into()),
            ]))
        );
    }

    #[test]
    fn test_input_scalar() {
        let tests = parse("name: i\ncommand: x\ninput: hello there\n");
        assert_eq!(tests[0].properties.input.as_deref(), Some("hello there"));
    }

    #[test]
    fn test_expect_aliases() {
        let tests = parse("name: e\ncommand: x\nexpect: ok\nnot-expect: ERROR\nexpect-gpt: polite\n");
        let p = &tests[0].properties;
        assert_eq!(p.expect_regex.as_deref(), Some("ok"));
        assert_eq!(p.not_expect_regex.as_deref(), Some("ERROR"));
        assert_eq!(p.expect_gpt.as_deref(), Some("polite"));
    }

    #[test]
    fn test_matrix_rows_propagate() {
        let tests = parse(
            r#"
matrix:
  voice: [a, b]
tests:
- name: say-${{ matrix.voice }}
  command: speak
"#,
        );
        assert_eq!(tests[0].properties.matrix.len(), 2);
    }

    #[test]
    fn test_matrix_file() {
        let dir = tempdir().unwrap();
        write(&dir, "matrix.yml", "- {region: east}\n- {region: west}\n- {region: north}\n");
        let path = write(&dir, "m.yaml", "matrix-file: matrix.yml\nname: m\ncommand: x\n");
        let tests = TestCaseParser::new().parse_file(&path).unwrap();
        assert_eq!(tests[0].properties.matrix.len(), 3);
    }

    // ==================== Defaults ====================

    #[test]
    fn test_default_tags_apply() {
        let dir = tempdir().unwrap();
        write(
            &dir,
            loader::DEFAULT_TAGS_FILENAME,
            "cli: spx\ntimeout: 1234\nparallelize: true\nclass: Defaults\n",
        );
        let path = write(&dir, "sub/t.yaml", "name: d\ncommand: x\n");
        let tests = TestCaseParser::new().parse_file(&path).unwrap();
        let p = &tests[0].properties;
        assert_eq!(p.cli.as_deref(), Some("spx"));
        assert_eq!(p.timeout, "1234");
        assert!(p.parallelize);
        assert_eq!(tests[0].fully_qualified_name, "yaml.t.Defaults.d");
    }

    #[test]
    fn test_node_overrides_default_tags() {
        let dir = tempdir().unwrap();
        write(&dir, loader::DEFAULT_TAGS_FILENAME, "cli: spx\n");
        let path = write(&dir, "t.yaml", "name: d\ncli: ai\ncommand: x\n");
        let tests = TestCaseParser::new().parse_file(&path).unwrap();
        assert_eq!(tests[0].properties.cli.as_deref(), Some("ai"));
    }

    #[test]
    fn test_dot_env_in_working_directory() {
        let dir = tempdir().unwrap();
        write(&dir, ".env", "YAMLTEST_FROM_DOTENV=yes\n");
        let path = write(
            &dir,
            "t.yaml",
            "name: d\ncommand: x\nenv:\n  DERIVED: $(YAMLTEST_FROM_DOTENV)-ok\n",
        );
        let tests = TestCaseParser::new().parse_file(&path).unwrap();
        let env = &tests[0].properties.env;
        assert_eq!(env.get("YAMLTEST_FROM_DOTENV").map(String::as_str), Some("yes"));
        assert_eq!(env.get("DERIVED").map(String::as_str), Some("yes-ok"));
    }

    #[test]
    fn test_parse_directory_collects_errors_and_continues() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "name: a\ncommand: x\n");
        write(&dir, "b.yaml", "invalid: [yaml: {");
        let output = TestCaseParser::new().parse_directory(dir.path()).unwrap();
        assert_eq!(output.tests.len(), 1);
        assert_eq!(output.errors.len(), 1);
    }

    #[test]
    fn test_ids_unique_across_files() {
        let dir = tempdir().unwrap();
        write(&dir, "a.yaml", "- a: x\n- b: y\n");
        write(&dir, "b.yaml", "- c: x\n");
        let output = TestCaseParser::new().parse_directory(dir.path()).unwrap();
        let ids: Vec<_> = output.tests.iter().map(|t| t.id.0).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }
}
