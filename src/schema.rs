//! Schema definitions for yamltest files.
//!
//! Test files are parsed dynamically (see `parser`), but their accepted
//! shape is described here so it can be published as a JSON schema. The
//! per-tree configuration file is deserialized directly into
//! [`TestConfig`].

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration loaded from `.yamltest/config`.
///
/// Every field is optional; command-line flags take precedence.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TestConfig {
    /// Directory searched for test files when none is given on the command line.
    #[serde(default)]
    pub test_directory: Option<PathBuf>,

    /// Upper bound on concurrently running parallel chains.
    #[serde(default)]
    pub max_parallel: Option<usize>,

    /// Where the JUnit XML results file is written.
    #[serde(default)]
    pub results_file: Option<PathBuf>,

    /// CLI invoked for `expect-gpt` checks.
    #[serde(default)]
    pub oracle_cli: Option<String>,

    /// Candidate CLI names tried when a test names no `cli`.
    #[serde(default)]
    pub known_clis: Vec<String>,
}

/// A value that is either plain text or a structured key/value shape.
///
/// Accepted shapes are a scalar, a mapping of keys to scalars or sequences,
/// or a sequence of such mappings. Values of the form `@file` are replaced
/// by the file's content.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum KeyValueShape {
    Text(String),
    Map(serde_json::Map<String, serde_json::Value>),
    Rows(Vec<serde_json::Map<String, serde_json::Value>>),
}

/// A single test, or a container of tests or steps.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TestNode {
    /// Sub-area appended to the inherited area.
    pub area: Option<String>,
    /// Class name; defaults to `TestCases`.
    pub class: Option<String>,
    /// Test name.
    pub name: Option<String>,
    /// CLI to invoke; resolved on PATH and next to the runner.
    pub cli: Option<String>,
    /// Arguments passed to the CLI.
    pub command: Option<String>,
    /// Script body run by the CLI.
    pub script: Option<String>,
    /// Bash script body run by the CLI.
    pub bash: Option<String>,
    /// Timeout in milliseconds.
    pub timeout: Option<serde_json::Value>,
    /// Variables expanded into every combination of their newline-separated values.
    pub foreach: Option<KeyValueShape>,
    /// Named arguments appended as `--key value`.
    pub arguments: Option<KeyValueShape>,
    /// Text written to standard input.
    pub input: Option<KeyValueShape>,
    /// Regular expressions the output must match.
    pub expect: Option<String>,
    /// Alias of `expect`.
    #[serde(rename = "expect-regex")]
    pub expect_regex: Option<String>,
    /// Plain-language expectation checked by the oracle CLI.
    #[serde(rename = "expect-gpt")]
    pub expect_gpt: Option<String>,
    /// Regular expressions the output must not match.
    #[serde(rename = "not-expect")]
    pub not_expect: Option<String>,
    /// Alias of `not-expect`.
    #[serde(rename = "not-expect-regex")]
    pub not_expect_regex: Option<String>,
    /// Run this test concurrently with other parallel tests.
    pub parallelize: Option<serde_json::Value>,
    /// Skip the process and report this outcome (`passed`, `failed`, `skipped`).
    pub simulate: Option<String>,
    /// Report failures as skipped.
    pub skip_on_failure: Option<serde_json::Value>,
    /// A single tag.
    pub tag: Option<String>,
    /// Tags as a comma list, name/value mapping, or sequence.
    pub tags: Option<serde_json::Value>,
    /// Matrix rows multiplied into every test below this node.
    pub matrix: Option<serde_json::Value>,
    /// YAML file holding a `matrix` node, relative to this file.
    #[serde(rename = "matrix-file")]
    pub matrix_file: Option<PathBuf>,
    /// Working directory relative to the inherited one.
    pub working_directory: Option<PathBuf>,
    /// Environment variables; values may reference `$(NAME)`.
    pub env: Option<serde_json::Value>,
    /// Reserved.
    pub sanitize: Option<serde_json::Value>,
    /// Chained steps; only the first runs in parallel with other tests.
    pub steps: Option<Vec<TestNode>>,
    /// Sibling tests sharing this node's context.
    pub tests: Option<Vec<TestNode>>,
}

/// Generate the JSON schema for test files.
pub fn generate_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(TestNode)
}

/// Generate the JSON schema for `.yamltest/config`.
pub fn generate_config_schema() -> schemars::schema::RootSchema {
    schemars::schema_for!(TestConfig)
}
