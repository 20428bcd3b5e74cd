//! Parsed test cases and their results.

use crate::env::Environment;
use crate::tags::Tags;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Default process timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: &str = "600000";

/// Identifies a test case within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct TestId(pub usize);

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ordered key/value pairs. A key containing a tab names several columns.
pub type KeyValues = Vec<(String, String)>;

/// One row of a matrix, used for `${{ }}` interpolation.
pub type MatrixRow = BTreeMap<String, String>;

/// The normalized form of `arguments:` and similar keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ArgumentSpec {
    /// A scalar, appended to the command line as-is.
    Text(String),
    /// Named values, rendered as `--key value`.
    Pairs(KeyValues),
}

/// Everything the runner needs to execute a test.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TestProperties {
    pub cli: Option<String>,
    pub command: Option<String>,
    pub script: Option<String>,
    pub script_is_bash: bool,
    pub arguments: Option<ArgumentSpec>,
    pub input: Option<String>,
    pub expect_regex: Option<String>,
    pub not_expect_regex: Option<String>,
    pub expect_gpt: Option<String>,
    /// Variables that differ from the runner's own environment.
    pub env: Environment,
    pub working_directory: PathBuf,
    /// Milliseconds, kept as text so matrix values can supply it.
    pub timeout: String,
    pub skip_on_failure: bool,
    pub foreach: Option<KeyValues>,
    pub matrix: Vec<MatrixRow>,
    pub parallelize: bool,
    pub simulate: Option<String>,
}

/// A test parsed from a YAML file.
#[derive(Debug, Clone, Serialize)]
pub struct TestCase {
    pub id: TestId,
    pub fully_qualified_name: String,
    /// May contain `{key}` placeholders filled from foreach values.
    pub display_name: String,
    pub source: PathBuf,
    pub line: usize,
    pub properties: TestProperties,
    pub tags: Tags,
    /// The next step of a `steps:` chain.
    pub next_step: Option<TestId>,
    /// Set when the YAML node was malformed; the display name carries the same text.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parse_error: Option<String>,
}

impl TestCase {
    /// Whether the test sits in the `before` or `after` tier.
    pub fn tier(&self) -> Tier {
        if self.tags.has_trait("before") {
            Tier::Before
        } else if self.tags.has_trait("after") {
            Tier::After
        } else {
            Tier::Middle
        }
    }

    /// `path(line)` for diagnostics.
    pub fn location(&self) -> String {
        format!("{}({})", self.source.display(), self.line)
    }
}

/// Scheduling priority group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Before,
    Middle,
    After,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Before, Tier::Middle, Tier::After];
}

/// Outcome of a result, or the roll-up of several.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    None,
    Passed,
    Failed,
    Skipped,
    NotFound,
}

impl Outcome {
    /// Combine outcomes: failed beats skipped beats not-found beats passed.
    pub fn roll_up<I: IntoIterator<Item = Outcome>>(outcomes: I) -> Outcome {
        let mut seen = [false; 4];
        for outcome in outcomes {
            match outcome {
                Outcome::Failed => seen[0] = true,
                Outcome::Skipped => seen[1] = true,
                Outcome::NotFound => seen[2] = true,
                Outcome::Passed => seen[3] = true,
                Outcome::None => {}
            }
        }
        match seen {
            [true, ..] => Outcome::Failed,
            [_, true, ..] => Outcome::Skipped,
            [_, _, true, _] => Outcome::NotFound,
            [_, _, _, true] => Outcome::Passed,
            _ => Outcome::None,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::None => "None",
            Outcome::Passed => "Passed",
            Outcome::Failed => "Failed",
            Outcome::Skipped => "Skipped",
            Outcome::NotFound => "NotFound",
        };
        f.write_str(s)
    }
}

/// Result of running one foreach variant of one test item.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_id: TestId,
    pub fully_qualified_name: String,
    pub display_name: String,
    pub outcome: Outcome,
    pub stdout: String,
    pub stderr: String,
    pub additional_info: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub stack_trace: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug_trace: Option<String>,
    #[serde(serialize_with = "serialize_time")]
    pub start_time: DateTime<Local>,
    #[serde(serialize_with = "serialize_time")]
    pub end_time: DateTime<Local>,
    #[serde(serialize_with = "serialize_duration")]
    pub duration: Duration,
}

impl TestResult {
    /// An empty result for `test` stamped with the current time.
    pub fn new(test: &TestCase, display_name: String) -> Self {
        let now = Local::now();
        Self {
            test_id: test.id,
            fully_qualified_name: test.fully_qualified_name.clone(),
            display_name,
            outcome: Outcome::None,
            stdout: String::new(),
            stderr: String::new(),
            additional_info: String::new(),
            error_message: None,
            stack_trace: String::new(),
            debug_trace: None,
            start_time: now,
            end_time: now,
            duration: Duration::ZERO,
        }
    }
}

/// Durations serialize as fractional seconds.
pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Timestamps serialize as RFC 3339 text.
pub(crate) fn serialize_time<S>(time: &DateTime<Local>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&time.to_rfc3339())
}
