//! Test case runner.
//!
//! Runs one runnable item: expands its foreach values, builds the command
//! line for the CLI under test, supervises the process, and turns what it
//! observed into results.

use crate::matrix::{self, ForeachItem};
use crate::model::{ArgumentSpec, KeyValues, Outcome, TestProperties, TestResult};
use crate::process::{self, ProcessOutput, ProcessSpec};
use crate::resolve::ExecutableResolver;
use crate::runnable::RunnableTestCaseItem;
use chrono::{DateTime, Local};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;
use tempfile::TempPath;

/// Timeout of the `expect-gpt` oracle process.
pub const ORACLE_TIMEOUT: Duration = Duration::from_secs(60);

/// CLI used for `expect-gpt` checks unless configured otherwise.
pub const DEFAULT_ORACLE_CLI: &str = "ai";

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Characters that force a value into a temp file.
const FILE_ONLY_CHARS: &[char] = &['\t', '\r', '\n', '\x0c', '"'];

/// Errors while preparing or running one foreach item.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("failed to write temp file: {0}")]
    TempFile(#[source] std::io::Error),

    #[error("failed to create working directory {}: {source}", path.display())]
    WorkingDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to start {}: {source}", program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid timeout '{0}'; expected milliseconds")]
    InvalidTimeout(String),

    #[error("no CLI named and no known CLI configured")]
    NoCli,
}

/// Settings shared by every run.
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Tried when a test names no `cli`.
    pub known_clis: Vec<String>,
    pub oracle_cli: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            known_clis: crate::resolve::DEFAULT_KNOWN_CLIS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            oracle_cli: DEFAULT_ORACLE_CLI.to_string(),
        }
    }
}

/// Runs test items against the CLI under test.
pub struct TestCaseRunner {
    resolver: ExecutableResolver,
    options: RunnerOptions,
    default_cli: OnceLock<Option<String>>,
}

impl TestCaseRunner {
    pub fn new(resolver: ExecutableResolver, options: RunnerOptions) -> Self {
        Self {
            resolver,
            options,
            default_cli: OnceLock::new(),
        }
    }

    /// Run every foreach combination of `item`, one result each.
    pub fn run(&self, item: &RunnableTestCaseItem) -> Vec<TestResult> {
        let foreach = item.properties.foreach.clone().unwrap_or_default();
        matrix::expand_foreach(&foreach)
            .map(|assignment| self.run_one(item, &assignment))
            .collect()
    }

    fn run_one(&self, item: &RunnableTestCaseItem, assignment: &ForeachItem) -> TestResult {
        let display_name = matrix::finalize_display_name(&item.display_name, assignment);
        let mut result = TestResult::new(&item.test, display_name);
        tracing::debug!("running '{}'", result.display_name);

        if let Some(error) = &item.test.parse_error {
            result.outcome = Outcome::Failed;
            result.error_message = Some(error.clone());
            result.stack_trace = item.test.location();
        } else if let Some(mode) = &item.properties.simulate {
            simulate(&mut result, &item.properties, assignment, mode);
        } else if let Err(e) = self.execute(item, assignment, &mut result) {
            tracing::warn!("'{}' failed to run: {e}", result.display_name);
            result.outcome = Outcome::Failed;
            result.error_message = Some(e.to_string());
            result.debug_trace = Some(format!("{e:?}"));
        }

        result.end_time = Local::now();
        result.duration = (result.end_time - result.start_time)
            .to_std()
            .unwrap_or_default();
        result
    }

    fn execute(
        &self,
        item: &RunnableTestCaseItem,
        assignment: &ForeachItem,
        result: &mut TestResult,
    ) -> Result<(), RunError> {
        let props = &item.properties;
        let timeout = parse_timeout(&props.timeout)?;
        let cli = self.cli_name(props.cli.as_deref())?;
        let program = self.resolver.resolve(&cli).unwrap_or_else(|| {
            tracing::warn!("cannot find CLI '{cli}'; running it as given");
            PathBuf::from(&cli)
        });

        // Dropped on every exit path, deleting the files.
        let mut temp = TempFiles::default();
        let invocation = build_invocation(&program, props, assignment, &mut temp)?;
        result.stack_trace = invocation.stack_trace;

        std::fs::create_dir_all(&props.working_directory).map_err(|source| {
            RunError::WorkingDirectory {
                path: props.working_directory.clone(),
                source,
            }
        })?;

        result.start_time = Local::now();
        let output = process::run_process(&ProcessSpec {
            program: program.clone(),
            args: invocation.args,
            working_directory: props.working_directory.clone(),
            env: props.env.clone(),
            input: props.input.clone(),
            timeout,
        })
        .map_err(|source| RunError::Spawn { program, source })?;
        let stop_time = Local::now();
        drop(temp);

        result.outcome = if output.success() {
            Outcome::Passed
        } else if props.skip_on_failure {
            Outcome::Skipped
        } else {
            Outcome::Failed
        };
        result.additional_info = format!(
            "START TIME: {} STOP TIME: {} EXIT CODE: {}",
            format_time(&result.start_time),
            format_time(&stop_time),
            output.exit_display
        );
        if result.outcome != Outcome::Passed {
            result.error_message = Some(format!("EXIT CODE: {}", output.exit_display));
        }
        result.stdout = output.stdout.clone();
        result.stderr = output.stderr.clone();

        if result.outcome == Outcome::Passed
            && let Some(expectation) = props.expect_gpt.as_deref().filter(|e| !e.is_empty())
        {
            self.check_expect_gpt(expectation, &output, &props.working_directory, result);
        }
        Ok(())
    }

    fn cli_name(&self, cli: Option<&str>) -> Result<String, RunError> {
        if let Some(cli) = cli.filter(|c| !c.is_empty()) {
            return Ok(cli.to_string());
        }
        self.default_cli
            .get_or_init(|| self.resolver.pick_default_cli(&self.options.known_clis))
            .clone()
            .ok_or(RunError::NoCli)
    }

    /// Ask the oracle CLI whether the output meets `expectation`.
    fn check_expect_gpt(
        &self,
        expectation: &str,
        output: &ProcessOutput,
        working_directory: &Path,
        result: &mut TestResult,
    ) {
        let question = format!(
            "Here's the console output:\n\n{}\n\nHere's the expectation:\n\n{expectation}\n\n\
             You **must always** answer \"PASS\" if the expectation is met.\n\
             You **must always** answer \"FAIL\" if the expectation is not met.\n\
             You **must only** answer \"PASS\" or \"FAIL\".\n",
            output.merged
        );

        let (passed, oracle_stdout, oracle_stderr) = match self.ask_oracle(&question, working_directory) {
            Ok(answer) => {
                let mut stderr = answer.stderr.clone();
                if answer.timed_out {
                    tracing::warn!("expect-gpt oracle timed out");
                    stderr.push_str("\nexpect-gpt: timed out or killed");
                }
                let merged = &answer.merged;
                let passed = answer.success()
                    && (merged.contains("PASS") || merged.contains("TRUE") || merged.contains("YES"));
                (passed, answer.stdout, stderr)
            }
            Err(e) => {
                tracing::warn!("expect-gpt oracle failed: {e}");
                (false, String::new(), format!("expect-gpt: {e}"))
            }
        };
        tracing::debug!("expect-gpt for '{}': passed={passed}", result.display_name);

        if passed {
            return;
        }
        result.outcome = Outcome::Failed;
        result.error_message = Some(format!("expect-gpt: {expectation}"));
        append_expect_section(&mut result.stdout, &oracle_stdout);
        append_expect_section(&mut result.stderr, &oracle_stderr);
    }

    fn ask_oracle(&self, question: &str, working_directory: &Path) -> Result<ProcessOutput, RunError> {
        let mut temp = TempFiles::default();
        let question_file = temp.write(question, "")?;
        let cli = &self.options.oracle_cli;
        let program = self
            .resolver
            .resolve(cli)
            .unwrap_or_else(|| PathBuf::from(cli));

        let args = ["chat", "--quiet", "true", "--index-name", "@none", "--question"]
            .into_iter()
            .map(str::to_string)
            .chain([format!("@{question_file}")])
            .collect();
        process::run_process(&ProcessSpec {
            program: program.clone(),
            args,
            working_directory: working_directory.to_path_buf(),
            env: Default::default(),
            input: None,
            timeout: ORACLE_TIMEOUT,
        })
        .map_err(|source| RunError::Spawn { program, source })
    }
}

fn append_expect_section(buffer: &mut String, section: &str) {
    if section.is_empty() {
        return;
    }
    let combined = format!("{buffer}\n--expect--\n{section}\n");
    *buffer = combined.trim_matches('\n').to_string();
}

fn simulate(result: &mut TestResult, props: &TestProperties, assignment: &ForeachItem, mode: &str) {
    result.outcome = match mode.trim().to_ascii_lowercase().as_str() {
        "passed" => Outcome::Passed,
        "failed" => Outcome::Failed,
        "skipped" => Outcome::Skipped,
        _ => Outcome::None,
    };
    let properties = serde_json::to_string_pretty(props).unwrap_or_default();
    result.stdout = format!("SIMULATED: {mode}\nFOREACH: {}\n{properties}", assignment.to_json());
    if result.outcome == Outcome::Failed {
        result.error_message = Some(format!("SIMULATED: {mode}"));
    }
}

fn parse_timeout(timeout: &str) -> Result<Duration, RunError> {
    timeout
        .trim()
        .parse::<u64>()
        .map(Duration::from_millis)
        .map_err(|_| RunError::InvalidTimeout(timeout.to_string()))
}

fn format_time(time: &DateTime<Local>) -> String {
    time.format(TIME_FORMAT).to_string()
}

/// Temp files that live until the item's process finishes.
#[derive(Default)]
struct TempFiles {
    paths: Vec<TempPath>,
}

impl TempFiles {
    /// Write `text` to a new temp file and return its path.
    fn write(&mut self, text: &str, suffix: &str) -> Result<String, RunError> {
        let mut file = tempfile::Builder::new()
            .prefix("yamltest-")
            .suffix(suffix)
            .tempfile()
            .map_err(RunError::TempFile)?;
        file.write_all(text.as_bytes()).map_err(RunError::TempFile)?;
        let path = file.into_temp_path();
        let shown = path.display().to_string();
        tracing::debug!("FILE: {shown}: '{}'", text.replace('\n', "\\n"));
        self.paths.push(path);
        Ok(shown)
    }

    /// Write a multi-line TSV value; cells holding form feeds go to their
    /// own files first, with form feeds turned back into newlines.
    fn write_multiline_tsv(&mut self, text: &str) -> Result<String, RunError> {
        let mut lines = Vec::new();
        for line in text.split(['\r', '\n']) {
            if !line.contains('\x0c') {
                lines.push(line.to_string());
                continue;
            }
            let mut cells = Vec::new();
            for cell in line.split('\t') {
                if cell.contains('\x0c') {
                    cells.push(format!("@{}", self.write(&cell.replace('\x0c', "\n"), "")?));
                } else {
                    cells.push(cell.to_string());
                }
            }
            lines.push(cells.join("\t"));
        }
        self.write(&lines.join("\n"), "")
    }
}

/// Arguments for the CLI and the diagnostic text describing them.
#[derive(Debug)]
struct Invocation {
    args: Vec<String>,
    stack_trace: String,
}

fn build_invocation(
    program: &Path,
    props: &TestProperties,
    assignment: &ForeachItem,
    temp: &mut TempFiles,
) -> Result<Invocation, RunError> {
    let mut kvs: KeyValues = match &props.arguments {
        Some(ArgumentSpec::Text(text)) => vec![(String::new(), text.clone())],
        Some(ArgumentSpec::Pairs(pairs)) => pairs.clone(),
        None => Vec::new(),
    };
    kvs.extend(assignment.pairs().iter().cloned());
    let details = stack_trace_details(props.script.as_deref(), props.command.as_deref(), &kvs);

    let kv_args = key_value_args(&kvs, temp)?;
    let mut expect_args = Vec::new();
    if let Some(expect) = props.expect_regex.as_deref().filter(|e| !e.is_empty()) {
        expect_args.push("--expect".to_string());
        expect_args.push(format!("@{}", temp.write(expect, "")?));
    }
    if let Some(not_expect) = props.not_expect_regex.as_deref().filter(|e| !e.is_empty()) {
        expect_args.push("--not-expect".to_string());
        expect_args.push(format!("@{}", temp.write(not_expect, "")?));
    }

    let is_command = props.command.is_some() || props.script.is_none();
    let args = if is_command {
        let command = props.command.as_deref().unwrap_or_default();
        if expect_args.is_empty() {
            split_command_line(command).into_iter().chain(kv_args).collect()
        } else {
            let command_line = format!("{command} {}", join_args(&kv_args));
            let command_file = temp.write(command_line.trim_end(), "")?;
            let mut args = vec!["run".to_string(), "--command".to_string(), format!("@{command_file}")];
            args.extend(expect_args);
            args
        }
    } else {
        let script = props.script.as_deref().unwrap_or_default();
        let use_cmd = cfg!(windows) && !props.script_is_bash;
        let script_file = temp.write(script, if use_cmd { ".cmd" } else { "" })?;
        let mut args: Vec<String> = if use_cmd {
            vec!["run".into(), "--cmd".into()]
        } else {
            let bash = if cfg!(windows) { "bash" } else { "/bin/bash" };
            vec![
                "run".into(),
                "--process".into(),
                bash.into(),
                "--pre.script".into(),
                "-l".into(),
            ]
        };
        args.push("--script".into());
        args.push(script_file);
        args.extend(kv_args);
        args.extend(expect_args);
        args
    };

    let stack_trace = format!("{} {}\n{details}", program.display(), join_args(&args));
    Ok(Invocation {
        stack_trace: stack_trace.trim_end().to_string(),
        args,
    })
}

/// `--key value` arguments for `kvs`, with awkward values moved to files.
fn key_value_args(kvs: &[(String, String)], temp: &mut TempFiles) -> Result<Vec<String>, RunError> {
    let mut args = Vec::new();
    for (key, value) in kvs {
        let value = if value.contains(FILE_ONLY_CHARS) {
            format!("@{}", temp.write_multiline_tsv(value)?)
        } else {
            value.clone()
        };

        if key.is_empty() {
            args.extend(split_command_line(&value));
            continue;
        }
        if key.contains('\t') {
            args.push("--foreach".to_string());
            args.push(key.replace('\t', ";"));
            args.push("in".to_string());
        } else {
            args.push(format!("--{key}"));
        }
        if !value.is_empty() {
            args.push(value);
        }
    }
    Ok(args)
}

fn stack_trace_details(script: Option<&str>, command: Option<&str>, kvs: &[(String, String)]) -> String {
    let mut details = script.unwrap_or_default().to_string();
    if let Some(command) = command {
        details.push_str(&format!("\nCOMMAND: {command}"));
        for (key, value) in kvs.iter().filter(|(k, _)| !k.is_empty()) {
            details.push_str(&format!("\n{key}:\n{}", value.replace('\n', "\n  ")));
        }
    }
    details.trim_matches(['\r', '\n', ' ']).to_string()
}

/// Split a command line on whitespace, honoring single and double quotes.
pub fn split_command_line(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_arg = false;
    let mut quote: Option<char> = None;

    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None if c == '"' || c == '\'' => {
                quote = Some(c);
                in_arg = true;
            }
            None if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            None => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}

fn join_args(args: &[String]) -> String {
    args.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
