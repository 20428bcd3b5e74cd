//! The run aggregate and the console host that reports progress.

use crate::model::{Outcome, TestCase, TestId, TestResult};
use crate::runnable::TestHost;
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::Write as _;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Number of stderr lines shown from each end of a failed result.
const STDERR_CONTEXT_LINES: usize = 5;

/// Everything recorded during one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct TestRun {
    pub run_id: String,
    #[serde(serialize_with = "crate::model::serialize_time")]
    pub start_time: DateTime<Local>,
    #[serde(serialize_with = "crate::model::serialize_time")]
    pub end_time: DateTime<Local>,
    /// Fully qualified names of started tests, in start order.
    pub tests: Vec<String>,
    /// Execution id handed to each started test.
    pub execution_ids: BTreeMap<TestId, String>,
    pub results: Vec<TestResult>,
}

impl TestRun {
    pub fn new() -> Self {
        let now = Local::now();
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            start_time: now,
            end_time: now,
            tests: Vec::new(),
            execution_ids: BTreeMap::new(),
            results: Vec::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        let count = |outcome: Outcome| self.results.iter().filter(|r| r.outcome == outcome).count();
        let passed = count(Outcome::Passed);
        let failed = count(Outcome::Failed);
        let skipped = count(Outcome::Skipped);
        let status = if failed > 0 {
            "failed"
        } else if skipped > 0 {
            "skipped"
        } else {
            "passed"
        };
        RunSummary {
            status,
            tests: self.tests.len(),
            results: self.results.len(),
            passed,
            failed,
            skipped,
            duration: (self.end_time - self.start_time).to_std().unwrap_or_default(),
        }
    }
}

impl Default for TestRun {
    fn default() -> Self {
        Self::new()
    }
}

/// Counts over a run's results.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    /// `failed`, `skipped` or `passed`.
    pub status: &'static str,
    pub tests: usize,
    pub results: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    #[serde(serialize_with = "crate::model::serialize_duration")]
    pub duration: Duration,
}

impl RunSummary {
    pub fn is_failed(&self) -> bool {
        self.failed > 0
    }

    fn percent(&self, count: usize) -> f64 {
        if self.results == 0 {
            0.0
        } else {
            count as f64 * 100.0 / self.results as f64
        }
    }
}

/// Records into a [`TestRun`] and, when `echo` is set, prints progress.
pub struct ConsoleHost {
    run: Mutex<TestRun>,
    locations: Mutex<BTreeMap<TestId, String>>,
    echo: bool,
}

impl ConsoleHost {
    pub fn new(echo: bool) -> Self {
        Self {
            run: Mutex::new(TestRun::new()),
            locations: Mutex::new(BTreeMap::new()),
            echo,
        }
    }

    /// Stop recording and return the finished run.
    pub fn finish(self) -> TestRun {
        let mut run = self
            .run
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        run.end_time = Local::now();
        run
    }

    fn with_run<T>(&self, f: impl FnOnce(&mut TestRun) -> T) -> T {
        let mut run = self.run.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut run)
    }

    fn print(&self, text: &str) {
        if self.echo {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(text.as_bytes());
            let _ = stdout.flush();
        }
    }
}

impl TestHost for ConsoleHost {
    fn record_start(&self, test: &TestCase) {
        self.with_run(|run| {
            run.tests.push(test.fully_qualified_name.clone());
            run.execution_ids
                .insert(test.id, uuid::Uuid::new_v4().to_string());
        });
        if let Ok(mut locations) = self.locations.lock() {
            locations.insert(test.id, test.location());
        }
        tracing::info!("starting test {}", test.fully_qualified_name);
        self.print(&format!("Starting test: {}\n", test.fully_qualified_name));
    }

    fn record_result(&self, result: &TestResult) {
        self.with_run(|run| run.results.push(result.clone()));
        if result.outcome == Outcome::Failed {
            let location = self
                .locations
                .lock()
                .ok()
                .and_then(|l| l.get(&result.test_id).cloned())
                .unwrap_or_default();
            self.print(&format_failure(result, &location));
        }
    }

    fn record_end(&self, test: &TestCase, outcome: Outcome) {
        let duration: Duration = self.with_run(|run| {
            run.results
                .iter()
                .filter(|r| r.test_id == test.id)
                .map(|r| r.duration)
                .sum()
        });
        tracing::info!("{outcome}: {}", test.fully_qualified_name);
        self.print(&format!(
            "{outcome} ({:.2?}): {}\n",
            duration, test.fully_qualified_name
        ));
    }
}

/// Details printed for a failed result.
fn format_failure(result: &TestResult, location: &str) -> String {
    let mut text = String::new();
    let _ = writeln!(text, "\nFAILED: {}", result.display_name);
    if !location.is_empty() {
        let _ = writeln!(text, "  at {location}");
    }
    if !result.stack_trace.is_empty() {
        let _ = writeln!(text, "\n{}", result.stack_trace);
    }

    let lines: Vec<&str> = result.stderr.lines().collect();
    if !lines.is_empty() {
        text.push('\n');
        if lines.len() > STDERR_CONTEXT_LINES * 2 {
            for line in &lines[..STDERR_CONTEXT_LINES] {
                let _ = writeln!(text, "  {line}");
            }
            let _ = writeln!(text, "  ...");
            for line in &lines[lines.len() - STDERR_CONTEXT_LINES..] {
                let _ = writeln!(text, "  {line}");
            }
        } else {
            for line in &lines {
                let _ = writeln!(text, "  {line}");
            }
        }
    }

    if let Some(message) = &result.error_message {
        let _ = writeln!(text, "\n{message}");
    }
    text.push('\n');
    text
}

/// Failure list and counts printed at the end of a run.
pub fn format_summary(run: &TestRun, results_file: Option<&Path>) -> String {
    let summary = run.summary();
    let mut text = String::new();

    let failed: Vec<&TestResult> = run
        .results
        .iter()
        .filter(|r| r.outcome == Outcome::Failed)
        .collect();
    if !failed.is_empty() {
        let _ = writeln!(text, "\nFAILED TESTS ({}):", failed.len());
        for result in failed {
            let _ = writeln!(text, "  {}", result.display_name);
        }
    }

    let _ = writeln!(text, "\nTEST RESULT SUMMARY:");
    let _ = writeln!(
        text,
        "Passed: {} ({:.1}%)",
        summary.passed,
        summary.percent(summary.passed)
    );
    let _ = writeln!(
        text,
        "Failed: {} ({:.1}%)",
        summary.failed,
        summary.percent(summary.failed)
    );
    let _ = writeln!(
        text,
        "Skipped: {} ({:.1}%)",
        summary.skipped,
        summary.percent(summary.skipped)
    );
    let _ = writeln!(
        text,
        "\nTests: {} ({} results, {:.2?})",
        summary.tests, summary.results, summary.duration
    );
    if let Some(file) = results_file {
        let _ = writeln!(text, "Results: {}", file.display());
    }
    text
}
