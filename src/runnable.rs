//! Runnable test cases: one item per matrix row, plus lifecycle tracking.

use crate::interpolate::{interpolate, interpolate_opt};
use crate::matrix;
use crate::model::{ArgumentSpec, MatrixRow, Outcome, TestCase, TestProperties, TestResult};
use crate::runner::TestCaseRunner;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// Receives lifecycle events as tests run. Called from worker threads.
pub trait TestHost: Sync {
    fn record_start(&self, test: &TestCase);
    fn record_result(&self, result: &TestResult);
    fn record_end(&self, test: &TestCase, outcome: Outcome);
}

/// Errors from driving a test case through its lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("test '{0}' was started after it finished")]
    StartedAfterFinish(String),
    #[error("test '{0}' recorded more result batches than it has items")]
    TooManyBatches(String),
}

/// One concrete invocation of a test: its properties with a matrix row
/// substituted.
#[derive(Debug, Clone)]
pub struct RunnableTestCaseItem {
    pub test: Arc<TestCase>,
    pub matrix_id: String,
    pub display_name: String,
    pub properties: TestProperties,
}

impl RunnableTestCaseItem {
    pub fn new(test: Arc<TestCase>, row: &MatrixRow) -> Self {
        Self {
            matrix_id: matrix::matrix_id(row),
            display_name: interpolate(&test.display_name, row, false),
            properties: interpolate_properties(&test.properties, row),
            test,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunState {
    NotStarted,
    Running,
    Finished,
}

#[derive(Debug)]
struct Lifecycle {
    state: RunState,
    batches: usize,
    results: Vec<TestResult>,
}

/// A test case expanded into its matrix items.
#[derive(Debug)]
pub struct RunnableTestCase {
    pub test: Arc<TestCase>,
    pub items: Vec<RunnableTestCaseItem>,
    lifecycle: Mutex<Lifecycle>,
}

impl RunnableTestCase {
    pub fn new(test: TestCase) -> Self {
        let test = Arc::new(test);
        let rows = if test.properties.matrix.is_empty() {
            matrix::new_matrix()
        } else {
            test.properties.matrix.clone()
        };
        let items = rows
            .iter()
            .map(|row| RunnableTestCaseItem::new(Arc::clone(&test), row))
            .collect();
        Self {
            test,
            items,
            lifecycle: Mutex::new(Lifecycle {
                state: RunState::NotStarted,
                batches: 0,
                results: Vec::new(),
            }),
        }
    }

    /// Run one item and record its results. Returns the item's outcome.
    pub fn run_item(&self, index: usize, runner: &TestCaseRunner, host: &dyn TestHost) -> Outcome {
        if let Err(e) = self.record_start(host) {
            tracing::error!("{e}");
        }

        let Some(item) = self.items.get(index) else {
            tracing::error!(
                "test '{}' has no item {index}",
                self.test.fully_qualified_name
            );
            return Outcome::None;
        };
        let results = runner.run(item);
        let outcome = Outcome::roll_up(results.iter().map(|r| r.outcome));

        if let Err(e) = self.record_results(host, results) {
            tracing::error!("{e}");
        }
        self.record_stop(host);
        outcome
    }

    /// Move to running on the first call; later calls are no-ops.
    pub fn record_start(&self, host: &dyn TestHost) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        match lifecycle.state {
            RunState::NotStarted => {
                lifecycle.state = RunState::Running;
                drop(lifecycle);
                host.record_start(&self.test);
                Ok(())
            }
            RunState::Running => Ok(()),
            RunState::Finished => Err(LifecycleError::StartedAfterFinish(
                self.test.fully_qualified_name.clone(),
            )),
        }
    }

    /// Record one item's batch of results.
    pub fn record_results(
        &self,
        host: &dyn TestHost,
        results: Vec<TestResult>,
    ) -> Result<(), LifecycleError> {
        let mut lifecycle = self.lock();
        if lifecycle.batches >= self.items.len() {
            return Err(LifecycleError::TooManyBatches(
                self.test.fully_qualified_name.clone(),
            ));
        }
        lifecycle.batches += 1;
        for result in &results {
            host.record_result(result);
        }
        lifecycle.results.extend(results);
        Ok(())
    }

    /// Finish the test once every item has recorded its results.
    pub fn record_stop(&self, host: &dyn TestHost) {
        let mut lifecycle = self.lock();
        if lifecycle.state == RunState::Finished {
            return;
        }
        if lifecycle.batches < self.items.len() {
            tracing::debug!(
                "'{}' has {} of {} item results; not stopping yet",
                self.test.fully_qualified_name,
                lifecycle.batches,
                self.items.len()
            );
            return;
        }

        lifecycle.state = RunState::Finished;
        let outcome = Outcome::roll_up(lifecycle.results.iter().map(|r| r.outcome));
        drop(lifecycle);
        host.record_end(&self.test, outcome);
    }

    pub fn is_finished(&self) -> bool {
        self.lock().state == RunState::Finished
    }

    /// Rolled-up outcome of the results recorded so far.
    pub fn outcome(&self) -> Outcome {
        Outcome::roll_up(self.lock().results.iter().map(|r| r.outcome))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn interpolate_properties(properties: &TestProperties, row: &MatrixRow) -> TestProperties {
    if row.is_empty() {
        return properties.clone();
    }

    let text = |s: &Option<String>| interpolate_opt(s.as_deref(), row, false);
    let pairs = |pairs: &[(String, String)]| {
        pairs
            .iter()
            .map(|(k, v)| (interpolate(k, row, false), interpolate(v, row, false)))
            .collect::<Vec<_>>()
    };

    TestProperties {
        cli: text(&properties.cli),
        command: text(&properties.command),
        script: text(&properties.script),
        script_is_bash: properties.script_is_bash,
        arguments: properties.arguments.as_ref().map(|arguments| match arguments {
            ArgumentSpec::Text(s) => ArgumentSpec::Text(interpolate(s, row, false)),
            ArgumentSpec::Pairs(p) => ArgumentSpec::Pairs(pairs(p)),
        }),
        input: text(&properties.input),
        expect_regex: text(&properties.expect_regex),
        not_expect_regex: text(&properties.not_expect_regex),
        expect_gpt: text(&properties.expect_gpt),
        env: properties
            .env
            .iter()
            .map(|(k, v)| (k.clone(), interpolate(v, row, false)))
            .collect(),
        working_directory: PathBuf::from(interpolate(
            &properties.working_directory.to_string_lossy(),
            row,
            false,
        )),
        timeout: interpolate(&properties.timeout, row, false),
        skip_on_failure: properties.skip_on_failure,
        foreach: properties.foreach.as_deref().map(pairs),
        matrix: properties.matrix.clone(),
        parallelize: properties.parallelize,
        simulate: text(&properties.simulate),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TestId;
    use crate::tags::Tags;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingHost {
        starts: AtomicUsize,
        results: AtomicUsize,
        ends: AtomicUsize,
    }

    impl TestHost for CountingHost {
        fn record_start(&self, _test: &TestCase) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }
        fn record_result(&self, _result: &TestResult) {
            self.results.fetch_add(1, Ordering::SeqCst);
        }
        fn record_end(&self, _test: &TestCase, _outcome: Outcome) {
            self.ends.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn test_case(rows: Vec<MatrixRow>) -> TestCase {
        TestCase {
            id: TestId(0),
            fully_qualified_name: "yaml.t.TestCases.voice".into(),
            display_name: "voice ${{ matrix.voice }}".into(),
            source: PathBuf::from("t.yaml"),
            line: 1,
            properties: TestProperties {
                command: Some("speak --voice ${{ voice }}".into()),
                timeout: "1000".into(),
                matrix: rows,
                ..TestProperties::default()
            },
            tags: Tags::new(),
            next_step: None,
            parse_error: None,
        }
    }

    fn row(voice: &str) -> MatrixRow {
        MatrixRow::from([("voice".to_string(), voice.to_string())])
    }

    fn result(test: &TestCase, outcome: Outcome) -> TestResult {
        let mut result = TestResult::new(test, test.display_name.clone());
        result.outcome = outcome;
        result
    }

    #[test]
    fn one_item_per_matrix_row() {
        let runnable = RunnableTestCase::new(test_case(vec![row("a"), row("b")]));
        assert_eq!(runnable.items.len(), 2);
        assert_eq!(runnable.items[0].display_name, "voice a");
        assert_eq!(
            runnable.items[1].properties.command.as_deref(),
            Some("speak --voice b")
        );
        assert_ne!(runnable.items[0].matrix_id, runnable.items[1].matrix_id);
    }

    #[test]
    fn empty_matrix_gives_single_item() {
        let runnable = RunnableTestCase::new(test_case(Vec::new()));
        assert_eq!(runnable.items.len(), 1);
        assert_eq!(runnable.items[0].display_name, "voice ${{ matrix.voice }}");
    }

    #[test]
    fn start_is_recorded_once() {
        let host = CountingHost::default();
        let runnable = RunnableTestCase::new(test_case(vec![row("a"), row("b")]));
        runnable.record_start(&host).unwrap();
        runnable.record_start(&host).unwrap();
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn stop_waits_for_every_item() {
        let host = CountingHost::default();
        let runnable = RunnableTestCase::new(test_case(vec![row("a"), row("b")]));
        let test = Arc::clone(&runnable.test);
        runnable.record_start(&host).unwrap();

        runnable
            .record_results(&host, vec![result(&test, Outcome::Passed)])
            .unwrap();
        runnable.record_stop(&host);
        assert!(!runnable.is_finished());
        assert_eq!(host.ends.load(Ordering::SeqCst), 0);

        runnable
            .record_results(&host, vec![result(&test, Outcome::Failed)])
            .unwrap();
        runnable.record_stop(&host);
        assert!(runnable.is_finished());
        assert_eq!(host.ends.load(Ordering::SeqCst), 1);
        assert_eq!(host.results.load(Ordering::SeqCst), 2);
        assert_eq!(runnable.outcome(), Outcome::Failed);
    }

    #[test]
    fn start_after_finish_is_an_error() {
        let host = CountingHost::default();
        let runnable = RunnableTestCase::new(test_case(Vec::new()));
        let test = Arc::clone(&runnable.test);
        runnable.record_start(&host).unwrap();
        runnable
            .record_results(&host, vec![result(&test, Outcome::Passed)])
            .unwrap();
        runnable.record_stop(&host);

        assert!(matches!(
            runnable.record_start(&host),
            Err(LifecycleError::StartedAfterFinish(_))
        ));
        assert!(matches!(
            runnable.record_results(&host, Vec::new()),
            Err(LifecycleError::TooManyBatches(_))
        ));
    }
}
