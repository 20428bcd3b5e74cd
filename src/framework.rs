//! Scheduling of runnable test items.
//!
//! Tests run in three tiers (`before`, middle, `after`). Within a tier,
//! parallel chain heads are spread over a bounded pool of worker threads;
//! each worker runs its head and then every step chained after it. The
//! remaining items run one at a time on the calling thread.

use crate::model::{Outcome, TestCase, TestId, Tier};
use crate::runnable::{RunnableTestCase, TestHost};
use crate::runner::TestCaseRunner;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread;

/// Default worker count: the machine's available parallelism.
pub fn default_max_parallel() -> usize {
    thread::available_parallelism().map_or(1, |n| n.get())
}

/// Runs tests tier by tier and reports through a [`TestHost`].
pub struct TestFramework<'a> {
    runner: &'a TestCaseRunner,
    host: &'a dyn TestHost,
    max_parallel: usize,
}

/// Address of one item: a runnable case and the index of its item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ItemRef {
    case: usize,
    item: usize,
}

/// One tier's items, chain links and completion signals.
struct TierPlan {
    cases: Vec<Arc<RunnableTestCase>>,
    items: Vec<ItemRef>,
    /// `next[i]` is the item run after item `i` in its step chain.
    next: Vec<Option<usize>>,
    senders: Mutex<Vec<Option<Sender<Outcome>>>>,
    completed: Vec<AtomicBool>,
}

impl<'a> TestFramework<'a> {
    pub fn new(runner: &'a TestCaseRunner, host: &'a dyn TestHost, max_parallel: usize) -> Self {
        Self {
            runner,
            host,
            max_parallel: max_parallel.max(1),
        }
    }

    /// Run `tests` and return the rolled-up outcome of every test.
    pub fn run_tests(&self, tests: Vec<TestCase>) -> Outcome {
        let mut tiers: HashMap<Tier, Vec<TestCase>> = HashMap::new();
        for test in tests {
            tiers.entry(test.tier()).or_default().push(test);
        }

        let mut outcomes = Vec::new();
        for tier in Tier::ALL {
            let Some(tests) = tiers.remove(&tier) else {
                continue;
            };
            tracing::info!("running {} test(s) in tier {tier:?}", tests.len());
            outcomes.extend(self.run_tier(tests));
        }
        Outcome::roll_up(outcomes)
    }

    fn run_tier(&self, tests: Vec<TestCase>) -> Vec<Outcome> {
        let (plan, receivers) = TierPlan::new(tests);
        let heads: Vec<usize> = (0..plan.items.len())
            .filter(|&i| plan.case_of(i).test.properties.parallelize)
            .collect();

        if !heads.is_empty() {
            let workers = self.max_parallel.min(heads.len());
            tracing::debug!("{} chain(s) on {workers} worker(s)", heads.len());
            let next_head = AtomicUsize::new(0);
            thread::scope(|s| {
                for _ in 0..workers {
                    s.spawn(|| {
                        loop {
                            let n = next_head.fetch_add(1, Ordering::SeqCst);
                            let Some(&head) = heads.get(n) else {
                                break;
                            };
                            self.run_chain(&plan, head);
                        }
                    });
                }
            });

            for &head in &heads {
                if receivers[head].try_recv().is_err() {
                    tracing::error!(
                        "chain '{}' ended without signalling completion",
                        plan.case_of(head).test.fully_qualified_name
                    );
                }
            }
        }

        for i in 0..plan.items.len() {
            if !plan.completed[i].load(Ordering::SeqCst) {
                self.run_and_signal(&plan, i);
            }
        }

        for case in plan.cases.iter().filter(|case| !case.is_finished()) {
            tracing::error!(
                "'{}' did not finish every matrix item",
                case.test.fully_qualified_name
            );
        }
        plan.cases.iter().map(|case| case.outcome()).collect()
    }

    /// Run a chain head, then each chained step in order. The head's signal
    /// is sent last, once the whole chain is done.
    fn run_chain(&self, plan: &TierPlan, head: usize) {
        let head_outcome = self.run_item(plan, head);

        let mut current = plan.next[head];
        let mut remaining = plan.items.len();
        while let Some(step) = current {
            if remaining == 0 || plan.completed[step].load(Ordering::SeqCst) {
                tracing::error!("step chain revisits an item; stopping");
                break;
            }
            remaining -= 1;
            let outcome = self.run_item(plan, step);
            plan.signal(step, outcome);
            current = plan.next[step];
        }

        plan.signal(head, head_outcome);
    }

    fn run_and_signal(&self, plan: &TierPlan, index: usize) {
        let outcome = self.run_item(plan, index);
        plan.signal(index, outcome);
    }

    fn run_item(&self, plan: &TierPlan, index: usize) -> Outcome {
        plan.completed[index].store(true, Ordering::SeqCst);
        let item = plan.items[index];
        plan.cases[item.case].run_item(item.item, self.runner, self.host)
    }
}

impl TierPlan {
    /// Build the plan and the receiving ends of its completion signals.
    fn new(tests: Vec<TestCase>) -> (Self, Vec<Receiver<Outcome>>) {
        let cases: Vec<Arc<RunnableTestCase>> = tests
            .into_iter()
            .map(|test| Arc::new(RunnableTestCase::new(test)))
            .collect();

        let mut items = Vec::new();
        let mut lookup: HashMap<(TestId, &str), usize> = HashMap::new();
        for (case_index, case) in cases.iter().enumerate() {
            for (item_index, item) in case.items.iter().enumerate() {
                lookup.insert((case.test.id, item.matrix_id.as_str()), items.len());
                items.push(ItemRef {
                    case: case_index,
                    item: item_index,
                });
            }
        }

        let next = items
            .iter()
            .map(|r| {
                let case = &cases[r.case];
                let next_id = case.test.next_step?;
                let matrix_id = case.items[r.item].matrix_id.as_str();
                let target = lookup.get(&(next_id, matrix_id)).copied();
                if target.is_none() {
                    tracing::error!(
                        "next step {next_id} of '{}' is not scheduled in this tier; cutting the chain",
                        case.test.fully_qualified_name
                    );
                }
                target
            })
            .collect();

        let (senders, receivers): (Vec<_>, Vec<_>) = (0..items.len())
            .map(|_| {
                let (tx, rx) = mpsc::channel();
                (Some(tx), rx)
            })
            .unzip();
        let completed = (0..items.len()).map(|_| AtomicBool::new(false)).collect();

        let plan = Self {
            cases,
            items,
            next,
            senders: Mutex::new(senders),
            completed,
        };
        (plan, receivers)
    }

    fn case_of(&self, index: usize) -> &RunnableTestCase {
        &self.cases[self.items[index].case]
    }

    /// Resolve item `index`'s completion signal. Each is sent at most once.
    fn signal(&self, index: usize, outcome: Outcome) {
        let sender = self
            .senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_mut(index)
            .and_then(Option::take);
        match sender {
            // Only chain heads are waited on.
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::error!("completion of item {index} was already signalled"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{TestProperties, TestResult};
    use crate::resolve::ExecutableResolver;
    use crate::runner::RunnerOptions;
    use crate::tags::Tags;
    use std::path::PathBuf;

    #[derive(Default)]
    struct RecordingHost {
        events: Mutex<Vec<String>>,
    }

    impl RecordingHost {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn position(&self, event: &str) -> usize {
            self.events()
                .iter()
                .position(|e| e == event)
                .unwrap_or_else(|| panic!("missing event {event}: {:?}", self.events()))
        }
    }

    impl TestHost for RecordingHost {
        fn record_start(&self, test: &TestCase) {
            self.events.lock().unwrap().push(format!("start {}", test.display_name));
        }
        fn record_result(&self, result: &TestResult) {
            self.events
                .lock()
                .unwrap()
                .push(format!("result {} {}", result.display_name, result.outcome));
        }
        fn record_end(&self, test: &TestCase, outcome: Outcome) {
            self.events
                .lock()
                .unwrap()
                .push(format!("end {} {outcome}", test.display_name));
        }
    }

    fn runner() -> TestCaseRunner {
        TestCaseRunner::new(
            ExecutableResolver::with_search_dirs(Vec::new()),
            RunnerOptions::default(),
        )
    }

    fn simulated(id: usize, name: &str, outcome: &str) -> TestCase {
        TestCase {
            id: TestId(id),
            fully_qualified_name: format!("yaml.t.TestCases.{name}"),
            display_name: name.to_string(),
            source: PathBuf::from("t.yaml"),
            line: id + 1,
            properties: TestProperties {
                simulate: Some(outcome.to_string()),
                timeout: "1000".into(),
                ..TestProperties::default()
            },
            tags: Tags::new(),
            next_step: None,
            parse_error: None,
        }
    }

    fn tagged(mut test: TestCase, tag: &str) -> TestCase {
        test.tags.add("tag", tag);
        test
    }

    #[test]
    fn tiers_run_in_order() {
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 4);
        let outcome = framework.run_tests(vec![
            tagged(simulated(0, "last", "passed"), "after"),
            simulated(1, "middle", "passed"),
            tagged(simulated(2, "first", "passed"), "before"),
        ]);

        assert_eq!(outcome, Outcome::Passed);
        assert!(host.position("end first Passed") < host.position("start middle"));
        assert!(host.position("end middle Passed") < host.position("start last"));
    }

    #[test]
    fn chain_steps_run_in_order_after_head() {
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 2);

        let mut step1 = simulated(0, "step1", "passed");
        step1.properties.parallelize = true;
        step1.next_step = Some(TestId(1));
        let mut step2 = simulated(1, "step2", "passed");
        step2.next_step = Some(TestId(2));
        let step3 = simulated(2, "step3", "failed");
        let mut other = simulated(3, "other", "passed");
        other.properties.parallelize = true;

        let outcome = framework.run_tests(vec![step1, step2, step3, other]);
        assert_eq!(outcome, Outcome::Failed);

        assert!(host.position("end step1 Passed") < host.position("start step2"));
        assert!(host.position("end step2 Passed") < host.position("start step3"));
        let events = host.events();
        // Each step ran exactly once.
        assert_eq!(events.iter().filter(|e| e.starts_with("start step2")).count(), 1);
        assert_eq!(events.iter().filter(|e| e.starts_with("start ")).count(), 4);
    }

    #[test]
    fn missing_chain_target_is_cut() {
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 1);

        let mut head = simulated(0, "head", "passed");
        head.properties.parallelize = true;
        head.next_step = Some(TestId(42));

        assert_eq!(framework.run_tests(vec![head]), Outcome::Passed);
        assert_eq!(host.events().len(), 3);
    }

    #[test]
    fn sequential_items_run_in_declaration_order() {
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 4);
        framework.run_tests(vec![
            simulated(0, "a", "passed"),
            simulated(1, "b", "skipped"),
            simulated(2, "c", "passed"),
        ]);
        assert!(host.position("end a Passed") < host.position("start b"));
        assert!(host.position("end b Skipped") < host.position("start c"));
    }

    #[test]
    fn parallel_heads_all_complete() {
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 3);
        let tests = (0..10)
            .map(|i| {
                let mut t = simulated(i, &format!("p{i}"), "passed");
                t.properties.parallelize = true;
                t
            })
            .collect();
        assert_eq!(framework.run_tests(tests), Outcome::Passed);
        let events = host.events();
        assert_eq!(events.iter().filter(|e| e.starts_with("end ")).count(), 10);
    }

    #[test]
    fn matrix_items_share_one_test_lifecycle() {
        use crate::model::MatrixRow;
        let host = RecordingHost::default();
        let runner = runner();
        let framework = TestFramework::new(&runner, &host, 2);

        let mut test = simulated(0, "m", "passed");
        test.properties.parallelize = true;
        test.properties.matrix = vec![
            MatrixRow::from([("k".to_string(), "1".to_string())]),
            MatrixRow::from([("k".to_string(), "2".to_string())]),
        ];
        framework.run_tests(vec![test]);

        let events = host.events();
        assert_eq!(events.iter().filter(|e| e.starts_with("start ")).count(), 1);
        assert_eq!(events.iter().filter(|e| e.starts_with("result ")).count(), 2);
        assert_eq!(events.last().map(String::as_str), Some("end m Passed"));
    }
}
