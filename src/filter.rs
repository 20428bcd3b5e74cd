//! `--filter` criteria.
//!
//! `+text` criteria are alternatives (at least one must match when any are
//! given), `-text` criteria must not match, and plain criteria must all
//! match. Matching is a case-insensitive substring search over a test's
//! names, tags and command text.

use crate::model::{ArgumentSpec, TestCase, TestId};
use std::collections::HashSet;

/// Parsed filter criteria.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestFilter {
    any_of: Vec<String>,
    must_match: Vec<String>,
    must_not_match: Vec<String>,
}

impl TestFilter {
    pub fn new<S: AsRef<str>>(criteria: &[S]) -> Self {
        let mut filter = Self::default();
        for criterion in criteria {
            let criterion = criterion.as_ref().trim();
            if let Some(text) = criterion.strip_prefix('+') {
                push_lowercase(&mut filter.any_of, text);
            } else if let Some(text) = criterion.strip_prefix('-') {
                push_lowercase(&mut filter.must_not_match, text);
            } else {
                push_lowercase(&mut filter.must_match, criterion);
            }
        }
        filter
    }

    pub fn is_empty(&self) -> bool {
        self.any_of.is_empty() && self.must_match.is_empty() && self.must_not_match.is_empty()
    }

    pub fn matches(&self, test: &TestCase) -> bool {
        let haystack = searchable_text(test);
        let found = |needle: &String| haystack.iter().any(|h| h.contains(needle.as_str()));

        (self.any_of.is_empty() || self.any_of.iter().any(found))
            && self.must_match.iter().all(found)
            && !self.must_not_match.iter().any(found)
    }

    /// Keep the matching tests. A step whose next step was filtered out
    /// ends its chain there.
    pub fn apply(&self, tests: Vec<TestCase>) -> Vec<TestCase> {
        if self.is_empty() {
            return tests;
        }

        let mut kept: Vec<TestCase> = tests.into_iter().filter(|t| self.matches(t)).collect();
        let ids: HashSet<TestId> = kept.iter().map(|t| t.id).collect();
        for test in &mut kept {
            if let Some(next) = test.next_step
                && !ids.contains(&next)
            {
                tracing::warn!(
                    "next step of '{}' was filtered out; its chain ends here",
                    test.fully_qualified_name
                );
                test.next_step = None;
            }
        }
        tracing::debug!("{} test(s) match the filter", kept.len());
        kept
    }
}

fn push_lowercase(list: &mut Vec<String>, text: &str) {
    if !text.is_empty() {
        list.push(text.to_lowercase());
    }
}

fn searchable_text(test: &TestCase) -> Vec<String> {
    let properties = &test.properties;
    let mut text = vec![
        test.fully_qualified_name.to_lowercase(),
        test.display_name.to_lowercase(),
    ];
    for (name, value) in test.tags.traits() {
        text.push(name.to_lowercase());
        text.push(value.to_lowercase());
    }
    for s in [&properties.command, &properties.script].into_iter().flatten() {
        text.push(s.to_lowercase());
    }
    match &properties.arguments {
        Some(ArgumentSpec::Text(s)) => text.push(s.to_lowercase()),
        Some(ArgumentSpec::Pairs(pairs)) => {
            for (k, v) in pairs {
                text.push(k.to_lowercase());
                text.push(v.to_lowercase());
            }
        }
        None => {}
    }
    text
}
