//! Results files: JUnit XML and JSON.

use crate::host::{RunSummary, TestRun};
use crate::model::{Outcome, TestResult};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;

/// Default name of the JUnit results file.
pub const DEFAULT_RESULTS_FILE: &str = "test-results.xml";

/// Format a run as JUnit XML.
pub fn format_junit_xml(run: &TestRun) -> String {
    let summary = run.summary();
    let mut xml = String::new();
    xml.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    xml.push_str("<testsuites>\n");

    let _ = writeln!(
        xml,
        "  <testsuite name=\"TestSuite\" tests=\"{}\" failures=\"{}\" errors=\"0\" skipped=\"{}\" time=\"{:.3}\" timestamp=\"{}\">",
        summary.results,
        summary.failed,
        summary.skipped,
        summary.duration.as_secs_f64(),
        run.start_time.format("%Y-%m-%dT%H:%M:%S")
    );

    for result in &run.results {
        write_testcase(&mut xml, result);
    }

    xml.push_str("  </testsuite>\n");
    xml.push_str("</testsuites>\n");
    xml
}

fn write_testcase(xml: &mut String, result: &TestResult) {
    let (classname, _) = result
        .fully_qualified_name
        .rsplit_once('.')
        .unwrap_or(("", &result.fully_qualified_name));
    let _ = writeln!(
        xml,
        "    <testcase name=\"{}\" classname=\"{}\" time=\"{:.3}\">",
        escape_xml(&result.display_name),
        escape_xml(classname),
        result.duration.as_secs_f64()
    );

    match result.outcome {
        Outcome::Failed => {
            let message = result.error_message.as_deref().unwrap_or("Test failed");
            let _ = writeln!(
                xml,
                "      <failure message=\"{}\" type=\"Failure\"><![CDATA[{}]]></failure>",
                escape_xml(message),
                escape_cdata(&strip_escapes(&result.stack_trace))
            );
        }
        Outcome::Skipped => xml.push_str("      <skipped/>\n"),
        _ => {}
    }

    if !result.stdout.is_empty() {
        let _ = writeln!(
            xml,
            "      <system-out>{}</system-out>",
            escape_xml(&strip_escapes(&result.stdout))
        );
    }
    if !result.stderr.is_empty() {
        let _ = writeln!(
            xml,
            "      <system-err>{}</system-err>",
            escape_xml(&strip_escapes(&result.stderr))
        );
    }

    xml.push_str("    </testcase>\n");
}

/// Escape special XML characters.
fn escape_xml(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

/// Drop escape characters and other control characters XML cannot carry.
fn strip_escapes(s: &str) -> String {
    s.chars()
        .filter(|&c| c == '\n' || c == '\r' || c == '\t' || !c.is_control())
        .collect()
}

fn escape_cdata(s: &str) -> String {
    s.replace("]]>", "]]]]><![CDATA[>")
}

/// Write the JUnit results file, creating parent directories.
pub fn write_junit_file(run: &TestRun, path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, format_junit_xml(run))?;
    tracing::info!("wrote results to {}", path.display());
    Ok(())
}

/// The JSON document printed by `--output json`.
#[derive(Debug, Serialize)]
pub struct JsonReport<'a> {
    pub summary: RunSummary,
    pub run: &'a TestRun,
}

pub fn format_json(run: &TestRun) -> serde_json::Result<String> {
    serde_json::to_string_pretty(&JsonReport {
        summary: run.summary(),
        run,
    })
}
