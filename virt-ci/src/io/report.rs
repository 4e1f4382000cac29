//! Run reports: xunit XML for CI dashboards and a plain-text summary.
//!
//! Both files are rewritten in full (atomically) on every save, so they are
//! consistent after each test even if the run dies later.

use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use chrono::{DateTime, Local};
use tracing::debug;

use crate::core::types::{TestStatus, is_drift_line};
use crate::io::write_atomic;

/// One reported test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    pub case_name: String,
    pub class_name: String,
    pub status: TestStatus,
    pub reason: Option<String>,
    pub stderr: String,
    pub diagnostics: Vec<String>,
    pub duration_secs: f64,
}

impl TestRecord {
    /// Placeholder for a run that selected no tests.
    pub fn no_test() -> Self {
        Self {
            case_name: "no_test".to_string(),
            class_name: "no_test".to_string(),
            status: TestStatus::Skip,
            reason: None,
            stderr: String::new(),
            diagnostics: Vec::new(),
            duration_secs: 0.0,
        }
    }

    fn has_drift(&self) -> bool {
        self.diagnostics.iter().any(|line| is_drift_line(line))
    }
}

pub trait Reporter {
    fn update(&mut self, record: TestRecord);

    /// Persist everything recorded so far. Safe to call after every update.
    fn save(&self, xml_path: &Path, text_path: &Path) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// How a record lands in xunit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Passed,
    Failure,
    Error,
    Skipped,
}

#[derive(Debug, Clone)]
pub struct XunitReport {
    suite: String,
    fail_diff: bool,
    started_at: DateTime<Local>,
    records: Vec<TestRecord>,
}

impl XunitReport {
    /// With `fail_diff`, passing tests that left the host changed are
    /// reported as failures.
    pub fn new(suite: impl Into<String>, fail_diff: bool) -> Self {
        Self {
            suite: suite.into(),
            fail_diff,
            started_at: Local::now(),
            records: Vec::new(),
        }
    }

    pub fn records(&self) -> &[TestRecord] {
        &self.records
    }

    fn outcome(&self, record: &TestRecord) -> Outcome {
        match record.status {
            TestStatus::Pass if self.fail_diff && record.has_drift() => Outcome::Failure,
            TestStatus::Pass => Outcome::Passed,
            TestStatus::Fail => Outcome::Failure,
            TestStatus::Error | TestStatus::Timeout | TestStatus::Invalid => Outcome::Error,
            TestStatus::Skip => Outcome::Skipped,
        }
    }

    fn count(&self, outcome: Outcome) -> usize {
        self.records
            .iter()
            .filter(|record| self.outcome(record) == outcome)
            .count()
    }

    fn total_secs(&self) -> f64 {
        self.records.iter().map(|record| record.duration_secs).sum()
    }

    pub fn render_xml(&self) -> String {
        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        let _ = writeln!(
            xml,
            "<testsuite name=\"{}\" tests=\"{}\" failures=\"{}\" errors=\"{}\" skipped=\"{}\" time=\"{:.2}\" timestamp=\"{}\">",
            escape(&self.suite),
            self.records.len(),
            self.count(Outcome::Failure),
            self.count(Outcome::Error),
            self.count(Outcome::Skipped),
            self.total_secs(),
            self.started_at.format("%Y-%m-%dT%H:%M:%S"),
        );
        for record in &self.records {
            let _ = write!(
                xml,
                "  <testcase classname=\"{}\" name=\"{}\" time=\"{:.2}\"",
                escape(&record.class_name),
                escape(&record.case_name),
                record.duration_secs,
            );
            let outcome = self.outcome(record);
            if outcome == Outcome::Passed && record.stderr.is_empty() {
                xml.push_str("/>\n");
                continue;
            }
            xml.push_str(">\n");

            let message = match &record.reason {
                Some(reason) => format!("{} ({reason})", record.status),
                None if record.status == TestStatus::Pass => "environment changed".to_string(),
                None => record.status.to_string(),
            };
            let body = escape(&record.diagnostics.join("\n"));
            match outcome {
                Outcome::Passed => {}
                Outcome::Failure => {
                    let _ = writeln!(
                        xml,
                        "    <failure type=\"Failure\" message=\"{}\">{body}</failure>",
                        escape(&message)
                    );
                }
                Outcome::Error => {
                    let _ = writeln!(
                        xml,
                        "    <error type=\"{}\" message=\"{}\">{body}</error>",
                        record.status,
                        escape(&message)
                    );
                }
                Outcome::Skipped => {
                    let _ = writeln!(xml, "    <skipped message=\"{}\"/>", escape(&message));
                }
            }
            if !record.stderr.is_empty() {
                let _ = writeln!(xml, "    <system-err>{}</system-err>", escape(&record.stderr));
            }
            xml.push_str("  </testcase>\n");
        }
        xml.push_str("</testsuite>\n");
        xml
    }

    pub fn render_text(&self) -> String {
        let mut text = String::new();
        let _ = writeln!(
            text,
            "{} started {}",
            self.suite,
            self.started_at.format("%Y-%m-%d %H:%M:%S")
        );
        for record in &self.records {
            let label = match self.outcome(record) {
                Outcome::Failure if record.status == TestStatus::Pass => "DIFF",
                _ => record.status.as_str(),
            };
            let _ = write!(
                text,
                "{label:<8} {}.{} {:.2}s",
                record.class_name, record.case_name, record.duration_secs
            );
            if let Some(reason) = &record.reason {
                let _ = write!(text, " [{reason}]");
            }
            text.push('\n');
            for line in &record.diagnostics {
                let _ = writeln!(text, "    {line}");
            }
        }
        let _ = writeln!(
            text,
            "{} tests, {} passed, {} failed, {} errors, {} skipped, {:.2}s",
            self.records.len(),
            self.count(Outcome::Passed),
            self.count(Outcome::Failure),
            self.count(Outcome::Error),
            self.count(Outcome::Skipped),
            self.total_secs(),
        );
        text
    }
}

impl Reporter for XunitReport {
    fn update(&mut self, record: TestRecord) {
        self.records.push(record);
    }

    fn save(&self, xml_path: &Path, text_path: &Path) -> Result<()> {
        write_atomic(xml_path, &self.render_xml())?;
        write_atomic(text_path, &self.render_text())?;
        debug!(records = self.records.len(), "report saved");
        Ok(())
    }

    fn len(&self) -> usize {
        self.records.len()
    }
}

/// Escape text for XML attributes and character data. Control characters
/// other than tab/newline/carriage return are not allowed in XML 1.0 and are
/// dropped.
fn escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            '\t' | '\n' | '\r' => out.push(ch),
            c if c.is_control() => {}
            c => out.push(c),
        }
    }
    out
}
