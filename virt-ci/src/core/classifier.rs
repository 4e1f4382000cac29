//! Classification of raw harness output into a [`TestStatus`] plus diagnostics.
//!
//! The log-line grammar is data ([`OutputGrammar`]) so it can be tested and
//! tuned without running the controller.

use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::TestStatus;

static RESULT_LINE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(INFO |ERROR)\| (SKIP|ERROR|FAIL|PASS)").unwrap());

/// Patterns describing the harness output format.
#[derive(Debug, Clone)]
pub struct OutputGrammar {
    /// Prefix of the stdout line carrying the single-test status.
    pub status_marker: String,
    /// Zero-based whitespace token index of the status on that line.
    pub status_token: usize,
    /// Stderr lines matching this are result-line candidates.
    pub result_line: Regex,
    /// Literal marking stderr lines captured as diagnostics on failure.
    pub error_marker: String,
    /// Width of the timestamp prefix stripped from captured error lines.
    pub prefix_width: usize,
}

impl Default for OutputGrammar {
    fn default() -> Self {
        Self {
            status_marker: "(1/1)".to_string(),
            status_token: 2,
            result_line: RESULT_LINE_RE.clone(),
            error_marker: "ERROR".to_string(),
            prefix_width: 9,
        }
    }
}

/// Output of a single harness invocation, as seen by the classifier.
#[derive(Debug, Clone, Copy)]
pub struct RawOutput<'a> {
    pub stdout: &'a str,
    pub stderr: &'a str,
    pub timed_out: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub status: TestStatus,
    pub diagnostics: Vec<String>,
    pub result_line: Option<String>,
}

impl OutputGrammar {
    /// Classify one run: status, diagnostics and the representative result line.
    pub fn classify(&self, output: RawOutput<'_>) -> Classification {
        let status = if output.timed_out {
            TestStatus::Timeout
        } else {
            self.parse_status(output.stdout)
        };

        let mut diagnostics = Vec::new();
        if status.is_failure() {
            diagnostics.extend(self.error_lines(output.stderr));
        }
        if status.is_unstructured() {
            diagnostics.extend(output.stdout.lines().map(str::to_string));
        }

        Classification {
            status,
            diagnostics,
            result_line: self.result_line(output.stderr),
        }
    }

    /// Status from the last single-test marker line; `INVALID` if none.
    pub fn parse_status(&self, stdout: &str) -> TestStatus {
        stdout
            .lines()
            .filter(|line| line.starts_with(self.status_marker.as_str()))
            .filter_map(|line| line.split_whitespace().nth(self.status_token))
            .last()
            .map_or(TestStatus::Invalid, |token| {
                TestStatus::from_token(token).unwrap_or(TestStatus::Invalid)
            })
    }

    /// Last stderr line that matches the result-line grammar.
    pub fn result_line(&self, stderr: &str) -> Option<String> {
        stderr
            .lines()
            .filter(|line| self.result_line.is_match(line))
            .last()
            .map(str::to_string)
    }

    fn error_lines<'a>(&'a self, stderr: &'a str) -> impl Iterator<Item = String> + 'a {
        stderr
            .lines()
            .filter(|line| line.contains(self.error_marker.as_str()))
            .map(|line| {
                let body: String = line.chars().skip(self.prefix_width).collect();
                format!("  {body}")
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STDERR: &str = "\
12:00:01 INFO | starting test
12:00:02 ERROR| Test failed: mount: /dev/sdb is not a valid block device
12:00:03 ERROR| FAIL virsh.change_media.floppy -> TestFail
";

    fn classify(stdout: &str, stderr: &str, timed_out: bool) -> Classification {
        OutputGrammar::default().classify(RawOutput {
            stdout,
            stderr,
            timed_out,
        })
    }

    #[test]
    fn pass_status_from_marker_line() {
        let c = classify(
            "SETUP: PASS\n(1/1) virsh.domname.normal: PASS (3.21 s)\n",
            "12:00:03 INFO | PASS virsh.domname.normal\n",
            false,
        );
        assert_eq!(c.status, TestStatus::Pass);
        assert!(c.diagnostics.is_empty());
        assert_eq!(
            c.result_line.as_deref(),
            Some("12:00:03 INFO | PASS virsh.domname.normal")
        );
    }

    #[test]
    fn failure_captures_error_lines_without_timestamp() {
        let c = classify("(1/1) virsh.change_media.floppy: FAIL (1.00 s)\n", STDERR, false);
        assert_eq!(c.status, TestStatus::Fail);
        assert_eq!(
            c.diagnostics,
            vec![
                "  ERROR| Test failed: mount: /dev/sdb is not a valid block device",
                "  ERROR| FAIL virsh.change_media.floppy -> TestFail",
            ]
        );
    }

    #[test]
    fn last_result_line_wins() {
        let c = classify("(1/1) x: FAIL (1.00 s)\n", STDERR, false);
        assert_eq!(
            c.result_line.as_deref(),
            Some("12:00:03 ERROR| FAIL virsh.change_media.floppy -> TestFail")
        );
    }

    #[test]
    fn missing_marker_is_invalid_with_stdout_diagnostics() {
        let c = classify("Traceback (most recent call last):\nImportError\n", "", false);
        assert_eq!(c.status, TestStatus::Invalid);
        assert_eq!(
            c.diagnostics,
            vec!["Traceback (most recent call last):", "ImportError"]
        );
        assert_eq!(c.result_line, None);
    }

    #[test]
    fn unknown_status_token_is_invalid() {
        let c = classify("(1/1) x: WARN (1.00 s)\n", "", false);
        assert_eq!(c.status, TestStatus::Invalid);
    }

    #[test]
    fn timeout_overrides_partial_output() {
        let c = classify("(1/1) x: PASS (1.00 s)\npartial\n", STDERR, true);
        assert_eq!(c.status, TestStatus::Timeout);
        assert_eq!(c.diagnostics, vec!["(1/1) x: PASS (1.00 s)", "partial"]);
    }

    #[test]
    fn skip_has_no_diagnostics() {
        let c = classify("(1/1) x: SKIP (0.10 s)\n", STDERR, false);
        assert_eq!(c.status, TestStatus::Skip);
        assert!(c.diagnostics.is_empty());
    }
}
