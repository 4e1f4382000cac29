//! Shared deterministic types for controller core logic.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Classified outcome of a single test execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TestStatus {
    Pass,
    Fail,
    Error,
    Skip,
    /// The harness exceeded the per-test ceiling and was killed.
    Timeout,
    /// No single-test result line was found in the harness output.
    Invalid,
}

impl TestStatus {
    /// Parse the status token printed by the harness (e.g. `PASS`).
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "PASS" => Some(Self::Pass),
            "FAIL" => Some(Self::Fail),
            "ERROR" => Some(Self::Error),
            "SKIP" => Some(Self::Skip),
            "TIMEOUT" => Some(Self::Timeout),
            "INVALID" => Some(Self::Invalid),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pass => "PASS",
            Self::Fail => "FAIL",
            Self::Error => "ERROR",
            Self::Skip => "SKIP",
            Self::Timeout => "TIMEOUT",
            Self::Invalid => "INVALID",
        }
    }

    /// True for outcomes the harness reported as a test failure.
    pub fn is_failure(self) -> bool {
        matches!(self, Self::Fail | Self::Error)
    }

    /// True when the harness produced no structured result at all.
    pub fn is_unstructured(self) -> bool {
        matches!(self, Self::Timeout | Self::Invalid)
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one test run, produced by the execution engine.
///
/// Immutable once built; the controller derives report records from it.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub status: TestStatus,
    pub duration_secs: f64,
    pub stdout: String,
    pub stderr: String,
    /// Lines worth showing next to the status (error lines, raw output, drift).
    pub diagnostics: Vec<String>,
    /// Last stderr line that looked like a result; input for reason matching.
    pub result_line: Option<String>,
    /// Known-failure reason id, when one matched.
    pub reason: Option<String>,
}

impl ExecutionResult {
    /// Return a copy with environment drift lines placed before the existing
    /// diagnostics. Status is never changed by drift.
    pub fn with_drift(mut self, drift: &[String]) -> Self {
        if drift.is_empty() {
            return self;
        }
        let mut diagnostics: Vec<String> = drift.iter().map(|line| drift_line(line)).collect();
        diagnostics.append(&mut self.diagnostics);
        self.diagnostics = diagnostics;
        self
    }

    pub fn with_reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

/// Marker that prefixes environment drift diagnostics.
pub const DRIFT_MARKER: &str = "DIFF|";

/// Format one consistency-check difference as a diagnostic line.
pub fn drift_line(line: &str) -> String {
    format!("   {DRIFT_MARKER}{line}")
}

/// True if a diagnostic line came from the consistency check.
pub fn is_drift_line(line: &str) -> bool {
    line.trim_start().starts_with(DRIFT_MARKER)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(diagnostics: Vec<&str>) -> ExecutionResult {
        ExecutionResult {
            status: TestStatus::Fail,
            duration_secs: 1.0,
            stdout: String::new(),
            stderr: String::new(),
            diagnostics: diagnostics.into_iter().map(String::from).collect(),
            result_line: None,
            reason: None,
        }
    }

    #[test]
    fn status_tokens_round_trip() {
        for status in [
            TestStatus::Pass,
            TestStatus::Fail,
            TestStatus::Error,
            TestStatus::Skip,
            TestStatus::Timeout,
            TestStatus::Invalid,
        ] {
            assert_eq!(TestStatus::from_token(status.as_str()), Some(status));
        }
        assert_eq!(TestStatus::from_token("WARN"), None);
    }

    #[test]
    fn drift_is_prepended_and_keeps_status() {
        let res = result(vec!["  ERROR| boom"]).with_drift(&["file /etc/foo changed".to_string()]);
        assert_eq!(res.status, TestStatus::Fail);
        assert_eq!(
            res.diagnostics,
            vec!["   DIFF|file /etc/foo changed", "  ERROR| boom"]
        );
        assert!(is_drift_line(&res.diagnostics[0]));
        assert!(!is_drift_line(&res.diagnostics[1]));
    }

    #[test]
    fn empty_drift_is_a_no_op() {
        let res = result(vec!["a"]).with_drift(&[]);
        assert_eq!(res.diagnostics, vec!["a"]);
    }
}
