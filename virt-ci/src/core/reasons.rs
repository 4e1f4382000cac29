//! Known-failure reason registry.
//!
//! A reason labels a result without changing its status: it matches when the
//! test id matches the `case` pattern and the result line matches the
//! `result` pattern.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Uncompiled reason patterns, as stored in settings or a reason document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReasonPattern {
    pub case: String,
    pub result: String,
}

/// Built-in registry entries.
pub fn default_reasons() -> BTreeMap<String, ReasonPattern> {
    BTreeMap::from([(
        "BUG 886456".to_string(),
        ReasonPattern {
            case: "virsh.change_media.floppy_test.positive_test.insert.options.live_floppy_rw.running_guest"
                .to_string(),
            result: "mount: .* is not a valid block device".to_string(),
        },
    )])
}

/// Parse a JSON reason document: `{"<reason id>": {"case": "...", "result": "..."}}`.
pub fn parse_reason_document(text: &str) -> Result<BTreeMap<String, ReasonPattern>> {
    serde_json::from_str(text).context("parse reason document")
}

#[derive(Debug)]
struct CompiledReason {
    id: String,
    case: Regex,
    result: Regex,
}

/// Compiled registry; entries are tried in id order.
#[derive(Debug, Default)]
pub struct ReasonRegistry {
    reasons: Vec<CompiledReason>,
}

impl ReasonRegistry {
    pub fn compile(patterns: &BTreeMap<String, ReasonPattern>) -> Result<Self> {
        let mut reasons = Vec::with_capacity(patterns.len());
        for (id, pattern) in patterns {
            let case = Regex::new(&pattern.case)
                .with_context(|| format!("reason {id}: invalid case pattern"))?;
            let result = Regex::new(&pattern.result)
                .with_context(|| format!("reason {id}: invalid result pattern"))?;
            reasons.push(CompiledReason {
                id: id.clone(),
                case,
                result,
            });
        }
        Ok(Self { reasons })
    }

    pub fn len(&self) -> usize {
        self.reasons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reasons.is_empty()
    }

    /// First reason whose case pattern matches `test_id` and whose result
    /// pattern matches `result_line`. No result line, no reason.
    pub fn find(&self, test_id: &str, result_line: Option<&str>) -> Option<&str> {
        let line = result_line?;
        self.reasons
            .iter()
            .find(|reason| reason.case.is_match(test_id) && reason.result.is_match(line))
            .map(|reason| reason.id.as_str())
    }
}
