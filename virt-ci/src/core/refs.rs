//! Cross-repository change references found in issue bodies and comments.
//!
//! Two forms are recognized for one fixed target repository:
//! `org/repo#123` and `https://host/org/repo/pull/123` (or `/issues/123`).

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use regex::Regex;

#[derive(Debug, Clone)]
pub struct ReferencePatterns {
    short: Regex,
    url: Regex,
}

impl ReferencePatterns {
    pub fn new(host: &str, org: &str, repo: &str) -> Result<Self> {
        let org = regex::escape(org);
        let repo = regex::escape(repo);
        let host = regex::escape(host);
        let short = Regex::new(&format!(r"{org}/{repo}#([0-9]+)"))
            .with_context(|| format!("compile short reference pattern for {org}/{repo}"))?;
        let url = Regex::new(&format!(
            r"https?://{host}/{org}/{repo}/(?:pull|issues)/([0-9]+)"
        ))
        .with_context(|| format!("compile url reference pattern for {org}/{repo}"))?;
        Ok(Self { short, url })
    }

    /// All referenced ids in `text`, scanned line by line.
    pub fn extract(&self, text: &str) -> BTreeSet<u64> {
        let mut ids = BTreeSet::new();
        for line in text.lines() {
            for re in [&self.short, &self.url] {
                ids.extend(
                    re.captures_iter(line)
                        .filter_map(|caps| caps.get(1))
                        .filter_map(|m| m.as_str().parse::<u64>().ok()),
                );
            }
        }
        ids
    }
}
