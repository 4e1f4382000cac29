//! Dependency closure: which open base-repository change requests the
//! provider change requests under test declare they need.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument};

use crate::core::refs::ReferencePatterns;
use crate::io::tracker::IssueTracker;

pub struct DependencyResolver<'a> {
    tracker: &'a dyn IssueTracker,
    /// Repository the seeds live in.
    seed_repo: &'a str,
    /// Repository the references point at.
    target_repo: &'a str,
    patterns: ReferencePatterns,
}

impl<'a> DependencyResolver<'a> {
    pub fn new(
        tracker: &'a dyn IssueTracker,
        seed_repo: &'a str,
        target_repo: &'a str,
        patterns: ReferencePatterns,
    ) -> Self {
        Self {
            tracker,
            seed_repo,
            target_repo,
            patterns,
        }
    }

    /// Open target ids referenced from the seeds' bodies or comments.
    ///
    /// One hop only: references found in the referenced issues are not
    /// followed. Open state is fetched fresh for every candidate.
    #[instrument(skip(self))]
    pub fn closure(&self, seeds: &[u64]) -> Result<BTreeSet<u64>> {
        let mut referenced = BTreeSet::new();
        for &seed in seeds {
            let issue = self
                .tracker
                .issue(self.seed_repo, seed)
                .with_context(|| format!("fetch {}#{seed}", self.seed_repo))?;
            referenced.extend(self.patterns.extract(&issue.body));

            let comments = self
                .tracker
                .comments(self.seed_repo, seed)
                .with_context(|| format!("fetch comments of {}#{seed}", self.seed_repo))?;
            for comment in &comments {
                referenced.extend(self.patterns.extract(comment));
            }
        }
        debug!(?referenced, "references found");

        let mut open = BTreeSet::new();
        for id in referenced {
            let issue = self
                .tracker
                .issue(self.target_repo, id)
                .with_context(|| format!("fetch {}#{id}", self.target_repo))?;
            if issue.open {
                open.insert(id);
            } else {
                debug!(id, "dropping closed dependency");
            }
        }
        info!(dependencies = ?open, "dependency closure resolved");
        Ok(open)
    }
}

/// Explicit ids first, in operator order, then dependency ids not already
/// present, ascending.
pub fn merge_pulls(explicit: &[u64], dependencies: &BTreeSet<u64>) -> Vec<u64> {
    let mut merged = explicit.to_vec();
    for &id in dependencies {
        if !merged.contains(&id) {
            merged.push(id);
        }
    }
    merged
}
