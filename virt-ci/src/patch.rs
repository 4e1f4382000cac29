//! Disposable patch branches: one per repository per run.
//!
//! A session is started (branch created and recorded) before any patch is
//! applied, so the caller can restore the repository even when applying
//! fails halfway.

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::error::CiError;
use crate::io::git::Git;
use crate::io::tracker::IssueTracker;

/// A patch branch the controller owns for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSession {
    pub repository: String,
    pub path: PathBuf,
    pub branch_name: String,
    pub created_from_commit: String,
}

/// Branch name for a set of change requests: the ids joined by commas.
pub fn branch_name(ids: &[u64]) -> String {
    ids.iter()
        .map(u64::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

pub struct BranchMutator<'a> {
    tracker: &'a dyn IssueTracker,
    trunk: &'a str,
}

impl<'a> BranchMutator<'a> {
    pub fn new(tracker: &'a dyn IssueTracker, trunk: &'a str) -> Self {
        Self { tracker, trunk }
    }

    /// Create and check out the patch branch. A name collision is fatal.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub fn start_session(
        &self,
        repository: &str,
        path: PathBuf,
        ids: &[u64],
    ) -> Result<BranchSession> {
        let git = Git::new(&path);
        let branch_name = branch_name(ids);
        let start = || -> Result<String> {
            let head = git.head_sha()?;
            git.checkout_new_branch(&branch_name)
                .with_context(|| format!("create branch {branch_name}"))?;
            Ok(head)
        };
        let created_from_commit = start().map_err(|err| CiError::repo_prep(repository, err))?;
        info!(branch = %branch_name, from = %created_from_commit, "patch branch created");
        Ok(BranchSession {
            repository: repository.to_string(),
            path,
            branch_name,
            created_from_commit,
        })
    }

    /// Apply every open change request in order. Closed ones are skipped.
    /// Returns the ids actually applied.
    pub fn apply_all(&self, session: &BranchSession, ids: &[u64]) -> Result<Vec<u64>> {
        let mut applied = Vec::new();
        for &id in ids {
            if self
                .apply_one(session, id)
                .map_err(|err| CiError::repo_prep(&session.repository, err))?
            {
                applied.push(id);
            }
        }
        Ok(applied)
    }

    #[instrument(skip(self, session), fields(repo = %session.repository))]
    fn apply_one(&self, session: &BranchSession, id: u64) -> Result<bool> {
        let repo = session.repository.as_str();
        let issue = self
            .tracker
            .issue(repo, id)
            .with_context(|| format!("fetch {repo}#{id}"))?;
        if !issue.open {
            info!(id, "change request is not open, skipping");
            return Ok(false);
        }

        // Removed on drop, whatever happens below.
        let patch = tempfile::Builder::new()
            .prefix(&format!("{repo}-{id}-"))
            .suffix(".patch")
            .tempfile()
            .context("create patch file")?;
        self.tracker
            .patch(repo, id, patch.path())
            .with_context(|| format!("download patch for {repo}#{id}"))?;
        let contents = fs::read_to_string(patch.path())
            .with_context(|| format!("read patch for {repo}#{id}"))?;
        if contents.trim().is_empty() {
            warn!(id, "empty patch content");
            println!("WARNING: empty content for PR #{id}");
        }

        println!("Patching {repo} PR #{id}");
        let git = Git::new(&session.path);
        if let Err(err) = git.am_3way(patch.path()) {
            if let Err(abort_err) = git.am_abort() {
                warn!(err = %abort_err, "git am --abort failed");
            }
            return Err(err).with_context(|| format!("apply patch {id}"));
        }
        Ok(true)
    }

    /// Check out trunk and delete the patch branch. Failures are logged,
    /// never returned; returns whether both steps succeeded.
    #[instrument(
        skip(self, session),
        fields(repo = %session.repository, branch = %session.branch_name)
    )]
    pub fn restore(&self, session: &BranchSession) -> bool {
        let git = Git::new(&session.path);
        let mut clean = true;
        if let Err(err) = git.checkout_branch(self.trunk) {
            warn!(err = %format!("{err:#}"), "could not check out trunk");
            clean = false;
        }
        if let Err(err) = git.delete_branch(&session.branch_name) {
            warn!(err = %format!("{err:#}"), "could not delete patch branch");
            clean = false;
        }
        if clean {
            info!("repository restored");
        }
        clean
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::test_support::{FakeTracker, TestRepo};

    #[test]
    fn applies_open_patches_and_skips_closed() {
        let repo = TestRepo::new().expect("repo");
        let first = repo.patch_adding("a.txt", "a\n", "Add a").expect("patch");
        let tracker = FakeTracker::new()
            .with_issue("virt-test", 175, true, "")
            .with_patch("virt-test", 175, &first)
            .with_issue("virt-test", 183, false, "");
        let mutator = BranchMutator::new(&tracker, "master");

        let session = mutator
            .start_session("virt-test", repo.path().to_path_buf(), &[175, 183])
            .expect("session");
        assert_eq!(session.branch_name, "175,183");
        assert_eq!(mutator.apply_all(&session, &[175, 183]).expect("apply"), vec![175]);
        assert!(repo.path().join("a.txt").exists());
        assert_eq!(repo.current_branch().expect("branch"), "175,183");

        assert!(mutator.restore(&session));
        assert_eq!(repo.current_branch().expect("branch"), "master");
        assert!(!repo.path().join("a.txt").exists());
        assert_eq!(repo.head_sha().expect("sha"), session.created_from_commit);
    }

    #[test]
    fn branch_collision_is_repo_prep_error() {
        let repo = TestRepo::new().expect("repo");
        repo.git(&["branch", "5"]).expect("branch");
        let tracker = FakeTracker::new();
        let mutator = BranchMutator::new(&tracker, "master");

        let err = mutator
            .start_session("tp-libvirt", repo.path().to_path_buf(), &[5])
            .unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(CiError::RepoPrep { repo, .. }) if repo == "tp-libvirt"
        ));
    }

    #[test]
    fn failed_apply_is_fatal_and_restorable() {
        let repo = TestRepo::new().expect("repo");
        let tracker = FakeTracker::new()
            .with_issue("virt-test", 9, true, "")
            .with_patch("virt-test", 9, "");
        let mutator = BranchMutator::new(&tracker, "master");
        let session = mutator
            .start_session("virt-test", repo.path().to_path_buf(), &[9])
            .expect("session");

        let err = mutator.apply_all(&session, &[9]).unwrap_err();
        assert!(matches!(classify(&err), Some(CiError::RepoPrep { .. })));
        assert!(mutator.restore(&session));
        assert_eq!(repo.current_branch().expect("branch"), "master");
    }

    #[test]
    fn restore_reports_missing_branch() {
        let repo = TestRepo::new().expect("repo");
        let tracker = FakeTracker::new();
        let mutator = BranchMutator::new(&tracker, "master");
        let session = BranchSession {
            repository: "virt-test".to_string(),
            path: repo.path().to_path_buf(),
            branch_name: "gone".to_string(),
            created_from_commit: String::new(),
        };
        assert!(!mutator.restore(&session));
        assert_eq!(repo.current_branch().expect("branch"), "master");
    }
}
