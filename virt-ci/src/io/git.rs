//! Git adapter for the repositories a run patches.
//!
//! A small, explicit wrapper around `git` subprocess calls scoped to one
//! working tree. Callers never change the process working directory for git.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all, fields(repo = %self.workdir.display()))]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD in {}", self.workdir.display()));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    pub fn head_sha(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Create and checkout a new branch at current HEAD. Fails if it exists.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.run_checked(&["checkout", "-b", branch])?;
        Ok(())
    }

    #[instrument(skip_all, fields(branch))]
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "checking out branch");
        self.run_checked(&["checkout", branch])?;
        Ok(())
    }

    /// Force-delete a local branch.
    #[instrument(skip_all, fields(branch))]
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "deleting branch");
        self.run_checked(&["branch", "-D", branch])?;
        Ok(())
    }

    /// Apply a mailbox patch with 3-way merge fallback.
    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn am_3way(&self, patch: &Path) -> Result<()> {
        let patch = patch
            .to_str()
            .ok_or_else(|| anyhow!("non-utf8 patch path {}", patch.display()))?;
        self.run_checked(&["am", "-3", patch])?;
        Ok(())
    }

    /// Abort an in-progress `git am` so the tree can be checked out again.
    pub fn am_abort(&self) -> Result<()> {
        self.run_checked(&["am", "--abort"])?;
        Ok(())
    }

    /// Paths that differ between the working tree and `base`.
    pub fn changed_files(&self, base: &str) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", base, "--name-only"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}
