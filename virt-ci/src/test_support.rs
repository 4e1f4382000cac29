//! Test-only doubles for the side-effecting collaborators, plus throwaway git
//! repositories.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tempfile::TempDir;

use crate::io::harness::{Harness, HarnessOutput, ListRequest, RunRequest};
use crate::io::http::Fetch;
use crate::io::provision::{EnvOptions, Provisioner};
use crate::io::state::StateChecker;
use crate::io::tracker::{Issue, IssueTracker};

/// A listing call as the harness saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCall {
    pub include: Option<BTreeSet<String>>,
    pub exclude: BTreeSet<String>,
    pub config: Option<PathBuf>,
    pub connect_uri: Option<String>,
}

/// A single-test call as the harness saw it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunCall {
    pub test_id: String,
    pub connect_uri: Option<String>,
    pub config: Option<PathBuf>,
    pub restore_image: bool,
}

/// Harness that replays queued outputs. Calls beyond the script are errors.
#[derive(Debug, Default)]
pub struct ScriptedHarness {
    list_script: RefCell<VecDeque<Result<HarnessOutput, String>>>,
    run_script: RefCell<VecDeque<Result<HarnessOutput, String>>>,
    lists: RefCell<Vec<ListCall>>,
    runs: RefCell<Vec<RunCall>>,
}

impl ScriptedHarness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_list(&self, output: HarnessOutput) {
        self.list_script.borrow_mut().push_back(Ok(output));
    }

    pub fn push_run(&self, output: HarnessOutput) {
        self.run_script.borrow_mut().push_back(Ok(output));
    }

    /// Queue a run that fails to start at all.
    pub fn push_run_error(&self, message: &str) {
        self.run_script.borrow_mut().push_back(Err(message.to_string()));
    }

    pub fn lists(&self) -> Vec<ListCall> {
        self.lists.borrow().clone()
    }

    pub fn runs(&self) -> Vec<RunCall> {
        self.runs.borrow().clone()
    }

    /// Successful listing of `ids`, numbered the way the harness prints them.
    pub fn listing(ids: &[&str]) -> HarnessOutput {
        let mut stdout = String::from("SETUP: PASS (0.01 s)\nTests:\n");
        for (index, id) in ids.iter().enumerate() {
            stdout.push_str(&format!("{} {id}\n", index + 1));
        }
        Self::output(&stdout, "", Duration::from_millis(10))
    }

    pub fn output(stdout: &str, stderr: &str, elapsed: Duration) -> HarnessOutput {
        HarnessOutput {
            exit_code: Some(0),
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            timed_out: false,
            elapsed,
        }
    }

    /// Single-test output reporting `token` as the status.
    pub fn status_output(token: &str, elapsed: Duration) -> HarnessOutput {
        let stdout = format!(
            "SETUP: PASS (0.01 s)\n(1/1) x: {token} ({:.2} s)\n",
            elapsed.as_secs_f64()
        );
        Self::output(&stdout, "", elapsed)
    }
}

impl Harness for ScriptedHarness {
    fn list(&self, request: &ListRequest<'_>) -> Result<HarnessOutput> {
        self.lists.borrow_mut().push(ListCall {
            include: request.include.cloned(),
            exclude: request.exclude.clone(),
            config: request.config.map(Path::to_path_buf),
            connect_uri: request.connect_uri.map(str::to_string),
        });
        match self.list_script.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("unscripted harness listing"),
        }
    }

    fn run(&self, request: &RunRequest<'_>) -> Result<HarnessOutput> {
        self.runs.borrow_mut().push(RunCall {
            test_id: request.test_id.to_string(),
            connect_uri: request.connect_uri.map(str::to_string),
            config: request.config.map(Path::to_path_buf),
            restore_image: request.restore_image,
        });
        match self.run_script.borrow_mut().pop_front() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(anyhow!(message)),
            None => bail!("unscripted harness run of {}", request.test_id),
        }
    }
}

/// In-memory issue tracker keyed by `(repository, number)`.
#[derive(Debug, Default)]
pub struct FakeTracker {
    issues: BTreeMap<(String, u64), Issue>,
    comments: BTreeMap<(String, u64), Vec<String>>,
    patches: BTreeMap<(String, u64), String>,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_issue(mut self, repo: &str, number: u64, open: bool, body: &str) -> Self {
        self.issues.insert(
            (repo.to_string(), number),
            Issue {
                open,
                body: body.to_string(),
            },
        );
        self
    }

    pub fn with_comment(mut self, repo: &str, number: u64, body: &str) -> Self {
        self.comments
            .entry((repo.to_string(), number))
            .or_default()
            .push(body.to_string());
        self
    }

    pub fn with_patch(mut self, repo: &str, number: u64, content: &str) -> Self {
        self.patches
            .insert((repo.to_string(), number), content.to_string());
        self
    }
}

impl IssueTracker for FakeTracker {
    fn issue(&self, repo: &str, number: u64) -> Result<Issue> {
        self.issues
            .get(&(repo.to_string(), number))
            .cloned()
            .ok_or_else(|| anyhow!("404 Not Found: {repo}#{number}"))
    }

    fn comments(&self, repo: &str, number: u64) -> Result<Vec<String>> {
        Ok(self
            .comments
            .get(&(repo.to_string(), number))
            .cloned()
            .unwrap_or_default())
    }

    fn patch(&self, repo: &str, number: u64, dest: &Path) -> Result<()> {
        let content = self
            .patches
            .get(&(repo.to_string(), number))
            .ok_or_else(|| anyhow!("no patch for {repo}#{number}"))?;
        fs::write(dest, content).with_context(|| format!("write {}", dest.display()))
    }
}

/// Fetcher serving fixed bodies; unknown URLs fail.
#[derive(Debug, Default)]
pub struct StaticFetcher {
    bodies: BTreeMap<String, String>,
}

impl StaticFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, url: &str, body: impl Into<String>) -> Self {
        self.bodies.insert(url.to_string(), body.into());
        self
    }

    fn body(&self, url: &str) -> Result<&str> {
        self.bodies
            .get(url)
            .map(String::as_str)
            .ok_or_else(|| anyhow!("404 Not Found: {url}"))
    }
}

impl Fetch for StaticFetcher {
    fn get_text(&self, url: &str) -> Result<String> {
        self.body(url).map(str::to_string)
    }

    fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let body = self.body(url)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dest, body).with_context(|| format!("write {}", dest.display()))?;
        Ok(body.len() as u64)
    }
}

/// State checker that replays queued diffs and records every call.
#[derive(Debug, Default)]
pub struct RecordingStateChecker {
    diffs: VecDeque<Vec<String>>,
    calls: Vec<String>,
}

impl RecordingStateChecker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue the differences returned by the next `check`; later checks
    /// report a clean host.
    pub fn push_check(&mut self, diff: Vec<String>) {
        self.diffs.push_back(diff);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.clone()
    }
}

impl StateChecker for RecordingStateChecker {
    fn backup(&mut self) -> Result<()> {
        self.calls.push("backup".to_string());
        Ok(())
    }

    fn check(&mut self, recover: bool) -> Result<Vec<String>> {
        self.calls.push(format!("check(recover={recover})"));
        Ok(self.diffs.pop_front().unwrap_or_default())
    }
}

/// Provisioner that records the options it was given and optionally fails.
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    calls: Vec<EnvOptions>,
    failure: Option<String>,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_with(&mut self, message: &str) {
        self.failure = Some(message.to_string());
    }

    pub fn calls(&self) -> &[EnvOptions] {
        &self.calls
    }
}

impl Provisioner for RecordingProvisioner {
    fn prepare(&mut self, env: &EnvOptions) -> Result<()> {
        self.calls.push(env.clone());
        match &self.failure {
            Some(message) => Err(anyhow!(message.clone())),
            None => Ok(()),
        }
    }
}

/// Git repository in a temp dir, on `master` with one commit.
///
/// The repository lives in `<tempdir>/repo`; [`TestRepo::scratch`] paths sit
/// next to it so they never show up as untracked files.
#[derive(Debug)]
pub struct TestRepo {
    dir: TempDir,
    path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let dir = tempfile::tempdir().context("create temp dir")?;
        let path = dir.path().join("repo");
        fs::create_dir(&path).context("create repo dir")?;
        let repo = Self { dir, path };

        repo.git(&["init", "--quiet"])?;
        repo.git(&["symbolic-ref", "HEAD", "refs/heads/master"])?;
        repo.git(&["config", "user.name", "virt-ci tests"])?;
        repo.git(&["config", "user.email", "virt-ci@example.invalid"])?;
        repo.git(&["config", "commit.gpgsign", "false"])?;
        fs::write(repo.path.join("README"), "scratch repository\n").context("write README")?;
        repo.git(&["add", "README"])?;
        repo.git(&["commit", "--quiet", "-m", "Initial commit"])?;
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path outside the work tree for patches and other scratch files.
    pub fn scratch(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Run git in the repository; returns trimmed stdout.
    pub fn git(&self, args: &[&str]) -> Result<String> {
        self.git_raw(args).map(|out| out.trim().to_string())
    }

    pub fn current_branch(&self) -> Result<String> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    pub fn head_sha(&self) -> Result<String> {
        self.git(&["rev-parse", "HEAD"])
    }

    /// Mailbox patch that adds `file` with `contents`, made on a throwaway
    /// branch so `master` is left untouched.
    pub fn patch_adding(&self, file: &str, contents: &str, message: &str) -> Result<String> {
        const BRANCH: &str = "patch-scratch";
        self.git(&["checkout", "--quiet", "-b", BRANCH])?;
        fs::write(self.path.join(file), contents).with_context(|| format!("write {file}"))?;
        self.git(&["add", file])?;
        self.git(&["commit", "--quiet", "-m", message])?;
        let patch = self.git_raw(&["format-patch", "-1", "--stdout"])?;
        self.git(&["checkout", "--quiet", "master"])?;
        self.git(&["branch", "-D", BRANCH])?;
        Ok(patch)
    }

    fn git_raw(&self, args: &[&str]) -> Result<String> {
        let out = Command::new("git")
            .args(args)
            .current_dir(&self.path)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !out.status.success() {
            bail!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&out.stderr).trim()
            );
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}
