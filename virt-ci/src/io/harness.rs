//! The external test harness (`./run` in a virt-test checkout).

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::instrument;

use crate::io::config::HarnessConfig;
use crate::io::process::run_command;

/// Arguments for listing tests.
#[derive(Debug, Clone)]
pub struct ListRequest<'a> {
    /// `None` lists everything not excluded.
    pub include: Option<&'a BTreeSet<String>>,
    pub exclude: &'a BTreeSet<String>,
    pub config: Option<&'a Path>,
    pub connect_uri: Option<&'a str>,
}

/// Arguments for running exactly one test.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    pub test_id: &'a str,
    pub connect_uri: Option<&'a str>,
    pub config: Option<&'a Path>,
    /// Let the harness restore the guest image (and download it if needed).
    pub restore_image: bool,
    pub timeout: Duration,
}

/// What one harness invocation produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HarnessOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
    pub elapsed: Duration,
}

pub trait Harness {
    fn list(&self, request: &ListRequest<'_>) -> Result<HarnessOutput>;
    fn run(&self, request: &RunRequest<'_>) -> Result<HarnessOutput>;
}

#[derive(Debug, Clone)]
pub struct VirtTestHarness {
    root: PathBuf,
    config: HarnessConfig,
    list_timeout: Duration,
    output_limit_bytes: usize,
}

impl VirtTestHarness {
    pub fn new(
        root: impl Into<PathBuf>,
        config: HarnessConfig,
        list_timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            list_timeout,
            output_limit_bytes,
        }
    }

    fn command(&self, args: Vec<String>) -> Result<Command> {
        let (program, fixed) = self
            .config
            .command
            .split_first()
            .ok_or_else(|| anyhow!("harness command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(fixed).args(args).current_dir(&self.root);
        Ok(cmd)
    }

    fn invoke(&self, cmd: Command, timeout: Duration) -> Result<HarnessOutput> {
        let out = run_command(cmd, timeout, self.output_limit_bytes)?;
        Ok(HarnessOutput {
            exit_code: out.status.code(),
            stdout: out.stdout_text(),
            stderr: out.stderr_text(),
            timed_out: out.timed_out,
            elapsed: out.elapsed,
        })
    }
}

impl Harness for VirtTestHarness {
    #[instrument(skip_all)]
    fn list(&self, request: &ListRequest<'_>) -> Result<HarnessOutput> {
        let cmd = self.command(list_args(&self.config.backend, request))?;
        self.invoke(cmd, self.list_timeout)
    }

    #[instrument(skip_all, fields(test = request.test_id))]
    fn run(&self, request: &RunRequest<'_>) -> Result<HarnessOutput> {
        let cmd = self.command(run_args(&self.config.backend, request))?;
        self.invoke(cmd, request.timeout)
    }
}

fn list_args(backend: &str, request: &ListRequest<'_>) -> Vec<String> {
    let mut args = vec!["-t".to_string(), backend.to_string(), "--list-tests".to_string()];
    if let Some(uri) = request.connect_uri {
        args.extend(["--connect-uri".to_string(), uri.to_string()]);
    }
    if !request.exclude.is_empty() {
        args.extend(["--no".to_string(), join(request.exclude)]);
    }
    if let Some(include) = request.include
        && !include.is_empty()
    {
        args.extend(["--tests".to_string(), join(include)]);
    }
    if let Some(config) = request.config {
        args.extend(["-c".to_string(), config.display().to_string()]);
    }
    args
}

fn run_args(backend: &str, request: &RunRequest<'_>) -> Vec<String> {
    let flags = if request.restore_image { "-vt" } else { "-vkt" };
    let mut args = vec![
        flags.to_string(),
        backend.to_string(),
        "--keep-image-between-tests".to_string(),
    ];
    if !request.restore_image {
        args.push("--no-downloads".to_string());
    }
    args.extend(["--tests".to_string(), request.test_id.to_string()]);
    if let Some(uri) = request.connect_uri {
        args.extend(["--connect-uri".to_string(), uri.to_string()]);
    }
    if let Some(config) = request.config {
        args.extend(["-c".to_string(), config.display().to_string()]);
    }
    args
}

fn join(items: &BTreeSet<String>) -> String {
    items.iter().map(String::as_str).collect::<Vec<_>>().join(",")
}
