//! Operator shell hooks run before and after the test loop.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{instrument, warn};

use crate::io::process::{CommandOutput, run_command};

/// When a hook runs, for the banner line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookStage {
    BeforeTests,
    AfterTests,
}

impl HookStage {
    fn banner(self) -> &'static str {
        match self {
            Self::BeforeTests => "before test",
            Self::AfterTests => "after test",
        }
    }
}

/// Run `sh -c <command_line>` in `root` and print its result.
///
/// A non-zero exit or timeout is only logged; the returned output lets the
/// caller decide more.
#[instrument(skip_all, fields(stage = ?stage))]
pub fn run_hook(
    stage: HookStage,
    command_line: &str,
    root: &Path,
    timeout: Duration,
    output_limit_bytes: usize,
) -> Result<CommandOutput> {
    println!("Running command line \"{command_line}\" {}.", stage.banner());
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command_line).current_dir(root);
    let out = run_command(cmd, timeout, output_limit_bytes)?;

    println!("Result:");
    for line in describe(command_line, &out).lines() {
        println!("{line}");
    }
    if !out.success() {
        warn!(
            exit_code = ?out.status.code(),
            timed_out = out.timed_out,
            "hook command failed"
        );
    }
    Ok(out)
}

fn describe(command_line: &str, out: &CommandOutput) -> String {
    let mut text = format!(
        "* Command: {command_line}\nExit status: {}\nDuration: {:.2}\n",
        out.status.code().map_or_else(|| "killed".to_string(), |code| code.to_string()),
        out.elapsed.as_secs_f64()
    );
    let stdout = out.stdout_text();
    if !stdout.trim().is_empty() {
        text.push_str("stdout:\n");
        text.push_str(stdout.trim_end());
        text.push('\n');
    }
    let stderr = out.stderr_text();
    if !stderr.trim().is_empty() {
        text.push_str("stderr:\n");
        text.push_str(stderr.trim_end());
        text.push('\n');
    }
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failing_hook_is_not_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let out = run_hook(
            HookStage::BeforeTests,
            "echo hi; exit 3",
            temp.path(),
            Duration::from_secs(10),
            4096,
        )
        .expect("hook");
        assert_eq!(out.status.code(), Some(3));
        assert_eq!(out.stdout_text(), "hi\n");
    }

    #[test]
    fn hook_runs_in_root() {
        let temp = tempfile::tempdir().expect("tempdir");
        run_hook(
            HookStage::AfterTests,
            "touch post-ran",
            temp.path(),
            Duration::from_secs(10),
            4096,
        )
        .expect("hook");
        assert!(temp.path().join("post-ran").exists());
    }

    #[test]
    fn description_includes_streams() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2"]);
        let out = run_command(cmd, Duration::from_secs(10), 4096).expect("run");
        let text = describe("x", &out);
        assert!(text.starts_with("* Command: x\nExit status: 0\n"));
        assert!(text.contains("stdout:\nout\n"));
        assert!(text.ends_with("stderr:\nerr\n"));
    }
}
