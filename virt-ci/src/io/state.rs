//! Host consistency: snapshot the host before the first test, then diff (and
//! optionally roll back) after each test.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument};

use crate::io::config::StateConfig;
use crate::io::process::run_command;

pub trait StateChecker {
    fn backup(&mut self) -> Result<()>;

    /// Differences from the backup, one human-readable line each. With
    /// `recover`, the checker also restores what it can.
    fn check(&mut self, recover: bool) -> Result<Vec<String>>;
}

/// Runs the configured backup/check commands. An empty command disables
/// that step.
#[derive(Debug, Clone)]
pub struct CommandStateChecker {
    root: PathBuf,
    config: StateConfig,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl CommandStateChecker {
    pub fn new(
        root: impl Into<PathBuf>,
        config: StateConfig,
        timeout: Duration,
        output_limit_bytes: usize,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            timeout,
            output_limit_bytes,
        }
    }

    fn run(&self, argv: &[String], extra: Option<&str>) -> Result<Option<String>> {
        let Some((program, args)) = argv.split_first() else {
            return Ok(None);
        };
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);
        if let Some(extra) = extra.filter(|arg| !arg.is_empty()) {
            cmd.arg(extra);
        }
        let out = run_command(cmd, self.timeout, self.output_limit_bytes)?;
        if out.timed_out {
            return Err(anyhow!("{} timed out", argv.join(" ")));
        }
        if !out.status.success() {
            return Err(anyhow!(
                "{} failed with {}: {}",
                argv.join(" "),
                out.status,
                out.stderr_text().trim()
            ));
        }
        Ok(Some(out.stdout_text()))
    }
}

impl StateChecker for CommandStateChecker {
    #[instrument(skip_all)]
    fn backup(&mut self) -> Result<()> {
        if self.run(&self.config.backup_command, None)?.is_none() {
            debug!("no backup command configured");
        }
        Ok(())
    }

    #[instrument(skip_all, fields(recover))]
    fn check(&mut self, recover: bool) -> Result<Vec<String>> {
        let extra = recover.then_some(self.config.recover_arg.as_str());
        let Some(stdout) = self.run(&self.config.check_command, extra)? else {
            return Ok(Vec::new());
        };
        Ok(stdout
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }
}
