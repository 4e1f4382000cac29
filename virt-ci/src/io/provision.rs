//! Hypervisor host preparation before the first test.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{OutputGrammar, RawOutput};
use crate::core::types::TestStatus;
use crate::io::config::{HarnessConfig, ProvisionConfig};
use crate::io::harness::{Harness, RunRequest};
use crate::io::http::Fetch;
use crate::io::process::run_command;

/// Operator overrides applied while preparing the host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvOptions {
    pub password: Option<String>,
    pub os_variant: Option<String>,
    pub additional_vms: Vec<String>,
    pub image_url: Option<String>,
    /// Keep the existing guest instead of reinstalling it.
    pub retain_vm: bool,
    pub connect_uri: Option<String>,
}

pub trait Provisioner {
    fn prepare(&mut self, env: &EnvOptions) -> Result<()>;
}

/// Prepares a libvirt host for virt-test: services, guest configs,
/// bootstrap, image and the main/additional guests.
pub struct LibvirtProvisioner<'a> {
    root: PathBuf,
    config: ProvisionConfig,
    install_test: String,
    test_timeout: Duration,
    command_timeout: Duration,
    output_limit_bytes: usize,
    harness: &'a dyn Harness,
    fetch: &'a dyn Fetch,
}

impl<'a> LibvirtProvisioner<'a> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        root: impl Into<PathBuf>,
        config: ProvisionConfig,
        harness_config: &HarnessConfig,
        test_timeout: Duration,
        command_timeout: Duration,
        output_limit_bytes: usize,
        harness: &'a dyn Harness,
        fetch: &'a dyn Fetch,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            install_test: harness_config.install_test.clone(),
            test_timeout,
            command_timeout,
            output_limit_bytes,
            harness,
            fetch,
        }
    }

    fn path(&self, relative: &Path) -> PathBuf {
        self.root.join(relative)
    }

    /// Run a host command. Non-zero exits are errors unless `ignore_status`.
    fn command(&self, argv: &[&str], ignore_status: bool) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("empty command"))?;
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(&self.root);
        let out = run_command(cmd, self.command_timeout, self.output_limit_bytes)?;
        if out.success() {
            return Ok(());
        }
        let detail = format!(
            "{} failed (exit {:?}, timed out: {}): {}",
            argv.join(" "),
            out.status.code(),
            out.timed_out,
            out.stderr_text().trim()
        );
        if ignore_status {
            debug!(%detail, "ignoring command failure");
            Ok(())
        } else {
            Err(anyhow!(detail))
        }
    }

    fn virsh(&self, env: &EnvOptions, args: &[&str], ignore_status: bool) -> Result<()> {
        let mut argv = vec!["virsh"];
        if let Some(uri) = env.connect_uri.as_deref() {
            argv.extend(["-c", uri]);
        }
        argv.extend_from_slice(args);
        self.command(&argv, ignore_status)
    }

    fn rewrite_configs(&self, env: &EnvOptions) -> Result<()> {
        if let Some(password) = env.password.as_deref() {
            replace_in_file(
                &self.path(&self.config.guest_os_cfg),
                r"password = \S*",
                &format!("password = {password}"),
            )?;
        }
        if let Some(os_variant) = env.os_variant.as_deref() {
            replace_in_file(
                &self.path(&self.config.image_cfg),
                r"os_variant = \S*",
                &format!("os_variant = {os_variant}"),
            )?;
        }
        if !env.additional_vms.is_empty() {
            let vms = std::iter::once(self.config.main_vm.as_str())
                .chain(env.additional_vms.iter().map(String::as_str))
                .collect::<Vec<_>>()
                .join(" ");
            replace_in_file(
                &self.path(&self.config.base_cfg),
                r"^[ \t]*vms = .*$",
                &format!("vms = {vms}"),
            )?;
        }
        Ok(())
    }

    fn remove_guests(&self, env: &EnvOptions) -> Result<()> {
        let undefine_flags: &[&str] = if env.connect_uri.is_some() {
            &["--snapshots-metadata", "--managed-save"]
        } else {
            &["--snapshots-metadata"]
        };
        let guests = std::iter::once(&self.config.main_vm).chain(&env.additional_vms);
        for vm in guests {
            self.virsh(env, &["destroy", vm.as_str()], true)?;
            let mut args = vec!["undefine", vm.as_str()];
            args.extend_from_slice(undefine_flags);
            self.virsh(env, &args, true)?;
        }
        Ok(())
    }

    fn install_main_guest(&self, env: &EnvOptions, restore_image: bool) -> Result<()> {
        let uri = env.connect_uri.as_deref();
        if uri.is_some_and(|uri| uri.contains("lxc")) {
            return self
                .command(
                    &[
                        "virt-install",
                        "--connect=lxc:///",
                        "--name",
                        self.config.main_vm.as_str(),
                        "--ram",
                        "500",
                        "--noautoconsole",
                    ],
                    false,
                )
                .context("install lxc guest");
        }

        let out = self.harness.run(&RunRequest {
            test_id: &self.install_test,
            connect_uri: uri,
            config: None,
            restore_image,
            timeout: self.test_timeout,
        })?;
        let classification = OutputGrammar::default().classify(RawOutput {
            stdout: &out.stdout,
            stderr: &out.stderr,
            timed_out: out.timed_out,
        });
        println!("Result: {} {:.2} s", classification.status, out.elapsed.as_secs_f64());
        if classification.status != TestStatus::Pass {
            return Err(anyhow!(
                "failed to install guest ({}):\n{}",
                classification.status,
                out.stderr.trim_end()
            ));
        }
        self.virsh(env, &["destroy", self.config.main_vm.as_str()], false)
    }

    fn clone_guests(&self, env: &EnvOptions) -> Result<()> {
        for vm in &env.additional_vms {
            let mut argv = vec!["virt-clone".to_string()];
            if let Some(uri) = env.connect_uri.as_deref() {
                argv.push(format!("--connect={uri}"));
            }
            argv.push(format!("--original={}", self.config.main_vm));
            argv.push(format!("--name={vm}"));
            argv.push("--auto-clone".to_string());
            let argv: Vec<&str> = argv.iter().map(String::as_str).collect();
            self.command(&argv, false)
                .with_context(|| format!("clone guest {vm}"))?;
        }
        Ok(())
    }
}

impl Provisioner for LibvirtProvisioner<'_> {
    #[instrument(skip_all)]
    fn prepare(&mut self, env: &EnvOptions) -> Result<()> {
        for service in &self.config.services {
            self.command(&["systemctl", "restart", service.as_str()], false)
                .with_context(|| format!("restart {service}"))?;
        }

        self.rewrite_configs(env)?;

        println!("Running bootstrap");
        let bootstrap: Vec<&str> = self
            .config
            .bootstrap_command
            .iter()
            .map(String::as_str)
            .collect();
        if bootstrap.is_empty() {
            warn!("no bootstrap command configured");
        } else {
            self.command(&bootstrap, false).context("bootstrap")?;
        }

        let mut restore_image = true;
        if let Some(url) = env.image_url.as_deref() {
            println!("Downloading image from {url}.");
            let dest = self.path(&self.config.image_path);
            let bytes = self.fetch.download(url, &dest)?;
            info!(bytes, dest = %dest.display(), "image downloaded");
            restore_image = false;
        }

        if env.retain_vm {
            info!(vm = %self.config.main_vm, "retaining existing guest");
            return Ok(());
        }

        println!("Removing VM");
        self.remove_guests(env)?;

        println!("Installing VM");
        self.install_main_guest(env, restore_image)?;
        self.clone_guests(env)
    }
}

/// Replace every match of `pattern` (line-anchored when it uses `^`/`$`)
/// in the file at `path`.
pub fn replace_in_file(path: &Path, pattern: &str, replacement: &str) -> Result<()> {
    let re = Regex::new(&format!("(?m){pattern}"))
        .with_context(|| format!("compile pattern {pattern:?}"))?;
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let updated = re.replace_all(&contents, regex::NoExpand(replacement));
    if updated == contents {
        debug!(path = %path.display(), pattern, "pattern not found");
        return Ok(());
    }
    fs::write(path, updated.as_bytes()).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
