//! Controller settings stored in `virt-ci.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::reasons::{ReasonPattern, ReasonRegistry, default_reasons};
use crate::error::CiError;

/// Default settings file name, resolved against the run root.
pub const SETTINGS_FILE: &str = "virt-ci.toml";

/// Controller settings (TOML).
///
/// Edited by humans on the CI host. Every field has a default, so a missing
/// file describes a stock virt-test checkout with tp-libvirt downloaded as a
/// test provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CiConfig {
    /// Hard ceiling for one harness invocation.
    pub test_timeout_secs: u64,

    /// Ceiling for pre/post hooks, provisioning commands and state checks.
    pub hook_timeout_secs: u64,

    /// Keep at most this many bytes of each captured stream.
    pub output_limit_bytes: usize,

    /// Run manifest, relative to the run root.
    pub manifest: PathBuf,

    pub trunk_branch: String,

    /// Namespaces always passed to the listing harness as `--no`.
    pub default_excludes: Vec<String>,

    /// Leading id segments folded into the class name.
    pub package_namespaces: Vec<String>,

    /// Id prefix dropped before class/case decomposition.
    pub provider_prefix: String,

    pub harness: HarnessConfig,
    pub tracker: TrackerConfig,
    pub repos: ReposConfig,
    pub state: StateConfig,
    pub provision: ProvisionConfig,

    /// Known-failure reasons keyed by reason id.
    pub reasons: BTreeMap<String, ReasonPattern>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Harness entry point, relative to the run root (e.g. `["./run"]`).
    pub command: Vec<String>,
    pub backend: String,
    /// Test that installs the main VM during environment preparation.
    pub install_test: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            command: vec!["./run".to_string()],
            backend: "libvirt".to_string(),
            install_test: "unattended_install.import.import.default_install.aio_native"
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TrackerConfig {
    pub api_url: String,
    pub web_url: String,
    pub organization: String,
    /// Environment variable holding an API token; unset means anonymous.
    pub token_env: String,
    pub user_agent: String,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.github.com".to_string(),
            web_url: "https://github.com".to_string(),
            organization: "autotest".to_string(),
            token_env: "GITHUB_TOKEN".to_string(),
            user_agent: concat!("virt-ci/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl TrackerConfig {
    /// Host part of `web_url`, used to recognize change-request links.
    pub fn web_host(&self) -> &str {
        let rest = self
            .web_url
            .split_once("://")
            .map_or(self.web_url.as_str(), |(_, rest)| rest);
        rest.split('/').next().unwrap_or(rest)
    }
}

/// A repository the controller may patch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RepoConfig {
    /// Repository name on the tracker.
    pub name: String,
    /// Checkout location, relative to the run root.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReposConfig {
    /// The harness repository checked out at the run root.
    pub base: RepoConfig,
    /// The libvirt test provider repository.
    pub provider: RepoConfig,
}

impl Default for ReposConfig {
    fn default() -> Self {
        Self {
            base: RepoConfig {
                name: "virt-test".to_string(),
                path: PathBuf::from("."),
            },
            provider: RepoConfig {
                name: "tp-libvirt".to_string(),
                path: PathBuf::from("test-providers.d/downloads/io-github-autotest-libvirt"),
            },
        }
    }
}

/// Host consistency commands. Empty commands disable the step.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StateConfig {
    pub backup_command: Vec<String>,
    /// Prints one difference per stdout line.
    pub check_command: Vec<String>,
    /// Appended to `check_command` when recovery is requested.
    pub recover_arg: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProvisionConfig {
    /// Services restarted with `systemctl restart` before bootstrap.
    pub services: Vec<String>,
    pub bootstrap_command: Vec<String>,
    pub main_vm: String,
    /// Guest config holding `password = ...`.
    pub guest_os_cfg: PathBuf,
    /// Guest config holding `os_variant = ...`.
    pub image_cfg: PathBuf,
    /// Base config holding `vms = ...`.
    pub base_cfg: PathBuf,
    /// Destination for `--img-url` downloads.
    pub image_path: PathBuf,
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            services: vec!["libvirtd".to_string(), "nfs".to_string()],
            bootstrap_command: vec![
                "./run".to_string(),
                "-t".to_string(),
                "libvirt".to_string(),
                "--bootstrap".to_string(),
                "--no-downloads".to_string(),
            ],
            main_vm: "virt-tests-vm1".to_string(),
            guest_os_cfg: PathBuf::from("shared/cfg/guest-os/Linux.cfg"),
            image_cfg: PathBuf::from("shared/cfg/guest-os/Linux/JeOS/19.x86_64.cfg"),
            base_cfg: PathBuf::from("shared/cfg/base.cfg"),
            image_path: PathBuf::from("shared/data/images/jeos-19-64.qcow2"),
        }
    }
}

impl Default for CiConfig {
    fn default() -> Self {
        Self {
            test_timeout_secs: 1200,
            hook_timeout_secs: 3600,
            output_limit_bytes: 8 * 1024 * 1024,
            manifest: PathBuf::from("run.test"),
            trunk_branch: "master".to_string(),
            default_excludes: vec!["io-github-autotest-qemu".to_string()],
            package_namespaces: vec!["virsh".to_string()],
            provider_prefix: "type_specific.io-github-autotest-libvirt".to_string(),
            harness: HarnessConfig::default(),
            tracker: TrackerConfig::default(),
            repos: ReposConfig::default(),
            state: StateConfig::default(),
            provision: ProvisionConfig::default(),
            reasons: default_reasons(),
        }
    }
}

impl CiConfig {
    pub fn validate(&self) -> Result<()> {
        if self.test_timeout_secs == 0 {
            return Err(anyhow!("test_timeout_secs must be > 0"));
        }
        if self.hook_timeout_secs == 0 {
            return Err(anyhow!("hook_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.trunk_branch.trim().is_empty() {
            return Err(anyhow!("trunk_branch must not be empty"));
        }
        if self.manifest.as_os_str().is_empty() {
            return Err(anyhow!("manifest must not be empty"));
        }
        if self.harness.command.is_empty() || self.harness.command[0].trim().is_empty() {
            return Err(anyhow!("harness.command must be a non-empty array"));
        }
        if self.tracker.organization.trim().is_empty() {
            return Err(anyhow!("tracker.organization must not be empty"));
        }
        ReasonRegistry::compile(&self.reasons)?;
        Ok(())
    }
}

/// Load settings from a TOML file.
///
/// A missing file yields [`CiConfig::default`]. Any other failure is a
/// [`CiError::Settings`].
pub fn load_config(path: &Path) -> Result<CiConfig> {
    read_config(path)
        .map_err(|err| CiError::Settings(format!("{}: {err:#}", path.display())).into())
}

fn read_config(path: &Path) -> Result<CiConfig> {
    if !path.exists() {
        let cfg = CiConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).context("read settings")?;
    let cfg: CiConfig = toml::from_str(&contents).context("parse settings")?;
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join(SETTINGS_FILE)).expect("load");
        assert_eq!(cfg, CiConfig::default());
        assert!(cfg.reasons.contains_key("BUG 886456"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(SETTINGS_FILE);
        fs::write(
            &path,
            r#"
test_timeout_secs = 60
trunk_branch = "main"

[repos.provider]
name = "tp-libvirt"
path = "providers/libvirt"

[reasons."BUG 1"]
case = "virsh\\.domname"
result = "no domain"
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.test_timeout_secs, 60);
        assert_eq!(cfg.trunk_branch, "main");
        assert_eq!(cfg.repos.provider.path, PathBuf::from("providers/libvirt"));
        assert_eq!(cfg.repos.base.name, "virt-test");
        assert_eq!(cfg.harness, HarnessConfig::default());
        assert_eq!(cfg.reasons.len(), 1);
    }

    #[test]
    fn invalid_values_are_settings_errors() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(SETTINGS_FILE);
        fs::write(&path, "test_timeout_secs = 0\n").expect("write");

        let err = load_config(&path).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(CiError::Settings(msg)) if msg.contains("test_timeout_secs")
        ));
    }

    #[test]
    fn bad_reason_regex_is_rejected() {
        let mut cfg = CiConfig::default();
        cfg.reasons.insert(
            "broken".to_string(),
            ReasonPattern {
                case: "(".to_string(),
                result: ".*".to_string(),
            },
        );
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn web_host_strips_scheme_and_path() {
        let mut tracker = TrackerConfig::default();
        assert_eq!(tracker.web_host(), "github.com");
        tracker.web_url = "http://git.example.org:8080/mirror".to_string();
        assert_eq!(tracker.web_host(), "git.example.org:8080");
    }
}
