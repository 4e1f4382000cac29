//! Command-line surface and the immutable per-run options derived from it.
//!
//! Every flag can also be supplied as a `CI_*` environment variable, which is
//! how CI jobs usually drive the controller. Explicit flags win.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::Parser;
use clap::builder::BoolishValueParser;

use crate::core::filter::split_list;
use crate::error::CiError;
use crate::io::config::SETTINGS_FILE;
use crate::io::provision::EnvOptions;

#[derive(Debug, Parser)]
#[command(
    name = "virt-ci",
    version,
    about = "Continuous integration of the virt-test libvirt test provider"
)]
pub struct Cli {
    /// Print the selected test names and exit.
    #[arg(long, env = "CI_LIST", value_parser = BoolishValueParser::new())]
    pub list: bool,

    /// Exclude tests (comma-separated).
    #[arg(long, env = "CI_NO", default_value = "")]
    pub no: String,

    /// Run only these tests (comma-separated).
    #[arg(long, env = "CI_ONLY", default_value = "")]
    pub only: String,

    /// Do not check host state changes after each test.
    #[arg(long, env = "CI_NO_CHECK", value_parser = BoolishValueParser::new())]
    pub no_check: bool,

    /// Do not recover host state changes after each test.
    #[arg(long, env = "CI_NO_RECOVER", value_parser = BoolishValueParser::new())]
    pub no_recover: bool,

    /// Run tests against this libvirt URI.
    #[arg(long, env = "CI_CONNECT_URI", default_value = "")]
    pub connect_uri: String,

    /// Additional VMs to clone from the main guest (comma-separated).
    #[arg(long, env = "CI_ADD_VMS", default_value = "")]
    pub additional_vms: String,

    /// Run one test case per test script.
    #[arg(long, env = "CI_SMOKE", value_parser = BoolishValueParser::new())]
    pub smoke: bool,

    /// Slice source URL followed by slice names: `URL,name[,name...]`.
    #[arg(long, env = "CI_SLICE", default_value = "")]
    pub slice: String,

    /// xunit report path.
    #[arg(long, env = "CI_REPORT", default_value = "xunit_result.xml")]
    pub report: PathBuf,

    /// Plain-text report path.
    #[arg(long = "text-report", env = "CI_TXT_REPORT", default_value = "report.txt")]
    pub text_report: PathBuf,

    /// Whitelist file: run exactly these tests.
    #[arg(long = "white", env = "CI_WHITELIST")]
    pub whitelist: Option<PathBuf>,

    /// Blacklist file: never run these tests.
    #[arg(long = "black", env = "CI_BLACKLIST")]
    pub blacklist: Option<PathBuf>,

    /// Custom Cartesian config file for the harness.
    #[arg(long, env = "CI_CONFIG")]
    pub config: Option<PathBuf>,

    /// Replace the guest image with this download.
    #[arg(long, env = "CI_IMG_URL", default_value = "")]
    pub img_url: String,

    /// OS variant for the guest install.
    #[arg(long, env = "CI_OS_VARIANT", default_value = "")]
    pub os_variant: String,

    /// Guest login password.
    #[arg(long, env = "CI_PASSWORD", default_value = "")]
    pub password: String,

    /// Merge these virt-test pull requests (comma-separated numbers).
    #[arg(long = "pull-virt-test", env = "CI_VIRT_TEST_PULL", default_value = "")]
    pub pull_virt_test: String,

    /// Merge these tp-libvirt pull requests (comma-separated numbers).
    #[arg(long = "pull-libvirt", env = "CI_LIBVIRT_PULL", default_value = "")]
    pub pull_libvirt: String,

    /// JSON document of known failure reasons.
    #[arg(long, env = "CI_REASON_URL", default_value = "")]
    pub reason_url: String,

    /// Also merge open virt-test pull requests the tp-libvirt ones depend on.
    #[arg(long, env = "CI_WITH_DEPENDENCE", value_parser = BoolishValueParser::new())]
    pub with_dependence: bool,

    /// Leave the patched branches checked out after the run.
    #[arg(long, env = "CI_NO_RESTORE_PULL", value_parser = BoolishValueParser::new())]
    pub no_restore_pull: bool,

    /// Only run tp-libvirt tests whose files changed.
    #[arg(long, env = "CI_ONLY_CHANGE", value_parser = BoolishValueParser::new())]
    pub only_change: bool,

    /// Report passing tests that changed the host as failures.
    #[arg(long, env = "CI_FAIL_DIFF", value_parser = BoolishValueParser::new())]
    pub fail_diff: bool,

    /// Keep the existing guest instead of reinstalling it.
    #[arg(long, env = "CI_RETAIN_VM", value_parser = BoolishValueParser::new())]
    pub retain_vm: bool,

    /// Shell command to run after repository preparation.
    #[arg(long, env = "CI_PRE_CMD")]
    pub pre_cmd: Option<String>,

    /// Shell command to run after the test loop.
    #[arg(long, env = "CI_POST_CMD")]
    pub post_cmd: Option<String>,

    /// virt-test checkout to run in (defaults to the current directory).
    #[arg(long, env = "CI_TEST_PATH")]
    pub test_path: Option<PathBuf>,

    /// Settings file (defaults to `virt-ci.toml` in the test path).
    #[arg(long, env = "CI_SETTINGS")]
    pub settings: Option<PathBuf>,
}

/// Slice source plus the slices chosen for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceRequest {
    pub url: String,
    pub names: Vec<String>,
}

/// Everything the operator chose for one run. Built once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOptions {
    /// Run root; relative paths below are already resolved against it.
    pub root: PathBuf,
    pub settings_path: PathBuf,
    pub list_only: bool,
    pub exclude: Vec<String>,
    /// `None` means no include restriction.
    pub include: Option<Vec<String>>,
    pub check_state: bool,
    pub recover_state: bool,
    pub smoke: bool,
    pub slice: Option<SliceRequest>,
    pub xunit_report: PathBuf,
    pub text_report: PathBuf,
    pub whitelist: Option<PathBuf>,
    pub blacklist: Option<PathBuf>,
    pub harness_config: Option<PathBuf>,
    pub env: EnvOptions,
    pub base_pulls: Vec<u64>,
    pub provider_pulls: Vec<u64>,
    pub reason_url: Option<String>,
    pub with_dependence: bool,
    pub restore_branches: bool,
    pub only_change: bool,
    pub fail_diff: bool,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
}

impl RunOptions {
    /// Options with every feature off, rooted at `root`.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            settings_path: root.join(SETTINGS_FILE),
            list_only: false,
            exclude: Vec::new(),
            include: None,
            check_state: true,
            recover_state: true,
            smoke: false,
            slice: None,
            xunit_report: root.join("xunit_result.xml"),
            text_report: root.join("report.txt"),
            whitelist: None,
            blacklist: None,
            harness_config: None,
            env: EnvOptions::default(),
            base_pulls: Vec::new(),
            provider_pulls: Vec::new(),
            reason_url: None,
            with_dependence: false,
            restore_branches: true,
            only_change: false,
            fail_diff: false,
            pre_cmd: None,
            post_cmd: None,
            root,
        }
    }
}

impl Cli {
    /// Resolve the command line against `cwd`. Malformed values are
    /// [`CiError::Settings`].
    pub fn into_options(self, cwd: &Path) -> Result<RunOptions> {
        let root = match &self.test_path {
            Some(path) => cwd.join(path),
            None => cwd.to_path_buf(),
        };
        let under_root = |path: &Path| root.join(path);

        let slice = parse_slice_arg(&self.slice);
        let include = non_empty(&self.only).map(split_list);
        let env = EnvOptions {
            password: non_empty(&self.password).map(str::to_string),
            os_variant: non_empty(&self.os_variant).map(str::to_string),
            additional_vms: split_list(&self.additional_vms),
            image_url: non_empty(&self.img_url).map(str::to_string),
            retain_vm: self.retain_vm,
            connect_uri: non_empty(&self.connect_uri).map(str::to_string),
        };

        Ok(RunOptions {
            settings_path: self
                .settings
                .as_deref()
                .map_or_else(|| root.join(SETTINGS_FILE), under_root),
            list_only: self.list,
            exclude: split_list(&self.no),
            include,
            check_state: !self.no_check,
            recover_state: !self.no_recover,
            smoke: self.smoke,
            slice,
            xunit_report: under_root(&self.report),
            text_report: under_root(&self.text_report),
            whitelist: self.whitelist.as_deref().map(under_root),
            blacklist: self.blacklist.as_deref().map(under_root),
            harness_config: self.config.as_deref().map(under_root),
            env,
            base_pulls: parse_pull_ids("--pull-virt-test", &self.pull_virt_test)?,
            provider_pulls: parse_pull_ids("--pull-libvirt", &self.pull_libvirt)?,
            reason_url: non_empty(&self.reason_url).map(str::to_string),
            with_dependence: self.with_dependence,
            restore_branches: !self.no_restore_pull,
            only_change: self.only_change,
            fail_diff: self.fail_diff,
            pre_cmd: self.pre_cmd.filter(|cmd| !cmd.trim().is_empty()),
            post_cmd: self.post_cmd.filter(|cmd| !cmd.trim().is_empty()),
            root,
        })
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let value = value.trim();
    (!value.is_empty()).then_some(value)
}

fn parse_slice_arg(value: &str) -> Option<SliceRequest> {
    let mut parts = split_list(value).into_iter();
    let url = parts.next()?;
    Some(SliceRequest {
        url,
        names: parts.collect(),
    })
}

fn parse_pull_ids(flag: &str, value: &str) -> Result<Vec<u64>> {
    let mut ids = Vec::new();
    for item in split_list(value) {
        let id = item
            .trim_start_matches('#')
            .parse::<u64>()
            .map_err(|_| {
                CiError::Settings(format!("{flag}: {item:?} is not a pull request number"))
            })?;
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    Ok(ids)
}
