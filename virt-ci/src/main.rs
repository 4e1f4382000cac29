//! `virt-ci`: run the libvirt virt-test suite as a CI job.
//!
//! Settings come from `virt-ci.toml` in the test path (see
//! [`virt_ci::io::config`]); every flag also reads a `CI_*` environment
//! variable. Progress goes to stdout, diagnostics to stderr (`RUST_LOG`).

use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use virt_ci::controller::{Collaborators, Controller, RunStatus};
use virt_ci::error::{CiError, classify};
use virt_ci::exit_codes;
use virt_ci::io::config::load_config;
use virt_ci::io::harness::VirtTestHarness;
use virt_ci::io::http::HttpClient;
use virt_ci::io::provision::LibvirtProvisioner;
use virt_ci::io::report::XunitReport;
use virt_ci::io::state::CommandStateChecker;
use virt_ci::io::tracker::GithubTracker;
use virt_ci::logging;
use virt_ci::options::Cli;

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cwd = std::env::current_dir().context("resolve working directory")?;
    let options = Cli::parse().into_options(&cwd)?;
    let config = load_config(&options.settings_path)?;
    info!(root = %options.root.display(), "starting run");

    let hook_timeout = Duration::from_secs(config.hook_timeout_secs);
    let test_timeout = Duration::from_secs(config.test_timeout_secs);
    let limit = config.output_limit_bytes;

    let token = std::env::var(&config.tracker.token_env)
        .ok()
        .filter(|token| !token.is_empty());
    let http = HttpClient::new(&config.tracker.user_agent, token.as_deref())?;
    let tracker = GithubTracker::new(http.clone(), &config.tracker);
    let harness = VirtTestHarness::new(&options.root, config.harness.clone(), hook_timeout, limit);
    let mut state =
        CommandStateChecker::new(&options.root, config.state.clone(), hook_timeout, limit);
    let mut provisioner = LibvirtProvisioner::new(
        &options.root,
        config.provision.clone(),
        &config.harness,
        test_timeout,
        hook_timeout,
        limit,
        &harness,
        &http,
    );
    let mut report = XunitReport::new("virt-ci", options.fail_diff);

    let outcome = Controller::new(
        &config,
        &options,
        Collaborators {
            harness: &harness,
            tracker: &tracker,
            fetch: &http,
            state: &mut state,
            provisioner: &mut provisioner,
            reporter: &mut report,
        },
    )
    .run()?;

    info!(
        status = ?outcome.status,
        selected = outcome.selected.len(),
        reported = outcome.reported,
        restored = ?outcome.restored,
        "run finished"
    );
    Ok(match outcome.status {
        RunStatus::Aborted { .. } => exit_codes::ABORTED,
        RunStatus::Listed | RunStatus::NoTests | RunStatus::Completed => exit_codes::OK,
    })
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    match classify(err) {
        Some(CiError::ExecutionFault { .. }) => exit_codes::ABORTED,
        _ => exit_codes::FAILED,
    }
}
