//! Run controller: the top-level state machine for one CI run.
//!
//! ```text
//! INIT -> REPO_PREP -> SELECT -> ENV_PREP -> RUN_TEST* -> CLEANUP -> DONE
//!   \________\___________\_________\___________________-> FAILED
//! ```
//!
//! Whatever happens before CLEANUP, patch branches are restored (unless
//! disabled) and the report is flushed. A fault inside the test loop stops
//! the remaining tests but not reporting or cleanup.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Local;
use tracing::{debug, error, info, instrument, warn};

use crate::core::name::{NameRules, short_name};
use crate::core::reasons::{ReasonRegistry, parse_reason_document};
use crate::core::refs::ReferencePatterns;
use crate::deps::{DependencyResolver, merge_pulls};
use crate::error::CiError;
use crate::execute::ExecutionEngine;
use crate::io::config::{CiConfig, RepoConfig};
use crate::io::git::Git;
use crate::io::harness::Harness;
use crate::io::hooks::{HookStage, run_hook};
use crate::io::http::Fetch;
use crate::io::provision::Provisioner;
use crate::io::report::{Reporter, TestRecord};
use crate::io::state::StateChecker;
use crate::io::tracker::IssueTracker;
use crate::options::RunOptions;
use crate::patch::{BranchMutator, BranchSession};
use crate::select::TestSelector;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Init,
    RepoPrep,
    Select,
    EnvPrep,
    /// Zero-based index into the selected tests.
    RunTest(usize),
    Cleanup,
    Done,
    Failed,
}

/// Mutable state threaded through one run.
#[derive(Debug)]
pub struct RunContext {
    pub phase: RunPhase,
    /// Patch branches to restore, in creation order.
    pub sessions: Vec<BranchSession>,
    /// Provider repository paths changed by the applied patches.
    pub provider_changes: Option<Vec<String>>,
    pub selected: Vec<String>,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            phase: RunPhase::Init,
            sessions: Vec::new(),
            provider_changes: None,
            selected: Vec::new(),
        }
    }
}

impl RunContext {
    fn enter(&mut self, phase: RunPhase) {
        debug!(from = ?self.phase, to = ?phase, "phase transition");
        self.phase = phase;
    }
}

/// How a run that reached CLEANUP ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunStatus {
    /// `--list`: names printed, nothing executed.
    Listed,
    /// Selection was empty; a placeholder record was reported.
    NoTests,
    /// Every selected test ran.
    Completed,
    /// A fault stopped the loop after `executed` tests.
    Aborted { executed: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub selected: Vec<String>,
    pub reported: usize,
    /// Repositories whose patch branch was restored cleanly.
    pub restored: Vec<String>,
}

/// External systems the controller drives.
pub struct Collaborators<'a> {
    pub harness: &'a dyn Harness,
    pub tracker: &'a dyn IssueTracker,
    pub fetch: &'a dyn Fetch,
    pub state: &'a mut dyn StateChecker,
    pub provisioner: &'a mut dyn Provisioner,
    pub reporter: &'a mut dyn Reporter,
}

pub struct Controller<'a> {
    config: &'a CiConfig,
    options: &'a RunOptions,
    rules: NameRules,
    collab: Collaborators<'a>,
}

impl<'a> Controller<'a> {
    pub fn new(config: &'a CiConfig, options: &'a RunOptions, collab: Collaborators<'a>) -> Self {
        Self {
            config,
            options,
            rules: NameRules::new(&config.provider_prefix, config.package_namespaces.clone()),
            collab,
        }
    }

    /// Execute the run. Failures before the test loop are returned as errors
    /// (after cleanup); a fault inside the loop yields [`RunStatus::Aborted`].
    #[instrument(skip_all, fields(root = %self.options.root.display()))]
    pub fn run(&mut self) -> Result<RunOutcome> {
        let mut ctx = RunContext::default();
        let driven = self.drive(&mut ctx);
        if let Err(err) = &driven {
            error!(phase = ?ctx.phase, "run failed: {err:#}");
        }

        ctx.enter(RunPhase::Cleanup);
        let restored = self.restore_branches(&ctx);
        let saved = match &driven {
            Ok(RunStatus::Listed) => Ok(()),
            _ => self.save_report(),
        };

        match (driven, saved) {
            (Ok(status), Ok(())) => {
                ctx.enter(RunPhase::Done);
                Ok(RunOutcome {
                    status,
                    reported: self.collab.reporter.len(),
                    selected: ctx.selected,
                    restored,
                })
            }
            (Ok(_), Err(err)) => {
                ctx.enter(RunPhase::Failed);
                Err(err)
            }
            (Err(err), saved) => {
                if let Err(save_err) = saved {
                    error!("final report flush failed: {save_err:#}");
                }
                ctx.enter(RunPhase::Failed);
                Err(err)
            }
        }
    }

    fn drive(&mut self, ctx: &mut RunContext) -> Result<RunStatus> {
        let reasons = self.load_reasons()?;

        ctx.enter(RunPhase::RepoPrep);
        self.prepare_repos(ctx)?;
        if let Some(cmd) = &self.options.pre_cmd {
            self.hook(HookStage::BeforeTests, cmd);
        }

        ctx.enter(RunPhase::Select);
        let tests = TestSelector::new(
            self.config,
            self.options,
            &self.rules,
            self.collab.harness,
            self.collab.fetch,
        )
        .select(ctx.provider_changes.as_deref())?;
        ctx.selected = tests.clone();

        if self.options.list_only {
            for test in &tests {
                println!("{}", short_name(test));
            }
            return Ok(RunStatus::Listed);
        }
        if tests.is_empty() {
            self.collab.reporter.update(TestRecord::no_test());
            println!("No test to run!");
            return Ok(RunStatus::NoTests);
        }

        ctx.enter(RunPhase::EnvPrep);
        self.collab
            .provisioner
            .prepare(&self.options.env)
            .map_err(CiError::env_prep)?;
        self.collab.state.backup().map_err(CiError::env_prep)?;

        match self.run_tests(ctx, &tests, &reasons) {
            Ok(()) => {
                if let Some(cmd) = &self.options.post_cmd {
                    self.hook(HookStage::AfterTests, cmd);
                }
                Ok(RunStatus::Completed)
            }
            Err(err) => {
                let executed = self.collab.reporter.len();
                error!(executed, "test loop aborted: {err:?}");
                Ok(RunStatus::Aborted { executed })
            }
        }
    }

    /// Settings reasons, overlaid with the `--reason-url` document.
    fn load_reasons(&self) -> Result<ReasonRegistry> {
        let mut patterns = self.config.reasons.clone();
        if let Some(url) = &self.options.reason_url {
            let document = self
                .collab
                .fetch
                .get_text(url)
                .and_then(|text| parse_reason_document(&text))
                .map_err(|err| CiError::Settings(format!("reason document {url}: {err:#}")))?;
            patterns.extend(document);
        }
        let registry = ReasonRegistry::compile(&patterns)
            .map_err(|err| CiError::Settings(format!("{err:#}")))?;
        debug!(reasons = registry.len(), "reason registry ready");
        Ok(registry)
    }

    fn prepare_repos(&self, ctx: &mut RunContext) -> Result<()> {
        let repos = &self.config.repos;
        let mutator = BranchMutator::new(self.collab.tracker, &self.config.trunk_branch);

        let mut base_pulls = self.options.base_pulls.clone();
        if self.options.with_dependence && !self.options.provider_pulls.is_empty() {
            let patterns = ReferencePatterns::new(
                self.config.tracker.web_host(),
                &self.config.tracker.organization,
                &repos.base.name,
            )?;
            let dependencies = DependencyResolver::new(
                self.collab.tracker,
                &repos.provider.name,
                &repos.base.name,
                patterns,
            )
            .closure(&self.options.provider_pulls)
            .map_err(|err| CiError::repo_prep(&repos.base.name, err))?;
            base_pulls = merge_pulls(&base_pulls, &dependencies);
        }

        for (repo, ids) in [
            (&repos.base, &base_pulls),
            (&repos.provider, &self.options.provider_pulls),
        ] {
            if ids.is_empty() {
                continue;
            }
            let session = mutator.start_session(&repo.name, self.repo_path(repo), ids)?;
            ctx.sessions.push(session.clone());
            let applied = mutator.apply_all(&session, ids)?;
            info!(repo = %repo.name, ?applied, "patches applied");
        }

        if self.options.only_change {
            let changes = match ctx
                .sessions
                .iter()
                .find(|session| session.repository == repos.provider.name)
            {
                Some(session) => Git::new(session.path.clone())
                    .changed_files(&self.config.trunk_branch)
                    .map_err(|err| CiError::repo_prep(&repos.provider.name, err))?,
                None => {
                    warn!("--only-change without provider pull requests selects nothing");
                    Vec::new()
                }
            };
            ctx.provider_changes = Some(changes);
        }
        Ok(())
    }

    fn run_tests(
        &mut self,
        ctx: &mut RunContext,
        tests: &[String],
        reasons: &ReasonRegistry,
    ) -> Result<()> {
        let options = self.options;
        let engine = ExecutionEngine::new(
            self.collab.harness,
            options.root.clone(),
            Duration::from_secs(self.config.test_timeout_secs),
            options.env.connect_uri.as_deref(),
            options.harness_config.as_deref(),
        );

        for (index, test) in tests.iter().enumerate() {
            ctx.enter(RunPhase::RunTest(index));
            print!(
                "{} ({}/{}) {} ",
                Local::now().format("%H:%M:%S"),
                index + 1,
                tests.len(),
                short_name(test)
            );
            if let Err(err) = std::io::stdout().flush() {
                debug!(err = %err, "stdout flush failed");
            }

            let mut result = engine.run_one(test)?;
            if options.check_state {
                let drift = self
                    .collab
                    .state
                    .check(options.recover_state)
                    .with_context(|| format!("check host state after {test}"))?;
                result = result.with_drift(&drift);
            }
            for line in &result.diagnostics {
                println!("{line}");
            }

            let reason = reasons
                .find(test, result.result_line.as_deref())
                .map(str::to_string);
            let result = result.with_reason(reason);
            let name = self.rules.split(test);
            self.collab.reporter.update(TestRecord {
                case_name: name.case_name,
                class_name: name.class_name,
                status: result.status,
                reason: result.reason,
                stderr: result.stderr,
                diagnostics: result.diagnostics,
                duration_secs: result.duration_secs,
            });
            self.save_report()?;
        }
        Ok(())
    }

    fn restore_branches(&self, ctx: &RunContext) -> Vec<String> {
        if !self.options.restore_branches {
            if !ctx.sessions.is_empty() {
                info!(sessions = ctx.sessions.len(), "leaving patch branches in place");
            }
            return Vec::new();
        }
        let mutator = BranchMutator::new(self.collab.tracker, &self.config.trunk_branch);
        ctx.sessions
            .iter()
            .filter(|session| mutator.restore(session))
            .map(|session| session.repository.clone())
            .collect()
    }

    fn save_report(&self) -> Result<()> {
        self.collab
            .reporter
            .save(&self.options.xunit_report, &self.options.text_report)
            .context("save report")
    }

    fn hook(&self, stage: HookStage, cmd: &str) {
        let timeout = Duration::from_secs(self.config.hook_timeout_secs);
        let limit = self.config.output_limit_bytes;
        if let Err(err) = run_hook(stage, cmd, &self.options.root, timeout, limit) {
            warn!(?stage, "hook could not run: {err:#}");
        }
    }

    fn repo_path(&self, repo: &RepoConfig) -> PathBuf {
        resolve(&self.options.root, &repo.path)
    }
}

fn resolve(root: &Path, path: &Path) -> PathBuf {
    if path == Path::new(".") {
        root.to_path_buf()
    } else {
        root.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::TestStatus;
    use crate::io::report::XunitReport;
    use crate::test_support::{
        FakeTracker, RecordingProvisioner, RecordingStateChecker, ScriptedHarness, StaticFetcher,
    };

    struct Fixture {
        _temp: tempfile::TempDir,
        config: CiConfig,
        options: RunOptions,
        harness: ScriptedHarness,
        tracker: FakeTracker,
        fetcher: StaticFetcher,
        state: RecordingStateChecker,
        provisioner: RecordingProvisioner,
        report: XunitReport,
    }

    impl Fixture {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let mut options = RunOptions::rooted(std::env::current_dir().expect("cwd"));
            options.xunit_report = temp.path().join("xunit_result.xml");
            options.text_report = temp.path().join("report.txt");
            let mut config = CiConfig::default();
            config.manifest = temp.path().join("run.test");
            Self {
                _temp: temp,
                config,
                options,
                harness: ScriptedHarness::new(),
                tracker: FakeTracker::new(),
                fetcher: StaticFetcher::new(),
                state: RecordingStateChecker::new(),
                provisioner: RecordingProvisioner::new(),
                report: XunitReport::new("virt-ci", false),
            }
        }

        fn run(&mut self) -> Result<RunOutcome> {
            let collab = Collaborators {
                harness: &self.harness,
                tracker: &self.tracker,
                fetch: &self.fetcher,
                state: &mut self.state,
                provisioner: &mut self.provisioner,
                reporter: &mut self.report,
            };
            Controller::new(&self.config, &self.options, collab).run()
        }
    }

    #[test]
    fn list_mode_prints_and_touches_nothing() {
        let mut fx = Fixture::new();
        fx.options.list_only = true;
        fx.harness.push_list(ScriptedHarness::listing(&["t.p.virsh.domname.normal"]));

        let outcome = fx.run().expect("run");
        assert_eq!(outcome.status, RunStatus::Listed);
        assert_eq!(outcome.selected, vec!["t.p.virsh.domname.normal".to_string()]);
        assert!(fx.provisioner.calls().is_empty());
        assert!(fx.harness.runs().is_empty());
        assert!(!fx.options.xunit_report.exists());
    }

    #[test]
    fn drift_and_reason_reach_the_report() {
        let mut fx = Fixture::new();
        let id = "type_specific.io-github-autotest-libvirt.virsh.change_media.floppy_test.positive_test.insert.options.live_floppy_rw.running_guest";
        fx.harness.push_list(ScriptedHarness::listing(&[id]));
        fx.harness.push_run(ScriptedHarness::output(
            "(1/1) x: FAIL (2.00 s)\n",
            "12:00:00 ERROR| FAIL mount: /dev/sdb is not a valid block device\n",
            Duration::from_secs(2),
        ));
        fx.state.push_check(vec!["vm leaked: vm2".to_string()]);

        let outcome = fx.run().expect("run");
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(fx.state.calls(), vec!["backup".to_string(), "check(recover=true)".to_string()]);

        let record = &fx.report.records()[0];
        assert_eq!(record.status, TestStatus::Fail);
        assert_eq!(record.class_name, "virsh.change_media");
        assert_eq!(record.reason.as_deref(), Some("BUG 886456"));
        assert_eq!(record.diagnostics[0], "   DIFF|vm leaked: vm2");
        assert_eq!(
            record.diagnostics[1],
            "  ERROR| FAIL mount: /dev/sdb is not a valid block device"
        );
    }

    #[test]
    fn no_check_skips_state_checks() {
        let mut fx = Fixture::new();
        fx.options.check_state = false;
        fx.harness.push_list(ScriptedHarness::listing(&["t.p.a.b"]));
        fx.harness.push_run(ScriptedHarness::status_output("PASS", Duration::from_secs(1)));

        fx.run().expect("run");
        assert_eq!(fx.state.calls(), vec!["backup".to_string()]);
    }

    #[test]
    fn env_prep_failure_fails_run_but_flushes_report() {
        let mut fx = Fixture::new();
        fx.harness.push_list(ScriptedHarness::listing(&["t.p.a.b"]));
        fx.provisioner.fail_with("libvirtd would not restart");

        let err = fx.run().unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(CiError::EnvPrep(_))));
        assert!(fx.harness.runs().is_empty());
        assert!(fx.options.xunit_report.exists());
    }

    #[test]
    fn bad_reason_document_is_a_settings_error() {
        let mut fx = Fixture::new();
        fx.options.reason_url = Some("http://reasons.json".to_string());
        fx.fetcher = StaticFetcher::new().with("http://reasons.json", "{not json");

        let err = fx.run().unwrap_err();
        assert!(matches!(crate::error::classify(&err), Some(CiError::Settings(_))));
        assert!(fx.harness.lists().is_empty());
    }

    #[test]
    fn reason_document_extends_registry() {
        let mut fx = Fixture::new();
        fx.options.reason_url = Some("http://reasons.json".to_string());
        fx.fetcher = StaticFetcher::new().with(
            "http://reasons.json",
            r#"{"BUG 2": {"case": "domname", "result": "no domain"}}"#,
        );
        fx.harness.push_list(ScriptedHarness::listing(&["t.p.virsh.domname.x"]));
        fx.harness.push_run(ScriptedHarness::output(
            "(1/1) x: ERROR (1.00 s)\n",
            "12:00:00 ERROR| ERROR no domain found\n",
            Duration::from_secs(1),
        ));

        fx.run().expect("run");
        assert_eq!(fx.report.records()[0].reason.as_deref(), Some("BUG 2"));
    }
}
