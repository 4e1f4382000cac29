//! Controller lifecycle tests: scripted harness and tracker, real git
//! repositories for the patch branches.

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use virt_ci::controller::{Collaborators, Controller, RunOutcome, RunStatus};
use virt_ci::core::types::TestStatus;
use virt_ci::io::config::CiConfig;
use virt_ci::io::report::XunitReport;
use virt_ci::io::state::StateChecker;
use virt_ci::options::RunOptions;
use virt_ci::test_support::{
    FakeTracker, RecordingProvisioner, RecordingStateChecker, ScriptedHarness, StaticFetcher,
    TestRepo,
};

const PREFIX: &str = "type_specific.io-github-autotest-libvirt";

struct Run {
    temp: tempfile::TempDir,
    config: CiConfig,
    options: RunOptions,
    harness: ScriptedHarness,
    tracker: FakeTracker,
    fetcher: StaticFetcher,
    state: RecordingStateChecker,
    provisioner: RecordingProvisioner,
    report: XunitReport,
}

impl Run {
    fn new() -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        let mut options = RunOptions::rooted(std::env::current_dir().expect("cwd"));
        options.xunit_report = temp.path().join("xunit_result.xml");
        options.text_report = temp.path().join("report.txt");
        let mut config = CiConfig::default();
        config.manifest = temp.path().join("run.test");
        Self {
            temp,
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

    /// Point both repositories at scratch checkouts.
    fn with_repos(&mut self, base: &TestRepo, provider: &TestRepo) {
        self.config.repos.base.path = base.path().to_path_buf();
        self.config.repos.provider.path = provider.path().to_path_buf();
    }

    fn marker(&self, name: &str) -> PathBuf {
        self.temp.path().join(name)
    }

    fn run(&mut self) -> anyhow::Result<RunOutcome> {
        Controller::new(
            &self.config,
            &self.options,
            Collaborators {
                harness: &self.harness,
                tracker: &self.tracker,
                fetch: &self.fetcher,
                state: &mut self.state,
                provisioner: &mut self.provisioner,
                reporter: &mut self.report,
            },
        )
        .run()
    }
}

fn ids(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| format!("{PREFIX}.{name}")).collect()
}

fn listing(ids: &[String]) -> virt_ci::io::harness::HarnessOutput {
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    ScriptedHarness::listing(&refs)
}

#[test]
fn empty_selection_reports_single_no_test_entry() {
    let mut run = Run::new();
    run.harness.push_list(listing(&[]));

    let outcome = run.run().expect("run");
    assert_eq!(outcome.status, RunStatus::NoTests);
    assert_eq!(outcome.reported, 1);
    assert_eq!(run.report.records()[0].case_name, "no_test");
    assert_eq!(run.report.records()[0].status, TestStatus::Skip);
    assert!(run.provisioner.calls().is_empty());
    assert!(run.harness.runs().is_empty());

    let xml = fs::read_to_string(&run.options.xunit_report).expect("xunit");
    assert!(xml.contains("no_test"));
}

#[test]
fn every_selected_test_is_reported_in_order() {
    let mut run = Run::new();
    let tests = ids(&["virsh.domname.normal", "virsh.domid.normal", "svirt.start"]);
    run.harness.push_list(listing(&tests));
    for token in ["PASS", "FAIL", "SKIP"] {
        run.harness.push_run(ScriptedHarness::status_output(token, Duration::from_secs(1)));
    }
    run.options.pre_cmd = Some(format!("touch {}", run.marker("pre").display()));
    run.options.post_cmd = Some(format!("touch {}", run.marker("post").display()));

    let outcome = run.run().expect("run");
    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.reported, 3);
    assert_eq!(run.provisioner.calls().len(), 1);

    let runs = run.harness.runs();
    let run_ids: Vec<String> = runs.iter().map(|call| call.test_id.clone()).collect();
    assert_eq!(run_ids, tests);

    let statuses: Vec<TestStatus> = run.report.records().iter().map(|r| r.status).collect();
    assert_eq!(statuses, vec![TestStatus::Pass, TestStatus::Fail, TestStatus::Skip]);
    assert_eq!(run.report.records()[2].class_name, "svirt");

    assert!(run.marker("pre").exists());
    assert!(run.marker("post").exists());
    let manifest = fs::read_to_string(&run.config.manifest).expect("manifest");
    assert_eq!(manifest.lines().count(), 3);
}

/// Counts the `<testcase` entries in the saved xunit file at every check,
/// i.e. after each test has run but before its own record is added.
struct ReportCountingChecker {
    xml: PathBuf,
    counts: Vec<usize>,
}

impl StateChecker for ReportCountingChecker {
    fn backup(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn check(&mut self, _recover: bool) -> anyhow::Result<Vec<String>> {
        let count = match fs::read_to_string(&self.xml) {
            Ok(xml) => xml.matches("<testcase").count(),
            Err(_) => 0,
        };
        self.counts.push(count);
        Ok(Vec::new())
    }
}

#[test]
fn report_on_disk_grows_by_one_entry_per_test() {
    let mut run = Run::new();
    let tests = ids(&["a.one", "a.two", "a.three", "a.four"]);
    run.harness.push_list(listing(&tests));
    for _ in &tests {
        run.harness.push_run(ScriptedHarness::status_output("PASS", Duration::from_secs(1)));
    }
    let mut checker = ReportCountingChecker {
        xml: run.options.xunit_report.clone(),
        counts: Vec::new(),
    };

    let outcome = Controller::new(
        &run.config,
        &run.options,
        Collaborators {
            harness: &run.harness,
            tracker: &run.tracker,
            fetch: &run.fetcher,
            state: &mut checker,
            provisioner: &mut run.provisioner,
            reporter: &mut run.report,
        },
    )
    .run()
    .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(checker.counts, vec![0, 1, 2, 3]);
    let xml = fs::read_to_string(&run.options.xunit_report).expect("xunit");
    assert_eq!(xml.matches("<testcase").count(), 4);
}

#[test]
fn fault_mid_loop_keeps_completed_entries_and_restores_branches() {
    let base = TestRepo::new().expect("base repo");
    let provider = TestRepo::new().expect("provider repo");
    let base_patch = base.patch_adding("shared.cfg", "x\n", "Tune base").expect("patch");
    let provider_patch = provider
        .patch_adding("virsh_domname.cfg", "y\n", "Tune domname")
        .expect("patch");

    let mut run = Run::new();
    run.with_repos(&base, &provider);
    run.tracker = FakeTracker::new()
        .with_issue("virt-test", 175, true, "")
        .with_patch("virt-test", 175, &base_patch)
        .with_issue("tp-libvirt", 5, true, "")
        .with_patch("tp-libvirt", 5, &provider_patch);
    run.options.base_pulls = vec![175];
    run.options.provider_pulls = vec![5];
    run.options.post_cmd = Some(format!("touch {}", run.marker("post").display()));

    let tests = ids(&["a.one", "a.two", "a.three", "a.four", "a.five"]);
    run.harness.push_list(listing(&tests));
    run.harness.push_run(ScriptedHarness::status_output("PASS", Duration::from_secs(1)));
    run.harness.push_run(ScriptedHarness::status_output("PASS", Duration::from_secs(1)));
    run.harness.push_run_error("harness crashed");

    let outcome = run.run().expect("run");
    assert_eq!(outcome.status, RunStatus::Aborted { executed: 2 });
    assert_eq!(outcome.reported, 2);
    assert_eq!(run.harness.runs().len(), 3);
    assert_eq!(
        outcome.restored,
        vec!["virt-test".to_string(), "tp-libvirt".to_string()]
    );

    assert_eq!(base.current_branch().expect("branch"), "master");
    assert_eq!(provider.current_branch().expect("branch"), "master");
    assert!(!base.path().join("shared.cfg").exists());
    assert!(base.git(&["branch", "--list", "175"]).expect("branches").is_empty());

    let xml = fs::read_to_string(&run.options.xunit_report).expect("xunit");
    assert_eq!(xml.matches("<testcase").count(), 2);
    assert!(!run.marker("post").exists());
}

#[test]
fn dependencies_of_provider_pulls_are_merged_one_hop() {
    let base = TestRepo::new().expect("base repo");
    let provider = TestRepo::new().expect("provider repo");
    let dependency = base.patch_adding("dep.txt", "dep\n", "Dependency").expect("patch");
    let change = provider.patch_adding("change.txt", "c\n", "Change").expect("patch");

    let mut run = Run::new();
    run.with_repos(&base, &provider);
    run.tracker = FakeTracker::new()
        .with_issue("tp-libvirt", 5, true, "Depends on autotest/virt-test#7")
        .with_patch("tp-libvirt", 5, &change)
        .with_issue("virt-test", 7, true, "Needs autotest/virt-test#9")
        .with_patch("virt-test", 7, &dependency)
        .with_issue("virt-test", 9, true, "");
    run.options.provider_pulls = vec![5];
    run.options.with_dependence = true;
    run.options.restore_branches = false;
    run.options.list_only = true;
    run.harness.push_list(listing(&ids(&["virsh.domname.normal"])));

    let outcome = run.run().expect("run");
    assert_eq!(outcome.status, RunStatus::Listed);
    assert!(outcome.restored.is_empty());

    assert_eq!(base.current_branch().expect("branch"), "7");
    assert!(base.path().join("dep.txt").exists());
    assert_eq!(provider.current_branch().expect("branch"), "5");
    assert!(provider.path().join("change.txt").exists());
    assert!(!run.options.xunit_report.exists());
}

#[test]
fn failed_patch_stops_before_selection_and_cleans_up() {
    let base = TestRepo::new().expect("base repo");
    let provider = TestRepo::new().expect("provider repo");

    let mut run = Run::new();
    run.with_repos(&base, &provider);
    run.tracker = FakeTracker::new()
        .with_issue("tp-libvirt", 5, true, "")
        .with_patch("tp-libvirt", 5, "not a patch\n");
    run.options.provider_pulls = vec![5];

    let err = run.run().unwrap_err();
    assert!(matches!(
        virt_ci::error::classify(&err),
        Some(virt_ci::error::CiError::RepoPrep { repo, .. }) if repo == "tp-libvirt"
    ));
    assert!(run.harness.lists().is_empty());
    assert_eq!(provider.current_branch().expect("branch"), "master");
}
