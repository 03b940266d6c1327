//! Upgrade comparisons against recording fakes
//!
//! These tests verify that:
//! 1. The prior release is applied first, then the working copy
//! 2. A pending plan after upgrading is reported as drift
//! 3. Pinned sources are restored and teardown runs on every exit path
//! 4. Every listed module is pinned in every example

mod common;

use common::*;
use serde_json::json;
use stagecheck::error::{HarnessError, Result};
use stagecheck::identity::RegionPolicy;
use stagecheck::manifest::UpgradeExampleSpec;
use stagecheck::provisioner::ProvisionOptions;
use stagecheck::scenario::{LOAD_STATE_LABEL, MODULE_DIR_KEY, REGION_KEY, UNIQUE_ID_KEY};
use stagecheck::stage::StageOutcome;
use stagecheck::state_store::StateStore;
use stagecheck::upgrade::{
    GitSourcePinner, LiveVersion, ReleaseResolver, SourcePinner, UpgradeComparator, UpgradeExample,
};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Every module was last released as the same tag.
struct FixedRelease(Option<&'static str>);

impl ReleaseResolver for FixedRelease {
    fn prior_release(&self, module: &str) -> Result<String> {
        self.0
            .map(str::to_string)
            .ok_or_else(|| HarnessError::provisioner(format!("No release tag to upgrade {} from", module)))
    }
}

/// Logs pin/restore calls instead of touching files.
#[derive(Default)]
struct LoggingPinner {
    events: Mutex<Vec<String>>,
}

impl LoggingPinner {
    fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }
}

impl SourcePinner for LoggingPinner {
    fn pin(&self, _example_dir: &Path, module: &str, release: &str) -> Result<usize> {
        self.events.lock().unwrap().push(format!("pin {}@{}", module, release));
        Ok(1)
    }

    fn restore(&self, _example_dir: &Path) -> Result<()> {
        self.events.lock().unwrap().push("restore".to_string());
        Ok(())
    }
}

const REPO_URL: &str = "https://example.com/modules.git";

fn modules(names: &[&str]) -> Vec<String> {
    names.iter().map(|m| m.to_string()).collect()
}

fn example(name: &str) -> UpgradeExample {
    UpgradeExample {
        name: name.to_string(),
        module_dir: Path::new("examples").join(name),
        setup: Arc::new(|_working_dir: &Path, unique_id: &str| -> Result<ProvisionOptions> {
            Ok(ProvisionOptions::default().with_var("name", format!("web-{}", unique_id)))
        }),
    }
}

fn website_example() -> UpgradeExample {
    example("website")
}

fn comparator<'a, S: SourcePinner>(
    sandbox: &Sandbox,
    provisioner: &'a RecordingProvisioner,
    pinner: S,
    ids: SequenceIds,
    skip: &[&str],
) -> UpgradeComparator<&'a RecordingProvisioner, FixedRelease, S, SequenceIds> {
    UpgradeComparator::new(provisioner, FixedRelease(Some("v1.0.0")), pinner, ids)
        .with_config(sandbox.config())
        .with_run_config(skipping(skip))
        .with_repo_root(sandbox.repo_root())
}

#[test]
fn test_clean_upgrade_passes() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new().with_output("url", json!("web.example.com"));
    let pinner = LoggingPinner::default();
    let comparator = comparator(&sandbox, &provisioner, &pinner, SequenceIds::new(&["ABC123"]), &[]);

    let report = comparator.run_example(&modules(&["website"]), &website_example());

    assert!(report.passed(), "report: {}", report);
    assert_eq!(
        stage_names(&report.stages.records),
        ["ensure_prior_applied", "apply_current", "assert_no_diff", "teardown"]
    );
    assert_eq!(report.prior_refs.get("website").map(String::as_str), Some("v1.0.0"));
    assert_eq!(report.live_version, Some(LiveVersion::Current));
    assert_eq!(report.outputs["url"], json!("web.example.com"));

    // Pinned for the first apply only, and always put back
    assert_eq!(pinner.events(), ["pin website@v1.0.0", "restore"]);

    let applied = provisioner.applied_options();
    assert_eq!(applied.len(), 2);
    assert_eq!(applied[0], applied[1]);
    assert!(applied[0].upgrade);
    assert_eq!(applied[0].vars["name"], json!("web-abc123"));
    assert!(is_copy_of(&applied[0].module_dir, "website"));
    assert_eq!(provisioner.destroy_count(), 1);
}

#[test]
fn test_pending_plan_after_upgrade_is_drift() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new().with_plan_code(2);
    let comparator = comparator(
        &sandbox,
        &provisioner,
        LoggingPinner::default(),
        SequenceIds::new(&["abc123"]),
        &[],
    );

    let report = comparator.run_example(&modules(&["website"]), &website_example());

    assert!(!report.passed());
    let (stage, message) = report.stages.failure.clone().unwrap();
    assert_eq!(stage, "assert_no_diff");
    assert!(message.contains("plan exited with code 2"), "message: {}", message);
    assert_eq!(report.live_version, Some(LiveVersion::Current));
    assert_eq!(report.stages.record("teardown").unwrap().outcome, StageOutcome::Succeeded);
    assert_eq!(provisioner.destroy_count(), 1);
}

#[test]
fn test_failed_prior_apply_restores_sources_and_tears_down() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new().failing_apply_at(1);
    let pinner = LoggingPinner::default();
    let comparator = comparator(&sandbox, &provisioner, &pinner, SequenceIds::new(&["abc123"]), &[]);

    let report = comparator.run_example(&modules(&["website"]), &website_example());

    assert_eq!(report.stages.failure.as_ref().unwrap().0, "ensure_prior_applied");
    assert_eq!(
        stage_names(&report.stages.records),
        ["ensure_prior_applied", "teardown"]
    );
    assert_eq!(report.live_version, None);
    assert_eq!(pinner.events(), ["pin website@v1.0.0", "restore"]);
    assert_eq!(provisioner.apply_count(), 1);
    assert_eq!(provisioner.destroy_count(), 1);
}

#[test]
fn test_missing_release_is_reported_before_provisioning() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new();
    let comparator = UpgradeComparator::new(
        &provisioner,
        FixedRelease(None),
        LoggingPinner::default(),
        SequenceIds::new(&["abc123"]),
    )
    .with_config(sandbox.config())
    .with_repo_root(sandbox.repo_root());

    let report = comparator.run_example(&modules(&["website"]), &website_example());

    let (stage, message) = report.stages.failure.clone().unwrap();
    assert_eq!(stage, LOAD_STATE_LABEL);
    assert!(message.contains("No release tag"), "message: {}", message);
    assert_eq!(provisioner.apply_count(), 0);
    assert_eq!(provisioner.destroy_count(), 0);
}

#[test]
fn test_replay_reuses_identifiers_and_module_copy() {
    let sandbox = Sandbox::new(&["website"]);
    let example = website_example();

    let first = RecordingProvisioner::new();
    let report = comparator(
        &sandbox,
        &first,
        LoggingPinner::default(),
        SequenceIds::new(&["abc123"]),
        &["teardown"],
    )
    .run_example(&modules(&["website"]), &example);
    assert!(report.passed(), "report: {}", report);
    assert_eq!(first.destroy_count(), 0);

    let second = RecordingProvisioner::new();
    let ids = SequenceIds::new(&["zzz999"]);
    let replay = comparator(
        &sandbox,
        &second,
        LoggingPinner::default(),
        ids,
        &["ensure_prior_applied", "apply_current"],
    );
    let report = replay.run_example(&modules(&["website"]), &example);

    assert!(report.passed(), "report: {}", report);
    assert_eq!(second.apply_count(), 0);
    assert_eq!(second.destroy_count(), 1);
    assert_eq!(second.destroyed.lock().unwrap()[0], first.applied_options()[0]);

    let store = StateStore::new(replay.working_dir(&example.name));
    assert_eq!(store.load(UNIQUE_ID_KEY).unwrap(), "abc123");
    let module_dir: PathBuf = store.load_json(MODULE_DIR_KEY).unwrap();
    assert_eq!(module_dir, first.applied_options()[0].module_dir);
}

#[test]
fn test_git_pinner_leaves_working_copy_unchanged() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new();
    let comparator = comparator(
        &sandbox,
        &provisioner,
        GitSourcePinner::new(REPO_URL),
        SequenceIds::new(&["abc123"]),
        &[],
    );

    let report = comparator.run_example(&modules(&["website"]), &website_example());
    assert!(report.passed(), "report: {}", report);

    let sources = provisioner.applied_sources();
    assert!(sources[0].contains("modules/website?ref=v1.0.0"), "main.tf: {}", sources[0]);
    assert!(!sources[1].contains("?ref="), "main.tf: {}", sources[1]);

    let copy = &provisioner.applied_options()[0].module_dir;
    let main_tf = fs::read_to_string(copy.join("main.tf")).unwrap();
    assert!(main_tf.contains(r#"source = "../../modules/website""#), "main.tf: {}", main_tf);
    assert!(!main_tf.contains("?ref="));
}

#[test]
fn test_panicking_prior_apply_restores_sources_for_replay() {
    let sandbox = Sandbox::new(&["website"]);
    let example = website_example();

    let first = RecordingProvisioner::new().panicking_apply_at(1);
    let report = comparator(
        &sandbox,
        &first,
        GitSourcePinner::new(REPO_URL),
        SequenceIds::new(&["abc123"]),
        &["teardown"],
    )
    .run_example(&modules(&["website"]), &example);

    let (stage, message) = report.stages.failure.clone().unwrap();
    assert_eq!(stage, "ensure_prior_applied");
    assert!(message.contains("terraform apply crashed"), "message: {}", message);
    assert!(first.applied_sources()[0].contains("?ref=v1.0.0"));
    assert_eq!(first.destroy_count(), 0);

    let copy = first.applied_options()[0].module_dir.clone();
    let main_tf = fs::read_to_string(copy.join("main.tf")).unwrap();
    assert!(!main_tf.contains("?ref="), "main.tf: {}", main_tf);

    // Fresh process: new pinner, prior release already live
    let second = RecordingProvisioner::new();
    let report = comparator(
        &sandbox,
        &second,
        GitSourcePinner::new(REPO_URL),
        SequenceIds::new(&["zzz999"]),
        &["ensure_prior_applied"],
    )
    .run_example(&modules(&["website"]), &example);

    assert!(report.passed(), "report: {}", report);
    assert_eq!(second.apply_count(), 1);
    assert_eq!(second.applied_options()[0].module_dir, copy);
    assert!(!second.applied_sources()[0].contains("?ref="));
    assert_eq!(second.destroy_count(), 1);
}

#[test]
fn test_replay_after_killed_run_applies_working_copy_sources() {
    let sandbox = Sandbox::new(&["website"]);
    let example = website_example();

    let first = RecordingProvisioner::new();
    let report = comparator(
        &sandbox,
        &first,
        LoggingPinner::default(),
        SequenceIds::new(&["abc123"]),
        &["apply_current", "assert_no_diff", "teardown"],
    )
    .run_example(&modules(&["website"]), &example);
    assert!(report.passed(), "report: {}", report);

    // A run killed mid-apply never gets to restore what it pinned
    let copy = first.applied_options()[0].module_dir.clone();
    let killed = GitSourcePinner::new(REPO_URL);
    assert_eq!(killed.pin(&copy, "website", "v1.0.0").unwrap(), 1);
    drop(killed);

    let second = RecordingProvisioner::new();
    let report = comparator(
        &sandbox,
        &second,
        GitSourcePinner::new(REPO_URL),
        SequenceIds::new(&["zzz999"]),
        &["ensure_prior_applied"],
    )
    .run_example(&modules(&["website"]), &example);

    assert!(report.passed(), "report: {}", report);
    let applied = &second.applied_sources()[0];
    assert!(!applied.contains("?ref="), "main.tf: {}", applied);
    assert!(applied.contains(r#"source = "../../modules/website""#), "main.tf: {}", applied);
    assert_eq!(report.live_version, Some(LiveVersion::Current));
}

#[test]
fn test_unreferenced_module_is_resolved_but_not_pinned() {
    let sandbox = Sandbox::new(&["website"]);
    let provisioner = RecordingProvisioner::new();
    let comparator = comparator(
        &sandbox,
        &provisioner,
        GitSourcePinner::new(REPO_URL),
        SequenceIds::new(&["abc123"]),
        &[],
    );

    let report = comparator.run_example(&modules(&["website", "cdn"]), &website_example());

    assert!(report.passed(), "report: {}", report);
    assert_eq!(
        report.prior_refs,
        BTreeMap::from([
            ("cdn".to_string(), "v1.0.0".to_string()),
            ("website".to_string(), "v1.0.0".to_string()),
        ])
    );
    let sources = provisioner.applied_sources();
    assert!(sources[0].contains(&format!("git::{}//modules/website?ref=v1.0.0", REPO_URL)));
    assert!(!sources[0].contains("modules/cdn"));
    assert!(!sources[1].contains("?ref="));
}

#[test]
fn test_every_module_is_pinned_in_every_example() {
    let sandbox = Sandbox::new(&["website", "blog"]);
    let provisioner = RecordingProvisioner::new();
    let pinner = LoggingPinner::default();
    let comparator = comparator(&sandbox, &provisioner, &pinner, SequenceIds::new(&["abc123", "def456"]), &[]);

    let reports = comparator.run(&modules(&["website", "cdn"]), &[example("website"), example("blog")]);

    assert_eq!(reports.len(), 2);
    assert!(reports.iter().all(|r| r.passed()));
    assert_eq!(reports[1].example, "blog");
    assert_eq!(
        pinner.events(),
        [
            "pin cdn@v1.0.0",
            "pin website@v1.0.0",
            "restore",
            "pin cdn@v1.0.0",
            "pin website@v1.0.0",
            "restore",
        ]
    );
    let applied = provisioner.applied_options();
    assert_eq!(applied.len(), 4);
    assert!(is_copy_of(&applied[0].module_dir, "website"));
    assert!(is_copy_of(&applied[2].module_dir, "blog"));
    assert_eq!(applied[2].vars["name"], json!("web-def456"));
}

#[test]
fn test_example_from_manifest_persists_region() {
    let sandbox = Sandbox::new(&["website"]);
    let mut vars = BTreeMap::new();
    vars.insert("name".to_string(), json!("web-${unique_id}"));
    vars.insert("aws_region".to_string(), json!("${region}"));
    let spec = UpgradeExampleSpec {
        name: "website".to_string(),
        module_dir: PathBuf::from("examples/website"),
        region: RegionPolicy::fixed("eu-west-1"),
        vars,
        env: BTreeMap::new(),
    };
    let example = UpgradeExample::from_spec(&spec, "example.com", Arc::new(FixedAccount));

    let provisioner = RecordingProvisioner::new();
    let comparator = comparator(
        &sandbox,
        &provisioner,
        LoggingPinner::default(),
        SequenceIds::new(&["abc123"]),
        &[],
    );
    let report = comparator.run_example(&modules(&["website"]), &example);

    assert!(report.passed(), "report: {}", report);
    let applied = &provisioner.applied_options()[0];
    assert_eq!(applied.vars["name"], json!("web-abc123"));
    assert_eq!(applied.vars["aws_region"], json!("eu-west-1"));

    let store = StateStore::new(comparator.working_dir("website"));
    let region: String = store.load_json(REGION_KEY).unwrap();
    assert_eq!(region, "eu-west-1");
}
