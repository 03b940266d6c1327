//! stagecheck - main entry point
//!
//! Thin host around the library: parses the command line, loads settings and
//! the manifest, and prints one report per scenario.

mod cli;

use anyhow::{Context, Result, bail};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::cli::{Cli, Commands, StateCommands};
use stagecheck::config::{HarnessConfig, RunConfiguration};
use stagecheck::identity::{AwsCliAccountResolver, RandomIdGenerator};
use stagecheck::manifest::ScenarioManifest;
use stagecheck::probe::ReqwestProbe;
use stagecheck::process_guard::{self, ProcessGuard};
use stagecheck::scenario::{ScenarioHarness, cleanup_state};
use stagecheck::stage::ScenarioReport;
use stagecheck::state_store::StateStore;
use stagecheck::terraform::TerraformCli;
use stagecheck::upgrade::{GitSourcePinner, GitTagResolver, UpgradeComparator, UpgradeExample};

fn main() {
    let cli = Cli::parse_args();
    stagecheck::logging::init_logging(cli.verbose);
    info!("stagecheck starting up");

    // Interrupted runs must not leave terraform running unattended
    if let Err(e) = process_guard::init_signal_handlers() {
        warn!("Failed to initialize signal handlers: {}", e);
    }
    debug!("Signal handlers initialized");

    match run(cli) {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            error!("{:#}", e);
            eprintln!("✗ {:#}", e);
            std::process::exit(1);
        }
    }
}

/// Returns whether everything passed
fn run(cli: Cli) -> Result<bool> {
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Validate { manifest } => {
            let loaded = ScenarioManifest::load_from_file(&manifest)
                .with_context(|| format!("Invalid manifest {:?}", manifest))?;
            println!(
                "✓ Manifest is valid: {} scenario(s), {} upgrade example(s)",
                loaded.scenarios.len(),
                loaded.upgrade.as_ref().map_or(0, |u| u.examples.len())
            );
            Ok(true)
        }
        Commands::Run {
            manifest,
            scenarios,
            skip,
        } => run_scenarios(&config, &manifest, &scenarios, &skip),
        Commands::Upgrade { manifest, skip } => run_upgrade(&config, &manifest, &skip),
        Commands::State { action } => {
            run_state_command(action)?;
            Ok(true)
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<HarnessConfig> {
    match path {
        Some(path) => {
            info!("Loading harness settings from {:?}", path);
            HarnessConfig::load_from_file(path)
                .with_context(|| format!("Failed to load harness settings {:?}", path))
        }
        None => Ok(HarnessConfig::default()),
    }
}

/// Environment directives first, command-line flags on top
fn run_configuration(skip: &[String]) -> RunConfiguration {
    let flags = skip
        .iter()
        .fold(RunConfiguration::new(), |config, stage| config.skip(stage));
    let config = RunConfiguration::from_env().merge(&flags);
    let skipped: Vec<&str> = config.skipped_stages().collect();
    if !skipped.is_empty() {
        info!("Skipping stages: {:?}", skipped);
    }
    config
}

fn run_scenarios(
    config: &HarnessConfig,
    manifest_path: &Path,
    names: &[String],
    skip: &[String],
) -> Result<bool> {
    let manifest = ScenarioManifest::load_from_file(manifest_path)
        .with_context(|| format!("Invalid manifest {:?}", manifest_path))?;
    let selected = manifest.select(names)?;
    if selected.is_empty() {
        bail!("Manifest {:?} has no scenarios to run", manifest_path);
    }

    let probe = ReqwestProbe::new(config.http_timeout()).context("Failed to build HTTP probe")?;
    let harness = ScenarioHarness::new(
        TerraformCli::new(config.terraform_bin.clone()),
        probe,
        RandomIdGenerator::default(),
        AwsCliAccountResolver::default(),
    )
    .with_config(config.clone())
    .with_run_config(run_configuration(skip))
    .with_repo(manifest.repo_root.clone(), manifest.domain_zone.clone());

    let _guard = ProcessGuard::new();
    info!("Running {} scenario(s)", selected.len());

    // Scenarios share nothing but the harness's read-only collaborators
    let reports: Vec<ScenarioReport> = std::thread::scope(|scope| {
        let handles: Vec<_> = selected
            .iter()
            .map(|spec| {
                let harness = &harness;
                scope.spawn(move || harness.run(spec))
            })
            .collect();
        handles
            .into_iter()
            .zip(&selected)
            .map(|(handle, spec)| {
                handle.join().unwrap_or_else(|_| ScenarioReport {
                    scenario: spec.name.clone(),
                    records: Vec::new(),
                    failure: Some(("harness".to_string(), "scenario thread panicked".to_string())),
                    teardown_failure: None,
                })
            })
            .collect()
    });

    Ok(reports
        .iter()
        .fold(true, |all, report| print_report(&report.to_string(), report) && all))
}

fn run_upgrade(config: &HarnessConfig, manifest_path: &Path, skip: &[String]) -> Result<bool> {
    let manifest = ScenarioManifest::load_from_file(manifest_path)
        .with_context(|| format!("Invalid manifest {:?}", manifest_path))?;
    let Some(upgrade) = manifest.upgrade.as_ref() else {
        bail!("Manifest {:?} has no upgrade section", manifest_path);
    };

    let accounts = Arc::new(AwsCliAccountResolver::default());
    let examples: Vec<UpgradeExample> = upgrade
        .examples
        .iter()
        .map(|spec| UpgradeExample::from_spec(spec, &manifest.domain_zone, Arc::clone(&accounts)))
        .collect();

    let comparator = UpgradeComparator::new(
        TerraformCli::new(config.terraform_bin.clone()),
        GitTagResolver::new(manifest.repo_root.clone()),
        GitSourcePinner::new(upgrade.repo_url.clone()),
        RandomIdGenerator::lowercase(),
    )
    .with_config(config.clone())
    .with_run_config(run_configuration(skip))
    .with_repo_root(manifest.repo_root.clone());

    let _guard = ProcessGuard::new();
    let reports = comparator.run(&upgrade.modules, &examples);

    Ok(reports
        .iter()
        .fold(true, |all, report| print_report(&report.to_string(), &report.stages) && all))
}

/// Print a rendered report and its failures; returns whether it passed
fn print_report(rendered: &str, stages: &ScenarioReport) -> bool {
    print!("{}", rendered);
    if let Some((stage, err)) = &stages.failure {
        println!("  ✗ stage '{}' failed: {}", stage, err);
    }
    if let Some(err) = &stages.teardown_failure {
        println!("  ✗ teardown failed, resources may remain: {}", err);
    }
    stages.passed()
}

fn run_state_command(action: StateCommands) -> Result<()> {
    match action {
        StateCommands::Get { dir, key } => {
            let value: serde_json::Value = StateStore::new(&dir)
                .load_json(&key)
                .with_context(|| format!("Failed to read {} from {:?}", key, dir))?;
            match value {
                serde_json::Value::String(s) => println!("{}", s),
                other => println!("{}", serde_json::to_string_pretty(&other)?),
            }
        }
        StateCommands::List { dir } => {
            for key in StateStore::new(&dir).keys()? {
                println!("{}", key);
            }
        }
        StateCommands::Clean { dir } => {
            cleanup_state(&StateStore::new(&dir))
                .with_context(|| format!("Failed to remove {:?}", dir))?;
            println!("✓ Removed {:?}", dir);
        }
    }
    Ok(())
}
