//! The canonical scenario flow.
//!
//! ```text
//! setup ──> load identifiers ──> render options ──> schedule teardown
//!                                                        │
//!                           apply ──> validate ──> teardown (always)
//! ```
//!
//! `setup` is the only stage that invents anything. Every later stage reads
//! the identifiers back from the [`StateStore`], so a run with `setup`
//! skipped addresses exactly the infrastructure an earlier run created.

use crate::config::{HarnessConfig, RunConfiguration};
use crate::error::{HarnessError, Result};
use crate::identity::{CloudAccountResolver, IdGenerator, RegionPolicy};
use crate::manifest::{ScenarioSpec, TemplateContext, render_env, render_vars};
use crate::probe::{BudgetKind, HttpProbe, ProbeExpectation, validate_endpoint};
use crate::provisioner::{ProvisionOptions, Provisioner, assert_no_pending_changes};
use crate::retry::RetryBudget;
use crate::stage::{ScenarioReport, StageName, StageRunner};
use crate::state_store::StateStore;
use crate::workspace::{copy_module_to_temp, remove_module_copy};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const UNIQUE_ID_KEY: &str = "uniqueID";
pub const REGION_KEY: &str = "awsRegion";
pub const ACCOUNT_ID_KEY: &str = "accountID";
pub const MODULE_DIR_KEY: &str = "moduleDir";

/// Label used in reports for failures between stages
pub const LOAD_STATE_LABEL: &str = "load_state";

/// `"<id>.<zone>"`, or `"<base>-<id>.<zone>"` when `base` is set; always
/// lower-case so the result is also a valid bucket name.
pub fn format_domain_name(base: &str, unique_id: &str, zone: &str) -> String {
    let name = if base.is_empty() {
        format!("{}.{}", unique_id, zone)
    } else {
        format!("{}-{}.{}", base, unique_id, zone)
    };
    name.to_lowercase()
}

/// Identifiers `setup` invents and every later stage reuses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioIdentifiers {
    pub unique_id: String,
    pub region: String,
    pub account_id: String,
    /// Private copy of the module directory
    pub module_dir: PathBuf,
}

impl ScenarioIdentifiers {
    pub fn save(&self, store: &StateStore) -> Result<()> {
        store.save(UNIQUE_ID_KEY, &self.unique_id)?;
        store.save(REGION_KEY, &self.region)?;
        store.save(ACCOUNT_ID_KEY, &self.account_id)?;
        store.save_json(MODULE_DIR_KEY, &self.module_dir)?;
        Ok(())
    }

    /// # Errors
    ///
    /// `NotFound` for the first identifier that was never persisted.
    pub fn load(store: &StateStore) -> Result<Self> {
        Ok(Self {
            unique_id: store.load(UNIQUE_ID_KEY)?,
            region: store.load(REGION_KEY)?,
            account_id: store.load(ACCOUNT_ID_KEY)?,
            module_dir: store.load_json(MODULE_DIR_KEY)?,
        })
    }

    fn template_context<'a>(&'a self, zone: &'a str) -> TemplateContext<'a> {
        TemplateContext {
            unique_id: &self.unique_id,
            region: &self.region,
            account_id: &self.account_id,
            zone,
        }
    }
}

/// Invent fresh identifiers for a scenario and copy its module.
pub fn generate_identifiers<I, A>(
    ids: &I,
    accounts: &A,
    region: &RegionPolicy,
    lowercase_id: bool,
    repo_root: &Path,
    module_dir: &Path,
) -> Result<ScenarioIdentifiers>
where
    I: IdGenerator + ?Sized,
    A: CloudAccountResolver + ?Sized,
{
    let mut unique_id = ids.unique_id();
    if lowercase_id {
        unique_id = unique_id.to_ascii_lowercase();
    }
    Ok(ScenarioIdentifiers {
        unique_id,
        region: region.pick()?,
        account_id: accounts.account_id()?,
        module_dir: copy_module_to_temp(repo_root, module_dir)?,
    })
}

/// Remove a working directory together with the module copy recorded in it.
///
/// A working directory without a recorded copy is simply removed.
pub fn cleanup_state(store: &StateStore) -> Result<()> {
    match store.load_json::<PathBuf>(MODULE_DIR_KEY) {
        Ok(module_dir) => {
            remove_module_copy(&module_dir)?;
        }
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e),
    }
    store.cleanup()
}

/// Render a vars/env template against persisted identifiers.
pub fn build_options(
    ids: &ScenarioIdentifiers,
    zone: &str,
    vars: &BTreeMap<String, Value>,
    env: &BTreeMap<String, String>,
) -> Result<ProvisionOptions> {
    let ctx = ids.template_context(zone);
    Ok(ProvisionOptions {
        module_dir: ids.module_dir.clone(),
        vars: render_vars(vars, &ctx)?,
        env: render_env(env, &ctx)?,
        upgrade: false,
    })
}

/// Runs [`ScenarioSpec`]s against one set of collaborators.
#[derive(Debug)]
pub struct ScenarioHarness<P, H, I, A> {
    provisioner: P,
    probe: H,
    ids: I,
    accounts: A,
    config: HarnessConfig,
    run_config: RunConfiguration,
    repo_root: PathBuf,
    domain_zone: String,
}

impl<P, H, I, A> ScenarioHarness<P, H, I, A>
where
    P: Provisioner,
    H: HttpProbe,
    I: IdGenerator,
    A: CloudAccountResolver,
{
    pub fn new(provisioner: P, probe: H, ids: I, accounts: A) -> Self {
        Self {
            provisioner,
            probe,
            ids,
            accounts,
            config: HarnessConfig::default(),
            run_config: RunConfiguration::default(),
            repo_root: PathBuf::from("."),
            domain_zone: String::new(),
        }
    }

    /// Builder: shared harness settings
    pub fn with_config(mut self, config: HarnessConfig) -> Self {
        self.config = config;
        self
    }

    /// Builder: skip directives
    pub fn with_run_config(mut self, run_config: RunConfiguration) -> Self {
        self.run_config = run_config;
        self
    }

    /// Builder: where module directories live and which DNS zone names use
    pub fn with_repo(mut self, repo_root: impl Into<PathBuf>, domain_zone: impl Into<String>) -> Self {
        self.repo_root = repo_root.into();
        self.domain_zone = domain_zone.into();
        self
    }

    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    pub fn provisioner(&self) -> &P {
        &self.provisioner
    }

    /// State store for a scenario
    pub fn store_for(&self, scenario: &str) -> StateStore {
        StateStore::new(self.config.working_dir(scenario))
    }

    /// Run one scenario through `setup → apply → validate → teardown`.
    ///
    /// Never fails: every outcome, including failures between stages, is in
    /// the returned report.
    pub fn run(&self, spec: &ScenarioSpec) -> ScenarioReport {
        let store = self.store_for(&spec.name);
        let mut runner = StageRunner::new(&spec.name, self.run_config.clone());

        let result = self.drive(spec, &store, &mut runner);
        let mut report = runner.report();

        match result {
            Ok(()) => info!(scenario = %spec.name, "Scenario finished"),
            // Stage errors are already in the records
            Err(HarnessError::StageFailure { .. } | HarnessError::Panicked { .. }) => {}
            Err(err) => {
                warn!(scenario = %spec.name, "Scenario aborted between stages: {}", err);
                if report.failure.is_none() {
                    report.failure = Some((LOAD_STATE_LABEL.to_string(), err.to_string()));
                }
            }
        }
        report
    }

    fn drive(&self, spec: &ScenarioSpec, store: &StateStore, runner: &mut StageRunner) -> Result<()> {
        runner.run_stage(StageName::Setup, || self.setup(spec, store))?;

        let ids = ScenarioIdentifiers::load(store)?;
        info!(scenario = %spec.name, unique_id = %ids.unique_id, region = %ids.region, "Loaded identifiers");
        let options = build_options(&ids, &self.domain_zone, &spec.vars, &spec.env)?;
        store.save_options(&options)?;

        let provisioner = &self.provisioner;
        let teardown_options = options.clone();
        let mut runner = runner.defer_teardown(StageName::Teardown, move || {
            provisioner.destroy(&teardown_options)
        });

        runner.run_stage(StageName::Apply, || self.apply(&options))?;
        runner.run_stage(StageName::Validate, || self.validate(spec, &options))?;
        runner.finish()
    }

    fn setup(&self, spec: &ScenarioSpec, store: &StateStore) -> Result<()> {
        let ids = generate_identifiers(
            &self.ids,
            &self.accounts,
            &spec.region,
            spec.lowercase_id,
            &self.repo_root,
            &spec.module_dir,
        )?;
        ids.save(store)
    }

    fn apply(&self, options: &ProvisionOptions) -> Result<()> {
        self.provisioner.init_and_apply(options)?;
        // A perpetual diff means the module never converges
        assert_no_pending_changes(&self.provisioner, options)
    }

    fn validate(&self, spec: &ScenarioSpec, options: &ProvisionOptions) -> Result<()> {
        for expectation in &spec.expectations {
            validate_endpoint(
                &self.provisioner,
                options,
                &self.probe,
                expectation,
                self.budget_for(expectation),
            )?;
        }
        Ok(())
    }

    fn budget_for(&self, expectation: &ProbeExpectation) -> RetryBudget {
        match expectation.budget {
            BudgetKind::Initial => self.config.initial_budget,
            BudgetKind::Steady => self.config.steady_budget,
        }
    }
}
