//! Backward-compatibility check for module upgrades.
//!
//! For each example: apply it with its module sources pinned to the latest
//! release, re-apply the working copy over the resulting state, and require
//! that a plan then reports nothing to change.
//!
//! ```text
//! ensure_prior_applied ──> apply_current ──> assert_no_diff ──> teardown (always)
//! ```

use crate::command_runner::{CommandArgs, run_command_safe};
use crate::config::{HarnessConfig, RunConfiguration};
use crate::error::{HarnessError, Result};
use crate::identity::{CloudAccountResolver, IdGenerator};
use crate::manifest::{TemplateContext, UpgradeExampleSpec, render_env, render_vars};
use crate::provisioner::{Outputs, ProvisionOptions, Provisioner, assert_no_pending_changes};
use crate::scenario::{LOAD_STATE_LABEL, MODULE_DIR_KEY, REGION_KEY, UNIQUE_ID_KEY};
use crate::stage::{ScenarioReport, Stage, StageName, StageRunner};
use crate::state_store::StateStore;
use crate::workspace::{copy_module_to_temp, refresh_module_sources};
use regex::Regex;
use std::collections::BTreeMap;
use std::cell::{Cell, RefCell};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use strum::{Display, EnumString};
use tracing::{debug, error, info, warn};

/// Finds the release an example's modules are upgraded from.
pub trait ReleaseResolver {
    fn prior_release(&self, module: &str) -> Result<String>;
}

impl<R: ReleaseResolver + ?Sized> ReleaseResolver for &R {
    fn prior_release(&self, module: &str) -> Result<String> {
        (**self).prior_release(module)
    }
}

/// `git tag --sort=-v:refname`
#[derive(Debug, Clone)]
pub struct GitTagArgs {
    pub binary: String,
    pub repo_dir: PathBuf,
}

impl CommandArgs for GitTagArgs {
    fn program(&self) -> &str {
        &self.binary
    }

    fn to_cli_args(&self) -> Vec<String> {
        vec!["tag".to_string(), "--sort=-v:refname".to_string()]
    }

    fn working_dir(&self) -> Option<&Path> {
        Some(&self.repo_dir)
    }
}

/// Latest release tag of the repository, shared by every module in it.
#[derive(Debug, Clone)]
pub struct GitTagResolver {
    args: GitTagArgs,
}

impl GitTagResolver {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            args: GitTagArgs {
                binary: "git".to_string(),
                repo_dir: repo_dir.into(),
            },
        }
    }
}

impl ReleaseResolver for GitTagResolver {
    fn prior_release(&self, module: &str) -> Result<String> {
        let output = run_command_safe(&self.args)?;
        output.ensure_success("git tag")?;
        let release = latest_release(&output.stdout)?.ok_or_else(|| {
            HarnessError::provisioner(format!(
                "No release tag in {:?} to upgrade {} from",
                self.args.repo_dir, module
            ))
        })?;
        info!("Upgrading {} from release {}", module, release);
        Ok(release)
    }
}

/// First release-shaped tag (`v1.2.3` or `1.2.3`) in version-sorted output.
pub fn latest_release(tags: &str) -> Result<Option<String>> {
    let semver = Regex::new(r"^v?\d+\.\d+\.\d+$")
        .map_err(|e| HarnessError::config(format!("release pattern: {}", e)))?;
    Ok(tags
        .lines()
        .map(str::trim)
        .find(|tag| semver.is_match(tag))
        .map(str::to_string))
}

/// Rewrites module references in an example so it builds from a release.
pub trait SourcePinner {
    /// Point references to `module` at `release`; returns files rewritten
    fn pin(&self, example_dir: &Path, module: &str, release: &str) -> Result<usize>;

    /// Put back every file changed by `pin` under `example_dir`
    fn restore(&self, example_dir: &Path) -> Result<()>;
}

impl<S: SourcePinner + ?Sized> SourcePinner for &S {
    fn pin(&self, example_dir: &Path, module: &str, release: &str) -> Result<usize> {
        (**self).pin(example_dir, module, release)
    }

    fn restore(&self, example_dir: &Path) -> Result<()> {
        (**self).restore(example_dir)
    }
}

/// Restores pinned sources when dropped, unwinding included. Call
/// [`PinnedSources::restore`] to see the restore error instead of a log line.
struct PinnedSources<'a, S: SourcePinner + ?Sized> {
    pinner: &'a S,
    dir: &'a Path,
    restored: bool,
}

impl<'a, S: SourcePinner + ?Sized> PinnedSources<'a, S> {
    fn new(pinner: &'a S, dir: &'a Path) -> Self {
        Self {
            pinner,
            dir,
            restored: false,
        }
    }

    fn pin(&self, module: &str, release: &str) -> Result<usize> {
        self.pinner.pin(self.dir, module, release)
    }

    fn restore(mut self) -> Result<()> {
        self.restored = true;
        self.pinner.restore(self.dir)
    }
}

impl<S: SourcePinner + ?Sized> Drop for PinnedSources<'_, S> {
    fn drop(&mut self) {
        if self.restored {
            return;
        }
        if let Err(e) = self.pinner.restore(self.dir) {
            error!("Failed to restore pinned sources in {:?}: {}", self.dir, e);
        }
    }
}

/// Pins local `source = "../../modules/<m>"` references to
/// `git::<repo_url>//modules/<m>?ref=<release>`.
#[derive(Debug)]
pub struct GitSourcePinner {
    repo_url: String,
    originals: Mutex<BTreeMap<PathBuf, String>>,
}

impl GitSourcePinner {
    pub fn new(repo_url: impl Into<String>) -> Self {
        Self {
            repo_url: repo_url.into(),
            originals: Mutex::new(BTreeMap::new()),
        }
    }

    fn pattern(module: &str) -> Result<Regex> {
        Regex::new(&format!(
            r#"(source\s*=\s*)"(?:\./|\.\./)+modules/{}/?""#,
            regex::escape(module)
        ))
        .map_err(|e| HarnessError::config(format!("source pattern for {}: {}", module, e)))
    }

    /// Rewrite one file's contents; `None` if nothing matched
    pub fn rewrite(&self, content: &str, module: &str, release: &str) -> Result<Option<String>> {
        let pattern = Self::pattern(module)?;
        if !pattern.is_match(content) {
            return Ok(None);
        }
        let pinned = format!(
            r#"${{1}}"git::{}//modules/{}?ref={}""#,
            self.repo_url, module, release
        );
        Ok(Some(pattern.replace_all(content, pinned.as_str()).into_owned()))
    }
}

impl SourcePinner for GitSourcePinner {
    fn pin(&self, example_dir: &Path, module: &str, release: &str) -> Result<usize> {
        let mut originals = self
            .originals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut rewritten = 0;

        for entry in fs::read_dir(example_dir)? {
            let path = entry?.path();
            if !path.is_file() || path.extension().is_none_or(|ext| ext != "tf") {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            if let Some(pinned) = self.rewrite(&content, module, release)? {
                originals.entry(path.clone()).or_insert(content);
                fs::write(&path, pinned)?;
                debug!("Pinned {} to {} in {:?}", module, release, path);
                rewritten += 1;
            }
        }
        Ok(rewritten)
    }

    fn restore(&self, example_dir: &Path) -> Result<()> {
        let mut originals = self
            .originals
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let paths: Vec<PathBuf> = originals
            .keys()
            .filter(|p| p.starts_with(example_dir))
            .cloned()
            .collect();
        for path in paths {
            if let Some(content) = originals.remove(&path) {
                fs::write(&path, content)?;
            }
        }
        Ok(())
    }
}

/// Builds an example's provisioning options from its working directory and
/// unique id. `module_dir` and `upgrade` are filled in by the comparator.
pub type SetupFn = Arc<dyn Fn(&Path, &str) -> Result<ProvisionOptions> + Send + Sync>;

/// One example put through the comparison.
#[derive(Clone)]
pub struct UpgradeExample {
    pub name: String,
    /// Example directory, relative to the repository root
    pub module_dir: PathBuf,
    pub setup: SetupFn,
}

impl fmt::Debug for UpgradeExample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpgradeExample")
            .field("name", &self.name)
            .field("module_dir", &self.module_dir)
            .finish_non_exhaustive()
    }
}

impl UpgradeExample {
    /// Example whose options come from a manifest template. The region is
    /// picked once and persisted so replays reuse it.
    pub fn from_spec<A>(spec: &UpgradeExampleSpec, domain_zone: &str, accounts: Arc<A>) -> Self
    where
        A: CloudAccountResolver + Send + Sync + 'static,
    {
        let template = spec.clone();
        let zone = domain_zone.to_string();

        let setup: SetupFn = Arc::new(move |working_dir: &Path, unique_id: &str| -> Result<ProvisionOptions> {
            let store = StateStore::new(working_dir);
            let region: String = store.load_or_save(REGION_KEY, || template.region.pick())?;
            let account_id = accounts.account_id()?;
            let ctx = TemplateContext {
                unique_id,
                region: &region,
                account_id: &account_id,
                zone: &zone,
            };
            Ok(ProvisionOptions {
                module_dir: PathBuf::new(),
                vars: render_vars(&template.vars, &ctx)?,
                env: render_env(&template.env, &ctx)?,
                upgrade: true,
            })
        });

        Self {
            name: spec.name.clone(),
            module_dir: spec.module_dir.clone(),
            setup,
        }
    }
}

/// Which module version produced the live infrastructure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum LiveVersion {
    Prior,
    Current,
}

/// Outcome of one example's comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct UpgradeReport {
    pub example: String,
    /// Release each module was pinned to
    pub prior_refs: BTreeMap<String, String>,
    /// Version behind the live state; outputs below come from it
    pub live_version: Option<LiveVersion>,
    pub outputs: Outputs,
    pub stages: ScenarioReport,
}

impl UpgradeReport {
    pub fn passed(&self) -> bool {
        self.stages.passed()
    }
}

impl fmt::Display for UpgradeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.stages)?;
        for (module, release) in &self.prior_refs {
            writeln!(f, "  prior {} = {}", module, release)?;
        }
        if let Some(live) = self.live_version {
            writeln!(f, "  live version: {}", live)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Progress {
    prior_refs: BTreeMap<String, String>,
    live_version: Option<LiveVersion>,
    outputs: Outputs,
}

/// Runs upgrade comparisons.
#[derive(Debug)]
pub struct UpgradeComparator<P, R, S, I> {
    provisioner: P,
    resolver: R,
    pinner: S,
    ids: I,
    config: HarnessConfig,
    run_config: RunConfiguration,
    repo_root: PathBuf,
}

impl<P, R, S, I> UpgradeComparator<P, R, S, I>
where
    P: Provisioner,
    R: ReleaseResolver,
    S: SourcePinner,
    I: IdGenerator,
{
    pub fn new(provisioner: P, resolver: R, pinner: S, ids: I) -> Self {
        Self {
            provisioner,
            resolver,
            pinner,
            ids,
            config: HarnessConfig::default(),
            run_config: RunConfiguration::default(),
            repo_root: PathBuf::from("."),
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

    /// Builder: repository the example directories are relative to
    pub fn with_repo_root(mut self, repo_root: impl Into<PathBuf>) -> Self {
        self.repo_root = repo_root.into();
        self
    }

    /// Working directory for an example's persisted state
    pub fn working_dir(&self, example: &str) -> PathBuf {
        self.config.working_dir(&format!("upgrade-{}", example))
    }

    /// Compare every example, one after another, pinning each of `modules`
    /// to its prior release in every example.
    pub fn run(&self, modules: &[String], examples: &[UpgradeExample]) -> Vec<UpgradeReport> {
        examples.iter().map(|e| self.run_example(modules, e)).collect()
    }

    /// Compare one example.
    pub fn run_example(&self, modules: &[String], example: &UpgradeExample) -> UpgradeReport {
        let mut runner = StageRunner::new(&example.name, self.run_config.clone());
        let mut progress = Progress::default();

        let result = self.drive(modules, example, &mut runner, &mut progress);
        let mut stages = runner.report();

        match result {
            Ok(()) => info!(example = %example.name, "Upgrade comparison finished"),
            Err(HarnessError::StageFailure { .. } | HarnessError::Panicked { .. }) => {}
            Err(err) => {
                warn!(example = %example.name, "Upgrade comparison aborted: {}", err);
                if stages.failure.is_none() {
                    stages.failure = Some((LOAD_STATE_LABEL.to_string(), err.to_string()));
                }
            }
        }

        UpgradeReport {
            example: example.name.clone(),
            prior_refs: progress.prior_refs,
            live_version: progress.live_version,
            outputs: progress.outputs,
            stages,
        }
    }

    fn drive(
        &self,
        modules: &[String],
        example: &UpgradeExample,
        runner: &mut StageRunner,
        progress: &mut Progress,
    ) -> Result<()> {
        let working_dir = self.working_dir(&example.name);
        let store = StateStore::new(&working_dir);

        let unique_id: String = store.load_or_save(UNIQUE_ID_KEY, || {
            Ok(self.ids.unique_id().to_ascii_lowercase())
        })?;
        let module_dir: PathBuf = store.load_or_save(MODULE_DIR_KEY, || {
            copy_module_to_temp(&self.repo_root, &example.module_dir)
        })?;

        for module in modules {
            let release = self.resolver.prior_release(module)?;
            progress.prior_refs.insert(module.clone(), release);
        }

        let mut options = (example.setup)(&working_dir, &unique_id)?;
        options.module_dir = module_dir;
        options.upgrade = true;
        store.save_options(&options)?;

        let provisioner = &self.provisioner;
        let teardown_options = options.clone();
        let mut runner = runner.defer_teardown(StageName::Teardown, move || {
            provisioner.destroy(&teardown_options)
        });

        let prior_refs = &progress.prior_refs;
        let live_version = Cell::new(None);
        let outputs = RefCell::new(None);
        let stages = vec![
            Stage::new(StageName::EnsurePriorApplied, || {
                let applied = self.apply_prior(example, &options, prior_refs)?;
                live_version.set(Some(LiveVersion::Prior));
                outputs.replace(Some(applied));
                Ok(())
            }),
            Stage::new(StageName::ApplyCurrent, || {
                self.refresh_sources(example, options.module_dir())?;
                let applied = self.provisioner.init_and_apply(&options)?;
                live_version.set(Some(LiveVersion::Current));
                outputs.replace(Some(applied));
                Ok(())
            }),
            Stage::new(StageName::AssertNoDiff, || {
                assert_no_pending_changes(&self.provisioner, &options)
            }),
        ];

        // Dropping the guard on the error path runs the teardown
        let result = runner.run_sequence(stages).and_then(|()| runner.finish());

        progress.live_version = live_version.get();
        progress.outputs = outputs.into_inner().unwrap_or_default();
        result
    }

    /// Apply with sources pinned, restoring the working copy afterwards
    fn apply_prior(
        &self,
        example: &UpgradeExample,
        options: &ProvisionOptions,
        prior_refs: &BTreeMap<String, String>,
    ) -> Result<Outputs> {
        let dir = options.module_dir();
        self.refresh_sources(example, dir)?;

        let pinned = PinnedSources::new(&self.pinner, dir);
        for (module, release) in prior_refs {
            if pinned.pin(module, release)? == 0 {
                warn!("{:?} does not reference module {}", dir, module);
            }
        }

        let applied = self.provisioner.init_and_apply(options);
        let restored = pinned.restore();
        let outputs = applied?;
        restored?;
        Ok(outputs)
    }

    /// Put the working copy's sources back in the module copy. A run killed
    /// mid-apply can leave pinned sources behind that no restore undoes.
    fn refresh_sources(&self, example: &UpgradeExample, dir: &Path) -> Result<()> {
        refresh_module_sources(&self.repo_root, &example.module_dir, dir)?;
        Ok(())
    }
}
