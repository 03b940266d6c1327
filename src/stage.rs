//! Stage Runner
//!
//! Executes the named, individually skippable stages of a single scenario and
//! keeps an in-memory record of what happened to each one.
//!
//! # Design Principles
//!
//! - **Explicit skip directives**: whether a stage runs is decided by the
//!   `RunConfiguration` handed to the runner, never by ambient process state
//! - **Fail Fast**: a failing stage aborts the remaining forward stages
//! - **Guaranteed teardown**: teardown is acquired as a guard at scenario
//!   start and runs on every exit path, including panics and early returns
//!
//! # Stage Flow
//!
//! ```text
//! setup
//!   ↓
//! apply ─────┐
//!   ↓        │ (failure or panic)
//! validate ──┤
//!   ↓        ↓
//! teardown (always, exactly once, unless skipped)
//! ```

use crate::config::RunConfiguration;
use crate::error::{HarnessError, Result};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};
use tracing::{debug, error, info, warn};

/// Well-known stage names.
///
/// Scenario stages follow `setup → apply → validate → teardown`; upgrade runs
/// follow `ensure_prior_applied → apply_current → assert_no_diff → teardown`.
/// Arbitrary names are still accepted by [`StageRunner::run_stage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, EnumIter, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StageName {
    Setup,
    Apply,
    Validate,
    Teardown,
    EnsurePriorApplied,
    ApplyCurrent,
    AssertNoDiff,
}

impl StageName {
    /// The name used in records and skip directives
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    /// Stages of the standard scenario flow, in order
    pub const fn scenario_stages() -> &'static [Self] {
        &[Self::Setup, Self::Apply, Self::Validate, Self::Teardown]
    }

    /// Stages of the upgrade flow, in order
    pub const fn upgrade_stages() -> &'static [Self] {
        &[
            Self::EnsurePriorApplied,
            Self::ApplyCurrent,
            Self::AssertNoDiff,
            Self::Teardown,
        ]
    }
}

impl AsRef<str> for StageName {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// What happened to a stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Body ran and returned Ok
    Succeeded,
    /// Body ran and returned an error
    Failed(String),
    /// Body panicked
    Panicked(String),
    /// A skip directive bypassed the stage; the body never ran
    Skipped,
}

impl StageOutcome {
    /// Returns true if the stage did not complete successfully
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Panicked(_))
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "ok"),
            Self::Failed(err) => write!(f, "FAILED: {}", err),
            Self::Panicked(msg) => write!(f, "PANICKED: {}", msg),
            Self::Skipped => write!(f, "skipped"),
        }
    }
}

/// The fact that a stage executed or was skipped during this run.
///
/// Records live only as long as the runner; they are never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageRecord {
    pub name: String,
    pub outcome: StageOutcome,
    pub duration: Duration,
}

impl StageRecord {
    /// Returns true if the body was invoked
    pub fn executed(&self) -> bool {
        self.outcome != StageOutcome::Skipped
    }
}

/// A named stage carrying its action.
pub struct Stage<'a> {
    name: String,
    action: Box<dyn FnOnce() -> Result<()> + 'a>,
}

impl<'a> Stage<'a> {
    pub fn new(name: impl AsRef<str>, action: impl FnOnce() -> Result<()> + 'a) -> Self {
        Self {
            name: name.as_ref().to_string(),
            action: Box::new(action),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Stage<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage").field("name", &self.name).finish()
    }
}

/// Drives the stages of one scenario.
///
/// # Example
///
/// ```
/// use stagecheck::config::RunConfiguration;
/// use stagecheck::stage::{StageOutcome, StageRunner};
///
/// let config = RunConfiguration::new().skip("setup");
/// let mut runner = StageRunner::new("demo", config);
///
/// runner.run_stage("setup", || panic!("never runs")).unwrap();
/// runner.run_stage("apply", || Ok(())).unwrap();
///
/// assert_eq!(runner.records()[0].outcome, StageOutcome::Skipped);
/// assert_eq!(runner.records()[1].outcome, StageOutcome::Succeeded);
/// ```
#[derive(Debug)]
pub struct StageRunner {
    scenario: String,
    config: RunConfiguration,
    records: Vec<StageRecord>,
    teardown_stage: Option<String>,
}

impl StageRunner {
    pub fn new(scenario: impl Into<String>, config: RunConfiguration) -> Self {
        Self {
            scenario: scenario.into(),
            config,
            records: Vec::with_capacity(StageName::scenario_stages().len()),
            teardown_stage: None,
        }
    }

    pub fn scenario(&self) -> &str {
        &self.scenario
    }

    pub fn config(&self) -> &RunConfiguration {
        &self.config
    }

    /// Records of every stage seen so far, in execution order
    pub fn records(&self) -> &[StageRecord] {
        &self.records
    }

    /// Run a single stage unless a skip directive bypasses it.
    ///
    /// # Errors
    ///
    /// - `StageFailure` wrapping the body's error
    /// - `Panicked` if the body panicked
    pub fn run_stage<F>(&mut self, name: impl AsRef<str>, body: F) -> Result<()>
    where
        F: FnOnce() -> Result<()>,
    {
        let name = name.as_ref();

        if self.config.should_skip(name) {
            info!(scenario = %self.scenario, stage = name, "Skipping stage");
            self.record(name, StageOutcome::Skipped, Duration::ZERO);
            return Ok(());
        }

        info!(scenario = %self.scenario, stage = name, "Running stage");
        let start = Instant::now();
        let result = panic::catch_unwind(AssertUnwindSafe(body));
        let elapsed = start.elapsed();

        match result {
            Ok(Ok(())) => {
                debug!(scenario = %self.scenario, stage = name, ?elapsed, "Stage succeeded");
                self.record(name, StageOutcome::Succeeded, elapsed);
                Ok(())
            }
            Ok(Err(err)) => {
                error!(scenario = %self.scenario, stage = name, "Stage failed: {}", err);
                self.record(name, StageOutcome::Failed(err.to_string()), elapsed);
                Err(HarnessError::stage_failure(name, err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(scenario = %self.scenario, stage = name, "Stage panicked: {}", message);
                self.record(name, StageOutcome::Panicked(message.clone()), elapsed);
                Err(HarnessError::Panicked {
                    stage: name.to_string(),
                    message,
                })
            }
        }
    }

    /// Run a typed stage.
    pub fn run(&mut self, stage: Stage<'_>) -> Result<()> {
        let Stage { name, action } = stage;
        self.run_stage(name, action)
    }

    /// Run stages strictly in order, stopping at the first failure.
    pub fn run_sequence(&mut self, stages: Vec<Stage<'_>>) -> Result<()> {
        for stage in stages {
            self.run(stage)?;
        }
        Ok(())
    }

    /// Schedule a teardown stage that runs exactly once on every exit path.
    ///
    /// The returned guard dereferences to this runner so forward stages run
    /// through it. Call [`TeardownGuard::finish`] to run the teardown and see
    /// its result; dropping the guard (early return, `?`, or panic unwinding)
    /// runs it too, logging any failure.
    pub fn defer_teardown<F>(&mut self, name: impl AsRef<str>, body: F) -> TeardownGuard<'_, F>
    where
        F: FnOnce() -> Result<()>,
    {
        let name = name.as_ref().to_string();
        debug!(scenario = %self.scenario, stage = %name, "Teardown scheduled");
        self.teardown_stage = Some(name.clone());
        TeardownGuard {
            runner: self,
            name,
            body: Some(body),
        }
    }

    /// Summarize the run so far
    pub fn report(&self) -> ScenarioReport {
        let is_teardown = |record: &&StageRecord| {
            self.teardown_stage.as_deref() == Some(record.name.as_str())
        };

        let failure = self
            .records
            .iter()
            .filter(|r| !is_teardown(r))
            .find(|r| r.outcome.is_failure())
            .map(|r| (r.name.clone(), r.outcome.to_string()));

        let teardown_failure = self
            .records
            .iter()
            .filter(is_teardown)
            .find(|r| r.outcome.is_failure())
            .map(|r| r.outcome.to_string());

        ScenarioReport {
            scenario: self.scenario.clone(),
            records: self.records.clone(),
            failure,
            teardown_failure,
        }
    }

    fn record(&mut self, name: &str, outcome: StageOutcome, duration: Duration) {
        self.records.push(StageRecord {
            name: name.to_string(),
            outcome,
            duration,
        });
    }
}

/// Scoped teardown handle returned by [`StageRunner::defer_teardown`].
pub struct TeardownGuard<'r, F>
where
    F: FnOnce() -> Result<()>,
{
    runner: &'r mut StageRunner,
    name: String,
    body: Option<F>,
}

impl<F> TeardownGuard<'_, F>
where
    F: FnOnce() -> Result<()>,
{
    /// Run the teardown now and return its result.
    pub fn finish(mut self) -> Result<()> {
        self.run_teardown()
    }

    fn run_teardown(&mut self) -> Result<()> {
        match self.body.take() {
            Some(body) => self.runner.run_stage(&self.name, body),
            None => Ok(()),
        }
    }
}

impl<F> Deref for TeardownGuard<'_, F>
where
    F: FnOnce() -> Result<()>,
{
    type Target = StageRunner;

    fn deref(&self) -> &StageRunner {
        self.runner
    }
}

impl<F> DerefMut for TeardownGuard<'_, F>
where
    F: FnOnce() -> Result<()>,
{
    fn deref_mut(&mut self) -> &mut StageRunner {
        self.runner
    }
}

impl<F> Drop for TeardownGuard<'_, F>
where
    F: FnOnce() -> Result<()>,
{
    fn drop(&mut self) {
        if self.body.is_none() {
            return;
        }
        if std::thread::panicking() {
            warn!(scenario = %self.runner.scenario, "Unwinding from a panic, running teardown");
        } else {
            debug!(scenario = %self.runner.scenario, "TeardownGuard dropped, running teardown");
        }
        if let Err(err) = self.run_teardown() {
            error!(scenario = %self.runner.scenario, "Teardown failed: {}", err);
        }
    }
}

/// Outcome of one scenario run, suitable for a top-level failure report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioReport {
    pub scenario: String,
    pub records: Vec<StageRecord>,
    /// First failing forward stage and its error
    pub failure: Option<(String, String)>,
    /// Teardown failure, reported without changing earlier outcomes
    pub teardown_failure: Option<String>,
}

impl ScenarioReport {
    /// Returns true if every executed stage, teardown included, succeeded
    pub fn passed(&self) -> bool {
        self.failure.is_none() && self.teardown_failure.is_none()
    }

    /// Record for the named stage, if it was reached
    pub fn record(&self, name: &str) -> Option<&StageRecord> {
        self.records.iter().find(|r| r.name == name)
    }
}

impl fmt::Display for ScenarioReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let verdict = if self.passed() { "PASS" } else { "FAIL" };
        writeln!(f, "{} {}", verdict, self.scenario)?;
        for record in &self.records {
            writeln!(
                f,
                "  {:<22} {} ({:.1}s)",
                record.name,
                record.outcome,
                record.duration.as_secs_f64()
            )?;
        }
        Ok(())
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
