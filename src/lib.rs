//! stagecheck library
//!
//! Staged test orchestration for infrastructure modules: provision an
//! example, probe what it exposes until it converges, and tear it down,
//! with every stage independently skippable and replayable across process
//! restarts.

pub mod command_runner;
pub mod config;
pub mod error;
pub mod identity;
pub mod logging;
pub mod manifest;
pub mod probe;
pub mod process_guard;
pub mod provisioner;
pub mod retry;
pub mod scenario;
pub mod stage;
pub mod state_store;
pub mod terraform;
pub mod upgrade;
pub mod workspace;

// Re-export main types for convenience
pub use command_runner::{CommandArgs, CommandOutput, run_command_safe};
pub use config::{HarnessConfig, RunConfiguration};
pub use error::{HarnessError, Result};
pub use identity::{
    AwsCliAccountResolver, CloudAccountResolver, IdGenerator, RandomIdGenerator, RegionPolicy,
};
pub use manifest::{ScenarioManifest, ScenarioSpec, UpgradeExampleSpec, UpgradeSpec};
pub use probe::{
    BudgetKind, HostOutput, HttpProbe, HttpResponse, ProbeExpectation, ReqwestProbe,
    validate_endpoint,
};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use provisioner::{Outputs, ProvisionOptions, Provisioner};
pub use retry::{RetryBudget, RetryExhausted, RetryPoller, Sleeper, ThreadSleeper, do_with_retry};
pub use scenario::{ScenarioHarness, ScenarioIdentifiers, format_domain_name};
pub use stage::{ScenarioReport, Stage, StageName, StageOutcome, StageRecord, StageRunner, TeardownGuard};
pub use state_store::StateStore;
pub use terraform::TerraformCli;
pub use upgrade::{
    GitSourcePinner, GitTagResolver, LiveVersion, ReleaseResolver, SetupFn, SourcePinner,
    UpgradeComparator, UpgradeExample, UpgradeReport,
};
pub use workspace::copy_module_to_temp;
