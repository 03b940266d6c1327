//! Provisioning backend capability.
//!
//! The engine never speaks a provisioning language itself. Everything it
//! needs from the backend (apply, detect pending changes, read outputs, tear
//! down) goes through the [`Provisioner`] trait. `TerraformCli` is the
//! shipped implementation; tests use in-memory fakes.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::info;

/// Outputs reported by a successful apply, keyed by output name
pub type Outputs = BTreeMap<String, Value>;

/// Everything the backend needs to act on one module instance.
///
/// Persisted verbatim by `StateStore::save_options` so a later invocation
/// can apply, validate or destroy the same infrastructure.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProvisionOptions {
    /// Directory holding the module configuration to apply
    pub module_dir: PathBuf,
    /// Input variables, passed through opaquely
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Extra environment for the backend process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// Upgrade providers/modules during init
    #[serde(default)]
    pub upgrade: bool,
}

impl ProvisionOptions {
    pub fn new(module_dir: impl Into<PathBuf>) -> Self {
        Self {
            module_dir: module_dir.into(),
            ..Self::default()
        }
    }

    /// Builder: set an input variable
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.vars.insert(name.into(), value.into());
        self
    }

    /// Builder: set an environment variable for the backend
    pub fn with_env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(name.into(), value.into());
        self
    }

    /// Builder: request provider/module upgrades on init
    pub fn with_upgrade(mut self, upgrade: bool) -> Self {
        self.upgrade = upgrade;
        self
    }

    pub fn module_dir(&self) -> &Path {
        &self.module_dir
    }
}

/// The provisioning backend.
pub trait Provisioner {
    /// Initialize the module directory and apply it, returning its outputs
    fn init_and_apply(&self, options: &ProvisionOptions) -> Result<Outputs>;

    /// Exit code of a detailed plan: 0 = no pending changes, 2 = pending changes
    fn plan_exit_code(&self, options: &ProvisionOptions) -> Result<i32>;

    /// Release every resource the module created
    fn destroy(&self, options: &ProvisionOptions) -> Result<()>;

    /// Read a list output, in order
    fn output_list(&self, options: &ProvisionOptions, key: &str) -> Result<Vec<String>>;

    /// Read a scalar output; absent or empty values are errors
    fn output_required(&self, options: &ProvisionOptions, key: &str) -> Result<String>;
}

impl<P: Provisioner + ?Sized> Provisioner for &P {
    fn init_and_apply(&self, options: &ProvisionOptions) -> Result<Outputs> {
        (**self).init_and_apply(options)
    }

    fn plan_exit_code(&self, options: &ProvisionOptions) -> Result<i32> {
        (**self).plan_exit_code(options)
    }

    fn destroy(&self, options: &ProvisionOptions) -> Result<()> {
        (**self).destroy(options)
    }

    fn output_list(&self, options: &ProvisionOptions, key: &str) -> Result<Vec<String>> {
        (**self).output_list(options, key)
    }

    fn output_required(&self, options: &ProvisionOptions, key: &str) -> Result<String> {
        (**self).output_required(options, key)
    }
}

/// Fail with `DriftDetected` unless a plan reports no pending changes.
pub fn assert_no_pending_changes<P: Provisioner + ?Sized>(
    provisioner: &P,
    options: &ProvisionOptions,
) -> Result<()> {
    let exit_code = provisioner.plan_exit_code(options)?;
    if exit_code != 0 {
        return Err(HarnessError::DriftDetected { exit_code });
    }
    info!(module = ?options.module_dir, "Plan reports no pending changes");
    Ok(())
}

/// Render a JSON output value as the strings a list output yields.
pub fn value_to_strings(value: &Value) -> Vec<String> {
    match value {
        Value::Array(items) => items.iter().map(scalar_to_string).collect(),
        Value::Null => Vec::new(),
        other => vec![scalar_to_string(other)],
    }
}

/// Render a JSON output value as a scalar string.
pub fn scalar_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
