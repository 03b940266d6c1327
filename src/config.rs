//! Run and harness configuration.
//!
//! `RunConfiguration` replaces ambient `SKIP_<stage>` environment flags with
//! an explicit value handed to the stage runner. `HarnessConfig` carries the
//! knobs shared by every scenario (where state lives, which terraform binary
//! to spawn, default retry budgets) and is saved/loaded as JSON.

use crate::error::{HarnessError, Result};
use crate::retry::RetryBudget;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Prefix of the legacy skip-directive environment variables
pub const SKIP_ENV_PREFIX: &str = "SKIP_";

/// Stage names that are accepted as spellings of another stage
const STAGE_ALIASES: &[(&str, &str)] = &[("destroy", "teardown")];

/// Per-stage skip directives for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfiguration {
    skips: BTreeMap<String, bool>,
}

impl RunConfiguration {
    /// A configuration that runs every stage
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: mark `stage` as skipped
    pub fn skip(mut self, stage: impl AsRef<str>) -> Self {
        self.set(stage, true);
        self
    }

    /// Set the skip flag for `stage`
    pub fn set(&mut self, stage: impl AsRef<str>, skip: bool) {
        self.skips.insert(canonical_stage(stage.as_ref()).to_string(), skip);
    }

    /// Returns true if a directive bypasses `stage`
    pub fn should_skip(&self, stage: &str) -> bool {
        self.skips
            .get(canonical_stage(stage))
            .copied()
            .unwrap_or(false)
    }

    /// Stage names currently marked as skipped
    pub fn skipped_stages(&self) -> impl Iterator<Item = &str> {
        self.skips
            .iter()
            .filter(|(_, skip)| **skip)
            .map(|(name, _)| name.as_str())
    }

    /// Read `SKIP_<stage>` directives from the process environment.
    pub fn from_env() -> Self {
        Self::from_vars(std::env::vars())
    }

    /// Build from `(name, value)` pairs shaped like environment variables.
    ///
    /// Any non-empty value other than `false` or `0` skips the stage.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut config = Self::new();
        for (key, value) in vars {
            if let Some(stage) = key.as_ref().strip_prefix(SKIP_ENV_PREFIX) {
                if stage.is_empty() {
                    continue;
                }
                config.set(stage, is_truthy(value.as_ref()));
            }
        }
        config
    }

    /// Overlay `other` on top of `self`; directives in `other` win.
    pub fn merge(mut self, other: &RunConfiguration) -> Self {
        for (stage, skip) in &other.skips {
            self.skips.insert(stage.clone(), *skip);
        }
        self
    }
}

fn canonical_stage(stage: &str) -> &str {
    STAGE_ALIASES
        .iter()
        .find(|(alias, _)| *alias == stage)
        .map(|(_, canonical)| *canonical)
        .unwrap_or(stage)
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim();
    !value.is_empty() && !value.eq_ignore_ascii_case("false") && value != "0"
}

/// Settings shared by every scenario in a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Root under which each scenario gets its own working directory
    pub stages_dir: PathBuf,
    /// Terraform executable to spawn
    pub terraform_bin: String,
    /// Per-request timeout for endpoint probes, in seconds
    pub http_timeout_secs: u64,
    /// Budget for the first check against freshly created infrastructure
    pub initial_budget: RetryBudget,
    /// Budget for steady-state checks
    pub steady_budget: RetryBudget,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            stages_dir: PathBuf::from("stages"),
            terraform_bin: "terraform".to_string(),
            http_timeout_secs: 30,
            initial_budget: RetryBudget::new(270, Duration::from_secs(10)),
            steady_budget: RetryBudget::new(10, Duration::from_secs(10)),
        }
    }
}

impl HarnessConfig {
    /// Working directory for the named scenario.
    ///
    /// Derived only from the scenario name, so repeated invocations address
    /// the same persisted state.
    pub fn working_dir(&self, scenario: &str) -> PathBuf {
        self.stages_dir.join(scenario)
    }

    /// Timeout applied to each probe request
    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(&path, json)?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).map_err(|e| {
            HarnessError::config(format!(
                "Failed to read configuration from {:?}: {}",
                path.as_ref(),
                e
            ))
        })?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.stages_dir.as_os_str().is_empty() {
            return Err(HarnessError::config("stages_dir must be specified"));
        }
        if self.terraform_bin.trim().is_empty() {
            return Err(HarnessError::config("terraform_bin must be specified"));
        }
        if self.http_timeout_secs == 0 {
            return Err(HarnessError::config("http_timeout_secs must be at least 1"));
        }
        self.initial_budget.validate()?;
        self.steady_budget.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_runs_every_stage() {
        let config = RunConfiguration::new();
        for stage in ["setup", "apply", "validate", "teardown"] {
            assert!(!config.should_skip(stage));
        }
    }

    #[test]
    fn test_from_vars_reads_skip_directives() {
        let config = RunConfiguration::from_vars([
            ("SKIP_setup", "true"),
            ("SKIP_validate", "false"),
            ("SKIP_apply", ""),
            ("PATH", "/usr/bin"),
            ("SKIP_", "true"),
        ]);

        assert!(config.should_skip("setup"));
        assert!(!config.should_skip("validate"));
        assert!(!config.should_skip("apply"));
        assert_eq!(config.skipped_stages().collect::<Vec<_>>(), vec!["setup"]);
    }

    #[test]
    fn test_destroy_is_alias_for_teardown() {
        let config = RunConfiguration::from_vars([("SKIP_destroy", "1")]);
        assert!(config.should_skip("teardown"));
        assert!(config.should_skip("destroy"));
    }

    #[test]
    fn test_merge_prefers_other() {
        let base = RunConfiguration::new().skip("setup").skip("apply");
        let mut overlay = RunConfiguration::new();
        overlay.set("apply", false);

        let merged = base.merge(&overlay);
        assert!(merged.should_skip("setup"));
        assert!(!merged.should_skip("apply"));
    }

    #[test]
    fn test_harness_config_roundtrip_through_file() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("harness.json");

        let mut config = HarnessConfig::default();
        config.stages_dir = PathBuf::from("/tmp/stages");
        config.save_to_file(&path).expect("save");

        let loaded = HarnessConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded, config);
        assert_eq!(loaded.working_dir("web"), PathBuf::from("/tmp/stages/web"));
    }

    #[test]
    fn test_harness_config_partial_file_uses_defaults() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("harness.json");
        fs::write(&path, r#"{ "terraform_bin": "tofu" }"#).unwrap();

        let loaded = HarnessConfig::load_from_file(&path).expect("load");
        assert_eq!(loaded.terraform_bin, "tofu");
        assert_eq!(loaded.initial_budget.max_attempts, 270);
    }

    #[test]
    fn test_harness_config_validation() {
        let mut config = HarnessConfig::default();
        assert!(config.validate().is_ok());

        config.terraform_bin = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = HarnessConfig::default();
        config.steady_budget.max_attempts = 0;
        assert!(config.validate().is_err());
    }
}
