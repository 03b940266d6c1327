//! Scenario manifests.
//!
//! A manifest is a JSON file listing the scenarios to run against a module
//! repository, and optionally the examples to put through an upgrade
//! comparison:
//!
//! ```json
//! {
//!   "repo_root": "..",
//!   "domain_zone": "example.com",
//!   "scenarios": [{
//!     "name": "S3StaticWebsite",
//!     "module_dir": "examples/s3-static-website",
//!     "vars": { "website_domain_name": "${domain:static}", "aws_region": "${region}" },
//!     "expectations": [{ "protocol": "http",
//!                        "host": { "kind": "scalar", "output": "website_domain_name" },
//!                        "expected_body": "Hello, World!" }]
//!   }]
//! }
//! ```
//!
//! An `"upgrade"` section names the git URL releases are fetched from, the
//! `modules` to pin to their prior release, and the `examples` to apply them
//! in.
//!
//! String values in `vars` may reference `${unique_id}`, `${region}`,
//! `${account_id}` and `${domain:<base>}`; they are rendered once the
//! persisted identifiers are known.

use crate::error::{HarnessError, Result};
use crate::identity::RegionPolicy;
use crate::probe::ProbeExpectation;
use crate::scenario::format_domain_name;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

/// One end-to-end scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Scenario identifier; also names its working directory
    pub name: String,
    /// Example directory to apply, relative to the repository root
    pub module_dir: PathBuf,
    #[serde(default)]
    pub region: RegionPolicy,
    /// Lower-case the generated unique id
    #[serde(default = "default_true")]
    pub lowercase_id: bool,
    /// Input variable template
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    /// Environment for the provisioner, rendered like `vars`
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub expectations: Vec<ProbeExpectation>,
}

/// One example put through the upgrade comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeExampleSpec {
    pub name: String,
    pub module_dir: PathBuf,
    #[serde(default)]
    pub region: RegionPolicy,
    #[serde(default)]
    pub vars: BTreeMap<String, Value>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// Upgrade comparison section of a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpgradeSpec {
    /// Git URL the pinned module sources point at
    pub repo_url: String,
    /// Modules pinned to their prior release in every example
    pub modules: Vec<String>,
    pub examples: Vec<UpgradeExampleSpec>,
}

/// Everything one `stagecheck` invocation can run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioManifest {
    /// Repository root that `module_dir` paths are relative to. Relative
    /// roots are resolved against the manifest's own directory.
    #[serde(default)]
    pub repo_root: PathBuf,
    /// DNS zone used by `${domain:<base>}`
    #[serde(default)]
    pub domain_zone: String,
    #[serde(default)]
    pub scenarios: Vec<ScenarioSpec>,
    #[serde(default)]
    pub upgrade: Option<UpgradeSpec>,
}

impl ScenarioManifest {
    /// Load and validate a manifest from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            HarnessError::config(format!("Failed to read manifest {:?}: {}", path, e))
        })?;
        let mut manifest: Self = serde_json::from_str(&content)?;

        if manifest.repo_root.is_relative() {
            let base = path.parent().unwrap_or_else(|| Path::new(""));
            manifest.repo_root = base.join(&manifest.repo_root);
        }

        manifest.validate()?;
        Ok(manifest)
    }

    /// Scenario by name
    pub fn scenario(&self, name: &str) -> Option<&ScenarioSpec> {
        self.scenarios.iter().find(|s| s.name == name)
    }

    /// Scenarios to run: all of them, or the named subset in manifest order.
    ///
    /// # Errors
    ///
    /// `Config` naming the first unknown scenario.
    pub fn select(&self, names: &[String]) -> Result<Vec<&ScenarioSpec>> {
        if let Some(unknown) = names.iter().find(|n| self.scenario(n).is_none()) {
            return Err(HarnessError::config(format!("Unknown scenario '{}'", unknown)));
        }
        Ok(self
            .scenarios
            .iter()
            .filter(|s| names.is_empty() || names.contains(&s.name))
            .collect())
    }

    /// Validate the manifest
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for scenario in &self.scenarios {
            validate_name(&scenario.name)?;
            if !seen.insert(scenario.name.as_str()) {
                return Err(HarnessError::config(format!(
                    "Duplicate scenario name '{}'",
                    scenario.name
                )));
            }
            validate_module_dir(&scenario.name, &scenario.module_dir)?;
            validate_region(&scenario.name, &scenario.region)?;
            validate_template(&scenario.vars, &scenario.env, &self.domain_zone)?;
        }

        if let Some(upgrade) = &self.upgrade {
            if upgrade.repo_url.trim().is_empty() {
                return Err(HarnessError::config("upgrade.repo_url must be specified"));
            }
            if upgrade.modules.is_empty() {
                return Err(HarnessError::config("upgrade.modules must not be empty"));
            }
            if let Some(module) = upgrade.modules.iter().find(|m| !is_module_name(m)) {
                return Err(HarnessError::config(format!("Invalid upgrade module '{}'", module)));
            }
            if upgrade.examples.is_empty() {
                return Err(HarnessError::config("upgrade.examples must not be empty"));
            }
            let mut seen = HashSet::new();
            for example in &upgrade.examples {
                validate_name(&example.name)?;
                if !seen.insert(example.name.as_str()) {
                    return Err(HarnessError::config(format!(
                        "Duplicate upgrade example '{}'",
                        example.name
                    )));
                }
                validate_module_dir(&example.name, &example.module_dir)?;
                validate_region(&example.name, &example.region)?;
                validate_template(&example.vars, &example.env, &self.domain_zone)?;
            }
        }

        Ok(())
    }
}

/// A single `modules/<name>` directory name
fn is_module_name(name: &str) -> bool {
    !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
}

fn validate_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(HarnessError::config(format!(
            "Invalid name '{}': use letters, digits, '-', '_' or '.'",
            name
        )));
    }
    Ok(())
}

fn validate_module_dir(name: &str, module_dir: &Path) -> Result<()> {
    if module_dir.as_os_str().is_empty() || module_dir.is_absolute() {
        return Err(HarnessError::config(format!(
            "'{}': module_dir must be a path relative to repo_root",
            name
        )));
    }
    Ok(())
}

fn validate_region(name: &str, region: &RegionPolicy) -> Result<()> {
    if region.candidates().iter().all(|r| r.is_empty()) {
        return Err(HarnessError::config(format!(
            "'{}': region policy leaves no region to pick",
            name
        )));
    }
    Ok(())
}

fn validate_template(
    vars: &BTreeMap<String, Value>,
    env: &BTreeMap<String, String>,
    zone: &str,
) -> Result<()> {
    let probe = TemplateContext {
        unique_id: "abc123",
        region: "us-east-1",
        account_id: "000000000000",
        zone,
    };
    render_vars(vars, &probe)?;
    render_env(env, &probe)?;
    Ok(())
}

/// Values substituted into a vars template.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub unique_id: &'a str,
    pub region: &'a str,
    pub account_id: &'a str,
    pub zone: &'a str,
}

fn placeholder_regex() -> Result<Regex> {
    Regex::new(r"\$\{([^}]*)\}")
        .map_err(|e| HarnessError::config(format!("placeholder pattern: {}", e)))
}

/// Substitute placeholders in one string.
///
/// # Errors
///
/// `Config` for an unknown placeholder, or `${domain:..}` with no zone.
pub fn render_str(template: &str, ctx: &TemplateContext<'_>) -> Result<String> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;

    for caps in placeholder_regex()?.captures_iter(template) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        out.push_str(&template[last..whole.start()]);

        let value = match name.as_str() {
            "unique_id" => ctx.unique_id.to_string(),
            "region" => ctx.region.to_string(),
            "account_id" => ctx.account_id.to_string(),
            other => match other.strip_prefix("domain:") {
                Some(_) if ctx.zone.is_empty() => {
                    return Err(HarnessError::config(
                        "${domain:..} used but the manifest has no domain_zone",
                    ));
                }
                Some(base) => format_domain_name(base, ctx.unique_id, ctx.zone),
                None => {
                    return Err(HarnessError::config(format!(
                        "Unknown placeholder '${{{}}}'",
                        other
                    )));
                }
            },
        };
        out.push_str(&value);
        last = whole.end();
    }

    out.push_str(&template[last..]);
    Ok(out)
}

/// Substitute placeholders in every string inside a JSON value.
pub fn render_value(value: &Value, ctx: &TemplateContext<'_>) -> Result<Value> {
    Ok(match value {
        Value::String(s) => Value::String(render_str(s, ctx)?),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| render_value(item, ctx))
                .collect::<Result<_>>()?,
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| Ok((k.clone(), render_value(v, ctx)?)))
                .collect::<Result<_>>()?,
        ),
        other => other.clone(),
    })
}

/// Render a vars template.
pub fn render_vars(
    vars: &BTreeMap<String, Value>,
    ctx: &TemplateContext<'_>,
) -> Result<BTreeMap<String, Value>> {
    vars.iter()
        .map(|(k, v)| Ok((k.clone(), render_value(v, ctx)?)))
        .collect()
}

/// Render an environment template.
pub fn render_env(
    env: &BTreeMap<String, String>,
    ctx: &TemplateContext<'_>,
) -> Result<BTreeMap<String, String>> {
    env.iter()
        .map(|(k, v)| Ok((k.clone(), render_str(v, ctx)?)))
        .collect()
}
