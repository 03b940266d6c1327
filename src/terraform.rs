//! Terraform command-line backend.
//!
//! Each terraform subcommand is a typed [`TerraformArgs`] value so flag
//! spellings are fixed in one place. Execution goes through
//! [`run_command_safe`], which isolates the child in its own process group.

use crate::command_runner::{CommandArgs, CommandOutput, run_command_safe};
use crate::error::{HarnessError, Result};
use crate::provisioner::{Outputs, ProvisionOptions, Provisioner, scalar_to_string, value_to_strings};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::info;

/// Terraform subcommands the harness drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerraformCommand {
    Init { upgrade: bool },
    Apply,
    Plan,
    Destroy,
    /// `output -json`, optionally for a single key
    Output { key: Option<String> },
}

impl TerraformCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerraformCommand::Init { .. } => "init",
            TerraformCommand::Apply => "apply",
            TerraformCommand::Plan => "plan",
            TerraformCommand::Destroy => "destroy",
            TerraformCommand::Output { .. } => "output",
        }
    }

    fn takes_vars(&self) -> bool {
        matches!(
            self,
            TerraformCommand::Apply | TerraformCommand::Plan | TerraformCommand::Destroy
        )
    }
}

impl fmt::Display for TerraformCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One terraform invocation against a module directory.
#[derive(Debug, Clone)]
pub struct TerraformArgs<'a> {
    pub binary: &'a str,
    pub command: TerraformCommand,
    pub options: &'a ProvisionOptions,
}

impl CommandArgs for TerraformArgs<'_> {
    fn program(&self) -> &str {
        self.binary
    }

    fn to_cli_args(&self) -> Vec<String> {
        let mut args = vec![self.command.as_str().to_string()];
        match &self.command {
            TerraformCommand::Init { upgrade } => {
                args.push("-input=false".to_string());
                if *upgrade {
                    args.push("-upgrade".to_string());
                }
            }
            TerraformCommand::Apply => {
                args.push("-auto-approve".to_string());
                args.push("-input=false".to_string());
            }
            TerraformCommand::Plan => {
                args.push("-detailed-exitcode".to_string());
                args.push("-input=false".to_string());
            }
            TerraformCommand::Destroy => {
                args.push("-auto-approve".to_string());
                args.push("-input=false".to_string());
            }
            TerraformCommand::Output { key } => {
                args.push("-json".to_string());
                if let Some(key) = key {
                    args.push(key.clone());
                }
            }
        }

        if self.command.takes_vars() {
            for (name, value) in &self.options.vars {
                args.push("-var".to_string());
                args.push(format!("{}={}", name, var_literal(value)));
            }
        }
        args
    }

    fn get_env_vars(&self) -> Vec<(String, String)> {
        let mut env: Vec<(String, String)> = self
            .options
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        env.push(("TF_IN_AUTOMATION".to_string(), "1".to_string()));
        env
    }

    fn working_dir(&self) -> Option<&Path> {
        Some(self.options.module_dir())
    }
}

/// Strings go through unquoted; everything else as its JSON literal, which
/// terraform parses as HCL for list/map/bool/number variables.
fn var_literal(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// [`Provisioner`] backed by the terraform binary.
#[derive(Debug, Clone)]
pub struct TerraformCli {
    binary: String,
}

impl Default for TerraformCli {
    fn default() -> Self {
        Self::new("terraform")
    }
}

impl TerraformCli {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn args<'a>(&'a self, command: TerraformCommand, options: &'a ProvisionOptions) -> TerraformArgs<'a> {
        TerraformArgs {
            binary: &self.binary,
            command,
            options,
        }
    }

    fn run(&self, command: TerraformCommand, options: &ProvisionOptions) -> Result<CommandOutput> {
        let context = format!("terraform {} in {:?}", command, options.module_dir());
        let output = run_command_safe(&self.args(command, options))?;
        output.ensure_success(&context)?;
        Ok(output)
    }

    fn output_value(&self, options: &ProvisionOptions, key: &str) -> Result<Value> {
        let output = self.run(
            TerraformCommand::Output {
                key: Some(key.to_string()),
            },
            options,
        )?;
        serde_json::from_str(output.stdout.trim()).map_err(|e| {
            HarnessError::provisioner(format!("Output {} is not valid JSON: {}", key, e))
        })
    }

    fn all_outputs(&self, options: &ProvisionOptions) -> Result<Outputs> {
        let output = self.run(TerraformCommand::Output { key: None }, options)?;
        parse_outputs(&output.stdout)
    }
}

/// Parse `terraform output -json` (every output, wrapped in `{value, type, sensitive}`).
pub fn parse_outputs(json: &str) -> Result<Outputs> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Outputs::new());
    }
    let raw: serde_json::Map<String, Value> = serde_json::from_str(trimmed)?;
    Ok(raw
        .into_iter()
        .map(|(name, wrapped)| {
            let value = match wrapped {
                Value::Object(mut obj) => obj.remove("value").unwrap_or(Value::Null),
                other => other,
            };
            (name, value)
        })
        .collect())
}

impl Provisioner for TerraformCli {
    fn init_and_apply(&self, options: &ProvisionOptions) -> Result<Outputs> {
        info!(module = ?options.module_dir(), "terraform init and apply");
        self.run(
            TerraformCommand::Init {
                upgrade: options.upgrade,
            },
            options,
        )?;
        self.run(TerraformCommand::Apply, options)?;
        self.all_outputs(options)
    }

    fn plan_exit_code(&self, options: &ProvisionOptions) -> Result<i32> {
        let output = run_command_safe(&self.args(TerraformCommand::Plan, options))?;
        match output.exit_code {
            Some(code @ (0 | 2)) => Ok(code),
            _ => {
                output.ensure_success(&format!("terraform plan in {:?}", options.module_dir()))?;
                Ok(0)
            }
        }
    }

    fn destroy(&self, options: &ProvisionOptions) -> Result<()> {
        info!(module = ?options.module_dir(), "terraform destroy");
        self.run(TerraformCommand::Destroy, options)?;
        Ok(())
    }

    fn output_list(&self, options: &ProvisionOptions, key: &str) -> Result<Vec<String>> {
        Ok(value_to_strings(&self.output_value(options, key)?))
    }

    fn output_required(&self, options: &ProvisionOptions, key: &str) -> Result<String> {
        let value = scalar_to_string(&self.output_value(options, key)?);
        if value.is_empty() {
            return Err(HarnessError::provisioner(format!(
                "Output {} in {:?} is empty",
                key,
                options.module_dir()
            )));
        }
        Ok(value)
    }
}
