//! Typed external command execution.
//!
//! Every external tool the harness drives (terraform, aws, git) is described
//! by a struct implementing [`CommandArgs`] and launched through
//! [`run_command_safe`], which:
//!
//! - spawns the child in its own process group
//! - registers the PID with the global [`ChildRegistry`] for signal cleanup
//! - captures stdout/stderr for the caller to parse
//!
//! Backends never call `Command::new` directly.

use crate::error::{HarnessError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

/// Typed arguments for one external command invocation.
///
/// The struct definition is the contract: flag spellings live in
/// `to_cli_args` and nowhere else.
pub trait CommandArgs {
    /// Executable to spawn, resolved through `PATH`
    fn program(&self) -> &str;

    /// Arguments exactly as the program expects them.
    fn to_cli_args(&self) -> Vec<String>;

    /// Extra environment variables for the child.
    fn get_env_vars(&self) -> Vec<(String, String)> {
        Vec::new()
    }

    /// Directory to run in; `None` inherits the harness's
    fn working_dir(&self) -> Option<&Path> {
        None
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code (None if terminated by signal)
    pub exit_code: Option<i32>,
    pub success: bool,
}

impl CommandOutput {
    /// Return a `Provisioner` error unless the command exited 0.
    pub fn ensure_success(&self, context: &str) -> Result<()> {
        if self.success {
            Ok(())
        } else {
            Err(HarnessError::provisioner(format!(
                "{} failed (exit code {}): {}",
                context,
                self.exit_code.unwrap_or(-1),
                self.stderr.trim()
            )))
        }
    }
}

/// Execute a command described by `args` and wait for it.
///
/// A non-zero exit is not an error here; callers decide which exit codes are
/// meaningful (a detailed plan exits 2 on pending changes). Spawn failures
/// are `Provisioner` errors.
pub fn run_command_safe<T: CommandArgs + ?Sized>(args: &T) -> Result<CommandOutput> {
    let program = args.program();
    let cli_args = args.to_cli_args();
    let env_vars = args.get_env_vars();

    // Env values may hold credentials; log names only
    info!(
        "run_command_safe: {} args={:?} env={:?}",
        program,
        cli_args,
        env_vars.iter().map(|(k, _)| k.as_str()).collect::<Vec<_>>()
    );

    let mut cmd = Command::new(program);
    cmd.args(&cli_args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();

    if let Some(dir) = args.working_dir() {
        cmd.current_dir(dir);
    }
    for (key, value) in &env_vars {
        cmd.env(key, value);
    }

    let child = cmd
        .spawn()
        .map_err(|e| HarnessError::provisioner(format!("Failed to spawn {}: {}", program, e)))?;
    let pid = child.id();
    with_registry(|registry| registry.register(pid));

    let output = child.wait_with_output();
    with_registry(|registry| registry.unregister(pid));
    let output = output
        .map_err(|e| HarnessError::provisioner(format!("Failed waiting for {}: {}", program, e)))?;

    let result = CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
        success: output.status.success(),
    };

    if result.success {
        debug!("{} exited successfully", program);
    } else {
        info!("{} exited with code {}", program, result.exit_code.unwrap_or(-1));
    }
    Ok(result)
}

fn with_registry(f: impl FnOnce(&mut ChildRegistry)) {
    let registry = ChildRegistry::global();
    let mut guard = registry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard);
}
