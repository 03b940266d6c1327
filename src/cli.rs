use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stagecheck - staged provision/validate/teardown runs for infrastructure modules
#[derive(Parser, Debug)]
#[command(name = "stagecheck")]
#[command(about = "Provision example infrastructure, probe it until it converges, and tear it down")]
#[command(version)]
pub struct Cli {
    /// Harness settings file (JSON); defaults apply when omitted
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run scenarios from a manifest, in parallel
    Run {
        /// Scenario manifest (JSON)
        manifest: PathBuf,

        /// Only run the named scenario (repeatable)
        #[arg(short, long = "scenario")]
        scenarios: Vec<String>,

        /// Skip a stage: setup, apply, validate, teardown (repeatable).
        /// SKIP_<stage> environment variables are honoured too.
        #[arg(long = "skip")]
        skip: Vec<String>,
    },
    /// Check that upgrading each example's modules is a no-op
    Upgrade {
        /// Scenario manifest (JSON) with an `upgrade` section
        manifest: PathBuf,

        /// Skip a stage: ensure_prior_applied, apply_current, assert_no_diff, teardown
        #[arg(long = "skip")]
        skip: Vec<String>,
    },
    /// Validate a manifest without running anything
    Validate {
        /// Scenario manifest (JSON)
        manifest: PathBuf,
    },
    /// Inspect or remove persisted scenario state
    State {
        #[command(subcommand)]
        action: StateCommands,
    },
}

#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Print a persisted value
    Get {
        /// Scenario working directory
        dir: PathBuf,
        /// Key, e.g. uniqueID
        key: String,
    },
    /// List persisted keys
    List {
        /// Scenario working directory
        dir: PathBuf,
    },
    /// Remove a scenario working directory and its module copy
    Clean {
        /// Scenario working directory
        dir: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
