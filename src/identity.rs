//! Per-scenario identifiers: unique names, cloud account and region.

use crate::command_runner::{CommandArgs, run_command_safe};
use crate::error::{HarnessError, Result};
use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const BASE62: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

/// Length of generated unique ids
pub const UNIQUE_ID_LEN: usize = 6;

/// Produces short random identifiers that keep parallel scenarios from
/// colliding in a shared account.
pub trait IdGenerator {
    fn unique_id(&self) -> String;
}

/// Base-62 ids from the thread RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomIdGenerator {
    /// Lower-case the result (bucket names forbid upper case)
    pub lowercase: bool,
}

impl RandomIdGenerator {
    pub fn lowercase() -> Self {
        Self { lowercase: true }
    }
}

impl IdGenerator for RandomIdGenerator {
    fn unique_id(&self) -> String {
        let mut rng = rand::thread_rng();
        let id: String = (0..UNIQUE_ID_LEN)
            .map(|_| BASE62[rng.gen_range(0..BASE62.len())] as char)
            .collect();
        if self.lowercase {
            id.to_ascii_lowercase()
        } else {
            id
        }
    }
}

/// Resolves the account the credentials in scope belong to.
pub trait CloudAccountResolver {
    fn account_id(&self) -> Result<String>;
}

/// `aws sts get-caller-identity`
#[derive(Debug, Clone)]
pub struct CallerIdentityArgs {
    pub binary: String,
}

impl CommandArgs for CallerIdentityArgs {
    fn program(&self) -> &str {
        &self.binary
    }

    fn to_cli_args(&self) -> Vec<String> {
        ["sts", "get-caller-identity", "--output", "json"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: String,
}

/// [`CloudAccountResolver`] that shells out to the AWS CLI.
#[derive(Debug, Clone)]
pub struct AwsCliAccountResolver {
    args: CallerIdentityArgs,
}

impl Default for AwsCliAccountResolver {
    fn default() -> Self {
        Self::new("aws")
    }
}

impl AwsCliAccountResolver {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            args: CallerIdentityArgs {
                binary: binary.into(),
            },
        }
    }
}

impl CloudAccountResolver for AwsCliAccountResolver {
    fn account_id(&self) -> Result<String> {
        let output = run_command_safe(&self.args)?;
        output.ensure_success("aws sts get-caller-identity")?;
        let account = parse_account_id(&output.stdout)?;
        info!("Resolved account id {}", account);
        Ok(account)
    }
}

/// Extract the `Account` field from `get-caller-identity` JSON.
pub fn parse_account_id(json: &str) -> Result<String> {
    let identity: CallerIdentity = serde_json::from_str(json.trim())?;
    if identity.account.is_empty() {
        return Err(HarnessError::provisioner("caller identity has an empty Account"));
    }
    Ok(identity.account)
}

/// How a scenario picks its region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RegionPolicy {
    /// Always this region (global services such as CloudFront need us-east-1)
    Fixed { region: String },
    /// Any approved region that is not forbidden
    Random {
        approved: Vec<String>,
        #[serde(default)]
        forbidden: Vec<String>,
    },
}

impl Default for RegionPolicy {
    fn default() -> Self {
        RegionPolicy::Fixed {
            region: "us-east-1".to_string(),
        }
    }
}

impl RegionPolicy {
    pub fn fixed(region: impl Into<String>) -> Self {
        RegionPolicy::Fixed {
            region: region.into(),
        }
    }

    /// Candidate regions after exclusions, in declaration order
    pub fn candidates(&self) -> Vec<&str> {
        match self {
            RegionPolicy::Fixed { region } => vec![region.as_str()],
            RegionPolicy::Random {
                approved,
                forbidden,
            } => approved
                .iter()
                .filter(|r| !forbidden.contains(r))
                .map(String::as_str)
                .collect(),
        }
    }

    /// Pick a region.
    ///
    /// # Errors
    ///
    /// `Config` if exclusions leave no candidate.
    pub fn pick(&self) -> Result<String> {
        let candidates = self.candidates();
        let region = candidates
            .choose(&mut rand::thread_rng())
            .filter(|r| !r.is_empty())
            .ok_or_else(|| HarnessError::config(format!("No region left to pick from {:?}", self)))?;
        debug!("Picked region {}", region);
        Ok(region.to_string())
    }
}
