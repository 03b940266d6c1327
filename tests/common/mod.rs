//! Hand-written collaborators shared by the integration tests.
//!
//! Nothing here talks to a cloud: the provisioner records what it was asked
//! to do, the probe replays canned responses, and identifiers are fixed.

#![allow(dead_code)]

use serde_json::Value;
use stagecheck::config::{HarnessConfig, RunConfiguration};
use stagecheck::error::{HarnessError, Result};
use stagecheck::identity::{CloudAccountResolver, IdGenerator};
use stagecheck::probe::{HttpProbe, HttpResponse};
use stagecheck::provisioner::{Outputs, ProvisionOptions, Provisioner};
use stagecheck::retry::RetryBudget;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;

pub const ACCOUNT_ID: &str = "123456789012";

/// Provisioner fake that records every call.
#[derive(Debug, Default)]
pub struct RecordingProvisioner {
    pub applies: AtomicUsize,
    pub plans: AtomicUsize,
    pub destroys: AtomicUsize,
    /// Options passed to each apply, in order
    pub applied: Mutex<Vec<ProvisionOptions>>,
    /// `main.tf` in the module directory at each apply
    pub applied_sources: Mutex<Vec<String>>,
    /// Options passed to each destroy, in order
    pub destroyed: Mutex<Vec<ProvisionOptions>>,
    /// Exit code every plan returns
    pub plan_code: i32,
    /// Fail the n-th apply (1-based)
    pub fail_apply_at: Option<usize>,
    /// Panic in the n-th apply (1-based)
    pub panic_apply_at: Option<usize>,
    pub fail_destroy: bool,
    pub outputs: Outputs,
}

impl RecordingProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(mut self, key: &str, value: Value) -> Self {
        self.outputs.insert(key.to_string(), value);
        self
    }

    pub fn with_plan_code(mut self, code: i32) -> Self {
        self.plan_code = code;
        self
    }

    pub fn failing_apply_at(mut self, n: usize) -> Self {
        self.fail_apply_at = Some(n);
        self
    }

    pub fn panicking_apply_at(mut self, n: usize) -> Self {
        self.panic_apply_at = Some(n);
        self
    }

    pub fn failing_destroy(mut self) -> Self {
        self.fail_destroy = true;
        self
    }

    pub fn destroy_count(&self) -> usize {
        self.destroys.load(Ordering::SeqCst)
    }

    pub fn apply_count(&self) -> usize {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn applied_options(&self) -> Vec<ProvisionOptions> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_sources(&self) -> Vec<String> {
        self.applied_sources.lock().unwrap().clone()
    }
}

impl Provisioner for RecordingProvisioner {
    fn init_and_apply(&self, options: &ProvisionOptions) -> Result<Outputs> {
        let n = self.applies.fetch_add(1, Ordering::SeqCst) + 1;
        self.applied.lock().unwrap().push(options.clone());
        let main_tf = fs::read_to_string(options.module_dir.join("main.tf")).unwrap_or_default();
        self.applied_sources.lock().unwrap().push(main_tf);
        if self.panic_apply_at == Some(n) {
            panic!("terraform apply crashed");
        }
        if self.fail_apply_at == Some(n) {
            return Err(HarnessError::provisioner("terraform apply failed (exit code 1): boom"));
        }
        Ok(self.outputs.clone())
    }

    fn plan_exit_code(&self, _options: &ProvisionOptions) -> Result<i32> {
        self.plans.fetch_add(1, Ordering::SeqCst);
        Ok(self.plan_code)
    }

    fn destroy(&self, options: &ProvisionOptions) -> Result<()> {
        self.destroys.fetch_add(1, Ordering::SeqCst);
        self.destroyed.lock().unwrap().push(options.clone());
        if self.fail_destroy {
            return Err(HarnessError::provisioner("terraform destroy failed (exit code 1): locked"));
        }
        Ok(())
    }

    fn output_list(&self, _options: &ProvisionOptions, key: &str) -> Result<Vec<String>> {
        Ok(self
            .outputs
            .get(key)
            .map(stagecheck::provisioner::value_to_strings)
            .unwrap_or_default())
    }

    fn output_required(&self, _options: &ProvisionOptions, key: &str) -> Result<String> {
        match self.outputs.get(key) {
            Some(value) => Ok(stagecheck::provisioner::scalar_to_string(value)),
            None => Err(HarnessError::provisioner(format!("Output {} was empty", key))),
        }
    }
}

/// Probe that returns the same response for every URL.
#[derive(Debug)]
pub struct StaticProbe {
    pub response: HttpResponse,
    pub requests: Mutex<Vec<String>>,
}

impl StaticProbe {
    pub fn new(status: u16, body: &str) -> Self {
        Self {
            response: HttpResponse::new(status, body),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

impl HttpProbe for StaticProbe {
    fn get(&self, url: &str) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(url.to_string());
        Ok(self.response.clone())
    }
}

/// Probe that panics, standing in for a bug in a validation step.
#[derive(Debug)]
pub struct PanickingProbe;

impl HttpProbe for PanickingProbe {
    fn get(&self, _url: &str) -> Result<HttpResponse> {
        panic!("probe exploded")
    }
}

/// Hands out ids from a list, then repeats the last one.
#[derive(Debug)]
pub struct SequenceIds {
    ids: Vec<&'static str>,
    next: AtomicUsize,
}

impl SequenceIds {
    pub fn new(ids: &[&'static str]) -> Self {
        Self {
            ids: ids.to_vec(),
            next: AtomicUsize::new(0),
        }
    }

    pub fn issued(&self) -> usize {
        self.next.load(Ordering::SeqCst)
    }
}

impl IdGenerator for SequenceIds {
    fn unique_id(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.ids[n.min(self.ids.len() - 1)].to_string()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FixedAccount;

impl CloudAccountResolver for FixedAccount {
    fn account_id(&self) -> Result<String> {
        Ok(ACCOUNT_ID.to_string())
    }
}

/// A throwaway module repository plus a stages directory.
pub struct Sandbox {
    pub dir: TempDir,
}

impl Sandbox {
    /// Repository with `examples/<name>/main.tf` for each example and a
    /// shared `modules/website` module.
    pub fn new(examples: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = dir.path().join("repo");
        fs::create_dir_all(repo.join("modules/website")).unwrap();
        fs::write(repo.join("modules/website/main.tf"), "variable \"name\" {}\n").unwrap();
        for example in examples {
            let example_dir = repo.join("examples").join(example);
            fs::create_dir_all(&example_dir).unwrap();
            fs::write(
                example_dir.join("main.tf"),
                "module \"website\" {\n  source = \"../../modules/website\"\n}\n",
            )
            .unwrap();
        }
        Self { dir }
    }

    pub fn repo_root(&self) -> PathBuf {
        self.dir.path().join("repo")
    }

    pub fn stages_dir(&self) -> PathBuf {
        self.dir.path().join("stages")
    }

    /// Harness settings with no waiting between attempts
    pub fn config(&self) -> HarnessConfig {
        HarnessConfig {
            stages_dir: self.stages_dir(),
            initial_budget: RetryBudget::new(3, Duration::ZERO),
            steady_budget: RetryBudget::new(2, Duration::ZERO),
            ..HarnessConfig::default()
        }
    }
}

pub fn skipping(stages: &[&str]) -> RunConfiguration {
    stages
        .iter()
        .fold(RunConfiguration::new(), |config, stage| config.skip(stage))
}

pub fn stage_names(records: &[stagecheck::stage::StageRecord]) -> Vec<&str> {
    records.iter().map(|r| r.name.as_str()).collect()
}

pub fn is_copy_of(copy: &Path, example: &str) -> bool {
    copy.ends_with(Path::new("examples").join(example)) && copy.join("main.tf").exists()
}
