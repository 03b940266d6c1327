//! Persisted per-scenario scratch state.
//!
//! A stage that runs in one process writes identifiers (unique id, region,
//! account id, module copy path, the full provisioning options) so that a
//! later stage, possibly in a later invocation with earlier stages skipped,
//! reads back exactly the same values.
//!
//! # Layout
//!
//! ```text
//! <working_dir>/
//!   .test-data/
//!     uniqueID.json
//!     awsRegion.json
//!     ProvisionOptions.json
//! ```
//!
//! Each value is one JSON document. Writes go to a temporary file in the same
//! directory, are synced, then renamed into place, so a reader never observes
//! a partial value and a value is durable once `save` returns. Nothing here
//! deletes state except [`StateStore::cleanup`].

use crate::error::{HarnessError, Result};
use crate::provisioner::ProvisionOptions;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info};

/// Subdirectory of the working directory that holds persisted values
pub const DATA_DIR: &str = ".test-data";

/// Key under which the provisioning options bundle is stored
pub const OPTIONS_KEY: &str = "ProvisionOptions";

/// Key/value scratch state rooted at one scenario's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateStore {
    working_dir: PathBuf,
}

impl StateStore {
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Persist a string value under `key`.
    pub fn save(&self, key: &str, value: &str) -> Result<()> {
        self.save_json(key, value)
    }

    /// Read the string value stored under `key`.
    ///
    /// # Errors
    ///
    /// `NotFound` if the key was never written or the working directory does
    /// not exist.
    pub fn load(&self, key: &str) -> Result<String> {
        self.load_json(key)
    }

    /// Persist any serializable value under `key`.
    pub fn save_json<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.path_for(key)?;
        let data_dir = self.data_dir();
        fs::create_dir_all(&data_dir)?;

        let json = serde_json::to_vec_pretty(value)?;
        let mut tmp = NamedTempFile::new_in(&data_dir)?;
        tmp.write_all(&json)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| HarnessError::Io(e.error))?;
        sync_dir(&data_dir)?;

        info!("Storing {} in {:?}", key, path);
        Ok(())
    }

    /// Read a value previously written with [`StateStore::save_json`].
    pub fn load_json<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        let path = self.path_for(key)?;
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(HarnessError::not_found(&self.working_dir, key));
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Loaded {} from {:?}", key, path);
        Ok(serde_json::from_slice(&content)?)
    }

    /// Read `key`, or compute it with `init` and persist it if it was never
    /// written. Replayed runs observe the first run's value.
    pub fn load_or_save<T, F>(&self, key: &str, init: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T>,
    {
        match self.load_json(key) {
            Ok(value) => Ok(value),
            Err(HarnessError::NotFound { .. }) => {
                let value = init()?;
                self.save_json(key, &value)?;
                Ok(value)
            }
            Err(e) => Err(e),
        }
    }

    /// Persist the provisioning options bundle.
    pub fn save_options(&self, options: &ProvisionOptions) -> Result<()> {
        self.save_json(OPTIONS_KEY, options)
    }

    /// Read the provisioning options bundle.
    pub fn load_options(&self) -> Result<ProvisionOptions> {
        self.load_json(OPTIONS_KEY)
    }

    /// Returns true if `key` has been written
    pub fn contains(&self, key: &str) -> bool {
        self.path_for(key).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Keys currently persisted, sorted
    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.data_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut keys = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    /// Remove the whole working directory. Missing directories are fine.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.working_dir) {
            Ok(()) => {
                info!("Removed working directory {:?}", self.working_dir);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.working_dir.join(DATA_DIR)
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let valid = !key.is_empty()
            && key != "."
            && key != ".."
            && !key.contains(['/', '\\'])
            && !key.starts_with('.');
        if !valid {
            return Err(HarnessError::config(format!(
                "Invalid state key {:?}: keys must be plain file names",
                key
            )));
        }
        Ok(self.data_dir().join(format!("{}.json", key)))
    }
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<()> {
    File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[test]
    fn test_save_then_load_in_fresh_instance() {
        let dir = TempDir::new().unwrap();
        let working_dir = dir.path().join("TestS3StaticWebsite");

        StateStore::new(&working_dir)
            .save("uniqueID", "abc123")
            .expect("save");

        let fresh = StateStore::new(&working_dir);
        assert_eq!(fresh.load("uniqueID").unwrap(), "abc123");
        assert!(working_dir.join(DATA_DIR).join("uniqueID.json").is_file());
    }

    #[test]
    fn test_missing_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save("awsRegion", "us-east-1").unwrap();

        let err = store.load("uniqueID").unwrap_err();
        assert!(matches!(err, HarnessError::NotFound { ref key, .. } if key == "uniqueID"));
    }

    #[test]
    fn test_missing_working_dir_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path().join("never-created"));
        assert!(store.load("uniqueID").unwrap_err().is_not_found());
        assert!(store.load_options().unwrap_err().is_not_found());
        assert!(store.keys().unwrap().is_empty());
    }

    #[test]
    fn test_overwrite_keeps_latest_value() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save("accountID", "111111111111").unwrap();
        store.save("accountID", "222222222222").unwrap();
        assert_eq!(store.load("accountID").unwrap(), "222222222222");
    }

    #[test]
    fn test_options_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let options = ProvisionOptions::new("/tmp/copy/s3-static-website")
            .with_var("website_domain_name", "abc123.example.com")
            .with_var("create_route53_entry", true);

        store.save_options(&options).unwrap();
        assert_eq!(StateStore::new(dir.path()).load_options().unwrap(), options);
    }

    #[test]
    fn test_structured_values() {
        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Identifiers {
            unique_id: String,
            region: String,
        }

        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        let ids = Identifiers {
            unique_id: "x9k2pq".to_string(),
            region: "eu-west-1".to_string(),
        };
        store.save_json("identifiers", &ids).unwrap();
        assert_eq!(store.load_json::<Identifiers>("identifiers").unwrap(), ids);
    }

    #[test]
    fn test_keys_and_contains() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        store.save("uniqueID", "abc").unwrap();
        store.save("awsRegion", "us-east-1").unwrap();

        assert!(store.contains("uniqueID"));
        assert!(!store.contains("accountID"));
        assert_eq!(store.keys().unwrap(), vec!["awsRegion", "uniqueID"]);
    }

    #[test]
    fn test_load_or_save_initializes_once() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());

        let first: String = store
            .load_or_save("awsRegion", || Ok("eu-west-1".to_string()))
            .unwrap();
        let second: String = StateStore::new(dir.path())
            .load_or_save("awsRegion", || panic!("must not regenerate"))
            .unwrap();

        assert_eq!(first, "eu-west-1");
        assert_eq!(second, "eu-west-1");
    }

    #[test]
    fn test_rejects_path_like_keys() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::new(dir.path());
        for key in ["", "..", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(store.save(key, "v"), Err(HarnessError::Config(_))),
                "key {:?} should be rejected",
                key
            );
        }
    }

    #[test]
    fn test_cleanup_removes_everything_and_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let working_dir = dir.path().join("scenario");
        let store = StateStore::new(&working_dir);
        store.save("uniqueID", "abc").unwrap();

        store.cleanup().unwrap();
        assert!(!working_dir.exists());
        store.cleanup().unwrap();
    }
}
