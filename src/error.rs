//! Error handling module for stagecheck
//!
//! Provides centralized error handling with proper error types using thiserror.
//! Every failure a scenario can report flows through `HarnessError` so the
//! top-level report can name the stage, the expected value and the observed one.
//!
//! Skipping a stage is not an error; it shows up as `StageOutcome::Skipped`.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for stagecheck
#[derive(Error, Debug)]
pub enum HarnessError {
    /// A stage body returned an error; forward progress for the scenario stops
    #[error("Stage '{stage}' failed: {source}")]
    StageFailure {
        stage: String,
        #[source]
        source: Box<HarnessError>,
    },

    /// A stage body panicked
    #[error("Stage '{stage}' panicked: {message}")]
    Panicked { stage: String, message: String },

    /// Persisted state read before it was written, or from a missing working directory
    #[error("No persisted value '{key}' under {dir:?}")]
    NotFound { dir: PathBuf, key: String },

    /// The retry ceiling was reached without the probe succeeding
    #[error("'{description}' unsuccessful after {attempts} attempts: {last_error}")]
    RetryExhausted {
        description: String,
        attempts: u32,
        last_error: String,
    },

    /// A plan after apply reported pending changes
    #[error("Expected no pending changes but plan exited with code {exit_code}")]
    DriftDetected { exit_code: i32 },

    /// Endpoint returned the expected status but not the expected content
    #[error("URL {url} did not contain expected text '{expected}'. Instead, it returned:\n{body}")]
    BodyMismatch {
        url: String,
        expected: String,
        body: String,
    },

    /// Endpoint response lacked an expected header value
    #[error("URL {url} expected header {header}: {expected:?} but observed {observed:?}")]
    HeaderMismatch {
        url: String,
        header: String,
        expected: String,
        observed: Vec<String>,
    },

    /// Provisioning backend errors (command failures, missing outputs)
    #[error("Provisioner error: {0}")]
    Provisioner(String),

    /// HTTP probe transport errors
    #[error("Probe error: {0}")]
    Probe(String),

    /// Configuration errors (loading, parsing, validation)
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors (state files, module copies, child processes)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for stagecheck operations
pub type Result<T> = std::result::Result<T, HarnessError>;

// Convenient error constructors
impl HarnessError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a provisioner error
    pub fn provisioner(msg: impl Into<String>) -> Self {
        Self::Provisioner(msg.into())
    }

    /// Create a probe error
    pub fn probe(msg: impl Into<String>) -> Self {
        Self::Probe(msg.into())
    }

    /// Create a not-found error for a persisted key
    pub fn not_found(dir: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self::NotFound {
            dir: dir.into(),
            key: key.into(),
        }
    }

    /// Wrap an error as the failure of the named stage
    pub fn stage_failure(stage: impl Into<String>, source: HarnessError) -> Self {
        Self::StageFailure {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// The innermost error, looking through `StageFailure` wrappers
    pub fn root_cause(&self) -> &HarnessError {
        match self {
            Self::StageFailure { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Returns true if this error (or the one it wraps) is a missing persisted value
    pub fn is_not_found(&self) -> bool {
        matches!(self.root_cause(), Self::NotFound { .. })
    }

    /// Returns true if this error (or the one it wraps) signals a pending-changes regression
    pub fn is_drift(&self) -> bool {
        matches!(self.root_cause(), Self::DriftDetected { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = HarnessError::config("stages_dir must not be empty");
        assert_eq!(
            err.to_string(),
            "Configuration error: stages_dir must not be empty"
        );

        let err = HarnessError::DriftDetected { exit_code: 2 };
        assert_eq!(
            err.to_string(),
            "Expected no pending changes but plan exited with code 2"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: HarnessError = io_err.into();
        assert!(matches!(err, HarnessError::Io(_)));
    }

    #[test]
    fn test_stage_failure_exposes_root_cause() {
        let err = HarnessError::stage_failure("apply", HarnessError::DriftDetected { exit_code: 2 });
        assert!(err.is_drift());
        assert!(!err.is_not_found());
        assert!(err.to_string().starts_with("Stage 'apply' failed"));

        let err = HarnessError::stage_failure(
            "validate",
            HarnessError::not_found("stages/web", "uniqueID"),
        );
        assert!(err.is_not_found());
    }
}
