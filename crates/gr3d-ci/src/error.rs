//! Error types for gr3d-ci

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while acquiring dependencies, driving the runtime,
/// or comparing reports.
#[derive(Error, Debug)]
pub enum CiError {
    /// Target identifier outside the enumerated set
    #[error("invalid target '{target}', valid targets are: {valid}")]
    InvalidTarget { target: String, valid: String },

    /// URL has no final path segment to name the cached file after
    #[error("couldn't determine file name from url: {0}")]
    InvalidUrl(String),

    /// Network fetch failed
    #[error("fetch of {url} failed: {reason}")]
    Fetch { url: String, reason: String },

    /// Archive extraction failed
    #[error("extracting {archive:?} into {dest:?} failed: {reason}")]
    Extraction {
        archive: PathBuf,
        dest: PathBuf,
        reason: String,
    },

    /// A dependency expected in the cache is not there
    #[error("dependency not found in cache: {0:?}")]
    MissingDependency(PathBuf),

    /// The export step failed or produced nothing
    #[error("build for {target} failed: {reason}")]
    Build { target: String, reason: String },

    /// The test binary exited non-zero
    #[error("test run for {target} exited with code {exit_code}")]
    TestExecution { target: String, exit_code: i32 },

    /// An artifact the next step depends on is missing
    #[error("artifact not found: {0:?}")]
    MissingArtifact(PathBuf),

    /// Report has no hash-table header line
    #[error("report {path:?} has no '{marker}' header line")]
    MalformedReport { path: PathBuf, marker: String },

    /// Child process could not be started
    #[error("failed to spawn '{program}': {reason}")]
    Spawn { program: String, reason: String },

    /// The diff collaborator failed
    #[error("diff of {a:?} and {b:?} failed: {reason}")]
    Diff { a: PathBuf, b: PathBuf, reason: String },

    /// Whole-invocation budget exhausted
    #[error("watchdog expired after {0} seconds")]
    Watchdog(u64),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for CiError {
    fn from(err: reqwest::Error) -> Self {
        CiError::Fetch {
            url: err
                .url()
                .map(|u| u.to_string())
                .unwrap_or_else(|| "<unknown>".to_string()),
            reason: err.to_string(),
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, CiError>;
