// src/error.rs

//! Error types for the deployment engine
//!
//! Every failure is recoverable at the driver level and surfaces as a
//! non-zero exit code. The driver wraps deeper failures in `Blocking` so
//! the CLI prints one outer frame plus the underlying cause.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

/// Deployment engine errors
#[derive(Error, Debug)]
pub enum Error {
    /// No project file found walking upward from the working directory
    #[error("no project file ({}) found in {} or any parent directory", crate::config::PROJECT_FILE, .start.display())]
    NoProject { start: PathBuf },

    /// A config file, or a release/feature/task reference inside one, is invalid
    #[error("failed to parse {}: {}", .path.display(), .reason)]
    ConfigParse { path: PathBuf, reason: String },

    /// Baseline walk reached a release with no baseline and no backups
    #[error("release '{0}' has no baseline and no usable backups")]
    NoBaseline(String),

    /// A baseline name does not resolve to a known release
    #[error("unknown release: {0}")]
    UnknownRelease(String),

    /// A release references a feature that was never loaded
    #[error("unknown feature: {0}")]
    UnknownFeature(String),

    /// A recipe uses a task kind that is neither builtin nor defined
    #[error("unknown task kind: {0}")]
    UnknownTask(String),

    /// `--resume` was given but there is no resume file
    #[error("resume requested but {} does not exist", .0.display())]
    ResumeMissing(PathBuf),

    /// The resume record does not parse, or no leaf reproduces its hash
    #[error("invalid resume point: {0:?}")]
    ResumeInvalid(String),

    /// The requirements pass recorded at least one failure
    #[error("command aborted due to unmet requirements")]
    UnmetRequirements,

    /// A SQL subprocess exited non-zero
    #[error("SQL execution failed with exit code {code}: {stderr}")]
    SqlFailure { code: i32, stderr: String },

    /// A string is not a valid hex state hash
    #[error("invalid state hash: {0:?}")]
    InvalidHash(String),

    /// Variable substitution referenced an undefined name
    #[error("undefined variable: {0}")]
    Variable(String),

    /// File-system error during copy/restore/backup
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Driver-level wrapper around any deeper failure
    #[error("blocking error detected")]
    Blocking(#[source] Box<Error>),
}

impl Error {
    /// Build a `ConfigParse` error for a file and reason
    pub fn config_parse(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::ConfigParse {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Wrap this error in the driver-level `Blocking` frame
    pub fn blocking(self) -> Self {
        Self::Blocking(Box::new(self))
    }
}
