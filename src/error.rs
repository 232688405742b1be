// src/error.rs

//! Error types for lambda-packager
//!
//! Fatal conditions (missing backend, failed subprocess, ambiguous project,
//! unsupported platform) surface as [`Error`]. Recoverable conditions such
//! as a failed ignore-list fetch or a missing strip tool are logged where
//! they happen and never reach the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// A required external package manager is not on PATH
    #[error("{tool} not found, please install it and add it to PATH{hint}")]
    BackendNotFound { tool: String, hint: String },

    /// An external command exited with a non-zero status
    #[error("command `{program} {}` failed with exit code {code:?}", .args.join(" "))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    /// Both or neither of pyproject.toml and requirements.txt exist
    #[error("ambiguous project type in {}: expected exactly one of pyproject.toml or requirements.txt", .0.display())]
    AmbiguousProjectKind(PathBuf),

    /// Interpreter version / architecture pair is not a supported runtime
    #[error("{architecture} python{python_version} is not a supported runtime")]
    UnsupportedPlatform {
        python_version: String,
        architecture: String,
    },

    #[error("unknown architecture: {0}")]
    UnknownArchitecture(String),

    #[error("invalid python version: {0}")]
    InvalidPythonVersion(String),

    /// No strip binary could be located for the target architecture
    #[error("could not find a strip binary for {architecture}{hint}")]
    StripToolNotFound { architecture: String, hint: String },

    /// Manifest or lockfile content could not be interpreted
    #[error("manifest error: {0}")]
    ManifestError(String),

    /// Invalid option combination or configuration value
    #[error("configuration error: {0}")]
    Config(String),

    #[error("download error: {0}")]
    DownloadError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("directory walk error: {0}")]
    WalkDir(#[from] walkdir::Error),
}

impl Error {
    /// Create a manifest error from any message
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::ManifestError(msg.into())
    }

    /// Captured stdout/stderr for command failures
    pub fn captured_output(&self) -> Option<(&str, &str)> {
        match self {
            Self::CommandFailed { stdout, stderr, .. } => Some((stdout, stderr)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failed_display() {
        let err = Error::CommandFailed {
            program: "pip".to_string(),
            args: vec!["install".to_string(), "boto3".to_string()],
            code: Some(1),
            stdout: "out".to_string(),
            stderr: "err".to_string(),
        };
        assert_eq!(err.to_string(), "command `pip install boto3` failed with exit code Some(1)");
        assert_eq!(err.captured_output(), Some(("out", "err")));
    }

    #[test]
    fn test_ambiguous_project_display() {
        let err = Error::AmbiguousProjectKind(PathBuf::from("/tmp/proj"));
        assert!(err.to_string().contains("/tmp/proj"));
        assert!(err.captured_output().is_none());
    }
}
