// src/analyzer/workspace.rs

//! Scratch directories owned by one analyzer
//!
//! - [`Workspace`]: private copy of the manifest files; backends mutate this
//!   copy and the analyzer copies results back into the project.
//! - [`InstallTarget`]: staging directory that accumulates the installed
//!   dependencies and the project's own code.
//!
//! Both are released by an explicit, idempotent `close()`.

use crate::error::Result;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// A temporary directory that can be closed early and more than once
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
    dir: Option<TempDir>,
}

impl ScratchDir {
    pub fn new(prefix: &str) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix(prefix).tempdir()?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            dir: Some(dir),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.dir.is_none()
    }

    /// Remove the directory; later calls do nothing
    pub fn close(&mut self) -> Result<()> {
        if let Some(dir) = self.dir.take() {
            debug!("Removing scratch directory {}", self.path.display());
            dir.close()?;
        }
        Ok(())
    }
}

/// Private copy of the project's manifest files
#[derive(Debug)]
pub struct Workspace {
    project_root: PathBuf,
    scratch: ScratchDir,
}

impl Workspace {
    /// Copy whichever of `files` exist in the project into a fresh workspace
    pub fn new(project_root: &Path, files: &[&str]) -> Result<Self> {
        let scratch = ScratchDir::new("lambda-packager-proj-")?;
        let workspace = Self {
            project_root: project_root.to_path_buf(),
            scratch,
        };
        workspace.refresh(files)?;
        Ok(workspace)
    }

    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.scratch.path().join(name)
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    /// Copy workspace files back over the project's originals
    pub fn copy_back(&self, files: &[&str]) -> Result<()> {
        for name in files {
            let src = self.file(name);
            if src.exists() {
                info!("Updating {}", self.project_root.join(name).display());
                fs::copy(&src, self.project_root.join(name))?;
            }
        }
        Ok(())
    }

    /// Discard workspace edits by copying the project's originals in again
    pub fn refresh(&self, files: &[&str]) -> Result<()> {
        for name in files {
            let src = self.project_root.join(name);
            if src.exists() {
                fs::copy(&src, self.file(name))?;
            }
        }
        Ok(())
    }

    /// Back up the project's copies of `files` with a UTC timestamp
    pub fn backup_files(&self, files: &[&str]) -> Result<Vec<PathBuf>> {
        backup_files_at(&self.project_root, files, Utc::now())
    }

    pub fn close(&mut self) -> Result<()> {
        self.scratch.close()
    }
}

/// `requirements.txt` -> `requirements.2022-01-31T12-00-00Z.txt`
pub fn backup_name(path: &Path, when: DateTime<Utc>) -> PathBuf {
    let stamp = when.format("%Y-%m-%dT%H-%M-%SZ");
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{stamp}.{}", ext.to_string_lossy()),
        None => format!("{stem}.{stamp}"),
    };
    path.with_file_name(name)
}

pub(crate) fn backup_files_at(root: &Path, files: &[&str], when: DateTime<Utc>) -> Result<Vec<PathBuf>> {
    let mut created = Vec::new();
    for name in files {
        let original = root.join(name);
        if !original.exists() {
            continue;
        }
        let backup = backup_name(&original, when);
        info!("Backing up {} to {}", original.display(), backup.display());
        fs::copy(&original, &backup)?;
        created.push(backup);
    }
    Ok(created)
}

/// Staging directory for installed packages and project code
#[derive(Debug)]
pub struct InstallTarget {
    scratch: ScratchDir,
}

impl InstallTarget {
    pub fn new() -> Result<Self> {
        Ok(Self {
            scratch: ScratchDir::new("lambda-packager-target-")?,
        })
    }

    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn close(&mut self) -> Result<()> {
        self.scratch.close()
    }
}
