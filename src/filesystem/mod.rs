// src/filesystem/mod.rs

//! Filesystem operations on package trees
//!
//! This module provides:
//! - Recursive copy and cross-device-safe move of package trees
//! - Total size accounting and human-readable size formatting
//! - Modification time normalization for reproducible archives
//! - Top-level entry listing used for the layer/main split

use crate::error::Result;
use filetime::FileTime;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Fixed modification time applied to every file before archiving
/// (2020-01-01T01:01:00Z)
pub const NORMALIZED_MTIME_UNIX: i64 = 1_577_840_460;

/// The fixed normalization time as a [`FileTime`]
pub fn normalized_mtime() -> FileTime {
    FileTime::from_unix_time(NORMALIZED_MTIME_UNIX, 0)
}

/// Recursively copy `src` into `dst`, creating `dst` if needed
///
/// Existing files in `dst` are overwritten. Symlinks are recreated rather
/// than followed. Returns the number of files copied.
pub fn copy_dir_all(src: &Path, dst: &Path) -> Result<u64> {
    fs::create_dir_all(dst)?;
    let mut copied = 0u64;

    for entry in WalkDir::new(src).min_depth(1).follow_links(false) {
        let entry = entry?;
        let relative = entry.path().strip_prefix(src).map_err(std::io::Error::other)?;
        let target = dst.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            copied += 1;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }

    debug!("Copied {} files from {} to {}", copied, src.display(), dst.display());
    Ok(copied)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let link = fs::read_link(src)?;
    if dst.symlink_metadata().is_ok() {
        remove_path(dst)?;
    }
    std::os::unix::fs::symlink(link, dst)?;
    Ok(())
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    fs::copy(src, dst)?;
    Ok(())
}

/// Copy a single file or a whole directory
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if src.is_dir() {
        copy_dir_all(src, dst)?;
    } else {
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(src, dst)?;
    }
    Ok(())
}

/// Move a file or directory, falling back to copy + delete across devices
pub fn move_path(src: &Path, dst: &Path) -> Result<()> {
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)?;
    }
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(e) => {
            debug!("rename {} -> {} failed ({}), copying instead", src.display(), dst.display(), e);
            copy_path(src, dst)?;
            remove_path(src)
        }
    }
}

/// Remove a file, symlink or directory tree; missing paths are not an error
pub fn remove_path(path: &Path) -> Result<()> {
    let meta = match path.symlink_metadata() {
        Ok(meta) => meta,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if meta.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(())
}

/// Total size in bytes of all regular files below `path`
pub fn dir_size(path: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            total += entry.metadata()?.len();
        }
    }
    Ok(total)
}

/// Set the access and modification time of every file below `path`
pub fn set_tree_mtime(path: &Path, time: FileTime) -> Result<u64> {
    let mut touched = 0u64;
    for entry in WalkDir::new(path).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            filetime::set_file_times(entry.path(), time, time)?;
            touched += 1;
        }
    }
    debug!("Normalized mtime of {} files under {}", touched, path.display());
    Ok(touched)
}

/// Names of the entries directly inside `dir`
pub fn top_level_entries(dir: &Path) -> Result<BTreeSet<OsString>> {
    let mut names = BTreeSet::new();
    if !dir.exists() {
        warn!("{} does not exist, no entries recorded", dir.display());
        return Ok(names);
    }
    for entry in fs::read_dir(dir)? {
        names.insert(entry?.file_name());
    }
    Ok(names)
}

/// Format a byte count with binary units, e.g. `12.3MiB`
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["", "Ki", "Mi", "Gi", "Ti", "Pi"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value.abs() < 1024.0 {
            return format!("{:.1}{}B", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.1}EiB", value)
}

/// `part` as a percentage of `whole`, 100% when `whole` is empty
pub fn percent_of(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        100.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
