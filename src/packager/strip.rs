// src/packager/strip.rs

//! Debug symbol removal from native libraries
//!
//! Shared objects are stripped with a binutils `strip` for the target
//! architecture. On x86_64 hosts the native `strip` is acceptable; arm64
//! targets need the cross binutils.

use crate::error::{Error, Result};
use crate::platform::Architecture;
use crate::process::{find_program, run_command, CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Strip binaries to try, in order
pub fn strip_candidates(arch: Architecture) -> &'static [&'static str] {
    match arch {
        Architecture::X86_64 => &["x86_64-linux-gnu-strip", "strip"],
        Architecture::Arm64 => &["aarch64-linux-gnu-strip"],
    }
}

/// Locate a strip binary usable for `arch`
pub fn find_strip_tool(runner: &dyn CommandRunner, arch: Architecture) -> Result<PathBuf> {
    find_program(runner, strip_candidates(arch)).ok_or_else(|| Error::StripToolNotFound {
        architecture: arch.to_string(),
        hint: format!(
            ", try installing it with 'apt-get install binutils-{}-linux-gnu'",
            arch.machine().replace('_', "-")
        ),
    })
}

/// `*.so` and versioned `*.so.N` files
pub fn is_shared_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.ends_with(".so") || name.contains(".so.")
}

/// Strip every shared library below `root`
///
/// Returns the number of libraries stripped. A missing tool is reported to
/// the caller; a library the tool rejects is only logged.
pub fn strip_libraries(runner: &dyn CommandRunner, root: &Path, arch: Architecture) -> Result<usize> {
    let tool = find_strip_tool(runner, arch)?;
    warn!("Stripping libraries");
    debug!("Using {}", tool.display());

    let mut stripped = 0;
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if !entry.file_type().is_file() || !is_shared_library(entry.path()) {
            continue;
        }
        if strip_library(runner, &tool, entry.path()) {
            stripped += 1;
        }
    }
    Ok(stripped)
}

fn strip_library(runner: &dyn CommandRunner, tool: &Path, library: &Path) -> bool {
    debug!("Stripping library \"{}\"", library.display());
    let spec = CommandSpec::new(tool).arg(library).quiet(true);
    match run_command(runner, &spec) {
        Ok(_) => true,
        Err(e) => {
            warn!("Failed to strip {}: {}", library.display(), e);
            false
        }
    }
}
