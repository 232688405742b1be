// src/packager/layer.rs

//! Layer/main split
//!
//! Top-level entries that came from the dependency install go to a layer
//! tree, everything else (the project's own code) to the main tree. The
//! two trees are disjoint and together hold exactly what the output held.

use crate::error::Result;
use crate::filesystem;
use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Directory name of the layer tree inside the output
pub const LAYER_DIR: &str = "layer";
/// Directory name of the function tree inside the output
pub const MAIN_DIR: &str = "main";

/// Result of a split: `output/main` and `output/layer`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitOutput {
    pub main_dir: PathBuf,
    pub layer_dir: PathBuf,
}

/// Reorganize `output_dir` into `main/` and `layer/`
///
/// Entries are first moved into scratch directories beside the output so
/// that names like `main` or `layer` in the package tree cannot collide
/// with the destination directories.
pub fn split_layer(output_dir: &Path, layer_entries: &BTreeSet<OsString>) -> Result<SplitOutput> {
    warn!("Splitting layer and main package");
    let scratch_root = output_dir.parent().unwrap_or(Path::new("."));
    let main_tmp = tempfile::Builder::new().prefix("lambda-main-").tempdir_in(scratch_root)?;
    let layer_tmp = tempfile::Builder::new().prefix("lambda-layer-").tempdir_in(scratch_root)?;

    let mut moved = (0usize, 0usize);
    for entry in fs::read_dir(output_dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let to_layer = layer_entries.contains(&name);
        let destination = if to_layer {
            moved.1 += 1;
            layer_tmp.path().join(&name)
        } else {
            moved.0 += 1;
            main_tmp.path().join(&name)
        };
        debug!("{} -> {}", name.to_string_lossy(), if to_layer { LAYER_DIR } else { MAIN_DIR });
        filesystem::move_path(&entry.path(), &destination)?;
    }

    let split = SplitOutput {
        main_dir: output_dir.join(MAIN_DIR),
        layer_dir: output_dir.join(LAYER_DIR),
    };
    filesystem::move_path(main_tmp.path(), &split.main_dir)?;
    filesystem::move_path(layer_tmp.path(), &split.layer_dir)?;
    debug!("Split {} main entries and {} layer entries", moved.0, moved.1);
    Ok(split)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    fn files(root: &Path) -> BTreeSet<PathBuf> {
        WalkDir::new(root)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
            .collect()
    }

    #[test]
    fn test_split_is_a_partition() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("build");
        for file in ["boto3/__init__.py", "boto3-1.20.32.dist-info/METADATA", "handler.py", "main/app.py"] {
            let path = output.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, file).unwrap();
        }
        let before = files(&output);
        let layer: BTreeSet<OsString> = ["boto3", "boto3-1.20.32.dist-info"].into_iter().map(OsString::from).collect();

        let split = split_layer(&output, &layer).unwrap();

        let main_files = files(&split.main_dir);
        let layer_files = files(&split.layer_dir);
        assert!(main_files.is_disjoint(&layer_files));
        let union: BTreeSet<PathBuf> = main_files.union(&layer_files).cloned().collect();
        assert_eq!(union, before);
        assert!(layer_files.contains(Path::new("boto3/__init__.py")));
        assert!(main_files.contains(Path::new("main/app.py")));
        assert_eq!(fs::read_to_string(split.main_dir.join("handler.py")).unwrap(), "handler.py");

        let top: BTreeSet<OsString> = fs::read_dir(&output).unwrap().map(|e| e.unwrap().file_name()).collect();
        assert_eq!(top, [MAIN_DIR, LAYER_DIR].into_iter().map(OsString::from).collect());
    }

    #[test]
    fn test_split_with_no_layer_entries() {
        let tmp = TempDir::new().unwrap();
        let output = tmp.path().join("build");
        fs::create_dir_all(&output).unwrap();
        fs::write(output.join("handler.py"), "").unwrap();

        let split = split_layer(&output, &BTreeSet::new()).unwrap();
        assert!(split.main_dir.join("handler.py").exists());
        assert!(split.layer_dir.is_dir());
        assert_eq!(fs::read_dir(&split.layer_dir).unwrap().count(), 0);
    }
}
