// src/packager/archive.rs

//! Deterministic zip archives
//!
//! Entries are written in sorted path order with a fixed timestamp and
//! fixed permissions, so the same tree always produces the same bytes.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

fn entry_options() -> Result<SimpleFileOptions> {
    let timestamp = zip::DateTime::from_date_and_time(2020, 1, 1, 1, 1, 0)
        .map_err(|e| Error::Io(std::io::Error::other(format!("invalid archive timestamp: {e}"))))?;
    Ok(SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .compression_level(Some(9))
        .last_modified_time(timestamp)
        .unix_permissions(0o644))
}

/// Zip every regular file below `root` into `zip_path`
///
/// Entry names are relative to `root` and use `/` separators. If the
/// archive is being written inside `root`, it is not included in itself.
/// Returns the number of entries written.
pub fn zip_tree(root: &Path, zip_path: &Path) -> Result<usize> {
    info!("Zipping {} to {}", root.display(), zip_path.display());
    if let Some(parent) = zip_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let options = entry_options()?;
    let absolute_zip = std::path::absolute(zip_path)?;

    let mut zip = ZipWriter::new(File::create(zip_path)?);
    let mut entries = 0;
    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        if std::path::absolute(entry.path())? == absolute_zip {
            continue;
        }
        let relative = entry.path().strip_prefix(root).map_err(std::io::Error::other)?;
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        zip.write_all(&fs::read(entry.path())?)?;
        entries += 1;
    }
    zip.finish()?;

    debug!("Wrote {} entries to {}", entries, zip_path.display());
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use filetime::FileTime;
    use std::io::Read;
    use tempfile::TempDir;

    fn populate(root: &Path) {
        fs::create_dir_all(root.join("pkg/sub")).unwrap();
        fs::write(root.join("pkg/__init__.py"), b"VERSION = 1\n").unwrap();
        fs::write(root.join("pkg/sub/data.txt"), b"payload").unwrap();
        fs::write(root.join("handler.py"), b"def handler(e, c):\n    return e\n").unwrap();
    }

    #[test]
    fn test_zip_entries_sorted_and_relative() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        populate(&tree);
        let zip_path = tmp.path().join("out.zip");

        assert_eq!(zip_tree(&tree, &zip_path).unwrap(), 3);

        let mut archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        let names: Vec<String> = (0..archive.len())
            .map(|i| archive.by_index(i).unwrap().name().to_string())
            .collect();
        assert_eq!(names, vec!["handler.py", "pkg/__init__.py", "pkg/sub/data.txt"]);

        let mut content = String::new();
        archive.by_name("pkg/sub/data.txt").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "payload");
    }

    #[test]
    fn test_zip_is_reproducible() {
        let tmp = TempDir::new().unwrap();
        let tree = tmp.path().join("tree");
        populate(&tree);

        zip_tree(&tree, &tmp.path().join("a.zip")).unwrap();
        // disturb mtimes; output must not change
        filetime::set_file_mtime(tree.join("handler.py"), FileTime::from_unix_time(1_700_000_000, 0)).unwrap();
        zip_tree(&tree, &tmp.path().join("b.zip")).unwrap();

        assert_eq!(
            fs::read(tmp.path().join("a.zip")).unwrap(),
            fs::read(tmp.path().join("b.zip")).unwrap()
        );
    }

    #[test]
    fn test_zip_inside_tree_skips_itself() {
        let tmp = TempDir::new().unwrap();
        populate(tmp.path());
        let zip_path = tmp.path().join("bundle.zip");

        assert_eq!(zip_tree(tmp.path(), &zip_path).unwrap(), 3);
        let archive = zip::ZipArchive::new(File::open(&zip_path).unwrap()).unwrap();
        assert!(archive.file_names().all(|n| n != "bundle.zip"));
    }
}
