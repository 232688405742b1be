// src/packager/steps.rs

//! In-place optimization steps
//!
//! Each step walks the output tree and mutates it directly. Steps are
//! idempotent against the current disk state: running one twice removes or
//! rewrites nothing the first run did not.

use crate::error::Result;
use crate::platform::PythonVersion;
use crate::process::{probe_command, CommandRunner, CommandSpec};
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Source and header extensions that are never needed at runtime
pub const OTHER_FILE_EXTENSIONS: &[&str] = &["pyx", "pyi", "pxi", "pxd", "c", "h", "cc"];

/// Directory name marking test trees
const TEST_DIR: &str = "tests";

/// Regular files below `root`, collected before any mutation
fn files_under(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry?;
        if entry.file_type().is_file() {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn remove_matching(root: &Path, what: &str, matches: impl Fn(&Path, &Path) -> bool) -> Result<usize> {
    let mut removed = 0;
    for path in files_under(root)? {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if matches(&path, relative) {
            debug!("Stripping {} file {}", what, path.display());
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// Delete every file below a `tests` directory
pub fn strip_tests(root: &Path) -> Result<usize> {
    warn!("Stripping tests");
    remove_matching(root, "test", |_, relative| {
        relative
            .parent()
            .is_some_and(|dir| dir.components().any(|c| c == Component::Normal(OsStr::new(TEST_DIR))))
    })
}

/// Delete `.py` sources; only valid once bytecode exists
pub fn strip_python(root: &Path) -> Result<usize> {
    warn!("Stripping python scripts");
    remove_matching(root, "python", |path, _| has_extension(path, &["py"]))
}

/// Delete extension sources and headers
pub fn strip_other_files(root: &Path) -> Result<usize> {
    warn!("Stripping other files");
    remove_matching(root, "other", |path, _| has_extension(path, OTHER_FILE_EXTENSIONS))
}

fn has_extension(path: &Path, extensions: &[&str]) -> bool {
    path.extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| extensions.contains(&ext))
}

/// Outcome of the embedded data recompression
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecompressStats {
    pub compressed: usize,
    /// Files left as they were because they did not hold valid JSON
    pub skipped: usize,
}

/// JSON data shipped inside boto3/botocore: `boto[3c]*/data/**/*.json*`
pub fn is_boto_data_file(relative: &Path) -> bool {
    let Some(name) = relative.file_name().and_then(OsStr::to_str) else {
        return false;
    };
    if !name.contains(".json") {
        return false;
    }
    let dirs: Vec<&OsStr> = relative
        .parent()
        .map(|p| p.components().map(Component::as_os_str).collect())
        .unwrap_or_default();
    dirs.windows(2).any(|pair| {
        let package = pair[0].to_string_lossy();
        (package.starts_with("boto3") || package.starts_with("botoc")) && pair[1] == "data"
    })
}

/// Minify and gzip boto data files at maximum compression
///
/// `x.json` becomes `x.json.gz`; existing `x.json.gz` files are rewritten
/// in place. The gzip header carries a zero mtime so output is
/// reproducible. A file that does not parse is left untouched.
pub fn compress_boto(root: &Path) -> Result<RecompressStats> {
    warn!("(Re)Compressing botocore and boto3 data files");
    let mut stats = RecompressStats::default();

    for path in files_under(root)? {
        let relative = path.strip_prefix(root).unwrap_or(&path);
        if !is_boto_data_file(relative) {
            continue;
        }
        let name = path.file_name().and_then(OsStr::to_str).unwrap_or_default();
        let (gzipped, destination) = if name.ends_with(".json.gz") {
            (true, path.clone())
        } else if name.ends_with(".json") {
            (false, path.with_file_name(format!("{name}.gz")))
        } else {
            continue;
        };

        match recompress_file(&path, gzipped, &destination) {
            Ok(true) => {
                if destination != path {
                    fs::remove_file(&path)?;
                }
                stats.compressed += 1;
            }
            Ok(false) => stats.skipped += 1,
            Err(e) => {
                warn!("Failed to recompress {}: {}", path.display(), e);
                stats.skipped += 1;
            }
        }
    }

    debug!("Recompressed {} data files, skipped {}", stats.compressed, stats.skipped);
    Ok(stats)
}

/// Returns false when the content is not valid JSON
fn recompress_file(source: &Path, gzipped: bool, destination: &Path) -> Result<bool> {
    let mut raw = Vec::new();
    if gzipped {
        GzDecoder::new(File::open(source)?).read_to_end(&mut raw)?;
    } else {
        File::open(source)?.read_to_end(&mut raw)?;
    }

    let value: serde_json::Value = match serde_json::from_slice(&raw) {
        Ok(value) => value,
        Err(e) => {
            debug!("{} is not valid JSON ({}), leaving it alone", source.display(), e);
            return Ok(false);
        }
    };
    let minified = serde_json::to_vec(&value)?;

    let dir = destination.parent().unwrap_or(Path::new("."));
    let mut staged = tempfile::NamedTempFile::new_in(dir)?;
    {
        let mut encoder = GzBuilder::new().mtime(0).write(staged.as_file_mut(), Compression::best());
        encoder.write_all(&minified)?;
        encoder.finish()?;
    }
    staged.persist(destination).map_err(|e| e.error)?;
    Ok(true)
}

/// `major.minor` reported by an interpreter
fn interpreter_version(runner: &dyn CommandRunner, python: &Path) -> Option<PythonVersion> {
    let spec = CommandSpec::new(python)
        .args(["-c", "import sys; print('%d.%d' % sys.version_info[:2])"])
        .quiet(true);
    let output = runner.execute(&spec).ok().filter(|out| out.success())?;
    PythonVersion::parse(output.stdout.trim()).ok()
}

/// Find a local interpreter of exactly the target version
pub fn find_interpreter(runner: &dyn CommandRunner, target: PythonVersion) -> Option<PathBuf> {
    let versioned = format!("python{target}");
    [versioned.as_str(), "python3", "python"]
        .into_iter()
        .filter_map(|name| runner.locate(name))
        .find(|python| interpreter_version(runner, python) == Some(target))
}

/// Version of the first local interpreter found, if any
pub fn local_python_version(runner: &dyn CommandRunner) -> Option<PythonVersion> {
    ["python3", "python"]
        .into_iter()
        .filter_map(|name| runner.locate(name))
        .find_map(|python| interpreter_version(runner, &python))
}

/// Compile the tree to legacy-layout, optimized, unchecked-hash bytecode
///
/// Bytecode is interpreter-version specific, so this only runs with an
/// interpreter matching the target version. Returns whether compilation
/// ran and succeeded.
pub fn compile_python(runner: &dyn CommandRunner, root: &Path, target: PythonVersion) -> Result<bool> {
    let Some(python) = find_interpreter(runner, target) else {
        warn!("Not compiling package, python version mismatch (no local python{} found)", target);
        return Ok(false);
    };
    warn!("Compiling package");
    debug!("Target Python version: \"{}\" using {}", target, python.display());

    let spec = CommandSpec::new(&python)
        .args(["-m", "compileall", "-q", "-f", "-b", "-o", "2", "--invalidation-mode", "unchecked-hash", "-s"])
        .arg(root)
        .arg(root)
        .quiet(true);
    let compiled = probe_command(runner, &spec)?;
    if !compiled {
        warn!("Bytecode compilation failed");
    }
    Ok(compiled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &[u8]) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn gunzip(path: &Path) -> Vec<u8> {
        let mut out = Vec::new();
        GzDecoder::new(File::open(path).unwrap()).read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_strip_tests() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "pkg/tests/test_a.py", b"");
        write(tmp.path(), "pkg/tests/data/blob.bin", b"");
        write(tmp.path(), "pkg/testsuite.py", b"");
        write(tmp.path(), "tests.py", b"");

        assert_eq!(strip_tests(tmp.path()).unwrap(), 2);
        assert!(tmp.path().join("pkg/testsuite.py").exists());
        assert!(tmp.path().join("tests.py").exists());
        assert_eq!(strip_tests(tmp.path()).unwrap(), 0);
    }

    #[test]
    fn test_strip_python_and_other() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "pkg/__init__.py", b"");
        write(tmp.path(), "pkg/__init__.pyc", b"");
        write(tmp.path(), "pkg/_ext.c", b"");
        write(tmp.path(), "pkg/_ext.pyi", b"");
        write(tmp.path(), "pkg/_ext.so", b"");

        assert_eq!(strip_python(tmp.path()).unwrap(), 1);
        assert!(tmp.path().join("pkg/__init__.pyc").exists());
        assert_eq!(strip_other_files(tmp.path()).unwrap(), 2);
        assert!(tmp.path().join("pkg/_ext.so").exists());
    }

    #[test]
    fn test_is_boto_data_file() {
        assert!(is_boto_data_file(Path::new("botocore/data/s3/2006-03-01/service-2.json")));
        assert!(is_boto_data_file(Path::new("boto3/data/ec2/2016-11-15/resources-1.json.gz")));
        assert!(is_boto_data_file(Path::new("botocore/data/endpoints.json")));
        assert!(!is_boto_data_file(Path::new("botocore/data/README.txt")));
        assert!(!is_boto_data_file(Path::new("botocore/model.json")));
        assert!(!is_boto_data_file(Path::new("requests/data/x.json")));
        assert!(!is_boto_data_file(Path::new("data/botocore.json")));
    }

    #[test]
    fn test_compress_boto_round_trip() {
        let tmp = TempDir::new().unwrap();
        let plain = br#"{
    "version": "1.0",
    "operations": {"ListBuckets": {"http": {"method": "GET"}}}
}"#;
        write(tmp.path(), "botocore/data/s3/service-2.json", plain);

        let stats = compress_boto(tmp.path()).unwrap();
        assert_eq!(stats, RecompressStats { compressed: 1, skipped: 0 });

        let gz = tmp.path().join("botocore/data/s3/service-2.json.gz");
        assert!(!tmp.path().join("botocore/data/s3/service-2.json").exists());
        let decoded = gunzip(&gz);
        assert_eq!(
            decoded,
            br#"{"version":"1.0","operations":{"ListBuckets":{"http":{"method":"GET"}}}}"#.to_vec()
        );
        let original: serde_json::Value = serde_json::from_slice(plain).unwrap();
        let roundtrip: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(original, roundtrip);

        // already compressed files are rewritten to identical bytes
        let first = fs::read(&gz).unwrap();
        compress_boto(tmp.path()).unwrap();
        assert_eq!(fs::read(&gz).unwrap(), first);
    }

    #[test]
    fn test_compress_boto_leaves_invalid_json() {
        let tmp = TempDir::new().unwrap();
        write(tmp.path(), "boto3/data/broken.json", b"{not json");

        let stats = compress_boto(tmp.path()).unwrap();
        assert_eq!(stats, RecompressStats { compressed: 0, skipped: 1 });
        assert_eq!(fs::read(tmp.path().join("boto3/data/broken.json")).unwrap(), b"{not json");
        assert!(!tmp.path().join("boto3/data/broken.json.gz").exists());
    }

    #[test]
    fn test_gzip_output_is_reproducible() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for tmp in [&a, &b] {
            write(tmp.path(), "botocore/data/endpoints.json", br#"{"partitions": []}"#);
            compress_boto(tmp.path()).unwrap();
        }
        assert_eq!(
            fs::read(a.path().join("botocore/data/endpoints.json.gz")).unwrap(),
            fs::read(b.path().join("botocore/data/endpoints.json.gz")).unwrap()
        );
    }
}
