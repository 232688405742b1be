// src/packager/mod.rs

//! Packaging pipeline
//!
//! [`LambdaPackager`] drives one packaging run: the analyzer installs the
//! dependencies and the project's code into its staging target, the tree is
//! copied into the output directory, and the enabled optimization steps
//! mutate it in place, in a fixed order:
//!
//! 1. alternate binary swap (pyarrow)
//! 2. mtime normalization
//! 3. bytecode compilation
//! 4. source stripping, only after a successful compilation
//! 5. test, library and extension-source stripping
//! 6. boto data recompression
//!
//! then the optional layer split, the size ceiling check and the optional
//! zip archive. Steps are not transactional; a failed run is recovered by
//! packaging again into a cleared output directory.

pub mod archive;
pub mod layer;
pub mod steps;
pub mod strip;

pub use archive::zip_tree;
pub use layer::{split_layer, SplitOutput};

use crate::analyzer::{AnalyzerOptions, DepAnalyzer, ProjectKind};
use crate::config::PackagerConfig;
use crate::error::Result;
use crate::fetcher::AlternateBinaryFetcher;
use crate::filesystem::{self, format_size, percent_of};
use crate::ignore_list::{IgnoreListSource, IgnoreMap};
use crate::platform::{Architecture, PythonVersion, SupportedPlatforms, TargetSpec};
use crate::process::{CommandRunner, SharedRunner};
use std::ffi::{OsStr, OsString};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Largest unpacked function size the runtime accepts
pub const MAX_PACKAGE_SIZE: u64 = 250 * 1024 * 1024;

/// Interpreter version assumed when nothing better is known
pub const DEFAULT_PYTHON_VERSION: PythonVersion = PythonVersion::new(3, 9);

/// What a packaging run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageOutput {
    /// The function tree: the output directory, or `output/main` when split
    pub main_dir: PathBuf,
    /// `output/layer` when split
    pub layer_dir: Option<PathBuf>,
    pub archive: Option<PathBuf>,
    /// Final tree size in bytes
    pub size: u64,
    /// Size right after installation, before any optimization
    pub initial_size: u64,
}

impl PackageOutput {
    pub fn exceeds_limit(&self) -> bool {
        self.size > MAX_PACKAGE_SIZE
    }
}

/// Pick the target interpreter version
///
/// An explicit version wins. Otherwise the local interpreter's version is
/// clamped into the runtimes available for the architecture, falling back
/// to [`DEFAULT_PYTHON_VERSION`].
pub fn resolve_python_version(
    requested: Option<PythonVersion>,
    runner: &dyn CommandRunner,
    platforms: &SupportedPlatforms,
    arch: Architecture,
) -> PythonVersion {
    if let Some(version) = requested {
        return version;
    }
    let local = steps::local_python_version(runner).unwrap_or(DEFAULT_PYTHON_VERSION);
    let chosen = platforms.runtime_for(arch, local).unwrap_or(DEFAULT_PYTHON_VERSION);
    info!("No python version given, targeting python{} (local python{})", chosen, local);
    chosen
}

/// One packaging run from a project directory into an output directory
pub struct LambdaPackager {
    output_dir: PathBuf,
    config: PackagerConfig,
    target: TargetSpec,
    runner: SharedRunner,
    fetcher: Box<dyn AlternateBinaryFetcher>,
    analyzer: DepAnalyzer,
}

impl LambdaPackager {
    /// Set up a run
    ///
    /// Fails when the target runtime is unsupported (unless
    /// `ignore-unsupported-python` is set), when the project kind is
    /// ambiguous, or when a required backend is missing.
    pub fn new(
        project_root: &Path,
        output_dir: &Path,
        config: &PackagerConfig,
        platforms: &SupportedPlatforms,
        runner: SharedRunner,
        ignore_source: Box<dyn IgnoreListSource>,
        fetcher: Box<dyn AlternateBinaryFetcher>,
    ) -> Result<Self> {
        config.validate()?;
        let python_version = config.target.python_version.unwrap_or(DEFAULT_PYTHON_VERSION);
        let target = TargetSpec::new(python_version, config.target.architecture, config.target.region.clone());

        if let Err(e) = platforms.check(&target) {
            if !config.target.ignore_unsupported_python {
                return Err(e);
            }
            warn!("{}, continuing anyway", e);
        }

        let kind = ProjectKind::detect(project_root)?;

        let mut additional_ignores = IgnoreMap::new();
        for path in &config.dependencies.ignore_additional {
            debug!("Adding packages to ignore from {}", path.display());
            additional_ignores.merge(IgnoreMap::from_requirements_file(path)?);
        }
        let options = AnalyzerOptions {
            target: target.clone(),
            ignore_packages: config.dependencies.ignore_packages,
            update_dependencies: config.dependencies.update_dependencies,
            additional_ignores,
        };
        let analyzer = DepAnalyzer::new(project_root, kind, options, runner.clone(), ignore_source)?;

        Ok(Self {
            output_dir: output_dir.to_path_buf(),
            config: config.clone(),
            target,
            runner,
            fetcher,
            analyzer,
        })
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn target(&self) -> &TargetSpec {
        &self.target
    }

    pub fn analyzer(&mut self) -> &mut DepAnalyzer {
        &mut self.analyzer
    }

    /// Total size of the output tree
    pub fn total_size(&self) -> Result<u64> {
        filesystem::dir_size(&self.output_dir)
    }

    fn log_size(&self, step: &str, initial_size: u64) -> Result<u64> {
        let size = self.total_size()?;
        info!(
            "{} done, new size: {} ({:.1}%)",
            step,
            format_size(size),
            percent_of(size, initial_size)
        );
        Ok(size)
    }

    /// Run the whole pipeline
    pub fn package(&mut self) -> Result<PackageOutput> {
        if !self.config.output.no_clobber && self.output_dir.exists() {
            warn!("Output directory {} already exists, removing it", self.output_dir.display());
            filesystem::remove_path(&self.output_dir)?;
        }

        self.analyzer.install_dependencies()?;
        let layer_entries = self.analyzer.get_layer_files()?;
        self.analyzer.install_root()?;
        self.analyzer.copy_from_target(&self.output_dir)?;

        let initial_size = self.total_size()?;
        info!("Pre-strip size: {}", format_size(initial_size));

        let optimize = self.config.optimize.clone();
        if optimize.use_alternate_binary {
            self.swap_alternate_binary()?;
            self.log_size("Alternate binary swap", initial_size)?;
        }

        filesystem::set_tree_mtime(&self.output_dir, filesystem::normalized_mtime())?;

        let mut strip_python = optimize.strip_python;
        if optimize.compile_python {
            let compiled = steps::compile_python(self.runner.as_ref(), &self.output_dir, self.target.python_version)?;
            if strip_python && !compiled {
                warn!("Unable to compile python, not stripping python");
                strip_python = false;
            }
            self.log_size("compile_python", initial_size)?;
        } else if strip_python {
            warn!("Not stripping python, since compile_python is not enabled");
            strip_python = false;
        }

        if strip_python {
            steps::strip_python(&self.output_dir)?;
            self.log_size("strip_python", initial_size)?;
        }
        if optimize.strip_tests {
            steps::strip_tests(&self.output_dir)?;
            self.log_size("strip_tests", initial_size)?;
        }
        if optimize.strip_libraries {
            match strip::strip_libraries(self.runner.as_ref(), &self.output_dir, self.target.architecture) {
                Ok(count) => debug!("Stripped {} libraries", count),
                Err(e) => error!("Failed to strip libraries: {}", e),
            }
            self.log_size("strip_libraries", initial_size)?;
        }
        if optimize.strip_other {
            steps::strip_other_files(&self.output_dir)?;
            self.log_size("strip_other_files", initial_size)?;
        }
        if optimize.compress_boto {
            steps::compress_boto(&self.output_dir)?;
            self.log_size("compress_boto", initial_size)?;
        }

        let (main_dir, layer_dir) = if self.config.output.split_layer {
            let split = layer::split_layer(&self.output_dir, &layer_entries)?;
            (split.main_dir, Some(split.layer_dir))
        } else {
            (self.output_dir.clone(), None)
        };

        let size = self.total_size()?;
        if size > MAX_PACKAGE_SIZE {
            error!(
                "Package size {} exceeds maximum lambda size {}",
                format_size(size),
                format_size(MAX_PACKAGE_SIZE)
            );
        } else {
            warn!("Package size: {} ({:.1}%)", format_size(size), percent_of(size, initial_size));
        }

        let archive = if self.config.output.zip {
            warn!("Zipping output");
            let zip_path = self
                .config
                .output
                .zip_path
                .clone()
                .unwrap_or_else(|| default_zip_path(&self.output_dir));
            archive::zip_tree(&self.output_dir, &zip_path)?;
            Some(zip_path)
        } else {
            None
        };

        if let Some(path) = self.config.output.export_requirements.clone() {
            self.analyzer.write_exported_requirements(&path)?;
        }

        Ok(PackageOutput {
            main_dir,
            layer_dir,
            archive,
            size,
            initial_size,
        })
    }

    /// Replace the installed pyarrow with a prebuilt, size-optimized build
    ///
    /// The existing files are moved aside first and restored if no
    /// replacement can be installed.
    fn swap_alternate_binary(&mut self) -> Result<()> {
        let package = self.fetcher.package().to_string();
        let version = match self.analyzer.resolved_packages()?.get(&package) {
            Some(pkg) => pkg.version.clone(),
            None => {
                warn!("No {} requirement found, not fetching a prebuilt build", package);
                return Ok(());
            }
        };

        let scratch_root = self.output_dir.parent().unwrap_or(Path::new("."));
        let aside = tempfile::Builder::new()
            .prefix(&format!("{package}-aside-"))
            .tempdir_in(scratch_root)?;

        let mut moved = Vec::new();
        for entry in fs::read_dir(&self.output_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&package) {
                continue;
            }
            filesystem::move_path(&entry.path(), &aside.path().join(&name))?;
            moved.push(name);
        }
        debug!("Moved {} {} entries aside", moved.len(), package);

        let installed = match self.fetcher.fetch(&self.output_dir, &version, &self.target) {
            Ok(Some(v)) => {
                info!("Installed prebuilt {} {}", package, v);
                true
            }
            Ok(None) => {
                warn!("{} version {} not found", package, version);
                false
            }
            Err(e) => {
                warn!("Failed to fetch prebuilt {} {}: {}", package, version, e);
                false
            }
        };

        if !installed {
            restore_entries(aside.path(), &self.output_dir, &moved)?;
        }
        aside.close()?;
        Ok(())
    }

    /// Release the analyzer's scratch directories
    pub fn close(&mut self) -> Result<()> {
        self.analyzer.close()
    }
}

fn restore_entries(aside: &Path, output_dir: &Path, names: &[OsString]) -> Result<()> {
    for name in names {
        let destination = output_dir.join(name);
        // a partial install may have left files behind
        filesystem::remove_path(&destination)?;
        filesystem::move_path(&aside.join(name), &destination)?;
    }
    Ok(())
}

/// `<output>.zip` next to the output directory
pub fn default_zip_path(output_dir: &Path) -> PathBuf {
    let mut name = output_dir
        .file_name()
        .unwrap_or_else(|| OsStr::new("package"))
        .to_os_string();
    name.push(".zip");
    output_dir.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_zip_path() {
        assert_eq!(default_zip_path(Path::new("/tmp/build")), PathBuf::from("/tmp/build.zip"));
        assert_eq!(default_zip_path(Path::new("out/pkg.v1")), PathBuf::from("out/pkg.v1.zip"));
    }

    #[test]
    fn test_restore_entries_replaces_partial_install() {
        let tmp = TempDir::new().unwrap();
        let aside = tmp.path().join("aside");
        let output = tmp.path().join("out");
        fs::create_dir_all(aside.join("pyarrow")).unwrap();
        fs::write(aside.join("pyarrow/__init__.py"), "original").unwrap();
        fs::create_dir_all(output.join("pyarrow")).unwrap();
        fs::write(output.join("pyarrow/partial.py"), "partial").unwrap();

        restore_entries(&aside, &output, &["pyarrow".into()]).unwrap();
        assert_eq!(fs::read_to_string(output.join("pyarrow/__init__.py")).unwrap(), "original");
        assert!(!output.join("pyarrow/partial.py").exists());
    }

    #[test]
    fn test_exceeds_limit() {
        let mut output = PackageOutput {
            main_dir: PathBuf::from("out"),
            layer_dir: None,
            archive: None,
            size: MAX_PACKAGE_SIZE,
            initial_size: MAX_PACKAGE_SIZE,
        };
        assert!(!output.exceeds_limit());
        output.size += 1;
        assert!(output.exceeds_limit());
    }
}
