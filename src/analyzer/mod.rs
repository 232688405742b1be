// src/analyzer/mod.rs

//! Dependency analysis and installation
//!
//! [`DepAnalyzer`] unifies two dependency managers behind one canonical
//! model. A project is either a flat `requirements.txt` project handled by
//! the pip backend, or a `pyproject.toml` + `poetry.lock` project handled by
//! the poetry backend. Each backend knows how to resolve the full closure,
//! rewrite its manifest and install the project's own code; everything else
//! (ignore-list diffing, backups, pinned installation into the staging
//! target) lives here.
//!
//! Lifecycle of one analyzer:
//! 1. `requirements()` resolves once, optionally correcting the manifest
//! 2. `install_dependencies()` installs the exported set with `--no-deps`
//! 3. `get_layer_files()` reports what the dependencies put in the target
//! 4. `install_root()` adds the project's own code
//! 5. `copy_from_target()` hands the tree to the packaging pipeline
//! 6. `close()` (or drop) removes every scratch directory

pub mod pip;
pub mod poetry;
pub mod requirements;
pub mod workspace;

pub use pip::PipBackend;
pub use poetry::PoetryBackend;
pub use requirements::{PassthroughDirective, RequirementLine, ResolvedPackage};
pub use workspace::{InstallTarget, Workspace};

use crate::error::{Error, Result};
use crate::filesystem;
use crate::ignore_list::{self, IgnoreListSource, IgnoreMap};
use crate::platform::TargetSpec;
use crate::process::{run_command, CommandRunner, CommandSpec, SharedRunner};
use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

static NO_IGNORES: IgnoreMap = IgnoreMap::new();

/// Which dependency manager a project uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    /// `requirements.txt`
    Pip,
    /// `pyproject.toml` + `poetry.lock`
    Poetry,
}

impl ProjectKind {
    /// Exactly one of `pyproject.toml` or `requirements.txt` must exist
    pub fn detect(project_root: &Path) -> Result<Self> {
        let pyproject = project_root.join("pyproject.toml").exists();
        let requirements = project_root.join("requirements.txt").exists();
        match (pyproject, requirements) {
            (true, false) => {
                info!("pyproject.toml found and not requirements.txt, assuming poetry");
                Ok(Self::Poetry)
            }
            (false, true) => {
                info!("requirements.txt found, assuming pip");
                Ok(Self::Pip)
            }
            _ => Err(Error::AmbiguousProjectKind(project_root.to_path_buf())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pip => "pip",
            Self::Poetry => "poetry",
        }
    }
}

impl fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Behavior switches for one analyzer
#[derive(Debug, Clone, Default)]
pub struct AnalyzerOptions {
    pub target: TargetSpec,
    /// Drop packages the runtime already provides at the same version
    pub ignore_packages: bool,
    /// Rewrite the manifest to match runtime-provided versions
    pub update_dependencies: bool,
    /// Merged over the fetched ignore list
    pub additional_ignores: IgnoreMap,
}

/// Builds the common `pip install` invocation for the target platform
#[derive(Debug, Clone)]
pub struct PipInstaller {
    program: PathBuf,
    target: TargetSpec,
}

impl PipInstaller {
    pub fn new(program: impl Into<PathBuf>, target: TargetSpec) -> Self {
        Self {
            program: program.into(),
            target,
        }
    }

    /// Find pip on PATH or fail with [`Error::BackendNotFound`]
    pub fn locate(runner: &dyn CommandRunner, target: TargetSpec) -> Result<Self> {
        let program = runner.locate("pip").ok_or_else(|| Error::BackendNotFound {
            tool: "pip".to_string(),
            hint: String::new(),
        })?;
        Ok(Self::new(program, target))
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// `pip install` pinned to the target interpreter, ABI and platform
    pub fn install(&self, directives: &[PassthroughDirective]) -> CommandSpec {
        let version = self.target.python_version.to_string();
        CommandSpec::new(&self.program)
            .args([
                "install",
                "--disable-pip-version-check",
                "--ignore-installed",
                "--no-compile",
                "--python-version",
                version.as_str(),
                "--implementation",
                "cp",
                "--abi",
                self.target.python_version.abi_tag().as_str(),
            ])
            .args(directives.iter().flat_map(|d| d.args()))
            .args(["--platform", self.target.architecture.platform_tag()])
    }
}

/// What a backend may use while doing its work
pub struct BackendContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub pip: &'a PipInstaller,
    pub project_root: &'a Path,
    pub workspace: &'a Workspace,
    pub install_target: &'a Path,
}

/// The two supported dependency managers
#[derive(Debug)]
pub enum Backend {
    Pip(PipBackend),
    Poetry(PoetryBackend),
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Pip(_) => "pip",
            Self::Poetry(_) => "poetry",
        }
    }

    /// Manifest files copied into the workspace, backed up and copied back
    pub fn manifest_files(&self) -> &'static [&'static str] {
        match self {
            Self::Pip(_) => PipBackend::MANIFEST_FILES,
            Self::Poetry(_) => PoetryBackend::MANIFEST_FILES,
        }
    }

    fn resolve(&self, ctx: &BackendContext<'_>) -> Result<Vec<RequirementLine>> {
        match self {
            Self::Pip(b) => b.resolve(ctx),
            Self::Poetry(b) => b.resolve(ctx),
        }
    }

    fn rewrite_manifest(&self, ctx: &BackendContext<'_>, corrections: &BTreeMap<String, ResolvedPackage>) -> Result<()> {
        match self {
            Self::Pip(b) => b.rewrite_manifest(ctx, corrections),
            Self::Poetry(b) => b.rewrite_manifest(ctx, corrections),
        }
    }

    /// Returns false when the generic fallback should be used
    fn install_root(&self, ctx: &BackendContext<'_>, directives: &[PassthroughDirective]) -> Result<bool> {
        match self {
            Self::Pip(_) => Ok(false),
            Self::Poetry(b) => b.install_root(ctx, directives),
        }
    }

    fn direct_dependencies(&self, project_root: &Path) -> Result<BTreeMap<String, String>> {
        match self {
            Self::Pip(b) => b.direct_dependencies(project_root),
            Self::Poetry(b) => b.direct_dependencies(project_root),
        }
    }

    fn close(&mut self) -> Result<()> {
        match self {
            Self::Pip(_) => Ok(()),
            Self::Poetry(b) => b.close(),
        }
    }
}

/// Resolves, diffs and installs a project's dependencies
pub struct DepAnalyzer {
    project_root: PathBuf,
    options: AnalyzerOptions,
    backend: Backend,
    runner: SharedRunner,
    ignore_source: Box<dyn IgnoreListSource>,
    pip: PipInstaller,
    workspace: Workspace,
    target: InstallTarget,
    ignore_map: Option<IgnoreMap>,
    requirements: Option<Vec<RequirementLine>>,
    exported: Option<Vec<String>>,
    layer_files: Option<BTreeSet<OsString>>,
}

impl DepAnalyzer {
    /// Create an analyzer for an already detected project kind
    ///
    /// Fails with [`Error::BackendNotFound`] when pip (or poetry, for poetry
    /// projects) is not on PATH.
    pub fn new(
        project_root: &Path,
        kind: ProjectKind,
        options: AnalyzerOptions,
        runner: SharedRunner,
        ignore_source: Box<dyn IgnoreListSource>,
    ) -> Result<Self> {
        let pip = PipInstaller::locate(runner.as_ref(), options.target.clone())?;
        let backend = match kind {
            ProjectKind::Pip => Backend::Pip(PipBackend::new()),
            ProjectKind::Poetry => Backend::Poetry(PoetryBackend::locate(runner.as_ref(), project_root)?),
        };
        let workspace = Workspace::new(project_root, backend.manifest_files())?;
        let target = InstallTarget::new()?;
        debug!(
            "{} analyzer for {} targeting python{} {}",
            backend.name(),
            project_root.display(),
            options.target.python_version,
            options.target.architecture
        );

        Ok(Self {
            project_root: project_root.to_path_buf(),
            options,
            backend,
            runner,
            ignore_source,
            pip,
            workspace,
            target,
            ignore_map: None,
            requirements: None,
            exported: None,
            layer_files: None,
        })
    }

    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn options(&self) -> &AnalyzerOptions {
        &self.options
    }

    pub fn install_target(&self) -> &Path {
        self.target.path()
    }

    fn context(&self) -> BackendContext<'_> {
        BackendContext {
            runner: self.runner.as_ref(),
            pip: &self.pip,
            project_root: &self.project_root,
            workspace: &self.workspace,
            install_target: self.target.path(),
        }
    }

    /// Runtime-provided packages; empty unless ignoring is enabled
    ///
    /// The list is fetched at most once per analyzer.
    pub fn ignore_map(&mut self) -> &IgnoreMap {
        if !self.options.ignore_packages {
            return &NO_IGNORES;
        }
        let source = self.ignore_source.as_ref();
        let options = &self.options;
        self.ignore_map.get_or_insert_with(|| {
            let mut map = ignore_list::load_or_empty(source, &options.target);
            map.merge(options.additional_ignores.clone());
            map
        })
    }

    /// Resolve the full dependency closure through the backend (uncached)
    pub fn get_requirements(&self) -> Result<Vec<RequirementLine>> {
        info!("Getting requirements info using {}", self.backend.name());
        self.backend.resolve(&self.context())
    }

    /// Resolved requirements, computed once and cached
    ///
    /// When manifest correction is enabled and changes the manifest, the
    /// closure is resolved again from the corrected manifest.
    pub fn requirements(&mut self) -> Result<&[RequirementLine]> {
        if self.requirements.is_none() {
            warn!("Exporting requirements");
            let resolved = match self.update_dependency_file()? {
                Some(snapshot) => snapshot,
                None => self.get_requirements()?,
            };
            self.requirements = Some(resolved);
        }
        Ok(self.requirements.as_deref().unwrap_or_default())
    }

    /// Resolved packages keyed by normalized name
    pub fn resolved_packages(&mut self) -> Result<BTreeMap<String, ResolvedPackage>> {
        Ok(self
            .requirements()?
            .iter()
            .filter_map(RequirementLine::as_package)
            .map(|p| (p.key(), p.clone()))
            .collect())
    }

    /// Pass-through directives of the resolved set, in order
    pub fn directives(&mut self) -> Result<Vec<PassthroughDirective>> {
        Ok(self
            .requirements()?
            .iter()
            .filter_map(RequirementLine::as_directive)
            .cloned()
            .collect())
    }

    /// Top-level declarations of the project's manifest, unresolved
    pub fn direct_dependencies(&self) -> Result<BTreeMap<String, String>> {
        self.backend.direct_dependencies(&self.project_root)
    }

    /// Requirement lines to install, minus runtime-provided packages
    pub fn export_requirements(&mut self) -> Result<Vec<String>> {
        if let Some(exported) = &self.exported {
            return Ok(exported.clone());
        }

        let packages: Vec<ResolvedPackage> = self
            .requirements()?
            .iter()
            .filter_map(RequirementLine::as_package)
            .cloned()
            .collect();
        let ignore_packages = self.options.ignore_packages;
        let ignores = self.ignore_map();

        let mut exported = Vec::with_capacity(packages.len());
        for pkg in packages {
            if ignore_packages && ignores.provides(&pkg.name, &pkg.version) {
                warn!(
                    "Ignoring {} as it should be in the AWS Lambda Environment already",
                    pkg.requirement()
                );
                continue;
            }
            exported.push(pkg.raw);
        }

        self.exported = Some(exported.clone());
        Ok(exported)
    }

    /// Write the directives and exported requirements as a requirements file
    pub fn write_exported_requirements(&mut self, path: &Path) -> Result<()> {
        let mut lines: Vec<String> = self.directives()?.into_iter().map(|d| d.raw).collect();
        lines.extend(self.export_requirements()?);
        let mut content = lines.join("\n");
        content.push('\n');
        fs::write(path, content)?;
        info!("Wrote exported requirements to {}", path.display());
        Ok(())
    }

    /// Correct the manifest to match runtime-provided versions
    ///
    /// Returns `None` when nothing is to be done (feature disabled) or when
    /// the manifest was rewritten and the caller must resolve again.
    /// Otherwise returns the snapshot the check was made against, so no
    /// second resolution is needed.
    pub fn update_dependency_file(&mut self) -> Result<Option<Vec<RequirementLine>>> {
        if !self.options.ignore_packages || !self.options.update_dependencies {
            return Ok(None);
        }
        info!(
            "Checking to see if any dependencies need to be changed in the dependency file to match the AWS Lambda environment"
        );

        let current = match &self.requirements {
            Some(cached) => cached.clone(),
            None => self.get_requirements()?,
        };
        let ignores = self.ignore_map().clone();

        let mut corrections = BTreeMap::new();
        for pkg in current.iter().filter_map(RequirementLine::as_package) {
            if let Some(provided) = ignores.version_of(&pkg.name)
                && provided != pkg.version
            {
                warn!("{} is currently {} but should be {}", pkg.name, pkg.version, provided);
                corrections.insert(pkg.key(), ResolvedPackage::pinned(pkg.name.clone(), provided));
            }
        }

        if corrections.is_empty() {
            info!("No changes needed in the dependency file");
            return Ok(Some(current));
        }

        info!("Updating dependency file to add {} requirements", corrections.len());
        let files = self.backend.manifest_files();
        let backups = self.workspace.backup_files(files)?;
        if let Err(e) = self.backend.rewrite_manifest(&self.context(), &corrections) {
            error!(
                "Failed to update the dependency file, {} left unchanged in {}",
                files.join(", "),
                self.project_root.display()
            );
            for backup in &backups {
                if let Err(remove) = fs::remove_file(backup) {
                    warn!("Could not remove unused backup {}: {}", backup.display(), remove);
                }
            }
            self.workspace.refresh(files)?;
            return Err(e);
        }
        self.workspace.copy_back(files)?;

        self.requirements = None;
        self.exported = None;
        Ok(None)
    }

    /// Install the exported requirement set into the staging target
    ///
    /// Resolution already happened, so pip runs with `--no-deps` and the
    /// exact pins land on disk. The target's top-level entries are recorded
    /// afterwards for the layer split.
    pub fn install_dependencies(&mut self) -> Result<()> {
        let exported = self.export_requirements()?;
        let directives = self.directives()?;

        if exported.is_empty() {
            warn!("No dependencies left to install");
        } else {
            warn!("Installing dependencies using pip");
            let spec = self
                .pip
                .install(&directives)
                .arg("--target")
                .arg(self.target.path())
                .arg("--no-deps")
                .args(&exported)
                .quiet(true);
            run_command(self.runner.as_ref(), &spec)?;
            warn!("Installing dependencies done");
        }

        self.layer_files = Some(filesystem::top_level_entries(self.target.path())?);
        Ok(())
    }

    /// Install the project's own code into the staging target
    pub fn install_root(&mut self) -> Result<()> {
        let directives = self.directives()?;
        if self.backend.install_root(&self.context(), &directives)? {
            return Ok(());
        }
        install_root_fallback(&self.project_root, self.target.path())
    }

    /// Top-level entries the dependency install put in the target
    pub fn get_layer_files(&mut self) -> Result<BTreeSet<OsString>> {
        if self.layer_files.is_none() {
            self.layer_files = Some(filesystem::top_level_entries(self.target.path())?);
        }
        Ok(self.layer_files.clone().unwrap_or_default())
    }

    /// Copy the staging target into `dst`
    pub fn copy_from_target(&self, dst: &Path) -> Result<()> {
        warn!("Copying {} from target to {}", self.target.path().display(), dst.display());
        filesystem::copy_dir_all(self.target.path(), dst)?;
        Ok(())
    }

    /// Back up manifest files in the project root
    pub fn backup_files(&self) -> Result<Vec<PathBuf>> {
        self.workspace.backup_files(self.backend.manifest_files())
    }

    /// Release all scratch directories; safe to call repeatedly
    pub fn close(&mut self) -> Result<()> {
        self.workspace.close()?;
        self.target.close()?;
        self.backend.close()
    }
}

impl Drop for DepAnalyzer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            debug!("Failed to clean up analyzer directories: {}", e);
        }
    }
}

/// Copy the project's code when no native build is available
///
/// `src/` with an `__init__.py` is installed as a `src` package; otherwise
/// the contents of `src/` go to the target root. Without `src/`, loose
/// top-level `*.py` scripts are copied.
pub fn install_root_fallback(project_root: &Path, target: &Path) -> Result<()> {
    let src = project_root.join("src");
    if src.is_dir() {
        if src.join("__init__.py").exists() {
            warn!("src/__init__.py exists, installing as package in target");
            filesystem::copy_dir_all(&src, &target.join("src"))?;
        } else {
            warn!("src/__init__.py does not exist, installing files from src directly into target");
            filesystem::copy_dir_all(&src, target)?;
        }
        return Ok(());
    }

    let mut scripts: Vec<PathBuf> = fs::read_dir(project_root)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "py"))
        .collect();
    scripts.sort();

    if scripts.is_empty() {
        warn!("No src/__init__.py or *.py files found, no root program is being installed");
        return Ok(());
    }
    for script in scripts {
        warn!("Copying {} to target", script.display());
        if let Some(name) = script.file_name() {
            fs::copy(&script, target.join(name))?;
        }
    }
    Ok(())
}
