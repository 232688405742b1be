// src/config.rs

//! Packager configuration
//!
//! Options come from, in increasing precedence: built-in defaults, the
//! `[tool.lambda-packager]` table of the project's `pyproject.toml`, an
//! explicit `--config` TOML file, and finally command line flags. The two
//! file sources are merged key by key before deserializing, so a config
//! file only overrides the keys it actually sets.
//!
//! ```toml
//! [tool.lambda-packager.target]
//! python-version = "3.9"
//! architecture = "arm64"
//!
//! [tool.lambda-packager.optimize]
//! strip-tests = true
//! compress-boto = true
//! ```

use crate::error::{Error, Result};
use crate::ignore_list::DEFAULT_IGNORE_LIST_URL;
use crate::platform::{Architecture, PythonVersion};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Name of the table read from `pyproject.toml`
pub const PYPROJECT_TABLE: &str = "lambda-packager";

/// Default file name for `--export-requirements` without a value
pub const DEFAULT_EXPORT_FILE: &str = "requirements.installed.txt";

/// Highest `-O` level
pub const MAX_OPTIMIZATION_LEVEL: u8 = 5;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PackagerConfig {
    pub target: TargetConfig,
    pub dependencies: DependencyConfig,
    pub optimize: OptimizeConfig,
    pub output: OutputConfig,
}

/// Deployment target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct TargetConfig {
    /// Unset means the local interpreter's version, clamped to what the
    /// runtime supports
    pub python_version: Option<PythonVersion>,
    pub architecture: Architecture,
    pub region: String,
    pub ignore_unsupported_python: bool,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            python_version: None,
            architecture: Architecture::X86_64,
            region: "us-east-1".to_string(),
            ignore_unsupported_python: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DependencyConfig {
    /// Skip packages the runtime already provides
    pub ignore_packages: bool,
    /// Rewrite the manifest to the runtime's versions
    pub update_dependencies: bool,
    /// Requirements files whose pins are treated as provided
    pub ignore_additional: Vec<PathBuf>,
    /// Template with `{region}`, `{python_version}`, `{architecture}`
    pub ignore_list_url: String,
}

impl Default for DependencyConfig {
    fn default() -> Self {
        Self {
            ignore_packages: false,
            update_dependencies: false,
            ignore_additional: Vec::new(),
            ignore_list_url: DEFAULT_IGNORE_LIST_URL.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OptimizeConfig {
    pub compile_python: bool,
    /// Only honored together with `compile_python`
    pub strip_python: bool,
    pub strip_tests: bool,
    pub strip_libraries: bool,
    pub strip_other: bool,
    pub compress_boto: bool,
    /// Swap pyarrow for a prebuilt, size-optimized build
    pub use_alternate_binary: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct OutputConfig {
    pub zip: bool,
    /// Archive location; `<output>.zip` when unset
    pub zip_path: Option<PathBuf>,
    pub split_layer: bool,
    /// Keep an existing output directory instead of clearing it
    pub no_clobber: bool,
    pub export_requirements: Option<PathBuf>,
}

impl PackagerConfig {
    /// Parse a standalone TOML config document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Merge the project's pyproject table with an optional config file
    pub fn load(project_root: &Path, config_file: Option<&Path>) -> Result<Self> {
        let mut merged = pyproject_table(project_root)?.unwrap_or_default();
        if let Some(path) = config_file {
            let content = std::fs::read_to_string(path)?;
            let overlay: toml::Table = toml::from_str(&content)?;
            debug!("Applying configuration from {}", path.display());
            merge_tables(&mut merged, overlay);
        }
        Ok(toml::Value::Table(merged).try_into()?)
    }

    /// Switch on every optimization up to `level` (`-O`, `-OO`, ...)
    pub fn apply_optimization_level(&mut self, level: u8) {
        if level >= 1 {
            self.optimize.strip_tests = true;
            self.optimize.strip_other = true;
            self.optimize.compress_boto = true;
        }
        if level >= 2 {
            self.dependencies.ignore_packages = true;
            self.optimize.strip_libraries = true;
        }
        if level >= 3 {
            self.dependencies.update_dependencies = true;
        }
        if level >= 4 {
            self.optimize.use_alternate_binary = true;
        }
        if level >= 5 {
            self.optimize.compile_python = true;
            self.optimize.strip_python = true;
        }
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        if self.optimize.strip_python && !self.optimize.compile_python {
            return Err(Error::Config("strip-python requires compile-python".to_string()));
        }
        Ok(())
    }
}

/// `[tool.lambda-packager]` of `<project_root>/pyproject.toml`, if present
fn pyproject_table(project_root: &Path) -> Result<Option<toml::Table>> {
    let path = project_root.join("pyproject.toml");
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let mut document: toml::Table = toml::from_str(&content)?;
    let table = document
        .remove("tool")
        .and_then(|tool| match tool {
            toml::Value::Table(mut tool) => tool.remove(PYPROJECT_TABLE),
            _ => None,
        })
        .and_then(|value| match value {
            toml::Value::Table(table) => Some(table),
            _ => None,
        });
    if table.is_some() {
        debug!("Using [tool.{}] from {}", PYPROJECT_TABLE, path.display());
    }
    Ok(table)
}

/// Recursively overlay `overlay` onto `base`
fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match (base.get_mut(&key), value) {
            (Some(toml::Value::Table(existing)), toml::Value::Table(incoming)) => merge_tables(existing, incoming),
            (_, value) => {
                base.insert(key, value);
            }
        }
    }
}
