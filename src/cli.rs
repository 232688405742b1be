// src/cli.rs
//! CLI definitions for lambda-packager
//!
//! This module contains the command-line interface definitions using clap.
//! The command implementations are in the `commands` module.

use clap::{ArgAction, Args, Parser, Subcommand};
use lambda_packager::config::{PackagerConfig, DEFAULT_EXPORT_FILE, MAX_OPTIMIZATION_LEVEL};
use lambda_packager::platform::{Architecture, PythonVersion};
use std::path::{Path, PathBuf};

const OPTIMIZATION_LEVELS: &str = "\
Optimization levels (-O, -OO, ...):
  1: strip-tests, strip-other, compress-boto
  2: ignore-packages, strip-libraries
  3: update-dependencies
  4: use-aws-pyarrow
  5: compile-python, strip-python";

#[derive(Parser)]
#[command(name = "lambda-packager")]
#[command(version)]
#[command(about = "Bundle a Python project's dependencies for AWS Lambda", long_about = None)]
pub struct Cli {
    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    /// Default log filter when `RUST_LOG` is not set
    pub fn log_filter(&self) -> &'static str {
        if self.quiet {
            return "warn";
        }
        match self.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Bundle a project's dependencies into an output directory
    #[command(after_help = OPTIMIZATION_LEVELS)]
    Build(BuildArgs),

    /// List the supported runtime platforms
    Platforms {
        /// Refresh the table from the Lambda runtime documentation
        #[arg(long)]
        refresh: bool,
    },
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    /// Project directory, or its pyproject.toml / requirements.txt
    pub project_path: PathBuf,

    /// Output directory
    pub output_path: PathBuf,

    /// Target python version [default: local python, clamped to supported runtimes]
    #[arg(short, long)]
    pub python_version: Option<PythonVersion>,

    /// Target architecture (x86_64 or arm64)
    #[arg(short, long)]
    pub architecture: Option<Architecture>,

    /// AWS region used to look up runtime-provided packages
    #[arg(short, long)]
    pub region: Option<String>,

    /// Continue even if the python version / architecture is not a known runtime
    #[arg(long)]
    pub ignore_unsupported_python: bool,

    /// Refresh the supported runtime table before checking the target
    #[arg(long)]
    pub refresh_platforms: bool,

    /// Extra TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Also write a zip archive [default path: <OUTPUT_PATH>.zip]
    #[arg(short, long, value_name = "PATH")]
    pub zip_output: Option<Option<PathBuf>>,

    /// Write the installed requirement set to a file
    #[arg(long, value_name = "PATH", num_args = 0..=1, default_missing_value = DEFAULT_EXPORT_FILE)]
    pub export_requirements: Option<PathBuf>,

    /// Split the output into main/ (project code) and layer/ (dependencies)
    #[arg(long)]
    pub split_layer: bool,

    /// Do not clear an existing output directory
    #[arg(long)]
    pub no_clobber: bool,

    /// Skip packages already present in the Lambda environment
    #[arg(short, long)]
    pub ignore_packages: bool,

    /// Pin the project's dependencies to the Lambda environment's versions
    #[arg(short = 'U', long)]
    pub update_dependencies: bool,

    /// Requirements file of additional packages to ignore (repeatable)
    #[arg(long, value_name = "FILE")]
    pub ignore_additional: Vec<PathBuf>,

    /// Compile to bytecode (only when the local python matches the target)
    #[arg(long)]
    pub compile_python: bool,

    /// Remove .py sources (requires --compile-python)
    #[arg(long)]
    pub strip_python: bool,

    /// Remove test directories
    #[arg(long)]
    pub strip_tests: bool,

    /// Strip debug symbols from shared libraries
    #[arg(long)]
    pub strip_libraries: bool,

    /// Remove extension sources and headers
    #[arg(long)]
    pub strip_other: bool,

    /// Minify and gzip boto3/botocore data files
    #[arg(long)]
    pub compress_boto: bool,

    /// Replace pyarrow with a prebuilt, size-optimized build
    #[arg(long)]
    pub use_aws_pyarrow: bool,

    /// Optimization level, repeatable
    #[arg(short = 'O', action = ArgAction::Count)]
    pub optimize: u8,
}

impl BuildArgs {
    /// Project directory, accepting a path to one of its manifests
    pub fn project_root(&self) -> PathBuf {
        normalize_project_path(&self.project_path)
    }

    /// Overlay the flags onto a loaded configuration
    ///
    /// Flags can only switch options on; values given on the command line
    /// replace configured ones.
    pub fn apply_to(&self, config: &mut PackagerConfig) {
        config.apply_optimization_level(self.optimize.min(MAX_OPTIMIZATION_LEVEL));

        if let Some(version) = self.python_version {
            config.target.python_version = Some(version);
        }
        if let Some(arch) = self.architecture {
            config.target.architecture = arch;
        }
        if let Some(region) = &self.region {
            config.target.region = region.clone();
        }
        config.target.ignore_unsupported_python |= self.ignore_unsupported_python;

        let deps = &mut config.dependencies;
        deps.ignore_packages |= self.ignore_packages;
        deps.update_dependencies |= self.update_dependencies;
        deps.ignore_additional.extend(self.ignore_additional.iter().cloned());

        let opt = &mut config.optimize;
        opt.compile_python |= self.compile_python;
        opt.strip_python |= self.strip_python;
        opt.strip_tests |= self.strip_tests;
        opt.strip_libraries |= self.strip_libraries;
        opt.strip_other |= self.strip_other;
        opt.compress_boto |= self.compress_boto;
        opt.use_alternate_binary |= self.use_aws_pyarrow;

        let out = &mut config.output;
        if let Some(zip_path) = &self.zip_output {
            out.zip = true;
            if let Some(path) = zip_path {
                out.zip_path = Some(path.clone());
            }
        }
        if let Some(path) = &self.export_requirements {
            out.export_requirements = Some(path.clone());
        }
        out.split_layer |= self.split_layer;
        out.no_clobber |= self.no_clobber;
    }
}

/// A path to `pyproject.toml` or `requirements.txt` means its directory
pub fn normalize_project_path(path: &Path) -> PathBuf {
    let is_manifest = path
        .file_name()
        .is_some_and(|name| name == "pyproject.toml" || name == "requirements.txt");
    if is_manifest && path.is_file() {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => return parent.to_path_buf(),
            Some(_) => return PathBuf::from("."),
            None => {}
        }
    }
    path.to_path_buf()
}
