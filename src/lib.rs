// src/lib.rs

//! lambda-packager
//!
//! Bundles a Python project's dependencies for AWS Lambda: resolves them
//! through pip or poetry for the target interpreter and architecture, skips
//! what the runtime already provides, installs the rest and shrinks the
//! resulting tree with an ordered set of optimization steps.
//!
//! # Architecture
//!
//! - `analyzer`: one dependency model over two backends (pip, poetry)
//! - `packager`: the in-place optimization pipeline over the output tree
//! - `process`: every external command goes through a [`CommandRunner`]
//! - `ignore_list` and `fetcher`: the network collaborators, both behind traits

pub mod analyzer;
pub mod config;
mod error;
pub mod fetcher;
pub mod filesystem;
pub mod ignore_list;
pub mod packager;
pub mod platform;
pub mod process;

pub use analyzer::{DepAnalyzer, ProjectKind, ResolvedPackage};
pub use config::PackagerConfig;
pub use error::{Error, Result};
pub use packager::{LambdaPackager, PackageOutput, MAX_PACKAGE_SIZE};
pub use platform::{Architecture, PythonVersion, SupportedPlatforms, TargetSpec};
pub use process::{CommandRunner, SharedRunner, SystemRunner};
