// src/analyzer/pip.rs

//! Flat-manifest backend (`requirements.txt`)
//!
//! Resolution installs the declared requirements, binary-only, into a
//! throwaway directory and reads back the `*.dist-info/METADATA` headers of
//! whatever pip decided to install. That yields exact versions for the
//! whole closure without implementing a resolver.

use super::requirements::{self, parse_declaration, PassthroughDirective, RequirementLine, ResolvedPackage};
use super::workspace::ScratchDir;
use super::BackendContext;
use crate::error::Result;
use crate::process::run_command;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Directives that only make sense relative to the original manifest
const NON_INSTALL_DIRECTIVES: &[&str] = &["-r", "--requirement", "-c", "--constraint", "-e", "--editable"];

#[derive(Debug, Default)]
pub struct PipBackend;

impl PipBackend {
    pub const MANIFEST_FILES: &'static [&'static str] = &[REQUIREMENTS_FILE];

    pub fn new() -> Self {
        Self
    }

    pub(super) fn resolve(&self, ctx: &BackendContext<'_>) -> Result<Vec<RequirementLine>> {
        let manifest = ctx.workspace.file(REQUIREMENTS_FILE);
        let mut scratch = ScratchDir::new("lambda-packager-resolve-")?;

        let spec = ctx
            .pip
            .install(&[])
            .arg("--only-binary=:all:")
            .arg("--target")
            .arg(scratch.path())
            .arg("-r")
            .arg(&manifest)
            .current_dir(ctx.workspace.path())
            .quiet(true);
        run_command(ctx.runner, &spec)?;

        let mut lines: Vec<RequirementLine> = manifest_directives(&fs::read_to_string(&manifest)?)
            .into_iter()
            .map(RequirementLine::Directive)
            .collect();
        let installed = read_installed_distributions(scratch.path())?;
        info!("Resolved {} packages", installed.len());
        lines.extend(installed.into_iter().map(RequirementLine::Package));

        scratch.close()?;
        Ok(lines)
    }

    pub(super) fn rewrite_manifest(
        &self,
        ctx: &BackendContext<'_>,
        corrections: &BTreeMap<String, ResolvedPackage>,
    ) -> Result<()> {
        debug!(
            "Updating requirements.txt with {}",
            corrections.values().map(|p| p.raw.as_str()).collect::<Vec<_>>().join(", ")
        );
        let manifest = ctx.workspace.file(REQUIREMENTS_FILE);
        let original = fs::read_to_string(&manifest)?;
        fs::write(&manifest, requirements::rewrite_requirements(&original, corrections))?;
        Ok(())
    }

    /// Declared name -> pinned version (or the specifier when not pinned)
    pub(super) fn direct_dependencies(&self, project_root: &Path) -> Result<BTreeMap<String, String>> {
        let content = fs::read_to_string(project_root.join(REQUIREMENTS_FILE))?;
        Ok(content
            .lines()
            .filter_map(parse_declaration)
            .map(|d| {
                let spec = d.declared_spec();
                (d.name, spec)
            })
            .collect())
    }
}

/// Install-relevant directive lines of a flat manifest
fn manifest_directives(content: &str) -> Vec<PassthroughDirective> {
    requirements::parse_requirements(content)
        .into_iter()
        .filter_map(|line| match line {
            RequirementLine::Directive(d) => Some(d),
            RequirementLine::Package(_) => None,
        })
        .filter(|d| {
            let keep = d
                .args()
                .first()
                .is_some_and(|flag| !NON_INSTALL_DIRECTIVES.iter().any(|skip| flag == skip || flag.starts_with(&format!("{skip}="))));
            if !keep {
                debug!("Not carrying directive '{}' into the install", d.raw);
            }
            keep
        })
        .collect()
}

/// Read `Name`/`Version` from every top-level `*.dist-info/METADATA`
pub fn read_installed_distributions(dir: &Path) -> Result<Vec<ResolvedPackage>> {
    let mut packages = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_dist_info = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(".dist-info"));
        if !is_dist_info || !path.is_dir() {
            continue;
        }
        let metadata = path.join("METADATA");
        if !metadata.exists() {
            debug!("{} has no METADATA, skipping", path.display());
            continue;
        }
        let content = fs::read_to_string(&metadata)?;
        if let Some((name, version)) = parse_metadata_headers(&content) {
            packages.push(ResolvedPackage::pinned(name, version));
        }
    }
    packages.sort_by_key(|p| p.key());
    Ok(packages)
}

/// `Name:` and `Version:` from the header block of a core metadata file
fn parse_metadata_headers(content: &str) -> Option<(String, String)> {
    let mut name = None;
    let mut version = None;
    for line in content.lines() {
        if line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.strip_prefix("Name:") {
            name.get_or_insert_with(|| value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Version:") {
            version.get_or_insert_with(|| value.trim().to_string());
        }
    }
    Some((name?, version?))
}
