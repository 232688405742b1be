// src/commands.rs
//! Command implementations for the lambda-packager binary

use crate::cli::BuildArgs;
use anyhow::{Context, Result};
use lambda_packager::config::PackagerConfig;
use lambda_packager::fetcher::PyArrowReleaseFetcher;
use lambda_packager::filesystem::format_size;
use lambda_packager::ignore_list::HttpIgnoreList;
use lambda_packager::packager::{resolve_python_version, LambdaPackager, PackageOutput};
use lambda_packager::platform::SupportedPlatforms;
use lambda_packager::process::{SharedRunner, SystemRunner};
use std::sync::Arc;
use tracing::{debug, info};

/// Runtime table, optionally refreshed from the documentation
fn supported_platforms(refresh: bool) -> SupportedPlatforms {
    if refresh {
        SupportedPlatforms::fetch()
    } else {
        SupportedPlatforms::builtin()
    }
}

/// Merge configuration sources and the command line
///
/// An invalid option combination is reported as a usage error.
pub fn build_config(args: &BuildArgs) -> Result<PackagerConfig> {
    let project_root = args.project_root();
    let mut config = PackagerConfig::load(&project_root, args.config.as_deref())
        .with_context(|| format!("Failed to load configuration for {}", project_root.display()))?;
    args.apply_to(&mut config);
    if let Err(e) = config.validate() {
        use clap::CommandFactory;
        crate::cli::Cli::command()
            .error(clap::error::ErrorKind::ArgumentConflict, e.to_string())
            .exit();
    }
    Ok(config)
}

pub fn cmd_build(args: BuildArgs) -> Result<()> {
    let project_root = args.project_root();
    let mut config = build_config(&args)?;
    debug!("Configuration: {:?}", config);

    let runner: SharedRunner = Arc::new(SystemRunner::new());
    let platforms = supported_platforms(args.refresh_platforms);
    let python_version = resolve_python_version(
        config.target.python_version,
        runner.as_ref(),
        &platforms,
        config.target.architecture,
    );
    config.target.python_version = Some(python_version);

    let ignore_source = HttpIgnoreList::new(config.dependencies.ignore_list_url.clone());
    let mut packager = LambdaPackager::new(
        &project_root,
        &args.output_path,
        &config,
        &platforms,
        runner,
        Box::new(ignore_source),
        Box::new(PyArrowReleaseFetcher::new()),
    )
    .with_context(|| format!("Failed to set up packaging for {}", project_root.display()))?;

    let output = packager.package().context("Packaging failed")?;
    packager.close()?;
    report(&output);
    Ok(())
}

fn report(output: &PackageOutput) {
    info!("Package directory: {}", output.main_dir.display());
    if let Some(layer) = &output.layer_dir {
        info!("Layer directory: {}", layer.display());
    }
    if let Some(archive) = &output.archive {
        info!("Archive: {}", archive.display());
    }
    info!(
        "Final size {} (from {})",
        format_size(output.size),
        format_size(output.initial_size)
    );
}

pub fn cmd_platforms(refresh: bool) -> Result<()> {
    let platforms = supported_platforms(refresh);
    println!("{:<12} {}", "RUNTIME", "ARCHITECTURE");
    for (version, arch) in platforms.iter() {
        println!("{:<12} {}", version.runtime_name(), arch);
    }
    Ok(())
}
