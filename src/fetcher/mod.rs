// src/fetcher/mod.rs

//! Prebuilt replacements for heavy binary packages
//!
//! The stock pyarrow wheel is far larger than the size ceiling allows for
//! comfortably. Trimmed builds are published as GitHub release assets, one
//! release per `{version}-py{X.Y}` and one tarball per architecture. The
//! tarball's `python/` directory is laid out like an installed package tree
//! and is merged straight into the output directory.

use crate::error::{Error, Result};
use crate::filesystem;
use crate::platform::TargetSpec;
use flate2::read::GzDecoder;
use serde::Deserialize;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tar::Archive;
use tracing::{debug, info};

/// GitHub release lookup for prebuilt pyarrow tarballs
pub const PYARROW_RELEASE_URL: &str =
    "https://api.github.com/repos/mumblepins/pyarrow-builder/releases/tags/{version}-py{python_version}";

const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Supplies a platform-matched prebuilt build of one package
pub trait AlternateBinaryFetcher {
    /// Distribution name of the package being replaced
    fn package(&self) -> &str;

    /// Install a prebuilt `version` into `output_dir`
    ///
    /// Returns `Ok(None)` when no build exists for this version and target.
    fn fetch(&self, output_dir: &Path, version: &str, target: &TargetSpec) -> Result<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct Release {
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Prebuilt pyarrow from GitHub releases, cached on disk
#[derive(Debug, Clone)]
pub struct PyArrowReleaseFetcher {
    release_url: String,
    cache_dir: PathBuf,
}

impl Default for PyArrowReleaseFetcher {
    fn default() -> Self {
        Self::new()
    }
}

impl PyArrowReleaseFetcher {
    pub fn new() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("lambda-packager")
            .join("prebuilt");
        Self {
            release_url: PYARROW_RELEASE_URL.to_string(),
            cache_dir,
        }
    }

    pub fn with_cache_dir(mut self, cache_dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = cache_dir.into();
        self
    }

    fn client() -> Result<reqwest::blocking::Client> {
        reqwest::blocking::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("lambda-packager/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))
    }

    fn asset_url(&self, client: &reqwest::blocking::Client, version: &str, target: &TargetSpec) -> Result<Option<String>> {
        let url = self
            .release_url
            .replace("{version}", version)
            .replace("{python_version}", &target.python_version.to_string());
        debug!("Looking up prebuilt release {}", url);

        let response = client
            .get(&url)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {url}: {e}")))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!("HTTP {} from {}", response.status(), url)));
        }
        let release: Release = response
            .json()
            .map_err(|e| Error::DownloadError(format!("Failed to parse release JSON: {e}")))?;
        Ok(select_asset(&release, version, target))
    }

    /// Download into the cache unless already there
    fn download(&self, client: &reqwest::blocking::Client, url: &str) -> Result<PathBuf> {
        let file_name = url.rsplit('/').next().filter(|n| !n.is_empty()).unwrap_or("prebuilt.tar.gz");
        let cached = self.cache_dir.join(file_name);
        if cached.exists() {
            info!("Using cached {}", cached.display());
            return Ok(cached);
        }

        info!("Downloading {}", url);
        let response = client
            .get(url)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!("HTTP {} from {}", response.status(), url)));
        }
        let bytes = response
            .bytes()
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;

        fs::create_dir_all(&self.cache_dir)?;
        let mut partial = tempfile::NamedTempFile::new_in(&self.cache_dir)?;
        partial.write_all(&bytes)?;
        partial.persist(&cached).map_err(|e| Error::Io(e.error))?;
        Ok(cached)
    }
}

impl AlternateBinaryFetcher for PyArrowReleaseFetcher {
    fn package(&self) -> &str {
        "pyarrow"
    }

    fn fetch(&self, output_dir: &Path, version: &str, target: &TargetSpec) -> Result<Option<String>> {
        let client = Self::client()?;
        let Some(url) = self.asset_url(&client, version, target)? else {
            return Ok(None);
        };
        let archive = self.download(&client, &url)?;
        install_prebuilt_archive(&archive, output_dir)?;
        Ok(Some(version.to_string()))
    }
}

/// Asset whose name ends with `{version}-py{X.Y}-{machine}.tar.gz`
fn select_asset(release: &Release, version: &str, target: &TargetSpec) -> Option<String> {
    let suffix = format!(
        "{}-py{}-{}.tar.gz",
        version,
        target.python_version,
        target.architecture.machine()
    );
    release
        .assets
        .iter()
        .find(|asset| asset.name.ends_with(&suffix))
        .map(|asset| asset.browser_download_url.clone())
}

/// Extract a prebuilt tarball and merge its `python/` tree into `output_dir`
pub fn install_prebuilt_archive(archive: &Path, output_dir: &Path) -> Result<usize> {
    let scratch = tempfile::tempdir()?;
    let mut tar = Archive::new(GzDecoder::new(File::open(archive)?));
    tar.unpack(scratch.path())?;

    let python = scratch.path().join("python");
    if !python.is_dir() {
        return Err(Error::DownloadError(format!(
            "{} has no python/ directory",
            archive.display()
        )));
    }

    fs::create_dir_all(output_dir)?;
    let mut merged = 0;
    for entry in fs::read_dir(&python)? {
        let entry = entry?;
        filesystem::copy_path(&entry.path(), &output_dir.join(entry.file_name()))?;
        merged += 1;
    }
    debug!("Merged {} entries from {}", merged, archive.display());
    Ok(merged)
}
