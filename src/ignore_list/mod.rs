// src/ignore_list/mod.rs

//! Packages already provided by the deployment runtime
//!
//! The Lambda Python runtime ships a handful of packages (boto3, botocore,
//! urllib3, ...). Bundling them again only wastes space, so the analyzer can
//! diff its resolved set against a name -> version document published per
//! region, architecture and interpreter version.
//!
//! Fetching is never fatal: any failure degrades to an empty map plus a
//! warning.

use crate::analyzer::requirements::{normalize_name, parse_declaration};
use crate::error::{Error, Result};
use crate::platform::TargetSpec;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default location of the published package lists
pub const DEFAULT_IGNORE_LIST_URL: &str = "https://raw.githubusercontent.com/mumblepins/aws-get-lambda-python-pkg-versions/main/{region}-python{python_version}-{architecture}.json";

/// Timeout for the ignore list request
pub const IGNORE_LIST_TIMEOUT: Duration = Duration::from_secs(30);

/// A package the runtime already provides
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvidedPackage {
    /// Name as published
    pub name: String,
    pub version: String,
}

/// Name -> version mapping of runtime-provided packages
///
/// Lookups use normalized names so `typing_extensions` matches
/// `typing-extensions`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IgnoreMap {
    entries: BTreeMap<String, ProvidedPackage>,
}

impl IgnoreMap {
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: impl Into<String>, version: impl Into<String>) {
        let name = name.into();
        self.entries.insert(
            normalize_name(&name),
            ProvidedPackage {
                name,
                version: version.into(),
            },
        );
    }

    /// Provided version for a package name
    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.entries.get(&normalize_name(name)).map(|p| p.version.as_str())
    }

    /// True when exactly this name and version is provided
    pub fn provides(&self, name: &str, version: &str) -> bool {
        self.version_of(name) == Some(version)
    }

    /// Entries of `other` override entries of `self`
    pub fn merge(&mut self, other: IgnoreMap) {
        self.entries.extend(other.entries);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProvidedPackage> {
        self.entries.values()
    }

    /// Parse the published JSON document (`{"boto3": "1.20.32", ...}`)
    pub fn from_json(body: &str) -> Result<Self> {
        let raw: BTreeMap<String, String> = serde_json::from_str(body)?;
        let mut map = Self::new();
        for (name, version) in raw {
            map.insert(name, version);
        }
        Ok(map)
    }

    /// Read pinned package lines (`name==version`) from a requirements file
    ///
    /// Lines without an exact pin cannot be compared against a resolved
    /// version and are skipped with a warning.
    pub fn from_requirements_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut map = Self::new();
        for line in content.lines() {
            let Some(declared) = parse_declaration(line) else {
                continue;
            };
            match declared.pinned_version() {
                Some(version) => map.insert(declared.name.clone(), version),
                None => warn!(
                    "Skipping '{}' in {}: only exact pins can be ignored",
                    line.trim(),
                    path.display()
                ),
            }
        }
        debug!("Loaded {} additional packages to ignore from {}", map.len(), path.display());
        Ok(map)
    }
}

impl<N: Into<String>, V: Into<String>> FromIterator<(N, V)> for IgnoreMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, version) in iter {
            map.insert(name, version);
        }
        map
    }
}

/// Supplies the provided-package map for a target
pub trait IgnoreListSource {
    fn fetch(&self, target: &TargetSpec) -> Result<IgnoreMap>;
}

/// Fetch from a source, degrading any failure to an empty map
pub fn load_or_empty(source: &dyn IgnoreListSource, target: &TargetSpec) -> IgnoreMap {
    match source.fetch(target) {
        Ok(map) => {
            info!("{} packages are provided by the runtime", map.len());
            map
        }
        Err(e) => {
            warn!("Failed to get packages to ignore: {}", e);
            IgnoreMap::new()
        }
    }
}

/// Ignore list published over HTTP
#[derive(Debug, Clone)]
pub struct HttpIgnoreList {
    url_template: String,
    timeout: Duration,
}

impl Default for HttpIgnoreList {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE_LIST_URL)
    }
}

impl HttpIgnoreList {
    pub fn new(url_template: impl Into<String>) -> Self {
        Self {
            url_template: url_template.into(),
            timeout: IGNORE_LIST_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Expand `{region}`, `{python_version}` and `{architecture}`
    pub fn url_for(&self, target: &TargetSpec) -> String {
        self.url_template
            .replace("{region}", &target.region)
            .replace("{python_version}", &target.python_version.to_string())
            .replace("{architecture}", target.architecture.as_str())
    }
}

impl IgnoreListSource for HttpIgnoreList {
    fn fetch(&self, target: &TargetSpec) -> Result<IgnoreMap> {
        let url = self.url_for(target);
        info!("Fetching runtime package list from {}", url);

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))?;
        let response = client
            .get(&url)
            .send()
            .map_err(|e| Error::DownloadError(format!("Failed to fetch {url}: {e}")))?;
        if !response.status().is_success() {
            return Err(Error::DownloadError(format!("HTTP {} from {}", response.status(), url)));
        }
        let body = response
            .text()
            .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))?;
        IgnoreMap::from_json(&body)
    }
}

/// Fixed in-memory ignore list
#[derive(Debug, Clone, Default)]
pub struct StaticIgnoreList(pub IgnoreMap);

impl IgnoreListSource for StaticIgnoreList {
    fn fetch(&self, _target: &TargetSpec) -> Result<IgnoreMap> {
        Ok(self.0.clone())
    }
}
