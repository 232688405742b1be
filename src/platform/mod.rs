// src/platform/mod.rs

//! Target platform model
//!
//! Describes the deployment target a bundle is built for: interpreter
//! version, CPU architecture and region. The table of supported runtimes is
//! an immutable [`SupportedPlatforms`] value built once at startup and passed
//! by reference to whoever needs to validate a target.

use crate::error::{Error, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;
use tracing::{debug, warn};

/// Markdown source of the Lambda runtime table
pub const LAMBDA_RUNTIME_DOCS_URL: &str =
    "https://raw.githubusercontent.com/awsdocs/aws-lambda-developer-guide/main/doc_source/lambda-runtimes.md";

const DOCS_TIMEOUT: Duration = Duration::from_secs(10);

static RUNTIME_ROW: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^.*?\|\s*`(python3\.\d+)`\s*\|.*?\|\s*([armx864 \\_,]+)\s*\|.*$")
        .expect("runtime row pattern is valid")
});

/// Target CPU architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Architecture {
    /// x86_64 / AMD64
    #[default]
    X86_64,
    /// AArch64 / ARM64
    Arm64,
}

impl Architecture {
    /// Parse from string, accepting the common aliases
    pub fn parse(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            other => Err(Error::UnknownArchitecture(other.to_string())),
        }
    }

    /// Name used by the Lambda service and the ignore-list URLs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
        }
    }

    /// GNU machine name
    pub fn machine(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "aarch64",
        }
    }

    /// Binary compatibility tag passed to `pip --platform`
    pub fn platform_tag(&self) -> &'static str {
        match self {
            Self::X86_64 => "manylinux2014_x86_64",
            Self::Arm64 => "manylinux2014_aarch64",
        }
    }
}

impl std::fmt::Display for Architecture {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Architecture {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Interpreter version, reduced to `major.minor`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PythonVersion {
    pub major: u32,
    pub minor: u32,
}

impl PythonVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Parse `3.9`, `python3.9` or `3.9.7`
    pub fn parse(s: &str) -> Result<Self> {
        let trimmed = s.trim().to_lowercase();
        let digits = trimmed.trim_start_matches("python").trim();
        let mut parts = digits.split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => Ok(Self { major, minor }),
            _ => Err(Error::InvalidPythonVersion(s.to_string())),
        }
    }

    /// ABI tag for CPython, e.g. `cp39`
    pub fn abi_tag(&self) -> String {
        format!("cp{}{}", self.major, self.minor)
    }

    /// Runtime identifier, e.g. `python3.9`
    pub fn runtime_name(&self) -> String {
        format!("python{self}")
    }
}

impl std::fmt::Display for PythonVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

impl std::str::FromStr for PythonVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for PythonVersion {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PythonVersion {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// Everything that identifies the deployment target of one packaging run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetSpec {
    pub python_version: PythonVersion,
    pub architecture: Architecture,
    pub region: String,
}

impl TargetSpec {
    pub fn new(python_version: PythonVersion, architecture: Architecture, region: impl Into<String>) -> Self {
        Self {
            python_version,
            architecture,
            region: region.into(),
        }
    }
}

impl Default for TargetSpec {
    fn default() -> Self {
        Self::new(PythonVersion::new(3, 9), Architecture::X86_64, "us-east-1")
    }
}

/// Immutable table of supported (interpreter, architecture) runtimes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupportedPlatforms {
    entries: BTreeSet<(PythonVersion, Architecture)>,
}

impl SupportedPlatforms {
    /// Runtimes known at build time
    pub fn builtin() -> Self {
        let entries = (9..=13)
            .flat_map(|minor| {
                [Architecture::X86_64, Architecture::Arm64]
                    .into_iter()
                    .map(move |arch| (PythonVersion::new(3, minor), arch))
            })
            .collect();
        Self { entries }
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (PythonVersion, Architecture)>) -> Self {
        Self {
            entries: entries.into_iter().collect(),
        }
    }

    /// Refresh the table from the Lambda runtime documentation
    ///
    /// Any failure (network, HTTP status, nothing parseable) falls back to
    /// [`SupportedPlatforms::builtin`].
    pub fn fetch() -> Self {
        match fetch_runtime_docs() {
            Ok(body) => {
                let parsed = Self::parse_runtime_docs(&body);
                if parsed.entries.is_empty() {
                    warn!("No python runtimes found in runtime documentation, using built-in table");
                    Self::builtin()
                } else {
                    debug!("Loaded {} runtimes from documentation", parsed.entries.len());
                    parsed
                }
            }
            Err(e) => {
                warn!("Failed to fetch Lambda runtime table: {}, using built-in table", e);
                Self::builtin()
            }
        }
    }

    /// Parse the markdown runtime table
    pub fn parse_runtime_docs(markdown: &str) -> Self {
        let mut entries = BTreeSet::new();
        for line in markdown.lines() {
            let Some(caps) = RUNTIME_ROW.captures(line) else {
                continue;
            };
            let Ok(version) = PythonVersion::parse(&caps[1]) else {
                continue;
            };
            for arch in caps[2].split(',') {
                let arch = arch.trim().replace(r"\_", "_");
                if let Ok(arch) = Architecture::parse(&arch) {
                    entries.insert((version, arch));
                }
            }
        }
        Self { entries }
    }

    pub fn contains(&self, version: PythonVersion, arch: Architecture) -> bool {
        self.entries.contains(&(version, arch))
    }

    /// Fail with [`Error::UnsupportedPlatform`] unless the target is listed
    pub fn check(&self, target: &TargetSpec) -> Result<()> {
        if self.contains(target.python_version, target.architecture) {
            Ok(())
        } else {
            Err(Error::UnsupportedPlatform {
                python_version: target.python_version.to_string(),
                architecture: target.architecture.to_string(),
            })
        }
    }

    /// Clamp a requested interpreter version into the supported range
    ///
    /// Returns `None` when the architecture has no runtimes at all.
    pub fn runtime_for(&self, arch: Architecture, requested: PythonVersion) -> Option<PythonVersion> {
        let versions: Vec<PythonVersion> = self
            .entries
            .iter()
            .filter(|(_, a)| *a == arch)
            .map(|(v, _)| *v)
            .collect();
        let min = versions.iter().min()?;
        let max = versions.iter().max()?;
        Some(requested.clamp(*min, *max))
    }

    pub fn iter(&self) -> impl Iterator<Item = &(PythonVersion, Architecture)> {
        self.entries.iter()
    }
}

fn fetch_runtime_docs() -> Result<String> {
    let client = reqwest::blocking::Client::builder()
        .timeout(DOCS_TIMEOUT)
        .build()
        .map_err(|e| Error::DownloadError(format!("Failed to create HTTP client: {e}")))?;
    let response = client
        .get(LAMBDA_RUNTIME_DOCS_URL)
        .send()
        .map_err(|e| Error::DownloadError(format!("Failed to fetch {LAMBDA_RUNTIME_DOCS_URL}: {e}")))?;
    if !response.status().is_success() {
        return Err(Error::DownloadError(format!(
            "HTTP {} from {}",
            response.status(),
            LAMBDA_RUNTIME_DOCS_URL
        )));
    }
    response
        .text()
        .map_err(|e| Error::DownloadError(format!("Failed to read response: {e}")))
}
