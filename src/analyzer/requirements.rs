// src/analyzer/requirements.rs

//! Canonical requirement model
//!
//! Both backends normalize their output into a list of [`RequirementLine`]s:
//! concrete pinned packages plus opaque pip directives such as
//! `--index-url`. The same model is used to parse and rewrite flat
//! `requirements.txt` manifests.

use regex::Regex;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

/// `name[extras] [specifier] [; markers]`
static PACKAGE_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*([A-Za-z0-9](?:[A-Za-z0-9._-]*[A-Za-z0-9])?)\s*(\[[^\]]*\])?\s*([^;]*?)\s*(?:;\s*(.*?))?\s*$")
        .expect("package line pattern is valid")
});

static NAME_SEPARATORS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[-_.]+").expect("name separator pattern is valid"));

/// Normalize a distribution name for comparison (`Foo_Bar.baz` -> `foo-bar-baz`)
pub fn normalize_name(name: &str) -> String {
    NAME_SEPARATORS.replace_all(name.trim(), "-").to_lowercase()
}

/// One concrete dependency as the backend would install it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPackage {
    pub name: String,
    /// Exact version; empty for URL or path references
    pub version: String,
    /// Requirement text handed to pip
    pub raw: String,
}

impl ResolvedPackage {
    pub fn new(name: impl Into<String>, version: impl Into<String>, raw: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            raw: raw.into(),
        }
    }

    /// `name==version` with no markers
    pub fn pinned(name: impl Into<String>, version: impl Into<String>) -> Self {
        let name = name.into();
        let version = version.into();
        let raw = format!("{name}=={version}");
        Self { name, version, raw }
    }

    /// Normalized name used as the map key
    pub fn key(&self) -> String {
        normalize_name(&self.name)
    }

    /// Environment markers of the raw line, if any
    pub fn markers(&self) -> Option<&str> {
        self.raw
            .split_once(';')
            .map(|(_, markers)| markers.trim())
            .filter(|m| !m.is_empty())
    }

    /// The requirement without markers, used in log messages
    pub fn requirement(&self) -> &str {
        self.raw.split(';').next().unwrap_or(&self.raw).trim()
    }
}

/// A manifest line that is not a package declaration (`--index-url ...`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassthroughDirective {
    pub raw: String,
}

impl PassthroughDirective {
    pub fn new(raw: impl Into<String>) -> Self {
        Self { raw: raw.into() }
    }

    /// Split into command line arguments, honoring simple quoting
    pub fn args(&self) -> Vec<String> {
        split_args(&self.raw)
    }
}

/// Either a package or a directive, in manifest order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequirementLine {
    Package(ResolvedPackage),
    Directive(PassthroughDirective),
}

impl RequirementLine {
    pub fn as_package(&self) -> Option<&ResolvedPackage> {
        match self {
            Self::Package(p) => Some(p),
            Self::Directive(_) => None,
        }
    }

    pub fn as_directive(&self) -> Option<&PassthroughDirective> {
        match self {
            Self::Directive(d) => Some(d),
            Self::Package(_) => None,
        }
    }
}

impl fmt::Display for RequirementLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Package(p) => write!(f, "{}", p.raw),
            Self::Directive(d) => write!(f, "{}", d.raw),
        }
    }
}

/// A declared (not resolved) package line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredRequirement {
    pub name: String,
    /// Requested extras as written, e.g. `[socks]`
    pub extras: Option<String>,
    /// Text between the name and the markers, e.g. `==1.2.3` or `>=2,<3`
    pub specifier: String,
    pub markers: Option<String>,
}

impl DeclaredRequirement {
    /// The pinned version for `==X` specifiers
    pub fn pinned_version(&self) -> Option<&str> {
        let spec = self.specifier.strip_prefix("==")?.trim();
        (!spec.is_empty() && !spec.contains(',') && !spec.contains('*')).then_some(spec)
    }

    /// Pinned version when exact, otherwise the specifier as written
    pub fn declared_spec(&self) -> String {
        self.pinned_version()
            .map(str::to_string)
            .unwrap_or_else(|| self.specifier.clone())
    }
}

fn strip_comment(line: &str) -> &str {
    // pip treats ` #` as the start of an inline comment
    match line.find(" #").or_else(|| line.find("\t#")) {
        Some(idx) => &line[..idx],
        None => line,
    }
}

/// Parse a package declaration, ignoring directives, comments and blanks
pub fn parse_declaration(line: &str) -> Option<DeclaredRequirement> {
    let line = strip_comment(line).trim();
    if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
        return None;
    }
    let caps = PACKAGE_LINE.captures(line)?;
    Some(DeclaredRequirement {
        name: caps.get(1)?.as_str().to_string(),
        extras: caps.get(2).map(|m| m.as_str().replace(' ', "")).filter(|e| e != "[]"),
        specifier: caps.get(3).map(|m| m.as_str().trim().to_string()).unwrap_or_default(),
        markers: caps.get(4).map(|m| m.as_str().trim().to_string()).filter(|m| !m.is_empty()),
    })
}

/// Parse one manifest line into the canonical model
pub fn parse_requirement_line(line: &str) -> Option<RequirementLine> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return None;
    }
    if trimmed.starts_with('-') {
        return Some(RequirementLine::Directive(PassthroughDirective::new(
            strip_comment(trimmed).trim(),
        )));
    }
    let declared = parse_declaration(trimmed)?;
    let version = declared.pinned_version().unwrap_or_default().to_string();
    Some(RequirementLine::Package(ResolvedPackage::new(
        declared.name,
        version,
        strip_comment(trimmed).trim(),
    )))
}

/// Parse a whole flat manifest
pub fn parse_requirements(text: &str) -> Vec<RequirementLine> {
    text.lines().filter_map(parse_requirement_line).collect()
}

/// Rewrite a flat manifest, applying version corrections
///
/// `corrections` is keyed by normalized name. Matching declaration lines
/// are replaced in place with `name[extras]==version`, keeping their
/// extras and markers.
/// Every other line (directives, comments, blanks) is kept verbatim and in
/// order. Corrections with no matching line are appended at the end.
pub fn rewrite_requirements(text: &str, corrections: &BTreeMap<String, ResolvedPackage>) -> String {
    let mut applied = std::collections::BTreeSet::new();
    let mut out = Vec::new();

    for line in text.lines() {
        let replacement = parse_declaration(line).and_then(|declared| {
            let key = normalize_name(&declared.name);
            corrections.get(&key).map(|pkg| {
                applied.insert(key);
                let pinned = format!(
                    "{}{}=={}",
                    declared.name,
                    declared.extras.as_deref().unwrap_or_default(),
                    pkg.version
                );
                match &declared.markers {
                    Some(markers) => format!("{pinned} ; {markers}"),
                    None => pinned,
                }
            })
        });
        out.push(replacement.unwrap_or_else(|| line.to_string()));
    }

    for (key, pkg) in corrections {
        if !applied.contains(key) {
            out.push(pkg.raw.clone());
        }
    }

    let mut rendered = out.join("\n");
    rendered.push('\n');
    rendered
}

/// Minimal shell-style argument splitting for directive lines
fn split_args(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut quote: Option<char> = None;
    let mut in_arg = false;

    for c in line.chars() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some(_), c) => current.push(c),
            (None, '\'' | '"') => {
                quote = Some(c);
                in_arg = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_arg {
                    args.push(std::mem::take(&mut current));
                    in_arg = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_arg = true;
            }
        }
    }
    if in_arg {
        args.push(current);
    }
    args
}
