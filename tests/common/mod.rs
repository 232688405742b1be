// tests/common/mod.rs

//! Shared test utilities and helpers for integration tests.
//!
//! [`FakeRunner`] stands in for pip, poetry, python and strip so the
//! analyzer and the packaging pipeline run end to end without network
//! access or a Python installation.

#![allow(dead_code)]

use lambda_packager::fetcher::AlternateBinaryFetcher;
use lambda_packager::ignore_list::{IgnoreMap, StaticIgnoreList};
use lambda_packager::process::{CommandOutput, CommandRunner, CommandSpec};
use lambda_packager::{PackagerConfig, TargetSpec};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// Package name -> (version installed when unpinned, dependencies)
fn fake_index() -> BTreeMap<&'static str, (&'static str, Vec<&'static str>)> {
    BTreeMap::from([
        ("boto3", ("1.20.32", vec!["botocore", "jmespath", "s3transfer"])),
        ("botocore", ("1.23.32", vec!["jmespath", "urllib3", "python-dateutil"])),
        ("jmespath", ("0.10.0", vec![])),
        ("s3transfer", ("0.5.0", vec!["botocore"])),
        ("urllib3", ("1.26.9", vec![])),
        ("python-dateutil", ("2.8.2", vec!["six"])),
        ("six", ("1.16.0", vec![])),
        ("requests", ("2.27.1", vec!["urllib3", "idna", "certifi", "charset-normalizer"])),
        ("idna", ("3.3", vec![])),
        ("certifi", ("2021.10.8", vec![])),
        ("charset-normalizer", ("2.0.12", vec![])),
        ("pyarrow", ("7.0.0", vec!["numpy"])),
        ("numpy", ("1.22.3", vec![])),
    ])
}

/// Versions provided by the runtime for the packages above
pub fn runtime_ignore_map() -> IgnoreMap {
    [
        ("boto3", "1.20.32"),
        ("botocore", "1.23.32"),
        ("jmespath", "0.10.0"),
        ("s3transfer", "0.5.0"),
        ("urllib3", "1.26.9"),
        ("python-dateutil", "2.8.2"),
        ("six", "1.16.0"),
    ]
    .into_iter()
    .collect()
}

pub fn static_ignores(map: IgnoreMap) -> Box<StaticIgnoreList> {
    Box::new(StaticIgnoreList(map))
}

/// Scripted stand-in for external commands
pub struct FakeRunner {
    /// Interpreter version reported by `python -c ...`, `None` for no python
    pub python_version: Option<String>,
    /// Exit code of `python -m compileall`
    pub compile_exit: i32,
    /// Version reported by `poetry --version`, `None` when poetry is missing
    pub poetry_version: Option<String>,
    /// Whether the lock freshness check passes
    pub lock_fresh: bool,
    /// `poetry add` scribbles over pyproject.toml and fails
    pub poetry_add_fails: bool,
    /// `poetry build` fails
    pub poetry_build_fails: bool,
    pub calls: Mutex<Vec<Vec<String>>>,
    /// Full specs of every command, for cwd and environment checks
    pub specs: Mutex<Vec<CommandSpec>>,
}

impl Default for FakeRunner {
    fn default() -> Self {
        Self {
            python_version: None,
            compile_exit: 0,
            poetry_version: None,
            lock_fresh: true,
            poetry_add_fails: false,
            poetry_build_fails: false,
            calls: Mutex::new(Vec::new()),
            specs: Mutex::new(Vec::new()),
        }
    }
}

impl FakeRunner {
    pub fn with_python(version: &str, compile_exit: i32) -> Self {
        Self {
            python_version: Some(version.to_string()),
            compile_exit,
            ..Self::default()
        }
    }

    pub fn with_poetry(version: &str) -> Self {
        Self {
            poetry_version: Some(version.to_string()),
            ..Self::default()
        }
    }

    /// Recorded specs whose program name is `program`
    pub fn specs_for(&self, program: &str) -> Vec<CommandSpec> {
        self.specs
            .lock()
            .unwrap()
            .iter()
            .filter(|spec| spec.display_name() == program)
            .cloned()
            .collect()
    }

    /// Recorded invocations whose program name is `program`
    pub fn calls_to(&self, program: &str) -> Vec<Vec<String>> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call[0] == program)
            .cloned()
            .collect()
    }

    fn ok(stdout: &str) -> CommandOutput {
        CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    fn failed(stderr: &str) -> CommandOutput {
        CommandOutput {
            code: Some(1),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    fn poetry(&self, spec: &CommandSpec, args: &[String]) -> CommandOutput {
        let cwd = spec.cwd.clone().expect("poetry runs in a project directory");
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["--version"] => Self::ok(&format!(
                "Poetry (version {})\n",
                self.poetry_version.clone().unwrap_or_default()
            )),
            ["check", "--lock"] | ["lock", "--check"] => {
                if self.lock_fresh {
                    Self::ok("All set!\n")
                } else {
                    Self::failed("pyproject.toml changed significantly since poetry.lock was last generated.")
                }
            }
            ["lock", ..] => Self::ok("Resolving dependencies...\n"),
            ["add", "--lock", pins @ ..] => {
                if self.poetry_add_fails {
                    fs::write(cwd.join("pyproject.toml"), "[tool.poetry.dependencies\n").unwrap();
                    return Self::failed("SolverProblemError");
                }
                for pin in pins {
                    let (name, version) = pin.split_once("==").expect("pinned requirement");
                    pin_in_pyproject(&cwd.join("pyproject.toml"), name, version);
                    pin_in_lock(&cwd.join("poetry.lock"), name, version);
                }
                Self::ok("Writing lock file\n")
            }
            ["build", "--format", "sdist"] => {
                if self.poetry_build_fails {
                    return Self::failed("Building handler (0.1.0)\nNo file/folder found for package handler");
                }
                fs::create_dir_all(cwd.join("dist")).unwrap();
                fs::write(cwd.join("dist/handler-0.1.0.tar.gz"), b"sdist").unwrap();
                Self::ok("Building handler (0.1.0)\n")
            }
            other => panic!("unexpected poetry invocation {other:?}"),
        }
    }

    fn pip(&self, args: &[String]) -> CommandOutput {
        let target = args
            .iter()
            .position(|a| a == "--target")
            .map(|i| PathBuf::from(&args[i + 1]))
            .expect("fake pip needs --target");

        if let Some(i) = args.iter().position(|a| a == "-r") {
            let content = fs::read_to_string(&args[i + 1]).expect("requirements file readable");
            install_closure(&target, &content);
        } else if let Some(i) = args.iter().position(|a| a == "--no-deps") {
            for requirement in &args[i + 1..] {
                if requirement.ends_with(".tar.gz") {
                    install_package(&target, "handler", "0.1.0");
                    continue;
                }
                let (name, version) = requirement.split_once("==").expect("pinned requirement");
                install_package(&target, name, version);
            }
        }
        Self::ok("")
    }

    fn python(&self, args: &[String]) -> CommandOutput {
        if args.first().map(String::as_str) == Some("-c") {
            return Self::ok(&format!("{}\n", self.python_version.clone().unwrap_or_default()));
        }
        let root = PathBuf::from(args.last().expect("compileall directory"));
        if self.compile_exit == 0 {
            for entry in walkdir::WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if entry.path().extension().is_some_and(|ext| ext == "py") {
                    fs::write(entry.path().with_extension("pyc"), b"bytecode").unwrap();
                }
            }
        }
        CommandOutput {
            code: Some(self.compile_exit),
            stdout: String::new(),
            stderr: if self.compile_exit == 0 { String::new() } else { "SyntaxError".to_string() },
        }
    }
}

impl CommandRunner for FakeRunner {
    fn execute(&self, spec: &CommandSpec) -> lambda_packager::Result<CommandOutput> {
        let name = spec.display_name();
        let args = spec.display_args();
        let mut call = vec![name.clone()];
        call.extend(args.iter().cloned());
        self.calls.lock().unwrap().push(call);
        self.specs.lock().unwrap().push(spec.clone());

        Ok(match name.as_str() {
            "pip" => self.pip(&args),
            "poetry" => self.poetry(spec, &args),
            n if n.starts_with("python") => self.python(&args),
            _ => Self::ok(""),
        })
    }

    fn locate(&self, program: &str) -> Option<PathBuf> {
        let found = match program {
            "pip" | "strip" => true,
            "python3" => self.python_version.is_some(),
            "poetry" => self.poetry_version.is_some(),
            _ => false,
        };
        found.then(|| PathBuf::from("/fake/bin").join(program))
    }
}

/// What `poetry add name==version` does to the declaration table
fn pin_in_pyproject(path: &Path, name: &str, version: &str) {
    let content = fs::read_to_string(path).unwrap();
    let prefix = format!("{name} =");
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line.starts_with(&prefix) {
                found = true;
                format!("{name} = \"{version}\"")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !found {
        lines.push(format!("{name} = \"{version}\""));
    }
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

/// What re-locking after `poetry add` does to the locked version
fn pin_in_lock(path: &Path, name: &str, version: &str) {
    let content = fs::read_to_string(path).unwrap();
    let header = format!("name = \"{name}\"");
    let mut in_package = false;
    let lines: Vec<String> = content
        .lines()
        .map(|line| {
            if line == header {
                in_package = true;
            } else if in_package && line.starts_with("version = ") {
                in_package = false;
                return format!("version = \"{version}\"");
            }
            line.to_string()
        })
        .collect();
    fs::write(path, lines.join("\n") + "\n").unwrap();
}

/// Install a manifest's requirements and everything they pull in
fn install_closure(target: &Path, manifest: &str) {
    let index = fake_index();
    let mut chosen: BTreeMap<String, String> = BTreeMap::new();
    let mut queue: Vec<String> = Vec::new();

    for line in manifest.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') || line.starts_with('-') {
            continue;
        }
        let line = line.split(';').next().unwrap().trim();
        let (name, version) = match line.split_once("==") {
            Some((name, version)) => (name.trim().to_lowercase(), version.trim().to_string()),
            None => {
                let name: String = line
                    .chars()
                    .take_while(|c| c.is_alphanumeric() || *c == '-' || *c == '_' || *c == '.')
                    .collect::<String>()
                    .to_lowercase();
                let version = index[name.as_str()].0.to_string();
                (name, version)
            }
        };
        chosen.insert(name.clone(), version);
        queue.push(name);
    }

    while let Some(name) = queue.pop() {
        for dep in &index[name.as_str()].1 {
            if !chosen.contains_key(*dep) {
                chosen.insert(dep.to_string(), index[dep].0.to_string());
                queue.push(dep.to_string());
            }
        }
    }

    for (name, version) in chosen {
        install_package(target, &name, &version);
    }
}

/// A minimal installed distribution: code directory plus dist-info
pub fn install_package(target: &Path, name: &str, version: &str) {
    let module = name.replace('-', "_");
    let code = target.join(&module);
    fs::create_dir_all(code.join("tests")).unwrap();
    fs::write(code.join("__init__.py"), format!("__version__ = \"{version}\"\n")).unwrap();
    fs::write(code.join("tests/test_basic.py"), "def test_nothing():\n    pass\n").unwrap();
    fs::write(code.join("_speedups.c"), "/* c source */\n").unwrap();

    if name == "botocore" {
        let data = code.join("data/s3/2006-03-01");
        fs::create_dir_all(&data).unwrap();
        fs::write(
            data.join("service-2.json"),
            "{\n  \"version\": \"2.0\",\n  \"metadata\": {\"protocol\": \"rest-xml\"}\n}\n",
        )
        .unwrap();
    }

    let dist_info = target.join(format!("{module}-{version}.dist-info"));
    fs::create_dir_all(&dist_info).unwrap();
    fs::write(
        dist_info.join("METADATA"),
        format!("Metadata-Version: 2.1\nName: {name}\nVersion: {version}\n\n{name} description\n"),
    )
    .unwrap();
}

/// Fetcher that never finds a build, optionally after leaving debris
pub struct MissingFetcher;

impl AlternateBinaryFetcher for MissingFetcher {
    fn package(&self) -> &str {
        "pyarrow"
    }

    fn fetch(&self, _output_dir: &Path, _version: &str, _target: &TargetSpec) -> lambda_packager::Result<Option<String>> {
        Ok(None)
    }
}

/// Fetcher that installs a marker package in place of the real one
pub struct MarkerFetcher;

impl AlternateBinaryFetcher for MarkerFetcher {
    fn package(&self) -> &str {
        "pyarrow"
    }

    fn fetch(&self, output_dir: &Path, version: &str, _target: &TargetSpec) -> lambda_packager::Result<Option<String>> {
        let dir = output_dir.join("pyarrow");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("PREBUILT"), version).unwrap();
        Ok(Some(version.to_string()))
    }
}

/// A pip project with the given `requirements.txt` and a handler script
pub fn pip_project(requirements: &str) -> TempDir {
    let project = tempfile::tempdir().unwrap();
    fs::write(project.path().join("requirements.txt"), requirements).unwrap();
    fs::write(
        project.path().join("lambda_function.py"),
        "def lambda_handler(event, context):\n    return event\n",
    )
    .unwrap();
    project
}

pub const POETRY_PYPROJECT: &str = r#"[tool.poetry]
name = "handler"
version = "0.1.0"

[tool.poetry.dependencies]
python = "^3.9"
requests = "^2.27"
urllib3 = "1.26.6"
"#;

pub const POETRY_LOCK: &str = r#"[[package]]
name = "requests"
version = "2.27.1"

[package.dependencies]
idna = ">=2.5,<4"
urllib3 = ">=1.21.1,<1.27"

[[package]]
name = "idna"
version = "3.3"

[[package]]
name = "urllib3"
version = "1.26.6"
"#;

/// A poetry project with a lock and a handler script
pub fn poetry_project() -> TempDir {
    let project = tempfile::tempdir().unwrap();
    fs::write(project.path().join("pyproject.toml"), POETRY_PYPROJECT).unwrap();
    fs::write(project.path().join("poetry.lock"), POETRY_LOCK).unwrap();
    fs::write(
        project.path().join("lambda_function.py"),
        "def lambda_handler(event, context):\n    return event\n",
    )
    .unwrap();
    project
}

/// Default configuration pinned to python3.9 on x86_64
pub fn base_config() -> PackagerConfig {
    let mut config = PackagerConfig::default();
    config.target.python_version = Some(lambda_packager::PythonVersion::new(3, 9));
    config
}

/// Files beneath `root`, relative and sorted
pub fn list_files(root: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(root).unwrap().to_path_buf())
        .collect();
    files.sort();
    files
}

/// Backup files of `requirements.txt` in the project root
pub fn requirement_backups(project: &Path) -> Vec<PathBuf> {
    backups_of(project, "requirements.txt")
}

/// Timestamped backups of `file` (`stem.<stamp>.ext`) in the project root
pub fn backups_of(project: &Path, file: &str) -> Vec<PathBuf> {
    let stem = Path::new(file).file_stem().unwrap().to_string_lossy().into_owned();
    let mut backups: Vec<PathBuf> = fs::read_dir(project)
        .unwrap()
        .map(|e| e.unwrap().path())
        .filter(|p| {
            let name = p.file_name().unwrap().to_string_lossy();
            name.starts_with(&format!("{stem}.")) && name != file
        })
        .collect();
    backups.sort();
    backups
}
