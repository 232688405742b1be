// src/process/mod.rs

//! External process execution
//!
//! Every pip, poetry, python and strip invocation goes through a
//! [`CommandRunner`]. The production [`SystemRunner`] spawns the process,
//! drains stdout and stderr on two scoped threads so a chatty child can never
//! block on a full pipe, relays each line to `tracing` tagged with its stream,
//! and waits for the exit status.
//!
//! Working directory and environment changes are carried on the
//! [`CommandSpec`] and applied to the child only. The parent process state
//! is never touched, so there is nothing to restore afterwards.

use crate::error::{Error, Result};
use std::ffi::{OsStr, OsString};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, ExitStatus, Stdio};
use tracing::{debug, error, info};

/// Severity used when relaying a child's output lines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputLevel {
    #[default]
    Info,
    /// Quiet commands only show up with `-v`
    Debug,
}

/// A fully described external command
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    /// Working directory for the child
    pub cwd: Option<PathBuf>,
    /// Environment overrides; `None` removes the variable
    pub env: Vec<(String, Option<OsString>)>,
    pub level: OutputLevel,
}

impl CommandSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            level: OutputLevel::Info,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.into(), Some(value.as_ref().to_os_string())));
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env.push((key.into(), None));
        self
    }

    /// Apply a shared context (working directory + environment)
    pub fn within(mut self, context: &CommandContext) -> Self {
        if let Some(cwd) = &context.cwd {
            self.cwd = Some(cwd.clone());
        }
        self.env.extend(context.env.iter().cloned());
        self
    }

    /// Relay output at debug level instead of info
    pub fn quiet(mut self, quiet: bool) -> Self {
        self.level = if quiet { OutputLevel::Debug } else { OutputLevel::Info };
        self
    }

    /// Short name used to prefix relayed output lines
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }

    /// Arguments rendered for logs and error messages
    pub fn display_args(&self) -> Vec<String> {
        self.args.iter().map(|a| a.to_string_lossy().into_owned()).collect()
    }
}

/// Working directory and environment shared by a family of commands
#[derive(Debug, Clone, Default)]
pub struct CommandContext {
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, Option<OsString>)>,
}

impl CommandContext {
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(dir.into()),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl AsRef<OsStr>) -> Self {
        self.env.push((key.into(), Some(value.as_ref().to_os_string())));
        self
    }

    pub fn without_env(mut self, key: impl Into<String>) -> Self {
        self.env.push((key.into(), None));
        self
    }
}

/// Exit status plus everything the child wrote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Executes external commands
///
/// Implementations return the captured output whatever the exit status;
/// [`run_command`] and [`probe_command`] turn that into the raising and
/// probing call styles.
pub trait CommandRunner {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Resolve a program name on PATH
    fn locate(&self, program: &str) -> Option<PathBuf> {
        which::which(program).ok()
    }
}

/// Runner shared between the analyzer and the packaging pipeline
pub type SharedRunner = std::sync::Arc<dyn CommandRunner>;

/// Run a command, failing with [`Error::CommandFailed`] on non-zero exit
pub fn run_command(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<CommandOutput> {
    debug!("Running command: {} {:?}", spec.program.display(), spec.display_args());
    let output = runner.execute(spec)?;
    if output.success() {
        return Ok(output);
    }

    error!("ERROR IN CALL: {} {:?}", spec.program.display(), spec.display_args());
    error!("STDOUT: {}", output.stdout);
    error!("STDERR: {}", output.stderr);
    Err(Error::CommandFailed {
        program: spec.program.display().to_string(),
        args: spec.display_args(),
        code: output.code,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Run a command in probe mode: report success instead of raising
///
/// Spawn failures still propagate; only a non-zero exit is converted.
pub fn probe_command(runner: &dyn CommandRunner, spec: &CommandSpec) -> Result<bool> {
    debug!("Probing command: {} {:?}", spec.program.display(), spec.display_args());
    Ok(runner.execute(spec)?.success())
}

/// Production runner backed by `std::process`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &spec.env {
            match value {
                Some(value) => command.env(key, value),
                None => command.env_remove(key),
            };
        }

        let mut child = command.spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let name = spec.display_name();

        // Both pipes are drained concurrently; the child blocks once either
        // pipe buffer fills, so reading them one after the other can hang.
        let (stdout, stderr) = std::thread::scope(|scope| {
            let out = scope.spawn(|| relay_lines(stdout, &name, "stdout", spec.level));
            let err = scope.spawn(|| relay_lines(stderr, &name, "stderr", spec.level));
            (join_reader(out), join_reader(err))
        });

        let status: ExitStatus = child.wait()?;
        Ok(CommandOutput {
            code: status.code(),
            stdout: stdout?,
            stderr: stderr?,
        })
    }
}

fn join_reader(handle: std::thread::ScopedJoinHandle<'_, Result<String>>) -> Result<String> {
    handle
        .join()
        .unwrap_or_else(|_| Err(Error::Io(std::io::Error::other("output reader thread panicked"))))
}

/// Read a stream to the end, logging each line as it arrives
fn relay_lines<R: Read>(stream: Option<R>, program: &str, stream_name: &str, level: OutputLevel) -> Result<String> {
    let Some(stream) = stream else {
        return Ok(String::new());
    };
    let mut captured = String::new();
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        let line = String::from_utf8_lossy(&buf);
        let trimmed = line.trim_end();
        match level {
            OutputLevel::Info => info!(program, stream = stream_name, "{}", trimmed),
            OutputLevel::Debug => debug!(program, stream = stream_name, "{}", trimmed),
        }
        captured.push_str(&line);
    }
    Ok(captured)
}

/// Locate the first of several candidate binaries on PATH
pub fn find_program(runner: &dyn CommandRunner, candidates: &[&str]) -> Option<PathBuf> {
    candidates.iter().find_map(|name| runner.locate(name))
}
