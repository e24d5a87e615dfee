//! External tool invocation.
//!
//! CapSift never decodes capture bytes itself; field extraction and capture
//! editing are delegated to the Wireshark command-line family. This module
//! owns executable resolution and subprocess plumbing, nothing else: callers
//! decide how to parse or stream the output, and no retries happen here.

mod editcap;
mod tshark;

pub use editcap::{dedup, time_crop, time_crop_and_dedup};
pub use tshark::{field_extraction_args, write_empty_copy, write_excluding_streams};

use std::env;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use log::debug;

use crate::error::{Error, Result};

/// Maximum stderr length carried inside a `ToolExecution` error.
const STDERR_TRUNCATE: usize = 200;

/// Poll interval while waiting on a child with a timeout.
const WAIT_POLL: Duration = Duration::from_millis(20);

/// The external tool families CapSift shells out to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ToolKind {
    /// Field extractor (`tshark`).
    Tshark,
    /// Capture editor (`editcap`).
    Editcap,
    /// Capture metadata reader (`capinfos`).
    Capinfos,
}

impl ToolKind {
    /// Executable name looked up on `PATH`.
    pub fn executable(self) -> &'static str {
        match self {
            ToolKind::Tshark => "tshark",
            ToolKind::Editcap => "editcap",
            ToolKind::Capinfos => "capinfos",
        }
    }

    /// Environment variable that may point at the executable.
    pub fn env_var(self) -> &'static str {
        match self {
            ToolKind::Tshark => "TSHARK_PATH",
            ToolKind::Editcap => "EDITCAP_PATH",
            ToolKind::Capinfos => "CAPINFOS_PATH",
        }
    }
}

/// Explicit tool locations from configuration.
///
/// A `None` entry falls back to the tool's environment variable and then to
/// a `PATH` lookup; see [`ToolPaths::resolve`].
#[derive(Debug, Clone, Default)]
pub struct ToolPaths {
    pub tshark: Option<PathBuf>,
    pub editcap: Option<PathBuf>,
    pub capinfos: Option<PathBuf>,
}

impl ToolPaths {
    fn explicit(&self, kind: ToolKind) -> Option<&PathBuf> {
        match kind {
            ToolKind::Tshark => self.tshark.as_ref(),
            ToolKind::Editcap => self.editcap.as_ref(),
            ToolKind::Capinfos => self.capinfos.as_ref(),
        }
    }

    /// Resolve the effective executable path for `kind`.
    ///
    /// Precedence (high to low): explicit configured path, the tool's
    /// environment variable, a `PATH` walk.
    pub fn resolve(&self, kind: ToolKind) -> Result<PathBuf> {
        if let Some(path) = self.explicit(kind) {
            return Ok(path.clone());
        }
        if let Some(value) = env::var_os(kind.env_var()) {
            if !value.is_empty() {
                return Ok(PathBuf::from(value));
            }
        }
        if let Some(found) = search_path(kind.executable()) {
            return Ok(found);
        }
        Err(Error::ToolNotFound {
            tool: kind.executable().to_string(),
            env_var: kind.env_var().to_string(),
        })
    }
}

fn search_path(executable: &str) -> Option<PathBuf> {
    let path = env::var_os("PATH")?;
    for dir in env::split_paths(&path) {
        let candidate = dir.join(executable);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}

/// Buffered output of one tool invocation.
#[derive(Debug)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

/// Spawns external tools and returns their buffered or streamed output.
#[derive(Debug, Clone)]
pub struct Invoker {
    paths: ToolPaths,
    timeout: Option<Duration>,
}

impl Invoker {
    pub fn new(paths: ToolPaths) -> Self {
        Self {
            paths,
            timeout: None,
        }
    }

    /// Apply a per-invocation timeout; expiry kills the child and surfaces
    /// `ToolTimeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn paths(&self) -> &ToolPaths {
        &self.paths
    }

    /// Resolve `kind` without running it.
    pub fn resolve(&self, kind: ToolKind) -> Result<PathBuf> {
        self.paths.resolve(kind)
    }

    /// Run a tool to completion and buffer its output.
    ///
    /// A nonzero exit code becomes `ToolExecution` carrying truncated
    /// stderr; callers that want the raw exit code can use
    /// [`Invoker::invoke_unchecked`].
    pub fn invoke(&self, kind: ToolKind, args: &[String]) -> Result<ToolOutput> {
        let output = self.invoke_unchecked(kind, args)?;
        if output.exit_code != 0 {
            return Err(execution_error(kind, &output));
        }
        Ok(output)
    }

    /// Like [`Invoker::invoke`], but feeds `stdin` to the child first.
    pub fn invoke_with_stdin(
        &self,
        kind: ToolKind,
        args: &[String],
        stdin: &str,
    ) -> Result<ToolOutput> {
        let output = self.spawn_buffered(kind, args, Some(stdin))?;
        if output.exit_code != 0 {
            return Err(execution_error(kind, &output));
        }
        Ok(output)
    }

    /// Run a tool to completion without treating nonzero exits as errors.
    pub fn invoke_unchecked(&self, kind: ToolKind, args: &[String]) -> Result<ToolOutput> {
        self.spawn_buffered(kind, args, None)
    }

    fn spawn_buffered(
        &self,
        kind: ToolKind,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<ToolOutput> {
        let program = self.paths.resolve(kind)?;
        debug!("running {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(kind, err))?;

        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                use std::io::Write as _;
                pipe.write_all(input.as_bytes())?;
            }
        }

        let stdout_handle = drain_to_string(child.stdout.take());
        let stderr_handle = drain_to_string(child.stderr.take());

        let status = self.wait_child(kind, &mut child)?;
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        Ok(ToolOutput {
            stdout,
            stderr,
            exit_code: status,
        })
    }

    /// Run a field-extraction style command, feeding each stdout line to
    /// `on_line` instead of buffering the whole output.
    pub fn invoke_streaming(
        &self,
        kind: ToolKind,
        args: &[String],
        mut on_line: impl FnMut(&str),
    ) -> Result<()> {
        let program = self.paths.resolve(kind)?;
        debug!("streaming {} {}", program.display(), args.join(" "));

        let mut child = Command::new(&program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| spawn_error(kind, err))?;

        let stderr_handle = drain_to_string(child.stderr.take());
        if let Some(stdout) = child.stdout.take() {
            let reader = BufReader::new(stdout);
            for line in reader.lines() {
                on_line(&line?);
            }
        }

        let status = self.wait_child(kind, &mut child)?;
        let stderr = stderr_handle.join().unwrap_or_default();
        if status != 0 {
            return Err(execution_error(
                kind,
                &ToolOutput {
                    stdout: String::new(),
                    stderr,
                    exit_code: status,
                },
            ));
        }
        Ok(())
    }

    fn wait_child(&self, kind: ToolKind, child: &mut std::process::Child) -> Result<i32> {
        let Some(timeout) = self.timeout else {
            let status = child.wait()?;
            return Ok(status.code().unwrap_or(-1));
        };

        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(status.code().unwrap_or(-1));
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Err(Error::ToolTimeout {
                    tool: kind.executable().to_string(),
                    seconds: timeout.as_secs(),
                });
            }
            thread::sleep(WAIT_POLL);
        }
    }
}

fn drain_to_string<R: Read + Send + 'static>(
    source: Option<R>,
) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buf);
        }
        buf
    })
}

fn spawn_error(kind: ToolKind, err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::NotFound {
        Error::ToolNotFound {
            tool: kind.executable().to_string(),
            env_var: kind.env_var().to_string(),
        }
    } else {
        Error::Io(err)
    }
}

fn execution_error(kind: ToolKind, output: &ToolOutput) -> Error {
    let mut stderr = output.stderr.trim().to_string();
    if stderr.len() > STDERR_TRUNCATE {
        let mut cut = STDERR_TRUNCATE;
        while !stderr.is_char_boundary(cut) {
            cut -= 1;
        }
        stderr.truncate(cut);
    }
    Error::ToolExecution {
        tool: kind.executable().to_string(),
        code: output.exit_code,
        stderr,
    }
}

/// Stringify a path for use as a command argument.
pub(crate) fn path_arg(path: &Path) -> String {
    path.display().to_string()
}
