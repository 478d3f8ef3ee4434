//! External archiving tool.
//!
//! The tool is an opaque process behind the [`ArchiveTool`] trait. The
//! production implementation, [`Archive2`], shells out to the Creation Kit's
//! `Archive2.exe`:
//!
//! ```text
//! pack:    Archive2.exe <src-dir> -c=<dest> -f=<General|DDS> -compression=<None|Default> -r=<src-dir> [-maxSizeMB=<n>]
//! extract: Archive2.exe <container> -e=<dest-dir>
//! ```
//!
//! Exit code 0 is success. Anything else is an [`InvocationError`] carrying
//! the captured console output. Calls are synchronous; only one tool process
//! runs at a time.
//!
//! # Cancellation
//! While the process runs its status is polled together with a
//! [`CancelToken`]. Once cancellation is requested the process gets a grace
//! period to exit on its own before it is killed.

pub mod invoker;

use std::ffi::OsString;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::Compression;
use crate::container::ArchiveType;

pub use invoker::{invoke, OutputContainer, VerifyStatus};

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Captured console output kept in an error.
const MAX_DIAGNOSTIC_CHARS: usize = 4000;

// ── Errors ───────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum InvocationError {
    #[error("failed to launch {}: {source}", .tool.display())]
    Spawn { tool: PathBuf, source: io::Error },
    #[error("{operation} failed with exit code {code:?}: {diagnostics}")]
    Failed { operation: String, code: Option<i32>, diagnostics: String },
    #[error("{operation} was cancelled")]
    Cancelled { operation: String },
    #[error("{operation} reported success but {} was not written", .path.display())]
    MissingOutput { operation: String, path: PathBuf },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

// ── CancelToken ──────────────────────────────────────────────────────────────

/// Shared cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ── Requests ─────────────────────────────────────────────────────────────────

/// One pack invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackRequest {
    /// Directory whose contents are packed; also the path root.
    pub source:      PathBuf,
    pub destination: PathBuf,
    pub format:      ArchiveType,
    pub compression: Compression,
    pub max_part_mb: Option<u64>,
}

/// Console output of a successful run.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    fn diagnostics(&self) -> String {
        let mut message = String::new();
        if !self.stdout.trim().is_empty() {
            message.push_str("stdout:\n");
            message.push_str(self.stdout.trim());
        }
        if !self.stderr.trim().is_empty() {
            if !message.is_empty() {
                message.push('\n');
            }
            message.push_str("stderr:\n");
            message.push_str(self.stderr.trim());
        }
        truncate(&message, MAX_DIAGNOSTIC_CHARS)
    }
}

/// The archiving collaborator.
pub trait ArchiveTool {
    /// Unpack every file of `container` into `dest`.
    fn extract(&self, container: &Path, dest: &Path, cancel: &CancelToken) -> Result<ToolOutput, InvocationError>;

    /// Pack `request.source` into `request.destination`.
    fn pack(&self, request: &PackRequest, cancel: &CancelToken) -> Result<ToolOutput, InvocationError>;
}

// ── Archive2 ─────────────────────────────────────────────────────────────────

/// `Archive2.exe` driven as a child process.
#[derive(Debug, Clone)]
pub struct Archive2 {
    pub path:         PathBuf,
    pub grace_period: Duration,
}

impl Archive2 {
    pub fn new(path: impl Into<PathBuf>, grace_period: Duration) -> Self {
        Self { path: path.into(), grace_period }
    }

    pub fn pack_args(request: &PackRequest) -> Vec<OsString> {
        let mut args = vec![
            request.source.as_os_str().to_owned(),
            flag("-c=", &request.destination),
            OsString::from(format!("-f={}", request.format.tool_format())),
            OsString::from(format!("-compression={}", request.compression.tool_value())),
            flag("-r=", &request.source),
        ];
        if let Some(mb) = request.max_part_mb {
            args.push(OsString::from(format!("-maxSizeMB={mb}")));
        }
        args
    }

    pub fn extract_args(container: &Path, dest: &Path) -> Vec<OsString> {
        vec![container.as_os_str().to_owned(), flag("-e=", dest)]
    }

    fn run(&self, operation: String, args: Vec<OsString>, cancel: &CancelToken) -> Result<ToolOutput, InvocationError> {
        debug!(tool = %self.path.display(), ?args, "running archive tool");
        let mut child = Command::new(&self.path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| InvocationError::Spawn { tool: self.path.clone(), source })?;

        // Drained on their own threads so a chatty tool cannot fill the pipe
        // while we poll for exit.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child, cancel);
        let output = ToolOutput { stdout: join(stdout), stderr: join(stderr) };

        match status? {
            None => Err(InvocationError::Cancelled { operation }),
            Some(status) if status.success() => Ok(output),
            Some(status) => Err(InvocationError::Failed {
                operation,
                code: status.code(),
                diagnostics: output.diagnostics(),
            }),
        }
    }

    /// `Ok(None)` when the run was cancelled.
    fn wait(&self, child: &mut Child, cancel: &CancelToken) -> io::Result<Option<ExitStatus>> {
        let mut cancelled_at: Option<Instant> = None;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(if cancelled_at.is_some() { None } else { Some(status) });
            }
            if cancel.is_cancelled() {
                let since = *cancelled_at.get_or_insert_with(Instant::now);
                if since.elapsed() >= self.grace_period {
                    warn!(pid = child.id(), "archive tool did not exit after cancellation, killing it");
                    child.kill()?;
                    child.wait()?;
                    return Ok(None);
                }
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl ArchiveTool for Archive2 {
    fn extract(&self, container: &Path, dest: &Path, cancel: &CancelToken) -> Result<ToolOutput, InvocationError> {
        std::fs::create_dir_all(dest)?;
        let operation = format!("extract {}", container.display());
        self.run(operation, Self::extract_args(container, dest), cancel)
    }

    fn pack(&self, request: &PackRequest, cancel: &CancelToken) -> Result<ToolOutput, InvocationError> {
        let operation = format!("pack {}", request.destination.display());
        self.run(operation, Self::pack_args(request), cancel)
    }
}

fn flag(prefix: &str, path: &Path) -> OsString {
    let mut arg = OsString::from(prefix);
    arg.push(path.as_os_str());
    arg
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<String>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join(handle: Option<JoinHandle<String>>) -> String {
    handle.and_then(|h| h.join().ok()).unwrap_or_default()
}

fn truncate(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_owned(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_command_line() {
        let request = PackRequest {
            source:      PathBuf::from("stage/g1"),
            destination: PathBuf::from("Data/CCMerged_Sounds - Main.ba2"),
            format:      ArchiveType::General,
            compression: Compression::None,
            max_part_mb: None,
        };
        let args: Vec<String> = Archive2::pack_args(&request)
            .into_iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args, [
            "stage/g1",
            "-c=Data/CCMerged_Sounds - Main.ba2",
            "-f=General",
            "-compression=None",
            "-r=stage/g1",
        ]);
    }

    #[test]
    fn texture_pack_uses_dds_and_part_limit() {
        let request = PackRequest {
            source:      PathBuf::from("s"),
            destination: PathBuf::from("d.ba2"),
            format:      ArchiveType::Textures,
            compression: Compression::Default,
            max_part_mb: Some(2048),
        };
        let args = Archive2::pack_args(&request);
        assert_eq!(args[2], "-f=DDS");
        assert_eq!(args[3], "-compression=Default");
        assert_eq!(args[5], "-maxSizeMB=2048");
    }

    #[test]
    fn extract_command_line() {
        let args = Archive2::extract_args(Path::new("a.ba2"), Path::new("out"));
        assert_eq!(args, [OsString::from("a.ba2"), OsString::from("-e=out")]);
    }

    #[test]
    fn missing_tool_is_a_spawn_error() {
        let tool = Archive2::new("/definitely/not/Archive2.exe", Duration::from_secs(1));
        let dir = tempfile::tempdir().unwrap();
        let err = tool.extract(Path::new("x.ba2"), dir.path(), &CancelToken::new()).unwrap_err();
        assert!(matches!(err, InvocationError::Spawn { .. }));
    }

    #[test]
    fn diagnostics_are_truncated() {
        let out = ToolOutput { stdout: "x".repeat(MAX_DIAGNOSTIC_CHARS * 2), stderr: String::new() };
        assert!(out.diagnostics().chars().count() <= MAX_DIAGNOSTIC_CHARS + 1);
    }

    #[cfg(unix)]
    #[test]
    fn non_zero_exit_carries_output() {
        let tool = Archive2::new("sh", Duration::from_secs(1));
        let args = vec![OsString::from("-c"), OsString::from("echo broken header >&2; exit 3")];
        let err = tool.run("pack test".into(), args, &CancelToken::new()).unwrap_err();
        match err {
            InvocationError::Failed { code, diagnostics, .. } => {
                assert_eq!(code, Some(3));
                assert!(diagnostics.contains("broken header"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn cancellation_kills_after_grace_period() {
        let tool = Archive2::new("sh", Duration::from_millis(200));
        let cancel = CancelToken::new();
        cancel.cancel();
        let args = vec![OsString::from("-c"), OsString::from("exec sleep 30")];
        let started = Instant::now();
        let err = tool.run("pack slow".into(), args, &cancel).unwrap_err();
        assert!(matches!(err, InvocationError::Cancelled { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
