use std::fs;
use std::io::{self, Read};
use std::path::Path;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;

/// One command to execute inside the isolation boundary.
#[derive(Debug, Clone)]
pub struct RunRequest<'a> {
    /// Container image; backends without images ignore it
    pub image: &'a str,
    /// Shell command line, executed with `/bin/sh -c`
    pub command: &'a str,
    /// Workspace directory, used as the working directory of the command
    pub workdir: &'a Path,
    pub timeout: Duration,
    pub memory_limit_mb: u64,
    /// Workspace-relative file the command redirects its stdout to
    pub stdout_file: &'a str,
    /// Workspace-relative file the command redirects its stderr to
    pub stderr_file: &'a str,
}

/// What a runner observed about one command.
///
/// At most one of `timed_out` and `memory_exceeded` is set. The runner never
/// looks at the output content.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub timed_out: bool,
    pub memory_exceeded: bool,
    pub elapsed_ms: u64,
    pub memory_kb: u64,
}

impl ExecutionResult {
    /// Exited with 0 and hit no limit
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out && !self.memory_exceeded
    }
}

/// Trait for the isolation backends
///
/// A runner executes exactly one command with the given limits and reports
/// what happened. `Err` means the backend itself failed (could not start,
/// daemon unreachable), never that the user program misbehaved.
pub trait IsolatedRunner: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, request: &RunRequest<'_>) -> Result<ExecutionResult>;
}

/// Reads at most `limit` bytes of a workspace file.
pub(super) fn read_capped(path: &Path, limit: u64) -> io::Result<String> {
    let mut buf = Vec::new();
    fs::File::open(path)?.take(limit).read_to_end(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// Drains a pipe on a helper thread, keeping the first `limit` bytes.
///
/// The rest is read and discarded so the writer never blocks on a full pipe.
pub(super) fn drain_pipe<R>(pipe: Option<R>, limit: u64) -> JoinHandle<Vec<u8>>
where
    R: Read + Send + 'static,
{
    std::thread::spawn(move || {
        let mut kept = Vec::new();
        let Some(mut pipe) = pipe else {
            return kept;
        };
        let mut chunk = [0u8; 8192];
        loop {
            match pipe.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => {
                    let room = (limit as usize).saturating_sub(kept.len());
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        kept
    })
}

/// Collects the command's output: the redirected files are authoritative, the
/// pipe contents are used only for a file that cannot be read at all.
pub(super) fn collect_output(
    request: &RunRequest<'_>,
    limit: u64,
    stdout_pipe: JoinHandle<Vec<u8>>,
    stderr_pipe: JoinHandle<Vec<u8>>,
) -> (String, String) {
    let piped = |handle: JoinHandle<Vec<u8>>| {
        handle
            .join()
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_default()
    };
    let stdout_piped = piped(stdout_pipe);
    let stderr_piped = piped(stderr_pipe);

    let stdout = read_capped(&request.workdir.join(request.stdout_file), limit)
        .unwrap_or_else(|e| {
            log::debug!("{} unreadable ({e}), using pipe output", request.stdout_file);
            stdout_piped
        });
    let stderr = read_capped(&request.workdir.join(request.stderr_file), limit)
        .unwrap_or_else(|e| {
            log::debug!("{} unreadable ({e}), using pipe output", request.stderr_file);
            stderr_piped
        });

    (stdout, stderr)
}
