//! Monitored external processes
//!
//! Spawns a worker, streams its stdout/stderr line by line to a callback, and
//! kills it when the run is cancelled or the per-attempt timeout elapses.

use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

/// Number of stderr lines kept for error reports
const STDERR_TAIL_LINES: usize = 25;

/// Output stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum StreamKind {
    Stdout,
    Stderr,
}

/// Completed process
#[derive(Debug)]
pub(crate) struct Finished {
    pub status: ExitStatus,
    pub stderr_tail: String,
}

impl Finished {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Why a monitored process did not run to completion
#[derive(Debug)]
pub(crate) enum RunError {
    /// The binary could not be started
    Spawn(std::io::Error),
    /// Waiting on the process failed
    Wait(std::io::Error),
    /// Killed after the timeout (seconds)
    Timeout(u64),
    /// Killed by cancellation
    Cancelled,
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Spawn(e) => write!(f, "failed to start: {}", e),
            RunError::Wait(e) => write!(f, "failed to wait for process: {}", e),
            RunError::Timeout(secs) => write!(f, "timed out after {} seconds", secs),
            RunError::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Run `command` to completion, forwarding every output line to `on_line`
pub(crate) async fn run_monitored<F>(
    mut command: Command,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut on_line: F,
) -> Result<Finished, RunError>
where
    F: FnMut(StreamKind, &str) + Send,
{
    if cancel.is_cancelled() {
        return Err(RunError::Cancelled);
    }

    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn().map_err(RunError::Spawn)?;
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
    let timeout_secs = timeout.map(|t| t.as_secs()).unwrap_or_default();
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(expired);

    let mut out_lines = stdout.map(|s| LossyLines::new(BufReader::new(s)));
    let mut err_lines = stderr.map(|s| LossyLines::new(BufReader::new(s)));
    let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);

    while out_lines.is_some() || err_lines.is_some() {
        tokio::select! {
            _ = cancel.cancelled() => {
                kill(&mut child).await;
                return Err(RunError::Cancelled);
            }
            _ = &mut expired => {
                tracing::warn!(timeout_secs, "worker timed out, killing process");
                kill(&mut child).await;
                return Err(RunError::Timeout(timeout_secs));
            }
            line = next_line(&mut out_lines), if out_lines.is_some() => match line {
                Some(line) => on_line(StreamKind::Stdout, &line),
                None => out_lines = None,
            },
            line = next_line(&mut err_lines), if err_lines.is_some() => match line {
                Some(line) => {
                    on_line(StreamKind::Stderr, &line);
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                None => err_lines = None,
            },
        }
    }

    let status = tokio::select! {
        _ = cancel.cancelled() => {
            kill(&mut child).await;
            return Err(RunError::Cancelled);
        }
        _ = &mut expired => {
            kill(&mut child).await;
            return Err(RunError::Timeout(timeout_secs));
        }
        status = child.wait() => status.map_err(RunError::Wait)?,
    };

    Ok(Finished {
        status,
        stderr_tail: Vec::from(tail).join("\n"),
    })
}

/// Line reader that tolerates output in any console encoding
///
/// Invalid UTF-8 is replaced rather than ending the stream, so the pipe stays
/// drained for the life of the child. Partial lines survive in `buf` when a
/// read is dropped by `select!`.
struct LossyLines<R> {
    reader: R,
    buf: Vec<u8>,
}

impl<R: AsyncBufRead + Unpin> LossyLines<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        match self.reader.read_until(b'\n', &mut self.buf).await {
            Ok(0) if self.buf.is_empty() => return None,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(error = %e, "failed to read worker output");
                return None;
            }
        }
        let mut bytes = std::mem::take(&mut self.buf);
        if bytes.last() == Some(&b'\n') {
            bytes.pop();
        }
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

async fn next_line<R>(lines: &mut Option<LossyLines<R>>) -> Option<String>
where
    R: AsyncBufRead + Unpin,
{
    match lines {
        Some(lines) => lines.next_line().await,
        None => None,
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "failed to kill worker process");
    }
}
