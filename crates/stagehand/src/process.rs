//! Subprocess seam: one-shot commands and supervised long-lived children.
//!
//! Everything the control plane does to the outside world goes through a
//! [`CommandRunner`]. Production uses [`SystemRunner`] over `tokio::process`;
//! tests substitute a scripted runner so the supervision logic can be driven
//! line by line without `pactl` or `bluetoothctl` installed.
//!
//! A supervised child is exposed as plain channels rather than a `Child`:
//!
//! - `lines`: stdout, one decoded line per message (stderr goes to the
//!   debug log, so a child that only complains has produced no output)
//! - `stdin`: directives written to the child, newline appended
//! - `exit`: resolves once with the exit status
//! - `kill`: a token; cancelling it force-kills the child (idempotent, so
//!   killing an already-exited child is a no-op)

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, StageError};

/// How a supervised child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// Exit code, `None` when terminated by a signal
    pub code: Option<i32>,
    /// True when we asked for the kill
    pub killed: bool,
}

impl ExitInfo {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Cloneable handle that force-kills a supervised child.
#[derive(Debug, Clone, Default)]
pub struct KillHandle {
    token: CancellationToken,
}

impl KillHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request termination. Safe to call any number of times, before or after exit.
    pub fn kill(&self) {
        self.token.cancel();
    }

    pub fn is_killed(&self) -> bool {
        self.token.is_cancelled()
    }

    pub async fn killed(&self) {
        self.token.cancelled().await
    }
}

/// A long-lived child under supervision.
#[derive(Debug)]
pub struct SupervisedChild {
    pub program: String,
    pub pid: Option<u32>,
    pub lines: mpsc::UnboundedReceiver<String>,
    pub stdin: mpsc::UnboundedSender<String>,
    pub exit: oneshot::Receiver<ExitInfo>,
    pub kill: KillHandle,
}

impl SupervisedChild {
    /// Write one directive line. Returns false once the child's stdin is gone.
    pub fn send(&self, directive: &str) -> bool {
        self.stdin.send(directive.to_string()).is_ok()
    }
}

/// Runs external tools.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, returning stdout. Non-zero exit becomes
    /// `CommandFailed` carrying the tool's own message; exceeding `timeout`
    /// becomes `CommandTimeout` and the process is killed.
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<String>;

    /// Start a supervised child with piped stdio.
    fn spawn(&self, program: &str, args: &[&str]) -> Result<SupervisedChild>;
}

/// `tokio::process` backed runner.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Result<String> {
        debug!(program, ?args, "running command");

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(timeout, cmd.output()).await {
            Err(_) => {
                return Err(StageError::CommandTimeout {
                    program: program.to_string(),
                    timeout,
                })
            }
            Ok(Err(source)) => {
                return Err(StageError::Spawn {
                    program: program.to_string(),
                    source,
                })
            }
            Ok(Ok(output)) => output,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        let message = [stderr.trim(), stdout.trim()]
            .into_iter()
            .find(|s| !s.is_empty())
            .map(String::from)
            .unwrap_or_else(|| format!("exited with {}", output.status));

        Err(StageError::CommandFailed {
            program: program.to_string(),
            message,
        })
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<SupervisedChild> {
        debug!(program, ?args, "spawning supervised child");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| StageError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let pid = child.id();
        let (line_tx, line_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, line_tx));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(log_stderr(stderr, program.to_string()));
        }

        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                while let Some(directive) = stdin_rx.recv().await {
                    let line = format!("{}\n", directive);
                    if stdin.write_all(line.as_bytes()).await.is_err() {
                        break;
                    }
                    let _ = stdin.flush().await;
                }
            });
        }

        let kill = KillHandle::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        let killer = kill.clone();
        let name = program.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = killer.killed() => {
                    if let Err(e) = child.start_kill() {
                        debug!(program = %name, "kill after exit: {}", e);
                    }
                    child.wait().await
                }
            };

            let info = match status {
                Ok(status) => ExitInfo {
                    code: status.code(),
                    killed: killer.is_killed(),
                },
                Err(e) => {
                    warn!(program = %name, "failed to reap child: {}", e);
                    ExitInfo {
                        code: None,
                        killed: killer.is_killed(),
                    }
                }
            };
            debug!(program = %name, ?info, "supervised child exited");
            let _ = exit_tx.send(info);
        });

        Ok(SupervisedChild {
            program: program.to_string(),
            pid,
            lines: line_rx,
            stdin: stdin_tx,
            exit: exit_rx,
            kill,
        })
    }
}

/// Forward a pipe line by line; invalid UTF-8 is replaced rather than fatal.
async fn forward_lines<R>(pipe: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf)
                    .trim_end_matches(['\n', '\r'])
                    .to_string();
                if tx.send(line).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!("pipe read error: {}", e);
                break;
            }
        }
    }
}

async fn log_stderr<R>(pipe: R, program: String)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(pipe).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => debug!(%program, stderr = %line),
            Ok(None) => break,
            Err(e) => {
                debug!(%program, "stderr read error: {}", e);
                break;
            }
        }
    }
}
