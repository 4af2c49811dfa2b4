use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

// --- Child processes -------------------------------------------------------
//
// Playback backends are external programs driven over their stdin and
// stdout. Output from stdout and stderr is merged into one line stream.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Stop,
    Continue,
}

impl ProcessSignal {
    fn raw(self) -> libc::c_int {
        match self {
            ProcessSignal::Stop => libc::SIGSTOP,
            ProcessSignal::Continue => libc::SIGCONT,
        }
    }
}

#[async_trait]
pub trait ProcessHandle: Send {
    /// Writes `line` and a newline to the process input.
    async fn send_line(&mut self, line: &str) -> bool;

    /// Next output line, waiting at most `timeout`. Returns `None` on timeout
    /// and, after waiting out the timeout, once output has ended.
    async fn next_line(&mut self, timeout: Duration) -> Option<String>;

    /// Next output line if one is already buffered.
    fn try_next_line(&mut self) -> Option<String>;

    fn running(&mut self) -> bool;

    fn raise(&mut self, signal: ProcessSignal);

    /// Kills the process and reaps it.
    async fn kill(&mut self);
}

pub trait Spawner: Send + Sync {
    /// Starts `args[0]` with the remaining arguments.
    fn spawn(&self, args: &[String]) -> anyhow::Result<Box<dyn ProcessHandle>>;
}

/// Spawns real processes through `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandSpawner;

impl Spawner for CommandSpawner {
    fn spawn(&self, args: &[String]) -> anyhow::Result<Box<dyn ProcessHandle>> {
        Ok(Box::new(ChildProcess::spawn(args)?))
    }
}

pub struct ChildProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    output: mpsc::UnboundedReceiver<String>,
    readers: Vec<JoinHandle<()>>,
}

impl ChildProcess {
    pub fn spawn(args: &[String]) -> anyhow::Result<Self> {
        let (program, rest) = args.split_first().context("empty command line")?;

        let mut cmd = Command::new(program);
        cmd.args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().with_context(|| format!("could not run {program}"))?;
        let stdin = child.stdin.take().ok_or_else(|| anyhow::anyhow!("{program} stdin unavailable"))?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("{program} stdout unavailable"))?;
        let stderr = child.stderr.take().ok_or_else(|| anyhow::anyhow!("{program} stderr unavailable"))?;

        let (tx, output) = mpsc::unbounded_channel();
        let readers = vec![tokio::spawn(forward_lines(stdout, tx.clone())), tokio::spawn(forward_lines(stderr, tx))];

        Ok(Self { child, stdin: Some(stdin), output, readers })
    }
}

async fn forward_lines<R: AsyncRead + Unpin>(reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if tx.send(line).is_err() {
            break;
        }
    }
}

#[async_trait]
impl ProcessHandle for ChildProcess {
    async fn send_line(&mut self, line: &str) -> bool {
        let Some(stdin) = self.stdin.as_mut() else {
            return false;
        };
        let sent = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;
        match sent {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("child stdin: {e}");
                self.stdin = None;
                false
            }
        }
    }

    async fn next_line(&mut self, timeout: Duration) -> Option<String> {
        match tokio::time::timeout(timeout, self.output.recv()).await {
            Ok(Some(line)) => Some(line),
            Ok(None) => {
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_) => None,
        }
    }

    fn try_next_line(&mut self) -> Option<String> {
        self.output.try_recv().ok()
    }

    fn running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn raise(&mut self, signal: ProcessSignal) {
        let Some(pid) = self.child.id() else {
            return;
        };
        // SAFETY: plain kill(2) on a child we have not reaped yet.
        unsafe {
            libc::kill(pid as libc::pid_t, signal.raw());
        }
    }

    async fn kill(&mut self) {
        self.stdin = None;
        let _ = self.child.kill().await;
        for task in self.readers.drain(..) {
            task.abort();
        }
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        for task in &self.readers {
            task.abort();
        }
    }
}
