//! Child process runner with combined output capture and a hard deadline

use crate::error::{DriverError, Result};
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// Output of a finished process
#[derive(Debug, Default)]
pub(crate) struct Captured {
    pub code: i32,
    /// stdout only, for machine-readable commands
    pub stdout: String,
    /// stdout and stderr interleaved in arrival order
    pub combined: Vec<String>,
}

impl Captured {
    pub fn success(&self) -> bool {
        self.code == 0
    }

    pub fn tail(&self, lines: usize) -> String {
        let start = self.combined.len().saturating_sub(lines);
        self.combined[start..].join("\n")
    }
}

pub(crate) struct Invocation<'a> {
    pub program: &'a Path,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub cwd: &'a Path,
    /// Short description for logs and errors (`terraform apply`)
    pub label: String,
}

/// Run to completion or kill the child once `deadline` passes
pub(crate) async fn run(invocation: Invocation<'_>, deadline: Instant) -> Result<Captured> {
    let mut cmd = Command::new(invocation.program);
    cmd.args(&invocation.args)
        .envs(invocation.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .current_dir(invocation.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn().map_err(|source| DriverError::Spawn {
        program: invocation.program.display().to_string(),
        source,
    })?;

    let (tx, mut rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, Stream::Stdout, tx.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, Stream::Stderr, tx.clone());
    }
    drop(tx);

    let label = invocation.label.as_str();
    let finished = async {
        let mut captured = Captured::default();
        while let Some((stream, line)) = rx.recv().await {
            tracing::trace!("{}: {}", label, line);
            if stream == Stream::Stdout {
                captured.stdout.push_str(&line);
                captured.stdout.push('\n');
            }
            captured.combined.push(line);
        }
        let status = child.wait().await?;
        captured.code = status.code().unwrap_or(-1);
        Ok::<_, DriverError>(captured)
    };

    let outcome = tokio::time::timeout_at(deadline, finished).await;
    match outcome {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{}: deadline exceeded, killing process", label);
            if let Err(e) = child.kill().await {
                tracing::warn!("{}: failed to kill process: {}", label, e);
            }
            Err(DriverError::Timeout {
                command: label.to_string(),
            })
        }
    }
}

fn forward_lines<R>(reader: R, stream: Stream, tx: mpsc::UnboundedSender<(Stream, String)>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((stream, line)).is_err() {
                break;
            }
        }
    });
}
