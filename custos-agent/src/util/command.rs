//! Bounded subprocess execution.
//!
//! Every external command the agent runs goes through here: drift probes,
//! runbook steps, and service management. The child is spawned from an
//! argv, never through a shell, output tails are bounded, and on timeout
//! the child is hard-killed and reaped.

use std::process::Stdio;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;

/// Keep the last 16 KiB of each stream unless the caller asks otherwise.
pub const DEFAULT_TAIL_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Keep only the last `limit_bytes` of whatever we read.
fn push_bounded(buf: &mut Vec<u8>, chunk: &[u8], limit_bytes: usize) {
    if limit_bytes == 0 {
        return;
    }
    buf.extend_from_slice(chunk);
    if buf.len() > limit_bytes {
        let overflow = buf.len() - limit_bytes;
        buf.drain(0..overflow);
    }
}

async fn read_to_tail<R: AsyncRead + Unpin>(
    mut r: R,
    limit_bytes: usize,
) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(limit_bytes.min(64 * 1024));
    let mut tmp = [0u8; 8192];

    loop {
        let n = r.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        push_bounded(&mut out, &tmp[..n], limit_bytes);
    }
    Ok(out)
}

/// Run `program` with `args`, capturing bounded stdout/stderr tails.
///
/// Returns `Ok` whenever the child was spawned and reaped, whatever its
/// exit status; the caller decides what a non-zero exit means. `Err` is
/// reserved for spawn/plumbing failures.
pub async fn run(
    program: &str,
    args: &[String],
    timeout: Duration,
    tail_bytes: usize,
) -> Result<CommandOutput> {
    let started = Instant::now();

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("failed to spawn {program}"))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout missing for {program}"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr missing for {program}"))?;

    // Read both streams concurrently while the process runs.
    let stdout_task = tokio::spawn(async move { read_to_tail(stdout, tail_bytes).await });
    let stderr_task = tokio::spawn(async move { read_to_tail(stderr, tail_bytes).await });

    let mut timed_out = false;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(res) => Some(res.with_context(|| format!("wait failed for {program}"))?),
        Err(_) => {
            timed_out = true;
            let _ = child.kill().await;
            let _ = child.wait().await;
            None
        }
    };

    // Readers finish once the pipes close after exit/kill.
    let stdout_tail = stdout_task.await.context("join stdout reader")??;
    let stderr_tail = stderr_task.await.context("join stderr reader")??;

    Ok(CommandOutput {
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        stdout: String::from_utf8_lossy(&stdout_tail).to_string(),
        stderr: String::from_utf8_lossy(&stderr_tail).to_string(),
        duration: started.elapsed(),
    })
}

/// Convenience wrapper that errors on non-zero exit, for callers that only
/// want the stdout of a probe.
pub async fn run_checked(program: &str, args: &[String], timeout: Duration) -> Result<String> {
    let out = run(program, args, timeout, DEFAULT_TAIL_BYTES).await?;
    if out.timed_out {
        return Err(anyhow!("{program} timed out after {:?}", timeout));
    }
    if !out.success() {
        return Err(anyhow!(
            "{program} exited with {:?}: {}",
            out.exit_code,
            out.stderr.trim()
        ));
    }
    Ok(out.stdout)
}
