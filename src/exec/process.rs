// src/exec/process.rs

//! Single external process execution.

use std::path::Path;
use std::process::Stdio;

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::errors::{FlowdagError, Result};

/// Run a shell command in the given working directory.
///
/// - stdout and stderr are drained at debug level so pipe buffers never
///   fill.
/// - If the cancel channel fires, the child is killed and the call returns
///   `FlowdagError::Cancelled`.
/// - Returns the exit code on normal termination.
pub async fn run_shell(
    label: &str,
    cmd_line: &str,
    work_dir: &Path,
    mut cancel: oneshot::Receiver<()>,
) -> Result<i32> {
    info!(task = %label, cmd = %cmd_line, work_dir = %work_dir.display(), "starting operation process");

    // Build a shell command appropriate for the platform.
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(cmd_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(cmd_line);
        c
    };

    cmd.current_dir(work_dir)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .with_context(|| format!("spawning process for '{label}'"))
        .map_err(FlowdagError::Other)?;

    if let Some(stdout) = child.stdout.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %label, "stdout: {}", line);
            }
        });
    }

    if let Some(stderr) = child.stderr.take() {
        let label = label.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(task = %label, "stderr: {}", line);
            }
        });
    }

    tokio::select! {
        status_res = child.wait() => {
            let status = status_res
                .with_context(|| format!("waiting for process of '{label}'"))
                .map_err(FlowdagError::Other)?;
            let code = status.code().unwrap_or(-1);
            info!(
                task = %label,
                exit_code = code,
                success = status.success(),
                "operation process exited"
            );
            Ok(code)
        }

        _ = &mut cancel => {
            info!(task = %label, "cancellation requested; killing process");
            if let Err(e) = child.kill().await {
                warn!(task = %label, error = %e, "failed to kill child process on cancellation");
            }
            Err(FlowdagError::Cancelled)
        }
    }
}
