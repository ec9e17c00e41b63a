//! Running the external tool.
//!
//! Every invocation checks the run's cancellation token before spawning,
//! captures stdout and stderr in full, and races process exit against
//! cancellation. On cancellation the child is killed (not merely abandoned)
//! and the call resolves to `MonitorError::Cancelled`.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::MonitorError;

/// Captured output of a successful (zero exit status) invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Run `program args..`, returning its output when it exits with status 0.
///
/// A nonzero exit status becomes `MonitorError::CommandFailed` carrying the
/// exit code, argument list and both captured streams. A process killed by
/// a signal reports code `-1`.
pub async fn run_captured(
    program: &Path,
    args: &[String],
    cancel: &CancellationToken,
) -> crate::Result<CommandOutput> {
    if cancel.is_cancelled() {
        return Err(MonitorError::Cancelled);
    }

    let program_name = program.display().to_string();

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.stdin(std::process::Stdio::null());
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    tracing::debug!(command = %program_name, args = ?args, "Running command");

    let mut child = cmd
        .spawn()
        .map_err(|e| MonitorError::Spawn(program_name.clone(), e))?;

    let stdout_pipe = child.stdout.take();
    let stderr_pipe = child.stderr.take();

    // Both pipes are drained concurrently so a chatty stderr cannot stall
    // the child while stdout is still being read.
    let (status, stdout_bytes, stderr_bytes) = tokio::select! {
        result = async {
            let read_stdout = async {
                let mut buf = Vec::new();
                if let Some(mut out) = stdout_pipe {
                    out.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let read_stderr = async {
                let mut buf = Vec::new();
                if let Some(mut err) = stderr_pipe {
                    err.read_to_end(&mut buf).await?;
                }
                Ok::<_, std::io::Error>(buf)
            };
            let (stdout, stderr) = tokio::try_join!(read_stdout, read_stderr)?;
            let status = child.wait().await?;
            Ok::<_, std::io::Error>((status, stdout, stderr))
        } => result?,
        _ = cancel.cancelled() => {
            tracing::debug!(command = %program_name, args = ?args, "Cancelled, killing process");
            if let Err(e) = child.kill().await {
                tracing::warn!(command = %program_name, error = %e, "Failed to kill process");
            }
            return Err(MonitorError::Cancelled);
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_bytes).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_bytes).into_owned();

    if !status.success() {
        let code = status.code().unwrap_or(-1);
        tracing::error!(
            command = %program_name,
            args = ?args,
            exit_code = code,
            stdout = %stdout,
            stderr = %stderr,
            "Command failed"
        );
        return Err(MonitorError::CommandFailed {
            program: program_name,
            args: args.to_vec(),
            code,
            stdout,
            stderr,
        });
    }

    if !stderr.is_empty() {
        tracing::debug!(command = %program_name, stderr = %stderr, "Command stderr");
    }

    Ok(CommandOutput { stdout, stderr })
}
