//! Shell-out helper used by the node engine. Every external binary the
//! plugin drives (nvme, blockdev, mount, udevadm, ...) runs through here so
//! each invocation carries its own timeout and its output is captured for
//! error reporting.

use std::time::Duration;

use tokio::process::Command;

use crate::error::DeviceError;

#[derive(Debug)]
pub(crate) struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stdout and stderr merged, for log lines and error messages.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.trim_end().to_string();
        let stderr = self.stderr.trim_end();
        if !stderr.is_empty() {
            if !combined.is_empty() {
                combined.push('\n');
            }
            combined.push_str(stderr);
        }
        combined
    }
}

/// Run `program` with `args`, killing it if it exceeds `timeout`. A
/// non-zero exit is not an error at this level; callers inspect `success`.
pub(crate) async fn run(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<CommandOutput, DeviceError> {
    trace!("running {} {:?} (timeout {:?})", program, args, timeout);
    let output = tokio::time::timeout(
        timeout,
        Command::new(program).args(args).kill_on_drop(true).output(),
    )
    .await
    .map_err(|_| {
        DeviceError::from(format!(
            "{program} {} timed out after {timeout:?}",
            args.join(" ")
        ))
    })?
    .map_err(|error| DeviceError::from(format!("failed to execute {program}: {error}")))?;

    Ok(CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a command that is expected to succeed; returns stdout on success
/// and an error carrying the combined output otherwise.
pub(crate) async fn run_checked(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<String, DeviceError> {
    let output = run(program, args, timeout).await?;
    if output.success {
        Ok(output.stdout)
    } else {
        Err(DeviceError::from(format!(
            "{program} {} failed: {}",
            args.join(" "),
            output.combined()
        )))
    }
}
