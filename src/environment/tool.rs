//! Invocation of external control tools (`VBoxManage`, `adb`).
//!
//! A command either succeeds with its captured stdout or fails with a
//! [`ToolError`]; a non-zero exit status, a spawn failure and a timeout are all
//! reported the same way.

use log::{debug, trace};
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error_handling::types::ToolError;

/// Runs `program args...`, returning stdout on a zero exit status.
pub async fn run_tool(
    program: &Path,
    args: &[&str],
    timeout: Duration,
) -> Result<String, ToolError> {
    let name = program.display().to_string();
    debug!("Running {} {}", name, args.join(" "));

    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => {
            return Err(ToolError {
                program: name,
                reason: format!("spawn failed: {}", e),
            })
        }
        Err(_) => {
            return Err(ToolError {
                program: name,
                reason: format!("timed out after {:?}", timeout),
            })
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    trace!("{} stdout: {}", name, stdout.trim());

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let first_line = stderr
            .lines()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("no diagnostic output")
            .trim()
            .to_string();
        return Err(ToolError {
            program: name,
            reason: format!("exit status {}: {}", output.status, first_line),
        });
    }

    Ok(stdout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_binary_is_a_tool_error() {
        let err = run_tool(
            Path::new("/nonexistent/VBoxManage"),
            &["list", "vms"],
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(err.reason.contains("spawn failed"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_a_tool_error() {
        let err = run_tool(Path::new("sh"), &["-c", "echo boom >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.reason.contains("boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_stdout_is_returned() {
        let out = run_tool(Path::new("sh"), &["-c", "echo running"], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out.trim(), "running");
    }
}
