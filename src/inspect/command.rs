//! Out-of-process inspector invocation

use crate::config::CommandSpec;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Captured output of a finished inspector process
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` when killed by a signal
    pub code: Option<i32>,
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
}

impl CommandOutput {
    /// Exited with status 0
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// stdout followed by stderr
    pub fn combined(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}{}", self.stdout, self.stderr)
        }
    }
}

/// Run the inspector command against `file` within its timeout.
///
/// The file path is passed as the final argument. On expiry the child is
/// killed. The error string is suitable for `failure_detail`.
pub async fn run_inspector_command(spec: &CommandSpec, file: &Path) -> Result<CommandOutput, String> {
    let child = Command::new(&spec.program)
        .args(&spec.args)
        .arg(file)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| format!("failed to start {}: {}", spec.program, e))?;

    let limit = Duration::from_secs(spec.timeout_secs.max(1));
    match timeout(limit, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(format!("{} failed: {}", spec.program, e)),
        Err(_) => Err(format!("{} timed out after {}s", spec.program, limit.as_secs())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_secs: u64) -> CommandSpec {
        CommandSpec::new("sh", &["-c", script], timeout_secs)
    }

    #[tokio::test]
    async fn test_captures_output_and_path() {
        // With `sh -c`, the appended path becomes $0.
        let output = run_inspector_command(&sh("echo \"scanned $0\"", 5), Path::new("/tmp/x.png"))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "scanned /tmp/x.png");
    }

    #[tokio::test]
    async fn test_exit_code_reported() {
        let output = run_inspector_command(&sh("echo oops >&2; exit 2", 5), Path::new("f"))
            .await
            .unwrap();
        assert_eq!(output.code, Some(2));
        assert!(!output.success());
        assert_eq!(output.combined().trim(), "oops");
    }

    #[tokio::test]
    async fn test_missing_program() {
        let spec = CommandSpec::new("/nonexistent/inspector", &[], 5);
        let err = run_inspector_command(&spec, Path::new("f")).await.unwrap_err();
        assert!(err.contains("failed to start"));
    }

    #[tokio::test]
    async fn test_timeout_kills() {
        let start = std::time::Instant::now();
        let err = run_inspector_command(&sh("sleep 30", 1), Path::new("f")).await.unwrap_err();
        assert!(err.contains("timed out"));
        assert!(start.elapsed() < Duration::from_secs(10));
    }
}
