use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Run an external command with a hard deadline.
///
/// Returns trimmed stdout on a zero exit status, otherwise a message built
/// from stderr (or the spawn/timeout failure).
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> Result<String, String> {
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => output,
        Ok(Err(e)) => return Err(format!("{program}: {e}")),
        Err(_) => return Err(format!("{program}: timed out after {}s", timeout.as_secs())),
    };

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Err(format!("{program} exited with {}: {stderr}", output.status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn successful_command_returns_stdout() {
        let out = run("sh", &["-c", "echo hello"], Duration::from_secs(5)).await.unwrap();
        assert_eq!(out, "hello");
    }

    #[tokio::test]
    async fn failing_command_reports_stderr() {
        let err = run("sh", &["-c", "echo nope >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.contains("nope"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let err = run("sleep", &["5"], Duration::from_millis(100)).await.unwrap_err();
        assert!(err.contains("timed out"));
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        assert!(run("definitely-not-a-real-binary", &[], Duration::from_secs(1))
            .await
            .is_err());
    }
}
