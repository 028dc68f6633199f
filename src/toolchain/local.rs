//! Local shell execution in an explicit working directory.

use super::ExecOutput;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// Run a shell snippet in `cwd` and capture its output.
/// On unix the snippet is piped into `bash`; on Windows it is passed to `cmd /C`.
pub fn exec_shell(script: &str, cwd: &Path) -> Result<ExecOutput, String> {
    let mut child = shell_command(script)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| format!("failed to spawn shell in {}: {}", cwd.display(), e))?;

    if cfg!(unix) {
        if let Some(ref mut stdin) = child.stdin {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| format!("stdin write error: {}", e))?;
        }
    }
    drop(child.stdin.take());

    let output = child
        .wait_with_output()
        .map_err(|e| format!("wait error: {}", e))?;

    Ok(ExecOutput {
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

#[cfg(unix)]
fn shell_command(_script: &str) -> Command {
    Command::new("bash")
}

#[cfg(not(unix))]
fn shell_command(script: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(script);
    cmd
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_local_echo() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_shell("echo hello", dir.path()).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_local_runs_in_cwd() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("marker.txt"), "x").unwrap();
        let out = exec_shell("ls", dir.path()).unwrap();
        assert!(out.stdout.contains("marker.txt"));
        // the process-wide directory is untouched
        assert_ne!(std::env::current_dir().unwrap(), dir.path());
    }

    #[test]
    fn test_local_failure_and_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_shell("echo bad >&2\nexit 42", dir.path()).unwrap();
        assert_eq!(out.exit_code, 42);
        assert!(out.stderr.contains("bad"));
    }

    #[test]
    fn test_local_signal_killed() {
        let dir = tempfile::tempdir().unwrap();
        let out = exec_shell("kill -9 $$", dir.path()).unwrap();
        assert_eq!(out.exit_code, -1);
    }

    #[test]
    fn test_local_missing_cwd() {
        assert!(exec_shell("true", Path::new("/nonexistent/run/dir")).is_err());
    }
}
