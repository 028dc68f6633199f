//! Build and simulator processes.
//!
//! Every subprocess gets its working directory explicitly, so concurrent
//! workers never depend on the process-wide current directory.

pub mod local;

pub use local::exec_shell;

use crate::core::types::{BuildMethod, Preferences};
use std::path::{Path, PathBuf};

/// Output from a finished subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout, then stderr under a banner when non-empty (the run log layout).
    pub fn log_text(&self) -> String {
        let mut out = self.stdout.clone();
        if !self.stderr.is_empty() {
            let stars = "*".repeat(15);
            out.push_str(&format!("{} stderr {}\n", stars, stars));
            out.push_str(&self.stderr);
        }
        out
    }
}

/// Shell command used to build the simulator.
pub fn build_command(prefs: &Preferences) -> String {
    if let Some(cmd) = prefs.build_command.as_deref().filter(|c| !c.trim().is_empty()) {
        return cmd.to_string();
    }
    match prefs.build_method {
        BuildMethod::Scons => "scons".to_string(),
        BuildMethod::Make => format!("make {}", prefs.simulator_name),
    }
}

/// Build the simulator in `cwd`.
pub fn build(prefs: &Preferences, cwd: &Path) -> Result<ExecOutput, String> {
    let cmd = build_command(prefs);
    log::debug!("build in {}: {}", cwd.display(), cmd);
    exec_shell(&cmd, cwd)
}

/// Path of the built simulator, if present.
pub fn artifact_path(cwd: &Path, name: &str) -> Option<PathBuf> {
    [cwd.join(name), cwd.join(format!("{}.exe", name))]
        .into_iter()
        .find(|p| p.is_file())
}

/// Shell line that launches the simulator at reduced priority.
pub fn simulator_command(name: &str) -> String {
    if cfg!(windows) {
        format!("{}.exe", name)
    } else {
        format!("nice -n 9 ./{}", name)
    }
}

/// Run the simulator in `cwd` to completion.
pub fn run_simulator(cwd: &Path, name: &str) -> Result<ExecOutput, String> {
    exec_shell(&simulator_command(name), cwd)
}

/// Force-kill every running simulator named `name`.
pub fn kill_simulators(name: &str) -> Result<(), String> {
    let cmd = if cfg!(windows) {
        format!("taskkill /F /IM {}.exe", name)
    } else {
        format!("pkill -9 -f '\\./{}$'", name)
    };
    let out = exec_shell(&cmd, &std::env::temp_dir())?;
    // pkill exits 1 when nothing matched
    if out.exit_code > 1 {
        return Err(format!("cannot kill {}: {}", name, out.stderr.trim()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toolchain_build_command() {
        let mut prefs = Preferences::default();
        assert_eq!(build_command(&prefs), "make mikenet_master");
        prefs.build_method = BuildMethod::Scons;
        assert_eq!(build_command(&prefs), "scons");
        prefs.build_command = Some("cc -o sim build_model.c".into());
        assert_eq!(build_command(&prefs), "cc -o sim build_model.c");
        prefs.build_command = Some("  ".into());
        assert_eq!(build_command(&prefs), "scons");
    }

    #[test]
    fn test_toolchain_log_text() {
        let out = ExecOutput {
            exit_code: 0,
            stdout: "avgError: 0.5\n".into(),
            stderr: String::new(),
        };
        assert_eq!(out.log_text(), "avgError: 0.5\n");
        let out = ExecOutput {
            stderr: "oops\n".into(),
            ..out
        };
        assert_eq!(
            out.log_text(),
            "avgError: 0.5\n*************** stderr ***************\noops\n"
        );
    }

    #[test]
    fn test_toolchain_artifact_path() {
        let dir = tempfile::tempdir().unwrap();
        assert!(artifact_path(dir.path(), "mikenet_master").is_none());
        std::fs::write(dir.path().join("mikenet_master"), "").unwrap();
        assert_eq!(
            artifact_path(dir.path(), "mikenet_master"),
            Some(dir.path().join("mikenet_master"))
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_toolchain_build_and_run() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let prefs = Preferences {
            build_command: Some("printf '#!/bin/sh\\necho ran\\n' > sim && chmod +x sim".into()),
            simulator_name: "sim".into(),
            ..Preferences::default()
        };
        assert!(build(&prefs, dir.path()).unwrap().success());
        let sim = artifact_path(dir.path(), "sim").unwrap();
        assert!(std::fs::metadata(sim).unwrap().permissions().mode() & 0o111 != 0);
        let out = run_simulator(dir.path(), "sim").unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "ran");
    }
}
