//! Helper process execution.
//!
//! Host plumbing (`ip`, `tc`, `ebtables`, `modprobe`, `nsenter`) is driven by
//! short-lived helper processes. Failures carry the helper's stderr.

use std::process::Command;

use corral_common::error::{CorralError, Result};

/// Output from a helper command.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Standard output from the command.
    pub stdout: String,
    /// Standard error from the command.
    pub stderr: String,
    /// Exit code returned by the command.
    pub exit_code: i32,
}

/// Runs `program` with `args` and returns its output, whatever the exit status.
///
/// # Errors
///
/// Returns an error if the program cannot be spawned.
pub fn exec<S: AsRef<str>>(program: &str, args: &[S]) -> Result<ExecOutput> {
    let args: Vec<&str> = args.iter().map(|a| a.as_ref()).collect();
    tracing::debug!(program, args = ?args, "running helper");
    let output = Command::new(program)
        .args(&args)
        .output()
        .map_err(|e| CorralError::Io {
            path: program.into(),
            source: e,
        })?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    })
}

/// Runs `program` with `args`, failing on a non-zero exit status.
///
/// Returns the standard output.
///
/// # Errors
///
/// Returns [`CorralError::External`] naming the command and its stderr when
/// the exit status is non-zero.
pub fn run<S: AsRef<str>>(program: &str, args: &[S]) -> Result<String> {
    let output = exec(program, args)?;
    if output.exit_code != 0 {
        let line = std::iter::once(program)
            .chain(args.iter().map(|a| a.as_ref()))
            .collect::<Vec<_>>()
            .join(" ");
        return Err(CorralError::External {
            context: format!("failed to run: {line}"),
            message: output.stderr.trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// Runs a command inside the mount and network namespaces of `pid` via `nsenter`.
///
/// # Errors
///
/// Returns an error if the command is empty or exits with a failure.
pub fn run_in_namespaces(pid: u32, namespaces: &[&str], command: &[&str]) -> Result<String> {
    if command.is_empty() {
        return Err(CorralError::validation("namespace command is empty"));
    }
    let target = pid.to_string();
    let mut args: Vec<&str> = vec!["--target", &target];
    args.extend(namespaces.iter().copied());
    args.push("--");
    args.extend(command.iter().copied());
    run("nsenter", &args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_returns_stdout() {
        let out = run("sh", &["-c", "echo hello"]).expect("sh");
        assert_eq!(out.trim(), "hello");
    }

    #[test]
    fn run_reports_stderr_on_failure() {
        let err = run("sh", &["-c", "echo boom >&2; exit 3"]).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("boom"));
        assert!(text.contains("sh -c"));
    }

    #[test]
    fn exec_keeps_exit_code() {
        let out = exec("sh", &["-c", "exit 7"]).expect("spawn");
        assert_eq!(out.exit_code, 7);
    }

    #[test]
    fn missing_program_is_an_io_error() {
        let err = exec::<&str>("definitely-not-a-real-binary", &[]).unwrap_err();
        assert!(matches!(err, CorralError::Io { .. }));
    }

    #[test]
    fn empty_namespace_command_is_rejected() {
        assert!(run_in_namespaces(1, &["--mount"], &[]).is_err());
    }
}
