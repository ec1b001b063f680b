//! tmux control-command wrappers.
//!
//! Everything here shells out to the `tmux` binary; the PTY attachment to a
//! tmux session is handled by [`crate::session::pty`], not this module.

use std::process::{Command, Stdio};

use thiserror::Error;

/// Errors from tmux control commands.
#[derive(Debug, Error)]
pub enum TmuxError {
    #[error("tmux is not installed or not in PATH")]
    NotInstalled,

    #[error("tmux session {0:?} does not exist")]
    SessionNotFound(String),

    #[error("tmux session {0:?} already exists")]
    SessionExists(String),

    #[error("tmux {command} failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    #[error("failed to run tmux: {0}")]
    Io(#[from] std::io::Error),
}

/// Returns whether tmux is available on PATH.
pub fn is_installed() -> bool {
    which::which("tmux").is_ok()
}

/// Runs `tmux` with the given arguments and captures its output.
fn tmux_output<S: AsRef<std::ffi::OsStr>>(args: &[S]) -> Result<std::process::Output, TmuxError> {
    Command::new("tmux")
        .args(args)
        .env("TERM", "xterm-256color")
        .env("COLORTERM", "truecolor")
        .output()
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                TmuxError::NotInstalled
            } else {
                TmuxError::Io(err)
            }
        })
}

/// Returns whether a tmux session with the given name exists.
pub fn session_exists(name: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", name])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

/// Creates a detached tmux session running `command args...`.
///
/// Fails with [`TmuxError::SessionExists`] if the name is taken.
pub fn new_session(
    name: &str,
    command: &str,
    args: &[String],
    cols: u16,
    rows: u16,
    workdir: &str,
) -> Result<(), TmuxError> {
    if session_exists(name) {
        return Err(TmuxError::SessionExists(name.to_string()));
    }

    let tmux_args = new_session_args(name, command, args, cols, rows, workdir);
    let output = tmux_output(&tmux_args)?;
    check_output("new-session", &output)
}

/// Builds the argument vector for `tmux new-session`.
fn new_session_args(
    name: &str,
    command: &str,
    args: &[String],
    cols: u16,
    rows: u16,
    workdir: &str,
) -> Vec<String> {
    let mut tmux_args = vec![
        "new-session".to_string(),
        "-d".to_string(),
        "-s".to_string(),
        name.to_string(),
        "-x".to_string(),
        cols.to_string(),
        "-y".to_string(),
        rows.to_string(),
    ];
    if !workdir.is_empty() {
        tmux_args.push("-c".to_string());
        tmux_args.push(workdir.to_string());
    }
    tmux_args.push(full_command(command, args));
    tmux_args
}

/// The command string run inside the tmux session.
fn full_command(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Kills a tmux session. A session that is already gone is not an error.
pub fn kill_session(name: &str) -> Result<(), TmuxError> {
    if !session_exists(name) {
        return Ok(());
    }
    let output = tmux_output(&["kill-session", "-t", name])?;
    check_output("kill-session", &output)
}

/// Resizes the tmux window of a session.
pub fn resize_window(name: &str, cols: u16, rows: u16) -> Result<(), TmuxError> {
    let cols_arg = cols.to_string();
    let rows_arg = rows.to_string();
    let output = tmux_output(&[
        "resize-window",
        "-t",
        name,
        "-x",
        cols_arg.as_str(),
        "-y",
        rows_arg.as_str(),
    ])?;
    check_output("resize-window", &output)
}

/// Lists tmux session names starting with `prefix`.
///
/// A tmux server that is not running is reported as an empty list, not an
/// error.
pub fn list_sessions(prefix: &str) -> Result<Vec<String>, TmuxError> {
    let output = tmux_output(&["list-sessions", "-F", "#{session_name}"])?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("no server running") || stderr.contains("No such file or directory") {
            return Ok(Vec::new());
        }
        return Err(TmuxError::CommandFailed {
            command: "list-sessions".to_string(),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout)
        .lines()
        .map(str::trim)
        .filter(|name| !name.is_empty() && name.starts_with(prefix))
        .map(str::to_string)
        .collect())
}

/// Returns how many clients are attached to a tmux session.
pub fn attached_clients(name: &str) -> Result<u32, TmuxError> {
    if !session_exists(name) {
        return Err(TmuxError::SessionNotFound(name.to_string()));
    }
    let output = tmux_output(&["display-message", "-p", "-t", name, "#{session_attached}"])?;
    check_output("display-message", &output)?;

    let stdout = String::from_utf8_lossy(&output.stdout);
    Ok(stdout.trim().parse().unwrap_or(0))
}

fn check_output(command: &str, output: &std::process::Output) -> Result<(), TmuxError> {
    if output.status.success() {
        Ok(())
    } else {
        Err(TmuxError::CommandFailed {
            command: command.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_args_basic() {
        let args = new_session_args("pty_abc", "/bin/sh", &[], 80, 24, "");
        assert_eq!(
            args,
            vec![
                "new-session",
                "-d",
                "-s",
                "pty_abc",
                "-x",
                "80",
                "-y",
                "24",
                "/bin/sh"
            ]
        );
    }

    #[test]
    fn new_session_args_with_workdir_and_args() {
        let args = new_session_args(
            "pty_abc",
            "/bin/bash",
            &["-l".to_string(), "-i".to_string()],
            120,
            40,
            "/tmp",
        );
        assert_eq!(
            args,
            vec![
                "new-session",
                "-d",
                "-s",
                "pty_abc",
                "-x",
                "120",
                "-y",
                "40",
                "-c",
                "/tmp",
                "/bin/bash -l -i"
            ]
        );
    }

    #[test]
    fn full_command_joins_args() {
        assert_eq!(full_command("/bin/sh", &[]), "/bin/sh");
        assert_eq!(
            full_command("/bin/sh", &["-l".to_string(), "-i".to_string()]),
            "/bin/sh -l -i"
        );
    }

    #[test]
    fn kill_missing_session_is_ok() {
        if !is_installed() {
            return;
        }
        assert!(kill_session("ptygate_test_definitely_missing").is_ok());
    }

    #[test]
    fn attached_clients_missing_session_errors() {
        if !is_installed() {
            return;
        }
        let result = attached_clients("ptygate_test_definitely_missing");
        assert!(matches!(result, Err(TmuxError::SessionNotFound(_))));
    }

    #[test]
    fn session_roundtrip() {
        if !is_installed() {
            return;
        }
        let name = format!("pty_test_{}", std::process::id());
        let _ = kill_session(&name);

        new_session(&name, "/bin/sh", &[], 80, 24, "").expect("create tmux session");
        assert!(session_exists(&name));

        // A duplicate name is rejected before tmux is even invoked.
        let dup = new_session(&name, "/bin/sh", &[], 80, 24, "");
        assert!(matches!(dup, Err(TmuxError::SessionExists(_))));

        let listed = list_sessions("pty_test_").expect("list sessions");
        assert!(listed.contains(&name));

        // Detached session has no attached clients.
        assert_eq!(attached_clients(&name).expect("attached count"), 0);

        kill_session(&name).expect("kill tmux session");
        assert!(!session_exists(&name));
    }
}
