//! PTY backends.
//!
//! A [`PtyBackend`] wraps a running child process plus a master PTY byte
//! stream. Two modes exist: *direct*, where the child is spawned straight
//! onto the PTY, and *multiplexed*, where the child lives inside a detached
//! tmux session and the PTY carries a `tmux attach-session` process. In
//! multiplexed mode, closing the attachment leaves the underlying process
//! running.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use thiserror::Error;

use super::tmux;
use super::tmux::TmuxError;

/// Errors from PTY backend operations.
#[derive(Debug, Error)]
pub enum PtyError {
    /// The command could not be resolved on PATH.
    #[error("command not found: {0}")]
    CommandNotFound(String),

    /// Failed to allocate the PTY or start the child.
    #[error("failed to spawn PTY: {0}")]
    SpawnFailed(String),

    /// Failed to resize the PTY window.
    #[error("failed to resize PTY: {0}")]
    ResizeFailed(String),

    /// Failed to write to the PTY.
    #[error("failed to write to PTY: {0}")]
    WriteFailed(String),

    /// The attachment has already been closed.
    #[error("PTY attachment is closed")]
    AttachmentClosed,

    /// A tmux control command failed.
    #[error(transparent)]
    Tmux(#[from] TmuxError),
}

/// A child process attached to a master PTY.
pub struct PtyBackend {
    /// Master side of the PTY. Taken on close so the fd is released.
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,

    /// Writer half of the master.
    writer: Mutex<Option<Box<dyn Write + Send>>>,

    /// The attachment process: the shell itself in direct mode, the
    /// `tmux attach-session` process in multiplexed mode.
    child: Mutex<Option<Box<dyn Child + Send + Sync>>>,

    /// tmux session name in multiplexed mode.
    multiplexer: Option<String>,

    /// Set once the attachment has been torn down.
    closed: AtomicBool,

    /// Set once the backing tmux session has been killed.
    destroyed: AtomicBool,
}

impl PtyBackend {
    /// Spawns a direct PTY running `command` with `args`.
    ///
    /// The command is resolved on PATH. An empty `workdir` means the
    /// invoking user's home directory. When the command looks like a POSIX
    /// shell and no args were supplied, login + interactive flags are used.
    pub fn spawn(
        command: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        workdir: &str,
    ) -> Result<Self, PtyError> {
        let resolved = which::which(command)
            .map_err(|_| PtyError::CommandNotFound(command.to_string()))?;

        let mut cmd = CommandBuilder::new(resolved);
        if args.is_empty() {
            if let Some(defaults) = shell_default_args(command) {
                cmd.args(defaults);
            }
        } else {
            cmd.args(args);
        }
        apply_child_env(&mut cmd);
        if workdir.is_empty() {
            if let Some(home) = dirs::home_dir() {
                cmd.cwd(home);
            }
        } else {
            cmd.cwd(workdir);
        }

        Self::open(cmd, cols, rows, None)
    }

    /// Creates a detached tmux session named `name` running the command,
    /// then opens a PTY attachment to it.
    pub fn spawn_multiplexed(
        name: &str,
        command: &str,
        args: &[String],
        cols: u16,
        rows: u16,
        workdir: &str,
    ) -> Result<Self, PtyError> {
        tmux::new_session(name, command, args, cols, rows, workdir)?;

        match Self::attach_multiplexed(name, cols, rows) {
            Ok(backend) => Ok(backend),
            Err(err) => {
                // The tmux session was just created for this attachment; do
                // not leave it orphaned when the attach fails.
                if let Err(kill_err) = tmux::kill_session(name) {
                    tracing::warn!(
                        session = %name,
                        error = %kill_err,
                        "Failed to clean up tmux session after attach failure"
                    );
                }
                Err(err)
            }
        }
    }

    /// Opens a new PTY attachment to an existing tmux session.
    pub fn attach_multiplexed(name: &str, cols: u16, rows: u16) -> Result<Self, PtyError> {
        if !tmux::session_exists(name) {
            return Err(TmuxError::SessionNotFound(name.to_string()).into());
        }

        let mut cmd = CommandBuilder::new("tmux");
        cmd.args(["attach-session", "-t", name]);
        apply_child_env(&mut cmd);

        Self::open(cmd, cols, rows, Some(name.to_string()))
    }

    fn open(
        cmd: CommandBuilder,
        cols: u16,
        rows: u16,
        multiplexer: Option<String>,
    ) -> Result<Self, PtyError> {
        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PtyError::SpawnFailed(e.to_string()))?;

        Ok(Self {
            master: Mutex::new(Some(pair.master)),
            writer: Mutex::new(Some(writer)),
            child: Mutex::new(Some(child)),
            multiplexer,
            closed: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        })
    }

    /// The tmux session name, if this backend is multiplexed.
    pub fn multiplexer_name(&self) -> Option<&str> {
        self.multiplexer.as_deref()
    }

    /// Whether the attachment has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Clones the master's reader for a reader task.
    pub fn reader(&self) -> Result<Box<dyn Read + Send>, PtyError> {
        let master = lock_unpoisoned(&self.master);
        match master.as_ref() {
            Some(master) => master
                .try_clone_reader()
                .map_err(|e| PtyError::SpawnFailed(e.to_string())),
            None => Err(PtyError::AttachmentClosed),
        }
    }

    /// Writes bytes to the PTY and flushes.
    pub fn write(&self, data: &[u8]) -> Result<(), PtyError> {
        let mut writer = lock_unpoisoned(&self.writer);
        let writer = writer.as_mut().ok_or(PtyError::AttachmentClosed)?;
        writer
            .write_all(data)
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        writer
            .flush()
            .map_err(|e| PtyError::WriteFailed(e.to_string()))?;
        Ok(())
    }

    /// Resizes the PTY window.
    ///
    /// In multiplexed mode the tmux window is resized too, best-effort: a
    /// failure there is logged and swallowed, the attachment resize is the
    /// source of truth.
    pub fn resize(&self, cols: u16, rows: u16) -> Result<(), PtyError> {
        if let Some(name) = &self.multiplexer {
            if let Err(err) = tmux::resize_window(name, cols, rows) {
                tracing::debug!(session = %name, error = %err, "tmux window resize failed");
            }
        }

        let master = lock_unpoisoned(&self.master);
        let master = master.as_ref().ok_or(PtyError::AttachmentClosed)?;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PtyError::ResizeFailed(e.to_string()))
    }

    /// Terminates the attachment process and closes the PTY.
    ///
    /// In direct mode this necessarily ends the child; in multiplexed mode
    /// the tmux session keeps running. Idempotent.
    pub fn close_attachment(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(mut child) = lock_unpoisoned(&self.child).take() {
            // Killing the attachment hangs up the PTY slave, which unblocks
            // any reader still parked on the master.
            let _ = child.kill();
            let _ = child.wait();
        }
        lock_unpoisoned(&self.writer).take();
        lock_unpoisoned(&self.master).take();
    }

    /// As [`Self::close_attachment`], plus kills the backing tmux session
    /// when multiplexed. Idempotent.
    pub fn close_and_destroy(&self) {
        self.close_attachment();

        if let Some(name) = &self.multiplexer {
            if !self.destroyed.swap(true, Ordering::SeqCst) {
                if let Err(err) = tmux::kill_session(name) {
                    tracing::error!(session = %name, error = %err, "Failed to kill tmux session");
                }
            }
        }
    }
}

/// Default arguments for POSIX shells invoked without explicit args:
/// login + interactive.
pub fn shell_default_args(command: &str) -> Option<Vec<String>> {
    if command.ends_with("sh") || command.contains("/sh") {
        Some(vec!["-l".to_string(), "-i".to_string()])
    } else {
        None
    }
}

/// Children inherit the parent environment with the terminal type forced.
fn apply_child_env(cmd: &mut CommandBuilder) {
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn shell_defaults_applied_to_shells_only() {
        assert_eq!(
            shell_default_args("/bin/bash"),
            Some(vec!["-l".to_string(), "-i".to_string()])
        );
        assert_eq!(
            shell_default_args("zsh"),
            Some(vec!["-l".to_string(), "-i".to_string()])
        );
        assert!(shell_default_args("/usr/bin/python3").is_none());
        assert!(shell_default_args("top").is_none());
    }

    #[test]
    fn spawn_unknown_command_fails() {
        let result = PtyBackend::spawn("definitely-not-a-real-command", &[], 80, 24, "");
        assert!(matches!(result, Err(PtyError::CommandNotFound(_))));
    }

    #[test]
    fn spawn_and_close_shell() {
        let backend =
            PtyBackend::spawn("/bin/sh", &["-c".to_string(), "sleep 30".to_string()], 80, 24, "")
                .expect("spawn shell");
        assert!(!backend.is_closed());
        assert!(backend.multiplexer_name().is_none());

        backend.close_attachment();
        assert!(backend.is_closed());

        // Idempotent.
        backend.close_attachment();
        backend.close_and_destroy();
    }

    #[test]
    fn write_after_close_fails() {
        let backend = PtyBackend::spawn("/bin/sh", &[], 80, 24, "").expect("spawn shell");
        backend.close_attachment();
        assert!(matches!(
            backend.write(b"echo hello\n"),
            Err(PtyError::AttachmentClosed)
        ));
    }

    #[test]
    fn resize_after_close_fails() {
        let backend = PtyBackend::spawn("/bin/sh", &[], 80, 24, "").expect("spawn shell");
        backend.close_attachment();
        assert!(matches!(
            backend.resize(120, 40),
            Err(PtyError::AttachmentClosed)
        ));
    }

    #[test]
    fn echo_roundtrip() {
        let backend = PtyBackend::spawn("/bin/sh", &[], 80, 24, "").expect("spawn shell");
        let mut reader = backend.reader().expect("clone reader");

        backend.write(b"echo pty_echo_marker\n").expect("write");

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains("pty_echo_marker") {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        assert!(
            String::from_utf8_lossy(&collected).contains("pty_echo_marker"),
            "expected echoed marker in PTY output"
        );

        backend.close_attachment();
    }

    #[test]
    fn spawn_respects_workdir() {
        let dir = tempfile::tempdir().expect("tempdir");
        let workdir = dir.path().to_string_lossy().into_owned();
        let marker = dir
            .path()
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .expect("tempdir has a name");

        let backend = PtyBackend::spawn("/bin/sh", &[], 80, 24, &workdir).expect("spawn shell");
        let mut reader = backend.reader().expect("clone reader");
        backend.write(b"pwd\n").expect("write");

        let mut collected = Vec::new();
        let mut buf = [0u8; 4096];
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while std::time::Instant::now() < deadline {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains(&marker) {
                        break;
                    }
                }
                Err(_) => break,
            }
        }

        assert!(
            String::from_utf8_lossy(&collected).contains(&marker),
            "shell did not start in the requested workdir"
        );
        backend.close_attachment();
    }

    #[test]
    fn attach_to_missing_tmux_session_fails() {
        if !tmux::is_installed() {
            return;
        }
        let result = PtyBackend::attach_multiplexed("ptygate_test_definitely_missing", 80, 24);
        assert!(matches!(
            result,
            Err(PtyError::Tmux(TmuxError::SessionNotFound(_)))
        ));
    }

    #[test]
    fn multiplexed_attachment_close_keeps_session() {
        if !tmux::is_installed() {
            return;
        }
        let name = format!("pty_backend_test_{}", std::process::id());
        let _ = tmux::kill_session(&name);

        let backend = PtyBackend::spawn_multiplexed(&name, "/bin/sh", &[], 80, 24, "")
            .expect("spawn inside tmux");
        assert_eq!(backend.multiplexer_name(), Some(name.as_str()));

        // Closing the attachment must not kill the tmux session.
        backend.close_attachment();
        assert!(tmux::session_exists(&name));

        // A fresh attachment to the same session works.
        let reattached =
            PtyBackend::attach_multiplexed(&name, 100, 30).expect("reattach to tmux session");
        reattached.close_and_destroy();
        assert!(!tmux::session_exists(&name));
    }
}
