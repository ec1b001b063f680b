//! Session pool.
//!
//! Registry of live sessions keyed by id, factory for new sessions, and the
//! two periodic sweepers: the idle reaper, which destroys sessions that sat
//! with zero clients past the grace period, and the tmux orphan reaper,
//! which kills `pty_`-prefixed tmux sessions nobody is using anymore.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::pty::{shell_default_args, PtyBackend, PtyError};
use super::session::{Session, SessionError};
use super::tmux;

/// Prefix of generated session ids, and of the tmux sessions backing them.
pub const SESSION_ID_PREFIX: &str = "pty_";

/// Floor for the orphan reaper period.
const TMUX_CLEANUP_MIN_INTERVAL: Duration = Duration::from_secs(600);

/// Errors from pool operations.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn session: {0}")]
    Spawn(#[from] PtyError),

    #[error("multiplexer support is disabled")]
    MultiplexerDisabled,

    #[error("multiplexer session {0:?} no longer exists")]
    MultiplexerGone(String),

    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Pool-level configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// How long a session may sit with zero clients before destruction.
    pub session_timeout: Duration,

    /// Period of the idle reaper.
    pub cleanup_interval: Duration,

    /// Command used when a create request names none.
    pub default_command: String,

    /// Arguments used when a create request names none.
    pub default_args: Vec<String>,

    /// Working directory used when a create request names none.
    pub default_workdir: String,

    /// Spawn sessions inside tmux.
    pub tmux_enabled: bool,

    /// Max client-less time before the orphan reaper kills a tracked tmux
    /// session.
    pub max_inactive: Duration,

    /// Period of the orphan reaper, clamped to a 10-minute floor.
    pub tmux_cleanup_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            session_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(10),
            default_command: crate::config::default_command(),
            default_args: Vec::new(),
            default_workdir: String::new(),
            tmux_enabled: false,
            max_inactive: Duration::from_secs(3600),
            tmux_cleanup_interval: Duration::from_secs(600),
        }
    }
}

/// Registry of live sessions.
pub struct SessionPool {
    config: PoolConfig,
    sessions: DashMap<String, Arc<Session>>,
}

impl SessionPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    /// Creates a session, spawning its backend directly or inside tmux
    /// depending on configuration. Unset request fields fall back to pool
    /// defaults.
    pub async fn create(
        &self,
        cols: u16,
        rows: u16,
        command: &str,
        args: &[String],
        workdir: &str,
    ) -> Result<Arc<Session>, PoolError> {
        let (command, args, workdir) = self.resolve_defaults(command, args, workdir);
        let id = format!("{}{}", SESSION_ID_PREFIX, Uuid::new_v4().simple());

        let backend = if self.config.tmux_enabled {
            // The session id doubles as the tmux session name.
            PtyBackend::spawn_multiplexed(&id, &command, &args, cols, rows, &workdir)?
        } else {
            PtyBackend::spawn(&command, &args, cols, rows, &workdir)?
        };

        let session = Session::new(id.clone(), backend, cols, rows)?;
        self.sessions.insert(id.clone(), Arc::clone(&session));

        tracing::info!(
            session_id = %id,
            command = %command,
            args = ?args,
            workdir = %workdir,
            cols,
            rows,
            tmux = self.config.tmux_enabled,
            "Session created"
        );
        Ok(session)
    }

    /// Resolution chain for create parameters: request value, pool default,
    /// then shell login/interactive flags for arg-less shells.
    fn resolve_defaults(
        &self,
        command: &str,
        args: &[String],
        workdir: &str,
    ) -> (String, Vec<String>, String) {
        let command = if command.is_empty() {
            self.config.default_command.clone()
        } else {
            command.to_string()
        };

        let mut args = if args.is_empty() {
            self.config.default_args.clone()
        } else {
            args.to_vec()
        };
        if args.is_empty() {
            if let Some(defaults) = shell_default_args(&command) {
                args = defaults;
            }
        }

        let workdir = if workdir.is_empty() {
            self.config.default_workdir.clone()
        } else {
            workdir.to_string()
        };

        (command, args, workdir)
    }

    /// Returns the session iff it is present and not closed.
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        let session = self.sessions.get(id).map(|entry| Arc::clone(entry.value()))?;
        if session.is_closed() {
            None
        } else {
            Some(session)
        }
    }

    /// Destroys a session, backing tmux session included. Idempotent on
    /// unknown ids.
    pub async fn remove(&self, id: &str) {
        if let Some((_, session)) = self.sessions.remove(id) {
            session.close_and_destroy().await;
            tracing::info!(session_id = %id, "Session removed");
        }
    }

    /// Re-attaches a session to its tmux backing process with a fresh PTY.
    pub async fn reattach(
        &self,
        session: &Arc<Session>,
        cols: u16,
        rows: u16,
    ) -> Result<(), PoolError> {
        if !self.config.tmux_enabled {
            return Err(PoolError::MultiplexerDisabled);
        }
        let Some(name) = session.multiplexer_name() else {
            return Err(SessionError::NotMultiplexed(session.id().to_string()).into());
        };
        if !tmux::session_exists(&name) {
            return Err(PoolError::MultiplexerGone(name));
        }

        let backend = PtyBackend::attach_multiplexed(&name, cols, rows)?;
        session.replace_backend(backend).await?;

        tracing::info!(session_id = %session.id(), tmux_session = %name, "Reattached");
        Ok(())
    }

    /// Destroys every session, backing tmux sessions included.
    pub async fn close_all(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|entry| entry.key().clone()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close_and_destroy().await;
            }
        }
        tracing::info!("All sessions closed");
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    /// Idle reaper loop. Runs until the token fires.
    pub async fn run_cleanup(self: Arc<Self>, token: CancellationToken) {
        let period = self.config.cleanup_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = ticker.tick() => self.sweep_idle().await,
            }
        }
    }

    /// One idle-reaper pass.
    ///
    /// The registry is only touched for snapshotting and removal; session
    /// teardown happens on owned handles outside any map shard.
    async fn sweep_idle(&self) {
        let now = Instant::now();
        let snapshot: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        for (id, session) in snapshot {
            if session.is_closed() {
                if self.sessions.remove(&id).is_some() {
                    tracing::debug!(session_id = %id, "Dropped closed session");
                }
                continue;
            }

            let Some(disconnected_at) = session.disconnected_at().await else {
                continue;
            };
            if session.client_count().await != 0 {
                continue;
            }
            let idle_for = now.duration_since(disconnected_at);
            if idle_for <= self.config.session_timeout {
                continue;
            }

            if let Some((_, session)) = self.sessions.remove(&id) {
                tracing::info!(
                    session_id = %id,
                    disconnected_for = ?idle_for,
                    tmux = session.multiplexer_name().is_some(),
                    "Session expired"
                );
                session.close_and_destroy().await;
            }
        }
    }

    /// Orphan tmux reaper loop. Runs until the token fires; does nothing
    /// when tmux mode is off.
    pub async fn run_tmux_cleanup(self: Arc<Self>, token: CancellationToken) {
        if !self.config.tmux_enabled {
            return;
        }

        let period = self.config.tmux_cleanup_interval.max(TMUX_CLEANUP_MIN_INTERVAL);
        tracing::info!(
            interval = ?period,
            max_inactive = ?self.config.max_inactive,
            "Starting tmux cleanup task"
        );

        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("tmux cleanup task stopped");
                    return;
                }
                _ = ticker.tick() => self.sweep_tmux().await,
            }
        }
    }

    /// One orphan-reaper pass over `pty_`-prefixed tmux sessions.
    ///
    /// Tracked sessions are killed once they have had no clients for longer
    /// than `max_inactive`; untracked ones as soon as tmux reports zero
    /// attached clients. Kills happen outside the registry.
    async fn sweep_tmux(&self) {
        let names = match tmux::list_sessions(SESSION_ID_PREFIX) {
            Ok(names) => names,
            Err(err) => {
                tracing::error!(error = %err, "Failed to list tmux sessions");
                return;
            }
        };
        if names.is_empty() {
            return;
        }

        let now = Instant::now();
        let snapshot: Vec<(String, Arc<Session>)> = self
            .sessions
            .iter()
            .map(|entry| (entry.key().clone(), Arc::clone(entry.value())))
            .collect();

        let mut victims: Vec<(String, Option<String>)> = Vec::new();
        for name in names {
            let tracked = snapshot
                .iter()
                .find(|(_, session)| session.multiplexer_name().as_deref() == Some(name.as_str()));

            match tracked {
                Some((id, session)) => {
                    if session.client_count().await == 0
                        && now.duration_since(session.last_activity().await)
                            > self.config.max_inactive
                    {
                        victims.push((name, Some(id.clone())));
                    }
                }
                None => match tmux::attached_clients(&name) {
                    Ok(0) => victims.push((name, None)),
                    Ok(_) => {}
                    Err(err) => {
                        tracing::debug!(
                            tmux_session = %name,
                            error = %err,
                            "Could not query tmux attachment count"
                        );
                    }
                },
            }
        }

        let killed = victims.len();
        for (name, id) in victims {
            if let Err(err) = tmux::kill_session(&name) {
                tracing::error!(tmux_session = %name, error = %err, "Failed to kill tmux session");
                continue;
            }
            tracing::info!(tmux_session = %name, "Killed inactive tmux session");

            // The tmux session is gone; drop the tracked session without
            // another kill attempt.
            if let Some(id) = id {
                if let Some((_, session)) = self.sessions.remove(&id) {
                    session.close().await;
                }
            }
        }

        if killed > 0 {
            tracing::info!(killed, "tmux cleanup completed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::session::ClientConnection;
    use async_trait::async_trait;

    struct NullClient;

    #[async_trait]
    impl ClientConnection for NullClient {
        async fn send_binary(&self, _data: &[u8]) -> std::io::Result<()> {
            Ok(())
        }
        async fn send_close(&self, _code: u16, _reason: &str) {}
        async fn shutdown(&self) {}
    }

    fn test_config() -> PoolConfig {
        PoolConfig {
            default_command: "/bin/sh".to_string(),
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn create_then_get_returns_same_session() {
        let pool = SessionPool::new(test_config());
        let session = pool.create(80, 24, "", &[], "").await.expect("create");

        assert!(session.id().starts_with(SESSION_ID_PREFIX));
        assert!(session.id().len() >= SESSION_ID_PREFIX.len() + 20);

        let fetched = pool.get(session.id()).expect("get");
        assert!(Arc::ptr_eq(&session, &fetched));
        assert_eq!(pool.count(), 1);

        pool.close_all().await;
    }

    #[tokio::test]
    async fn get_unknown_returns_none() {
        let pool = SessionPool::new(test_config());
        assert!(pool.get("pty_nonexistent").is_none());
    }

    #[tokio::test]
    async fn get_filters_closed_sessions() {
        let pool = SessionPool::new(test_config());
        let session = pool.create(80, 24, "", &[], "").await.expect("create");

        session.close().await;
        assert!(pool.get(session.id()).is_none());

        pool.close_all().await;
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let pool = SessionPool::new(test_config());
        let session = pool.create(80, 24, "", &[], "").await.expect("create");
        let id = session.id().to_string();

        pool.remove(&id).await;
        assert!(pool.get(&id).is_none());
        assert_eq!(pool.count(), 0);
        assert!(session.is_closed());

        // Second remove of the same id is a no-op.
        pool.remove(&id).await;
        pool.remove("pty_never_existed").await;
    }

    #[tokio::test]
    async fn defaults_resolution_chain() {
        let pool = SessionPool::new(PoolConfig {
            default_command: "/bin/sh".to_string(),
            default_args: vec!["-x".to_string()],
            default_workdir: "/tmp".to_string(),
            ..PoolConfig::default()
        });

        // Request values win.
        let (cmd, args, wd) =
            pool.resolve_defaults("/bin/dash", &["-c".to_string()], "/var/tmp");
        assert_eq!(cmd, "/bin/dash");
        assert_eq!(args, vec!["-c"]);
        assert_eq!(wd, "/var/tmp");

        // Pool defaults fill the gaps.
        let (cmd, args, wd) = pool.resolve_defaults("", &[], "");
        assert_eq!(cmd, "/bin/sh");
        assert_eq!(args, vec!["-x"]);
        assert_eq!(wd, "/tmp");

        // A shell with no args anywhere gets login + interactive flags.
        let bare = SessionPool::new(PoolConfig {
            default_command: "/bin/sh".to_string(),
            ..PoolConfig::default()
        });
        let (_, args, _) = bare.resolve_defaults("", &[], "");
        assert_eq!(args, vec!["-l", "-i"]);

        // A non-shell command gets no invented args.
        let (_, args, _) = bare.resolve_defaults("/usr/bin/env", &[], "");
        assert!(args.is_empty());
    }

    #[tokio::test]
    async fn spawn_failure_propagates_and_creates_nothing() {
        let pool = SessionPool::new(test_config());
        let result = pool
            .create(80, 24, "definitely-not-a-real-command", &[], "")
            .await;
        assert!(matches!(result, Err(PoolError::Spawn(_))));
        assert_eq!(pool.count(), 0);
    }

    #[tokio::test]
    async fn reaper_destroys_idle_sessions() {
        let pool = Arc::new(SessionPool::new(PoolConfig {
            session_timeout: Duration::from_millis(100),
            cleanup_interval: Duration::from_millis(30),
            default_command: "/bin/sh".to_string(),
            ..PoolConfig::default()
        }));

        let session = pool.create(80, 24, "", &[], "").await.expect("create");
        let id = session.id().to_string();

        // Simulate a connect/disconnect cycle.
        session
            .add_client(1, "client".to_string(), Arc::new(NullClient))
            .await
            .unwrap();
        session.remove_client(1).await;

        let token = CancellationToken::new();
        tokio::spawn(Arc::clone(&pool).run_cleanup(token.clone()));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(pool.get(&id).is_none(), "idle session should be reaped");
        assert_eq!(pool.count(), 0);
        assert!(session.is_closed());

        token.cancel();
    }

    #[tokio::test]
    async fn reaper_spares_occupied_sessions() {
        let pool = Arc::new(SessionPool::new(PoolConfig {
            session_timeout: Duration::from_millis(50),
            cleanup_interval: Duration::from_millis(20),
            default_command: "/bin/sh".to_string(),
            ..PoolConfig::default()
        }));

        let session = pool.create(80, 24, "", &[], "").await.expect("create");
        session
            .add_client(1, "client".to_string(), Arc::new(NullClient))
            .await
            .unwrap();

        let token = CancellationToken::new();
        tokio::spawn(Arc::clone(&pool).run_cleanup(token.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(
            pool.get(session.id()).is_some(),
            "occupied session must survive the reaper"
        );

        token.cancel();
        pool.close_all().await;
    }

    #[tokio::test]
    async fn close_all_empties_the_pool() {
        let pool = SessionPool::new(test_config());
        let a = pool.create(80, 24, "", &[], "").await.expect("create a");
        let b = pool.create(80, 24, "", &[], "").await.expect("create b");
        assert_eq!(pool.count(), 2);

        pool.close_all().await;
        assert_eq!(pool.count(), 0);
        assert!(a.is_closed());
        assert!(b.is_closed());
    }

    #[tokio::test]
    async fn reattach_requires_tmux_mode() {
        let pool = SessionPool::new(test_config());
        let session = pool.create(80, 24, "", &[], "").await.expect("create");

        let result = pool.reattach(&session, 80, 24).await;
        assert!(matches!(result, Err(PoolError::MultiplexerDisabled)));

        pool.close_all().await;
    }

    #[tokio::test]
    async fn tmux_session_lifecycle() {
        if !tmux::is_installed() {
            return;
        }

        let pool = SessionPool::new(PoolConfig {
            tmux_enabled: true,
            default_command: "/bin/sh".to_string(),
            ..PoolConfig::default()
        });

        let session = pool.create(80, 24, "", &[], "").await.expect("create");
        let id = session.id().to_string();
        let name = session.multiplexer_name().expect("tmux-backed");
        assert_eq!(name, id);
        assert!(tmux::session_exists(&name));

        // Reattach swaps the attachment while the tmux session survives.
        pool.reattach(&session, 100, 30).await.expect("reattach");
        assert!(tmux::session_exists(&name));
        assert!(!session.is_closed());

        // Explicit removal destroys the tmux session.
        pool.remove(&id).await;
        assert!(!tmux::session_exists(&name));
    }
}
