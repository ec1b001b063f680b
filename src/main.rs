//! ptygate daemon entry point.

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ptygate::api::{self, AppState};
use ptygate::auth::BasicAuth;
use ptygate::config::{self, AuthCredentials, Config};
use ptygate::session::pool::SessionPool;
use ptygate::session::tmux;

/// Multiplexing PTY gateway: HTTP + WebSocket access to persistent
/// terminal sessions.
#[derive(Parser, Debug)]
#[command(name = "ptygate")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 3001)]
    port: u16,

    /// Seconds a session may sit with zero clients before it is destroyed
    #[arg(long = "session-timeout", default_value_t = 30)]
    session_timeout: u64,

    /// Seconds between idle-reaper passes
    #[arg(long = "cleanup-interval", default_value_t = 10)]
    cleanup_interval: u64,

    /// Command to run (default: $SHELL or /bin/bash)
    #[arg(long)]
    command: Option<String>,

    /// Alias for --command, kept for backward compatibility
    #[arg(long)]
    shell: Option<String>,

    /// Command arguments, comma-separated (default: -l,-i for shells)
    #[arg(long)]
    args: Option<String>,

    /// Working directory for new sessions
    #[arg(long, default_value = "")]
    workdir: String,

    /// Basic auth username (optional)
    #[arg(long = "auth-user")]
    auth_user: Option<String>,

    /// Basic auth password (optional)
    #[arg(long = "auth-pass")]
    auth_pass: Option<String>,

    /// Spawn PTY sessions inside tmux for persistence
    #[arg(long = "tmux-enabled")]
    tmux_enabled: bool,

    /// Seconds a tmux session may go without clients before the orphan
    /// reaper kills it
    #[arg(long = "max-inactive", default_value_t = 3600)]
    max_inactive: u64,

    /// Seconds between orphan-reaper passes (minimum 600)
    #[arg(long = "tmux-cleanup-interval", default_value_t = 600)]
    tmux_cleanup_interval: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn into_config(self) -> Config {
        // --command wins over its legacy alias --shell.
        let command = self
            .command
            .or(self.shell)
            .filter(|cmd| !cmd.is_empty())
            .unwrap_or_else(config::default_command);

        let args = self
            .args
            .map(|raw| {
                raw.split(',')
                    .map(str::to_string)
                    .filter(|arg| !arg.is_empty())
                    .collect()
            })
            .unwrap_or_default();

        let auth = if self.auth_user.is_some() || self.auth_pass.is_some() {
            Some(AuthCredentials {
                username: self.auth_user.unwrap_or_default(),
                password: self.auth_pass.unwrap_or_default(),
            })
        } else {
            None
        };

        Config {
            host: self.host,
            port: self.port,
            session_timeout: Duration::from_secs(self.session_timeout),
            cleanup_interval: Duration::from_secs(self.cleanup_interval),
            command,
            args,
            workdir: self.workdir,
            auth,
            tmux_enabled: self.tmux_enabled,
            max_inactive: Duration::from_secs(self.max_inactive),
            tmux_cleanup_interval: Duration::from_secs(self.tmux_cleanup_interval),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = cli.into_config();
    config.validate()?;

    if config.tmux_enabled {
        if !tmux::is_installed() {
            error!("tmux mode enabled but tmux is not installed");
            anyhow::bail!("tmux mode enabled but tmux is not installed; install tmux or run without --tmux-enabled");
        }
        info!("tmux mode enabled, sessions will persist across disconnections");
    }

    let pool = Arc::new(SessionPool::new(config.pool_config()));

    let sweepers = CancellationToken::new();
    tokio::spawn(Arc::clone(&pool).run_cleanup(sweepers.child_token()));
    if config.tmux_enabled {
        tokio::spawn(Arc::clone(&pool).run_tmux_cleanup(sweepers.child_token()));
    }

    let auth = config
        .auth
        .as_ref()
        .map(|creds| BasicAuth::new(creds.username.clone(), creds.password.clone()));
    if auth.is_some() {
        info!("Basic auth enabled");
    }

    let state = Arc::new(AppState {
        pool: Arc::clone(&pool),
        auth,
    });
    let app = api::router(state);

    let addr = config.listen_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        addr = %addr,
        command = %config.command,
        args = ?config.args,
        workdir = %config.workdir,
        tmux_enabled = config.tmux_enabled,
        session_timeout = ?config.session_timeout,
        "Starting ptygate"
    );

    let drain = CancellationToken::new();
    let server = {
        let drain = drain.clone();
        axum::serve(listener, app).with_graceful_shutdown(async move { drain.cancelled().await })
    };
    let mut server_task = tokio::spawn(server.into_future());

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut server_task => {
            sweepers.cancel();
            pool.close_all().await;
            match result {
                Ok(Ok(())) => anyhow::bail!("server exited unexpectedly"),
                Ok(Err(err)) => return Err(err.into()),
                Err(err) => return Err(err.into()),
            }
        }
    }

    info!("Shutting down");

    // Stop the sweepers, destroy the sessions (tmux included), then drain
    // the HTTP server with a bounded deadline.
    sweepers.cancel();
    pool.close_all().await;
    drain.cancel();

    match tokio::time::timeout(Duration::from_secs(5), server_task).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(err))) => error!(error = %err, "Shutdown error"),
        Ok(Err(err)) => error!(error = %err, "Server task failed"),
        Err(_) => warn!("Shutdown drain deadline exceeded"),
    }

    info!("Goodbye");
    Ok(())
}

/// Resolves when SIGINT or SIGTERM arrives.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!(error = %err, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
