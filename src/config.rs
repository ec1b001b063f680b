//! Gateway configuration.
//!
//! Configuration comes from command-line flags (see `main.rs`); this module
//! holds the assembled [`Config`] and its validation rules.

use std::time::Duration;

use thiserror::Error;

use crate::session::pool::PoolConfig;

/// Configuration validation errors.
#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("session-timeout must be greater than zero")]
    ZeroSessionTimeout,

    #[error("cleanup-interval must be greater than zero")]
    ZeroCleanupInterval,

    #[error("auth-user and auth-pass must be supplied together")]
    IncompleteAuth,
}

/// Basic-auth credential pair.
#[derive(Debug, Clone)]
pub struct AuthCredentials {
    pub username: String,
    pub password: String,
}

/// Fully resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Host to bind the HTTP listener to.
    pub host: String,

    /// Port to listen on.
    pub port: u16,

    /// How long a session may sit with zero clients before the idle reaper
    /// destroys it.
    pub session_timeout: Duration,

    /// Period of the idle reaper.
    pub cleanup_interval: Duration,

    /// Default command for new sessions.
    pub command: String,

    /// Default arguments for new sessions.
    pub args: Vec<String>,

    /// Default working directory for new sessions. Empty means the invoking
    /// user's home directory.
    pub workdir: String,

    /// Basic-auth credentials; `None` disables authentication.
    pub auth: Option<AuthCredentials>,

    /// Spawn sessions inside tmux so the process outlives the attachment.
    pub tmux_enabled: bool,

    /// Max time a tmux-backed session may go without attached clients before
    /// the orphan reaper kills it.
    pub max_inactive: Duration,

    /// Period of the orphan reaper (clamped to a 10-minute minimum at the
    /// use site).
    pub tmux_cleanup_interval: Duration,
}

impl Config {
    /// Validate the configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.session_timeout.is_zero() {
            return Err(ConfigError::ZeroSessionTimeout);
        }
        if self.cleanup_interval.is_zero() {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        if let Some(auth) = &self.auth {
            if auth.username.is_empty() || auth.password.is_empty() {
                return Err(ConfigError::IncompleteAuth);
            }
        }
        Ok(())
    }

    /// The socket address string to bind.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The slice of this configuration the session pool cares about.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            session_timeout: self.session_timeout,
            cleanup_interval: self.cleanup_interval,
            default_command: self.command.clone(),
            default_args: self.args.clone(),
            default_workdir: self.workdir.clone(),
            tmux_enabled: self.tmux_enabled,
            max_inactive: self.max_inactive,
            tmux_cleanup_interval: self.tmux_cleanup_interval,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            session_timeout: Duration::from_secs(30),
            cleanup_interval: Duration::from_secs(10),
            command: default_command(),
            args: Vec::new(),
            workdir: String::new(),
            auth: None,
            tmux_enabled: false,
            max_inactive: Duration::from_secs(3600),
            tmux_cleanup_interval: Duration::from_secs(600),
        }
    }
}

/// Returns the default command for new sessions: `$SHELL`, falling back to
/// `/bin/bash`.
pub fn default_command() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_session_timeout_rejected() {
        let config = Config {
            session_timeout: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroSessionTimeout));
    }

    #[test]
    fn zero_cleanup_interval_rejected() {
        let config = Config {
            cleanup_interval: Duration::ZERO,
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::ZeroCleanupInterval));
    }

    #[test]
    fn empty_auth_half_rejected() {
        let config = Config {
            auth: Some(AuthCredentials {
                username: "admin".to_string(),
                password: String::new(),
            }),
            ..Config::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::IncompleteAuth));
    }

    #[test]
    fn listen_addr_formats_host_and_port() {
        let config = Config {
            host: "0.0.0.0".to_string(),
            port: 8080,
            ..Config::default()
        };
        assert_eq!(config.listen_addr(), "0.0.0.0:8080");
    }
}
