//! # ptygate
//!
//! A multiplexing pseudoterminal (PTY) gateway. It exposes HTTP + WebSocket
//! endpoints that let browser clients create, attach to, resize, and destroy
//! interactive PTY sessions running shell commands on the host.
//!
//! Sessions survive client disconnects: the PTY process keeps running after
//! every client drops and can be re-attached within a configurable grace
//! period. With `--tmux-enabled`, the child lives inside a detached tmux
//! session, so the process survives even the gateway's own attachment.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                        HTTP surface                        │
//! │   POST /pty   GET/PUT/DELETE /pty/{id}   /takeover         │
//! │   GET /pty/{id}/connect  (WebSocket upgrade)               │
//! ├────────────────────────────────────────────────────────────┤
//! │                        SessionPool                         │
//! │   registry · factory · idle reaper · tmux orphan reaper    │
//! ├────────────────────────────────────────────────────────────┤
//! │  Session: client map · reader task · broadcast pump        │
//! ├────────────────────────────────────────────────────────────┤
//! │  PtyBackend: direct child  |  tmux attachment              │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`config`]: startup configuration and validation
//! - [`auth`]: HTTP Basic authentication
//! - [`session`]: PTY backends, sessions, and the session pool
//! - [`api`]: axum router, JSON handlers, WebSocket client loop

pub mod api;
pub mod auth;
pub mod config;
pub mod session;

pub use api::AppState;
pub use auth::BasicAuth;
pub use config::{Config, ConfigError};
pub use session::pool::{PoolConfig, SessionPool};
pub use session::pty::{PtyBackend, PtyError};
pub use session::session::{ClientConnection, Session, SessionError};
pub use session::tmux::TmuxError;
