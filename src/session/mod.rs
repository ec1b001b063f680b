//! PTY session management: backends, sessions, and the pool.

pub mod pool;
pub mod pty;
pub mod session;
pub mod tmux;

pub use pool::{PoolConfig, PoolError, SessionPool};
pub use pty::{PtyBackend, PtyError};
pub use session::{ClientConnection, Session, SessionError};
pub use tmux::TmuxError;
