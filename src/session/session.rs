//! PTY sessions.
//!
//! A [`Session`] is one logical PTY exposed to clients. It owns one
//! [`PtyBackend`] at a time, the set of attached clients, a bounded
//! broadcast queue between a PTY reader task and a pump task, and the
//! lifecycle flags. Many WebSocket clients may attach to one session and
//! all receive the same output stream.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Instant;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::pty::{PtyBackend, PtyError};

/// Buffer size for reading from the PTY.
const READ_BUFFER_SIZE: usize = 4096;

/// Capacity of the output broadcast queue, in chunks.
const BROADCAST_CAPACITY: usize = 256;

/// WebSocket close code sent to evicted clients on takeover.
pub const TAKEOVER_CLOSE_CODE: u16 = 4001;

/// Close reason sent to evicted clients on takeover.
pub const TAKEOVER_CLOSE_REASON: &str = "session taken over";

/// Errors that can occur during session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session has been closed.
    #[error("session {0} is closed")]
    Closed(String),

    /// The operation requires a tmux-backed session.
    #[error("session {0} is not backed by a multiplexer")]
    NotMultiplexed(String),

    /// A backend operation failed.
    #[error(transparent)]
    Pty(#[from] PtyError),
}

/// Handle identifying one attached client socket within a session.
pub type ClientKey = u64;

/// The session side of one attached WebSocket.
///
/// The HTTP layer implements this over the socket's sink half; tests
/// implement it over channels. Sends that fail mark the client for closure;
/// the client's own read loop performs the removal.
#[async_trait]
pub trait ClientConnection: Send + Sync {
    /// Sends raw PTY output as one binary frame.
    async fn send_binary(&self, data: &[u8]) -> std::io::Result<()>;

    /// Sends a close frame with an application code and reason. Best-effort.
    async fn send_close(&self, code: u16, reason: &str);

    /// Shuts the connection down. Best-effort, idempotent.
    async fn shutdown(&self);
}

struct ClientEntry {
    client_id: String,
    conn: Arc<dyn ClientConnection>,
}

/// Client bookkeeping and window geometry, guarded by one lock.
struct Registry {
    clients: HashMap<ClientKey, ClientEntry>,
    /// Client id of the most recently added client, empty if none.
    connected_client_id: String,
    /// Set iff the client map is empty; records when it emptied.
    disconnected_at: Option<Instant>,
    last_activity_at: Instant,
    cols: u16,
    rows: u16,
}

/// The current backend installation. Replaced wholesale on re-attach.
struct BackendSlot {
    backend: Arc<PtyBackend>,
    /// Termination latch for this installation's reader and pump.
    token: CancellationToken,
    /// Generation counter; a stale reader whose generation no longer
    /// matches must not close the session.
    epoch: u64,
}

/// One logical PTY session.
pub struct Session {
    id: String,
    multiplexer_name: Option<String>,
    created_at: Instant,
    closed: AtomicBool,
    registry: RwLock<Registry>,
    backend: RwLock<BackendSlot>,
}

impl Session {
    /// Creates a session around a freshly spawned backend and starts the
    /// reader and pump tasks. Must be called within a tokio runtime.
    pub fn new(
        id: String,
        backend: PtyBackend,
        cols: u16,
        rows: u16,
    ) -> Result<Arc<Self>, SessionError> {
        let multiplexer_name = backend.multiplexer_name().map(str::to_string);
        let backend = Arc::new(backend);
        let token = CancellationToken::new();
        let now = Instant::now();

        let session = Arc::new(Self {
            id,
            multiplexer_name,
            created_at: now,
            closed: AtomicBool::new(false),
            registry: RwLock::new(Registry {
                clients: HashMap::new(),
                connected_client_id: String::new(),
                disconnected_at: Some(now),
                last_activity_at: now,
                cols,
                rows,
            }),
            backend: RwLock::new(BackendSlot {
                backend: Arc::clone(&backend),
                token: token.clone(),
                epoch: 0,
            }),
        });

        session.spawn_tasks(backend, token, 0)?;
        Ok(session)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The tmux session name backing this session, if any.
    pub fn multiplexer_name(&self) -> Option<String> {
        self.multiplexer_name.clone()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Registers a client. The new client becomes the connected client.
    pub async fn add_client(
        &self,
        key: ClientKey,
        client_id: String,
        conn: Arc<dyn ClientConnection>,
    ) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }

        let mut registry = self.registry.write().await;
        registry.connected_client_id = client_id.clone();
        registry.clients.insert(key, ClientEntry { client_id, conn });
        registry.disconnected_at = None;
        registry.last_activity_at = Instant::now();
        Ok(())
    }

    /// Removes a client. When the last client leaves, the disconnect
    /// timestamp is stamped so the idle reaper can start its clock.
    /// Idempotent for unknown keys.
    pub async fn remove_client(&self, key: ClientKey) {
        let mut registry = self.registry.write().await;
        if let Some(entry) = registry.clients.remove(&key) {
            if registry.connected_client_id == entry.client_id {
                registry.connected_client_id.clear();
            }
        }
        if registry.clients.is_empty() && registry.disconnected_at.is_none() {
            registry.disconnected_at = Some(Instant::now());
        }
    }

    pub async fn client_count(&self) -> usize {
        self.registry.read().await.clients.len()
    }

    /// Whether at least one client is attached.
    pub async fn is_occupied(&self) -> bool {
        !self.registry.read().await.connected_client_id.is_empty()
    }

    pub async fn connected_client_id(&self) -> String {
        self.registry.read().await.connected_client_id.clone()
    }

    pub async fn size(&self) -> (u16, u16) {
        let registry = self.registry.read().await;
        (registry.cols, registry.rows)
    }

    pub async fn disconnected_at(&self) -> Option<Instant> {
        self.registry.read().await.disconnected_at
    }

    pub async fn last_activity(&self) -> Instant {
        self.registry.read().await.last_activity_at
    }

    /// Writes client input to the PTY.
    ///
    /// Activity is tracked per attachment, not per byte, so this does not
    /// refresh the activity timestamp.
    pub async fn write(&self, data: &[u8]) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        let backend = Arc::clone(&self.backend.read().await.backend);
        backend.write(data)?;
        Ok(())
    }

    /// Resizes the session window and the backend PTY.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed(self.id.clone()));
        }
        {
            let mut registry = self.registry.write().await;
            registry.cols = cols;
            registry.rows = rows;
        }
        let backend = Arc::clone(&self.backend.read().await.backend);
        backend.resize(cols, rows)?;
        Ok(())
    }

    /// Evicts every attached client with the given close frame.
    ///
    /// Returns the number of clients that were attached when the client map
    /// was locked. Afterwards the map is empty, no client is connected, and
    /// the disconnect clock is running.
    pub async fn disconnect_all(&self, code: u16, reason: &str) -> usize {
        let drained: Vec<ClientEntry> = {
            let mut registry = self.registry.write().await;
            let drained = registry.clients.drain().map(|(_, entry)| entry).collect();
            registry.connected_client_id.clear();
            if registry.disconnected_at.is_none() {
                registry.disconnected_at = Some(Instant::now());
            }
            drained
        };

        let count = drained.len();
        for entry in drained {
            entry.conn.send_close(code, reason).await;
            entry.conn.shutdown().await;
        }
        count
    }

    /// Closes the session: stops the background tasks, disconnects every
    /// client, and closes the backend attachment. A tmux-backed process
    /// keeps running. Set-once; repeated calls are no-ops.
    pub async fn close(&self) {
        self.close_inner(false).await;
    }

    /// As [`Self::close`], but also destroys the backing tmux session.
    /// Used for explicit delete, reaper timeout, and server shutdown.
    pub async fn close_and_destroy(&self) {
        self.close_inner(true).await;
    }

    async fn close_inner(&self, destroy: bool) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let backend = {
            let slot = self.backend.read().await;
            slot.token.cancel();
            Arc::clone(&slot.backend)
        };

        let drained: Vec<ClientEntry> = {
            let mut registry = self.registry.write().await;
            let drained = registry.clients.drain().map(|(_, entry)| entry).collect();
            registry.connected_client_id.clear();
            if registry.disconnected_at.is_none() {
                registry.disconnected_at = Some(Instant::now());
            }
            drained
        };
        for entry in drained {
            entry.conn.send_close(1000, "session closed").await;
            entry.conn.shutdown().await;
        }

        if destroy {
            backend.close_and_destroy();
        } else {
            backend.close_attachment();
        }

        tracing::info!(session_id = %self.id, destroy, "Session closed");
    }

    /// Swaps in a new backend after a tmux re-attach.
    ///
    /// Only valid on an open, multiplexer-backed session. The old
    /// attachment is torn down, the termination latch is re-armed, and
    /// fresh reader and pump tasks are started. Holding the backend write
    /// lock for the whole swap serializes this against writes, resizes,
    /// and closes.
    pub async fn replace_backend(
        self: &Arc<Self>,
        new_backend: PtyBackend,
    ) -> Result<(), SessionError> {
        if self.multiplexer_name.is_none() {
            return Err(SessionError::NotMultiplexed(self.id.clone()));
        }

        let (backend, token, epoch) = {
            let mut slot = self.backend.write().await;
            if self.is_closed() {
                return Err(SessionError::Closed(self.id.clone()));
            }

            slot.token.cancel();
            slot.backend.close_attachment();

            slot.epoch += 1;
            slot.backend = Arc::new(new_backend);
            slot.token = CancellationToken::new();
            (Arc::clone(&slot.backend), slot.token.clone(), slot.epoch)
        };

        self.spawn_tasks(backend, token, epoch)?;
        tracing::info!(session_id = %self.id, "Backend replaced");
        Ok(())
    }

    fn spawn_tasks(
        self: &Arc<Self>,
        backend: Arc<PtyBackend>,
        token: CancellationToken,
        epoch: u64,
    ) -> Result<(), SessionError> {
        let reader = backend.reader()?;
        let (tx, rx) = mpsc::channel::<Vec<u8>>(BROADCAST_CAPACITY);
        self.spawn_reader(reader, tx, token.clone(), epoch);
        self.spawn_pump(rx, token);
        Ok(())
    }

    /// Reader task: blocking PTY reads, fanned into the broadcast queue.
    ///
    /// The offer is non-blocking: a full queue drops the chunk rather than
    /// stalling the PTY behind a slow client. Any read error or EOF closes
    /// the session, provided this reader's backend is still the current one.
    fn spawn_reader(
        self: &Arc<Self>,
        reader: Box<dyn Read + Send>,
        tx: mpsc::Sender<Vec<u8>>,
        token: CancellationToken,
        epoch: u64,
    ) {
        let session = Arc::clone(self);
        let reader = Arc::new(StdMutex::new(reader));

        tokio::spawn(async move {
            loop {
                if token.is_cancelled() {
                    tracing::debug!(session_id = %session.id, "Reader stopping: cancelled");
                    break;
                }

                let reader = Arc::clone(&reader);
                let result = tokio::task::spawn_blocking(move || {
                    let mut buf = vec![0u8; READ_BUFFER_SIZE];
                    let mut reader = reader.lock().unwrap();
                    match reader.read(&mut buf) {
                        Ok(0) => Ok(None),
                        Ok(n) => {
                            buf.truncate(n);
                            Ok(Some(buf))
                        }
                        Err(e) => Err(e),
                    }
                })
                .await;

                match result {
                    Ok(Ok(Some(chunk))) => match tx.try_send(chunk) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            tracing::trace!(
                                session_id = %session.id,
                                "Broadcast queue full, dropping chunk"
                            );
                        }
                        Err(TrySendError::Closed(_)) => break,
                    },
                    Ok(Ok(None)) => {
                        tracing::info!(session_id = %session.id, "PTY EOF");
                        session.close_for_epoch(epoch).await;
                        break;
                    }
                    Ok(Err(err)) => {
                        if !token.is_cancelled() {
                            tracing::debug!(
                                session_id = %session.id,
                                error = %err,
                                "PTY read error"
                            );
                        }
                        session.close_for_epoch(epoch).await;
                        break;
                    }
                    Err(err) => {
                        tracing::error!(
                            session_id = %session.id,
                            error = %err,
                            "PTY read task panicked"
                        );
                        session.close_for_epoch(epoch).await;
                        break;
                    }
                }
            }
        });
    }

    /// Pump task: drains the broadcast queue and fans each chunk out to
    /// every attached client.
    fn spawn_pump(self: &Arc<Self>, mut rx: mpsc::Receiver<Vec<u8>>, token: CancellationToken) {
        let session = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    chunk = rx.recv() => match chunk {
                        Some(chunk) => session.broadcast(&chunk).await,
                        None => break,
                    },
                }
            }
            tracing::debug!(session_id = %session.id, "Pump stopped");
        });
    }

    /// Sends one chunk to every attached client.
    ///
    /// The client set is snapshotted under the read lock and released
    /// before any socket I/O. Clients whose write fails are shut down after
    /// the iteration; their own read loops remove them from the map.
    async fn broadcast(&self, chunk: &[u8]) {
        let targets: Vec<(ClientKey, Arc<dyn ClientConnection>)> = {
            let registry = self.registry.read().await;
            registry
                .clients
                .iter()
                .map(|(key, entry)| (*key, Arc::clone(&entry.conn)))
                .collect()
        };

        let mut failed = Vec::new();
        for (key, conn) in targets {
            if conn.send_binary(chunk).await.is_err() {
                failed.push((key, conn));
            }
        }

        for (key, conn) in failed {
            tracing::debug!(session_id = %self.id, client_key = key, "Client write failed");
            conn.shutdown().await;
        }
    }

    /// Closes the session on behalf of a reader task, unless the backend
    /// it was reading from has since been replaced.
    async fn close_for_epoch(&self, epoch: u64) {
        {
            let slot = self.backend.read().await;
            if slot.epoch != epoch {
                tracing::debug!(
                    session_id = %self.id,
                    "Stale reader exit ignored: backend was replaced"
                );
                return;
            }
        }
        self.close().await;
    }
}
