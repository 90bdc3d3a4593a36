//! Connected clients.
//!
//! A [`Client`] is created once the handshake succeeds and lives until it
//! is closed by the peer, a protocol error, a session takeover or the
//! keepalive watchdog. Closing settles its session (inactive or cleared,
//! depending on the clean-session flag) and drops it from the
//! [`ClientRegistry`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::auth::Authorizer;
use crate::session::{SessionId, SessionManager};

/// Errors from a client's outbound link.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Link closed")]
    Closed,

    #[error("Outbound queue full")]
    Full,

    #[error("I/O error: {0}")]
    Io(String),
}

/// The transport side of a client: where encoded frames go.
pub trait ClientLink: Send + Sync {
    /// Queue an encoded frame. Must not block.
    fn send(&self, frame: Bytes) -> Result<(), LinkError>;

    /// Close the underlying connection.
    fn close(&self) -> Result<(), LinkError>;
}

/// Client connection status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    Connecting,
    Connected,
    Disconnected,
    /// Closing the link failed.
    UnknownError,
}

impl ClientStatus {
    #[must_use]
    pub fn is_closed(self) -> bool {
        matches!(self, ClientStatus::Disconnected | ClientStatus::UnknownError)
    }
}

/// Identity and negotiated parameters of a client.
#[derive(Debug, Clone)]
pub struct ClientInfo {
    pub id: String,
    pub session_id: SessionId,
    pub clean_session: bool,
    /// Zero disables the keepalive watchdog.
    pub keepalive: Duration,
}

/// A connected client.
pub struct Client {
    info: ClientInfo,
    connected_at: Instant,
    last_received: Mutex<Instant>,
    status: Mutex<ClientStatus>,
    status_tx: watch::Sender<ClientStatus>,
    touched: Notify,
    link: Arc<dyn ClientLink>,
    sessions: Arc<SessionManager>,
    clients: ClientRegistry,
    watchdog: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("info", &self.info)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Client {
    /// Create a client in the `Connecting` state.
    #[must_use]
    pub fn new(
        info: ClientInfo,
        link: Arc<dyn ClientLink>,
        sessions: Arc<SessionManager>,
        clients: ClientRegistry,
    ) -> Arc<Self> {
        let now = Instant::now();
        let (status_tx, _) = watch::channel(ClientStatus::Connecting);
        Arc::new(Self {
            info,
            connected_at: now,
            last_received: Mutex::new(now),
            status: Mutex::new(ClientStatus::Connecting),
            status_tx,
            touched: Notify::new(),
            link,
            sessions,
            clients,
            watchdog: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.info.id
    }

    #[must_use]
    pub fn session_id(&self) -> SessionId {
        self.info.session_id
    }

    #[must_use]
    pub fn clean_session(&self) -> bool {
        self.info.clean_session
    }

    #[must_use]
    pub fn keepalive(&self) -> Duration {
        self.info.keepalive
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// When the last message from this client arrived.
    #[must_use]
    pub fn last_received(&self) -> Instant {
        *self.last_received.lock()
    }

    #[must_use]
    pub fn status(&self) -> ClientStatus {
        *self.status.lock()
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.status() == ClientStatus::Connected
    }

    fn set_status(&self, status: &mut ClientStatus, next: ClientStatus) {
        *status = next;
        self.status_tx.send_replace(next);
    }

    /// Move to `Connected` and start the keepalive watchdog.
    ///
    /// Returns `false` if the client was not `Connecting`.
    pub fn activate(self: &Arc<Self>) -> bool {
        {
            let mut status = self.status.lock();
            if *status != ClientStatus::Connecting {
                return false;
            }
            *self.last_received.lock() = Instant::now();
            self.set_status(&mut status, ClientStatus::Connected);
        }
        if !self.info.keepalive.is_zero() {
            let watchdog = self.spawn_watchdog();
            *self.watchdog.lock() = Some(watchdog);
        }
        debug!(client = %self.info.id, session = %self.info.session_id, "Client connected");
        true
    }

    /// Record that a message arrived.
    pub fn touch(&self) {
        if self.info.keepalive.is_zero() {
            return;
        }
        *self.last_received.lock() = Instant::now();
        self.touched.notify_one();
    }

    /// Queue a frame for delivery to this client.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Closed`] if the client is not connected, or
    /// whatever the link reports.
    pub fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if !self.is_connected() {
            return Err(LinkError::Closed);
        }
        self.link.send(frame)
    }

    /// Close the client.
    ///
    /// Settles the session, closes the link and removes the client from
    /// the registry. Returns `false` if it was already closed.
    pub fn close(&self) -> bool {
        {
            let mut status = self.status.lock();
            if status.is_closed() {
                return false;
            }

            if self.info.clean_session {
                self.sessions.clear(&self.info.id, self.info.session_id);
            } else {
                self.sessions
                    .mark_inactive(&self.info.id, self.info.session_id);
            }

            let next = match self.link.close() {
                Ok(()) => ClientStatus::Disconnected,
                Err(e) => {
                    error!(client = %self.info.id, error = %e, "Failed to close link");
                    ClientStatus::UnknownError
                }
            };
            self.set_status(&mut status, next);
        }

        self.clients.remove_if_same(self);
        debug!(client = %self.info.id, "Client closed");
        true
    }

    /// Wait until the client is closed.
    pub async fn closed(&self) {
        let mut rx = self.status_tx.subscribe();
        let _ = rx.wait_for(|status| status.is_closed()).await;
    }

    /// Wait for the keepalive watchdog to exit, if one was started.
    pub async fn join_watchdog(&self) {
        let handle = self.watchdog.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    /// Close the client once no message has arrived for 1.5 keepalive
    /// intervals. Each touch pushes the deadline out.
    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let client = Arc::clone(self);
        let mut status_rx = self.status_tx.subscribe();
        let limit = self.info.keepalive * 3 / 2;

        tokio::spawn(async move {
            let deadline = tokio::time::sleep_until(client.last_received() + limit);
            tokio::pin!(deadline);

            loop {
                tokio::select! {
                    () = &mut deadline => {
                        if !client.is_connected() {
                            break;
                        }
                        let last = client.last_received();
                        let idle = last.elapsed();
                        if idle >= limit {
                            info!(client = %client.info.id, idle = ?idle, "Keepalive timeout, closing");
                            client.close();
                            break;
                        }
                        deadline.as_mut().reset(last + limit);
                    }
                    () = client.touched.notified() => {
                        deadline.as_mut().reset(client.last_received() + limit);
                    }
                    changed = status_rx.changed() => {
                        if changed.is_err() || status_rx.borrow().is_closed() {
                            break;
                        }
                    }
                }
            }
            debug!(client = %client.info.id, "Keepalive watchdog stopped");
        })
    }
}

/// Live clients by client id.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    clients: Arc<DashMap<String, Arc<Client>>>,
}

impl ClientRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a client, returning the one it replaced.
    pub fn insert(&self, client: Arc<Client>) -> Option<Arc<Client>> {
        self.clients.insert(client.id().to_string(), client)
    }

    #[must_use]
    pub fn get(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.get(id).map(|c| Arc::clone(c.value()))
    }

    /// Remove `client` only if it is still the registered instance for
    /// its id.
    pub fn remove_if_same(&self, client: &Client) -> bool {
        self.clients
            .remove_if(client.id(), |_, registered| {
                std::ptr::eq(Arc::as_ptr(registered), client)
            })
            .is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Snapshot of all registered clients.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<Client>> {
        self.clients.iter().map(|e| Arc::clone(e.value())).collect()
    }
}

/// A connection's view of what it may do.
///
/// Owned by the connection's processing task. Publish verdicts are cached
/// per topic for the lifetime of the connection.
pub struct Permissions {
    authorizer: Option<Arc<dyn Authorizer>>,
    publish_cache: HashMap<String, bool>,
}

impl Permissions {
    /// `None` grants everything.
    #[must_use]
    pub fn new(authorizer: Option<Arc<dyn Authorizer>>) -> Self {
        Self {
            authorizer,
            publish_cache: HashMap::new(),
        }
    }

    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(None)
    }

    #[must_use]
    pub fn can_subscribe(&self, topic: &str) -> bool {
        match &self.authorizer {
            Some(authorizer) => authorizer.can_subscribe(topic),
            None => true,
        }
    }

    pub fn can_publish(&mut self, topic: &str) -> bool {
        let Some(authorizer) = &self.authorizer else {
            return true;
        };
        if let Some(&verdict) = self.publish_cache.get(topic) {
            return verdict;
        }
        let verdict = authorizer.can_publish(topic);
        self.publish_cache.insert(topic.to_string(), verdict);
        verdict
    }
}
