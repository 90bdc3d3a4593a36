//! Session lifecycle.
//!
//! A session outlives its connection when the client asks for resumption.
//! On such a disconnect the session gets a deadline of `now + ttl`; a
//! background sweep clears it once that passes, publishing a
//! [`EventKind::SessionExpired`](crate::event::EventKind) event so other
//! components can drop state tied to it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::event::{Event, EventBus};

/// How often the sweeper looks for expired sessions.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

/// A unique session identifier.
///
/// Ids are time-ordered: later sessions always compare greater.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl From<u64> for SessionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generates monotonically increasing session ids.
///
/// The upper bits carry the wall-clock millisecond, the lower 12 bits a
/// sequence within it.
#[derive(Debug, Default)]
pub struct SessionIdGenerator {
    last: AtomicU64,
}

impl SessionIdGenerator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> SessionId {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let floor = millis << 12;

        let mut last = self.last.load(Ordering::Relaxed);
        loop {
            let next = floor.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return SessionId(next),
                Err(actual) => last = actual,
            }
        }
    }
}

/// Session state for one client identity.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: SessionId,
    pub client_id: String,
    pub ttl: Duration,
    /// Deadline after which the session is cleared. `None` while the
    /// owning client is connected.
    pub expires_at: Option<Instant>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, client_id: impl Into<String>, ttl: Duration) -> Self {
        Self {
            id,
            client_id: client_id.into(),
            ttl,
            expires_at: None,
        }
    }

    /// Whether the session is waiting for its owner to come back.
    #[must_use]
    pub fn is_pending_expiry(&self) -> bool {
        self.expires_at.is_some()
    }

    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| now >= deadline)
    }
}

#[derive(Default)]
struct SessionTable {
    by_client: HashMap<String, Session>,
    by_id: HashMap<SessionId, String>,
}

impl SessionTable {
    fn insert(&mut self, session: Session) {
        self.by_id.insert(session.id, session.client_id.clone());
        self.by_client.insert(session.client_id.clone(), session);
    }

    fn remove(&mut self, client_id: &str) -> Option<Session> {
        let session = self.by_client.remove(client_id)?;
        self.by_id.remove(&session.id);
        Some(session)
    }

    /// The session owned by `client_id`, if its id is `session_id`.
    fn owned_mut(&mut self, client_id: &str, session_id: SessionId) -> Option<&mut Session> {
        match self.by_client.get_mut(client_id) {
            Some(session) if session.id == session_id => Some(session),
            Some(session) => {
                warn!(
                    client = %client_id,
                    expected = %session_id,
                    current = %session.id,
                    "Session id mismatch, ignoring"
                );
                None
            }
            None => {
                warn!(client = %client_id, session = %session_id, "No session for client, ignoring");
                None
            }
        }
    }
}

/// Owns every live session.
pub struct SessionManager {
    table: Mutex<SessionTable>,
    ids: SessionIdGenerator,
    events: Arc<EventBus>,
}

impl SessionManager {
    /// Create a manager that reports cleared sessions on `events`.
    #[must_use]
    pub fn new(events: Arc<EventBus>) -> Self {
        Self {
            table: Mutex::new(SessionTable::default()),
            ids: SessionIdGenerator::new(),
            events,
        }
    }

    /// Find or create the session for `client_id`.
    ///
    /// An existing session is resumed only when `resume` is set and its
    /// deadline has not passed; otherwise it is cleared and replaced.
    /// Returns the session id and whether it was resumed.
    pub fn create_or_resume(
        &self,
        client_id: &str,
        ttl: Duration,
        resume: bool,
    ) -> (SessionId, bool) {
        let now = Instant::now();
        let (id, replaced) = {
            let mut table = self.table.lock();
            if let Some(existing) = table.by_client.get_mut(client_id) {
                if resume && !existing.is_expired(now) {
                    existing.ttl = ttl;
                    existing.expires_at = None;
                    debug!(client = %client_id, session = %existing.id, "Session resumed");
                    return (existing.id, true);
                }
            }

            let replaced = table.remove(client_id);
            let session = Session::new(self.ids.next_id(), client_id, ttl);
            let id = session.id;
            table.insert(session);
            (id, replaced)
        };

        if let Some(old) = replaced {
            debug!(client = %client_id, session = %old.id, "Previous session discarded");
            self.events.publish(Event::session_expired(old));
        }
        debug!(client = %client_id, session = %id, "Session created");
        (id, false)
    }

    /// Start the expiry countdown after a resumable disconnect.
    ///
    /// Ignored (returns `false`) if `session_id` is not the client's
    /// current session.
    pub fn mark_inactive(&self, client_id: &str, session_id: SessionId) -> bool {
        let mut table = self.table.lock();
        let Some(session) = table.owned_mut(client_id, session_id) else {
            return false;
        };
        let deadline = Instant::now() + session.ttl;
        session.expires_at = Some(deadline);
        debug!(client = %client_id, session = %session_id, ttl = ?session.ttl, "Session inactive");
        true
    }

    /// Remove a session and publish its expiry.
    ///
    /// Ignored (returns `false`) if `session_id` is not the client's
    /// current session.
    pub fn clear(&self, client_id: &str, session_id: SessionId) -> bool {
        let session = {
            let mut table = self.table.lock();
            if table.owned_mut(client_id, session_id).is_none() {
                return false;
            }
            table.remove(client_id)
        };

        match session {
            Some(session) => {
                debug!(client = %client_id, session = %session_id, "Session cleared");
                self.events.publish(Event::session_expired(session));
                true
            }
            None => false,
        }
    }

    /// Clear every session whose deadline has passed.
    ///
    /// Returns the number of sessions cleared.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let expired: Vec<Session> = {
            let mut table = self.table.lock();
            let clients: Vec<String> = table
                .by_client
                .values()
                .filter(|s| s.is_expired(now))
                .map(|s| s.client_id.clone())
                .collect();
            clients
                .iter()
                .filter_map(|client_id| table.remove(client_id))
                .collect()
        };

        let count = expired.len();
        for session in expired {
            info!(client = %session.client_id, session = %session.id, "Session expired");
            self.events.publish(Event::session_expired(session));
        }
        count
    }

    /// Resolve session ids to sessions, skipping unknown ids.
    #[must_use]
    pub fn find_by_ids(&self, ids: &[SessionId]) -> Vec<Session> {
        let table = self.table.lock();
        ids.iter()
            .filter_map(|id| table.by_id.get(id))
            .filter_map(|client_id| table.by_client.get(client_id))
            .cloned()
            .collect()
    }

    /// Whether `id` is a live session.
    #[must_use]
    pub fn contains(&self, id: SessionId) -> bool {
        self.table.lock().by_id.contains_key(&id)
    }

    /// The session owned by `client_id`.
    #[must_use]
    pub fn get(&self, client_id: &str) -> Option<Session> {
        self.table.lock().by_client.get(client_id).cloned()
    }

    /// Number of live sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.lock().by_client.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run [`sweep`](Self::sweep) every [`SWEEP_INTERVAL`] until `shutdown`
    /// changes or its sender is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        manager.sweep();
                    }
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Session sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventHandler, EventKind, EventPayload};

    const TTL: Duration = Duration::from_secs(10);

    /// A manager plus the client ids of every expiry it published.
    fn manager() -> (Arc<EventBus>, SessionManager, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let expired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&expired);
        let handler: Arc<dyn EventHandler> = Arc::new(move |event: &Event| match &event.payload {
            EventPayload::SessionExpired(session) => sink.lock().push(session.client_id.clone()),
        });
        bus.subscribe(EventKind::SessionExpired, handler);
        (Arc::clone(&bus), SessionManager::new(bus), expired)
    }

    #[test]
    fn test_session_ids_increase() {
        let ids = SessionIdGenerator::new();
        let mut last = ids.next_id();
        for _ in 0..10_000 {
            let next = ids.next_id();
            assert!(next > last);
            last = next;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_new_session() {
        let (_bus, sessions, _) = manager();

        let (id, resumed) = sessions.create_or_resume("c1", TTL, true);
        assert!(!resumed);

        let session = sessions.get("c1").unwrap();
        assert_eq!(session.id, id);
        assert!(!session.is_pending_expiry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_before_deadline() {
        let (_bus, sessions, _) = manager();
        let (id, _) = sessions.create_or_resume("c1", TTL, true);

        assert!(sessions.mark_inactive("c1", id));
        assert!(sessions.get("c1").unwrap().is_pending_expiry());

        tokio::time::advance(Duration::from_secs(5)).await;
        let (resumed_id, resumed) = sessions.create_or_resume("c1", TTL, true);
        assert!(resumed);
        assert_eq!(resumed_id, id);
        assert!(!sessions.get("c1").unwrap().is_pending_expiry());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_after_deadline_starts_fresh() {
        let (bus, sessions, expired) = manager();
        let (id, _) = sessions.create_or_resume("c1", TTL, true);
        sessions.mark_inactive("c1", id);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        let (new_id, resumed) = sessions.create_or_resume("c1", TTL, true);
        assert!(!resumed);
        assert_ne!(new_id, id);

        bus.shutdown().await;
        assert_eq!(*expired.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clean_session_replaces_existing() {
        let (bus, sessions, expired) = manager();
        let (id, _) = sessions.create_or_resume("c1", TTL, false);

        let (new_id, resumed) = sessions.create_or_resume("c1", TTL, false);
        assert!(!resumed);
        assert!(new_id > id);
        assert!(sessions.find_by_ids(&[id]).is_empty());
        assert_eq!(sessions.len(), 1);

        bus.shutdown().await;
        assert_eq!(expired.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mismatched_id_is_ignored() {
        let (bus, sessions, expired) = manager();
        let (id, _) = sessions.create_or_resume("c1", TTL, true);
        let stale = SessionId::from(id.as_u64() - 1);

        assert!(!sessions.mark_inactive("c1", stale));
        assert!(!sessions.clear("c1", stale));
        assert!(!sessions.clear("nobody", id));
        assert!(!sessions.get("c1").unwrap().is_pending_expiry());

        bus.shutdown().await;
        assert!(expired.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_removes_session() {
        let (bus, sessions, expired) = manager();
        let (id, _) = sessions.create_or_resume("c1", TTL, false);

        assert!(sessions.contains(id));
        assert!(sessions.clear("c1", id));
        assert!(!sessions.contains(id));
        assert!(sessions.get("c1").is_none());
        assert!(sessions.find_by_ids(&[id]).is_empty());
        assert!(sessions.is_empty());
        assert!(!sessions.clear("c1", id));

        bus.shutdown().await;
        assert_eq!(*expired.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_clears_only_expired() {
        let (bus, sessions, expired) = manager();
        let (a, _) = sessions.create_or_resume("c1", TTL, true);
        let (b, _) = sessions.create_or_resume("c2", TTL, true);
        let (c, _) = sessions.create_or_resume("c3", Duration::from_secs(60), true);
        sessions.mark_inactive("c1", a);
        sessions.mark_inactive("c3", c);

        assert_eq!(sessions.sweep(), 0);
        tokio::time::advance(TTL).await;
        assert_eq!(sessions.sweep(), 1);

        let live: Vec<_> = sessions
            .find_by_ids(&[a, b, c])
            .into_iter()
            .map(|s| s.client_id)
            .collect();
        assert_eq!(live, vec!["c2".to_string(), "c3".to_string()]);

        bus.shutdown().await;
        assert_eq!(*expired.lock(), vec!["c1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task() {
        let (_bus, sessions, _) = manager();
        let sessions = Arc::new(sessions);
        let (stop, stopped) = watch::channel(false);
        let sweeper = sessions.spawn_sweeper(stopped);

        let (id, _) = sessions.create_or_resume("c1", Duration::from_secs(2), true);
        sessions.mark_inactive("c1", id);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert!(sessions.get("c1").is_none());

        stop.send(true).unwrap();
        sweeper.await.unwrap();
    }
}
