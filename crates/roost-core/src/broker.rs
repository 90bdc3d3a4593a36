//! The broker: one owner for every registry.
//!
//! A [`Broker`] wires the session manager, subscription registry, client
//! registry and event bus together and exposes the operations a
//! connection handler needs. It knows nothing about the wire format;
//! frames arrive already encoded.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::auth::Authenticator;
use crate::client::{Client, ClientInfo, ClientLink, ClientRegistry, LinkError, Permissions};
use crate::event::{EventBus, EventKind, DEFAULT_QUEUE_CAPACITY};
use crate::registry::SubscriptionRegistry;
use crate::session::{SessionIdGenerator, SessionManager};
use crate::topic::{validate_topic_name, TopicError};

/// Prefix of server-assigned client ids.
pub const ASSIGNED_ID_PREFIX: &str = "roost-";

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a resumable session survives its client's disconnect.
    pub session_ttl: Duration,
    /// Queue capacity of each event handler.
    pub event_queue_capacity: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            session_ttl: Duration::from_secs(7200),
            event_queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

/// Reasons a connection attempt is refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ConnectError {
    /// Empty client id without a clean session.
    #[error("Client identifier rejected")]
    IdentifierRejected,

    #[error("Bad username or password")]
    BadCredentials,

    /// Authentication is required but no credentials were given.
    #[error("Not authorized")]
    NotAuthorized,
}

/// What the handshake collaborator hands the broker.
#[derive(Debug, Clone, Default)]
pub struct ConnectRequest {
    /// Empty asks the broker to assign one.
    pub client_id: String,
    pub clean_session: bool,
    pub keepalive: Duration,
    pub username: Option<String>,
    pub password: Option<Bytes>,
}

/// A successful connection.
pub struct Connected {
    pub client: Arc<Client>,
    /// Owned by the connection's processing task.
    pub permissions: Permissions,
    /// Whether an existing session was resumed.
    pub session_present: bool,
}

/// Broker statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerStats {
    pub clients: usize,
    pub sessions: usize,
    pub topics: usize,
}

/// An embeddable MQTT broker core.
pub struct Broker {
    config: BrokerConfig,
    events: Arc<EventBus>,
    sessions: Arc<SessionManager>,
    subscriptions: Arc<SubscriptionRegistry>,
    clients: ClientRegistry,
    authenticator: Option<Arc<dyn Authenticator>>,
    client_ids: SessionIdGenerator,
    /// Serializes takeover, session resumption and registration.
    admission: Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Broker {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        let events = Arc::new(EventBus::with_capacity(config.event_queue_capacity));
        let (shutdown, _) = watch::channel(false);
        Self {
            sessions: Arc::new(SessionManager::new(Arc::clone(&events))),
            subscriptions: Arc::new(SubscriptionRegistry::new()),
            clients: ClientRegistry::new(),
            authenticator: None,
            client_ids: SessionIdGenerator::new(),
            admission: Mutex::new(()),
            events,
            shutdown,
            tasks: Mutex::new(Vec::new()),
            config,
        }
    }

    /// Require credentials checked by `authenticator`.
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    /// Hook subscriptions to session expiry and start the sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self) {
        self.events.subscribe(
            EventKind::SessionExpired,
            self.subscriptions.expiry_handler(),
        );
        let sweeper = self.sessions.spawn_sweeper(self.shutdown.subscribe());
        self.tasks.lock().push(sweeper);
        debug!("Broker started");
    }

    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    #[must_use]
    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    #[must_use]
    pub fn subscriptions(&self) -> &Arc<SubscriptionRegistry> {
        &self.subscriptions
    }

    #[must_use]
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        BrokerStats {
            clients: self.clients.len(),
            sessions: self.sessions.len(),
            topics: self.subscriptions.stats().topic_count,
        }
    }

    fn assign_client_id(&self) -> String {
        format!("{ASSIGNED_ID_PREFIX}{:x}", self.client_ids.next_id().as_u64())
    }

    /// Admit a client whose handshake has been parsed.
    ///
    /// An existing connection with the same client id is closed first.
    /// The new client is registered but stays `Connecting`, so it receives
    /// no deliveries until [`Client::activate`] is called once the
    /// acknowledgment has been queued.
    ///
    /// # Errors
    ///
    /// Returns the refusal reason if the client id or credentials are
    /// rejected.
    pub fn connect(
        &self,
        request: ConnectRequest,
        link: Arc<dyn ClientLink>,
    ) -> Result<Connected, ConnectError> {
        let client_id = if request.client_id.is_empty() {
            if !request.clean_session {
                return Err(ConnectError::IdentifierRejected);
            }
            self.assign_client_id()
        } else {
            request.client_id
        };

        let authorizer = match &self.authenticator {
            None => None,
            Some(authenticator) => {
                let Some(username) = request.username.as_deref() else {
                    warn!(client = %client_id, "Connection without credentials refused");
                    return Err(ConnectError::NotAuthorized);
                };
                let password = request.password.as_deref().unwrap_or_default();
                match authenticator.authenticate(username, password) {
                    Some(authorizer) => Some(authorizer),
                    None => {
                        warn!(client = %client_id, username = %username, "Authentication failed");
                        return Err(ConnectError::BadCredentials);
                    }
                }
            }
        };

        let _admission = self.admission.lock();
        if let Some(previous) = self.clients.get(&client_id) {
            info!(client = %client_id, "Client id already connected, closing previous connection");
            previous.close();
        }

        let (session_id, session_present) = self.sessions.create_or_resume(
            &client_id,
            self.config.session_ttl,
            !request.clean_session,
        );

        let client = Client::new(
            ClientInfo {
                id: client_id,
                session_id,
                clean_session: request.clean_session,
                keepalive: request.keepalive,
            },
            link,
            Arc::clone(&self.sessions),
            self.clients.clone(),
        );
        if let Some(replaced) = self.clients.insert(Arc::clone(&client)) {
            if !Arc::ptr_eq(&replaced, &client) && replaced.close() {
                warn!(client = %client.id(), "Closed a client registered outside of connect");
            }
        }

        Ok(Connected {
            client,
            permissions: Permissions::new(authorizer),
            session_present,
        })
    }

    /// Subscribe `client` to `filter` if permitted.
    ///
    /// Returns whether the subscription is granted. Re-subscribing an
    /// existing filter is granted. A client that is no longer connected, or
    /// whose session has been cleared, is refused.
    pub fn subscribe(&self, client: &Client, permissions: &Permissions, filter: &str) -> bool {
        if !client.is_connected() {
            debug!(client = %client.id(), topic = %filter, "Subscribe from closed client ignored");
            return false;
        }
        if !permissions.can_subscribe(filter) {
            debug!(client = %client.id(), topic = %filter, "Subscribe denied");
            return false;
        }
        if let Err(e) = self.subscriptions.subscribe(filter, client.session_id()) {
            warn!(client = %client.id(), topic = %filter, error = %e, "Invalid topic filter");
            return false;
        }

        // A session cleared before the binding landed has already had its
        // expiry handled, so nothing else would remove it.
        if !self.sessions.contains(client.session_id()) {
            self.subscriptions.unsubscribe(filter, client.session_id());
            debug!(client = %client.id(), topic = %filter, "Session gone, subscription dropped");
            return false;
        }
        true
    }

    pub fn unsubscribe(&self, client: &Client, filter: &str) -> bool {
        self.subscriptions.unsubscribe(filter, client.session_id())
    }

    /// Deliver an encoded frame to every client subscribed to `topic`.
    ///
    /// Sessions without a live client are skipped. Returns the number of
    /// clients the frame was queued for.
    ///
    /// # Errors
    ///
    /// Returns an error if `topic` is not a valid topic name.
    pub fn publish(&self, topic: &str, frame: Bytes) -> Result<usize, TopicError> {
        validate_topic_name(topic)?;

        let targets = self.subscriptions.get_subscribers(topic);
        if targets.is_empty() {
            trace!(topic = %topic, "No subscribers");
            return Ok(0);
        }

        let mut delivered = 0;
        for session in self.sessions.find_by_ids(&targets) {
            let Some(client) = self.clients.get(&session.client_id) else {
                continue;
            };
            if client.session_id() != session.id {
                continue;
            }
            match client.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(LinkError::Closed) => {
                    trace!(client = %client.id(), "Skipping closed client");
                }
                Err(e) => {
                    warn!(client = %client.id(), topic = %topic, error = %e, "Dropped delivery");
                }
            }
        }

        trace!(topic = %topic, recipients = delivered, "Published");
        Ok(delivered)
    }

    /// Close a client's connection.
    pub fn disconnect(&self, client: &Client) -> bool {
        client.close()
    }

    /// Close every client and stop background tasks.
    pub async fn shutdown(&self) {
        info!(clients = self.clients.len(), "Shutting down broker");
        let _ = self.shutdown.send(true);

        for client in self.clients.all() {
            client.close();
            client.join_watchdog().await;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.events.shutdown().await;
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{Access, Acl, StaticUsers, User};
    use crate::client::tests::RecordingLink;
    use crate::client::ClientStatus;
    use std::sync::atomic::Ordering;

    fn request(client_id: &str, clean_session: bool) -> ConnectRequest {
        ConnectRequest {
            client_id: client_id.to_string(),
            clean_session,
            ..Default::default()
        }
    }

    fn connect(broker: &Broker, req: ConnectRequest) -> (Connected, Arc<RecordingLink>) {
        let link = Arc::new(RecordingLink::default());
        let connected = broker.connect(req, link.clone()).unwrap();
        assert!(connected.client.activate());
        (connected, link)
    }

    #[tokio::test]
    async fn test_fanout() {
        let broker = Broker::default();
        broker.start();

        let (a, a_link) = connect(&broker, request("a", true));
        let (b, b_link) = connect(&broker, request("b", true));
        assert!(broker.subscribe(&a.client, &a.permissions, "room/+"));
        assert!(broker.subscribe(&a.client, &a.permissions, "room/#"));
        assert!(broker.subscribe(&b.client, &b.permissions, "room/1"));

        let frame = Bytes::from_static(b"frame");
        assert_eq!(broker.publish("room/1", frame.clone()), Ok(2));
        assert_eq!(broker.publish("room/2", frame.clone()), Ok(1));
        assert_eq!(broker.publish("hall", frame.clone()), Ok(0));
        assert_eq!(
            broker.publish("room/+", frame),
            Err(TopicError::WildcardInName)
        );

        assert_eq!(a_link.frames.lock().len(), 2);
        assert_eq!(b_link.frames.lock().len(), 1);

        assert!(broker.unsubscribe(&b.client, "room/1"));
        assert_eq!(broker.publish("room/1", Bytes::new()), Ok(1));

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_filter_is_not_granted() {
        let broker = Broker::default();
        let (a, _) = connect(&broker, request("a", true));
        assert!(!broker.subscribe(&a.client, &a.permissions, "a/#/b"));
        assert_eq!(broker.stats().topics, 0);
    }

    #[tokio::test]
    async fn test_assigned_client_id() {
        let broker = Broker::default();

        let (connected, _) = connect(&broker, request("", true));
        assert!(connected.client.id().starts_with(ASSIGNED_ID_PREFIX));
        assert!(!connected.session_present);

        let refused = broker.connect(request("", false), Arc::new(RecordingLink::default()));
        assert_eq!(refused.err(), Some(ConnectError::IdentifierRejected));
    }

    #[tokio::test]
    async fn test_authentication() {
        let users = StaticUsers::new(vec![User {
            username: "sensor".into(),
            password: "pw".into(),
            acls: vec![
                Acl::new("sensors/+/temp", Access::Publish),
                Acl::new("commands/#", Access::Subscribe),
            ],
        }]);
        let broker = Broker::default().with_authenticator(Arc::new(users));

        let anonymous = broker.connect(request("c1", true), Arc::new(RecordingLink::default()));
        assert_eq!(anonymous.err(), Some(ConnectError::NotAuthorized));

        let mut req = request("c1", true);
        req.username = Some("sensor".into());
        req.password = Some(Bytes::from_static(b"nope"));
        let wrong = broker.connect(req.clone(), Arc::new(RecordingLink::default()));
        assert_eq!(wrong.err(), Some(ConnectError::BadCredentials));

        req.password = Some(Bytes::from_static(b"pw"));
        let (mut connected, _) = connect(&broker, req);
        assert!(connected.permissions.can_publish("sensors/kitchen/temp"));
        assert!(!connected.permissions.can_publish("commands/reboot"));
        assert!(broker.subscribe(&connected.client, &connected.permissions, "commands/#"));
        assert!(!broker.subscribe(&connected.client, &connected.permissions, "sensors/#"));
    }

    #[tokio::test]
    async fn test_takeover_resumes_session() {
        let broker = Broker::default();
        broker.start();

        let (first, first_link) = connect(&broker, request("c1", false));
        assert!(!first.session_present);
        broker.subscribe(&first.client, &first.permissions, "t/#");

        let (second, second_link) = connect(&broker, request("c1", false));
        assert!(second.session_present);
        assert_eq!(second.client.session_id(), first.client.session_id());
        assert_eq!(first.client.status(), ClientStatus::Disconnected);
        assert!(first_link.closed.load(Ordering::SeqCst));

        assert_eq!(broker.publish("t/x", Bytes::from_static(b"m")), Ok(1));
        assert!(first_link.frames.lock().is_empty());
        assert_eq!(second_link.frames.lock().len(), 1);
        assert_eq!(broker.stats().clients, 1);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_clean_disconnect_drops_subscriptions() {
        let broker = Broker::default();
        broker.start();

        let (c, _) = connect(&broker, request("c1", true));
        broker.subscribe(&c.client, &c.permissions, "t/a");
        assert!(broker.disconnect(&c.client));
        assert!(broker.sessions().is_empty());

        // Drains the expiry handler.
        broker.shutdown().await;
        assert!(broker.subscriptions().get_subscribers("t/a").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_expiry_drops_subscriptions() {
        let broker = Broker::new(BrokerConfig {
            session_ttl: Duration::from_secs(5),
            ..Default::default()
        });
        broker.start();

        let (c, _) = connect(&broker, request("c1", false));
        broker.subscribe(&c.client, &c.permissions, "t/a");
        broker.disconnect(&c.client);

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(broker.subscriptions().get_subscribers("t/a").len(), 1);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(broker.sessions().is_empty());
        assert!(broker.subscriptions().get_subscribers("t/a").is_empty());

        broker.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumed_session_keeps_subscriptions() {
        let broker = Broker::new(BrokerConfig {
            session_ttl: Duration::from_secs(60),
            ..Default::default()
        });
        broker.start();

        let (c, _) = connect(&broker, request("c1", false));
        broker.subscribe(&c.client, &c.permissions, "t/a");
        broker.disconnect(&c.client);

        tokio::time::sleep(Duration::from_secs(30)).await;
        let (again, link) = connect(&broker, request("c1", false));
        assert!(again.session_present);
        assert_eq!(broker.publish("t/a", Bytes::from_static(b"m")), Ok(1));
        assert_eq!(link.frames.lock().len(), 1);

        broker.shutdown().await;
    }

    #[test]
    fn test_concurrent_takeover_leaves_one_client() {
        let broker = Broker::default();
        let ids: Vec<String> = (0..500).map(|i| format!("c{i}")).collect();
        let barrier = std::sync::Barrier::new(2);

        let connect_all = || {
            let mut clients = Vec::new();
            for id in &ids {
                barrier.wait();
                let link = Arc::new(RecordingLink::default());
                let connected = broker.connect(request(id, false), link).unwrap();
                // Loses to a takeover that closed it first.
                connected.client.activate();
                clients.push(connected.client);
            }
            clients
        };
        let (left, right) = std::thread::scope(|s| {
            let left = s.spawn(connect_all);
            let right = s.spawn(connect_all);
            (left.join().unwrap(), right.join().unwrap())
        });

        for (a, b) in left.iter().zip(&right) {
            assert_eq!(a.session_id(), b.session_id());
            assert!(a.is_connected() != b.is_connected(), "{} has two live clients", a.id());

            let live = broker.clients().get(a.id()).unwrap();
            assert!(live.is_connected());
            assert!(!broker.sessions().get(a.id()).unwrap().is_pending_expiry());
        }
        assert_eq!(broker.clients().len(), ids.len());
    }

    #[tokio::test]
    async fn test_subscribe_after_takeover_is_refused() {
        let broker = Broker::default();
        broker.start();

        let (old, _) = connect(&broker, request("c1", false));
        let (new, _) = connect(&broker, request("c1", true));
        assert!(!old.client.is_connected());
        assert_ne!(old.client.session_id(), new.client.session_id());

        assert!(!broker.subscribe(&old.client, &old.permissions, "late/#"));
        assert!(broker.subscribe(&new.client, &new.permissions, "fresh/#"));

        broker.shutdown().await;
        assert!(broker.subscriptions().topics(old.client.session_id()).is_empty());
        assert!(broker.subscriptions().get_subscribers("late/x").is_empty());
    }

    #[tokio::test]
    async fn test_subscribe_on_cleared_session_is_undone() {
        let broker = Broker::default();
        broker.start();

        let (c, _) = connect(&broker, request("c1", true));
        // The session is gone while the client is still marked connected.
        assert!(broker.sessions().clear("c1", c.client.session_id()));
        assert!(c.client.is_connected());

        assert!(!broker.subscribe(&c.client, &c.permissions, "late/#"));
        assert_eq!(broker.subscriptions().stats().total_subscriptions, 0);
        assert_eq!(broker.stats().topics, 0);

        broker.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_clients() {
        let broker = Broker::default();
        broker.start();
        let (a, a_link) = connect(&broker, request("a", true));
        let (b, _) = connect(&broker, request("b", false));

        broker.shutdown().await;
        assert!(a_link.closed.load(Ordering::SeqCst));
        assert!(a.client.status().is_closed());
        assert!(b.client.status().is_closed());
        assert!(broker.clients().is_empty());
    }
}
