//! Connection handlers for the Roost server.
//!
//! This module runs the accept loop, the health endpoint and the
//! per-connection packet loop.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Router};
use futures_util::future::join_all;
use roost_core::{
    Broker, Client, ConnectError, ConnectRequest, Connected, Permissions, StaticUsers, TopicError,
};
use roost_protocol::{
    codec, ConnectReturnCode, Packet, PacketType, ProtocolError, ProtocolLevel, Publish,
    QoS, Subscribe, SubscribeReturnCode,
};
use roost_transport::{Connection, TcpTransport, Transport, TransportError};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// How long shutdown waits for connection tasks to finish.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Shared server state.
pub struct ServerState {
    pub broker: Arc<Broker>,
    /// Server configuration.
    pub config: Config,
}

impl ServerState {
    /// Create the broker described by `config` and start it.
    ///
    /// Must be called from within a Tokio runtime.
    #[must_use]
    pub fn new(config: Config) -> Self {
        let mut broker = Broker::new(config.broker_config());
        if !config.auth.users.is_empty() {
            info!(users = config.auth.users.len(), "Authentication enabled");
            broker = broker.with_authenticator(Arc::new(StaticUsers::new(
                config.auth.users.clone(),
            )));
        }
        broker.start();

        Self {
            broker: Arc::new(broker),
            config,
        }
    }
}

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Handshake timed out")]
    HandshakeTimeout,

    #[error("Connection closed before CONNECT")]
    ClosedBeforeConnect,

    #[error("Expected CONNECT, got {0}")]
    ExpectedConnect(PacketType),

    #[error("Unsupported protocol {name} level {level}")]
    UnsupportedProtocol { name: String, level: u8 },

    #[error("Connection refused: {0}")]
    Refused(#[from] ConnectError),

    #[error("Unexpected {0} packet")]
    Unexpected(PacketType),

    #[error("Invalid topic: {0}")]
    InvalidTopic(#[from] TopicError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl ConnectionError {
    /// Label used for the error metric.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            ConnectionError::HandshakeTimeout => "handshake_timeout",
            ConnectionError::ClosedBeforeConnect => "closed_before_connect",
            ConnectionError::ExpectedConnect(_) | ConnectionError::Unexpected(_) => {
                "unexpected_packet"
            }
            ConnectionError::UnsupportedProtocol { .. } => "unsupported_protocol",
            ConnectionError::Refused(_) => "refused",
            ConnectionError::InvalidTopic(_) => "invalid_topic",
            ConnectionError::Protocol(_) => "protocol",
            ConnectionError::Transport(_) => "transport",
        }
    }
}

/// Run the broker with the given configuration until ctrl-c.
///
/// # Errors
///
/// Returns an error if a listener cannot be bound.
pub async fn run_server(config: Config) -> Result<()> {
    let tcp_config = config.tcp_config()?;
    let state = Arc::new(ServerState::new(config.clone()));

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(&config.host, config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let health = if config.health.enabled {
        let addr = config.health_addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("Failed to bind health endpoint on {addr}"))?;
        info!("Health endpoint: http://{}/health", addr);
        let app = Router::new()
            .route("/health", get(health_handler))
            .with_state(Arc::clone(&state));
        Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Health endpoint failed: {}", e);
            }
        }))
    } else {
        None
    };

    let addr = tcp_config.bind_addr;
    let transport = TcpTransport::new(tcp_config)
        .await
        .with_context(|| format!("Failed to bind MQTT listener on {addr}"))?;
    info!("Roost broker listening on {}", addr);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received");
    };
    serve(Arc::clone(&state), transport, shutdown).await;

    if let Some(health) = health {
        health.abort();
    }
    info!("Roost broker stopped");
    Ok(())
}

/// Accept connections until `shutdown` resolves, then shut the broker
/// down and wait for the connection tasks.
pub async fn serve<T, F>(state: Arc<ServerState>, transport: T, shutdown: F)
where
    T: Transport,
    F: Future<Output = ()>,
{
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            () = &mut shutdown => break,
            accepted = transport.accept() => match accepted {
                Ok(conn) => {
                    connections.retain(|task| !task.is_finished());
                    connections.push(tokio::spawn(handle_connection(conn, Arc::clone(&state))));
                }
                Err(e) => {
                    warn!(transport = transport.name(), "Accept failed: {}", e);
                    metrics::record_error("accept");
                }
            },
        }
    }
    drop(transport);

    state.broker.shutdown().await;
    if tokio::time::timeout(SHUTDOWN_GRACE, join_all(connections))
        .await
        .is_err()
    {
        warn!("Connection tasks did not finish within {:?}", SHUTDOWN_GRACE);
    }
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    let stats = state.broker.stats();
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "clients": stats.clients,
        "sessions": stats.sessions,
        "topics": stats.topics,
    }))
}

/// Handle one connection from accept to close.
pub async fn handle_connection(mut conn: Box<dyn Connection>, state: Arc<ServerState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let connection_id = conn.id().clone();
    debug!(connection = %connection_id, remote = ?conn.remote_addr(), "Connection accepted");

    let timeout = Duration::from_millis(state.config.limits.handshake_timeout_ms);
    let Connected {
        client,
        mut permissions,
        session_present,
    } = match handshake(conn.as_mut(), &state.broker, timeout).await {
        Ok(connected) => connected,
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Handshake failed");
            metrics::record_error(e.kind());
            let _ = conn.close().await;
            return;
        }
    };

    // CONNACK is queued, deliveries may start.
    if !client.activate() {
        debug!(
            connection = %connection_id,
            client = %client.id(),
            status = ?client.status(),
            "Client closed before activation"
        );
    }
    debug!(
        connection = %connection_id,
        client = %client.id(),
        session_present,
        "Client session established"
    );

    match process(conn.as_mut(), &state.broker, &client, &mut permissions).await {
        Ok(()) => debug!(client = %client.id(), "Connection finished"),
        Err(e) => {
            debug!(client = %client.id(), error = %e, "Connection error");
            metrics::record_error(e.kind());
        }
    }

    state.broker.disconnect(&client);
    client.join_watchdog().await;
    if let Err(e) = conn.close().await {
        debug!(connection = %connection_id, error = %e, "Close failed");
    }
}

fn refusal_code(error: ConnectError) -> ConnectReturnCode {
    match error {
        ConnectError::IdentifierRejected => ConnectReturnCode::IdentifierRejected,
        ConnectError::BadCredentials => ConnectReturnCode::BadUsernameOrPassword,
        ConnectError::NotAuthorized => ConnectReturnCode::NotAuthorized,
    }
}

/// Read CONNECT, admit the client and queue CONNACK.
async fn handshake(
    conn: &mut dyn Connection,
    broker: &Broker,
    timeout: Duration,
) -> Result<Connected, ConnectionError> {
    let packet = tokio::time::timeout(timeout, conn.recv())
        .await
        .map_err(|_| ConnectionError::HandshakeTimeout)??;

    let connect = match packet {
        Some(Packet::Connect(connect)) => connect,
        Some(other) => return Err(ConnectionError::ExpectedConnect(other.packet_type())),
        None => return Err(ConnectionError::ClosedBeforeConnect),
    };

    if ProtocolLevel::negotiate(&connect.protocol_name, connect.protocol_level).is_none() {
        conn.send(&Packet::connack(
            false,
            ConnectReturnCode::UnacceptableProtocolVersion,
        ))?;
        return Err(ConnectionError::UnsupportedProtocol {
            name: connect.protocol_name,
            level: connect.protocol_level,
        });
    }

    let request = ConnectRequest {
        client_id: connect.client_id,
        clean_session: connect.clean_session,
        keepalive: Duration::from_secs(u64::from(connect.keep_alive)),
        username: connect.username,
        password: connect.password,
    };

    match broker.connect(request, conn.link()) {
        Ok(connected) => {
            let connack = Packet::connack(connected.session_present, ConnectReturnCode::Accepted);
            if let Err(e) = conn.send(&connack) {
                broker.disconnect(&connected.client);
                return Err(e.into());
            }
            Ok(connected)
        }
        Err(e) => {
            conn.send(&Packet::connack(false, refusal_code(e)))?;
            Err(e.into())
        }
    }
}

/// Dispatch packets in arrival order until the client disconnects or is
/// closed from elsewhere.
async fn process(
    conn: &mut dyn Connection,
    broker: &Broker,
    client: &Arc<Client>,
    permissions: &mut Permissions,
) -> Result<(), ConnectionError> {
    loop {
        let packet = tokio::select! {
            () = client.closed() => {
                debug!(client = %client.id(), status = ?client.status(), "Client closed");
                return Ok(());
            }
            packet = conn.recv() => packet?,
        };
        let Some(packet) = packet else {
            return Ok(());
        };
        client.touch();

        match packet {
            Packet::Publish(publish) => {
                let payload_len = publish.payload.len();
                if let Some(recipients) = on_publish(broker, client, permissions, publish)? {
                    metrics::record_message(payload_len, "inbound");
                    metrics::record_fanout(recipients, payload_len);
                }
            }
            Packet::Subscribe(subscribe) => {
                conn.send(&on_subscribe(broker, client, permissions, subscribe))?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                for filter in &unsubscribe.filters {
                    broker.unsubscribe(client, filter);
                }
                conn.send(&Packet::unsuback(unsubscribe.packet_id))?;
            }
            Packet::PingReq => conn.send(&Packet::PingResp)?,
            Packet::Disconnect => {
                debug!(client = %client.id(), "Client sent DISCONNECT");
                return Ok(());
            }
            other => return Err(ConnectionError::Unexpected(other.packet_type())),
        }
    }
}

/// Forward a PUBLISH to its subscribers.
///
/// Returns the number of recipients, or `None` if the client may not
/// publish to the topic.
fn on_publish(
    broker: &Broker,
    client: &Client,
    permissions: &mut Permissions,
    publish: Publish,
) -> Result<Option<usize>, ConnectionError> {
    if !permissions.can_publish(&publish.topic) {
        debug!(client = %client.id(), topic = %publish.topic, "Publish denied");
        return Ok(None);
    }

    // Subscribers always receive QoS 0.
    let frame = codec::encode(&Packet::publish(publish.topic.clone(), publish.payload))?;
    let recipients = broker.publish(&publish.topic, frame)?;
    debug!(client = %client.id(), topic = %publish.topic, recipients, "Publish");
    Ok(Some(recipients))
}

fn on_subscribe(
    broker: &Broker,
    client: &Client,
    permissions: &Permissions,
    subscribe: Subscribe,
) -> Packet {
    let return_codes = subscribe
        .filters
        .iter()
        .map(|(filter, _)| {
            if broker.subscribe(client, permissions, filter) {
                metrics::record_subscription();
                debug!(client = %client.id(), topic = %filter, "Subscribed");
                SubscribeReturnCode::Granted(QoS::AtMostOnce)
            } else {
                SubscribeReturnCode::Failure
            }
        })
        .collect();
    Packet::suback(subscribe.packet_id, return_codes)
}
