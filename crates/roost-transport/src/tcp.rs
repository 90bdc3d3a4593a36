//! TCP transport implementation.
//!
//! Each accepted socket is split in two. The read half stays with the
//! [`TcpConnection`] and is decoded on demand; the write half is owned by
//! a writer task fed from a bounded queue, which is what the connection's
//! [`TcpLink`] pushes into.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use roost_core::{ClientLink, LinkError};
use roost_protocol::codec::DEFAULT_MAX_PACKET_SIZE;
use roost_protocol::{Packet, PacketCodec};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::traits::{Connection, ConnectionId, Transport, TransportError};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Largest packet accepted from a client, in bytes.
    pub max_packet_size: usize,
    /// Frames that may wait in a connection's outbound queue.
    pub outbound_queue: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 1883)),
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            outbound_queue: 1024,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        info!("TCP transport listening on {}", listener.local_addr()?);
        Ok(Self { listener, config })
    }

    /// Create a new TCP transport with default limits.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        debug!("Accepted TCP connection from {}", addr);
        Ok(Box::new(TcpConnection::new(stream, addr, &self.config)))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

/// Outbound side of a TCP connection.
pub struct TcpLink {
    tx: mpsc::Sender<Bytes>,
    closed: AtomicBool,
    shutdown: Notify,
}

impl ClientLink for TcpLink {
    fn send(&self, frame: Bytes) -> Result<(), LinkError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(LinkError::Closed);
        }
        self.tx.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::Full,
            mpsc::error::TrySendError::Closed(_) => LinkError::Closed,
        })
    }

    fn close(&self) -> Result<(), LinkError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.shutdown.notify_one();
        }
        Ok(())
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Bytes>, link: Arc<TcpLink>) {
    loop {
        tokio::select! {
            biased;
            frame = rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = writer.write_all(&frame).await {
                    debug!("Write failed: {}", e);
                    break;
                }
                trace!(bytes = frame.len(), "Frame written");
            }
            () = link.shutdown.notified() => {
                while let Ok(frame) = rx.try_recv() {
                    if writer.write_all(&frame).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }

    link.closed.store(true, Ordering::SeqCst);
    let _ = writer.shutdown().await;
}

/// A TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    reader: OwnedReadHalf,
    read_buffer: BytesMut,
    codec: PacketCodec,
    link: Arc<TcpLink>,
    writer: Option<JoinHandle<()>>,
}

impl TcpConnection {
    fn new(stream: TcpStream, remote_addr: SocketAddr, config: &TcpConfig) -> Self {
        let (reader, writer) = stream.into_split();
        let (tx, rx) = mpsc::channel(config.outbound_queue.max(1));
        let link = Arc::new(TcpLink {
            tx,
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        });
        let writer = tokio::spawn(write_loop(writer, rx, Arc::clone(&link)));

        Self {
            id: ConnectionId::generate(),
            remote_addr,
            reader,
            read_buffer: BytesMut::with_capacity(4096),
            codec: PacketCodec::with_max_packet_size(config.max_packet_size),
            link,
            writer: Some(writer),
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Packet>, TransportError> {
        loop {
            if let Some(packet) = self.codec.decode_from(&mut self.read_buffer)? {
                return Ok(Some(packet));
            }

            let n = self.reader.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    debug!(connection = %self.id, "Peer closed connection");
                    return Ok(None);
                }
                return Err(TransportError::ConnectionClosed);
            }
        }
    }

    fn send(&self, packet: &Packet) -> Result<(), TransportError> {
        let frame = self.codec.encode(packet)?;
        self.link.send(frame).map_err(|e| match e {
            LinkError::Full => TransportError::QueueFull,
            LinkError::Closed => TransportError::ConnectionClosed,
            LinkError::Io(msg) => TransportError::Other(msg),
        })
    }

    fn link(&self) -> Arc<dyn ClientLink> {
        self.link.clone()
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        let _ = self.link.close();
        if let Some(writer) = self.writer.take() {
            writer
                .await
                .map_err(|e| TransportError::Other(format!("Writer task failed: {e}")))?;
        }
        Ok(())
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        !self.link.closed.load(Ordering::SeqCst)
    }
}
