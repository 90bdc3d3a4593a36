//! # roost-transport
//!
//! Transport abstraction layer for the Roost MQTT broker.
//!
//! All transports implement the `Transport` and `Connection` traits,
//! allowing the server to be protocol-agnostic. Outbound frames go through
//! the connection's [`ClientLink`](roost_core::ClientLink), which the core
//! uses for fan-out.
//!
//! ```rust,ignore
//! use roost_transport::{Connection, Transport};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(packet)) = conn.recv().await {
//!         // Process packet
//!     }
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpConfig, TcpConnection, TcpLink, TcpTransport};
pub use traits::{Connection, ConnectionId, Transport, TransportError};
