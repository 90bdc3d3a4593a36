//! # roost-protocol
//!
//! Wire protocol definitions for the Roost MQTT broker.
//!
//! This crate defines the MQTT 3.1.1 control packets the broker speaks,
//! the codec that frames them on a byte stream, and protocol level
//! negotiation.
//!
//! ## Packet Types
//!
//! - `Connect` / `ConnAck` - Session handshake
//! - `Subscribe` / `SubAck`, `Unsubscribe` / `UnsubAck` - Topic membership
//! - `Publish` - Application messages
//! - `PingReq` / `PingResp` - Keepalive
//! - `Disconnect` - Graceful close
//!
//! ## Example
//!
//! ```rust
//! use roost_protocol::{codec, Packet};
//!
//! let packet = Packet::publish("sensors/kitchen/temp", b"21.5".to_vec());
//!
//! let encoded = codec::encode(&packet).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(packet, decoded);
//! ```

pub mod codec;
pub mod packets;
pub mod version;

pub use codec::{decode, encode, PacketCodec, ProtocolError};
pub use packets::{
    ConnAck, Connect, ConnectReturnCode, Packet, PacketType, Publish, QoS, SubAck, Subscribe,
    SubscribeReturnCode, Unsubscribe, Will,
};
pub use version::{ProtocolLevel, SUPPORTED_LEVELS};
