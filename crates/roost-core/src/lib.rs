//! # roost-core
//!
//! Session engine of the Roost MQTT broker.
//!
//! This crate provides the in-memory state a broker keeps between packets:
//!
//! - **TopicTrie** - Wildcard-aware topic pattern matching
//! - **SubscriptionRegistry** - Topic filter to session bindings
//! - **SessionManager** - Session resumption and expiry
//! - **EventBus** - Bounded, drop-on-full event delivery
//! - **Client** - Connection status and the keepalive watchdog
//! - **Broker** - Owner of all of the above
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌──────────────┐
//! │   Client    │────▶│   Broker    │────▶│ Subscription │──▶ TopicTrie
//! └─────────────┘     └─────────────┘     │   Registry   │
//!                            │            └──────────────┘
//!                            ▼                    ▲
//!                     ┌─────────────┐     ┌──────────────┐
//!                     │  Sessions   │────▶│   EventBus   │
//!                     └─────────────┘     └──────────────┘
//! ```
//!
//! ## Example
//!
//! ```rust
//! use roost_core::{SubscriptionRegistry, SessionId};
//!
//! let registry = SubscriptionRegistry::new();
//! let session = SessionId::new(1);
//! registry.subscribe("sensors/+/temp", session).unwrap();
//!
//! assert_eq!(registry.get_subscribers("sensors/kitchen/temp"), vec![session]);
//! assert!(registry.get_subscribers("sensors/kitchen/humidity").is_empty());
//! ```

pub mod auth;
pub mod broker;
pub mod client;
pub mod event;
pub mod registry;
pub mod session;
pub mod topic;
pub mod trie;

pub use auth::{Access, Acl, AclAuthorizer, Authenticator, Authorizer, StaticUsers, User};
pub use broker::{Broker, BrokerConfig, BrokerStats, ConnectError, ConnectRequest, Connected};
pub use client::{
    Client, ClientInfo, ClientLink, ClientRegistry, ClientStatus, LinkError, Permissions,
};
pub use event::{Event, EventBus, EventHandler, EventKind, EventPayload};
pub use registry::{RegistryStats, SubscriptionRegistry};
pub use session::{Session, SessionId, SessionManager, SWEEP_INTERVAL};
pub use topic::{validate_topic_filter, validate_topic_name, TopicError};
pub use trie::{NodeId, TopicTrie, TrieNode};
