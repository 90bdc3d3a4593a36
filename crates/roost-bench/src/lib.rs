//! Shared fixtures for the Roost benchmarks.

use bytes::Bytes;
use roost_core::{
    Broker, BrokerConfig, ClientLink, ConnectRequest, Connected, LinkError, SessionId,
    SubscriptionRegistry, TopicTrie,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Distinct topic filters shaped like a device fleet,
/// `site/<s>/dev/<d>/<metric>`. A quarter of them carry a wildcard.
#[must_use]
pub fn fleet_filters(count: usize) -> Vec<String> {
    const METRICS: [&str; 4] = ["temp", "humidity", "power", "status"];
    (0..count)
        .map(|i| {
            let site = i % 16;
            let metric = METRICS[i % METRICS.len()];
            match i % 8 {
                0 => format!("site/{i}/+/{metric}"),
                7 => format!("site/{site}/dev/{i}/#"),
                _ => format!("site/{site}/dev/{i}/{metric}"),
            }
        })
        .collect()
}

/// A trie holding every filter in `filters`.
#[must_use]
pub fn populated_trie(filters: &[String]) -> TopicTrie<usize> {
    let mut trie = TopicTrie::new();
    for (i, filter) in filters.iter().enumerate() {
        let parts: Vec<&str> = filter.split('/').collect();
        trie.insert(&parts, i);
    }
    trie
}

/// A registry where each of `sessions` sessions subscribes to `filters`
/// round-robin.
#[must_use]
pub fn populated_registry(filters: &[String], sessions: u64) -> SubscriptionRegistry {
    let registry = SubscriptionRegistry::new();
    for (i, filter) in filters.iter().enumerate() {
        let session = SessionId::new(i as u64 % sessions.max(1));
        // Fleet filters are always valid.
        let _ = registry.subscribe(filter, session);
    }
    registry
}

/// A link that counts frames and drops them.
#[derive(Debug, Default)]
pub struct CountingLink {
    frames: AtomicUsize,
}

impl CountingLink {
    #[must_use]
    pub fn frames(&self) -> usize {
        self.frames.load(Ordering::Relaxed)
    }
}

impl ClientLink for CountingLink {
    fn send(&self, _frame: Bytes) -> Result<(), LinkError> {
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<(), LinkError> {
        Ok(())
    }
}

/// A broker with `clients` connected clients all subscribed to `filter`.
///
/// Must be called from within a Tokio runtime.
#[must_use]
pub fn broker_with_subscribers(clients: usize, filter: &str) -> (Broker, Vec<Connected>) {
    let broker = Broker::new(BrokerConfig::default());
    let connected = (0..clients)
        .filter_map(|i| {
            let request = ConnectRequest {
                client_id: format!("bench-{i}"),
                clean_session: true,
                ..Default::default()
            };
            let connected = broker
                .connect(request, Arc::new(CountingLink::default()))
                .ok()?;
            connected.client.activate();
            broker.subscribe(&connected.client, &connected.permissions, filter);
            Some(connected)
        })
        .collect();
    (broker, connected)
}
