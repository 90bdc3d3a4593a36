//! Subscription registry.
//!
//! Maps topic filters to the sessions subscribed to them. The trie and
//! both binding maps sit behind one lock and are only touched for short
//! in-memory updates.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::event::{Event, EventHandler, EventPayload};
use crate::session::SessionId;
use crate::topic::{split, validate_topic_filter, TopicError};
use crate::trie::TopicTrie;

#[derive(Default)]
struct RegistryState {
    trie: TopicTrie<()>,
    /// session -> filters it holds
    session_topics: HashMap<SessionId, HashSet<String>>,
    /// filter -> sessions holding it, in subscription order
    topic_sessions: HashMap<String, Vec<SessionId>>,
}

impl RegistryState {
    fn unbind(&mut self, topic: &str, session: SessionId) -> bool {
        let Some(subscribers) = self.topic_sessions.get_mut(topic) else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|s| *s != session);
        if subscribers.len() == before {
            return false;
        }

        if subscribers.is_empty() {
            self.topic_sessions.remove(topic);
            self.trie.remove(&split(topic));
            trace!(topic = %topic, "Topic pruned");
        }
        true
    }
}

/// Registry statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    /// Distinct filters with at least one subscriber.
    pub topic_count: usize,
    /// Sessions holding at least one subscription.
    pub session_count: usize,
    /// Total (filter, session) bindings.
    pub total_subscriptions: usize,
}

/// Topic filter subscriptions for all sessions.
#[derive(Default)]
pub struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe `session` to `topic`.
    ///
    /// Returns `Ok(false)` if the binding already exists.
    ///
    /// # Errors
    ///
    /// Returns an error if `topic` is not a valid filter.
    pub fn subscribe(&self, topic: &str, session: SessionId) -> Result<bool, TopicError> {
        validate_topic_filter(topic)?;

        let mut state = self.state.lock();
        let topics = state.session_topics.entry(session).or_default();
        if !topics.insert(topic.to_string()) {
            return Ok(false);
        }

        let subscribers = state.topic_sessions.entry(topic.to_string()).or_default();
        let first = subscribers.is_empty();
        subscribers.push(session);
        if first {
            state.trie.insert(&split(topic), ());
        }

        debug!(topic = %topic, session = %session, "Subscribed");
        Ok(true)
    }

    /// Remove the binding of `session` to `topic`.
    ///
    /// Returns `false` if there was no such binding.
    pub fn unsubscribe(&self, topic: &str, session: SessionId) -> bool {
        let mut state = self.state.lock();
        let Some(topics) = state.session_topics.get_mut(&session) else {
            return false;
        };
        if !topics.remove(topic) {
            return false;
        }
        if topics.is_empty() {
            state.session_topics.remove(&session);
        }

        state.unbind(topic, session);
        debug!(topic = %topic, session = %session, "Unsubscribed");
        true
    }

    /// Remove every binding held by `session`.
    ///
    /// Returns the number of bindings removed.
    pub fn unsubscribe_all(&self, session: SessionId) -> usize {
        let mut state = self.state.lock();
        let Some(topics) = state.session_topics.remove(&session) else {
            return 0;
        };
        for topic in &topics {
            state.unbind(topic, session);
        }

        debug!(session = %session, count = topics.len(), "Unsubscribed from all topics");
        topics.len()
    }

    /// Sessions subscribed to a filter matching the published `topic`.
    ///
    /// Deduplicated, in the order matching filters were discovered.
    #[must_use]
    pub fn get_subscribers(&self, topic: &str) -> Vec<SessionId> {
        let state = self.state.lock();
        let mut seen = HashSet::new();
        let mut sessions = Vec::new();

        for node in state.trie.match_many(&split(topic)) {
            let Some(subscribers) = node.topic().and_then(|t| state.topic_sessions.get(t)) else {
                continue;
            };
            sessions.extend(subscribers.iter().copied().filter(|s| seen.insert(*s)));
        }

        trace!(topic = %topic, subscribers = sessions.len(), "Resolved subscribers");
        sessions
    }

    /// Filters held by `session`, sorted.
    #[must_use]
    pub fn topics(&self, session: SessionId) -> Vec<String> {
        let state = self.state.lock();
        let mut topics: Vec<String> = state
            .session_topics
            .get(&session)
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        topics.sort();
        topics
    }

    /// Sessions holding exactly the filter `topic`.
    #[must_use]
    pub fn subscribers(&self, topic: &str) -> Vec<SessionId> {
        self.state
            .lock()
            .topic_sessions
            .get(topic)
            .cloned()
            .unwrap_or_default()
    }

    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        RegistryStats {
            topic_count: state.topic_sessions.len(),
            session_count: state.session_topics.len(),
            total_subscriptions: state.session_topics.values().map(HashSet::len).sum(),
        }
    }

    /// An event handler that drops a session's subscriptions when it
    /// expires.
    #[must_use]
    pub fn expiry_handler(self: &Arc<Self>) -> Arc<dyn EventHandler> {
        let registry = Arc::clone(self);
        Arc::new(move |event: &Event| match &event.payload {
            EventPayload::SessionExpired(session) => {
                registry.unsubscribe_all(session.id);
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventBus, EventKind};
    use crate::session::Session;
    use std::time::Duration;

    const C1: SessionId = SessionId::new(1);
    const C2: SessionId = SessionId::new(2);
    const C3: SessionId = SessionId::new(3);

    /// Both maps must describe the same set of bindings.
    fn assert_inverse(registry: &SubscriptionRegistry) {
        let state = registry.state.lock();
        for (session, topics) in &state.session_topics {
            assert!(!topics.is_empty());
            for topic in topics {
                assert!(state.topic_sessions[topic].contains(session));
            }
        }
        for (topic, sessions) in &state.topic_sessions {
            assert!(!sessions.is_empty());
            for session in sessions {
                assert!(state.session_topics[session].contains(topic));
            }
        }
        assert_eq!(state.trie.count_nodes(), state.topic_sessions.len());
    }

    fn scenario() -> SubscriptionRegistry {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("t/a/b", C1).unwrap();
        registry.subscribe("t/a/c", C1).unwrap();
        registry.subscribe("t/b/#", C1).unwrap();
        registry.subscribe("t/a/+", C2).unwrap();
        registry.subscribe("t/+/+/a", C2).unwrap();
        assert!(!registry.subscribe("t/+/+/a", C2).unwrap());
        registry.subscribe("t/b/#", C3).unwrap();
        registry.subscribe("t/c/user/1", C3).unwrap();
        registry.subscribe("t/c/user/2", C3).unwrap();
        assert_inverse(&registry);
        registry
    }

    #[test]
    fn test_get_subscribers() {
        let registry = scenario();

        assert!(registry.get_subscribers("t/c/2").is_empty());
        assert_eq!(registry.get_subscribers("t/c/user/1"), vec![C3]);
        assert_eq!(registry.get_subscribers("t/a/b"), vec![C1, C2]);
        assert_eq!(registry.get_subscribers("t/s/m/a"), vec![C2]);
        assert_eq!(registry.get_subscribers("t/b/s/m/d"), vec![C1, C3]);
    }

    #[test]
    fn test_unsubscribe_scenario() {
        let registry = scenario();

        assert!(registry.unsubscribe("t/a/b", C1));
        assert_eq!(registry.get_subscribers("t/a/b"), vec![C2]);
        assert!(registry.unsubscribe("t/a/+", C2));
        assert!(registry.get_subscribers("t/a/b").is_empty());
        assert_eq!(registry.unsubscribe_all(C3), 3);
        assert!(registry.get_subscribers("t/c/user/1").is_empty());
        assert!(registry.get_subscribers("t/c/user/2").is_empty());
        assert_inverse(&registry);

        // Repeats and unknown bindings are no-ops.
        assert!(!registry.unsubscribe("t/a/b", C1));
        assert!(!registry.unsubscribe("t/a/+", C2));
        assert_eq!(registry.unsubscribe_all(C3), 0);
        assert!(!registry.unsubscribe("nope", SessionId::new(99)));
        assert!(!registry.unsubscribe("t/a/c", C2));
        assert_inverse(&registry);

        // t/b/# is still held by c1.
        assert_eq!(registry.get_subscribers("t/b/x"), vec![C1]);
    }

    #[test]
    fn test_subscribe_is_idempotent() {
        let registry = SubscriptionRegistry::new();
        assert!(registry.subscribe("a/+", C1).unwrap());
        assert!(!registry.subscribe("a/+", C1).unwrap());

        assert_eq!(registry.get_subscribers("a/b"), vec![C1]);
        assert_eq!(registry.stats().total_subscriptions, 1);

        // One unsubscribe fully undoes it.
        assert!(registry.unsubscribe("a/+", C1));
        assert!(registry.get_subscribers("a/b").is_empty());
        assert_eq!(
            registry.stats(),
            RegistryStats {
                topic_count: 0,
                session_count: 0,
                total_subscriptions: 0
            }
        );
    }

    #[test]
    fn test_unsubscribe_all_prunes_trie() {
        let registry = SubscriptionRegistry::new();
        registry.subscribe("x/y/z", C1).unwrap();
        registry.subscribe("x/#", C1).unwrap();
        registry.subscribe("x/#", C2).unwrap();

        registry.unsubscribe_all(C1);
        assert_eq!(registry.get_subscribers("x/y/z"), vec![C2]);
        assert!(registry.subscribers("x/y/z").is_empty());
        assert_eq!(registry.state.lock().trie.len(), 3);
        assert_inverse(&registry);

        registry.unsubscribe_all(C2);
        assert!(registry.state.lock().trie.is_empty());
    }

    #[test]
    fn test_rejects_invalid_filter() {
        let registry = SubscriptionRegistry::new();
        assert_eq!(
            registry.subscribe("a/#/b", C1),
            Err(TopicError::MultiLevelNotLast)
        );
        assert_eq!(registry.subscribe("", C1), Err(TopicError::Empty));
        assert!(registry.topics(C1).is_empty());
    }

    #[test]
    fn test_random_operations_keep_maps_inverse() {
        let registry = SubscriptionRegistry::new();
        let topics = ["a", "a/b", "a/+", "a/#", "+/b", "#", "a/b/c"];
        let sessions = [C1, C2, C3];

        // Small LCG so the sequence is reproducible.
        let mut seed: u64 = 0x2545_f491_4f6c_dd1d;
        let mut next = |bound: usize| {
            seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
            ((seed >> 33) as usize) % bound
        };

        for _ in 0..500 {
            let topic = topics[next(topics.len())];
            let session = sessions[next(sessions.len())];
            match next(4) {
                0 | 1 => {
                    registry.subscribe(topic, session).unwrap();
                }
                2 => {
                    registry.unsubscribe(topic, session);
                }
                _ => {
                    registry.unsubscribe_all(session);
                }
            }
            assert_inverse(&registry);
        }
    }

    #[tokio::test]
    async fn test_expiry_handler_drops_subscriptions() {
        let registry = Arc::new(SubscriptionRegistry::new());
        let bus = EventBus::new();
        bus.subscribe(EventKind::SessionExpired, registry.expiry_handler());

        registry.subscribe("a/b", C1).unwrap();
        registry.subscribe("a/b", C2).unwrap();

        let expired = Session::new(C1, "c1", Duration::from_secs(1));
        assert_eq!(bus.publish(Event::session_expired(expired)), 1);
        bus.shutdown().await;

        assert_eq!(registry.get_subscribers("a/b"), vec![C2]);
        assert!(registry.topics(C1).is_empty());
    }
}
