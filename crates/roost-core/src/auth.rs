//! Authentication and topic access control.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::topic::{split, MULTI_LEVEL_WILDCARD};
use crate::trie::TopicTrie;

/// Per-identity topic permissions.
pub trait Authorizer: Send + Sync {
    fn can_subscribe(&self, topic: &str) -> bool;
    fn can_publish(&self, topic: &str) -> bool;
}

/// Resolves credentials into an [`Authorizer`].
pub trait Authenticator: Send + Sync {
    /// Returns `None` when the credentials are rejected.
    fn authenticate(&self, username: &str, password: &[u8]) -> Option<Arc<dyn Authorizer>>;
}

/// What an ACL entry grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    Subscribe,
    Publish,
    SubscribePublish,
}

impl Access {
    #[must_use]
    pub fn allows_subscribe(self) -> bool {
        matches!(self, Access::Subscribe | Access::SubscribePublish)
    }

    #[must_use]
    pub fn allows_publish(self) -> bool {
        matches!(self, Access::Publish | Access::SubscribePublish)
    }
}

/// A topic pattern and the access it grants.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Acl {
    pub topic: String,
    pub access: Access,
}

impl Acl {
    #[must_use]
    pub fn new(topic: impl Into<String>, access: Access) -> Self {
        Self {
            topic: topic.into(),
            access,
        }
    }
}

/// Authorizer backed by a list of ACL patterns.
///
/// A topic gets exactly one verdict: the access of the pattern selected by
/// [`TopicTrie::match_one`]. Unmatched and empty topics are denied.
#[derive(Debug)]
pub struct AclAuthorizer {
    trie: TopicTrie<Access>,
}

impl AclAuthorizer {
    #[must_use]
    pub fn new(acls: &[Acl]) -> Self {
        let mut trie = TopicTrie::new();
        for acl in acls.iter().filter(|acl| !acl.topic.is_empty()) {
            trie.insert(&split(&acl.topic), acl.access);
        }
        Self { trie }
    }

    /// Full access to every topic.
    #[must_use]
    pub fn allow_all() -> Self {
        Self::new(&[Acl::new(MULTI_LEVEL_WILDCARD, Access::SubscribePublish)])
    }

    fn access(&self, topic: &str) -> Option<Access> {
        if topic.is_empty() {
            return None;
        }
        self.trie
            .match_one(&split(topic))
            .and_then(|node| node.value().copied())
    }
}

impl Authorizer for AclAuthorizer {
    fn can_subscribe(&self, topic: &str) -> bool {
        self.access(topic).is_some_and(Access::allows_subscribe)
    }

    fn can_publish(&self, topic: &str) -> bool {
        self.access(topic).is_some_and(Access::allows_publish)
    }
}

/// A configured user.
#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub username: String,
    pub password: String,
    /// Empty means full access.
    #[serde(default)]
    pub acls: Vec<Acl>,
}

/// Username/password whitelist.
pub struct StaticUsers {
    users: HashMap<String, (String, Arc<dyn Authorizer>)>,
}

impl StaticUsers {
    #[must_use]
    pub fn new(users: Vec<User>) -> Self {
        let mut map = HashMap::with_capacity(users.len());
        for user in users {
            let authorizer: Arc<dyn Authorizer> = if user.acls.is_empty() {
                Arc::new(AclAuthorizer::allow_all())
            } else {
                Arc::new(AclAuthorizer::new(&user.acls))
            };
            if map
                .insert(user.username.clone(), (user.password, authorizer))
                .is_some()
            {
                warn!(username = %user.username, "Duplicate user, keeping the last entry");
            }
        }
        Self { users: map }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.users.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl Authenticator for StaticUsers {
    fn authenticate(&self, username: &str, password: &[u8]) -> Option<Arc<dyn Authorizer>> {
        let (expected, authorizer) = self.users.get(username)?;
        if expected.as_bytes() != password {
            debug!(username = %username, "Password mismatch");
            return None;
        }
        Some(Arc::clone(authorizer))
    }
}
