//! Wildcard-aware topic trie.
//!
//! Each node is one topic segment. Nodes live in an arena and refer to
//! their parent by index, which keeps upward pruning O(1) per level
//! without an ownership cycle. A node is terminal while its reference
//! count is at least one; it is detached from its parent once the count
//! reaches zero and it has no children.

use std::collections::{HashMap, HashSet};

use crate::topic::{MULTI_LEVEL_WILDCARD, SINGLE_LEVEL_WILDCARD, TOPIC_SEPARATOR};

/// Index of a node in the trie arena.
pub type NodeId = usize;

const ROOT: NodeId = 0;

#[derive(Debug)]
struct Node<V> {
    segment: String,
    depth: usize,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    /// Normalized topic, set while the node is terminal.
    topic: Option<String>,
    refs: usize,
    value: Option<V>,
}

impl<V> Node<V> {
    fn new(segment: &str, depth: usize, parent: Option<NodeId>) -> Self {
        Self {
            segment: segment.to_string(),
            depth,
            parent,
            children: HashMap::new(),
            topic: None,
            refs: 0,
            value: None,
        }
    }

    fn is_terminal(&self) -> bool {
        self.refs > 0
    }
}

/// A read-only view of a trie node.
#[derive(Debug)]
pub struct TrieNode<'a, V> {
    id: NodeId,
    node: &'a Node<V>,
}

impl<V> Clone for TrieNode<'_, V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for TrieNode<'_, V> {}

impl<'a, V> TrieNode<'a, V> {
    /// Arena index of this node.
    #[must_use]
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// The segment this node represents (empty for the root).
    #[must_use]
    pub fn segment(&self) -> &'a str {
        &self.node.segment
    }

    /// Distance from the root.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.node.depth
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.node.is_terminal()
    }

    /// The full topic pattern, if this node is terminal.
    #[must_use]
    pub fn topic(&self) -> Option<&'a str> {
        self.node.topic.as_deref()
    }

    #[must_use]
    pub fn value(&self) -> Option<&'a V> {
        self.node.value.as_ref()
    }

    /// Number of live insertions of this exact path.
    #[must_use]
    pub fn refs(&self) -> usize {
        self.node.refs
    }
}

enum Step {
    Visit(NodeId, usize),
    Emit(NodeId),
}

/// A trie of topic patterns.
#[derive(Debug)]
pub struct TopicTrie<V> {
    nodes: Vec<Node<V>>,
    free: Vec<NodeId>,
}

impl<V> Default for TopicTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TopicTrie<V> {
    /// Create an empty trie holding only the root.
    #[must_use]
    pub fn new() -> Self {
        Self {
            nodes: vec![Node::new("", 0, None)],
            free: Vec::new(),
        }
    }

    fn view(&self, id: NodeId) -> TrieNode<'_, V> {
        TrieNode {
            id,
            node: &self.nodes[id],
        }
    }

    /// The root node.
    #[must_use]
    pub fn root(&self) -> TrieNode<'_, V> {
        self.view(ROOT)
    }

    /// Look up a live node by id.
    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<TrieNode<'_, V>> {
        if id >= self.nodes.len() || self.free.contains(&id) {
            return None;
        }
        Some(self.view(id))
    }

    fn alloc(&mut self, parent: NodeId, segment: &str) -> NodeId {
        let node = Node::new(segment, self.nodes[parent].depth + 1, Some(parent));
        match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, id: NodeId) {
        self.nodes[id] = Node::new("", 0, None);
        self.free.push(id);
    }

    /// Insert a pattern, creating intermediate nodes as needed.
    ///
    /// Increments the terminal node's reference count and stores `value`
    /// on it. Returns the terminal node's id.
    pub fn insert(&mut self, segments: &[&str], value: V) -> NodeId {
        let mut cur = ROOT;
        for segment in segments {
            cur = match self.nodes[cur].children.get(*segment) {
                Some(&child) => child,
                None => {
                    let child = self.alloc(cur, segment);
                    self.nodes[cur].children.insert((*segment).to_string(), child);
                    child
                }
            };
        }

        let node = &mut self.nodes[cur];
        node.refs += 1;
        node.topic = Some(segments.join(&TOPIC_SEPARATOR.to_string()));
        node.value = Some(value);
        cur
    }

    /// Deepest node reachable by exact-segment descent.
    ///
    /// Wildcards in `segments` are compared literally.
    #[must_use]
    pub fn search_prefix(&self, segments: &[&str]) -> TrieNode<'_, V> {
        let mut cur = ROOT;
        for segment in segments {
            match self.nodes[cur].children.get(*segment) {
                Some(&child) => cur = child,
                None => break,
            }
        }
        self.view(cur)
    }

    fn find(&self, segments: &[&str]) -> Option<NodeId> {
        let mut cur = ROOT;
        for segment in segments {
            cur = *self.nodes[cur].children.get(*segment)?;
        }
        Some(cur)
    }

    /// All terminal nodes whose pattern matches a literal topic.
    ///
    /// At every level the exact child, the `+` child and the `#` child are
    /// explored; `#` also matches zero remaining segments. Results are in
    /// discovery order, deduplicated by topic.
    #[must_use]
    pub fn match_many(&self, segments: &[&str]) -> Vec<TrieNode<'_, V>> {
        let mut found: Vec<NodeId> = Vec::new();
        if segments.is_empty() {
            return Vec::new();
        }

        // Pushed in reverse so exact matches are discovered before `+`,
        // and both before the `#` sibling.
        let mut stack = vec![Step::Visit(ROOT, 0)];
        while let Some(step) = stack.pop() {
            match step {
                Step::Emit(id) => {
                    if self.nodes[id].is_terminal() {
                        found.push(id);
                    }
                }
                Step::Visit(id, index) => {
                    let node = &self.nodes[id];
                    let last = index + 1 == segments.len();

                    if let Some(&multi) = node.children.get(MULTI_LEVEL_WILDCARD) {
                        stack.push(Step::Emit(multi));
                    }

                    let exact = node.children.get(segments[index]).copied();
                    let single = node.children.get(SINGLE_LEVEL_WILDCARD).copied();
                    for child in [single, exact].into_iter().flatten() {
                        if last {
                            if let Some(&multi) =
                                self.nodes[child].children.get(MULTI_LEVEL_WILDCARD)
                            {
                                stack.push(Step::Emit(multi));
                            }
                            stack.push(Step::Emit(child));
                        } else {
                            stack.push(Step::Visit(child, index + 1));
                        }
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        found
            .into_iter()
            .filter(|id| seen.insert(self.nodes[*id].topic.as_deref()))
            .map(|id| self.view(id))
            .collect()
    }

    /// A single matching terminal node, for decisions that need exactly one
    /// verdict.
    ///
    /// The first pass descends greedily: an existing exact child is taken
    /// without fallback, then `+`, then `#` counts as an immediate match.
    /// If that fails, each inner segment from the second-to-last back to
    /// the second is replaced by `+` (one at a time) and the greedy pass is
    /// repeated; the first success wins. Combinations of substitutions are
    /// never tried, so some deeper matches are missed.
    #[must_use]
    pub fn match_one(&self, segments: &[&str]) -> Option<TrieNode<'_, V>> {
        if segments.is_empty() {
            return None;
        }
        if let Some(id) = self.greedy_match(segments) {
            return Some(self.view(id));
        }

        let size = segments.len();
        if size >= 2 {
            let mut candidate = segments.to_vec();
            for i in (1..size - 1).rev() {
                candidate.copy_from_slice(segments);
                candidate[i] = SINGLE_LEVEL_WILDCARD;
                if let Some(id) = self.greedy_match(&candidate) {
                    return Some(self.view(id));
                }
            }
        }
        None
    }

    fn greedy_match(&self, segments: &[&str]) -> Option<NodeId> {
        let mut cur = ROOT;
        let mut rest = segments;
        'descend: while let Some((part, tail)) = rest.split_first() {
            let node = &self.nodes[cur];
            for key in [*part, SINGLE_LEVEL_WILDCARD] {
                if let Some(&child) = node.children.get(key) {
                    if !tail.is_empty() {
                        cur = child;
                        rest = tail;
                        continue 'descend;
                    }
                    if self.nodes[child].is_terminal() {
                        return Some(child);
                    }
                }
            }
            return node
                .children
                .get(MULTI_LEVEL_WILDCARD)
                .copied()
                .filter(|id| self.nodes[*id].is_terminal());
        }
        None
    }

    /// Drop one reference to the exact pattern `segments`.
    ///
    /// When the count reaches zero the node stops being terminal and is
    /// detached if it has no children; ancestors left without children or
    /// references are detached in turn. Returns `false` if the path is not
    /// a terminal node.
    pub fn remove(&mut self, segments: &[&str]) -> bool {
        let Some(id) = self.find(segments) else {
            return false;
        };
        let node = &mut self.nodes[id];
        if !node.is_terminal() {
            return false;
        }

        node.refs -= 1;
        if node.refs == 0 {
            node.topic = None;
            node.value = None;
            self.prune(id);
        }
        true
    }

    fn prune(&mut self, id: NodeId) {
        let mut cur = id;
        while cur != ROOT {
            let node = &self.nodes[cur];
            if node.is_terminal() || !node.children.is_empty() {
                break;
            }
            let Some(parent) = node.parent else {
                break;
            };
            let segment = std::mem::take(&mut self.nodes[cur].segment);
            self.nodes[parent].children.remove(&segment);
            self.release(cur);
            cur = parent;
        }
    }

    /// Number of terminal nodes.
    #[must_use]
    pub fn count_nodes(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_terminal()).count()
    }

    /// Number of live nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    /// Whether the trie holds no patterns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::split;

    fn values<'a>(nodes: &[TrieNode<'a, &'static str>]) -> Vec<&'static str> {
        nodes.iter().filter_map(|n| n.value().copied()).collect()
    }

    fn sample() -> TopicTrie<&'static str> {
        let mut trie = TopicTrie::new();
        trie.insert(&split("nup/system/a"), "nodeA");
        trie.insert(&split("nup/system/c/b"), "nodeB");
        trie.insert(&split("nup/system/#"), "node#");
        trie.insert(&split("nup/system/c/+"), "node+");
        trie.insert(&split("nup/system/a/b/c"), "nodeC");
        trie.insert(&split("nup/system/a/b/d"), "nodeD");
        trie
    }

    #[test]
    fn test_search_prefix() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("nup/system/a"), "nodeA");
        trie.insert(&split("nup/system/c/#"), "");
        trie.insert(&split("nup/system/c/+"), "");
        trie.insert(&split("nup/system/a/b/c"), "nodeC");
        trie.insert(&split("nup/system/a/b/d"), "nodeD");

        let found = trie.search_prefix(&split("nup/system/c/a"));
        assert_eq!(found.segment(), "c");
        assert_eq!(found.depth(), 3);
        assert!(found.value().is_none());

        let found = trie.search_prefix(&split("nup/system/a/b"));
        assert_eq!(found.segment(), "b");
        assert_eq!(found.depth(), 4);

        assert_eq!(
            trie.search_prefix(&split("nup/system/a")).value(),
            Some(&"nodeA")
        );
        assert_eq!(
            trie.search_prefix(&split("nup/system/a/b/d")).value(),
            Some(&"nodeD")
        );
        assert_eq!(trie.search_prefix(&split("other")).depth(), 0);
    }

    #[test]
    fn test_match_many() {
        let trie = sample();

        assert_eq!(
            values(&trie.match_many(&split("nup/system/a"))),
            vec!["nodeA", "node#"]
        );
        assert_eq!(
            values(&trie.match_many(&split("nup/system/c/b"))),
            vec!["nodeB", "node+", "node#"]
        );
        assert_eq!(trie.match_many(&split("nup/system/a/b")).len(), 1);
        assert!(trie.match_many(&split("nup/user")).is_empty());
        // Wildcards in the published topic are literal.
        assert_eq!(trie.match_many(&split("nup/system/+")).len(), 1);
        assert_eq!(trie.match_many(&split("nup/system/#")).len(), 1);
        assert!(trie.match_many(&[]).is_empty());
    }

    #[test]
    fn test_match_many_multi_level_matches_parent() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("t/b/#"), ());
        trie.insert(&split("t/+/#"), ());

        let topics: Vec<_> = trie
            .match_many(&split("t/b"))
            .iter()
            .filter_map(|n| n.topic())
            .collect();
        assert_eq!(topics, vec!["t/b/#", "t/+/#"]);
        assert!(trie.match_many(&split("t")).is_empty());
    }

    #[test]
    fn test_match_many_deduplicates() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("a/+"), ());
        trie.insert(&split("a/+"), ());

        let matches = trie.match_many(&split("a/+"));
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].refs(), 2);
    }

    #[test]
    fn test_match_one() {
        let mut trie = sample();
        trie.insert(&split("nup/system/c/+/s"), "nodeS");
        trie.insert(&split("nup/system/s/+/+/m"), "nodeM");

        let one = |topic: &str| trie.match_one(&split(topic)).and_then(|n| n.value().copied());

        assert_eq!(one("nup/system/a"), Some("nodeA"));
        assert_eq!(one("nup/system/c/b"), Some("nodeB"));
        assert_eq!(one("nup/system/a/b"), Some("node#"));
        assert_eq!(one("nup/user"), None);
        assert_eq!(one("nup/system/+"), Some("node#"));
        assert_eq!(one("nup/system/#"), Some("node#"));
        assert_eq!(one("nup/system/a/d/+"), Some("node#"));
        assert_eq!(one("nup/system/a/+"), Some("node#"));
        assert_eq!(one("nup/system/c/+"), Some("node+"));
        assert_eq!(one("nup/system/c/s/s"), Some("nodeS"));
        assert_eq!(one("nup/system/s/s/s"), Some("node#"));
        assert_eq!(one("nup/system/s/s/s/m"), Some("nodeM"));
    }

    #[test]
    fn test_match_one_single_substitution_only() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("a/b/x"), "bx");
        trie.insert(&split("a/+/c/x"), "pcx");
        trie.insert(&split("a/+/+/d"), "ppd");

        // match_many sees the pattern...
        let many: Vec<_> = trie
            .match_many(&split("a/b/c/d"))
            .iter()
            .filter_map(|n| n.value().copied())
            .collect();
        assert_eq!(many, vec!["ppd"]);

        // ...but reaching it needs two substitutions, which match_one never tries.
        assert!(trie.match_one(&split("a/b/c/d")).is_none());

        // Without a misleading exact child the greedy pass gets there.
        assert_eq!(
            trie.match_one(&split("a/q/r/d")).and_then(|n| n.value().copied()),
            Some("ppd")
        );
    }

    #[test]
    fn test_remove() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("a/b/c"), ());
        trie.insert(&split("a/b/c"), ());
        trie.insert(&split("a/b/d"), ());
        trie.insert(&split("a/c/d"), ());
        trie.insert(&split("a/c/f"), ());
        trie.insert(&split("a/c/e"), ());
        assert_eq!(trie.count_nodes(), 5);

        assert_eq!(trie.search_prefix(&split("a/b/c")).refs(), 2);
        assert!(trie.remove(&split("a/b/c")));
        assert_eq!(trie.search_prefix(&split("a/b/c")).refs(), 1);
        assert!(trie.remove(&split("a/b/c")));
        assert_eq!(trie.search_prefix(&split("a/b/c")).depth(), 2);

        // Intermediate nodes are not removable patterns.
        assert!(!trie.remove(&split("a/c")));
        assert_eq!(trie.search_prefix(&split("a/c/f")).depth(), 3);

        assert!(trie.remove(&split("a/c/f")));
        assert_eq!(trie.search_prefix(&split("a/c/f")).depth(), 2);
        assert_eq!(trie.count_nodes(), 3);

        // Unknown paths are a no-op.
        assert!(!trie.remove(&split("x/y")));
        assert!(!trie.remove(&split("a/c/f")));
    }

    #[test]
    fn test_remove_keeps_node_with_children() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("a/b"), ());
        trie.insert(&split("a/b/c"), ());

        assert!(trie.remove(&split("a/b")));
        let node = trie.search_prefix(&split("a/b"));
        assert_eq!(node.depth(), 2);
        assert!(!node.is_terminal());
        assert!(node.topic().is_none());

        assert!(trie.match_many(&split("a/b")).is_empty());
        assert_eq!(trie.match_many(&split("a/b/c")).len(), 1);
    }

    #[test]
    fn test_prune_releases_ancestors() {
        let mut trie = TopicTrie::new();
        trie.insert(&split("a/b/c/d"), ());
        trie.insert(&split("a/x"), ());
        assert_eq!(trie.len(), 6);

        assert!(trie.remove(&split("a/b/c/d")));
        // b, c and d are gone; a survives because of a/x.
        assert_eq!(trie.len(), 3);
        assert_eq!(trie.search_prefix(&split("a/b")).depth(), 1);

        assert!(trie.remove(&split("a/x")));
        assert!(trie.is_empty());

        // Freed slots are reused.
        let id = trie.insert(&split("z"), ());
        assert!(id < 6);
        assert_eq!(trie.node(id).and_then(|n| n.topic()), Some("z"));
    }
}
