use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::seq::IteratorRandom;

use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

/// Tuning knobs, grounded on `prefix/config.py`'s `HashTrieConfig`.
#[derive(Debug, Clone, Copy)]
pub struct HashTrieConfig {
    pub chunk_size: usize,
    pub max_memory_mb: u64,
    pub eviction_threshold: f64,
    pub target_utilization: f64,
}

impl Default for HashTrieConfig {
    fn default() -> Self {
        Self {
            chunk_size: 128,
            max_memory_mb: 512,
            eviction_threshold: 0.9,
            target_utilization: 0.7,
        }
    }
}

type NodeId = u64;

struct TrieNode {
    children: HashMap<u64, NodeId>,
    endpoints: HashSet<String>,
    parent: Option<NodeId>,
    parent_edge: Option<u64>,
}

impl TrieNode {
    fn new(parent: Option<NodeId>, parent_edge: Option<u64>) -> Self {
        Self {
            children: HashMap::new(),
            endpoints: HashSet::new(),
            parent,
            parent_edge,
        }
    }
}

/// Longest-prefix hash trie with approximate LRU eviction. Each insert walks
/// hashed fixed-size chunks of the request content, tagging every node on
/// the path with the chosen endpoint; lookup walks the same path and returns
/// the deepest node whose endpoint set still intersects the live candidates.
///
/// Node identity is a `u64` arena index rather than a pointer so the whole
/// structure lives behind one lock without self-referential borrows; real
/// production tries at this depth use the same arena trick to dodge
/// `Rc<RefCell<_>>` cycles.
struct Trie {
    nodes: HashMap<NodeId, TrieNode>,
    next_id: NodeId,
    root: NodeId,
    lru: VecDeque<NodeId>,
    config: HashTrieConfig,
    estimated_bytes: u64,
}

const BYTES_PER_NODE_ESTIMATE: u64 = 256;

impl Trie {
    fn new(config: HashTrieConfig) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(0, TrieNode::new(None, None));
        Self {
            nodes,
            next_id: 1,
            root: 0,
            lru: VecDeque::new(),
            config,
            estimated_bytes: 0,
        }
    }

    fn chunk_hashes(&self, content: &str) -> Vec<u64> {
        content
            .as_bytes()
            .chunks(self.config.chunk_size)
            .map(|chunk| {
                let mut hasher = DefaultHasher::new();
                chunk.hash(&mut hasher);
                hasher.finish()
            })
            .collect()
    }

    fn touch(&mut self, id: NodeId) {
        self.lru.retain(|&n| n != id);
        self.lru.push_back(id);
    }

    fn insert(&mut self, content: &str, endpoint: &str) {
        if self.config.max_memory_mb == 0 {
            return;
        }
        let mut node = self.root;
        self.nodes.get_mut(&node).unwrap().endpoints.insert(endpoint.to_string());

        for hash in self.chunk_hashes(content) {
            let child = self.nodes.get(&node).unwrap().children.get(&hash).copied();
            node = match child {
                Some(existing) => existing,
                None => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.nodes.insert(id, TrieNode::new(Some(node), Some(hash)));
                    self.nodes.get_mut(&node).unwrap().children.insert(hash, id);
                    self.estimated_bytes += BYTES_PER_NODE_ESTIMATE;
                    id
                }
            };
            self.nodes.get_mut(&node).unwrap().endpoints.insert(endpoint.to_string());
            self.touch(node);
        }

        self.maybe_evict();
    }

    fn maybe_evict(&mut self) {
        let threshold_bytes =
            (self.config.max_memory_mb as f64 * 1024.0 * 1024.0 * self.config.eviction_threshold) as u64;
        if self.estimated_bytes <= threshold_bytes {
            return;
        }
        let target_bytes =
            (self.config.max_memory_mb as f64 * 1024.0 * 1024.0 * self.config.target_utilization) as u64;
        while self.estimated_bytes > target_bytes {
            let Some(victim) = self.lru.pop_front() else { break };
            if victim == self.root {
                continue;
            }
            self.evict_node(victim);
        }
    }

    fn evict_node(&mut self, id: NodeId) {
        if let Some(node) = self.nodes.remove(&id) {
            if let (Some(parent), Some(edge)) = (node.parent, node.parent_edge) {
                if let Some(parent_node) = self.nodes.get_mut(&parent) {
                    parent_node.children.remove(&edge);
                }
            }
            self.estimated_bytes = self.estimated_bytes.saturating_sub(BYTES_PER_NODE_ESTIMATE);
        }
    }

    fn longest_prefix_match(&self, content: &str, allowed: &HashSet<&str>) -> HashSet<String> {
        let mut node = self.root;
        let mut selected: HashSet<String> = allowed.iter().map(|s| s.to_string()).collect();

        for hash in self.chunk_hashes(content) {
            let Some(&child) = self.nodes.get(&node).and_then(|n| n.children.get(&hash)) else {
                break;
            };
            let Some(child_node) = self.nodes.get(&child) else { break };
            let intersection: HashSet<String> =
                child_node.endpoints.intersection(&selected).cloned().collect();
            if intersection.is_empty() {
                break;
            }
            selected = intersection;
            node = child;
        }

        selected
    }
}

/// Affinity policy wrapping the [`Trie`] behind one lock; ties among
/// surviving endpoints at the deepest matched node are broken at random.
pub struct PrefixAffinity {
    trie: Arc<Mutex<Trie>>,
}

impl PrefixAffinity {
    pub fn new(config: HashTrieConfig) -> Self {
        Self { trie: Arc::new(Mutex::new(Trie::new(config))) }
    }
}

impl Default for PrefixAffinity {
    fn default() -> Self {
        Self::new(HashTrieConfig::default())
    }
}

impl AffinityPolicy for PrefixAffinity {
    fn update(
        &self,
        _candidates: &[Endpoint],
        _request_stats: &HashMap<String, RequestStats>,
        _engine_stats: &HashMap<String, EngineStats>,
    ) {
    }

    fn select(&self, ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let allowed: HashSet<&str> = candidates.iter().map(|ep| ep.url.as_str()).collect();
        let matched = self.trie.lock().longest_prefix_match(&ctx.content_key, &allowed);
        let mut rng = rand::thread_rng();
        matched
            .into_iter()
            .filter(|url| allowed.contains(url.as_str()))
            .choose(&mut rng)
            .or_else(|| candidates.first().map(|ep| ep.url.clone()))
    }

    fn on_routed(&self, ctx: &RequestContext, chosen: &str) {
        self.trie.lock().insert(&ctx.content_key, chosen);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_prefix_routes_to_same_endpoint() {
        let affinity = PrefixAffinity::new(HashTrieConfig { chunk_size: 8, ..Default::default() });
        let ctx1 = RequestContext {
            content_key: "hello world this is a long shared prefix".to_string(),
            ..Default::default()
        };
        affinity.on_routed(&ctx1, "http://a");

        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let ctx2 = RequestContext {
            content_key: "hello world this is a long shared prefix but different tail".to_string(),
            ..Default::default()
        };
        assert_eq!(affinity.select(&ctx2, &candidates).as_deref(), Some("http://a"));
    }

    #[test]
    fn zero_memory_cap_yields_empty_trie() {
        let affinity = PrefixAffinity::new(HashTrieConfig { max_memory_mb: 0, ..Default::default() });
        affinity.on_routed(&RequestContext { content_key: "abc".to_string(), ..Default::default() }, "http://a");
        assert!(affinity.trie.lock().nodes.len() == 1);
    }
}
