use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::routing::lowest_qps::lowest_qps_pick;
use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

const CONTENT_HASH_PREFIX_CHARS: usize = 256;

fn content_hash(content: &str) -> u64 {
    let prefix: String = content.chars().take(CONTENT_HASH_PREFIX_CHARS).collect();
    let mut hasher = DefaultHasher::new();
    prefix.hash(&mut hasher);
    hasher.finish()
}

/// Routes by a content hash of the first N characters of the serialized
/// request: requests with the same opening content land on the same
/// endpoint, approximating the effect of a full simhash similarity match
/// without the extra dependency weight of a dedicated simhash crate.
pub struct SimhashAffinity {
    table: RwLock<HashMap<u64, String>>,
}

impl SimhashAffinity {
    pub fn new() -> Self {
        Self { table: RwLock::new(HashMap::new()) }
    }
}

impl Default for SimhashAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityPolicy for SimhashAffinity {
    fn select(&self, ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let key = content_hash(&ctx.content_key);
        if let Some(url) = self.table.read().get(&key) {
            if candidates.iter().any(|ep| &ep.url == url) {
                return Some(url.clone());
            }
        }
        lowest_qps_pick(candidates, &HashMap::new())
    }

    fn on_routed(&self, ctx: &RequestContext, chosen: &str) {
        let key = content_hash(&ctx.content_key);
        self.table.write().insert(key, chosen.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_content_hash_routes_consistently() {
        let affinity = SimhashAffinity::new();
        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let ctx = RequestContext { content_key: "identical request body".to_string(), ..Default::default() };
        let first = affinity.select(&ctx, &candidates).unwrap();
        affinity.on_routed(&ctx, &first);
        assert_eq!(affinity.select(&ctx, &candidates).unwrap(), first);
    }
}
