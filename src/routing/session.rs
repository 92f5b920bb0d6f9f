use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::routing::lowest_qps::lowest_qps_pick;
use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

const VIRTUAL_NODES_PER_ENDPOINT: u32 = 64;

fn hash_u64(value: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

/// A hand-rolled consistent-hash ring (the corpus has no `uhashring`
/// equivalent): a sorted `Vec<(hash, url)>` searched with a binary search,
/// wrapping around to the first entry past the end.
#[derive(Default)]
struct Ring {
    points: Vec<(u64, String)>,
}

impl Ring {
    fn rebuild(&mut self, urls: &[String]) {
        let mut points = Vec::with_capacity(urls.len() * VIRTUAL_NODES_PER_ENDPOINT as usize);
        for url in urls {
            for vnode in 0..VIRTUAL_NODES_PER_ENDPOINT {
                let key = format!("{url}#{vnode}");
                points.push((hash_u64(&key), url.clone()));
            }
        }
        points.sort_by_key(|(h, _)| *h);
        self.points = points;
    }

    /// Walks the ring starting at `key`'s hash until it finds an entry whose
    /// URL is present in `allowed`.
    fn lookup(&self, key: &str, allowed: &std::collections::HashSet<&str>) -> Option<String> {
        if self.points.is_empty() {
            return None;
        }
        let target = hash_u64(key);
        let start = self
            .points
            .partition_point(|(h, _)| *h < target);
        for offset in 0..self.points.len() {
            let idx = (start + offset) % self.points.len();
            let (_, url) = &self.points[idx];
            if allowed.contains(url.as_str()) {
                return Some(url.clone());
            }
        }
        None
    }
}

/// Routes by a configured header/session key via a consistent-hash ring. If
/// the request carries no session value, falls back to lowest-QPS among the
/// candidates.
pub struct SessionAffinity {
    ring: Arc<RwLock<Ring>>,
}

impl SessionAffinity {
    pub fn new() -> Self {
        Self { ring: Arc::new(RwLock::new(Ring::default())) }
    }
}

impl Default for SessionAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityPolicy for SessionAffinity {
    fn update(
        &self,
        candidates: &[Endpoint],
        _request_stats: &HashMap<String, RequestStats>,
        _engine_stats: &HashMap<String, EngineStats>,
    ) {
        let urls: Vec<String> = candidates.iter().map(|ep| ep.url.clone()).collect();
        self.ring.write().rebuild(&urls);
    }

    fn select(&self, ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        let Some(session_value) = &ctx.session_value else {
            return lowest_qps_pick(candidates, &HashMap::new());
        };
        let allowed: std::collections::HashSet<&str> =
            candidates.iter().map(|ep| ep.url.as_str()).collect();
        self.ring.read().lookup(session_value, &allowed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates() -> Vec<Endpoint> {
        vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ]
    }

    #[test]
    fn same_session_always_routes_to_same_endpoint() {
        let affinity = SessionAffinity::new();
        affinity.update(&candidates(), &HashMap::new(), &HashMap::new());
        let ctx = RequestContext {
            session_value: Some("alice".to_string()),
            ..Default::default()
        };
        let first = affinity.select(&ctx, &candidates()).unwrap();
        for _ in 0..10 {
            assert_eq!(affinity.select(&ctx, &candidates()).unwrap(), first);
        }
    }

    #[test]
    fn removing_the_chosen_endpoint_routes_elsewhere() {
        let affinity = SessionAffinity::new();
        affinity.update(&candidates(), &HashMap::new(), &HashMap::new());
        let ctx = RequestContext {
            session_value: Some("alice".to_string()),
            ..Default::default()
        };
        let first = affinity.select(&ctx, &candidates()).unwrap();
        let remaining: Vec<Endpoint> = candidates().into_iter().filter(|ep| ep.url != first).collect();
        affinity.update(&remaining, &HashMap::new(), &HashMap::new());
        let second = affinity.select(&ctx, &remaining).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_session_value_falls_back_to_lowest_qps() {
        let affinity = SessionAffinity::new();
        affinity.update(&candidates(), &HashMap::new(), &HashMap::new());
        let ctx = RequestContext::default();
        assert!(affinity.select(&ctx, &candidates()).is_some());
    }
}
