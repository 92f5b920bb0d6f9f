use std::collections::HashMap;

use parking_lot::RwLock;

use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

/// Scores each candidate by combining its GPU prefix-cache hit rate (a proxy
/// for "how much of this request's KV state it likely already has") with
/// current load, picking the endpoint with the lowest expected
/// time-to-first-token. Degrades to round-robin-by-load when no stats are
/// available for any candidate.
pub struct KvAwareAffinity {
    engine_stats: RwLock<HashMap<String, EngineStats>>,
    request_stats: RwLock<HashMap<String, RequestStats>>,
}

impl KvAwareAffinity {
    pub fn new() -> Self {
        Self {
            engine_stats: RwLock::new(HashMap::new()),
            request_stats: RwLock::new(HashMap::new()),
        }
    }

    fn score(&self, url: &str) -> f64 {
        let engine = self.engine_stats.read();
        let requests = self.request_stats.read();
        let hit_rate = engine.get(url).map(|s| s.gpu_prefix_cache_hit_rate).unwrap_or(0.0);
        let queue = engine.get(url).map(|s| s.num_queuing_requests as f64).unwrap_or(0.0);
        let running = engine.get(url).map(|s| s.num_running_requests as f64).unwrap_or(0.0);
        let ttft = requests.get(url).map(|s| s.ttft).filter(|v| *v >= 0.0).unwrap_or(0.0);

        // Lower is better: expected TTFT grows with load, shrinks with a
        // cache hit that lets the engine skip recomputing the prefix.
        let load_component = queue * 2.0 + running;
        let cache_bonus = hit_rate * 10.0;
        ttft + load_component - cache_bonus
    }
}

impl Default for KvAwareAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityPolicy for KvAwareAffinity {
    fn update(
        &self,
        _candidates: &[Endpoint],
        request_stats: &HashMap<String, RequestStats>,
        engine_stats: &HashMap<String, EngineStats>,
    ) {
        *self.engine_stats.write() = engine_stats.clone();
        *self.request_stats.write() = request_stats.clone();
    }

    fn select(&self, _ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        candidates
            .iter()
            .min_by(|a, b| {
                self.score(&a.url)
                    .partial_cmp(&self.score(&b.url))
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.url.cmp(&b.url))
            })
            .map(|ep| ep.url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_higher_cache_hit_rate_under_equal_load() {
        let affinity = KvAwareAffinity::new();
        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let mut engine = HashMap::new();
        engine.insert("http://a".to_string(), EngineStats { gpu_prefix_cache_hit_rate: 0.9, ..Default::default() });
        engine.insert("http://b".to_string(), EngineStats { gpu_prefix_cache_hit_rate: 0.1, ..Default::default() });
        affinity.update(&candidates, &HashMap::new(), &engine);
        assert_eq!(
            affinity.select(&RequestContext::default(), &candidates).as_deref(),
            Some("http://a")
        );
    }

    #[test]
    fn degrades_gracefully_with_no_stats() {
        let affinity = KvAwareAffinity::new();
        let candidates = vec![Endpoint::new("http://a", vec!["m".to_string()])];
        assert_eq!(
            affinity.select(&RequestContext::default(), &candidates).as_deref(),
            Some("http://a")
        );
    }
}
