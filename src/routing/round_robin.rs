use std::sync::atomic::{AtomicUsize, Ordering};

use crate::routing::{AffinityPolicy, RequestContext};
use crate::types::Endpoint;

/// Hands out the candidate at `counter % len`, sorted by URL so the sequence
/// is deterministic across calls.
pub struct RoundRobinAffinity {
    counter: AtomicUsize,
}

impl RoundRobinAffinity {
    pub fn new() -> Self {
        Self { counter: AtomicUsize::new(0) }
    }
}

impl Default for RoundRobinAffinity {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityPolicy for RoundRobinAffinity {
    fn select(&self, _ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut sorted: Vec<&Endpoint> = candidates.iter().collect();
        sorted.sort_by(|a, b| a.url.cmp(&b.url));
        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % sorted.len();
        Some(sorted[idx].url.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycles_through_candidates_in_url_order() {
        let affinity = RoundRobinAffinity::new();
        let candidates = vec![
            Endpoint::new("http://b", vec!["m".to_string()]),
            Endpoint::new("http://a", vec!["m".to_string()]),
        ];
        let ctx = RequestContext::default();
        let picks: Vec<String> = (0..4)
            .map(|_| affinity.select(&ctx, &candidates).unwrap())
            .collect();
        assert_eq!(picks, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn even_distribution_over_k_times_n_requests() {
        let affinity = RoundRobinAffinity::new();
        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
            Endpoint::new("http://c", vec!["m".to_string()]),
        ];
        let ctx = RequestContext::default();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..30 {
            let pick = affinity.select(&ctx, &candidates).unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        for count in counts.values() {
            assert_eq!(*count, 10);
        }
    }
}
