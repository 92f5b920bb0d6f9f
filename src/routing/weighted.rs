use std::collections::HashMap;

use parking_lot::Mutex;

use crate::routing::{AffinityPolicy, RequestContext};
use crate::types::Endpoint;

struct SwrrState {
    weight: i64,
    current: i64,
}

/// Standard Smooth Weighted Round Robin: each selection adds every
/// endpoint's static weight to its running total, picks the max, then
/// subtracts the sum of all weights from the winner. URLs with no configured
/// weight default to 1.
pub struct WeightedAffinity {
    weights: HashMap<String, i64>,
    state: Mutex<HashMap<String, SwrrState>>,
}

impl WeightedAffinity {
    pub fn new(weights: HashMap<String, u32>) -> Self {
        Self {
            weights: weights.into_iter().map(|(k, v)| (k, v as i64)).collect(),
            state: Mutex::new(HashMap::new()),
        }
    }

    fn weight_of(&self, url: &str) -> i64 {
        self.weights.get(url).copied().unwrap_or(1)
    }
}

impl AffinityPolicy for WeightedAffinity {
    fn select(&self, _ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        if candidates.is_empty() {
            return None;
        }
        let mut state = self.state.lock();
        let total: i64 = candidates.iter().map(|ep| self.weight_of(&ep.url)).sum();

        let mut best_url: Option<String> = None;
        let mut best_current = i64::MIN;
        for ep in candidates {
            let weight = self.weight_of(&ep.url);
            let entry = state.entry(ep.url.clone()).or_insert(SwrrState { weight, current: 0 });
            entry.weight = weight;
            entry.current += weight;
            if entry.current > best_current {
                best_current = entry.current;
                best_url = Some(ep.url.clone());
            }
        }

        if let Some(url) = &best_url {
            if let Some(entry) = state.get_mut(url) {
                entry.current -= total;
            }
        }
        best_url
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_matches_configured_weights() {
        let mut weights = HashMap::new();
        weights.insert("http://a".to_string(), 51);
        weights.insert("http://b".to_string(), 27);
        weights.insert("http://c".to_string(), 22);
        let affinity = WeightedAffinity::new(weights);

        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
            Endpoint::new("http://c", vec!["m".to_string()]),
        ];
        let ctx = RequestContext::default();
        let mut counts: HashMap<String, u32> = HashMap::new();
        for _ in 0..1000 {
            let pick = affinity.select(&ctx, &candidates).unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        let pct_a = counts["http://a"] as f64 / 1000.0 * 100.0;
        let pct_b = counts["http://b"] as f64 / 1000.0 * 100.0;
        let pct_c = counts["http://c"] as f64 / 1000.0 * 100.0;
        assert!((pct_a - 51.0).abs() <= 5.0, "a={pct_a}");
        assert!((pct_b - 27.0).abs() <= 5.0, "b={pct_b}");
        assert!((pct_c - 22.0).abs() <= 5.0, "c={pct_c}");
    }

    #[test]
    fn unknown_url_defaults_to_weight_one() {
        let affinity = WeightedAffinity::new(HashMap::new());
        let candidates = vec![Endpoint::new("http://a", vec!["m".to_string()])];
        let ctx = RequestContext::default();
        assert_eq!(affinity.select(&ctx, &candidates).as_deref(), Some("http://a"));
    }
}
