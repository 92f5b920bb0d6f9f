use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::routing::lowest_qps::lowest_qps_pick;
use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::{Endpoint, EndpointRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubStrategy {
    RoundRobin,
    LowestQps,
}

/// Restricts candidates to the role implied by the request kind (a prefill
/// request has `max_tokens == Some(1)`, everything else is decode) and picks
/// among the matching-role subset with a configurable sub-strategy.
pub struct DisaggregatedAffinity {
    sub_strategy: SubStrategy,
    counter: AtomicUsize,
}

impl DisaggregatedAffinity {
    pub fn new(sub_strategy: SubStrategy) -> Self {
        Self { sub_strategy, counter: AtomicUsize::new(0) }
    }

    pub fn infer_role(ctx: &RequestContext) -> EndpointRole {
        if ctx.max_tokens == Some(1) {
            EndpointRole::Prefill
        } else {
            EndpointRole::Decode
        }
    }
}

impl Default for DisaggregatedAffinity {
    fn default() -> Self {
        Self::new(SubStrategy::RoundRobin)
    }
}

impl AffinityPolicy for DisaggregatedAffinity {
    fn update(
        &self,
        _candidates: &[Endpoint],
        _request_stats: &HashMap<String, RequestStats>,
        _engine_stats: &HashMap<String, EngineStats>,
    ) {
    }

    fn select(&self, ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        let role = Self::infer_role(ctx);
        let mut subset: Vec<&Endpoint> = candidates.iter().filter(|ep| ep.role == Some(role)).collect();
        if subset.is_empty() {
            return None;
        }
        subset.sort_by(|a, b| a.url.cmp(&b.url));

        match self.sub_strategy {
            SubStrategy::RoundRobin => {
                let idx = self.counter.fetch_add(1, Ordering::Relaxed) % subset.len();
                Some(subset[idx].url.clone())
            }
            SubStrategy::LowestQps => {
                let owned: Vec<Endpoint> = subset.into_iter().cloned().collect();
                lowest_qps_pick(&owned, &HashMap::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoints() -> Vec<Endpoint> {
        vec![
            Endpoint::new("http://p1", vec!["m".to_string()]).with_role(EndpointRole::Prefill),
            Endpoint::new("http://p2", vec!["m".to_string()]).with_role(EndpointRole::Prefill),
            Endpoint::new("http://d1", vec!["m".to_string()]).with_role(EndpointRole::Decode),
            Endpoint::new("http://d2", vec!["m".to_string()]).with_role(EndpointRole::Decode),
        ]
    }

    #[test]
    fn prefill_request_lands_on_prefill_endpoint() {
        let affinity = DisaggregatedAffinity::new(SubStrategy::RoundRobin);
        let ctx = RequestContext { max_tokens: Some(1), ..Default::default() };
        let chosen = affinity.select(&ctx, &endpoints()).unwrap();
        assert!(chosen.starts_with("http://p"));
    }

    #[test]
    fn decode_request_lands_on_decode_endpoint() {
        let affinity = DisaggregatedAffinity::new(SubStrategy::RoundRobin);
        let ctx = RequestContext { max_tokens: Some(100), ..Default::default() };
        let chosen = affinity.select(&ctx, &endpoints()).unwrap();
        assert!(chosen.starts_with("http://d"));
    }

    #[test]
    fn no_matching_role_returns_none() {
        let affinity = DisaggregatedAffinity::new(SubStrategy::RoundRobin);
        let ctx = RequestContext { max_tokens: Some(1), ..Default::default() };
        let decode_only: Vec<Endpoint> =
            endpoints().into_iter().filter(|ep| ep.role == Some(EndpointRole::Decode)).collect();
        assert!(affinity.select(&ctx, &decode_only).is_none());
    }
}
