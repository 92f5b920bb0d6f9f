use std::collections::HashMap;

use crate::routing::{AffinityPolicy, RequestContext};
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

/// Picks the candidate with the lowest observed QPS; an endpoint with no
/// stats yet is treated as load 0, so it is preferred over any endpoint with
/// measured traffic.
pub fn lowest_qps_pick(
    candidates: &[Endpoint],
    request_stats: &HashMap<String, RequestStats>,
) -> Option<String> {
    candidates
        .iter()
        .min_by(|a, b| {
            let qa = request_stats.get(&a.url).map(|s| s.qps).unwrap_or(0.0);
            let qb = request_stats.get(&b.url).map(|s| s.qps).unwrap_or(0.0);
            qa.partial_cmp(&qb).unwrap_or(std::cmp::Ordering::Equal).then(a.url.cmp(&b.url))
        })
        .map(|ep| ep.url.clone())
}

/// Affinity wrapper that retains the last `update()`'s request-stats
/// snapshot so `select()` can use it.
pub struct LowestQpsPolicy {
    snapshot: parking_lot::RwLock<HashMap<String, RequestStats>>,
}

impl LowestQpsPolicy {
    pub fn new() -> Self {
        Self { snapshot: parking_lot::RwLock::new(HashMap::new()) }
    }
}

impl Default for LowestQpsPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl AffinityPolicy for LowestQpsPolicy {
    fn update(
        &self,
        _candidates: &[Endpoint],
        request_stats: &HashMap<String, RequestStats>,
        _engine_stats: &HashMap<String, EngineStats>,
    ) {
        *self.snapshot.write() = request_stats.clone();
    }

    fn select(&self, _ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String> {
        lowest_qps_pick(candidates, &self.snapshot.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_with_no_stats_is_preferred() {
        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let mut stats = HashMap::new();
        stats.insert("http://a".to_string(), RequestStats { qps: 5.0, ..Default::default() });
        let picked = lowest_qps_pick(&candidates, &stats);
        assert_eq!(picked.as_deref(), Some("http://b"));
    }

    #[test]
    fn always_returns_argmin_qps() {
        let candidates = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let mut stats = HashMap::new();
        stats.insert("http://a".to_string(), RequestStats { qps: 5.0, ..Default::default() });
        stats.insert("http://b".to_string(), RequestStats { qps: 1.0, ..Default::default() });
        assert_eq!(lowest_qps_pick(&candidates, &stats).as_deref(), Some("http://b"));
    }
}
