use std::collections::HashMap;

use crate::routing::EndpointFilter;
use crate::telemetry::{EngineStats, RequestStats};
use crate::types::Endpoint;

/// Drops candidates whose `num_queuing_requests` sits at or above the
/// configured percentile, i.e. cuts the most backed-up tail of the fleet.
/// Never returns an empty set.
pub struct TopPercentileQueueCutFilter {
    pub percentile: f64,
}

impl TopPercentileQueueCutFilter {
    pub fn new(percentile: f64) -> Self {
        Self { percentile }
    }
}

impl Default for TopPercentileQueueCutFilter {
    fn default() -> Self {
        Self::new(0.9)
    }
}

impl EndpointFilter for TopPercentileQueueCutFilter {
    fn name(&self) -> &'static str {
        "top_percentile_queue_cut"
    }

    fn apply(
        &self,
        candidates: &[Endpoint],
        _request_stats: &HashMap<String, RequestStats>,
        engine_stats: &HashMap<String, EngineStats>,
    ) -> Vec<Endpoint> {
        if candidates.len() <= 1 {
            return candidates.to_vec();
        }
        let mut queue_lengths: Vec<i64> = candidates
            .iter()
            .map(|ep| {
                engine_stats
                    .get(&ep.url)
                    .map(|s| s.num_queuing_requests)
                    .unwrap_or(0)
            })
            .collect();
        queue_lengths.sort_unstable();
        let idx = ((queue_lengths.len() as f64 - 1.0) * self.percentile).round() as usize;
        let cutoff = queue_lengths[idx.min(queue_lengths.len() - 1)];

        let filtered: Vec<Endpoint> = candidates
            .iter()
            .filter(|ep| {
                let q = engine_stats.get(&ep.url).map(|s| s.num_queuing_requests).unwrap_or(0);
                q < cutoff
            })
            .cloned()
            .collect();

        if filtered.is_empty() {
            candidates.to_vec()
        } else {
            filtered
        }
    }
}
