pub mod disaggregated;
pub mod filters;
pub mod kv_aware;
pub mod lowest_qps;
pub mod prefix;
pub mod round_robin;
pub mod session;
pub mod simhash;
pub mod weighted;

use std::collections::HashMap;

use tracing::warn;

use crate::telemetry::{EngineStats, RequestStats};
use crate::types::{Endpoint, EndpointRole};

/// Everything an affinity policy or filter needs to know about the request
/// being routed, besides the candidate endpoint set.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub request_id: String,
    pub model: String,
    pub session_value: Option<String>,
    pub content_key: String,
    pub max_tokens: Option<u64>,
    pub required_role: Option<EndpointRole>,
}

/// Shrinks a candidate set based on load signals. Must never return an empty
/// set: the composing [`Router`] treats an empty result as "this filter
/// would have removed everyone" and reverts to the pre-filter candidates.
pub trait EndpointFilter: Send + Sync {
    fn name(&self) -> &'static str;

    fn apply(
        &self,
        candidates: &[Endpoint],
        request_stats: &HashMap<String, RequestStats>,
        engine_stats: &HashMap<String, EngineStats>,
    ) -> Vec<Endpoint>;
}

/// Maps `(request, candidate set)` to exactly one endpoint URL.
pub trait AffinityPolicy: Send + Sync {
    /// Cheap incremental update run once per request over the (already
    /// filtered) candidate set, before selection.
    fn update(
        &self,
        _candidates: &[Endpoint],
        _request_stats: &HashMap<String, RequestStats>,
        _engine_stats: &HashMap<String, EngineStats>,
    ) {
    }

    fn select(&self, ctx: &RequestContext, candidates: &[Endpoint]) -> Option<String>;

    /// Called after a request has been routed so stateful policies (session
    /// ring, longest-prefix trie, SWRR counters) can record the decision.
    fn on_routed(&self, _ctx: &RequestContext, _chosen: &str) {}
}

/// Ordered filter chain plus one affinity policy, composed exactly the way
/// the router's second-generation `route_request` does: run every filter in
/// order, reverting to the pre-filter set and stopping the chain the moment
/// one would leave zero candidates.
pub struct Router {
    pub filters: Vec<Box<dyn EndpointFilter>>,
    pub affinity: Box<dyn AffinityPolicy>,
}

impl Router {
    pub fn new(filters: Vec<Box<dyn EndpointFilter>>, affinity: Box<dyn AffinityPolicy>) -> Self {
        Self { filters, affinity }
    }

    pub fn route(
        &self,
        all_endpoints: &[Endpoint],
        request_stats: &HashMap<String, RequestStats>,
        engine_stats: &HashMap<String, EngineStats>,
        ctx: &RequestContext,
    ) -> Option<String> {
        let mut candidates: Vec<Endpoint> = all_endpoints
            .iter()
            .filter(|ep| !ep.sleeping && ep.serves(&ctx.model))
            .filter(|ep| ctx.required_role.is_none() || ep.role == ctx.required_role)
            .cloned()
            .collect();

        if candidates.is_empty() {
            return None;
        }

        for filter in &self.filters {
            let previous = candidates.clone();
            candidates = filter.apply(&candidates, request_stats, engine_stats);
            if candidates.is_empty() {
                warn!(
                    filter = filter.name(),
                    "filter removed all endpoints, reverting and stopping the chain"
                );
                candidates = previous;
                break;
            }
        }

        self.affinity.update(&candidates, request_stats, engine_stats);
        let chosen = self.affinity.select(ctx, &candidates)?;
        self.affinity.on_routed(ctx, &chosen);
        Some(chosen)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::round_robin::RoundRobinAffinity;

    fn endpoints(urls: &[&str]) -> Vec<Endpoint> {
        urls.iter()
            .map(|u| Endpoint::new(*u, vec!["opt-125m".to_string()]))
            .collect()
    }

    #[test]
    fn empty_candidate_set_returns_none() {
        let router = Router::new(vec![], Box::new(RoundRobinAffinity::new()));
        let ctx = RequestContext {
            model: "unknown-model".to_string(),
            ..Default::default()
        };
        let eps = endpoints(&["http://a:8000"]);
        assert!(router.route(&eps, &HashMap::new(), &HashMap::new(), &ctx).is_none());
    }

    #[test]
    fn sleeping_endpoints_excluded() {
        let router = Router::new(vec![], Box::new(RoundRobinAffinity::new()));
        let mut eps = endpoints(&["http://a:8000"]);
        eps[0].sleeping = true;
        let ctx = RequestContext {
            model: "opt-125m".to_string(),
            ..Default::default()
        };
        assert!(router.route(&eps, &HashMap::new(), &HashMap::new(), &ctx).is_none());
    }

    struct EmptyingFilter;
    impl EndpointFilter for EmptyingFilter {
        fn name(&self) -> &'static str {
            "emptying"
        }
        fn apply(
            &self,
            _candidates: &[Endpoint],
            _request_stats: &HashMap<String, RequestStats>,
            _engine_stats: &HashMap<String, EngineStats>,
        ) -> Vec<Endpoint> {
            vec![]
        }
    }

    #[test]
    fn filter_that_would_empty_set_is_reverted() {
        let router = Router::new(
            vec![Box::new(EmptyingFilter)],
            Box::new(RoundRobinAffinity::new()),
        );
        let eps = endpoints(&["http://a:8000"]);
        let ctx = RequestContext {
            model: "opt-125m".to_string(),
            ..Default::default()
        };
        let chosen = router.route(&eps, &HashMap::new(), &HashMap::new(), &ctx);
        assert_eq!(chosen.as_deref(), Some("http://a:8000"));
    }
}
