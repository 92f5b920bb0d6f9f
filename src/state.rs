use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::discovery::ServiceDiscovery;
use crate::metrics::Metrics;
use crate::proxy::Proxy;
use crate::queue::AdmissionQueue;
use crate::routing::Router;
use crate::telemetry::{EngineStatsScraper, RequestStatsMonitor};

pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Process-wide shared context, constructed once at startup and handed to
/// every HTTP handler read-only. Replaces the original's module-level
/// singletons (`get_service_discovery()`, `get_routing_logic()`, ...) with an
/// explicit object passed by construction.
pub struct AppState {
    pub discovery: Arc<dyn ServiceDiscovery>,
    pub engine_stats: Arc<EngineStatsScraper>,
    pub request_stats: Arc<RequestStatsMonitor>,
    pub router: Arc<Router>,
    pub proxy: Arc<Proxy>,
    pub metrics: Arc<Metrics>,
    pub queue: Option<Arc<AdmissionQueue>>,
    /// Requests currently waiting on an admission decision, keyed by
    /// `request_id`. The scheduler's dispatch-channel consumer resolves each
    /// sender once the per-endpoint queue admits that request.
    pub admission_waiters: Arc<Mutex<HashMap<String, oneshot::Sender<String>>>>,
    pub cancel: CancellationToken,
    pub session_header: Option<String>,
}

impl AppState {
    pub fn healthy(&self) -> bool {
        self.discovery.healthy()
    }
}
