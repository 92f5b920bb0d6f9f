use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::telemetry::{EngineStatsScraper, RequestStatsMonitor};

/// Supplemented from the original project's `stats/log_stats.py`: a periodic
/// aggregate stats line independent of the Prometheus scrape interval, gated
/// by `--log-stats`. Ambient observability, not a named feature Non-goal.
pub async fn run(
    engine_stats: Arc<EngineStatsScraper>,
    request_stats: Arc<RequestStatsMonitor>,
    interval: Duration,
    now_fn: impl Fn() -> f64,
    cancel: tokio_util::sync::CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                let engine = engine_stats.get_engine_stats();
                let requests = request_stats.get_stats(now_fn());
                for (url, stats) in &engine {
                    let req = requests.get(url).copied().unwrap_or_default();
                    info!(
                        url = %url,
                        running = stats.num_running_requests,
                        queuing = stats.num_queuing_requests,
                        qps = req.qps,
                        avg_latency = req.avg_latency,
                        "engine stats"
                    );
                }
            }
        }
    }
}
