use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{info, warn};

/// Per-engine load signals scraped from its Prometheus text exposition.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EngineStats {
    pub num_running_requests: i64,
    pub num_queuing_requests: i64,
    pub gpu_prefix_cache_hit_rate: f64,
    pub gpu_cache_usage_perc: f64,
}

impl EngineStats {
    /// Parses the four fields this router cares about out of a Prometheus
    /// text-format scrape. Unknown metric families are ignored; a field that
    /// never appears keeps its zero default, mirroring the Python parser
    /// this is grounded on. An unparseable scrape yields all defaults rather
    /// than erroring, since a single malformed scrape shouldn't take an
    /// otherwise-healthy endpoint's stats offline.
    pub fn from_scrape(text: &str) -> Self {
        let mut stats = EngineStats::default();
        let lines = text.lines().map(|line| Ok(line.to_string()));
        let Ok(scrape) = prometheus_parse::Scrape::parse(lines) else {
            return stats;
        };
        for sample in scrape.samples {
            let value = match sample.value {
                prometheus_parse::Value::Counter(v) => v,
                prometheus_parse::Value::Gauge(v) => v,
                prometheus_parse::Value::Untyped(v) => v,
                _ => continue,
            };
            match sample.metric.as_str() {
                "vllm:num_requests_running" => stats.num_running_requests = value as i64,
                "vllm:num_requests_waiting" => stats.num_queuing_requests = value as i64,
                "vllm:gpu_prefix_cache_hit_rate" => stats.gpu_prefix_cache_hit_rate = value,
                "vllm:gpu_cache_usage_perc" => stats.gpu_cache_usage_perc = value,
                _ => {}
            }
        }
        stats
    }
}

/// Periodically pulls `{endpoint}/metrics` from every currently discovered
/// endpoint in parallel and keeps the latest snapshot per URL.
pub struct EngineStatsScraper {
    client: reqwest::Client,
    stats: Arc<RwLock<HashMap<String, EngineStats>>>,
    scrape_interval: Duration,
}

impl EngineStatsScraper {
    pub fn new(scrape_interval: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            stats: Arc::new(RwLock::new(HashMap::new())),
            scrape_interval,
        }
    }

    pub fn stats_handle(&self) -> Arc<RwLock<HashMap<String, EngineStats>>> {
        self.stats.clone()
    }

    pub fn get_engine_stats(&self) -> HashMap<String, EngineStats> {
        self.stats.read().clone()
    }

    async fn scrape_one(client: &reqwest::Client, url: &str, timeout: Duration) -> Option<EngineStats> {
        let metrics_url = format!("{url}/metrics");
        match client.get(&metrics_url).timeout(timeout).send().await {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(text) => Some(EngineStats::from_scrape(&text)),
                Err(e) => {
                    warn!(%url, error = %e, "failed reading metrics body");
                    None
                }
            },
            Ok(resp) => {
                warn!(%url, status = %resp.status(), "metrics scrape returned non-2xx");
                None
            }
            Err(e) => {
                warn!(%url, error = %e, "metrics scrape failed");
                None
            }
        }
    }

    /// Scrapes every URL in `urls` once, replacing the stats map with exactly
    /// the endpoints that answered successfully -- endpoints that vanished
    /// from discovery or failed to answer are evicted.
    pub async fn scrape_once(&self, urls: &[String]) {
        let timeout = self.scrape_interval / 2;
        let futures = urls.iter().map(|url| {
            let client = self.client.clone();
            let url = url.clone();
            async move {
                let stats = Self::scrape_one(&client, &url, timeout).await;
                (url, stats)
            }
        });
        let results = futures::future::join_all(futures).await;

        let mut map = self.stats.write();
        map.clear();
        for (url, stats) in results {
            if let Some(stats) = stats {
                map.insert(url, stats);
            }
        }
    }

    /// Runs the periodic scrape loop until `cancel` fires.
    pub async fn run(
        &self,
        urls_provider: impl Fn() -> Vec<String>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.scrape_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("engine stats scraper shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let urls = urls_provider();
                    self.scrape_once(&urls).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vllm_scrape_text() {
        let scrape = "\
# HELP vllm:num_requests_running running
vllm:num_requests_running{model_name=\"opt\"} 7
vllm:num_requests_waiting{model_name=\"opt\"} 2
vllm:gpu_prefix_cache_hit_rate{model_name=\"opt\"} 0.8
vllm:gpu_cache_usage_perc{model_name=\"opt\"} 0.5
";
        let stats = EngineStats::from_scrape(scrape);
        assert_eq!(stats.num_running_requests, 7);
        assert_eq!(stats.num_queuing_requests, 2);
        assert!((stats.gpu_prefix_cache_hit_rate - 0.8).abs() < f64::EPSILON);
        assert!((stats.gpu_cache_usage_perc - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn ignores_unknown_metric_families() {
        let scrape = "some_other_metric 42\n";
        let stats = EngineStats::from_scrape(scrape);
        assert_eq!(stats, EngineStats::default());
    }

    #[tokio::test]
    async fn scrape_once_evicts_unreachable_endpoints() {
        let scraper = EngineStatsScraper::new(Duration::from_millis(50));
        scraper
            .scrape_once(&["http://127.0.0.1:1".to_string()])
            .await;
        assert!(scraper.get_engine_stats().is_empty());
    }
}
