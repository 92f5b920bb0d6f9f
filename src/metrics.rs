use prometheus_client::encoding::text::encode;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ServerLabel {
    pub server: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ServerModelLabel {
    pub server: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, EncodeLabelSet)]
pub struct ErrorLabel {
    pub server: String,
    pub model: String,
    pub error_type: String,
}

/// Aggregated Prometheus exposition, matching the field list of the external
/// metrics surface: gauges carrying live load, counters carrying totals.
pub struct Metrics {
    pub registry: Registry,
    pub num_requests_running: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub num_requests_waiting: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub num_requests_swapped: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub current_qps: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub avg_latency: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub avg_itl: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub num_prefill_requests: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub num_decoding_requests: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub gpu_prefix_cache_hit_rate: Family<ServerLabel, Gauge<f64, std::sync::atomic::AtomicU64>>,
    pub healthy_pods_total: Gauge,
    pub input_tokens_total: Family<ServerModelLabel, Counter>,
    pub output_tokens_total: Family<ServerModelLabel, Counter>,
    pub request_errors_total: Family<ErrorLabel, Counter>,
    pub num_incoming_requests: Family<ServerModelLabel, Counter>,
}

macro_rules! register_gauge_family {
    ($registry:expr, $name:literal, $help:literal) => {{
        let family = Family::default();
        $registry.register($name, $help, family.clone());
        family
    }};
}

impl Metrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let num_requests_running =
            register_gauge_family!(registry, "num_requests_running", "Running requests per server");
        let num_requests_waiting =
            register_gauge_family!(registry, "num_requests_waiting", "Waiting requests per server");
        let num_requests_swapped =
            register_gauge_family!(registry, "num_requests_swapped", "Swapped requests per server");
        let current_qps = register_gauge_family!(registry, "current_qps", "Observed QPS per server");
        let avg_latency = register_gauge_family!(registry, "avg_latency", "Average completion latency");
        let avg_itl = register_gauge_family!(registry, "avg_itl", "Average inter-token latency");
        let num_prefill_requests =
            register_gauge_family!(registry, "num_prefill_requests", "In-flight prefill requests");
        let num_decoding_requests =
            register_gauge_family!(registry, "num_decoding_requests", "In-flight decoding requests");
        let gpu_prefix_cache_hit_rate = register_gauge_family!(
            registry,
            "gpu_prefix_cache_hit_rate",
            "GPU prefix cache hit rate"
        );

        let healthy_pods_total = Gauge::default();
        registry.register(
            "healthy_pods_total",
            "Number of healthy backend pods",
            healthy_pods_total.clone(),
        );

        let input_tokens_total = Family::default();
        registry.register("input_tokens_total", "Total input tokens", input_tokens_total.clone());
        let output_tokens_total = Family::default();
        registry.register("output_tokens_total", "Total output tokens", output_tokens_total.clone());
        let request_errors_total = Family::default();
        registry.register(
            "request_errors_total",
            "Total request errors by type",
            request_errors_total.clone(),
        );
        let num_incoming_requests = Family::default();
        registry.register(
            "num_incoming_requests",
            "Total incoming requests",
            num_incoming_requests.clone(),
        );

        Self {
            registry,
            num_requests_running,
            num_requests_waiting,
            num_requests_swapped,
            current_qps,
            avg_latency,
            avg_itl,
            num_prefill_requests,
            num_decoding_requests,
            gpu_prefix_cache_hit_rate,
            healthy_pods_total,
            input_tokens_total,
            output_tokens_total,
            request_errors_total,
            num_incoming_requests,
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
