use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde::Deserialize;

/// Which affinity policy the router composes with its endpoint filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum RoutingLogic {
    RoundRobin,
    Session,
    Prefix,
    Simhash,
    LowestQps,
    Weighted,
    KvAware,
    Disaggregated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServiceDiscoveryKind {
    Static,
    K8s,
}

/// CLI surface for the router. Invalid combinations (e.g. `static` discovery
/// without `--static-backends`) are rejected by [`Args::validate`] before any
/// subsystem starts.
#[derive(Debug, Parser, Clone)]
#[command(name = "llm-router", about = "OpenAI-compatible inference request router")]
pub struct Args {
    #[arg(long, env = "ROUTER_HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "ROUTER_PORT", default_value_t = 8000)]
    pub port: u16,

    #[arg(long, value_enum, env = "ROUTER_SERVICE_DISCOVERY")]
    pub service_discovery: ServiceDiscoveryKind,

    /// Comma-separated backend URLs, static discovery only.
    #[arg(long, env = "ROUTER_STATIC_BACKENDS")]
    pub static_backends: Option<String>,

    /// Comma-separated model names, aligned positionally with `--static-backends`.
    #[arg(long, env = "ROUTER_STATIC_MODELS")]
    pub static_models: Option<String>,

    /// Comma-separated role labels (e.g. `prefill,decode`), aligned with `--static-backends`.
    #[arg(long, env = "ROUTER_STATIC_ROLES")]
    pub static_roles: Option<String>,

    /// `alias:canonical,...` pairs rewritten onto the request body's `model` field.
    #[arg(long, env = "ROUTER_STATIC_ALIASES")]
    pub static_aliases: Option<String>,

    #[arg(long, env = "ROUTER_K8S_NAMESPACE")]
    pub k8s_namespace: Option<String>,

    #[arg(long, env = "ROUTER_K8S_LABEL_SELECTOR")]
    pub k8s_label_selector: Option<String>,

    #[arg(long, value_enum, env = "ROUTER_ROUTING_LOGIC", default_value = "round-robin")]
    pub routing_logic: RoutingLogic,

    #[arg(long, env = "ROUTER_SESSION_KEY")]
    pub session_key: Option<String>,

    #[arg(long, env = "ROUTER_ENGINE_STATS_INTERVAL", default_value_t = 10.0)]
    pub engine_stats_interval: f64,

    #[arg(long, env = "ROUTER_REQUEST_STATS_WINDOW", default_value_t = 60.0)]
    pub request_stats_window: f64,

    #[arg(long, env = "ROUTER_LOG_STATS", default_value_t = false)]
    pub log_stats: bool,

    #[arg(long, env = "ROUTER_LOG_STATS_INTERVAL", default_value_t = 30.0)]
    pub log_stats_interval: f64,

    #[arg(long, env = "ROUTER_MAX_FAILOVER_ATTEMPTS", default_value_t = 1)]
    pub max_failover_attempts: u32,

    #[arg(long, env = "ROUTER_ENABLE_QUEUE", default_value_t = false)]
    pub enable_queue: bool,

    /// Optional YAML file merged over the CLI for anything not expressible
    /// as a flag (per-routing-logic knobs such as hash-trie memory tuning).
    #[arg(long, env = "ROUTER_ROUTING_CONFIG")]
    pub routing_config: Option<PathBuf>,

    /// Bind address for the KV-ready side channel, `--routing-logic=disaggregated` only.
    #[arg(long, env = "ROUTER_KV_SIDECAR_ADDR", default_value = "0.0.0.0:7000")]
    pub kv_sidecar_addr: String,

    #[arg(long, env = "ROUTER_KV_RECEIVER_HOST", default_value = "0.0.0.0")]
    pub kv_receiver_host: String,

    #[arg(long, env = "ROUTER_KV_RECEIVER_INIT_PORT", default_value_t = 21001)]
    pub kv_receiver_init_port: u16,

    #[arg(long, env = "ROUTER_KV_RECEIVER_ALLOC_PORT", default_value_t = 21002)]
    pub kv_receiver_alloc_port: u16,

    #[arg(long, env = "ROUTER_KV_WAIT_TIMEOUT_SECS", default_value_t = 5.0)]
    pub kv_wait_timeout_secs: f64,
}

/// Overlay loaded from `--routing-config`; every field is optional and, when
/// present, overrides the CLI-derived default of the same name.
#[derive(Debug, Default, Deserialize, Clone)]
pub struct RoutingConfigFile {
    pub weights: Option<HashMap<String, u32>>,
    pub hashtrie_chunk_size: Option<usize>,
    pub hashtrie_max_memory_mb: Option<u64>,
    pub hashtrie_eviction_threshold: Option<f64>,
    pub hashtrie_target_utilization: Option<f64>,
    pub top_percentile_cut: Option<f64>,
    pub max_queue_wait_time_secs: Option<f64>,
}

impl Args {
    pub fn validate(&self) -> Result<()> {
        match self.service_discovery {
            ServiceDiscoveryKind::Static => {
                if self.static_backends.is_none() {
                    bail!("--static-backends is required when --service-discovery=static");
                }
            }
            ServiceDiscoveryKind::K8s => {
                if self.k8s_namespace.is_none() {
                    bail!("--k8s-namespace is required when --service-discovery=k8s");
                }
            }
        }
        if matches!(self.routing_logic, RoutingLogic::Session) && self.session_key.is_none() {
            bail!("--session-key is required when --routing-logic=session");
        }
        Ok(())
    }

    pub fn load_routing_config(&self) -> Result<RoutingConfigFile> {
        let Some(path) = &self.routing_config else {
            return Ok(RoutingConfigFile::default());
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading routing config {}", path.display()))?;
        let parsed: RoutingConfigFile = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing routing config {}", path.display()))?;
        Ok(parsed)
    }
}

pub fn parse_static_urls(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

pub fn parse_static_aliases(raw: &str) -> HashMap<String, String> {
    let mut aliases = HashMap::new();
    for pair in raw.split(',') {
        if let Some((alias, model)) = pair.split_once(':') {
            aliases.insert(alias.trim().to_string(), model.trim().to_string());
        }
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_static_aliases() {
        let aliases = parse_static_aliases("gpt-4:llama-3-70b,gpt-3.5:llama-3-8b");
        assert_eq!(aliases.get("gpt-4").map(String::as_str), Some("llama-3-70b"));
        assert_eq!(aliases.get("gpt-3.5").map(String::as_str), Some("llama-3-8b"));
    }

    #[test]
    fn parses_static_urls_trims_whitespace() {
        let urls = parse_static_urls("http://a:8000, http://b:8000 ,");
        assert_eq!(urls, vec!["http://a:8000", "http://b:8000"]);
    }
}
