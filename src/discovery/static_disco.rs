use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use md5::{Digest, Md5};
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::discovery::ServiceDiscovery;
use crate::types::Endpoint;

/// The kind of OpenAI-compatible endpoint a model is served under, used to
/// pick a tiny health-probe payload.
#[derive(Debug, Clone, Copy)]
pub enum ModelType {
    Chat,
    Completion,
    Embeddings,
}

impl ModelType {
    fn path(self) -> &'static str {
        match self {
            ModelType::Chat => "/v1/chat/completions",
            ModelType::Completion => "/v1/completions",
            ModelType::Embeddings => "/v1/embeddings",
        }
    }

    fn probe_body(self, model: &str) -> serde_json::Value {
        match self {
            ModelType::Chat => serde_json::json!({
                "model": model,
                "messages": [{"role": "user", "content": "Hello"}],
                "max_tokens": 3,
            }),
            ModelType::Completion => serde_json::json!({"model": model, "prompt": "Hello", "max_tokens": 3}),
            ModelType::Embeddings => serde_json::json!({"model": model, "input": "Hello"}),
        }
    }
}

fn unhealthy_hash(url: &str, model: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(url.as_bytes());
    hasher.update(model.as_bytes());
    hex::encode(hasher.finalize())
}

/// A fixed list of backend URLs, each serving a known, static set of models.
/// Optionally runs a periodic health probe per `(url, model)` tuple.
pub struct StaticServiceDiscovery {
    endpoints: RwLock<Vec<Endpoint>>,
    unhealthy: RwLock<HashSet<String>>,
    client: reqwest::Client,
    health_check_interval: Duration,
    probe_model_type: ModelType,
    running: AtomicBool,
}

impl StaticServiceDiscovery {
    pub fn new(endpoints: Vec<Endpoint>, health_check_interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            endpoints: RwLock::new(endpoints),
            unhealthy: RwLock::new(HashSet::new()),
            client: reqwest::Client::new(),
            health_check_interval,
            probe_model_type: ModelType::Chat,
            running: AtomicBool::new(true),
        })
    }

    async fn probe_one(&self, url: &str, model: &str) -> bool {
        let target = format!("{url}{}", self.probe_model_type.path());
        let body = self.probe_model_type.probe_body(model);
        match self
            .client
            .post(&target)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await
        {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                warn!(%url, %model, error = %e, "health probe failed");
                false
            }
        }
    }

    /// Runs the periodic health-check loop until `cancel` fires.
    pub async fn run_health_checks(self: Arc<Self>, cancel: tokio_util::sync::CancellationToken) {
        let mut ticker = tokio::time::interval(self.health_check_interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("static discovery health checker shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let tuples: Vec<(String, String)> = {
                        let endpoints = self.endpoints.read();
                        endpoints
                            .iter()
                            .flat_map(|ep| ep.models.iter().map(move |m| (ep.url.clone(), m.clone())))
                            .collect()
                    };
                    let mut newly_unhealthy = HashSet::new();
                    for (url, model) in tuples {
                        if !self.probe_one(&url, &model).await {
                            newly_unhealthy.insert(unhealthy_hash(&url, &model));
                        }
                    }
                    *self.unhealthy.write() = newly_unhealthy;
                }
            }
        }
    }
}

#[async_trait]
impl ServiceDiscovery for StaticServiceDiscovery {
    fn snapshot(&self) -> Vec<Endpoint> {
        let unhealthy = self.unhealthy.read();
        self.endpoints
            .read()
            .iter()
            .map(|ep| {
                let mut ep = ep.clone();
                ep.models
                    .retain(|model| !unhealthy.contains(&unhealthy_hash(&ep.url, model)));
                ep
            })
            .filter(|ep| !ep.models.is_empty())
            .collect()
    }

    fn remove_endpoint_by_url(&self, url: &str) {
        self.endpoints.write().retain(|ep| ep.url != url);
    }

    fn set_sleep(&self, id: &str, sleeping: bool) {
        let mut endpoints = self.endpoints.write();
        if let Some(ep) = endpoints
            .iter_mut()
            .find(|ep| ep.url == id || ep.pod_name.as_deref() == Some(id))
        {
            ep.sleeping = sleeping;
        }
    }

    fn healthy(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.running.store(false, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_filters_unhealthy_tuples() {
        let disco = StaticServiceDiscovery::new(
            vec![Endpoint::new("http://a:8000", vec!["opt-125m".to_string()])],
            Duration::from_secs(5),
        );
        disco
            .unhealthy
            .write()
            .insert(unhealthy_hash("http://a:8000", "opt-125m"));
        assert!(disco.snapshot().is_empty());
    }

    #[test]
    fn remove_endpoint_by_url_retires_it() {
        let disco = StaticServiceDiscovery::new(
            vec![Endpoint::new("http://a:8000", vec!["opt-125m".to_string()])],
            Duration::from_secs(5),
        );
        disco.remove_endpoint_by_url("http://a:8000");
        assert!(disco.snapshot().is_empty());
    }
}
