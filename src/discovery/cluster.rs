use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::sync::Semaphore;
use tracing::{info, warn};

use crate::discovery::ServiceDiscovery;
use crate::types::Endpoint;

/// One raw watch event as delivered by the underlying pod watch source. This
/// crate does not embed a Kubernetes client (none is present anywhere in the
/// pack's dependency corpus); `PodEvent` is the narrow interface a real
/// watch source is expected to drive, matching the semantics of
/// `K8sServiceDiscovery`'s watch loop.
#[derive(Debug, Clone)]
pub enum PodEvent {
    AddedOrModified {
        pod_name: String,
        ip: String,
        port: u16,
        ready: bool,
    },
    Deleted {
        pod_name: String,
    },
}

/// Anything that can produce a stream of [`PodEvent`]s, e.g. a Kubernetes
/// watch, a static test fixture, or a polling reimplementation.
#[async_trait]
pub trait PodWatchSource: Send + Sync {
    async fn next(&self) -> Option<PodEvent>;
}

struct PodState {
    ip: String,
    port: u16,
    models: BTreeSetAlias,
    sleeping: bool,
}

type BTreeSetAlias = std::collections::BTreeSet<String>;

/// Watches pod lifecycle events and, for each ready pod, asynchronously
/// fetches `GET {pod}:{port}/v1/models` to discover served model ids.
/// MODIFY events that fail the model fetch keep the pod's last known good
/// model set rather than dropping it.
pub struct ClusterServiceDiscovery {
    pods: RwLock<HashMap<String, PodState>>,
    client: reqwest::Client,
    fetch_timeout: Duration,
    fetch_concurrency: Arc<Semaphore>,
    running: AtomicBool,
}

const MAX_CONCURRENT_MODEL_FETCHES: usize = 10;

impl ClusterServiceDiscovery {
    pub fn new(fetch_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            pods: RwLock::new(HashMap::new()),
            client: reqwest::Client::new(),
            fetch_timeout,
            fetch_concurrency: Arc::new(Semaphore::new(MAX_CONCURRENT_MODEL_FETCHES)),
            running: AtomicBool::new(true),
        })
    }

    async fn fetch_models(&self, ip: &str, port: u16) -> Option<HashSet<String>> {
        let _permit = self.fetch_concurrency.acquire().await.ok()?;
        let url = format!("http://{ip}:{port}/v1/models");
        let resp = self
            .client
            .get(&url)
            .timeout(self.fetch_timeout)
            .send()
            .await
            .ok()?;
        if !resp.status().is_success() {
            return None;
        }
        let body: serde_json::Value = resp.json().await.ok()?;
        let ids = body
            .get("data")?
            .as_array()?
            .iter()
            .filter_map(|entry| entry.get("id")?.as_str().map(String::from))
            .collect();
        Some(ids)
    }

    async fn handle_event(&self, event: PodEvent) {
        match event {
            PodEvent::AddedOrModified {
                pod_name,
                ip,
                port,
                ready,
            } => {
                if !ready {
                    self.pods.write().remove(&pod_name);
                    return;
                }
                match self.fetch_models(&ip, port).await {
                    Some(models) => {
                        let mut pods = self.pods.write();
                        let sleeping = pods.get(&pod_name).map(|p| p.sleeping).unwrap_or(false);
                        pods.insert(
                            pod_name,
                            PodState {
                                ip,
                                port,
                                models: models.into_iter().collect(),
                                sleeping,
                            },
                        );
                    }
                    None => {
                        warn!(%pod_name, "model discovery fetch failed, keeping last known models");
                        let mut pods = self.pods.write();
                        pods.entry(pod_name).or_insert(PodState {
                            ip,
                            port,
                            models: BTreeSetAlias::new(),
                            sleeping: false,
                        });
                    }
                }
            }
            PodEvent::Deleted { pod_name } => {
                self.pods.write().remove(&pod_name);
            }
        }
    }

    /// Drains events from `source` until it ends or `cancel` fires.
    pub async fn run(
        self: Arc<Self>,
        source: Arc<dyn PodWatchSource>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("cluster discovery watcher shutting down");
                    return;
                }
                event = source.next() => {
                    match event {
                        Some(event) => self.handle_event(event).await,
                        None => {
                            info!("pod watch source exhausted");
                            return;
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl ServiceDiscovery for ClusterServiceDiscovery {
    fn snapshot(&self) -> Vec<Endpoint> {
        self.pods
            .read()
            .iter()
            .map(|(pod_name, state)| {
                let mut ep = Endpoint::new(format!("http://{}:{}", state.ip, state.port), state.models.clone());
                ep.pod_name = Some(pod_name.clone());
                ep.sleeping = state.sleeping;
                ep
            })
            .filter(|ep| !ep.models.is_empty())
            .collect()
    }

    fn remove_endpoint_by_url(&self, url: &str) {
        self.pods
            .write()
            .retain(|_, state| format!("http://{}:{}", state.ip, state.port) != url);
    }

    fn set_sleep(&self, id: &str, sleeping: bool) {
        let mut pods = self.pods.write();
        if let Some(state) = pods.get_mut(id) {
            state.sleeping = sleeping;
            return;
        }
        if let Some(state) = pods
            .values_mut()
            .find(|state| format!("http://{}:{}", state.ip, state.port) == id)
        {
            state.sleeping = sleeping;
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

    #[tokio::test]
    async fn delete_removes_pod_endpoint() {
        let disco = ClusterServiceDiscovery::new(Duration::from_secs(1));
        disco.pods.write().insert(
            "pod-1".to_string(),
            PodState {
                ip: "10.0.0.1".to_string(),
                port: 8000,
                models: BTreeSetAlias::from(["opt-125m".to_string()]),
                sleeping: false,
            },
        );
        assert_eq!(disco.snapshot().len(), 1);
        disco
            .handle_event(PodEvent::Deleted {
                pod_name: "pod-1".to_string(),
            })
            .await;
        assert!(disco.snapshot().is_empty());
    }

    #[tokio::test]
    async fn not_ready_removes_pod_endpoint() {
        let disco = ClusterServiceDiscovery::new(Duration::from_secs(1));
        disco.pods.write().insert(
            "pod-1".to_string(),
            PodState {
                ip: "10.0.0.1".to_string(),
                port: 8000,
                models: BTreeSetAlias::from(["opt-125m".to_string()]),
                sleeping: false,
            },
        );
        disco
            .handle_event(PodEvent::AddedOrModified {
                pod_name: "pod-1".to_string(),
                ip: "10.0.0.1".to_string(),
                port: 8000,
                ready: false,
            })
            .await;
        assert!(disco.snapshot().is_empty());
    }
}
