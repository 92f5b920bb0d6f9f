pub mod cluster;
pub mod static_disco;

pub use cluster::ClusterServiceDiscovery;
pub use static_disco::StaticServiceDiscovery;

use async_trait::async_trait;

use crate::types::Endpoint;

/// Capability interface every service-discovery backend implements. Readers
/// call `snapshot()` without taking any lock held across network I/O;
/// backends publish updates by atomically swapping their internal endpoint
/// map.
#[async_trait]
pub trait ServiceDiscovery: Send + Sync {
    /// Current set of endpoints, in a stable order.
    fn snapshot(&self) -> Vec<Endpoint>;

    /// Proxy-triggered retirement: called when the proxy observes a
    /// connection failure talking to `url`, so discovery can drop it before
    /// its next health probe or watch event would.
    fn remove_endpoint_by_url(&self, url: &str);

    /// Flips the `sleeping` flag for the endpoint identified by `id` (its
    /// `url` or `pod_name`), so routing can exclude it from then on. A
    /// sleeping endpoint stays in `snapshot()` so `/is_sleeping` can still
    /// find it; routing and `list_models` filter it out.
    fn set_sleep(&self, id: &str, sleeping: bool);

    /// Whether this backend's background tasks are alive and answering.
    fn healthy(&self) -> bool;

    /// Cancels background tasks and waits, with a bounded timeout, for them
    /// to finish.
    async fn close(&self);
}
