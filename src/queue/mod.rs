use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tracing::{info, warn};

use crate::telemetry::EngineStats;
use crate::types::Endpoint;

/// One request waiting for admission to a specific endpoint.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request_id: String,
    pub model: String,
    pub priority: i64,
    pub enqueued_at: f64,
    pub session_value: Option<String>,
}

/// Min-heap ordering: lower `priority` dispatches first; ties broken by
/// earlier `enqueued_at`. `BinaryHeap` is a max-heap, so this `Ord` impl
/// reverses the natural comparison (mirrors wrapping the original's
/// `heapq` entries in `Reverse`).
#[derive(Debug, Clone)]
struct HeapEntry(QueuedRequest);

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.0.priority == other.0.priority && self.0.enqueued_at == other.0.enqueued_at
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .0
            .priority
            .cmp(&self.0.priority)
            .then_with(|| other.0.enqueued_at.partial_cmp(&self.0.enqueued_at).unwrap_or(Ordering::Equal))
    }
}

/// An endpoint is "free" for admission when both its running-request count
/// and its GPU cache usage sit below configured ceilings.
#[derive(Debug, Clone, Copy)]
pub struct AdmissionThresholds {
    pub max_running_requests: i64,
    pub max_gpu_cache_usage: f64,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self { max_running_requests: 64, max_gpu_cache_usage: 0.95 }
    }
}

fn endpoint_is_free(stats: Option<&EngineStats>, thresholds: &AdmissionThresholds) -> bool {
    match stats {
        Some(stats) => {
            stats.num_running_requests < thresholds.max_running_requests
                && stats.gpu_cache_usage_perc < thresholds.max_gpu_cache_usage
        }
        None => true,
    }
}

/// Picks, among endpoints serving `model` and not in `exclude`, the one with
/// the lowest `num_running_requests` (ties broken by URL). This is the
/// concrete definition of the original's undefined `find_best_endpoint`
/// helper (see `DESIGN.md`).
pub fn find_best_endpoint<'a>(
    endpoints: &'a [Endpoint],
    model: &str,
    exclude: &std::collections::HashSet<String>,
    engine_stats: &HashMap<String, EngineStats>,
) -> Option<&'a Endpoint> {
    endpoints
        .iter()
        .filter(|ep| ep.serves(model) && !ep.sleeping && !exclude.contains(&ep.url))
        .min_by(|a, b| {
            let ra = engine_stats.get(&a.url).map(|s| s.num_running_requests).unwrap_or(0);
            let rb = engine_stats.get(&b.url).map(|s| s.num_running_requests).unwrap_or(0);
            ra.cmp(&rb).then_with(|| a.url.cmp(&b.url))
        })
}

/// Concrete definition of the original's undefined `_session_matches_endpoint`
/// helper: true when session affinity is in play and the session table
/// already maps this request's session key to `candidate_url`.
pub fn session_matches_endpoint(
    session_value: Option<&str>,
    session_table: &HashMap<String, String>,
    candidate_url: &str,
) -> bool {
    match session_value {
        Some(key) => session_table.get(key).map(|url| url == candidate_url).unwrap_or(false),
        None => false,
    }
}

struct EndpointQueue {
    heap: Mutex<BinaryHeap<HeapEntry>>,
    notify: Notify,
}

/// A dispatched admission: the scheduler decided `request` may now proceed
/// against `endpoint_url` (which may differ from the endpoint it was
/// originally enqueued on, if it was rerouted after a stale wait).
#[derive(Debug, Clone)]
pub struct Admission {
    pub endpoint_url: String,
    pub request: QueuedRequest,
}

/// Per-endpoint priority queue with a scheduler task per endpoint. Requests
/// that wait past `max_queue_wait_time` are rerouted to a different endpoint
/// serving the same model when one is free, preferring an endpoint that
/// doesn't already match the request's session; failing that they are
/// re-queued on their original endpoint at raised priority.
pub struct AdmissionQueue {
    queues: Mutex<HashMap<String, Arc<EndpointQueue>>>,
    thresholds: AdmissionThresholds,
    max_queue_wait_time: Duration,
    dispatch_tx: mpsc::Sender<Admission>,
}

impl AdmissionQueue {
    pub fn new(
        thresholds: AdmissionThresholds,
        max_queue_wait_time: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Admission>) {
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1024);
        (
            Arc::new(Self {
                queues: Mutex::new(HashMap::new()),
                thresholds,
                max_queue_wait_time,
                dispatch_tx,
            }),
            dispatch_rx,
        )
    }

    fn queue_for(&self, url: &str) -> Arc<EndpointQueue> {
        self.queues
            .lock()
            .entry(url.to_string())
            .or_insert_with(|| Arc::new(EndpointQueue { heap: Mutex::new(BinaryHeap::new()), notify: Notify::new() }))
            .clone()
    }

    pub fn enqueue(&self, endpoint_url: &str, request: QueuedRequest) {
        let queue = self.queue_for(endpoint_url);
        queue.heap.lock().push(HeapEntry(request));
        queue.notify.notify_one();
    }

    /// Runs the scheduler loop for one endpoint until `cancel` fires. Spawn
    /// one of these per discovered endpoint.
    pub async fn run_endpoint_scheduler(
        self: Arc<Self>,
        endpoint: Endpoint,
        endpoints_provider: impl Fn() -> Vec<Endpoint>,
        engine_stats_provider: impl Fn() -> HashMap<String, EngineStats>,
        session_table_provider: impl Fn() -> HashMap<String, String>,
        now_fn: impl Fn() -> f64,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        let queue = self.queue_for(&endpoint.url);
        let mut poll = tokio::time::interval(Duration::from_millis(50));
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(url = %endpoint.url, "admission scheduler shutting down");
                    return;
                }
                _ = queue.notify.notified() => {}
                _ = poll.tick() => {}
            }

            let engine_stats = engine_stats_provider();
            let free = endpoint_is_free(engine_stats.get(&endpoint.url), &self.thresholds);
            let now = now_fn();

            let head = {
                let mut heap = queue.heap.lock();
                heap.peek().map(|e| e.0.clone()).filter(|_| free).and_then(|_| heap.pop()).map(|e| e.0)
            };

            let Some(request) = head else { continue };

            let waited = now - request.enqueued_at;
            if waited > self.max_queue_wait_time.as_secs_f64() {
                let endpoints = endpoints_provider();
                let session_table = session_table_provider();
                let mut exclude = std::collections::HashSet::new();
                exclude.insert(endpoint.url.clone());

                let reroute_target = find_best_endpoint(&endpoints, &request.model, &exclude, &engine_stats)
                    .filter(|candidate| {
                        !session_matches_endpoint(request.session_value.as_deref(), &session_table, &candidate.url)
                    })
                    .or_else(|| find_best_endpoint(&endpoints, &request.model, &exclude, &engine_stats));

                match reroute_target {
                    Some(target) if endpoint_is_free(engine_stats.get(&target.url), &self.thresholds) => {
                        warn!(request_id = %request.request_id, from = %endpoint.url, to = %target.url, "rerouting stale-wait request");
                        let _ = self
                            .dispatch_tx
                            .send(Admission { endpoint_url: target.url.clone(), request })
                            .await;
                    }
                    _ => {
                        let mut requeued = request.clone();
                        requeued.priority -= 1;
                        queue.heap.lock().push(HeapEntry(requeued));
                    }
                }
                continue;
            }

            let _ = self
                .dispatch_tx
                .send(Admission { endpoint_url: endpoint.url.clone(), request })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_best_endpoint_picks_lowest_running_requests() {
        let endpoints = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let mut engine_stats = HashMap::new();
        engine_stats.insert("http://a".to_string(), EngineStats { num_running_requests: 5, ..Default::default() });
        engine_stats.insert("http://b".to_string(), EngineStats { num_running_requests: 1, ..Default::default() });
        let best = find_best_endpoint(&endpoints, "m", &Default::default(), &engine_stats).unwrap();
        assert_eq!(best.url, "http://b");
    }

    #[test]
    fn find_best_endpoint_respects_exclusion_set() {
        let endpoints = vec![
            Endpoint::new("http://a", vec!["m".to_string()]),
            Endpoint::new("http://b", vec!["m".to_string()]),
        ];
        let mut exclude = std::collections::HashSet::new();
        exclude.insert("http://b".to_string());
        let best = find_best_endpoint(&endpoints, "m", &exclude, &HashMap::new()).unwrap();
        assert_eq!(best.url, "http://a");
    }

    #[test]
    fn session_matches_endpoint_checks_table() {
        let mut table = HashMap::new();
        table.insert("alice".to_string(), "http://a".to_string());
        assert!(session_matches_endpoint(Some("alice"), &table, "http://a"));
        assert!(!session_matches_endpoint(Some("alice"), &table, "http://b"));
        assert!(!session_matches_endpoint(None, &table, "http://a"));
    }

    #[tokio::test]
    async fn enqueue_dispatches_when_endpoint_is_free() {
        let (queue, mut rx) = AdmissionQueue::new(AdmissionThresholds::default(), Duration::from_secs(30));
        queue.enqueue(
            "http://a",
            QueuedRequest {
                request_id: "r1".to_string(),
                model: "m".to_string(),
                priority: 0,
                enqueued_at: 0.0,
                session_value: None,
            },
        );
        let cancel = tokio_util::sync::CancellationToken::new();
        let cancel_clone = cancel.clone();
        let endpoint = Endpoint::new("http://a", vec!["m".to_string()]);
        let handle = tokio::spawn(queue.clone().run_endpoint_scheduler(
            endpoint,
            Vec::new,
            HashMap::new,
            HashMap::new,
            || 0.0,
            cancel_clone,
        ));
        let admission = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("did not dispatch in time")
            .expect("channel closed");
        assert_eq!(admission.request.request_id, "r1");
        cancel.cancel();
        let _ = handle.await;
    }
}
