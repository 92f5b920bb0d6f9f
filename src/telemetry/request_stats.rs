use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

/// A lazily-evicted sliding window over `(timestamp, value)` pairs. Eviction
/// happens both on `update` (write path) and `update_no_value` (read path),
/// so a window that receives no traffic for a while still reports correctly
/// when queried.
#[derive(Debug, Default)]
struct MovingAverageMonitor {
    window_size: f64,
    values: VecDeque<(f64, f64)>,
    sum: f64,
}

impl MovingAverageMonitor {
    fn new(window_size: f64) -> Self {
        Self {
            window_size,
            values: VecDeque::new(),
            sum: 0.0,
        }
    }

    fn evict(&mut self, now: f64) {
        while let Some(&(ts, value)) = self.values.front() {
            if now - ts > self.window_size {
                self.sum -= value;
                self.values.pop_front();
            } else {
                break;
            }
        }
    }

    fn update(&mut self, timestamp: f64, value: f64) {
        self.evict(timestamp);
        self.values.push_back((timestamp, value));
        self.sum += value;
    }

    fn update_no_value(&mut self, now: f64) {
        self.evict(now);
    }

    fn get_average(&self) -> f64 {
        if self.values.is_empty() {
            return -1.0;
        }
        self.sum / self.values.len() as f64
    }

    fn count(&self) -> usize {
        self.values.len()
    }
}

/// Per-endpoint snapshot returned to callers (the router, the metrics
/// exposition, and `/health`).
#[derive(Debug, Clone, Copy, Default)]
pub struct RequestStats {
    pub qps: f64,
    pub ttft: f64,
    pub avg_latency: f64,
    pub avg_itl: f64,
    pub in_prefill_requests: i64,
    pub in_decoding_requests: i64,
    pub finished_requests: u64,
    pub num_swapped_requests: i64,
    pub uptime: f64,
}

#[derive(Debug)]
struct EndpointMonitor {
    qps_window: MovingAverageMonitor,
    ttft_window: MovingAverageMonitor,
    latency_window: MovingAverageMonitor,
    itl_window: MovingAverageMonitor,
    in_prefill: i64,
    in_decoding: i64,
    finished: u64,
    swapped: i64,
    start_times: HashMap<String, f64>,
    first_seen: f64,
}

impl EndpointMonitor {
    fn new(window_size: f64, now: f64) -> Self {
        Self {
            qps_window: MovingAverageMonitor::new(window_size),
            ttft_window: MovingAverageMonitor::new(window_size),
            latency_window: MovingAverageMonitor::new(window_size),
            itl_window: MovingAverageMonitor::new(window_size),
            in_prefill: 0,
            in_decoding: 0,
            finished: 0,
            swapped: 0,
            start_times: HashMap::new(),
            first_seen: now,
        }
    }

    fn snapshot(&self, now: f64) -> RequestStats {
        RequestStats {
            qps: if self.qps_window.window_size > 0.0 {
                self.qps_window.count() as f64 / self.qps_window.window_size
            } else {
                0.0
            },
            ttft: self.ttft_window.get_average(),
            avg_latency: self.latency_window.get_average(),
            avg_itl: self.itl_window.get_average(),
            in_prefill_requests: self.in_prefill,
            in_decoding_requests: self.in_decoding,
            finished_requests: self.finished,
            num_swapped_requests: self.swapped,
            uptime: now - self.first_seen,
        }
    }
}

/// Owns the sliding-window buffers for every endpoint and exposes the
/// observer hooks the proxy invokes as a request moves through its
/// lifecycle. Writer contention is per-endpoint: each endpoint's state lives
/// behind its own mutex rather than one global lock.
pub struct RequestStatsMonitor {
    window_size: f64,
    endpoints: Mutex<HashMap<String, EndpointMonitor>>,
}

impl RequestStatsMonitor {
    pub fn new(window_size: f64) -> Self {
        Self {
            window_size,
            endpoints: Mutex::new(HashMap::new()),
        }
    }

    fn entry<'a>(
        map: &'a mut HashMap<String, EndpointMonitor>,
        url: &str,
        window_size: f64,
        now: f64,
    ) -> &'a mut EndpointMonitor {
        map.entry(url.to_string())
            .or_insert_with(|| EndpointMonitor::new(window_size, now))
    }

    pub fn on_new_request(&self, url: &str, request_id: &str, now: f64) {
        let mut map = self.endpoints.lock();
        let monitor = Self::entry(&mut map, url, self.window_size, now);
        monitor.in_prefill += 1;
        monitor.start_times.insert(request_id.to_string(), now);
        monitor.qps_window.update(now, 1.0);
    }

    pub fn on_request_response(&self, url: &str, request_id: &str, now: f64) {
        let mut map = self.endpoints.lock();
        let monitor = Self::entry(&mut map, url, self.window_size, now);
        monitor.in_prefill = (monitor.in_prefill - 1).max(0);
        monitor.in_decoding += 1;
        if let Some(&start) = monitor.start_times.get(request_id) {
            monitor.ttft_window.update(now, now - start);
        }
    }

    pub fn on_request_complete(&self, url: &str, request_id: &str, now: f64) {
        let mut map = self.endpoints.lock();
        let monitor = Self::entry(&mut map, url, self.window_size, now);
        monitor.in_decoding = (monitor.in_decoding - 1).max(0);
        monitor.finished += 1;
        if let Some(start) = monitor.start_times.remove(request_id) {
            monitor.latency_window.update(now, now - start);
        }
    }

    pub fn on_request_swapped(&self, url: &str, now: f64) {
        let mut map = self.endpoints.lock();
        let monitor = Self::entry(&mut map, url, self.window_size, now);
        monitor.swapped += 1;
    }

    pub fn get_stats(&self, now: f64) -> HashMap<String, RequestStats> {
        let mut map = self.endpoints.lock();
        let mut out = HashMap::with_capacity(map.len());
        for (url, monitor) in map.iter_mut() {
            monitor.qps_window.update_no_value(now);
            monitor.ttft_window.update_no_value(now);
            monitor.latency_window.update_no_value(now);
            out.insert(url.clone(), monitor.snapshot(now));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_flight_counters_stay_non_negative() {
        let monitor = RequestStatsMonitor::new(60.0);
        monitor.on_request_response("http://a", "r1", 1.0);
        let stats = monitor.get_stats(1.0);
        assert_eq!(stats["http://a"].in_prefill_requests, 0);
    }

    #[test]
    fn full_lifecycle_updates_all_counters() {
        let monitor = RequestStatsMonitor::new(60.0);
        monitor.on_new_request("http://a", "r1", 0.0);
        let mid = monitor.get_stats(0.0);
        assert_eq!(mid["http://a"].in_prefill_requests, 1);

        monitor.on_request_response("http://a", "r1", 0.2);
        let mid = monitor.get_stats(0.2);
        assert_eq!(mid["http://a"].in_prefill_requests, 0);
        assert_eq!(mid["http://a"].in_decoding_requests, 1);
        assert!((mid["http://a"].ttft - 0.2).abs() < 1e-9);

        monitor.on_request_complete("http://a", "r1", 1.0);
        let done = monitor.get_stats(1.0);
        assert_eq!(done["http://a"].in_decoding_requests, 0);
        assert_eq!(done["http://a"].finished_requests, 1);
        assert!((done["http://a"].avg_latency - 1.0).abs() < 1e-9);
    }

    #[test]
    fn window_evicts_stale_entries_on_read() {
        let monitor = RequestStatsMonitor::new(1.0);
        monitor.on_new_request("http://a", "r1", 0.0);
        let stats = monitor.get_stats(5.0);
        assert_eq!(stats["http://a"].qps, 0.0);
    }

    #[test]
    fn empty_window_reports_negative_average() {
        let monitor = RequestStatsMonitor::new(60.0);
        monitor.on_request_swapped("http://a", 0.0);
        let stats = monitor.get_stats(0.0);
        assert_eq!(stats["http://a"].ttft, -1.0);
        assert_eq!(stats["http://a"].num_swapped_requests, 1);
    }
}
