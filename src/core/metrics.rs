/// Aggregated transfer metrics, global and per origin host
use galleon_shared::{HostMetricsRow, SessionMetrics};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Instant;

/// Sliding window of recent durations kept for percentile estimates.
const DURATION_WINDOW: usize = 200;

const HISTOGRAM_BUCKETS: [(&str, u64); 6] = [
    ("<5s", 5_000),
    ("5s-30s", 30_000),
    ("30s-2m", 120_000),
    ("2m-10m", 600_000),
    ("10m-30m", 1_800_000),
    (">30m", u64::MAX),
];

#[derive(Default)]
struct HostMetrics {
    completed: u64,
    errors: u64,
    total_bytes: u64,
    total_transfer_ms: u64,
    min_duration_ms: Option<u64>,
    max_duration_ms: Option<u64>,
}

struct ActiveTransfer {
    host: Option<String>,
    started: Instant,
    bytes: u64,
}

#[derive(Default)]
struct Inner {
    started: u64,
    completed: u64,
    failed: u64,
    transient_retries: u64,
    total_bytes: u64,
    histogram: HashMap<&'static str, u64>,
    recent_durations_ms: VecDeque<u64>,
    active: HashMap<i64, ActiveTransfer>,
    hosts: HashMap<String, HostMetrics>,
}

#[derive(Default)]
pub struct DownloadMetrics {
    inner: Mutex<Inner>,
}

/// p50/p95/p99 over the recent-duration window, in milliseconds.
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub p50: f64,
    pub p95: f64,
    pub p99: f64,
}

impl DownloadMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_start(&self, id: i64, host: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.started += 1;
        inner.active.insert(
            id,
            ActiveTransfer {
                host: host.map(|h| h.to_string()),
                started: Instant::now(),
                bytes: 0,
            },
        );
    }

    pub fn record_bytes(&self, id: i64, delta: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.total_bytes += delta;
        if let Some(active) = inner.active.get_mut(&id) {
            active.bytes += delta;
        }
    }

    pub fn record_completed(&self, id: i64, bytes: Option<u64>) {
        let mut inner = self.inner.lock().unwrap();
        inner.completed += 1;
        let Some(active) = inner.active.remove(&id) else {
            return;
        };
        let duration_ms = active.started.elapsed().as_millis() as u64;
        let transferred = bytes.unwrap_or(active.bytes);

        for (label, upper) in HISTOGRAM_BUCKETS {
            if duration_ms < upper {
                *inner.histogram.entry(label).or_default() += 1;
                break;
            }
        }
        inner.recent_durations_ms.push_back(duration_ms);
        if inner.recent_durations_ms.len() > DURATION_WINDOW {
            inner.recent_durations_ms.pop_front();
        }

        if let Some(host) = active.host {
            let metrics = inner.hosts.entry(host).or_default();
            metrics.completed += 1;
            metrics.total_bytes += transferred;
            metrics.total_transfer_ms += duration_ms;
            metrics.min_duration_ms = Some(
                metrics
                    .min_duration_ms
                    .map_or(duration_ms, |m| m.min(duration_ms)),
            );
            metrics.max_duration_ms = Some(
                metrics
                    .max_duration_ms
                    .map_or(duration_ms, |m| m.max(duration_ms)),
            );
        }
    }

    pub fn record_failed(&self, id: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.failed += 1;
        if let Some(active) = inner.active.remove(&id) {
            if let Some(host) = active.host {
                inner.hosts.entry(host).or_default().errors += 1;
            }
        }
    }

    pub fn record_transient_retry(&self, host: Option<&str>) {
        let mut inner = self.inner.lock().unwrap();
        inner.transient_retries += 1;
        if let Some(host) = host {
            inner.hosts.entry(host.to_string()).or_default().errors += 1;
        }
    }

    /// Pause/cancel: drop the in-flight entry without counting a failure.
    pub fn record_cancelled_or_paused(&self, id: i64) {
        self.inner.lock().unwrap().active.remove(&id);
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().unwrap().active.len()
    }

    /// failed / (completed + failed); 0 when nothing finished yet.
    pub fn get_error_rate(&self) -> f64 {
        let inner = self.inner.lock().unwrap();
        let finished = inner.completed + inner.failed;
        if finished == 0 {
            0.0
        } else {
            inner.failed as f64 / finished as f64
        }
    }

    pub fn get_latency_percentiles(&self) -> LatencyPercentiles {
        let inner = self.inner.lock().unwrap();
        if inner.recent_durations_ms.is_empty() {
            return LatencyPercentiles::default();
        }
        let mut sorted: Vec<u64> = inner.recent_durations_ms.iter().copied().collect();
        sorted.sort_unstable();
        let pick = |p: f64| {
            let idx = ((sorted.len() as f64 - 1.0) * p).round() as usize;
            sorted[idx] as f64
        };
        LatencyPercentiles {
            p50: pick(0.50),
            p95: pick(0.95),
            p99: pick(0.99),
        }
    }

    pub fn get_host_metrics(&self, host: &str) -> Option<HostMetricsRow> {
        let inner = self.inner.lock().unwrap();
        inner.hosts.get(host).map(host_to_row)
    }

    pub fn get_global_metrics(&self) -> SessionMetrics {
        let percentiles = self.get_latency_percentiles();
        let error_rate = self.get_error_rate();
        let inner = self.inner.lock().unwrap();
        SessionMetrics {
            started: inner.started,
            completed: inner.completed,
            failed: inner.failed,
            transient_retries: inner.transient_retries,
            total_bytes: inner.total_bytes,
            active: inner.active.len() as u64,
            error_rate,
            p50_ms: percentiles.p50,
            p95_ms: percentiles.p95,
            p99_ms: percentiles.p99,
            duration_histogram: inner
                .histogram
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
            hosts: inner
                .hosts
                .iter()
                .map(|(k, v)| (k.clone(), host_to_row(v)))
                .collect(),
        }
    }

    pub fn reset(&self) {
        *self.inner.lock().unwrap() = Inner::default();
    }
}

fn host_to_row(m: &HostMetrics) -> HostMetricsRow {
    let avg_speed_bps = if m.total_transfer_ms > 0 {
        m.total_bytes as f64 / (m.total_transfer_ms as f64 / 1000.0)
    } else {
        0.0
    };
    HostMetricsRow {
        completed: m.completed,
        errors: m.errors,
        total_bytes: m.total_bytes,
        total_transfer_ms: m.total_transfer_ms,
        avg_speed_bps,
        min_duration_ms: m.min_duration_ms,
        max_duration_ms: m.max_duration_ms,
    }
}
