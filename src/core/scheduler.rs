use crate::config::OrderingConfig;
use crate::core::state::{Download, Priority};
/// Queue ordering and admission control
///
/// Orders the ready queue by effective priority (base + aging bonus - retry
/// penalty, with an optional shortest-job-first tiebreak), and enforces the
/// global cap, the per-host cap and a per-host token-bucket rate limit.
/// The engine serializes access behind one mutex, so the check-and-register
/// sequence cannot interleave.
use chrono::{DateTime, Utc};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashMap, HashSet};
use std::time::Instant;
use tracing::debug;

/// Effective priorities closer than this are considered equal.
const PRIORITY_EPSILON: f64 = 0.01;

/// A queued download as the scheduler sees it.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub id: i64,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
    /// 0 = unknown
    pub total_bytes: u64,
    pub host: Option<String>,
}

impl Candidate {
    pub fn from_download(d: &Download) -> Self {
        Self {
            id: d.id,
            priority: d.priority,
            created_at: d.created_at,
            retry_count: d.retry_count,
            total_bytes: d.total_bytes,
            host: d.host(),
        }
    }
}

/// Admission verdict for one prospective start.
#[derive(Debug, Clone)]
pub struct Admission {
    pub can_start: bool,
    pub slots_available: usize,
    pub reason: Option<String>,
    pub host_limit: Option<usize>,
    pub rate_limited: bool,
}

/// Fixed-window request counter per host.
struct TokenBucket {
    window_start: Instant,
    used: u32,
}

impl TokenBucket {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            used: 0,
        }
    }

    fn roll(&mut self, window_ms: u64) {
        if self.window_start.elapsed().as_millis() as u64 >= window_ms {
            self.window_start = Instant::now();
            self.used = 0;
        }
    }

    fn available(&mut self, limit: u32, window_ms: u64) -> bool {
        self.roll(window_ms);
        self.used < limit
    }

    fn take(&mut self, window_ms: u64) {
        self.roll(window_ms);
        self.used += 1;
    }
}

pub struct Scheduler {
    ordering: OrderingConfig,
    max_concurrent: usize,
    max_per_host: usize,
    active_hosts: HashMap<String, HashSet<i64>>,
    buckets: HashMap<String, TokenBucket>,
    rr_index: usize,
}

impl Scheduler {
    pub fn new(ordering: OrderingConfig, max_concurrent: usize, max_per_host: usize) -> Self {
        let max_concurrent = max_concurrent.clamp(1, 3);
        Self {
            ordering,
            max_concurrent,
            max_per_host: max_per_host.clamp(1, max_concurrent),
            active_hosts: HashMap::new(),
            buckets: HashMap::new(),
            rr_index: 0,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn max_concurrent_per_host(&self) -> usize {
        self.max_per_host
    }

    pub fn set_max_concurrent(&mut self, n: usize) {
        self.max_concurrent = n.clamp(1, 3);
        self.max_per_host = self.max_per_host.clamp(1, self.max_concurrent);
    }

    pub fn set_max_concurrent_per_host(&mut self, n: usize) {
        self.max_per_host = n.clamp(1, self.max_concurrent);
    }

    pub fn set_turbo(&mut self, turbo: bool) {
        self.ordering.turbo = turbo;
    }

    /// Idempotent; called from the enter-Starting transition hook.
    pub fn register_download(&mut self, id: i64, host: &str) {
        self.active_hosts
            .entry(host.to_string())
            .or_default()
            .insert(id);
    }

    /// Idempotent; called when a download leaves its active states.
    pub fn unregister_download(&mut self, id: i64, host: &str) {
        if let Some(set) = self.active_hosts.get_mut(host) {
            set.remove(&id);
            if set.is_empty() {
                self.active_hosts.remove(host);
            }
        }
    }

    pub fn active_on_host(&self, host: &str) -> usize {
        self.active_hosts.get(host).map_or(0, |s| s.len())
    }

    /// Effective priority: base + aging bonus - retry penalty.
    pub fn effective_priority(&self, c: &Candidate, now: DateTime<Utc>) -> f64 {
        let cfg = &self.ordering;
        let base = c.priority as u8 as f64;

        let age_secs = (now - c.created_at).num_seconds().max(0) as f64;
        let intervals = if cfg.aging_interval_secs > 0 {
            age_secs / cfg.aging_interval_secs as f64
        } else {
            0.0
        };
        let multiplier = if c.priority == Priority::Low {
            cfg.low_priority_multiplier
        } else {
            1.0
        };
        let bonus = (intervals * multiplier).min(cfg.max_aging_bonus);

        let penalty = if cfg.retry_penalty_enabled {
            let penalized = c.retry_count.saturating_sub(cfg.free_retries) as f64;
            (penalized * cfg.penalty_per_retry).min(cfg.max_retry_penalty)
        } else {
            0.0
        };

        base + bonus - penalty
    }

    fn effective_size(&self, c: &Candidate) -> u64 {
        if c.total_bytes > 0 {
            c.total_bytes
        } else {
            self.ordering.sjf_default_size
        }
    }

    /// Order two candidates; `Less` schedules first.
    fn compare(&self, a: &Candidate, b: &Candidate, now: DateTime<Utc>) -> CmpOrdering {
        let pa = self.effective_priority(a, now);
        let pb = self.effective_priority(b, now);
        let delta = pa - pb;

        if delta.abs() >= PRIORITY_EPSILON {
            // higher effective priority first
            return pb.partial_cmp(&pa).unwrap_or(CmpOrdering::Equal);
        }

        if self.ordering.sjf_enabled && self.ordering.sjf_weight > 0.0 {
            let sa = self.effective_size(a);
            let sb = self.effective_size(b);
            let larger = sa.max(sb).max(1) as f64;
            let within_tolerance = (sa as f64 - sb as f64).abs() / larger * 100.0
                <= self.ordering.sjf_tolerance_percent;

            if self.ordering.sjf_weight >= 0.5 {
                if !within_tolerance {
                    return sa.cmp(&sb);
                }
            } else {
                // blend a size preference and an age preference
                let size_sign = match sa.cmp(&sb) {
                    _ if within_tolerance => 0.0,
                    CmpOrdering::Less => -1.0,
                    CmpOrdering::Greater => 1.0,
                    CmpOrdering::Equal => 0.0,
                };
                let age_sign = match a.created_at.cmp(&b.created_at) {
                    CmpOrdering::Less => -1.0,
                    CmpOrdering::Greater => 1.0,
                    CmpOrdering::Equal => 0.0,
                };
                let score = self.ordering.sjf_weight * size_sign
                    + (1.0 - self.ordering.sjf_weight) * age_sign;
                if score < 0.0 {
                    return CmpOrdering::Less;
                } else if score > 0.0 {
                    return CmpOrdering::Greater;
                }
            }
        }

        // earlier created_at first
        a.created_at.cmp(&b.created_at)
    }

    /// Admission check for one more active download, optionally against a
    /// host. Does not consume a rate-limit token.
    pub fn can_start(&mut self, current_active: usize, host: Option<&str>) -> Admission {
        if current_active >= self.max_concurrent {
            return Admission {
                can_start: false,
                slots_available: 0,
                reason: Some(format!(
                    "global limit reached ({current_active}/{})",
                    self.max_concurrent
                )),
                host_limit: None,
                rate_limited: false,
            };
        }
        let slots = self.max_concurrent - current_active;

        if let Some(host) = host {
            let active = self.active_on_host(host);
            if active >= self.max_per_host {
                return Admission {
                    can_start: false,
                    slots_available: slots,
                    reason: Some(format!("host {host} at limit ({active}/{})", self.max_per_host)),
                    host_limit: Some(self.max_per_host),
                    rate_limited: false,
                };
            }
            if !self.ordering.turbo {
                let limit = self.ordering.host_rate_limit;
                let window = self.ordering.host_rate_window_ms;
                let bucket = self
                    .buckets
                    .entry(host.to_string())
                    .or_insert_with(TokenBucket::new);
                if !bucket.available(limit, window) {
                    return Admission {
                        can_start: false,
                        slots_available: slots,
                        reason: Some(format!("host {host} rate limited")),
                        host_limit: Some(self.max_per_host),
                        rate_limited: true,
                    };
                }
            }
        }

        Admission {
            can_start: true,
            slots_available: slots,
            reason: None,
            host_limit: host.map(|_| self.max_per_host),
            rate_limited: false,
        }
    }

    /// Pick at most `slots_available` candidates to start, by effective
    /// priority, scanning circularly from the advancing round-robin index.
    /// Consumes one rate-limit token per selection.
    pub fn select_to_start(
        &mut self,
        queue: &[Candidate],
        slots_available: usize,
        current_active: usize,
    ) -> Vec<Candidate> {
        if queue.is_empty() || slots_available == 0 {
            return Vec::new();
        }

        let now = Utc::now();
        let mut sorted: Vec<&Candidate> = queue.iter().collect();
        sorted.sort_by(|a, b| self.compare(a, b, now));

        let start = self.rr_index % sorted.len();
        // the index advances by the scan length, not the number selected
        self.rr_index = self.rr_index.wrapping_add(sorted.len());

        let mut selected: Vec<Candidate> = Vec::new();
        let mut tentative_hosts: HashMap<String, usize> = HashMap::new();

        for offset in 0..sorted.len() {
            if selected.len() >= slots_available {
                break;
            }
            let candidate = sorted[(start + offset) % sorted.len()];

            let active_now = current_active + selected.len();
            if active_now >= self.max_concurrent {
                break;
            }
            if let Some(host) = candidate.host.as_deref() {
                let pending = tentative_hosts.get(host).copied().unwrap_or(0);
                if self.active_on_host(host) + pending >= self.max_per_host {
                    continue;
                }
            }
            let admission = self.can_start(active_now, candidate.host.as_deref());
            if !admission.can_start {
                debug!(id = candidate.id, reason = ?admission.reason, "candidate skipped");
                continue;
            }

            if let Some(host) = candidate.host.as_deref() {
                if !self.ordering.turbo {
                    let window = self.ordering.host_rate_window_ms;
                    if let Some(bucket) = self.buckets.get_mut(host) {
                        bucket.take(window);
                    }
                }
                *tentative_hosts.entry(host.to_string()).or_default() += 1;
            }
            selected.push(candidate.clone());
        }

        selected
    }
}
