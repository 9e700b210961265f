use crate::config::AdaptiveConfig;
/// Adaptive concurrency controller
///
/// Starts conservative and walks the global and per-host caps up or down
/// from observed outcomes over a sliding window. The engine invokes
/// `evaluate` on a fixed cadence; every adjustment is pushed through the
/// callback so the scheduler and the semaphores stay in step.
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, info};

pub type AdjustmentCallback = Box<dyn Fn(usize, usize) + Send + Sync>;

#[derive(Debug, Clone, Copy)]
enum WindowEvent {
    Success { throughput_bps: f64 },
    PermanentError,
    TransientRetry,
}

struct Inner {
    events: VecDeque<(Instant, WindowEvent)>,
    current_global: usize,
    current_per_host: usize,
    user_ceiling: usize,
    peak_throughput_bps: f64,
    last_adjustment: Option<Instant>,
}

pub struct AdaptiveConcurrencyController {
    cfg: AdaptiveConfig,
    inner: Mutex<Inner>,
    callback: AdjustmentCallback,
}

impl AdaptiveConcurrencyController {
    pub fn new(cfg: AdaptiveConfig, user_ceiling: usize, callback: AdjustmentCallback) -> Self {
        Self {
            cfg,
            inner: Mutex::new(Inner {
                events: VecDeque::new(),
                current_global: 1,
                current_per_host: 1,
                user_ceiling: user_ceiling.max(1),
                peak_throughput_bps: 0.0,
                last_adjustment: None,
            }),
            callback,
        }
    }

    pub fn record_success(&self, throughput_bps: f64) {
        self.push(WindowEvent::Success { throughput_bps });
    }

    pub fn record_permanent_error(&self) {
        self.push(WindowEvent::PermanentError);
    }

    pub fn record_transient_retry(&self) {
        self.push(WindowEvent::TransientRetry);
    }

    fn push(&self, event: WindowEvent) {
        let mut inner = self.inner.lock().unwrap();
        inner.events.push_back((Instant::now(), event));
        let window = Duration::from_millis(self.cfg.window_ms);
        Self::prune_window(&mut inner.events, window);
    }

    fn prune_window(events: &mut VecDeque<(Instant, WindowEvent)>, window: Duration) {
        loop {
            let expired = events.front().is_some_and(|(at, _)| at.elapsed() > window);
            if !expired {
                break;
            }
            events.pop_front();
        }
    }

    pub fn current(&self) -> (usize, usize) {
        let inner = self.inner.lock().unwrap();
        (inner.current_global, inner.current_per_host)
    }

    /// Lower the user ceiling; the current value clamps down immediately.
    pub fn set_user_ceiling(&self, ceiling: usize) {
        let clamped = {
            let mut inner = self.inner.lock().unwrap();
            inner.user_ceiling = ceiling.max(1);
            if inner.current_global > inner.user_ceiling {
                inner.current_global = inner.user_ceiling;
                inner.current_per_host = inner.current_per_host.min(inner.current_global);
                Some((inner.current_global, inner.current_per_host))
            } else {
                None
            }
        };
        if let Some((global, per_host)) = clamped {
            info!(global, per_host, "adaptive caps clamped to new ceiling");
            (self.callback)(global, per_host);
        }
    }

    /// Periodic evaluation; no-op inside the cooldown.
    pub fn evaluate(&self) {
        let adjustment = {
            let mut inner = self.inner.lock().unwrap();

            if let Some(last) = inner.last_adjustment {
                if last.elapsed() < Duration::from_millis(self.cfg.cooldown_ms) {
                    return;
                }
            }

            let window = Duration::from_millis(self.cfg.window_ms);
            Self::prune_window(&mut inner.events, window);

            let mut successes = 0u64;
            let mut permanent = 0u64;
            let mut transients = 0u64;
            let mut throughput_sum = 0.0;
            for (_, event) in &inner.events {
                match event {
                    WindowEvent::Success { throughput_bps } => {
                        successes += 1;
                        throughput_sum += throughput_bps;
                    }
                    WindowEvent::PermanentError => permanent += 1,
                    WindowEvent::TransientRetry => transients += 1,
                }
            }
            let finished = successes + permanent;
            let error_rate = if finished == 0 {
                0.0
            } else {
                permanent as f64 / finished as f64
            };
            let avg_throughput = if successes == 0 {
                0.0
            } else {
                throughput_sum / successes as f64
            };
            if avg_throughput > inner.peak_throughput_bps {
                inner.peak_throughput_bps = avg_throughput;
            }

            let throughput_collapsed = inner.peak_throughput_bps > 0.0
                && successes > 0
                && avg_throughput < self.cfg.throughput_drop_threshold * inner.peak_throughput_bps;
            let scale_down = error_rate >= self.cfg.scale_down_error_rate_min
                || transients >= self.cfg.scale_down_transient_retry_threshold
                || throughput_collapsed;

            if scale_down && inner.current_global > 1 {
                inner.current_global -= 1;
                inner.current_per_host = inner.current_per_host.saturating_sub(1).max(1);
                inner.peak_throughput_bps = avg_throughput;
                inner.last_adjustment = Some(Instant::now());
                debug!(
                    error_rate,
                    transients, avg_throughput, "adaptive scale down"
                );
                Some((inner.current_global, inner.current_per_host))
            } else if !scale_down
                && inner.current_global < inner.user_ceiling
                && successes >= self.cfg.scale_up_min_samples
                && error_rate < self.cfg.scale_up_error_rate_max
                && avg_throughput >= self.cfg.scale_up_min_throughput_bps
            {
                inner.current_global += 1;
                inner.current_per_host = (inner.current_per_host + 1).min(inner.current_global);
                inner.last_adjustment = Some(Instant::now());
                debug!(successes, avg_throughput, "adaptive scale up");
                Some((inner.current_global, inner.current_per_host))
            } else {
                None
            }
        };

        if let Some((global, per_host)) = adjustment {
            info!(global, per_host, "adaptive concurrency adjusted");
            (self.callback)(global, per_host);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn cfg_no_cooldown() -> AdaptiveConfig {
        AdaptiveConfig {
            cooldown_ms: 0,
            ..AdaptiveConfig::default()
        }
    }

    fn controller(
        cfg: AdaptiveConfig,
        ceiling: usize,
    ) -> (Arc<AdaptiveConcurrencyController>, Arc<Mutex<Vec<(usize, usize)>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let controller = Arc::new(AdaptiveConcurrencyController::new(
            cfg,
            ceiling,
            Box::new(move |g, h| sink.lock().unwrap().push((g, h))),
        ));
        (controller, seen)
    }

    const GOOD_BPS: f64 = 1024.0 * 1024.0;

    #[test]
    fn test_starts_conservative() {
        let (c, _) = controller(cfg_no_cooldown(), 3);
        assert_eq!(c.current(), (1, 1));
    }

    #[test]
    fn test_scale_up_on_healthy_window() {
        let (c, seen) = controller(cfg_no_cooldown(), 3);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (2, 2));
        assert_eq!(seen.lock().unwrap().as_slice(), &[(2, 2)]);
    }

    #[test]
    fn test_no_scale_up_without_samples() {
        let (c, _) = controller(cfg_no_cooldown(), 3);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (1, 1));
    }

    #[test]
    fn test_no_scale_up_past_ceiling() {
        let (c, _) = controller(cfg_no_cooldown(), 1);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (1, 1));
    }

    #[test]
    fn test_scale_down_on_errors() {
        // reach global=2, then flood the window with permanent errors
        let (c, seen) = controller(cfg_no_cooldown(), 3);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (2, 2));

        for _ in 0..10 {
            c.record_permanent_error();
        }
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (1, 1));
        assert_eq!(seen.lock().unwrap().last(), Some(&(1, 1)));
    }

    #[test]
    fn test_scale_down_on_transient_flood() {
        let (c, _) = controller(cfg_no_cooldown(), 3);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        for _ in 0..4 {
            c.record_transient_retry();
        }
        c.evaluate();
        assert_eq!(c.current(), (1, 1));
    }

    #[test]
    fn test_never_below_one() {
        let (c, _) = controller(cfg_no_cooldown(), 3);
        for _ in 0..10 {
            c.record_permanent_error();
            c.evaluate();
        }
        assert_eq!(c.current(), (1, 1));
    }

    #[test]
    fn test_cooldown_blocks_consecutive_adjustments() {
        let cfg = AdaptiveConfig {
            cooldown_ms: 60_000,
            ..AdaptiveConfig::default()
        };
        let (c, seen) = controller(cfg, 3);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (2, 2));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_ceiling_clamps_current_immediately() {
        let (c, seen) = controller(cfg_no_cooldown(), 3);
        c.record_success(GOOD_BPS);
        c.record_success(GOOD_BPS);
        c.evaluate();
        assert_eq!(c.current(), (2, 2));

        c.set_user_ceiling(1);
        assert_eq!(c.current(), (1, 1));
        assert_eq!(seen.lock().unwrap().last(), Some(&(1, 1)));
    }
}
