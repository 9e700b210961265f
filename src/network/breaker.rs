use crate::core::error::EngineError;
/// Per-host circuit breaker
///
/// Closed until `failure_threshold` consecutive failures, then open: calls
/// fail fast with `CircuitOpen` until `open_timeout` passes, after which one
/// probe is admitted (half-open). A probe success closes the breaker, a
/// probe failure reopens it.
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct HostBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

impl Default for HostBreaker {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

pub struct CircuitBreaker {
    hosts: Mutex<HashMap<String, HostBreaker>>,
    failure_threshold: u32,
    open_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, open_timeout: Duration) -> Self {
        Self {
            hosts: Mutex::new(HashMap::new()),
            failure_threshold: failure_threshold.max(1),
            open_timeout,
        }
    }

    /// Gate a network operation against `host`. Returns `CircuitOpen` while
    /// the breaker is open; admits one probe once the timeout has passed.
    pub fn check(&self, host: &str) -> Result<(), EngineError> {
        let mut hosts = self.hosts.lock().unwrap();
        let breaker = hosts.entry(host.to_string()).or_default();
        match breaker.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let elapsed = breaker.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_timeout {
                    breaker.state = BreakerState::HalfOpen;
                    info!(host, "circuit breaker half-open, admitting probe");
                    Ok(())
                } else {
                    Err(EngineError::CircuitOpen {
                        host: host.to_string(),
                    })
                }
            }
        }
    }

    pub fn record_success(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        if let Some(breaker) = hosts.get_mut(host) {
            if breaker.state != BreakerState::Closed {
                info!(host, "circuit breaker closed");
            }
            breaker.state = BreakerState::Closed;
            breaker.consecutive_failures = 0;
            breaker.opened_at = None;
        }
    }

    pub fn record_failure(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap();
        let breaker = hosts.entry(host.to_string()).or_default();
        match breaker.state {
            BreakerState::HalfOpen => {
                // failed probe reopens immediately
                breaker.state = BreakerState::Open;
                breaker.opened_at = Some(Instant::now());
                warn!(host, "circuit breaker reopened after failed probe");
            }
            _ => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= self.failure_threshold {
                    breaker.state = BreakerState::Open;
                    breaker.opened_at = Some(Instant::now());
                    warn!(
                        host,
                        failures = breaker.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
        }
    }

    pub fn is_open(&self, host: &str) -> bool {
        self.hosts
            .lock()
            .unwrap()
            .get(host)
            .map(|b| b.state == BreakerState::Open)
            .unwrap_or(false)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(5, Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opens_after_threshold() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        for _ in 0..2 {
            breaker.record_failure("a.com");
        }
        assert!(breaker.check("a.com").is_ok());

        breaker.record_failure("a.com");
        assert!(breaker.is_open("a.com"));
        let err = breaker.check("a.com").unwrap_err();
        assert_eq!(err.error_code(), "CIRCUIT_OPEN");
        assert!(err.is_transient());
    }

    #[test]
    fn test_success_resets_failure_count() {
        let breaker = CircuitBreaker::new(3, Duration::from_secs(60));
        breaker.record_failure("a.com");
        breaker.record_failure("a.com");
        breaker.record_success("a.com");
        breaker.record_failure("a.com");
        breaker.record_failure("a.com");
        assert!(breaker.check("a.com").is_ok());
    }

    #[test]
    fn test_hosts_are_independent() {
        let breaker = CircuitBreaker::new(1, Duration::from_secs(60));
        breaker.record_failure("a.com");
        assert!(breaker.check("a.com").is_err());
        assert!(breaker.check("b.com").is_ok());
    }

    #[test]
    fn test_half_open_probe_cycle() {
        let breaker = CircuitBreaker::new(1, Duration::from_millis(0));
        breaker.record_failure("a.com");
        // timeout of zero: the next check admits a probe
        assert!(breaker.check("a.com").is_ok());
        // failed probe reopens without needing the threshold again
        breaker.record_failure("a.com");
        assert!(breaker.is_open("a.com"));

        // successful probe closes
        assert!(breaker.check("a.com").is_ok());
        breaker.record_success("a.com");
        assert!(breaker.check("a.com").is_ok());
        assert!(!breaker.is_open("a.com"));
    }
}
