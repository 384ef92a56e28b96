// Failure-handling machinery for the broker connection: a circuit breaker
// gating reconnect attempts and an exponential backoff with jitter spacing
// them out.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

// ---------------------------------------------------------------------------
// Circuit breaker: Closed -> Open -> HalfOpen -> Closed
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

pub(crate) struct CircuitBreaker {
    pub state: CircuitState,
    failure_count: u32,
    probe_successes: u32,
    probes_issued: u32,
    last_failure: Option<Instant>,
    pub failure_threshold: u32,
    pub reset_timeout: Duration,
    /// Probes allowed while half-open; the same count of consecutive
    /// successes closes the circuit again.
    pub half_open_probes: u32,
}

impl CircuitBreaker {
    pub fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            probe_successes: 0,
            probes_issued: 0,
            last_failure: None,
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
            half_open_probes: 3,
        }
    }

    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => match self.last_failure {
                Some(last) if last.elapsed() >= self.reset_timeout => {
                    self.state = CircuitState::HalfOpen;
                    self.probes_issued = 1;
                    self.probe_successes = 0;
                    true
                }
                _ => false,
            },
            CircuitState::HalfOpen => {
                if self.probes_issued < self.half_open_probes {
                    self.probes_issued += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.probe_successes += 1;
                if self.probe_successes >= self.half_open_probes {
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.probe_successes = 0;
                }
            }
            CircuitState::Closed => {
                self.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.last_failure = Some(Instant::now());
        match self.state {
            CircuitState::Closed => {
                self.failure_count += 1;
                if self.failure_count >= self.failure_threshold {
                    self.state = CircuitState::Open;
                }
            }
            // One failed probe trips the circuit straight back open.
            CircuitState::HalfOpen => {
                self.state = CircuitState::Open;
                self.probes_issued = 0;
            }
            CircuitState::Open => {}
        }
    }
}

// ---------------------------------------------------------------------------
// Exponential backoff with +/-20% jitter
// ---------------------------------------------------------------------------

pub(crate) struct ExponentialBackoff {
    pub initial: Duration,
    pub max: Duration,
    pub multiplier: f64,
    current: Duration,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        let initial = Duration::from_secs(1);
        Self {
            initial,
            max: Duration::from_secs(60),
            multiplier: 1.5,
            current: initial,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current.as_secs_f64();
        // Jitter without a RNG dependency: the sub-second clock is noise
        // enough to keep reconnecting instances from thundering together.
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos();
        let jitter = 0.8 + 0.4 * (nanos % 1000) as f64 / 1000.0;
        let delay = Duration::from_secs_f64((base * jitter).min(self.max.as_secs_f64()));
        self.current =
            Duration::from_secs_f64((base * self.multiplier).min(self.max.as_secs_f64()));
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_stays_closed_on_success() {
        let mut cb = CircuitBreaker::new();
        assert!(cb.can_execute());
        cb.record_success();
        assert_eq!(cb.state, CircuitState::Closed);
    }

    #[test]
    fn test_breaker_opens_after_threshold() {
        let mut cb = CircuitBreaker::new();
        for _ in 0..10 {
            cb.record_failure();
        }
        assert_eq!(cb.state, CircuitState::Open);
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_breaker_closes_after_successful_probes() {
        let mut cb = CircuitBreaker {
            reset_timeout: Duration::from_millis(1),
            ..CircuitBreaker::new()
        };
        for _ in 0..10 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        assert!(cb.can_execute());
        assert_eq!(cb.state, CircuitState::HalfOpen);
        cb.record_success();
        cb.record_success();
        cb.record_success();
        assert_eq!(cb.state, CircuitState::Closed);
    }

    #[test]
    fn test_breaker_reopens_on_failed_probe() {
        let mut cb = CircuitBreaker {
            reset_timeout: Duration::from_millis(1),
            ..CircuitBreaker::new()
        };
        for _ in 0..10 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        assert!(cb.can_execute());
        cb.record_failure();
        assert_eq!(cb.state, CircuitState::Open);
    }

    #[test]
    fn test_breaker_limits_half_open_probes() {
        let mut cb = CircuitBreaker {
            reset_timeout: Duration::from_millis(1),
            ..CircuitBreaker::new()
        };
        for _ in 0..10 {
            cb.record_failure();
        }
        std::thread::sleep(Duration::from_millis(2));
        assert!(cb.can_execute());
        assert!(cb.can_execute());
        assert!(cb.can_execute());
        assert!(!cb.can_execute());
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = ExponentialBackoff::new();
        let d1 = b.next_delay();
        assert!(d1.as_secs_f64() >= 0.7);
        for _ in 0..50 {
            b.next_delay();
        }
        let capped = b.next_delay();
        assert!(capped.as_secs_f64() <= 61.0);
    }

    #[test]
    fn test_backoff_reset() {
        let mut b = ExponentialBackoff::new();
        for _ in 0..20 {
            b.next_delay();
        }
        b.reset();
        assert!(b.next_delay().as_secs_f64() < 2.0);
    }
}
