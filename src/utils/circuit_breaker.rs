use std::sync::Mutex;
use std::time::{Duration, Instant};

// ============================================================================
// Circuit Breaker
// ============================================================================
//
// Guards the publish path against a misbehaving broker. Consecutive failures
// open the circuit; after `reset_timeout` a single probe is let through, and
// enough probe successes close it again.
//
// The lock is a std Mutex held only for bookkeeping; the guarded operation
// itself runs outside the critical section.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Clone, Debug)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long to block before probing recovery.
    pub reset_timeout: Duration,
    /// Probe successes required to close from half-open.
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    config: CircuitBreakerConfig,
}

#[derive(Debug, thiserror::Error)]
#[error("Circuit breaker is open")]
pub struct CircuitOpen;

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
            }),
            config,
        }
    }

    /// Gate a call. Returns `Err(CircuitOpen)` without running anything when
    /// the circuit is open and the reset timeout has not elapsed.
    pub fn check(&self) -> Result<(), CircuitOpen> {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let elapsed = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.config.reset_timeout {
                    tracing::info!("Circuit breaker transitioning to HalfOpen");
                    inner.state = CircuitState::HalfOpen;
                    inner.probe_successes = 0;
                    Ok(())
                } else {
                    Err(CircuitOpen)
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures = 0;
        if inner.state == CircuitState::HalfOpen {
            inner.probe_successes += 1;
            if inner.probe_successes >= self.config.success_threshold {
                tracing::info!(
                    probes = inner.probe_successes,
                    "Circuit breaker closing after successful probes"
                );
                inner.state = CircuitState::Closed;
                inner.opened_at = None;
                inner.probe_successes = 0;
            }
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock().expect("circuit breaker lock poisoned");
        inner.consecutive_failures += 1;
        match inner.state {
            CircuitState::Closed => {
                if inner.consecutive_failures >= self.config.failure_threshold {
                    tracing::warn!(
                        failures = inner.consecutive_failures,
                        "Circuit breaker opening"
                    );
                    inner.state = CircuitState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!("Probe failed, reopening circuit");
                inner.state = CircuitState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probe_successes = 0;
            }
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
            }
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner
            .lock()
            .expect("circuit breaker lock poisoned")
            .state
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
            success_threshold: 1,
        })
    }

    #[test]
    fn test_opens_after_consecutive_failures() {
        let cb = breaker(3, Duration::from_secs(60));

        for _ in 0..3 {
            assert!(cb.check().is_ok());
            cb.record_failure();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.check().is_err());
    }

    #[test]
    fn test_success_resets_failure_streak() {
        let cb = breaker(3, Duration::from_secs(60));

        cb.record_failure();
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_closes_circuit() {
        let cb = breaker(1, Duration::from_millis(0));

        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Open);

        // Reset timeout of zero: the next check flips to half-open.
        assert!(cb.check().is_ok());
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_half_open_probe_failure_reopens() {
        let cb = breaker(1, Duration::from_millis(0));

        cb.record_failure();
        assert!(cb.check().is_ok());
        cb.record_failure();

        assert_eq!(cb.state(), CircuitState::Open);
    }
}
