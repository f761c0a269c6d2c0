use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

// ============================================================================
// Job Model
// ============================================================================

#[derive(Debug, Clone)]
pub struct Job {
    /// Stable identifier; the dedup key for idempotent scheduling.
    pub id: String,
    pub name: String,
    pub payload: Value,
    /// Attempts already made (0 until the first run finishes).
    pub attempts_made: u32,
    pub opts: JobOptions,
}

#[derive(Debug, Clone)]
pub struct JobOptions {
    pub delay: Duration,
    /// Caller-provided id. When absent a random one is generated, which
    /// opts out of dedup.
    pub job_id: Option<String>,
    /// Total attempt budget, first run included.
    pub attempts: u32,
    pub backoff: Backoff,
    pub remove_on_complete: Retention,
    pub remove_on_fail: Retention,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            delay: Duration::ZERO,
            job_id: None,
            attempts: 3,
            backoff: Backoff::Exponential(Duration::from_secs(2)),
            remove_on_complete: Retention {
                age: Duration::from_secs(24 * 60 * 60),
                count: 1000,
            },
            remove_on_fail: Retention {
                age: Duration::from_secs(7 * 24 * 60 * 60),
                count: 5000,
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Backoff {
    Fixed(Duration),
    /// Base delay doubled on every further retry.
    Exponential(Duration),
}

impl Backoff {
    /// Delay before retry number `retry` (1-based).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        match self {
            Backoff::Fixed(delay) => *delay,
            Backoff::Exponential(base) => {
                let factor = 1u32 << retry.clamp(1, 20).saturating_sub(1);
                *base * factor
            }
        }
    }
}

/// Bounded retention for finished jobs: trimmed by age and by count.
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub age: Duration,
    pub count: usize,
}

/// Executes jobs pulled off the queue by the worker pool.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &Job) -> anyhow::Result<()>;
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles() {
        let backoff = Backoff::Exponential(Duration::from_secs(2));

        assert_eq!(backoff.delay_for_retry(1), Duration::from_secs(2));
        assert_eq!(backoff.delay_for_retry(2), Duration::from_secs(4));
        assert_eq!(backoff.delay_for_retry(3), Duration::from_secs(8));
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed(Duration::from_millis(500));
        assert_eq!(backoff.delay_for_retry(1), Duration::from_millis(500));
        assert_eq!(backoff.delay_for_retry(7), Duration::from_millis(500));
    }

    #[test]
    fn test_default_options_match_expiration_policy() {
        let opts = JobOptions::default();
        assert_eq!(opts.attempts, 3);
        assert!(matches!(opts.backoff, Backoff::Exponential(base) if base == Duration::from_secs(2)));
        assert_eq!(opts.remove_on_complete.count, 1000);
    }
}
