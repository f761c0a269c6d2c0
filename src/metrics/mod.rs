use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};

// ============================================================================
// Metrics - Prometheus counters for the choreography
// ============================================================================
//
// Covers:
// - broker publishes and consumes (per routing key / queue)
// - handler outcomes (requeues, dead-letters)
// - scheduler activity (scheduled, deduplicated, completed, failed, cancelled)
// - circuit breaker state on the publish path
//
// The registry is exposed for scraping by whatever serving layer the
// deployment wires up; no HTTP server lives in this crate.
// ============================================================================

pub struct Metrics {
    registry: Registry,

    pub events_published: IntCounterVec,
    pub events_consumed: IntCounterVec,
    pub handler_requeues: IntCounterVec,
    pub dead_letters: IntCounterVec,

    pub jobs_scheduled: IntCounter,
    pub jobs_deduplicated: IntCounter,
    pub jobs_completed: IntCounter,
    pub jobs_failed: IntCounter,
    pub jobs_cancelled: IntCounter,
    pub expirations_skipped: IntCounter,

    pub circuit_breaker_state: IntGauge,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let events_published = IntCounterVec::new(
            Opts::new("events_published_total", "Events published to the broker"),
            &["routing_key"],
        )?;
        registry.register(Box::new(events_published.clone()))?;

        let events_consumed = IntCounterVec::new(
            Opts::new("events_consumed_total", "Events acknowledged by consumers"),
            &["queue"],
        )?;
        registry.register(Box::new(events_consumed.clone()))?;

        let handler_requeues = IntCounterVec::new(
            Opts::new(
                "handler_requeues_total",
                "Deliveries nacked and requeued after a retryable handler failure",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(handler_requeues.clone()))?;

        let dead_letters = IntCounterVec::new(
            Opts::new(
                "dead_letters_total",
                "Deliveries routed to a dead-letter queue",
            ),
            &["queue"],
        )?;
        registry.register(Box::new(dead_letters.clone()))?;

        let jobs_scheduled = IntCounter::new("jobs_scheduled_total", "Delayed jobs accepted")?;
        registry.register(Box::new(jobs_scheduled.clone()))?;

        let jobs_deduplicated = IntCounter::new(
            "jobs_deduplicated_total",
            "Job adds dropped by job-id dedup",
        )?;
        registry.register(Box::new(jobs_deduplicated.clone()))?;

        let jobs_completed = IntCounter::new("jobs_completed_total", "Jobs finished successfully")?;
        registry.register(Box::new(jobs_completed.clone()))?;

        let jobs_failed = IntCounter::new(
            "jobs_failed_total",
            "Jobs that exhausted their attempt budget",
        )?;
        registry.register(Box::new(jobs_failed.clone()))?;

        let jobs_cancelled = IntCounter::new("jobs_cancelled_total", "Delayed jobs cancelled")?;
        registry.register(Box::new(jobs_cancelled.clone()))?;

        let expirations_skipped = IntCounter::new(
            "expirations_skipped_total",
            "Orders whose expiry was already in the past at scheduling time",
        )?;
        registry.register(Box::new(expirations_skipped.clone()))?;

        let circuit_breaker_state = IntGauge::new(
            "publish_circuit_breaker_state",
            "Publish circuit breaker state (0=Closed, 1=Open, 2=HalfOpen)",
        )?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;

        Ok(Self {
            registry,
            events_published,
            events_consumed,
            handler_requeues,
            dead_letters,
            jobs_scheduled,
            jobs_deduplicated,
            jobs_completed,
            jobs_failed,
            jobs_cancelled,
            expirations_skipped,
            circuit_breaker_state,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

// Test-only convenience: production wiring goes through `new()` and
// propagates registration failures.
#[cfg(test)]
impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_register_cleanly() {
        let metrics = Metrics::new().unwrap();
        assert!(!metrics.registry().gather().is_empty());
    }

    #[test]
    fn test_counters_increment() {
        let metrics = Metrics::new().unwrap();

        metrics
            .events_published
            .with_label_values(&["order:created"])
            .inc();
        metrics.jobs_scheduled.inc();
        metrics.jobs_scheduled.inc();

        assert_eq!(
            metrics
                .events_published
                .with_label_values(&["order:created"])
                .get(),
            1
        );
        assert_eq!(metrics.jobs_scheduled.get(), 2);
    }
}
