use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::broker::{EventHandler, HandlerError, Publisher};
use crate::events::{DomainEvent, OrderExpired};
use crate::scheduler::{AddOutcome, Job, JobOptions, JobProcessor, JobQueue};

// ============================================================================
// Jobs Service - order expiration scheduling
// ============================================================================
//
// Turns `order:created` into a delayed expiration job and `payment:success`
// into a cancellation of that job. When the job survives to run, it emits
// `order:expired`; the order service decides whether expiry still applies.
//
// ============================================================================

pub const EXPIRATION_JOB: &str = "order-expiration";

/// Deterministic job id so a redelivered `order:created` dedups instead of
/// double-scheduling, and `payment:success` can cancel by id.
pub fn expiration_job_id(order_id: Uuid) -> String {
    format!("order-expiration-{order_id}")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExpirationPayload {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub order_number: String,
    pub expires_at: DateTime<Utc>,
}

// ============================================================================
// Listeners
// ============================================================================

/// Schedules the expiration job from `order:created`.
pub struct ExpirationScheduler {
    queue: JobQueue,
}

impl ExpirationScheduler {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler for ExpirationScheduler {
    fn name(&self) -> &'static str {
        "jobs-svc:expiration-scheduler"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::OrderCreated(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        let now = Utc::now();
        let delay = payload.expires_at - now;
        if delay <= chrono::Duration::zero() {
            // Stale delivery: the window already elapsed before the job
            // could be scheduled. Expiry is left to the next consumer of
            // the original event rather than firing a job in the past.
            tracing::warn!(
                order_id = %payload.id,
                expires_at = %payload.expires_at,
                "Payment window already elapsed at scheduling time, skipping job"
            );
            self.queue.metrics().expirations_skipped.inc();
            return Ok(());
        }

        let delay = delay
            .to_std()
            .map_err(|error| HandlerError::fatal(anyhow::anyhow!("bad delay: {error}")))?;

        let outcome = self
            .queue
            .add(
                EXPIRATION_JOB,
                serde_json::to_value(ExpirationPayload {
                    order_id: payload.id,
                    user_id: payload.user_id,
                    order_number: payload.order_number.clone(),
                    expires_at: payload.expires_at,
                })
                .map_err(|error| HandlerError::fatal(error))?,
                JobOptions {
                    job_id: Some(expiration_job_id(payload.id)),
                    delay,
                    ..JobOptions::default()
                },
            )
            .await;

        if let AddOutcome::Scheduled { job_id } = outcome {
            tracing::info!(
                order_id = %payload.id,
                job_id = %job_id,
                delay_secs = delay.as_secs(),
                "Expiration job scheduled"
            );
        }
        Ok(())
    }
}

/// Cancels the pending expiration job when payment lands in time.
pub struct ExpirationCanceller {
    queue: JobQueue,
}

impl ExpirationCanceller {
    pub fn new(queue: JobQueue) -> Self {
        Self { queue }
    }
}

#[async_trait]
impl EventHandler for ExpirationCanceller {
    fn name(&self) -> &'static str {
        "jobs-svc:expiration-canceller"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::PaymentSucceeded(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        let job_id = expiration_job_id(payload.order_id);
        if self.queue.cancel(&job_id).await {
            tracing::info!(
                order_id = %payload.order_id,
                job_id = %job_id,
                "Expiration job cancelled after payment"
            );
        } else {
            // Already fired or never scheduled; the conditional expiry on
            // the order side makes either case safe.
            tracing::debug!(
                order_id = %payload.order_id,
                job_id = %job_id,
                "No pending expiration job to cancel"
            );
        }
        Ok(())
    }
}

// ============================================================================
// Processor
// ============================================================================

/// Runs the expiration job: emits `order:expired`. The job-level retry with
/// backoff covers publish failures.
pub struct ExpirationProcessor {
    publisher: Arc<Publisher>,
}

impl ExpirationProcessor {
    pub fn new(publisher: Arc<Publisher>) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl JobProcessor for ExpirationProcessor {
    async fn process(&self, job: &Job) -> anyhow::Result<()> {
        let payload: ExpirationPayload = serde_json::from_value(job.payload.clone())?;

        tracing::info!(
            order_id = %payload.order_id,
            order_number = %payload.order_number,
            "Payment window elapsed, emitting order:expired"
        );

        self.publisher
            .publish(&DomainEvent::OrderExpired(OrderExpired {
                id: payload.order_id,
                user_id: payload.user_id,
                order_number: payload.order_number,
                expired_at: Utc::now(),
            }))
            .await?;
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
