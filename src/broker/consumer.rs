use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::events::{DomainEvent, Envelope};

use super::topology::Queue;
use super::Broker;

// ============================================================================
// Consumer - prefetch=1 delivery loop with manual ack/nack
// ============================================================================
//
// One consumer task per listener; at most one unacknowledged delivery is in
// flight at a time. Handler outcomes are explicit:
//
//   Ok                      -> ack
//   HandlerError::Retryable -> nack + requeue at the head (unlimited, paced
//                              by the configured redelivery delay)
//   HandlerError::Fatal     -> nack + dead-letter to <queue>.dead-letter
//
// Payloads that fail to decode never reach a handler; they dead-letter
// directly.
//
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Retryable handler failure: {0}")]
    Retryable(anyhow::Error),

    #[error("Fatal handler failure: {0}")]
    Fatal(anyhow::Error),
}

impl HandlerError {
    pub fn retryable(error: impl Into<anyhow::Error>) -> Self {
        Self::Retryable(error.into())
    }

    pub fn fatal(error: impl Into<anyhow::Error>) -> Self {
        Self::Fatal(error.into())
    }
}

/// A cross-service listener. Handlers must be idempotent: the broker is
/// at-least-once and redelivers on every retryable failure.
#[async_trait]
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &'static str;

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError>;
}

pub struct Listener {
    broker: Broker,
}

struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

pub struct ListenerHandle {
    queue: String,
    shutdown: Arc<ShutdownSignal>,
    task: JoinHandle<()>,
}

impl Listener {
    pub fn new(broker: Broker) -> Self {
        Self { broker }
    }

    /// Bind `queue` to `(exchange, pattern)` and consume indefinitely.
    pub async fn listen(
        &self,
        queue_name: &str,
        exchange: &str,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> ListenerHandle {
        self.broker.assert_exchange(exchange).await;
        self.broker.bind_queue(queue_name, exchange, pattern).await;
        let queue = self.broker.declare_queue(queue_name).await;

        let shutdown = Arc::new(ShutdownSignal {
            requested: AtomicBool::new(false),
            notify: Notify::new(),
        });

        tracing::info!(
            queue = queue_name,
            exchange,
            pattern,
            handler = handler.name(),
            "Listener started"
        );

        let task = tokio::spawn(consume_loop(
            self.broker.clone(),
            queue,
            handler,
            shutdown.clone(),
        ));

        ListenerHandle {
            queue: queue_name.to_string(),
            shutdown,
            task,
        }
    }
}

impl ListenerHandle {
    /// Stop consuming. An in-flight handler gets `grace` to finish before
    /// the task is abandoned.
    pub async fn stop(mut self, grace: Duration) {
        self.shutdown.requested.store(true, Ordering::SeqCst);
        self.shutdown.notify.notify_waiters();

        match tokio::time::timeout(grace, &mut self.task).await {
            Ok(_) => tracing::info!(queue = %self.queue, "Listener stopped"),
            Err(_) => {
                tracing::warn!(
                    queue = %self.queue,
                    grace_secs = grace.as_secs(),
                    "Listener did not stop within grace window, abandoning"
                );
                self.task.abort();
            }
        }
    }
}

async fn consume_loop(
    broker: Broker,
    queue: Arc<Queue>,
    handler: Arc<dyn EventHandler>,
    shutdown: Arc<ShutdownSignal>,
) {
    let redelivery_delay = broker.config().redelivery_delay;

    loop {
        if shutdown.requested.load(Ordering::SeqCst) {
            break;
        }

        let mut envelope = tokio::select! {
            _ = shutdown.notify.notified() => continue,
            envelope = queue.pop() => envelope,
        };

        // prefetch=1: nothing else is pulled off this queue until the
        // delivery below is acked or nacked.
        let event = match DomainEvent::decode(&envelope.routing_key, &envelope.body) {
            Ok(event) => event,
            Err(error) => {
                tracing::error!(
                    queue = queue.name(),
                    routing_key = %envelope.routing_key,
                    error = %error,
                    "Rejecting undecodable delivery to dead-letter"
                );
                broker.dead_letter(queue.name(), envelope).await;
                continue;
            }
        };

        match handler.handle(event).await {
            Ok(()) => {
                broker
                    .metrics()
                    .events_consumed
                    .with_label_values(&[queue.name()])
                    .inc();
                tracing::debug!(
                    queue = queue.name(),
                    routing_key = %envelope.routing_key,
                    handler = handler.name(),
                    "Delivery acked"
                );
            }
            Err(HandlerError::Retryable(error)) => {
                tracing::warn!(
                    queue = queue.name(),
                    routing_key = %envelope.routing_key,
                    handler = handler.name(),
                    error = %error,
                    "Handler failed, nack + requeue"
                );
                broker
                    .metrics()
                    .handler_requeues
                    .with_label_values(&[queue.name()])
                    .inc();
                envelope.redelivered = true;
                tokio::time::sleep(redelivery_delay).await;
                queue.push_front(envelope).await;
            }
            Err(HandlerError::Fatal(error)) => {
                tracing::error!(
                    queue = queue.name(),
                    routing_key = %envelope.routing_key,
                    handler = handler.name(),
                    error = %error,
                    "Handler failed fatally, nack + dead-letter"
                );
                broker.dead_letter(queue.name(), envelope).await;
            }
        }
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::broker::{BrokerConfig, Publisher};
    use crate::events::{exchanges, routing_keys, OrderExpired};
    use crate::metrics::Metrics;

    fn test_broker() -> Broker {
        Broker::with_config(
            BrokerConfig {
                redelivery_delay: Duration::from_millis(5),
                shutdown_grace: Duration::from_secs(1),
            },
            Arc::new(Metrics::default()),
        )
    }

    fn expired_event() -> DomainEvent {
        DomainEvent::OrderExpired(OrderExpired {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_number: "ORD-1".to_string(),
            expired_at: Utc::now(),
        })
    }

    async fn wait_for(check: impl Fn() -> bool) {
        for _ in 0..400 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn wait_for_depth(broker: &Broker, queue: &str, depth: usize) {
        for _ in 0..400 {
            if broker.queue_depth(queue).await == depth {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("queue {queue} never reached depth {depth}");
    }

    /// Succeeds after a configurable number of retryable failures.
    struct FlakyHandler {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl FlakyHandler {
        fn new(failures: u32) -> Self {
            Self {
                failures_left: AtomicU32::new(failures),
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl EventHandler for FlakyHandler {
        fn name(&self) -> &'static str {
            "flaky-handler"
        }

        async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(HandlerError::retryable(anyhow::anyhow!(
                    "simulated storage outage"
                )));
            }
            Ok(())
        }
    }

    struct FatalHandler {
        calls: AtomicU32,
    }

    #[async_trait]
    impl EventHandler for FatalHandler {
        fn name(&self) -> &'static str {
            "fatal-handler"
        }

        async fn handle(&self, _event: DomainEvent) -> Result<(), HandlerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::fatal(anyhow::anyhow!("unprocessable")))
        }
    }

    #[tokio::test]
    async fn test_successful_handler_acks_delivery() {
        let broker = test_broker();
        let handler = Arc::new(FlakyHandler::new(0));

        let handle = Listener::new(broker.clone())
            .listen("svc.order.expired", exchanges::ORDER, "order:expired", handler.clone())
            .await;

        Publisher::new(broker.clone())
            .publish(&expired_event())
            .await
            .unwrap();

        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        assert_eq!(broker.queue_depth("svc.order.expired").await, 0);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_retryable_failure_requeues_until_success() {
        // A handler that throws once and then succeeds must converge to the
        // same end state as a first-try success.
        let broker = test_broker();
        let handler = Arc::new(FlakyHandler::new(1));

        let handle = Listener::new(broker.clone())
            .listen("svc.order.expired", exchanges::ORDER, "order:expired", handler.clone())
            .await;

        Publisher::new(broker.clone())
            .publish(&expired_event())
            .await
            .unwrap();

        wait_for(|| handler.calls.load(Ordering::SeqCst) == 2).await;
        wait_for(|| {
            broker
                .metrics()
                .events_consumed
                .with_label_values(&["svc.order.expired"])
                .get()
                == 1
        })
        .await;

        assert_eq!(
            broker
                .metrics()
                .handler_requeues
                .with_label_values(&["svc.order.expired"])
                .get(),
            1
        );
        assert_eq!(broker.queue_depth("svc.order.expired").await, 0);
        assert_eq!(broker.queue_depth("svc.order.expired.dead-letter").await, 0);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_fatal_failure_dead_letters_once() {
        let broker = test_broker();
        let handler = Arc::new(FatalHandler {
            calls: AtomicU32::new(0),
        });

        let handle = Listener::new(broker.clone())
            .listen("svc.order.expired", exchanges::ORDER, "order:expired", handler.clone())
            .await;

        Publisher::new(broker.clone())
            .publish(&expired_event())
            .await
            .unwrap();

        wait_for(|| handler.calls.load(Ordering::SeqCst) == 1).await;
        wait_for_depth(&broker, "svc.order.expired.dead-letter", 1).await;

        // No redelivery for fatal failures.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        handle.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_malformed_payload_dead_letters_without_handler() {
        let broker = test_broker();
        let handler = Arc::new(FlakyHandler::new(0));

        let handle = Listener::new(broker.clone())
            .listen("svc.order.expired", exchanges::ORDER, "order:expired", handler.clone())
            .await;

        // Bypass the typed publisher to inject a malformed body.
        broker
            .route(Envelope {
                exchange: exchanges::ORDER.to_string(),
                routing_key: routing_keys::ORDER_EXPIRED.to_string(),
                body: b"{\"id\": \"not-a-uuid\"}".to_vec(),
                persistent: true,
                redelivered: false,
            })
            .await;

        wait_for_depth(&broker, "svc.order.expired.dead-letter", 1).await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        handle.stop(Duration::from_secs(1)).await;
    }
}
