use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;

use crate::events::Envelope;
use crate::metrics::Metrics;

mod consumer;
mod publisher;
mod topology;

pub use consumer::{EventHandler, HandlerError, Listener, ListenerHandle};
pub use publisher::Publisher;
pub use topology::pattern_matches;

use topology::Queue;

// ============================================================================
// Broker - in-process topic-exchange message broker
// ============================================================================
//
// Implements the delivery contract the services are written against:
// durable topic exchanges, consumer-declared queues bound by pattern,
// persistent messages, prefetch=1 consumption with manual ack/nack.
//
// Guarantee to callers: at-least-once, no ordering across exchanges or
// queues. Handlers must be idempotent.
//
// The broker is an explicitly constructed value injected into each service
// at startup; its lifecycle belongs to the composition root.
//
// ============================================================================

#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Pause before a nacked delivery is offered again.
    pub redelivery_delay: Duration,
    /// How long shutdown waits for an in-flight handler before abandoning it.
    pub shutdown_grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            redelivery_delay: Duration::from_millis(100),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Circuit breaker open for broker publishes")]
    CircuitOpen,

    #[error("Failed to serialize event payload: {0}")]
    Serialize(#[from] serde_json::Error),
}

struct Binding {
    pattern: String,
    queue: Arc<Queue>,
}

#[derive(Default)]
struct Exchange {
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, Exchange>,
    queues: HashMap<String, Arc<Queue>>,
}

struct BrokerInner {
    state: RwLock<BrokerState>,
    config: BrokerConfig,
    metrics: Arc<Metrics>,
}

#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(metrics: Arc<Metrics>) -> Self {
        Self::with_config(BrokerConfig::default(), metrics)
    }

    pub fn with_config(config: BrokerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                state: RwLock::new(BrokerState::default()),
                config,
                metrics,
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub(crate) fn metrics(&self) -> &Arc<Metrics> {
        &self.inner.metrics
    }

    /// Declare a durable topic exchange. Idempotent; called by both
    /// publishers and listeners.
    pub async fn assert_exchange(&self, name: &str) {
        let mut state = self.inner.state.write().await;
        if !state.exchanges.contains_key(name) {
            tracing::debug!(exchange = name, "Declared topic exchange");
            state.exchanges.insert(name.to_string(), Exchange::default());
        }
    }

    /// Declare a durable, non-exclusive queue. Idempotent.
    pub(crate) async fn declare_queue(&self, name: &str) -> Arc<Queue> {
        let mut state = self.inner.state.write().await;
        state
            .queues
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(queue = name, "Declared queue");
                Queue::new(name)
            })
            .clone()
    }

    /// Bind `queue` to `(exchange, pattern)`, declaring both as needed.
    pub async fn bind_queue(&self, queue: &str, exchange: &str, pattern: &str) {
        let queue = self.declare_queue(queue).await;
        let mut state = self.inner.state.write().await;
        let exchange_entry = state.exchanges.entry(exchange.to_string()).or_default();

        let already_bound = exchange_entry
            .bindings
            .iter()
            .any(|b| b.pattern == pattern && b.queue.name() == queue.name());
        if already_bound {
            return;
        }

        tracing::info!(
            queue = queue.name(),
            exchange,
            pattern,
            "Bound queue to exchange"
        );
        exchange_entry.bindings.push(Binding {
            pattern: pattern.to_string(),
            queue,
        });
    }

    /// Deliver an envelope to every queue whose binding matches its routing
    /// key. Returns the number of queues reached; zero is not an error
    /// (fire-and-forget publish).
    pub(crate) async fn route(&self, envelope: Envelope) -> usize {
        let targets: Vec<Arc<Queue>> = {
            let state = self.inner.state.read().await;
            match state.exchanges.get(&envelope.exchange) {
                None => Vec::new(),
                Some(exchange) => exchange
                    .bindings
                    .iter()
                    .filter(|b| pattern_matches(&b.pattern, &envelope.routing_key))
                    .map(|b| b.queue.clone())
                    .collect(),
            }
        };

        let delivered = targets.len();
        for queue in targets {
            queue.push_back(envelope.clone()).await;
        }
        delivered
    }

    /// Route a poisoned delivery to `<queue>.dead-letter` for inspection.
    pub(crate) async fn dead_letter(&self, source_queue: &str, envelope: Envelope) {
        let dlq = self
            .declare_queue(&format!("{source_queue}.dead-letter"))
            .await;
        self.inner
            .metrics
            .dead_letters
            .with_label_values(&[source_queue])
            .inc();
        dlq.push_back(envelope).await;
    }

    /// Current depth of a queue, for tests and operational inspection.
    pub async fn queue_depth(&self, name: &str) -> usize {
        let queue = {
            let state = self.inner.state.read().await;
            state.queues.get(name).cloned()
        };
        match queue {
            Some(queue) => queue.depth().await,
            None => 0,
        }
    }
}
