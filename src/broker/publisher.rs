use crate::events::{DomainEvent, Envelope};
use crate::utils::{CircuitBreaker, CircuitBreakerConfig, CircuitState};

use super::{Broker, BrokerError};

// ============================================================================
// Publisher
// ============================================================================
//
// Asserts the exchange, serializes to JSON, publishes persistent.
// Fire-and-forget: there are no publisher confirms, so a broker outage after
// publish resolves can silently drop the event. A circuit breaker guards the
// publish path so a dead broker fails fast instead of piling up callers.
//
// ============================================================================

pub struct Publisher {
    broker: Broker,
    breaker: CircuitBreaker,
}

impl Publisher {
    pub fn new(broker: Broker) -> Self {
        Self::with_breaker(broker, CircuitBreakerConfig::default())
    }

    pub fn with_breaker(broker: Broker, config: CircuitBreakerConfig) -> Self {
        Self {
            broker,
            breaker: CircuitBreaker::new(config),
        }
    }

    pub async fn publish(&self, event: &DomainEvent) -> Result<(), BrokerError> {
        self.breaker.check().map_err(|_| {
            tracing::error!(
                routing_key = event.routing_key(),
                "Circuit breaker open, dropping publish"
            );
            BrokerError::CircuitOpen
        })?;

        self.broker.assert_exchange(event.exchange()).await;
        let envelope = match Envelope::for_event(event) {
            Ok(envelope) => envelope,
            Err(error) => {
                self.breaker.record_failure();
                self.update_state_gauge();
                return Err(BrokerError::Serialize(error));
            }
        };

        let routing_key = event.routing_key();
        let delivered = self.broker.route(envelope).await;
        self.breaker.record_success();
        self.update_state_gauge();

        self.broker
            .metrics()
            .events_published
            .with_label_values(&[routing_key])
            .inc();
        tracing::info!(
            exchange = event.exchange(),
            routing_key,
            queues = delivered,
            "Published event"
        );
        Ok(())
    }

    fn update_state_gauge(&self) {
        let state = match self.breaker.state() {
            CircuitState::Closed => 0,
            CircuitState::Open => 1,
            CircuitState::HalfOpen => 2,
        };
        self.broker.metrics().circuit_breaker_state.set(state);
    }
}
