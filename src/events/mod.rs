use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::order::{OrderItem, ShippingAddress};
use crate::domain::product::ProductRecord;

// ============================================================================
// Event Schemas - the wire contracts every service agrees on
// ============================================================================
//
// Payloads are JSON on durable topic exchanges. There is no schema-version
// field on the wire, so the deserialization boundary is the only defense:
// payloads are decoded into the typed union below before any handler runs,
// and malformed ones are rejected (dead-lettered) instead of throwing
// mid-processing.
//
// ============================================================================

pub mod exchanges {
    pub const ORDER: &str = "order-events";
    pub const PAYMENT: &str = "payment-events";
    pub const PRODUCT: &str = "product-events";
}

pub mod routing_keys {
    pub const ORDER_CREATED: &str = "order:created";
    pub const ORDER_EXPIRED: &str = "order:expired";
    pub const PAYMENT_SUCCESS: &str = "payment:success";
    pub const PRODUCT_CREATED: &str = "product:created";
    pub const PRODUCT_UPDATED: &str = "product:updated";
}

/// `order:created` payload. Carries everything downstream consumers need so
/// none of them has to read order-service storage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCreated {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: String,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub subtotal: f64,
    pub shipping_cost: f64,
    pub tax: f64,
    pub discount: f64,
    pub expires_at: DateTime<Utc>,
}

/// `order:expired` payload, emitted by the jobs service when the payment
/// window elapses.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderExpired {
    pub id: Uuid,
    pub user_id: Uuid,
    pub order_number: String,
    pub expired_at: DateTime<Utc>,
}

/// `payment:success` payload. `id` is the payment record id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSucceeded {
    pub id: Uuid,
    pub order_id: Uuid,
    pub payment_intent_id: String,
}

/// Typed event union, discriminated by routing key.
#[derive(Debug, Clone)]
pub enum DomainEvent {
    OrderCreated(OrderCreated),
    OrderExpired(OrderExpired),
    PaymentSucceeded(PaymentSucceeded),
    ProductCreated(ProductRecord),
    ProductUpdated(ProductRecord),
}

#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("Unknown routing key: {0}")]
    UnknownRoutingKey(String),

    #[error("Malformed {routing_key} payload: {source}")]
    MalformedPayload {
        routing_key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl DomainEvent {
    pub fn exchange(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated(_) | DomainEvent::OrderExpired(_) => exchanges::ORDER,
            DomainEvent::PaymentSucceeded(_) => exchanges::PAYMENT,
            DomainEvent::ProductCreated(_) | DomainEvent::ProductUpdated(_) => exchanges::PRODUCT,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated(_) => routing_keys::ORDER_CREATED,
            DomainEvent::OrderExpired(_) => routing_keys::ORDER_EXPIRED,
            DomainEvent::PaymentSucceeded(_) => routing_keys::PAYMENT_SUCCESS,
            DomainEvent::ProductCreated(_) => routing_keys::PRODUCT_CREATED,
            DomainEvent::ProductUpdated(_) => routing_keys::PRODUCT_UPDATED,
        }
    }

    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        match self {
            DomainEvent::OrderCreated(payload) => serde_json::to_vec(payload),
            DomainEvent::OrderExpired(payload) => serde_json::to_vec(payload),
            DomainEvent::PaymentSucceeded(payload) => serde_json::to_vec(payload),
            DomainEvent::ProductCreated(payload) => serde_json::to_vec(payload),
            DomainEvent::ProductUpdated(payload) => serde_json::to_vec(payload),
        }
    }

    /// Decode at the consumer boundary. Handlers only ever see well-formed,
    /// typed payloads.
    pub fn decode(routing_key: &str, body: &[u8]) -> Result<Self, EventDecodeError> {
        let malformed = |source| EventDecodeError::MalformedPayload {
            routing_key: routing_key.to_string(),
            source,
        };
        match routing_key {
            routing_keys::ORDER_CREATED => serde_json::from_slice(body)
                .map(DomainEvent::OrderCreated)
                .map_err(malformed),
            routing_keys::ORDER_EXPIRED => serde_json::from_slice(body)
                .map(DomainEvent::OrderExpired)
                .map_err(malformed),
            routing_keys::PAYMENT_SUCCESS => serde_json::from_slice(body)
                .map(DomainEvent::PaymentSucceeded)
                .map_err(malformed),
            routing_keys::PRODUCT_CREATED => serde_json::from_slice(body)
                .map(DomainEvent::ProductCreated)
                .map_err(malformed),
            routing_keys::PRODUCT_UPDATED => serde_json::from_slice(body)
                .map(DomainEvent::ProductUpdated)
                .map_err(malformed),
            other => Err(EventDecodeError::UnknownRoutingKey(other.to_string())),
        }
    }
}

impl OrderCreated {
    pub fn from_order(order: &crate::domain::order::Order) -> Self {
        Self {
            id: order.id,
            user_id: order.user_id,
            order_number: order.order_number.clone(),
            items: order.items.clone(),
            shipping_address: order.shipping_address.clone(),
            subtotal: order.subtotal,
            shipping_cost: order.shipping_cost,
            tax: order.tax,
            discount: order.discount,
            expires_at: order.expires_at,
        }
    }
}

// ============================================================================
// Message Envelope
// ============================================================================

/// What actually travels through the broker: routing metadata plus the raw
/// JSON body. `persistent` mirrors the delivery-mode flag publishers set.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
}

impl Envelope {
    pub fn for_event(event: &DomainEvent) -> serde_json::Result<Self> {
        Ok(Self {
            exchange: event.exchange().to_string(),
            routing_key: event.routing_key().to_string(),
            body: event.encode()?,
            persistent: true,
            redelivered: false,
        })
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_payment_success() {
        let event = DomainEvent::PaymentSucceeded(PaymentSucceeded {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            payment_intent_id: "pi_123".to_string(),
        });

        let body = event.encode().unwrap();
        let decoded = DomainEvent::decode(routing_keys::PAYMENT_SUCCESS, &body).unwrap();

        match decoded {
            DomainEvent::PaymentSucceeded(payload) => {
                assert_eq!(payload.payment_intent_id, "pi_123");
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_routing_key_rejected() {
        let result = DomainEvent::decode("order:deleted", b"{}");
        assert!(matches!(result, Err(EventDecodeError::UnknownRoutingKey(_))));
    }

    #[test]
    fn test_malformed_payload_rejected_before_handlers() {
        let result = DomainEvent::decode(routing_keys::ORDER_EXPIRED, b"{\"id\": 42}");
        assert!(matches!(
            result,
            Err(EventDecodeError::MalformedPayload { .. })
        ));
    }

    #[test]
    fn test_wire_fields_are_camel_case() {
        let event = OrderExpired {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_number: "ORD-1".to_string(),
            expired_at: Utc::now(),
        };

        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("userId").is_some());
        assert!(value.get("orderNumber").is_some());
        assert!(value.get("expiredAt").is_some());
    }

    #[test]
    fn test_envelope_carries_routing_metadata() {
        let event = DomainEvent::OrderExpired(OrderExpired {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            order_number: "ORD-2".to_string(),
            expired_at: Utc::now(),
        });

        let envelope = Envelope::for_event(&event).unwrap();
        assert_eq!(envelope.exchange, exchanges::ORDER);
        assert_eq!(envelope.routing_key, routing_keys::ORDER_EXPIRED);
        assert!(envelope.persistent);
        assert!(!envelope.redelivered);
    }
}
