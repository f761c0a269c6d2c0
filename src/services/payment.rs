use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::broker::{EventHandler, HandlerError, Publisher};
use crate::domain::payment::{
    Payment, PaymentError, PaymentProvider, PaymentStore, ShadowOrder, ShadowStatus,
};
use crate::events::{DomainEvent, PaymentSucceeded};
use crate::utils::{retry_transient, RetryConfig};

// ============================================================================
// Payment Service
// ============================================================================
//
// Charges are authorized against the service's own shadow of the order, so
// the charge path never reads order-service storage. The provider call is
// retried on transient failures only; a decline fails immediately.
//
// ============================================================================

pub struct PaymentService {
    store: Arc<PaymentStore>,
    provider: Arc<dyn PaymentProvider>,
    publisher: Arc<Publisher>,
    retry: RetryConfig,
}

impl PaymentService {
    pub fn new(
        store: Arc<PaymentStore>,
        provider: Arc<dyn PaymentProvider>,
        publisher: Arc<Publisher>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            store,
            provider,
            publisher,
            retry,
        }
    }

    /// Charge a pending order on behalf of its owner and announce the
    /// payment. Authorization and reservation happen atomically in
    /// `begin_charge` before the provider is called, so concurrent duplicate
    /// charge requests fail authorization instead of double-charging; a
    /// failed provider call releases the reservation.
    pub async fn charge(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        payment_method: &str,
    ) -> Result<Payment, PaymentError> {
        let shadow = self.store.begin_charge(order_id, user_id).await?;

        let charge_result = retry_transient(&self.retry, |_attempt| {
            self.provider
                .create_charge(order_id, shadow.price, &shadow.currency, payment_method)
        })
        .await;
        let confirmation = match charge_result {
            Ok(confirmation) => confirmation,
            Err(error) => {
                self.store.release_charge(order_id).await;
                return Err(PaymentError::ProviderFailed(error.into_inner()));
            }
        };

        self.store.confirm_shadow(order_id, payment_method).await;

        let payment = Payment {
            id: Uuid::new_v4(),
            order_id,
            user_id,
            amount: shadow.price,
            currency: shadow.currency.clone(),
            payment_intent_id: confirmation.payment_intent_id.clone(),
            created_at: Utc::now(),
        };
        self.store.record_payment(payment.clone()).await;

        tracing::info!(
            order_id = %order_id,
            payment_id = %payment.id,
            amount = payment.amount,
            payment_intent_id = %payment.payment_intent_id,
            "Charge captured"
        );

        let event = DomainEvent::PaymentSucceeded(PaymentSucceeded {
            id: payment.id,
            order_id,
            payment_intent_id: payment.payment_intent_id.clone(),
        });
        self.publisher
            .publish(&event)
            .await
            .map_err(|error| PaymentError::PublishFailed(anyhow::Error::new(error)))?;

        Ok(payment)
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Vec<Payment> {
        self.store.payments_for_order(order_id).await
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Materializes the shadow order from `order:created`. Idempotent against
/// redelivery; the shadow price is the order subtotal.
pub struct ShadowOrderListener {
    store: Arc<PaymentStore>,
}

impl ShadowOrderListener {
    pub fn new(store: Arc<PaymentStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for ShadowOrderListener {
    fn name(&self) -> &'static str {
        "payment-svc:shadow-order"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::OrderCreated(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        let created = self
            .store
            .create_shadow(ShadowOrder {
                id: payload.id,
                user_id: payload.user_id,
                price: payload.subtotal,
                status: ShadowStatus::Pending,
                currency: "usd".to_string(),
                payment_method: None,
            })
            .await;

        if created {
            tracing::info!(
                order_id = %payload.id,
                price = payload.subtotal,
                "Shadow order materialized"
            );
        } else {
            tracing::debug!(order_id = %payload.id, "Shadow order already exists, redelivery ignored");
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
