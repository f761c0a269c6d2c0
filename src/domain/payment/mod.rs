use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::utils::retry::IsTransient;

// ============================================================================
// Payment Domain - shadow order, payment record, provider port
// ============================================================================
//
// The payment service never reads order-service storage. It authorizes
// charges against its own shadow copy of the order, materialized from
// `order:created` and kept eventually consistent.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShadowStatus {
    Pending,
    Charging,
    Confirmed,
}

/// Partial, independently-owned replica of an order. `price` is the order
/// subtotal; it is what the provider is asked to charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShadowOrder {
    pub id: Uuid,
    pub user_id: Uuid,
    pub price: f64,
    pub status: ShadowStatus,
    pub currency: String,
    pub payment_method: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: Uuid,
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub amount: f64,
    pub currency: String,
    pub payment_intent_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum PaymentError {
    #[error("No order found for charge: {0}")]
    OrderNotFound(Uuid),

    #[error("Order {order_id} does not belong to user {user_id}")]
    NotOrderOwner { order_id: Uuid, user_id: Uuid },

    #[error("Order {order_id} is not pending (status: {status:?})")]
    OrderNotPending {
        order_id: Uuid,
        status: ShadowStatus,
    },

    #[error("Payment provider failed: {0}")]
    ProviderFailed(#[source] ProviderError),

    #[error("Failed to publish payment:success: {0}")]
    PublishFailed(#[source] anyhow::Error),
}

// ============================================================================
// Payment Provider Port
// ============================================================================

#[derive(Debug, Clone)]
pub struct ChargeConfirmation {
    pub payment_intent_id: String,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("Provider temporarily unavailable: {0}")]
    Transient(String),

    #[error("Charge declined: {0}")]
    Declined(String),
}

impl IsTransient for ProviderError {
    fn is_transient(&self) -> bool {
        matches!(self, ProviderError::Transient(_))
    }
}

/// External payment provider client. The real client lives outside this
/// crate; services receive it injected at startup.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_charge(
        &self,
        order_id: Uuid,
        amount: f64,
        currency: &str,
        payment_method: &str,
    ) -> Result<ChargeConfirmation, ProviderError>;
}

// ============================================================================
// Payment Store
// ============================================================================

#[derive(Default)]
pub struct PaymentStore {
    shadows: RwLock<HashMap<Uuid, ShadowOrder>>,
    payments: RwLock<Vec<Payment>>,
}

impl PaymentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Materialize the shadow order. Idempotent: a redelivered
    /// `order:created` leaves the existing shadow untouched.
    pub async fn create_shadow(&self, shadow: ShadowOrder) -> bool {
        let mut shadows = self.shadows.write().await;
        if shadows.contains_key(&shadow.id) {
            return false;
        }
        shadows.insert(shadow.id, shadow);
        true
    }

    pub async fn shadow(&self, order_id: Uuid) -> Option<ShadowOrder> {
        self.shadows.read().await.get(&order_id).cloned()
    }

    /// Authorize and reserve the shadow for a charge in one critical
    /// section: the shadow must exist, belong to the caller, and still be
    /// pending, and it leaves this call in `Charging`. Concurrent callers
    /// serialize on the write lock, so only one of them can win the
    /// pending-to-charging flip.
    pub async fn begin_charge(
        &self,
        order_id: Uuid,
        user_id: Uuid,
    ) -> Result<ShadowOrder, PaymentError> {
        let mut shadows = self.shadows.write().await;
        let shadow = shadows
            .get_mut(&order_id)
            .ok_or(PaymentError::OrderNotFound(order_id))?;
        if shadow.user_id != user_id {
            return Err(PaymentError::NotOrderOwner { order_id, user_id });
        }
        if shadow.status != ShadowStatus::Pending {
            return Err(PaymentError::OrderNotPending {
                order_id,
                status: shadow.status,
            });
        }
        shadow.status = ShadowStatus::Charging;
        Ok(shadow.clone())
    }

    /// Roll back a reservation whose provider call failed. The shadow goes
    /// back to `Pending` so a later charge attempt can succeed.
    pub async fn release_charge(&self, order_id: Uuid) {
        if let Some(shadow) = self.shadows.write().await.get_mut(&order_id) {
            if shadow.status == ShadowStatus::Charging {
                shadow.status = ShadowStatus::Pending;
            }
        }
    }

    pub async fn confirm_shadow(&self, order_id: Uuid, payment_method: &str) {
        if let Some(shadow) = self.shadows.write().await.get_mut(&order_id) {
            shadow.status = ShadowStatus::Confirmed;
            shadow.payment_method = Some(payment_method.to_string());
        }
    }

    pub async fn record_payment(&self, payment: Payment) {
        self.payments.write().await.push(payment);
    }

    pub async fn payments_for_order(&self, order_id: Uuid) -> Vec<Payment> {
        self.payments
            .read()
            .await
            .iter()
            .filter(|p| p.order_id == order_id)
            .cloned()
            .collect()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
