use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::OrderError;
use super::value_objects::{OrderItem, OrderStatus, PaymentStatus, ShippingAddress};

// ============================================================================
// Order Aggregate - Domain Logic
// ============================================================================
//
// Owns `status` / `payment_status` and every transition guard. The broker
// gives no ordering across queues, so the guards here are the only thing
// standing between a racing `payment:success` and `order:expired`:
//
// - expiry applies only while the order is still Pending
// - payment confirmation applies unless the order reached a protected
//   terminal status (Shipped / Delivered / Cancelled)
//
// Confirming an already-Expired order is allowed on purpose: payment wins
// eventually, even when the expiration event was processed first.
//
// ============================================================================

/// Window a customer has to pay before the order expires.
pub const DEFAULT_PAYMENT_WINDOW_SECS: i64 = 15 * 60;

/// Post-validation input for order creation. The HTTP layer that validates
/// and shapes this is an external collaborator.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,
    pub shipping_cost: f64,
    pub tax: f64,
    pub discount: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Unique, generated at creation, immutable afterwards.
    pub order_number: String,
    pub items: Vec<OrderItem>,
    pub shipping_address: ShippingAddress,

    pub subtotal: f64,
    pub shipping_cost: f64,
    pub tax: f64,
    pub discount: f64,
    pub total: f64,

    pub status: OrderStatus,
    pub payment_status: PaymentStatus,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Fixed at creation: `created_at + payment window`.
    pub expires_at: DateTime<Utc>,
}

impl Order {
    pub fn create(draft: NewOrder, payment_window: Duration) -> Result<Self, OrderError> {
        if draft.items.is_empty() {
            return Err(OrderError::EmptyItems);
        }
        for item in &draft.items {
            if item.quantity == 0 {
                return Err(OrderError::InvalidQuantity(item.quantity));
            }
        }

        let now = Utc::now();
        let subtotal: f64 = draft.items.iter().map(OrderItem::line_total).sum();
        let total = subtotal + draft.shipping_cost + draft.tax - draft.discount;

        Ok(Self {
            id: Uuid::new_v4(),
            user_id: draft.user_id,
            order_number: generate_order_number(now),
            items: draft.items,
            shipping_address: draft.shipping_address,
            subtotal,
            shipping_cost: draft.shipping_cost,
            tax: draft.tax,
            discount: draft.discount,
            total,
            status: OrderStatus::Pending,
            payment_status: PaymentStatus::Pending,
            created_at: now,
            updated_at: now,
            expires_at: now + payment_window,
        })
    }

    /// Derived, never persisted: an order is expired once its payment window
    /// elapsed while it was still waiting for payment.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at && self.status == OrderStatus::Pending
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Apply a `payment:success` event. Rejected only for protected terminal
    /// statuses; flipping an Expired order back to Confirmed is deliberate.
    pub fn confirm_payment(&mut self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Shipped | OrderStatus::Delivered | OrderStatus::Cancelled => {
                Err(OrderError::ProtectedStatus(self.status))
            }
            _ => {
                self.status = OrderStatus::Confirmed;
                self.payment_status = PaymentStatus::Paid;
                self.touch();
                Ok(())
            }
        }
    }

    /// Apply an `order:expired` event. Only a still-Pending order expires;
    /// everything else is reported back so the caller can log the no-op.
    pub fn expire(&mut self) -> Result<(), OrderError> {
        if self.status != OrderStatus::Pending {
            return Err(OrderError::NotPending(self.status));
        }
        self.status = OrderStatus::Expired;
        self.touch();
        Ok(())
    }

    /// Owner or admin cancellation. Shipped / Delivered / already-Cancelled
    /// orders cannot be cancelled; a paid order is marked refunded.
    pub fn cancel(&mut self) -> Result<(), OrderError> {
        match self.status {
            OrderStatus::Shipped | OrderStatus::Delivered | OrderStatus::Cancelled => {
                return Err(OrderError::CancelNotAllowed(self.status));
            }
            _ => {}
        }
        self.status = OrderStatus::Cancelled;
        if self.payment_status == PaymentStatus::Paid {
            self.payment_status = PaymentStatus::Refunded;
        }
        self.touch();
        Ok(())
    }

    /// Admin status override. Accepts any status value with no transition
    /// guard beyond enum membership; only the paired payment-status rules
    /// are enforced. Kept as-is from the source system (flagged, not fixed).
    pub fn set_status(&mut self, status: OrderStatus) {
        self.status = status;
        match status {
            OrderStatus::Delivered if self.payment_status == PaymentStatus::Pending => {
                self.payment_status = PaymentStatus::Paid;
            }
            OrderStatus::Cancelled if self.payment_status == PaymentStatus::Paid => {
                self.payment_status = PaymentStatus::Refunded;
            }
            _ => {}
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!(
        "ORD-{}-{}",
        now.format("%Y%m%d%H%M%S"),
        &suffix[..8].to_uppercase()
    )
}

// ============================================================================
// Unit Tests
// ============================================================================
