use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use super::aggregate::Order;
use super::errors::OrderError;
use super::value_objects::OrderStatus;

// ============================================================================
// Order Store - In-Memory Repository
// ============================================================================
//
// The persistence schema is an external collaborator; only the fields the
// state machine needs live here. Every transition is applied as a single
// read-modify-write under the write lock, so two racing appliers (say a
// cancel from HTTP and an expire from the broker) serialize instead of
// last-write-wins clobbering each other.
//
// ============================================================================

#[derive(Default)]
pub struct OrderStore {
    orders: RwLock<HashMap<Uuid, Order>>,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, order: Order) {
        self.orders.write().await.insert(order.id, order);
    }

    pub async fn get(&self, order_id: Uuid) -> Option<Order> {
        self.orders.read().await.get(&order_id).cloned()
    }

    pub async fn count(&self) -> usize {
        self.orders.read().await.len()
    }

    /// Conditional confirm: applies unless the stored status is protected.
    pub async fn apply_payment_success(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.mutate(order_id, |order| order.confirm_payment()).await
    }

    /// Conditional expire: applies only while the stored status is Pending.
    pub async fn apply_expiry(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.mutate(order_id, |order| order.expire()).await
    }

    pub async fn cancel(&self, order_id: Uuid) -> Result<Order, OrderError> {
        self.mutate(order_id, |order| order.cancel()).await
    }

    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<Order, OrderError> {
        self.mutate(order_id, |order| {
            order.set_status(status);
            Ok(())
        })
        .await
    }

    async fn mutate<F>(&self, order_id: Uuid, f: F) -> Result<Order, OrderError>
    where
        F: FnOnce(&mut Order) -> Result<(), OrderError>,
    {
        let mut orders = self.orders.write().await;
        let order = orders
            .get_mut(&order_id)
            .ok_or(OrderError::NotFound(order_id))?;
        f(order)?;
        Ok(order.clone())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Duration;

    use super::*;
    use crate::domain::order::aggregate::{NewOrder, DEFAULT_PAYMENT_WINDOW_SECS};
    use crate::domain::order::value_objects::{OrderItem, PaymentStatus, ShippingAddress};

    fn sample_order() -> Order {
        Order::create(
            NewOrder {
                user_id: Uuid::new_v4(),
                items: vec![OrderItem {
                    product_id: Uuid::new_v4(),
                    name: "Widget".to_string(),
                    price: 20.0,
                    quantity: 1,
                    variant: None,
                }],
                shipping_address: ShippingAddress {
                    line1: "1 Main St".to_string(),
                    city: "Springfield".to_string(),
                    postal_code: "12345".to_string(),
                    country: "US".to_string(),
                },
                shipping_cost: 0.0,
                tax: 0.0,
                discount: 0.0,
            },
            Duration::seconds(DEFAULT_PAYMENT_WINDOW_SECS),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_unknown_order_is_not_found() {
        let store = OrderStore::new();
        let result = store.apply_expiry(Uuid::new_v4()).await;
        assert!(matches!(result, Err(OrderError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_confirm_before_expire_race_resolution() {
        let store = OrderStore::new();
        let order = sample_order();
        let order_id = order.id;
        store.insert(order).await;

        let confirmed = store.apply_payment_success(order_id).await.unwrap();
        assert_eq!(confirmed.status, OrderStatus::Confirmed);

        // The late expiration event must be a no-op.
        let result = store.apply_expiry(order_id).await;
        assert!(matches!(result, Err(OrderError::NotPending(_))));

        let stored = store.get(order_id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(stored.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_expiry_applies_to_pending_order() {
        let store = OrderStore::new();
        let order = sample_order();
        let order_id = order.id;
        store.insert(order).await;

        let expired = store.apply_expiry(order_id).await.unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
    }

    #[tokio::test]
    async fn test_duplicate_payment_success_is_idempotent() {
        // At-least-once delivery: applying the same confirm twice must land
        // in the same end state.
        let store = OrderStore::new();
        let order = sample_order();
        let order_id = order.id;
        store.insert(order).await;

        store.apply_payment_success(order_id).await.unwrap();
        let second = store.apply_payment_success(order_id).await.unwrap();

        assert_eq!(second.status, OrderStatus::Confirmed);
        assert_eq!(second.payment_status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn test_concurrent_cancel_and_expire_serialize() {
        let store = Arc::new(OrderStore::new());
        let order = sample_order();
        let order_id = order.id;
        store.insert(order).await;

        let s1 = store.clone();
        let s2 = store.clone();
        let (cancel, expire) = tokio::join!(
            tokio::spawn(async move { s1.cancel(order_id).await }),
            tokio::spawn(async move { s2.apply_expiry(order_id).await }),
        );

        // Exactly one of the two transitions wins; the loser observes the
        // winner's status instead of overwriting it.
        let cancel = cancel.unwrap();
        let expire = expire.unwrap();
        assert!(cancel.is_ok() ^ expire.is_ok());

        let stored = store.get(order_id).await.unwrap();
        assert!(matches!(
            stored.status,
            OrderStatus::Cancelled | OrderStatus::Expired
        ));
    }
}
