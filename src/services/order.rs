use std::sync::Arc;

use async_trait::async_trait;
use chrono::Duration;
use uuid::Uuid;

use crate::broker::{EventHandler, HandlerError, Publisher};
use crate::domain::order::{NewOrder, Order, OrderError, OrderStatus, OrderStore};
use crate::domain::product::{ItemCheck, ProductReplica};
use crate::events::{DomainEvent, OrderCreated};

// ============================================================================
// Order Service
// ============================================================================
//
// Owns the order aggregate and its state machine. Writes go through the
// store's conditional transitions; everything that happens after creation is
// driven by events, not by direct calls from other services.
//
// ============================================================================

pub struct OrderService {
    store: Arc<OrderStore>,
    publisher: Arc<Publisher>,
    payment_window: Duration,
}

impl OrderService {
    pub fn new(store: Arc<OrderStore>, publisher: Arc<Publisher>, payment_window: Duration) -> Self {
        Self {
            store,
            publisher,
            payment_window,
        }
    }

    /// Create an order and announce it. The order is durable before the
    /// announce: a failed publish loses the downstream choreography, not the
    /// order itself.
    pub async fn create_order(&self, draft: NewOrder) -> Result<Order, OrderError> {
        let order = Order::create(draft, self.payment_window)?;
        self.store.insert(order.clone()).await;

        tracing::info!(
            order_id = %order.id,
            order_number = %order.order_number,
            total = order.total,
            expires_at = %order.expires_at,
            "Order created"
        );

        let event = DomainEvent::OrderCreated(OrderCreated::from_order(&order));
        if let Err(error) = self.publisher.publish(&event).await {
            tracing::error!(
                order_id = %order.id,
                error = %error,
                "Failed to announce order:created, order persisted without choreography"
            );
        }

        Ok(order)
    }

    pub async fn get_order(&self, order_id: Uuid) -> Option<Order> {
        self.store.get(order_id).await
    }

    pub async fn cancel_order(&self, order_id: Uuid) -> Result<Order, OrderError> {
        let order = self.store.cancel(order_id).await?;
        tracing::info!(order_id = %order.id, "Order cancelled");
        Ok(order)
    }

    /// Admin transition. The store pairs payment status with terminal
    /// statuses where the pairing is forced.
    pub async fn update_status(
        &self,
        order_id: Uuid,
        status: OrderStatus,
    ) -> Result<Order, OrderError> {
        let order = self.store.update_status(order_id, status).await?;
        tracing::info!(order_id = %order.id, status = ?order.status, "Order status updated");
        Ok(order)
    }
}

// ============================================================================
// Listeners
// ============================================================================

/// Applies `payment:success` to the aggregate: Confirmed/Paid unless the
/// order has reached a protected status.
pub struct PaymentSuccessListener {
    store: Arc<OrderStore>,
}

impl PaymentSuccessListener {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for PaymentSuccessListener {
    fn name(&self) -> &'static str {
        "order-svc:payment-success"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::PaymentSucceeded(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        match self.store.apply_payment_success(payload.order_id).await {
            Ok(order) => {
                tracing::info!(
                    order_id = %order.id,
                    payment_intent_id = %payload.payment_intent_id,
                    "Order confirmed by payment"
                );
                Ok(())
            }
            // Payment landed before the order row is visible here; the
            // redelivery loop bridges the replication gap.
            Err(OrderError::NotFound(order_id)) => Err(HandlerError::retryable(anyhow::anyhow!(
                "order {order_id} not found yet for payment:success"
            ))),
            Err(OrderError::ProtectedStatus(status)) => {
                tracing::warn!(
                    order_id = %payload.order_id,
                    status = ?status,
                    "Payment succeeded for an order in a protected status, leaving it untouched"
                );
                Ok(())
            }
            Err(error) => Err(HandlerError::fatal(error)),
        }
    }
}

/// Applies `order:expired`. A no-op when payment won the race: the aggregate
/// only expires while still pending.
pub struct OrderExpiredListener {
    store: Arc<OrderStore>,
}

impl OrderExpiredListener {
    pub fn new(store: Arc<OrderStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl EventHandler for OrderExpiredListener {
    fn name(&self) -> &'static str {
        "order-svc:order-expired"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::OrderExpired(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        match self.store.apply_expiry(payload.id).await {
            Ok(order) => {
                tracing::info!(
                    order_id = %order.id,
                    order_number = %order.order_number,
                    "Order expired, payment window elapsed"
                );
                Ok(())
            }
            Err(OrderError::NotPending(status)) => {
                tracing::info!(
                    order_id = %payload.id,
                    status = ?status,
                    "Expiration arrived after another transition, no-op"
                );
                Ok(())
            }
            Err(OrderError::NotFound(_)) => Err(HandlerError::fatal(anyhow::anyhow!(
                "order {} missing for order:expired",
                payload.id
            ))),
            Err(error) => Err(HandlerError::fatal(error)),
        }
    }
}

/// Keeps the catalog replica in sync from `product:*` events.
pub struct ProductSyncListener {
    replica: Arc<ProductReplica>,
}

impl ProductSyncListener {
    pub fn new(replica: Arc<ProductReplica>) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl EventHandler for ProductSyncListener {
    fn name(&self) -> &'static str {
        "product-replica:sync"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        match event {
            DomainEvent::ProductCreated(record) | DomainEvent::ProductUpdated(record) => {
                tracing::debug!(product_id = %record.id, stock = record.stock, "Product replica upserted");
                self.replica.upsert(record).await;
                Ok(())
            }
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                Ok(())
            }
        }
    }
}

/// Observational stock validation on `order:created`. Reports go to the log;
/// an order is never blocked on replica state.
pub struct StockValidationListener {
    replica: Arc<ProductReplica>,
}

impl StockValidationListener {
    pub fn new(replica: Arc<ProductReplica>) -> Self {
        Self { replica }
    }
}

#[async_trait]
impl EventHandler for StockValidationListener {
    fn name(&self) -> &'static str {
        "product-svc:stock-validation"
    }

    async fn handle(&self, event: DomainEvent) -> Result<(), HandlerError> {
        let payload = match event {
            DomainEvent::OrderCreated(payload) => payload,
            other => {
                tracing::warn!(routing_key = other.routing_key(), "Unexpected event, ignoring");
                return Ok(());
            }
        };

        for report in self.replica.check_items(&payload.items).await {
            match report.check {
                ItemCheck::Available => {}
                ItemCheck::UnknownProduct => tracing::warn!(
                    order_id = %payload.id,
                    product_id = %report.product_id,
                    "Ordered product is not in the replica"
                ),
                ItemCheck::NotActive(status) => tracing::warn!(
                    order_id = %payload.id,
                    product_id = %report.product_id,
                    status = ?status,
                    "Ordered product is not active"
                ),
                ItemCheck::UnknownVariant(sku) => tracing::warn!(
                    order_id = %payload.id,
                    product_id = %report.product_id,
                    sku = %sku,
                    "Ordered variant is unknown"
                ),
                ItemCheck::InsufficientStock {
                    requested,
                    available,
                } => tracing::warn!(
                    order_id = %payload.id,
                    product_id = %report.product_id,
                    requested,
                    available,
                    "Ordered quantity exceeds replica stock"
                ),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
