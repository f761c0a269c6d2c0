use std::sync::Arc;

use crate::broker::{Broker, BrokerConfig, Listener, ListenerHandle, Publisher};
use crate::domain::order::{OrderStore, DEFAULT_PAYMENT_WINDOW_SECS};
use crate::domain::payment::{PaymentProvider, PaymentStore};
use crate::domain::product::ProductReplica;
use crate::events::exchanges;
use crate::metrics::Metrics;
use crate::scheduler::{JobQueue, Worker, WorkerConfig};
use crate::utils::RetryConfig;

mod jobs;
mod order;
mod payment;

pub use jobs::{
    expiration_job_id, ExpirationCanceller, ExpirationPayload, ExpirationProcessor,
    ExpirationScheduler, EXPIRATION_JOB,
};
pub use order::{
    OrderExpiredListener, OrderService, PaymentSuccessListener, ProductSyncListener,
    StockValidationListener,
};
pub use payment::{PaymentService, ShadowOrderListener};

// ============================================================================
// Choreography - composition root
// ============================================================================
//
// Wires the four services together over one injected broker. No service
// calls another directly; every cross-service effect flows through events,
// and the whole assembly can be stood up in-process for tests.
//
// ============================================================================

pub const EXPIRATION_QUEUE: &str = "order-expiration";

#[derive(Clone)]
pub struct ChoreographyConfig {
    pub broker: BrokerConfig,
    pub worker: WorkerConfig,
    pub provider_retry: RetryConfig,
    pub payment_window: chrono::Duration,
}

impl Default for ChoreographyConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            worker: WorkerConfig::default(),
            provider_retry: RetryConfig::default(),
            payment_window: chrono::Duration::seconds(DEFAULT_PAYMENT_WINDOW_SECS),
        }
    }
}

pub struct Choreography {
    broker: Broker,
    metrics: Arc<Metrics>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub order_store: Arc<OrderStore>,
    pub payment_store: Arc<PaymentStore>,
    pub product_replica: Arc<ProductReplica>,
    pub expiration_queue: JobQueue,
    listeners: Vec<ListenerHandle>,
    worker: Worker,
}

impl Choreography {
    pub async fn start(provider: Arc<dyn PaymentProvider>) -> anyhow::Result<Self> {
        Self::start_with(provider, ChoreographyConfig::default()).await
    }

    pub async fn start_with(
        provider: Arc<dyn PaymentProvider>,
        config: ChoreographyConfig,
    ) -> anyhow::Result<Self> {
        let metrics = Arc::new(Metrics::new()?);
        let broker = Broker::with_config(config.broker.clone(), metrics.clone());
        let publisher = Arc::new(Publisher::new(broker.clone()));

        let order_store = Arc::new(OrderStore::new());
        let payment_store = Arc::new(PaymentStore::new());
        let product_replica = Arc::new(ProductReplica::new());
        let expiration_queue = JobQueue::new(EXPIRATION_QUEUE, metrics.clone());

        let orders = Arc::new(OrderService::new(
            order_store.clone(),
            publisher.clone(),
            config.payment_window,
        ));
        let payments = Arc::new(PaymentService::new(
            payment_store.clone(),
            provider,
            publisher.clone(),
            config.provider_retry.clone(),
        ));

        let worker = Worker::start(
            expiration_queue.clone(),
            Arc::new(ExpirationProcessor::new(publisher.clone())),
            config.worker.clone(),
        );

        let listener = Listener::new(broker.clone());
        let listeners = vec![
            listener
                .listen(
                    "payment-svc.order.created",
                    exchanges::ORDER,
                    "order:created",
                    Arc::new(ShadowOrderListener::new(payment_store.clone())),
                )
                .await,
            listener
                .listen(
                    "jobs-svc.order.created",
                    exchanges::ORDER,
                    "order:created",
                    Arc::new(ExpirationScheduler::new(expiration_queue.clone())),
                )
                .await,
            listener
                .listen(
                    "product-svc.order.created",
                    exchanges::ORDER,
                    "order:created",
                    Arc::new(StockValidationListener::new(product_replica.clone())),
                )
                .await,
            listener
                .listen(
                    "order-svc.payment.success",
                    exchanges::PAYMENT,
                    "payment:success",
                    Arc::new(PaymentSuccessListener::new(order_store.clone())),
                )
                .await,
            listener
                .listen(
                    "jobs-svc.payment.success",
                    exchanges::PAYMENT,
                    "payment:success",
                    Arc::new(ExpirationCanceller::new(expiration_queue.clone())),
                )
                .await,
            listener
                .listen(
                    "order-svc.order.expired",
                    exchanges::ORDER,
                    "order:expired",
                    Arc::new(OrderExpiredListener::new(order_store.clone())),
                )
                .await,
            listener
                .listen(
                    "product-svc.product.sync",
                    exchanges::PRODUCT,
                    "product:*",
                    Arc::new(ProductSyncListener::new(product_replica.clone())),
                )
                .await,
        ];

        tracing::info!(listeners = listeners.len(), "Choreography started");

        Ok(Self {
            broker,
            metrics,
            orders,
            payments,
            order_store,
            payment_store,
            product_replica,
            expiration_queue,
            listeners,
            worker,
        })
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Stop listeners first so no new jobs or transitions start, then drain
    /// the worker pool.
    pub async fn shutdown(self) {
        let grace = self.broker.config().shutdown_grace;
        for listener in self.listeners {
            listener.stop(grace).await;
        }
        self.worker.shutdown(grace).await;
        tracing::info!("Choreography stopped");
    }
}

// ============================================================================
// End-to-End Scenario Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::domain::order::{NewOrder, OrderItem, OrderStatus, PaymentStatus, ShippingAddress};
    use crate::domain::payment::{ChargeConfirmation, ProviderError};
    use crate::domain::product::{ProductRecord, ProductStatus};
    use crate::events::{DomainEvent, OrderExpired};

    struct MockProvider {
        calls: AtomicU32,
        failures_left: AtomicU32,
    }

    impl MockProvider {
        fn new(failures: u32) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicU32::new(0),
                failures_left: AtomicU32::new(failures),
            })
        }
    }

    #[async_trait]
    impl crate::domain::payment::PaymentProvider for MockProvider {
        async fn create_charge(
            &self,
            order_id: Uuid,
            _amount: f64,
            _currency: &str,
            _payment_method: &str,
        ) -> Result<ChargeConfirmation, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(ProviderError::Transient("gateway timeout".to_string()));
            }
            Ok(ChargeConfirmation {
                payment_intent_id: format!("pi_{order_id}"),
            })
        }
    }

    fn fast_config(payment_window: chrono::Duration) -> ChoreographyConfig {
        ChoreographyConfig {
            broker: BrokerConfig {
                redelivery_delay: Duration::from_millis(5),
                shutdown_grace: Duration::from_secs(1),
            },
            worker: WorkerConfig {
                concurrency: 2,
                rate_limit_per_sec: 1000,
            },
            provider_retry: RetryConfig {
                max_attempts: 3,
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
                multiplier: 2.0,
            },
            payment_window,
        }
    }

    fn draft() -> NewOrder {
        NewOrder {
            user_id: Uuid::new_v4(),
            items: vec![OrderItem {
                product_id: Uuid::new_v4(),
                name: "Widget".to_string(),
                price: 100.0,
                quantity: 2,
                variant: None,
            }],
            shipping_address: ShippingAddress {
                line1: "1 Main St".to_string(),
                city: "Springfield".to_string(),
                postal_code: "12345".to_string(),
                country: "US".to_string(),
            },
            shipping_cost: 10.0,
            tax: 5.0,
            discount: 0.0,
        }
    }

    async fn wait_until<F, Fut>(check: F)
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..400 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met in time");
    }

    async fn wait_for_status(app: &Choreography, order_id: Uuid, status: OrderStatus) {
        wait_until(|| async {
            app.order_store
                .get(order_id)
                .await
                .map(|o| o.status == status)
                .unwrap_or(false)
        })
        .await;
    }

    #[tokio::test]
    async fn test_happy_path_order_paid_before_window() {
        let provider = MockProvider::new(0);
        let app = Choreography::start_with(provider, fast_config(chrono::Duration::minutes(15)))
            .await
            .unwrap();

        let order = app.orders.create_order(draft()).await.unwrap();

        // Shadow order materializes and the expiration job gets scheduled.
        wait_until(|| async { app.payment_store.shadow(order.id).await.is_some() }).await;
        wait_until(|| async { app.expiration_queue.counts().await.delayed == 1 }).await;

        let payment = app
            .payments
            .charge(order.id, order.user_id, "card")
            .await
            .unwrap();
        assert_eq!(payment.amount, order.subtotal);

        wait_for_status(&app, order.id, OrderStatus::Confirmed).await;
        let stored = app.order_store.get(order.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Paid);

        // The pending expiration job is cancelled, not left to fire.
        wait_until(|| async { app.expiration_queue.counts().await.delayed == 0 }).await;
        assert_eq!(app.metrics().jobs_cancelled.get(), 1);
        assert_eq!(app.metrics().jobs_completed.get(), 0);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_late_expiration_event_loses_to_confirmation() {
        let provider = MockProvider::new(0);
        let app = Choreography::start_with(provider, fast_config(chrono::Duration::minutes(15)))
            .await
            .unwrap();

        let order = app.orders.create_order(draft()).await.unwrap();
        wait_until(|| async { app.payment_store.shadow(order.id).await.is_some() }).await;
        app.payments
            .charge(order.id, order.user_id, "card")
            .await
            .unwrap();
        wait_for_status(&app, order.id, OrderStatus::Confirmed).await;

        // A straggler order:expired delivered after confirmation.
        Publisher::new(app.broker().clone())
            .publish(&DomainEvent::OrderExpired(OrderExpired {
                id: order.id,
                user_id: order.user_id,
                order_number: order.order_number.clone(),
                expired_at: Utc::now(),
            }))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        let stored = app.order_store.get(order.id).await.unwrap();
        assert_eq!(stored.status, OrderStatus::Confirmed);
        assert_eq!(stored.payment_status, PaymentStatus::Paid);

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_unpaid_order_expires_when_window_elapses() {
        let provider = MockProvider::new(0);
        let app = Choreography::start_with(provider, fast_config(chrono::Duration::milliseconds(80)))
            .await
            .unwrap();

        let order = app.orders.create_order(draft()).await.unwrap();

        wait_for_status(&app, order.id, OrderStatus::Expired).await;
        let stored = app.order_store.get(order.id).await.unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        wait_until(|| async { app.metrics().jobs_completed.get() == 1 }).await;

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_payment_after_expiry_still_confirms() {
        // The expired status is a parking state, not a terminal one: a
        // successful charge that arrives later flips the order to confirmed.
        let provider = MockProvider::new(0);
        let app = Choreography::start_with(provider, fast_config(chrono::Duration::milliseconds(80)))
            .await
            .unwrap();

        let order = app.orders.create_order(draft()).await.unwrap();
        wait_for_status(&app, order.id, OrderStatus::Expired).await;

        // The shadow never expired, so the charge still authorizes.
        app.payments
            .charge(order.id, order.user_id, "card")
            .await
            .unwrap();

        wait_for_status(&app, order.id, OrderStatus::Confirmed).await;
        assert_eq!(
            app.order_store.get(order.id).await.unwrap().payment_status,
            PaymentStatus::Paid
        );

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_flaky_provider_converges_to_paid() {
        let provider = MockProvider::new(2);
        let app = Choreography::start_with(
            provider.clone(),
            fast_config(chrono::Duration::minutes(15)),
        )
        .await
        .unwrap();

        let order = app.orders.create_order(draft()).await.unwrap();
        wait_until(|| async { app.payment_store.shadow(order.id).await.is_some() }).await;

        app.payments
            .charge(order.id, order.user_id, "card")
            .await
            .unwrap();

        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
        wait_for_status(&app, order.id, OrderStatus::Confirmed).await;

        app.shutdown().await;
    }

    #[tokio::test]
    async fn test_product_sync_feeds_stock_validation() {
        let provider = MockProvider::new(0);
        let app = Choreography::start_with(provider, fast_config(chrono::Duration::minutes(15)))
            .await
            .unwrap();

        let product_id = Uuid::new_v4();
        Publisher::new(app.broker().clone())
            .publish(&DomainEvent::ProductCreated(ProductRecord {
                id: product_id,
                name: "Widget".to_string(),
                status: ProductStatus::Active,
                stock: 1,
                variants: vec![],
            }))
            .await
            .unwrap();

        wait_until(|| async { app.product_replica.get(product_id).await.is_some() }).await;

        // Over-ordering only logs; the order is created regardless.
        let mut over_order = draft();
        over_order.items[0].product_id = product_id;
        over_order.items[0].quantity = 5;
        let order = app.orders.create_order(over_order).await.unwrap();
        assert!(app.order_store.get(order.id).await.is_some());

        app.shutdown().await;
    }
}
