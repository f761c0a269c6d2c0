use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use uuid::Uuid;

mod broker;
mod domain;
mod events;
mod metrics;
mod scheduler;
mod services;
mod utils;

use broker::Publisher;
use domain::order::{NewOrder, OrderItem, ShippingAddress};
use domain::payment::{ChargeConfirmation, PaymentProvider, ProviderError};
use domain::product::{ProductRecord, ProductStatus};
use events::DomainEvent;
use services::{Choreography, ChoreographyConfig};

/// Stand-in provider for the demo: always authorizes after a short delay.
struct DemoProvider;

#[async_trait]
impl PaymentProvider for DemoProvider {
    async fn create_charge(
        &self,
        order_id: Uuid,
        amount: f64,
        currency: &str,
        _payment_method: &str,
    ) -> Result<ChargeConfirmation, ProviderError> {
        tokio::time::sleep(Duration::from_millis(50)).await;
        tracing::info!(order_id = %order_id, amount, currency, "Demo provider authorized charge");
        Ok(ChargeConfirmation {
            payment_intent_id: format!("pi_demo_{order_id}"),
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,orderflow=debug")),
        )
        .init();

    tracing::info!("🚀 Starting purchase-order choreography demo");

    // A short payment window so the expiry path is visible in the demo run.
    let app = Choreography::start_with(
        Arc::new(DemoProvider),
        ChoreographyConfig {
            payment_window: chrono::Duration::seconds(10),
            ..ChoreographyConfig::default()
        },
    )
    .await?;
    tracing::info!(
        "📊 Metrics registry created with {} metrics",
        app.metrics().registry().gather().len()
    );

    // === 1. Seed the product catalog ===
    let product_id = Uuid::new_v4();
    let publisher = Publisher::new(app.broker().clone());
    publisher
        .publish(&DomainEvent::ProductCreated(ProductRecord {
            id: product_id,
            name: "Mechanical Keyboard".to_string(),
            status: ProductStatus::Active,
            stock: 25,
            variants: vec![],
        }))
        .await?;
    tokio::time::sleep(Duration::from_millis(100)).await;
    if let Some(product) = app.product_replica.get(product_id).await {
        tracing::info!(stock = product.stock, "Product replica synced: {}", product.name);
    }

    let draft = |user_id: Uuid| NewOrder {
        user_id,
        items: vec![OrderItem {
            product_id,
            name: "Mechanical Keyboard".to_string(),
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
    };

    // === 2. Order paid inside the window ===
    let user_id = Uuid::new_v4();
    let paid_order = app.orders.create_order(draft(user_id)).await?;
    tracing::info!("✅ Order created: {}", paid_order.order_number);

    // Give the choreography a moment to materialize the shadow order.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let payment = app.payments.charge(paid_order.id, user_id, "card").await?;
    tracing::info!(
        "✅ Payment captured: {} ({:.2} {})",
        payment.payment_intent_id,
        payment.amount,
        payment.currency
    );
    tracing::info!(
        payments = app.payments.payments_for_order(paid_order.id).await.len(),
        "Payment history recorded"
    );

    // Fulfilment catches up: an admin transition ships the paid order.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let shipped = app
        .orders
        .update_status(paid_order.id, domain::order::OrderStatus::Shipped)
        .await?;
    tracing::info!("📦 Order shipped: {}", shipped.order_number);

    // === 3. Order cancelled by the customer ===
    let cancelled_order = app.orders.create_order(draft(Uuid::new_v4())).await?;
    let cancelled = app.orders.cancel_order(cancelled_order.id).await?;
    tracing::info!("🛑 Order cancelled: {}", cancelled.order_number);

    // === 4. Order left unpaid until the window elapses ===
    let unpaid_order = app.orders.create_order(draft(Uuid::new_v4())).await?;
    tracing::info!(
        "⏳ Order {} left unpaid, waiting out the payment window...",
        unpaid_order.order_number
    );
    tokio::time::sleep(Duration::from_secs(12)).await;

    // === 5. Final states ===
    tracing::info!(orders = app.order_store.count().await, "Orders in store");
    for order_id in [paid_order.id, cancelled_order.id, unpaid_order.id] {
        if let Some(order) = app.orders.get_order(order_id).await {
            tracing::info!(
                order_number = %order.order_number,
                status = ?order.status,
                payment_status = ?order.payment_status,
                "Final order state"
            );
        }
    }
    tracing::info!(
        jobs_scheduled = app.metrics().jobs_scheduled.get(),
        jobs_cancelled = app.metrics().jobs_cancelled.get(),
        jobs_completed = app.metrics().jobs_completed.get(),
        "Scheduler activity"
    );

    app.shutdown().await;
    tracing::info!("🎉 Demo complete!");

    Ok(())
}
