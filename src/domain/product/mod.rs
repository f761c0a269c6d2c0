use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::domain::order::OrderItem;

// ============================================================================
// Product Replica - order-service-local copy of the product catalog
// ============================================================================
//
// Populated from `product:created` / `product:updated` sync events and read
// by the stock validator. Eventually consistent by construction; the
// validator only observes and logs, it never blocks an order.
//
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Active,
    Draft,
    Archived,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductVariant {
    pub sku: String,
    pub stock: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductRecord {
    pub id: Uuid,
    pub name: String,
    pub status: ProductStatus,
    pub stock: u32,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}

/// Outcome of checking one order line against the replica.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemCheck {
    Available,
    UnknownProduct,
    NotActive(ProductStatus),
    UnknownVariant(String),
    InsufficientStock { requested: u32, available: u32 },
}

#[derive(Debug)]
pub struct ItemReport {
    pub product_id: Uuid,
    pub check: ItemCheck,
}

#[derive(Default)]
pub struct ProductReplica {
    products: RwLock<HashMap<Uuid, ProductRecord>>,
}

impl ProductReplica {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sync events carry the full record, so created and updated both upsert.
    pub async fn upsert(&self, record: ProductRecord) {
        self.products.write().await.insert(record.id, record);
    }

    pub async fn get(&self, product_id: Uuid) -> Option<ProductRecord> {
        self.products.read().await.get(&product_id).cloned()
    }

    /// Check every line of an order against the replica. Purely
    /// observational: callers log the report and move on.
    pub async fn check_items(&self, items: &[OrderItem]) -> Vec<ItemReport> {
        let products = self.products.read().await;
        items
            .iter()
            .map(|item| {
                let check = match products.get(&item.product_id) {
                    None => ItemCheck::UnknownProduct,
                    Some(product) if product.status != ProductStatus::Active => {
                        ItemCheck::NotActive(product.status)
                    }
                    Some(product) => match &item.variant {
                        Some(sku) => match product.variants.iter().find(|v| &v.sku == sku) {
                            None => ItemCheck::UnknownVariant(sku.clone()),
                            Some(variant) if variant.stock < item.quantity => {
                                ItemCheck::InsufficientStock {
                                    requested: item.quantity,
                                    available: variant.stock,
                                }
                            }
                            Some(_) => ItemCheck::Available,
                        },
                        None if product.stock < item.quantity => ItemCheck::InsufficientStock {
                            requested: item.quantity,
                            available: product.stock,
                        },
                        None => ItemCheck::Available,
                    },
                };
                ItemReport {
                    product_id: item.product_id,
                    check,
                }
            })
            .collect()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
