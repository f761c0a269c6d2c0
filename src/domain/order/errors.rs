use uuid::Uuid;

use super::value_objects::OrderStatus;

// ============================================================================
// Order Business Rule Errors
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum OrderError {
    #[error("Order not found: {0}")]
    NotFound(Uuid),

    #[error("Order items cannot be empty")]
    EmptyItems,

    #[error("Invalid item quantity: {0}")]
    InvalidQuantity(u32),

    #[error("Cannot cancel order in status: {0:?}")]
    CancelNotAllowed(OrderStatus),

    #[error("Order is not pending (status: {0:?}), expiry does not apply")]
    NotPending(OrderStatus),

    #[error("Order is in protected status {0:?}, payment confirmation does not apply")]
    ProtectedStatus(OrderStatus),
}
