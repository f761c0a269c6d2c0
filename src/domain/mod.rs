// ============================================================================
// Domain Layer
// ============================================================================
//
// One module per service-owned model:
// - order:   the aggregate and state machine owned by the order service
// - payment: the shadow order and payment record owned by the payment service
// - product: the order-service-local replica of the catalog
//
// ============================================================================

pub mod order;
pub mod payment;
pub mod product;
