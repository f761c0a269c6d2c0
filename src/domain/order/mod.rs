// ============================================================================
// Order Domain - aggregate, state machine, in-memory store
// ============================================================================

pub mod aggregate;
pub mod errors;
pub mod store;
pub mod value_objects;

pub use aggregate::{NewOrder, Order, DEFAULT_PAYMENT_WINDOW_SECS};
pub use errors::OrderError;
pub use store::OrderStore;
pub use value_objects::{OrderItem, OrderStatus, PaymentStatus, ShippingAddress};
