//! Shared types for the order service.
//!
//! Everything here is plain data: identifiers, money, and the two status
//! state machines that every other crate agrees on.

pub mod money;
pub mod status;
pub mod types;

pub use money::Money;
pub use status::{CartStatus, OrderStatus, ParseStatusError};
pub use types::{CartId, CartItemId, OrderId, OrderItemId, ProductId, UserId};
