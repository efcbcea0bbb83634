//! Domain error types.

use common::{CartId, CartItemId, OrderId, OrderStatus, ProductId, UserId};
use store::StoreError;
use thiserror::Error;

use crate::payment::GatewayError;

/// Coarse classification of an [`OrderError`], used by callers to decide how
/// to report it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    InsufficientStock,
    Conflict,
    Upstream,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::InsufficientStock => "insufficient_stock",
            ErrorKind::Conflict => "conflict",
            ErrorKind::Upstream => "upstream",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Errors that can occur during order, cart and payment operations.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Invalid quantity.
    #[error("Invalid quantity: {quantity} (must be greater than 0)")]
    InvalidQuantity { quantity: i64 },

    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// Checkout of a cart without lines.
    #[error("Cart {0} has no items")]
    EmptyCart(CartId),

    /// Negative paid amount.
    #[error("Invalid paid amount: {cents} (must not be negative)")]
    InvalidAmount { cents: i64 },

    /// Payment method is required.
    #[error("Payment method is required")]
    MissingPaymentMethod,

    /// The order total does not fit in the money type.
    #[error("Order total overflows")]
    TotalOverflow,

    /// An identifier could not be parsed.
    #[error("Malformed {kind} id: {value}")]
    InvalidId { kind: &'static str, value: String },

    /// A required field was empty.
    #[error("Missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    #[error("Order not found: {0}")]
    OrderNotFound(OrderId),

    #[error("Cart not found: {0}")]
    CartNotFound(CartId),

    #[error("Cart item not found: {0}")]
    CartItemNotFound(CartItemId),

    #[error("Customer not found: {0}")]
    CustomerNotFound(UserId),

    /// Not enough units on hand. Aborts the whole order.
    #[error(
        "Insufficient stock for product {product_id}: requested {requested}, available {available}"
    )]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The order status machine forbids the requested change.
    #[error("Invalid status transition for order {order_id}: {from} -> {to}")]
    InvalidTransition {
        order_id: OrderId,
        from: OrderStatus,
        to: OrderStatus,
    },

    /// The cart was already checked out.
    #[error("Cart {0} is already checked out")]
    CartClosed(CartId),

    /// The payment gateway failed.
    #[error(transparent)]
    Upstream(#[from] GatewayError),

    /// An error occurred in the store.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl OrderError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrderError::InvalidQuantity { .. }
            | OrderError::NoItems
            | OrderError::EmptyCart(_)
            | OrderError::InvalidAmount { .. }
            | OrderError::MissingPaymentMethod
            | OrderError::TotalOverflow
            | OrderError::InvalidId { .. }
            | OrderError::MissingField { .. } => ErrorKind::Validation,
            OrderError::ProductNotFound(_)
            | OrderError::OrderNotFound(_)
            | OrderError::CartNotFound(_)
            | OrderError::CartItemNotFound(_)
            | OrderError::CustomerNotFound(_) => ErrorKind::NotFound,
            OrderError::InsufficientStock { .. } => ErrorKind::InsufficientStock,
            OrderError::InvalidTransition { .. } | OrderError::CartClosed(_) => {
                ErrorKind::Conflict
            }
            OrderError::Upstream(_) => ErrorKind::Upstream,
            OrderError::Store(_) => ErrorKind::Internal,
        }
    }
}

/// Convenience type alias for domain results.
pub type Result<T> = std::result::Result<T, OrderError>;
