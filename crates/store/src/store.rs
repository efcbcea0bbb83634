use async_trait::async_trait;
use common::{CartId, CartItemId, CartStatus, OrderId, OrderStatus, ProductId, UserId};

use crate::{Cart, CartItem, Customer, Order, PaymentSession, Product, Result};

/// Outcome of a write against a cart line.
///
/// Cart lines may only change while their cart is active; the store checks
/// that under the cart's row lock so an edit can never race a checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartItemWrite {
    /// The write went through. Carries the line as it now is (or was, for a
    /// removal).
    Applied(CartItem),
    /// The owning cart has already been checked out.
    CartClosed(CartId),
    /// The cart or line does not exist.
    NotFound,
}

/// A unit of work holding row locks until it finishes.
///
/// Reads through a transaction see its own uncommitted writes. Other readers
/// see committed state only. Dropping a transaction without calling
/// [`Transaction::commit`] rolls it back.
#[async_trait]
pub trait Transaction: Send {
    /// Reads a product row and locks it exclusively for the rest of the
    /// transaction. Blocks while another transaction holds the lock.
    ///
    /// Returns `None` if the product doesn't exist.
    async fn lock_product(&mut self, id: ProductId) -> Result<Option<Product>>;

    /// Overwrites a product's stock count.
    async fn set_stock(&mut self, id: ProductId, stock: u32) -> Result<()>;

    /// Writes a new order together with all of its items.
    async fn insert_order(&mut self, order: &Order) -> Result<()>;

    /// Reads an order and locks its row. Returns `None` if it doesn't exist.
    async fn lock_order(&mut self, id: OrderId) -> Result<Option<Order>>;

    /// Overwrites an order's status. Transition rules are the caller's job.
    async fn set_order_status(&mut self, id: OrderId, status: OrderStatus) -> Result<()>;

    /// Reads a cart with its lines and locks the cart row.
    async fn lock_cart(&mut self, id: CartId) -> Result<Option<Cart>>;

    /// Overwrites a cart's status.
    async fn set_cart_status(&mut self, id: CartId, status: CartStatus) -> Result<()>;

    /// Makes every write durable and releases all locks.
    async fn commit(self) -> Result<()>;

    /// Discards every write and releases all locks.
    async fn rollback(self) -> Result<()>;
}

/// Core trait for store implementations.
///
/// All implementations must be thread-safe (Send + Sync).
#[async_trait]
pub trait Store: Send + Sync {
    /// The transaction type handed out by [`Store::begin`].
    type Tx: Transaction + 'static;

    /// Starts a new transaction.
    async fn begin(&self) -> Result<Self::Tx>;

    /// Unlocked product read. May be stale by one in-flight transaction.
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    async fn get_customer(&self, id: UserId) -> Result<Option<Customer>>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    /// All orders of a user, most recent first.
    async fn orders_for_user(&self, user_id: UserId) -> Result<Vec<Order>>;

    /// Pending orders that never got a payment session and were not refused
    /// by the processor. Orders with fewer failed attempts come first, then
    /// older ones.
    async fn orders_missing_session(&self, limit: usize) -> Result<Vec<Order>>;

    /// Counts a failed attempt at opening an order's payment session.
    ///
    /// A `permanent` failure takes the order out of
    /// [`Store::orders_missing_session`] for good.
    async fn record_session_failure(&self, id: OrderId, permanent: bool) -> Result<()>;

    /// Records the payment session of an order if it has none yet.
    ///
    /// Returns `false` when the order already had a session (or doesn't exist).
    async fn attach_payment_session(&self, id: OrderId, session: &PaymentSession) -> Result<bool>;

    /// Returns the user's active cart, creating it if there is none.
    ///
    /// At most one active cart exists per user, even under concurrent calls.
    async fn active_cart(&self, user_id: UserId) -> Result<Cart>;

    async fn get_cart(&self, id: CartId) -> Result<Option<Cart>>;

    /// Adds `quantity` units of a product to a cart, merging into the existing
    /// line for that product if there is one.
    async fn add_cart_item(
        &self,
        cart_id: CartId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<CartItemWrite>;

    /// Replaces the quantity of a cart line.
    async fn set_cart_item_quantity(&self, id: CartItemId, quantity: u32)
    -> Result<CartItemWrite>;

    async fn remove_cart_item(&self, id: CartItemId) -> Result<CartItemWrite>;
}
