//! Cart service.

use std::sync::Arc;

use common::{CartId, CartItemId, Money, ProductId, UserId};
use store::{Cart, CartItem, CartItemWrite, Store};

use crate::error::{OrderError, Result};
use crate::order::{OrderCoordinator, PlacedOrder, Terms, positive_quantity};

/// Manages each user's active cart and checks it out into an order.
pub struct CartService<S: Store> {
    coordinator: OrderCoordinator<S>,
}

impl<S: Store> Clone for CartService<S> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
        }
    }
}

impl<S: Store> CartService<S> {
    /// Creates a cart service placing its orders through `coordinator`.
    pub fn new(coordinator: OrderCoordinator<S>) -> Self {
        Self { coordinator }
    }

    fn store(&self) -> &Arc<S> {
        self.coordinator.store()
    }

    /// Returns the user's active cart, creating it if needed.
    #[tracing::instrument(skip(self))]
    pub async fn get_cart(&self, user_id: UserId) -> Result<Cart> {
        Ok(self.store().active_cart(user_id).await?)
    }

    /// Adds units of a product to the user's active cart.
    ///
    /// If the cart gets checked out between lookup and write, the units go to
    /// the user's next active cart instead.
    #[tracing::instrument(skip(self))]
    pub async fn add_item(&self, user_id: UserId, product_id: ProductId, quantity: i64) -> Result<Cart> {
        let quantity = positive_quantity(quantity)?;
        self.store()
            .get_product(product_id)
            .await?
            .ok_or(OrderError::ProductNotFound(product_id))?;

        let mut cart = self.store().active_cart(user_id).await?;
        for _ in 0..2 {
            match self.store().add_cart_item(cart.id, product_id, quantity).await? {
                CartItemWrite::Applied(_) => return self.reload(cart.id).await,
                CartItemWrite::CartClosed(_) | CartItemWrite::NotFound => {
                    cart = self.store().active_cart(user_id).await?;
                }
            }
        }
        Err(OrderError::CartClosed(cart.id))
    }

    /// Replaces the quantity of a cart line.
    #[tracing::instrument(skip(self))]
    pub async fn update_item(&self, item_id: CartItemId, quantity: i64) -> Result<CartItem> {
        let quantity = positive_quantity(quantity)?;
        let write = self.store().set_cart_item_quantity(item_id, quantity).await?;
        applied(write, item_id)
    }

    /// Removes a cart line. Returns the removed line.
    #[tracing::instrument(skip(self))]
    pub async fn remove_item(&self, item_id: CartItemId) -> Result<CartItem> {
        let write = self.store().remove_cart_item(item_id).await?;
        applied(write, item_id)
    }

    /// Checks out the user's active cart.
    ///
    /// On success the cart is `checked_out` and a new empty cart will be
    /// created on next access. On any failure the cart stays active with its
    /// lines untouched.
    #[tracing::instrument(skip(self, payment_method))]
    pub async fn checkout(
        &self,
        user_id: UserId,
        payment_method: impl Into<String>,
        paid_amount: Money,
    ) -> Result<PlacedOrder> {
        let cart = self.store().active_cart(user_id).await?;
        if cart.is_empty() {
            return Err(OrderError::EmptyCart(cart.id));
        }

        let terms = Terms {
            user_id,
            payment_method: payment_method.into(),
            paid_amount,
        };
        let placed = self.coordinator.checkout_cart(cart.id, terms).await?;
        tracing::info!(cart_id = %cart.id, order_id = %placed.order.id, "cart checked out");
        Ok(placed)
    }

    async fn reload(&self, cart_id: CartId) -> Result<Cart> {
        self.store()
            .get_cart(cart_id)
            .await?
            .ok_or(OrderError::CartNotFound(cart_id))
    }
}

fn applied(write: CartItemWrite, item_id: CartItemId) -> Result<CartItem> {
    match write {
        CartItemWrite::Applied(item) => Ok(item),
        CartItemWrite::CartClosed(cart_id) => Err(OrderError::CartClosed(cart_id)),
        CartItemWrite::NotFound => Err(OrderError::CartItemNotFound(item_id)),
    }
}
