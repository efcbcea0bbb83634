//! Inventory ledger: locked check-and-decrement of product stock.

use common::{Money, ProductId};
use store::Transaction;

use crate::error::{OrderError, Result};

/// Units taken from a product, with the price in force when they were taken.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub product_id: ProductId,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price: Money,
    /// Stock left after this reservation, as seen inside the transaction.
    pub remaining: u32,
}

impl Reservation {
    /// `quantity * unit_price`.
    pub fn subtotal(&self) -> Result<Money> {
        self.unit_price
            .checked_mul(self.quantity)
            .ok_or(OrderError::TotalOverflow)
    }
}

/// Reserves `quantity` units of a product inside `tx`.
///
/// Locks the product row until `tx` finishes, so the check and the decrement
/// cannot interleave with another reservation of the same product. Nothing is
/// written when stock is short.
#[tracing::instrument(skip(tx))]
pub async fn reserve<T: Transaction>(
    tx: &mut T,
    product_id: ProductId,
    quantity: u32,
) -> Result<Reservation> {
    if quantity == 0 {
        return Err(OrderError::InvalidQuantity { quantity: 0 });
    }

    let product = tx
        .lock_product(product_id)
        .await?
        .ok_or(OrderError::ProductNotFound(product_id))?;

    let Some(remaining) = product.stock.checked_sub(quantity) else {
        metrics::counter!("ledger_reservations_total", "outcome" => "insufficient").increment(1);
        return Err(OrderError::InsufficientStock {
            product_id,
            requested: quantity,
            available: product.stock,
        });
    };

    tx.set_stock(product_id, remaining).await?;
    metrics::counter!("ledger_reservations_total", "outcome" => "reserved").increment(1);

    Ok(Reservation {
        product_id,
        product_name: product.name,
        quantity,
        unit_price: product.price,
        remaining,
    })
}
