//! Order placement requests and their validation.

use common::{Money, ProductId, UserId};
use serde::{Deserialize, Serialize};
use store::Order;

use crate::error::{OrderError, Result};

/// A requested line: a product and how many units of it.
///
/// The quantity is signed so that a negative request can be reported as
/// such instead of failing to parse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: i64) -> Self {
        Self {
            product_id,
            quantity,
        }
    }
}

/// Command to place an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub user_id: UserId,
    pub payment_method: String,
    #[serde(default)]
    pub paid_amount: Money,
    pub items: Vec<OrderLine>,
}

impl PlaceOrder {
    /// Creates an empty order request.
    pub fn new(user_id: UserId, payment_method: impl Into<String>) -> Self {
        Self {
            user_id,
            payment_method: payment_method.into(),
            paid_amount: Money::zero(),
            items: Vec::new(),
        }
    }

    pub fn with_item(mut self, product_id: ProductId, quantity: i64) -> Self {
        self.items.push(OrderLine::new(product_id, quantity));
        self
    }

    pub fn with_paid_amount(mut self, paid_amount: Money) -> Self {
        self.paid_amount = paid_amount;
        self
    }
}

/// Result of placing an order.
///
/// The order is committed whenever this is returned; `payment_error` only
/// reports that no payment session could be opened yet.
#[derive(Debug)]
pub struct PlacedOrder {
    pub order: Order,
    pub payment_error: Option<OrderError>,
}

impl PlacedOrder {
    /// True if the order carries a payment session.
    pub fn is_payable(&self) -> bool {
        self.order.payment_session.is_some()
    }
}

/// Checks the payment terms of an order.
pub(crate) fn validate_terms(payment_method: &str, paid_amount: Money) -> Result<()> {
    if payment_method.trim().is_empty() {
        return Err(OrderError::MissingPaymentMethod);
    }
    if paid_amount.is_negative() {
        return Err(OrderError::InvalidAmount {
            cents: paid_amount.cents(),
        });
    }
    Ok(())
}

/// Converts a requested quantity into a unit count.
pub(crate) fn positive_quantity(quantity: i64) -> Result<u32> {
    match u32::try_from(quantity) {
        Ok(units) if units > 0 => Ok(units),
        _ => Err(OrderError::InvalidQuantity { quantity }),
    }
}

/// Validates lines and merges repeated products, keeping first-seen order.
pub(crate) fn merge_lines(lines: &[OrderLine]) -> Result<Vec<(ProductId, u32)>> {
    if lines.is_empty() {
        return Err(OrderError::NoItems);
    }

    let mut merged: Vec<(ProductId, u32)> = Vec::with_capacity(lines.len());
    for line in lines {
        let quantity = positive_quantity(line.quantity)?;
        match merged.iter_mut().find(|(id, _)| *id == line.product_id) {
            Some((_, total)) => {
                *total = total
                    .checked_add(quantity)
                    .ok_or(OrderError::InvalidQuantity {
                        quantity: line.quantity,
                    })?;
            }
            None => merged.push((line.product_id, quantity)),
        }
    }
    Ok(merged)
}
