//! HTTP handlers, one module per resource.

pub mod carts;
pub mod health;
pub mod metrics;
pub mod orders;
pub mod payments;

use std::str::FromStr;

use domain::OrderError;

use crate::error::ApiError;

/// Parses an identifier taken from a path, query or body.
pub(crate) fn parse_id<T: FromStr>(kind: &'static str, value: &str) -> Result<T, ApiError> {
    value.trim().parse().map_err(|_| {
        ApiError::from(OrderError::InvalidId {
            kind,
            value: value.to_string(),
        })
    })
}
