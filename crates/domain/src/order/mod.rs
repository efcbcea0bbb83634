//! Order placement and lifecycle.

mod coordinator;
mod request;

pub use coordinator::{OrderCoordinator, SweepReport};
pub use request::{OrderLine, PlaceOrder, PlacedOrder};

pub(crate) use coordinator::Terms;
pub(crate) use request::positive_quantity;
