//! Transactional persistence for the order service.
//!
//! The [`Store`] trait covers plain reads and single-statement writes. Anything
//! that must be all-or-nothing goes through a [`Transaction`] obtained from
//! [`Store::begin`]; rows locked through a transaction stay locked until it
//! commits, rolls back, or is dropped.

pub mod error;
pub mod memory;
pub mod model;
pub mod postgres;
pub mod store;

pub use error::{Result, StoreError};
pub use memory::{InMemoryStore, InMemoryTransaction};
pub use model::{Cart, CartItem, Customer, Order, OrderItem, PaymentSession, Product};
pub use postgres::{PostgresStore, PostgresTransaction};
pub use store::{CartItemWrite, Store, Transaction};
