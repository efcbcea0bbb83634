//! Order processing over a shared, finite inventory.
//!
//! This crate provides:
//! - The inventory ledger (locked check-and-decrement of stock)
//! - The order coordinator, which places orders in one transaction and opens
//!   payment sessions after commit
//! - The cart service and its checkout flow
//! - The payment notification reconciler
//! - The background mail queue

pub mod cart;
pub mod error;
pub mod ledger;
pub mod mailer;
pub mod order;
pub mod payment;
mod unit_of_work;

pub use cart::CartService;
pub use error::{ErrorKind, OrderError, Result};
pub use ledger::{Reservation, reserve};
pub use mailer::{LogMailer, MailError, MailJob, MailQueue, MailWorkers, Mailer};
pub use order::{OrderCoordinator, OrderLine, PlaceOrder, PlacedOrder, SweepReport};
pub use payment::{
    GatewayError, InMemoryPaymentGateway, NotificationReconciler, PaymentGateway,
    PaymentNotification, ReconcileOutcome, Reconciliation, SessionRequest, SnapConfig,
    SnapGateway, map_status,
};
