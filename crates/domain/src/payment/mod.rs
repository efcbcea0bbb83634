//! Payment processor integration.

mod gateway;
mod reconciler;
mod snap;

pub use gateway::{GatewayError, InMemoryPaymentGateway, PaymentGateway, SessionRequest};
pub use reconciler::{
    NotificationReconciler, PaymentNotification, ReconcileOutcome, Reconciliation, map_status,
};
pub use snap::{SnapConfig, SnapGateway};
