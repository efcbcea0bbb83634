//! Maps asynchronous payment notifications onto order status.

use std::sync::Arc;

use common::{OrderId, OrderStatus};
use serde::{Deserialize, Serialize};
use store::{Store, Transaction};

use crate::error::{OrderError, Result};
use crate::unit_of_work::finish;

/// A payment status callback as delivered by the processor.
///
/// Missing fields deserialize as empty and are rejected by
/// [`NotificationReconciler::reconcile`], so they never reach the store.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PaymentNotification {
    #[serde(default)]
    pub order_id: String,
    #[serde(default)]
    pub transaction_status: String,
    #[serde(default)]
    pub fraud_status: Option<String>,
}

impl PaymentNotification {
    pub fn new(order_id: impl Into<String>, transaction_status: impl Into<String>) -> Self {
        Self {
            order_id: order_id.into(),
            transaction_status: transaction_status.into(),
            fraud_status: None,
        }
    }

    pub fn with_fraud_status(mut self, fraud_status: impl Into<String>) -> Self {
        self.fraud_status = Some(fraud_status.into());
        self
    }

    /// The order status this notification asks for.
    pub fn requested_status(&self) -> OrderStatus {
        map_status(&self.transaction_status, self.fraud_status.as_deref())
    }
}

/// Maps processor status tokens onto an order status.
///
/// A capture only counts as paid once fraud screening accepted it. Anything
/// unrecognized leaves the order pending.
pub fn map_status(transaction_status: &str, fraud_status: Option<&str>) -> OrderStatus {
    match transaction_status {
        "capture" if fraud_status == Some("accept") => OrderStatus::Paid,
        "settlement" => OrderStatus::Paid,
        "deny" | "expire" | "cancel" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

/// What a notification did to its order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// The status moved.
    Applied,
    /// The order already had the requested status.
    Unchanged,
    /// The order is terminal and the notification asked for something else.
    Stale,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::Unchanged => "unchanged",
            ReconcileOutcome::Stale => "stale",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub order_id: OrderId,
    pub previous: OrderStatus,
    pub requested: OrderStatus,
    /// Status after the notification was handled.
    pub status: OrderStatus,
    pub outcome: ReconcileOutcome,
}

/// Applies payment notifications to orders.
///
/// Each notification is handled under the order's row lock, so duplicate or
/// near-simultaneous deliveries serialize. Once an order is terminal the first
/// terminal status stays.
pub struct NotificationReconciler<S: Store> {
    store: Arc<S>,
}

impl<S: Store> Clone for NotificationReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: Store> NotificationReconciler<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip(self))]
    pub async fn reconcile(&self, notification: &PaymentNotification) -> Result<Reconciliation> {
        let order_id = parse_order_id(&notification.order_id)?;
        if notification.transaction_status.trim().is_empty() {
            return Err(OrderError::MissingField {
                field: "transaction_status",
            });
        }
        let requested = notification.requested_status();

        let mut tx = self.store.begin().await?;
        let outcome = apply(&mut tx, order_id, requested).await;
        let reconciliation = finish(tx, outcome).await?;

        metrics::counter!(
            "payment_notifications_total",
            "outcome" => reconciliation.outcome.as_str()
        )
        .increment(1);

        match reconciliation.outcome {
            ReconcileOutcome::Stale => tracing::warn!(
                %order_id,
                current = %reconciliation.previous,
                requested = %requested,
                transaction_status = %notification.transaction_status,
                "ignoring notification for terminal order"
            ),
            _ => tracing::info!(
                %order_id,
                status = %reconciliation.status,
                outcome = reconciliation.outcome.as_str(),
                "payment notification reconciled"
            ),
        }

        Ok(reconciliation)
    }
}

async fn apply<T: Transaction>(
    tx: &mut T,
    order_id: OrderId,
    requested: OrderStatus,
) -> Result<Reconciliation> {
    let order = tx
        .lock_order(order_id)
        .await?
        .ok_or(OrderError::OrderNotFound(order_id))?;
    let previous = order.status;

    let outcome = if previous == requested {
        ReconcileOutcome::Unchanged
    } else if previous.can_transition_to(requested) {
        tx.set_order_status(order_id, requested).await?;
        ReconcileOutcome::Applied
    } else {
        ReconcileOutcome::Stale
    };

    let status = match outcome {
        ReconcileOutcome::Applied => requested,
        _ => previous,
    };

    Ok(Reconciliation {
        order_id,
        previous,
        requested,
        status,
        outcome,
    })
}

fn parse_order_id(raw: &str) -> Result<OrderId> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(OrderError::MissingField { field: "order_id" });
    }
    raw.parse().map_err(|_| OrderError::InvalidId {
        kind: "order",
        value: raw.to_string(),
    })
}
