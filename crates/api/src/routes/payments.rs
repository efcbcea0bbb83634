//! Payment processor callbacks.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use domain::{PaymentNotification, Reconciliation};
use store::Store;

use crate::AppState;
use crate::error::ApiError;

/// POST /payments/notifications: apply a transaction status callback.
///
/// Redeliveries of an already applied status answer 200 with outcome
/// `unchanged`, so the processor stops retrying.
#[tracing::instrument(skip(state, notification), fields(order_id = %notification.order_id))]
pub async fn notify<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(notification): Json<PaymentNotification>,
) -> Result<Json<Reconciliation>, ApiError> {
    let reconciliation = state.reconciler.reconcile(&notification).await?;
    Ok(Json(reconciliation))
}
