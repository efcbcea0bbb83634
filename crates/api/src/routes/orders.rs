//! Order placement, history and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{Money, OrderId, OrderStatus, UserId};
use domain::{PlaceOrder, PlacedOrder};
use serde::{Deserialize, Serialize};
use store::{Order, OrderItem, Store};

use super::parse_id;
use crate::AppState;
use crate::error::{ApiError, status_for};

// -- Request types --

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub user_id: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub paid_amount_cents: i64,
    #[serde(default)]
    pub items: Vec<OrderItemRequest>,
}

#[derive(Deserialize)]
pub struct OrderItemRequest {
    pub product_id: String,
    pub quantity: i64,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: String,
}

// -- Response types --

#[derive(Serialize)]
pub struct OrderResponse {
    pub id: String,
    pub user_id: String,
    pub status: OrderStatus,
    pub items: Vec<OrderItemResponse>,
    pub total_cents: i64,
    pub payment_method: String,
    pub paid_amount_cents: i64,
    pub payment_token: Option<String>,
    pub payment_redirect_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct OrderItemResponse {
    pub product_id: String,
    pub product_name: String,
    pub quantity: u32,
    pub unit_price_cents: i64,
    pub subtotal_cents: i64,
}

/// Body of a freshly placed order. `error` is set when the order committed
/// but no payment session could be opened yet.
#[derive(Serialize)]
pub struct PlacedOrderResponse {
    pub order: OrderResponse,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<&OrderItem> for OrderItemResponse {
    fn from(item: &OrderItem) -> Self {
        Self {
            product_id: item.product_id.to_string(),
            product_name: item.product_name.clone(),
            quantity: item.quantity,
            unit_price_cents: item.unit_price.cents(),
            subtotal_cents: item.subtotal.cents(),
        }
    }
}

impl From<&Order> for OrderResponse {
    fn from(order: &Order) -> Self {
        let session = order.payment_session.as_ref();
        Self {
            id: order.id.to_string(),
            user_id: order.user_id.to_string(),
            status: order.status,
            items: order.items.iter().map(OrderItemResponse::from).collect(),
            total_cents: order.total.cents(),
            payment_method: order.payment_method.clone(),
            paid_amount_cents: order.paid_amount.cents(),
            payment_token: session.map(|s| s.token.clone()),
            payment_redirect_url: session.map(|s| s.redirect_url.clone()),
            created_at: order.created_at,
            updated_at: order.updated_at,
        }
    }
}

/// 201 for a payable order, or the gateway error's status with the committed
/// order attached.
pub(crate) fn placed_response(placed: PlacedOrder) -> (StatusCode, Json<PlacedOrderResponse>) {
    let order = OrderResponse::from(&placed.order);
    match placed.payment_error {
        None => (StatusCode::CREATED, Json(PlacedOrderResponse { order, error: None })),
        Some(err) => (
            status_for(err.kind()),
            Json(PlacedOrderResponse {
                order,
                error: Some(err.to_string()),
            }),
        ),
    }
}

// -- Handlers --

/// POST /orders: place an order for the listed products.
#[tracing::instrument(skip(state, req), fields(user_id = %req.user_id))]
pub async fn create<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<PlacedOrderResponse>), ApiError> {
    let user_id: UserId = parse_id("user", &req.user_id)?;
    let mut cmd = PlaceOrder::new(user_id, req.payment_method)
        .with_paid_amount(Money::from_cents(req.paid_amount_cents));
    for item in &req.items {
        cmd = cmd.with_item(parse_id("product", &item.product_id)?, item.quantity);
    }

    let placed = state.coordinator.create_order(cmd).await?;
    Ok(placed_response(placed))
}

/// GET /orders?user_id=: a user's orders, most recent first.
#[tracing::instrument(skip(state))]
pub async fn history<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<OrderResponse>>, ApiError> {
    let user_id: UserId = parse_id("user", &query.user_id)?;
    let orders = state.coordinator.order_history(user_id).await?;
    Ok(Json(orders.iter().map(OrderResponse::from).collect()))
}

/// GET /orders/{id}
#[tracing::instrument(skip(state))]
pub async fn get<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    let order = state.coordinator.get_order(order_id).await?;
    Ok(Json(OrderResponse::from(&order)))
}

/// PATCH /orders/{id}/status: administrative status change.
#[tracing::instrument(skip(state, req))]
pub async fn update_status<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateStatusRequest>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id: OrderId = parse_id("order", &id)?;
    let status: OrderStatus = req
        .status
        .parse()
        .map_err(|e: common::ParseStatusError| ApiError::BadRequest(e.to_string()))?;

    let order = state.coordinator.update_status(order_id, status).await?;
    Ok(Json(OrderResponse::from(&order)))
}
