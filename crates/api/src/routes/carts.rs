//! Cart endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::{CartItemId, CartStatus, Money, ProductId, UserId};
use serde::{Deserialize, Serialize};
use store::{Cart, CartItem, Store};

use super::orders::{PlacedOrderResponse, placed_response};
use super::parse_id;
use crate::AppState;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CartQuery {
    pub user_id: String,
}

#[derive(Deserialize)]
pub struct AddItemRequest {
    pub user_id: String,
    pub product_id: String,
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct UpdateItemRequest {
    pub quantity: i64,
}

#[derive(Deserialize)]
pub struct CheckoutRequest {
    pub user_id: String,
    #[serde(default)]
    pub payment_method: String,
    #[serde(default)]
    pub paid_amount_cents: i64,
}

#[derive(Serialize)]
pub struct CartResponse {
    pub id: String,
    pub user_id: String,
    pub status: CartStatus,
    pub items: Vec<CartItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
pub struct CartItemResponse {
    pub id: String,
    pub product_id: String,
    pub quantity: u32,
}

impl From<&CartItem> for CartItemResponse {
    fn from(item: &CartItem) -> Self {
        Self {
            id: item.id.to_string(),
            product_id: item.product_id.to_string(),
            quantity: item.quantity,
        }
    }
}

impl From<&Cart> for CartResponse {
    fn from(cart: &Cart) -> Self {
        Self {
            id: cart.id.to_string(),
            user_id: cart.user_id.to_string(),
            status: cart.status,
            items: cart.items.iter().map(CartItemResponse::from).collect(),
            created_at: cart.created_at,
            updated_at: cart.updated_at,
        }
    }
}

/// GET /carts?user_id=: the user's active cart, created on first access.
#[tracing::instrument(skip(state))]
pub async fn get<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<CartQuery>,
) -> Result<Json<CartResponse>, ApiError> {
    let user_id: UserId = parse_id("user", &query.user_id)?;
    let cart = state.carts.get_cart(user_id).await?;
    Ok(Json(CartResponse::from(&cart)))
}

/// POST /carts/items: add units of a product, merging with an existing line.
#[tracing::instrument(skip(state, req))]
pub async fn add_item<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<AddItemRequest>,
) -> Result<Json<CartResponse>, ApiError> {
    let user_id: UserId = parse_id("user", &req.user_id)?;
    let product_id: ProductId = parse_id("product", &req.product_id)?;
    let cart = state
        .carts
        .add_item(user_id, product_id, req.quantity)
        .await?;
    Ok(Json(CartResponse::from(&cart)))
}

/// PUT /carts/items/{id}: replace a line's quantity.
#[tracing::instrument(skip(state, req))]
pub async fn update_item<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    Json(req): Json<UpdateItemRequest>,
) -> Result<Json<CartItemResponse>, ApiError> {
    let item_id: CartItemId = parse_id("cart item", &id)?;
    let item = state.carts.update_item(item_id, req.quantity).await?;
    Ok(Json(CartItemResponse::from(&item)))
}

/// DELETE /carts/items/{id}
#[tracing::instrument(skip(state))]
pub async fn remove_item<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let item_id: CartItemId = parse_id("cart item", &id)?;
    state.carts.remove_item(item_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /carts/checkout: turn the user's active cart into an order.
#[tracing::instrument(skip(state, req))]
pub async fn checkout<S: Store + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<PlacedOrderResponse>), ApiError> {
    let user_id: UserId = parse_id("user", &req.user_id)?;
    let placed = state
        .carts
        .checkout(
            user_id,
            req.payment_method,
            Money::from_cents(req.paid_amount_cents),
        )
        .await?;
    Ok(placed_response(placed))
}
