//! HTTP API server for the order service.
//!
//! Provides REST endpoints for orders, carts and payment notifications, with
//! structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;
pub mod seed;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, patch, post, put};
use domain::{CartService, NotificationReconciler, OrderCoordinator};
use metrics_exporter_prometheus::PrometheusHandle;
use store::Store;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Shared application state accessible from all handlers.
pub struct AppState<S: Store> {
    pub coordinator: OrderCoordinator<S>,
    pub carts: CartService<S>,
    pub reconciler: NotificationReconciler<S>,
}

impl<S: Store> AppState<S> {
    /// Wires the cart service and reconciler around `coordinator` and its store.
    pub fn new(coordinator: OrderCoordinator<S>) -> Arc<Self> {
        let reconciler = NotificationReconciler::new(coordinator.store().clone());
        let carts = CartService::new(coordinator.clone());
        Arc::new(Self {
            coordinator,
            carts,
            reconciler,
        })
    }
}

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: Store + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route(
            "/orders",
            post(routes::orders::create::<S>).get(routes::orders::history::<S>),
        )
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .route(
            "/orders/{id}/status",
            patch(routes::orders::update_status::<S>),
        )
        .route("/carts", get(routes::carts::get::<S>))
        .route("/carts/items", post(routes::carts::add_item::<S>))
        .route(
            "/carts/items/{id}",
            put(routes::carts::update_item::<S>).delete(routes::carts::remove_item::<S>),
        )
        .route("/carts/checkout", post(routes::carts::checkout::<S>))
        .route(
            "/payments/notifications",
            post(routes::payments::notify::<S>),
        )
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}
