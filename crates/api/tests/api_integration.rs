//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};

use api::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::Money;
use domain::{InMemoryPaymentGateway, OrderCoordinator};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{Value, json};
use store::{Customer, InMemoryStore, Product, Store};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    store: Arc<InMemoryStore>,
    gateway: Arc<InMemoryPaymentGateway>,
    user: Customer,
    mug: Product,
    lamp: Product,
}

async fn setup() -> TestApp {
    let store = Arc::new(InMemoryStore::new());
    let user = Customer::new("Ada Lovelace", "ada@example.com", "+62 811");
    store.insert_customer(user.clone()).await;
    let mug = Product::new("Mug", Money::from_cents(1_500), 15);
    let lamp = Product::new("Lamp", Money::from_cents(4_000), 3);
    store.insert_product(mug.clone()).await;
    store.insert_product(lamp.clone()).await;

    let gateway = Arc::new(InMemoryPaymentGateway::new());
    let coordinator = OrderCoordinator::new(store.clone(), gateway.clone());
    let app = api::create_app(AppState::new(coordinator), get_metrics_handle());

    TestApp {
        app,
        store,
        gateway,
        user,
        mug,
        lamp,
    }
}

async fn send(app: &axum::Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

fn order_body(t: &TestApp, items: Value) -> Value {
    json!({
        "user_id": t.user.id.to_string(),
        "payment_method": "gopay",
        "items": items,
    })
}

#[tokio::test]
async fn test_health_check() {
    let t = setup().await;
    let (status, json) = send(&t.app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_create_order() {
    let t = setup().await;
    let body = order_body(
        &t,
        json!([
            { "product_id": t.mug.id.to_string(), "quantity": 10 },
            { "product_id": t.lamp.id.to_string(), "quantity": 1 },
        ]),
    );

    let (status, json) = send(&t.app, "POST", "/orders", Some(body)).await;

    assert_eq!(status, StatusCode::CREATED);
    let order = &json["order"];
    assert_eq!(order["status"], "pending");
    assert_eq!(order["total_cents"], 10 * 1_500 + 4_000);
    assert_eq!(order["items"][0]["product_name"], "Mug");
    assert_eq!(order["items"][0]["subtotal_cents"], 15_000);
    assert!(order["payment_token"].as_str().is_some());
    assert!(order["payment_redirect_url"].as_str().is_some());
    assert!(json.get("error").is_none());

    let mug = t.store.get_product(t.mug.id).await.unwrap().unwrap();
    assert_eq!(mug.stock, 5);
}

#[tokio::test]
async fn test_insufficient_stock_is_conflict() {
    let t = setup().await;
    let body = order_body(
        &t,
        json!([
            { "product_id": t.mug.id.to_string(), "quantity": 1 },
            { "product_id": t.lamp.id.to_string(), "quantity": 4 },
        ]),
    );

    let (status, json) = send(&t.app, "POST", "/orders", Some(body)).await;

    assert_eq!(status, StatusCode::CONFLICT);
    let message = json["error"].as_str().unwrap();
    assert!(message.contains(&t.lamp.id.to_string()));

    // Nothing from the rejected order sticks.
    let mug = t.store.get_product(t.mug.id).await.unwrap().unwrap();
    assert_eq!(mug.stock, 15);
    assert_eq!(t.store.order_count().await, 0);
}

#[tokio::test]
async fn test_invalid_requests_are_bad_requests() {
    let t = setup().await;

    let zero = order_body(&t, json!([{ "product_id": t.mug.id.to_string(), "quantity": 0 }]));
    let (status, _) = send(&t.app, "POST", "/orders", Some(zero)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let empty = order_body(&t, json!([]));
    let (status, _) = send(&t.app, "POST", "/orders", Some(empty)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let malformed = json!({
        "user_id": "not-a-uuid",
        "payment_method": "gopay",
        "items": [{ "product_id": t.mug.id.to_string(), "quantity": 1 }],
    });
    let (status, json) = send(&t.app, "POST", "/orders", Some(malformed)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("not-a-uuid"));

    let no_method = json!({
        "user_id": t.user.id.to_string(),
        "items": [{ "product_id": t.mug.id.to_string(), "quantity": 1 }],
    });
    let (status, _) = send(&t.app, "POST", "/orders", Some(no_method)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let mug = t.store.get_product(t.mug.id).await.unwrap().unwrap();
    assert_eq!(mug.stock, 15);
}

#[tokio::test]
async fn test_unknown_product_is_not_found() {
    let t = setup().await;
    let body = order_body(
        &t,
        json!([{ "product_id": common::ProductId::new().to_string(), "quantity": 1 }]),
    );

    let (status, _) = send(&t.app, "POST", "/orders", Some(body)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_gateway_failure_keeps_the_order() {
    let t = setup().await;
    t.gateway.set_fail_on_create(true).await;
    let body = order_body(&t, json!([{ "product_id": t.mug.id.to_string(), "quantity": 2 }]));

    let (status, json) = send(&t.app, "POST", "/orders", Some(body)).await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["error"].as_str().is_some());
    assert_eq!(json["order"]["status"], "pending");
    assert!(json["order"]["payment_token"].is_null());

    let order_id = json["order"]["id"].as_str().unwrap().to_string();
    let (status, stored) = send(&t.app, "GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stored["status"], "pending");

    let mug = t.store.get_product(t.mug.id).await.unwrap().unwrap();
    assert_eq!(mug.stock, 13);
}

#[tokio::test]
async fn test_get_order_errors() {
    let t = setup().await;

    let missing = common::OrderId::new();
    let (status, _) = send(&t.app, "GET", &format!("/orders/{missing}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&t.app, "GET", "/orders/garbage", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_order_history_most_recent_first() {
    let t = setup().await;
    let mut ids = Vec::new();
    for quantity in [1, 2] {
        let body = order_body(
            &t,
            json!([{ "product_id": t.mug.id.to_string(), "quantity": quantity }]),
        );
        let (status, json) = send(&t.app, "POST", "/orders", Some(body)).await;
        assert_eq!(status, StatusCode::CREATED);
        ids.push(json["order"]["id"].as_str().unwrap().to_string());
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let uri = format!("/orders?user_id={}", t.user.id);
    let (status, json) = send(&t.app, "GET", &uri, None).await;

    assert_eq!(status, StatusCode::OK);
    let history = json.as_array().unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0]["id"], ids[1].as_str());
    assert_eq!(history[1]["id"], ids[0].as_str());
}

#[tokio::test]
async fn test_status_update() {
    let t = setup().await;
    let body = order_body(&t, json!([{ "product_id": t.mug.id.to_string(), "quantity": 1 }]));
    let (_, json) = send(&t.app, "POST", "/orders", Some(body)).await;
    let uri = format!("/orders/{}/status", json["order"]["id"].as_str().unwrap());

    let (status, _) = send(&t.app, "PATCH", &uri, Some(json!({ "status": "shipped" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = send(&t.app, "PATCH", &uri, Some(json!({ "status": "cancelled" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "cancelled");

    let (status, _) = send(&t.app, "PATCH", &uri, Some(json!({ "status": "paid" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_cart_flow() {
    let t = setup().await;
    let user_id = t.user.id.to_string();

    let (status, cart) = send(&t.app, "GET", &format!("/carts?user_id={user_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["status"], "active");
    assert_eq!(cart["items"].as_array().unwrap().len(), 0);
    let first_cart = cart["id"].as_str().unwrap().to_string();

    let add = |quantity: i64| {
        json!({ "user_id": user_id, "product_id": t.mug.id.to_string(), "quantity": quantity })
    };
    send(&t.app, "POST", "/carts/items", Some(add(2))).await;
    let (status, cart) = send(&t.app, "POST", "/carts/items", Some(add(3))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(cart["items"].as_array().unwrap().len(), 1);
    assert_eq!(cart["items"][0]["quantity"], 5);

    let item_uri = format!("/carts/items/{}", cart["items"][0]["id"].as_str().unwrap());
    let (status, item) = send(&t.app, "PUT", &item_uri, Some(json!({ "quantity": 4 }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(item["quantity"], 4);

    let checkout = json!({ "user_id": user_id, "payment_method": "gopay" });
    let (status, placed) = send(&t.app, "POST", "/carts/checkout", Some(checkout)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(placed["order"]["total_cents"], 4 * 1_500);

    // The checked-out cart is frozen and a fresh one takes its place.
    let (status, _) = send(&t.app, "PUT", &item_uri, Some(json!({ "quantity": 1 }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (_, cart) = send(&t.app, "GET", &format!("/carts?user_id={user_id}"), None).await;
    assert_ne!(cart["id"], first_cart.as_str());
    assert_eq!(cart["items"].as_array().unwrap().len(), 0);

    let mug = t.store.get_product(t.mug.id).await.unwrap().unwrap();
    assert_eq!(mug.stock, 11);
}

#[tokio::test]
async fn test_remove_cart_item() {
    let t = setup().await;
    let body = json!({
        "user_id": t.user.id.to_string(),
        "product_id": t.lamp.id.to_string(),
        "quantity": 1,
    });
    let (_, cart) = send(&t.app, "POST", "/carts/items", Some(body)).await;
    let item_uri = format!("/carts/items/{}", cart["items"][0]["id"].as_str().unwrap());

    let (status, _) = send(&t.app, "DELETE", &item_uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, _) = send(&t.app, "DELETE", &item_uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_empty_cart_checkout_is_rejected() {
    let t = setup().await;
    let checkout = json!({ "user_id": t.user.id.to_string(), "payment_method": "gopay" });

    let (status, _) = send(&t.app, "POST", "/carts/checkout", Some(checkout)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_payment_notifications() {
    let t = setup().await;
    let body = order_body(&t, json!([{ "product_id": t.mug.id.to_string(), "quantity": 1 }]));
    let (_, json) = send(&t.app, "POST", "/orders", Some(body)).await;
    let order_id = json["order"]["id"].as_str().unwrap().to_string();

    let settlement = json!({ "order_id": order_id, "transaction_status": "settlement" });
    let (status, json) = send(&t.app, "POST", "/payments/notifications", Some(settlement.clone())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "paid");
    assert_eq!(json["outcome"], "applied");

    let (status, json) = send(&t.app, "POST", "/payments/notifications", Some(settlement)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["outcome"], "unchanged");

    let late = json!({ "order_id": order_id, "transaction_status": "pending" });
    let (status, json) = send(&t.app, "POST", "/payments/notifications", Some(late)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "paid");
    assert_eq!(json["outcome"], "stale");

    let (_, order) = send(&t.app, "GET", &format!("/orders/{order_id}"), None).await;
    assert_eq!(order["status"], "paid");
}

#[tokio::test]
async fn test_malformed_notifications() {
    let t = setup().await;

    let missing_status = json!({ "order_id": common::OrderId::new().to_string() });
    let (status, _) = send(&t.app, "POST", "/payments/notifications", Some(missing_status)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let missing_order = json!({ "transaction_status": "settlement" });
    let (status, _) = send(&t.app, "POST", "/payments/notifications", Some(missing_order)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let unknown = json!({
        "order_id": common::OrderId::new().to_string(),
        "transaction_status": "settlement",
    });
    let (status, _) = send(&t.app, "POST", "/payments/notifications", Some(unknown)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let t = setup().await;
    let body = order_body(&t, json!([{ "product_id": t.mug.id.to_string(), "quantity": 1 }]));
    send(&t.app, "POST", "/orders", Some(body)).await;

    let response = t
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));
}
