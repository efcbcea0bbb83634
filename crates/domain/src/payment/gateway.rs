//! Payment session gateway trait and in-memory implementation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use common::{Money, OrderId};
use serde::Serialize;
use store::{Customer, Order, PaymentSession};
use thiserror::Error;
use tokio::sync::Mutex;

/// What the processor needs to open a payable session for an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionRequest {
    pub order_id: OrderId,
    pub amount: Money,
    pub customer_name: String,
    pub customer_email: String,
    pub customer_phone: String,
}

impl SessionRequest {
    pub fn for_order(order: &Order, customer: &Customer) -> Self {
        Self {
            order_id: order.id,
            amount: order.total,
            customer_name: customer.full_name.clone(),
            customer_email: customer.email.clone(),
            customer_phone: customer.phone.clone(),
        }
    }
}

/// Errors returned by a payment gateway.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GatewayError {
    /// The processor could not be reached or failed on its side.
    #[error("Payment gateway unavailable: {0}")]
    Unavailable(String),

    /// The processor refused the request.
    #[error("Payment gateway rejected the request: {0}")]
    Rejected(String),
}

impl GatewayError {
    /// True if asking again for the same order cannot succeed.
    pub fn is_permanent(&self) -> bool {
        matches!(self, GatewayError::Rejected(_))
    }
}

/// Opens payment sessions with an external processor.
///
/// Implementations should be idempotent per order id: asking twice for the
/// same order yields the same session. A processor that instead refuses a
/// repeated order id answers [`GatewayError::Rejected`], and callers stop
/// retrying that order.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_session(&self, request: &SessionRequest)
    -> Result<PaymentSession, GatewayError>;
}

#[derive(Debug, Default)]
struct InMemoryGatewayState {
    sessions: HashMap<OrderId, (PaymentSession, Money)>,
    next_id: u32,
    calls: usize,
    fail_on_create: bool,
    refused: HashSet<OrderId>,
}

/// In-memory payment gateway for tests and demo mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentGateway {
    state: Arc<Mutex<InMemoryGatewayState>>,
}

impl InMemoryPaymentGateway {
    /// Creates a new in-memory gateway.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the gateway to fail every call until switched off again.
    pub async fn set_fail_on_create(&self, fail: bool) {
        self.state.lock().await.fail_on_create = fail;
    }

    /// Makes every later request for `order_id` fail with
    /// [`GatewayError::Rejected`].
    pub async fn refuse_order(&self, order_id: OrderId) {
        self.state.lock().await.refused.insert(order_id);
    }

    /// Returns the number of distinct sessions issued.
    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    /// Returns the number of `create_session` calls, failed ones included.
    pub async fn call_count(&self) -> usize {
        self.state.lock().await.calls
    }

    /// Returns the amount a session was opened for.
    pub async fn charged_amount(&self, order_id: OrderId) -> Option<Money> {
        self.state
            .lock()
            .await
            .sessions
            .get(&order_id)
            .map(|(_, amount)| *amount)
    }
}

#[async_trait]
impl PaymentGateway for InMemoryPaymentGateway {
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<PaymentSession, GatewayError> {
        let mut state = self.state.lock().await;
        state.calls += 1;

        if state.fail_on_create {
            return Err(GatewayError::Unavailable("connection refused".to_string()));
        }

        if state.refused.contains(&request.order_id) {
            return Err(GatewayError::Rejected(format!(
                "order id {} has already been taken",
                request.order_id
            )));
        }

        if let Some((session, _)) = state.sessions.get(&request.order_id) {
            return Ok(session.clone());
        }

        state.next_id += 1;
        let token = format!("SNAP-{:04}", state.next_id);
        let session = PaymentSession {
            redirect_url: format!("https://payments.invalid/snap/{token}"),
            token,
        };
        state
            .sessions
            .insert(request.order_id, (session.clone(), request.amount));

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(order_id: OrderId) -> SessionRequest {
        SessionRequest {
            order_id,
            amount: Money::from_cents(5000),
            customer_name: "Ada".to_string(),
            customer_email: "ada@example.com".to_string(),
            customer_phone: "+62 811".to_string(),
        }
    }

    #[tokio::test]
    async fn test_sessions_are_idempotent_per_order() {
        let gateway = InMemoryPaymentGateway::new();
        let order_id = OrderId::new();

        let first = gateway.create_session(&request(order_id)).await.unwrap();
        let second = gateway.create_session(&request(order_id)).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.token, "SNAP-0001");
        assert_eq!(gateway.session_count().await, 1);
        assert_eq!(gateway.call_count().await, 2);
        assert_eq!(
            gateway.charged_amount(order_id).await,
            Some(Money::from_cents(5000))
        );
    }

    #[tokio::test]
    async fn test_fail_on_create() {
        let gateway = InMemoryPaymentGateway::new();
        gateway.set_fail_on_create(true).await;

        let result = gateway.create_session(&request(OrderId::new())).await;
        assert!(matches!(result, Err(GatewayError::Unavailable(_))));
        assert_eq!(gateway.session_count().await, 0);

        gateway.set_fail_on_create(false).await;
        assert!(gateway.create_session(&request(OrderId::new())).await.is_ok());
    }

    #[tokio::test]
    async fn test_refused_orders_are_permanent_rejections() {
        let gateway = InMemoryPaymentGateway::new();
        let refused = OrderId::new();
        gateway.refuse_order(refused).await;

        let err = gateway.create_session(&request(refused)).await.unwrap_err();
        assert!(matches!(err, GatewayError::Rejected(_)));
        assert!(err.is_permanent());
        assert!(!GatewayError::Unavailable("timeout".into()).is_permanent());

        assert!(gateway.create_session(&request(OrderId::new())).await.is_ok());
    }
}
