//! Midtrans Snap client.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use store::PaymentSession;

use super::gateway::{GatewayError, PaymentGateway, SessionRequest};

const SANDBOX_URL: &str = "https://app.sandbox.midtrans.com/snap/v1/transactions";
const PRODUCTION_URL: &str = "https://app.midtrans.com/snap/v1/transactions";

/// Configuration for connecting to Midtrans Snap.
#[derive(Debug, Clone)]
pub struct SnapConfig {
    /// Merchant server key, sent as the basic-auth user name.
    pub server_key: String,

    /// Use the production endpoint instead of the sandbox.
    pub production: bool,
}

/// HTTP client for the Snap transactions API.
///
/// Snap does not hand out the first session again for a repeated order id.
/// It refuses the request with a client error, which surfaces as
/// [`GatewayError::Rejected`], so an order whose first response was lost ends
/// up without a session and is no longer retried.
#[derive(Debug, Clone)]
pub struct SnapGateway {
    http: Client,
    endpoint: String,
    server_key: String,
}

impl SnapGateway {
    #[must_use]
    pub fn new(config: SnapConfig) -> Self {
        let endpoint = if config.production {
            PRODUCTION_URL
        } else {
            SANDBOX_URL
        };
        Self {
            http: Client::new(),
            endpoint: endpoint.to_string(),
            server_key: config.server_key,
        }
    }

    /// Points the client at another transactions endpoint.
    #[must_use]
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl PaymentGateway for SnapGateway {
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id))]
    async fn create_session(
        &self,
        request: &SessionRequest,
    ) -> Result<PaymentSession, GatewayError> {
        // Snap takes whole currency units; never bill less than the order total.
        let gross_amount = request.amount.units_rounded_up();
        if request.amount.cents_part() != 0 {
            tracing::warn!(
                total = %request.amount,
                gross_amount,
                "order total has minor units, rounding up for snap"
            );
        }
        let body = serde_json::json!({
            "transaction_details": {
                "order_id": request.order_id.to_string(),
                "gross_amount": gross_amount,
            },
            "customer_details": {
                "first_name": request.customer_name,
                "email": request.customer_email,
                "phone": request.customer_phone,
            },
        });

        let response = self
            .http
            .post(&self.endpoint)
            .basic_auth(&self.server_key, Some(""))
            .header(reqwest::header::ACCEPT, "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = format!("snap request failed with status {status}: {text}");
            return Err(if status.is_client_error() {
                GatewayError::Rejected(message)
            } else {
                GatewayError::Unavailable(message)
            });
        }

        let parsed: SnapResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(format!("unexpected snap response: {e}")))?;

        Ok(PaymentSession {
            token: parsed.token,
            redirect_url: parsed.redirect_url,
        })
    }
}

#[derive(Debug, Deserialize)]
struct SnapResponse {
    token: String,
    redirect_url: String,
}
