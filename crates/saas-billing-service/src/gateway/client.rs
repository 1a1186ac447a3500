//! HTTP payment gateway client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;

use super::types::{
    BillingChargeRequest, BillingKey, CancelRequest, GatewayErrorResponse, IssueBillingKeyRequest,
    Payment,
};
use super::{ChargeReceipt, ChargeRequest, GatewayError, IssuedToken, PaymentGateway};

/// Client for the payment provider's REST API.
#[derive(Debug, Clone)]
pub struct HttpGateway {
    client: Client,
    base_url: String,
    secret_key: String,
}

impl HttpGateway {
    /// Create a new gateway client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Provider API root, e.g. `https://api.tosspayments.com`
    /// * `secret_key` - Merchant secret key, sent as the basic-auth user
    /// * `timeout` - Per-request timeout
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, GatewayError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| GatewayError::network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<T, GatewayError>
    where
        B: serde::Serialize + Sync,
        T: DeserializeOwned,
    {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .basic_auth(&self.secret_key, Option::<&str>::None)
            .json(body)
            .send()
            .await
            .map_err(transport_error)?;

        Self::handle_response(response).await
    }

    /// Handle API response, parsing errors if present.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, GatewayError> {
        let status = response.status();

        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| GatewayError::new("INVALID_RESPONSE", e.to_string()));
        }

        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<GatewayErrorResponse>(&body) {
            Ok(error) => Err(GatewayError::new(error.code, error.message)),
            Err(_) => Err(GatewayError::new(
                format!("HTTP_{}", status.as_u16()),
                format!("HTTP {status}"),
            )),
        }
    }
}

fn transport_error(err: reqwest::Error) -> GatewayError {
    if err.is_timeout() {
        GatewayError::timeout()
    } else {
        GatewayError::network(err.to_string())
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    async fn issue_billing_token(
        &self,
        auth_code: &str,
        customer_key: &str,
    ) -> Result<IssuedToken, GatewayError> {
        tracing::debug!(customer_key = %customer_key, "Issuing billing key");

        let key: BillingKey = self
            .post(
                "/v1/billing/authorizations/issue",
                &IssueBillingKeyRequest {
                    auth_key: auth_code,
                    customer_key,
                },
            )
            .await?;

        Ok(IssuedToken {
            card_summary: key.card_summary(),
            token: key.billing_key,
        })
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeReceipt, GatewayError> {
        tracing::debug!(
            customer_key = %request.customer_key,
            order_id = %request.order_id,
            amount = request.amount,
            "Charging billing key"
        );

        let payment: Payment = self
            .post(
                &format!("/v1/billing/{}", request.token),
                &BillingChargeRequest {
                    customer_key: &request.customer_key,
                    amount: request.amount,
                    order_id: &request.order_id,
                    order_name: &request.order_name,
                    customer_email: request.customer_email.as_deref(),
                },
            )
            .await?;

        Ok(ChargeReceipt {
            gateway_reference: payment.payment_key,
            status: payment.status,
        })
    }

    async fn refund(
        &self,
        gateway_reference: &str,
        reason: &str,
        amount: i64,
    ) -> Result<(), GatewayError> {
        tracing::debug!(payment_key = %gateway_reference, amount, "Cancelling payment");

        let _: Payment = self
            .post(
                &format!("/v1/payments/{gateway_reference}/cancel"),
                &CancelRequest {
                    cancel_reason: reason,
                    cancel_amount: amount,
                },
            )
            .await?;
        Ok(())
    }
}
