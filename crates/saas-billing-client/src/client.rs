//! saas-billing HTTP client implementation.

use std::time::Duration;

use chrono::NaiveDate;
use reqwest::{Client, RequestBuilder, Url};
use saas_billing_core::{CancelMode, ChangeMode, ChargeIntent, HistoryRecord, Plan, TenantId};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::ClientError;
use crate::types::{
    ApiErrorResponse, BillingTokenBody, CancelBody, ChangePlanBody, CommandResponse,
    CorrectPeriodBody, HealthResponse, PaymentPage, PlanSelector, ReconciliationList, ResolveBody,
    StartSubscription, SubscriptionView, SweepReport,
};

const IDEMPOTENCY_KEY_HEADER: &str = "idempotency-key";

#[derive(Debug, Clone)]
enum Credentials {
    Service { api_key: String },
    Admin { admin_key: String, admin_id: String },
}

/// saas-billing API client.
///
/// Tenant-facing services use [`SaasBillingClient::new`] with the service
/// key. Operator tooling uses [`SaasBillingClient::admin`], which can also
/// call the admin endpoints.
///
/// Every mutating call takes an optional idempotency key. Reusing a key
/// returns the first result instead of charging again.
#[derive(Debug, Clone)]
pub struct SaasBillingClient {
    client: Client,
    base_url: String,
    credentials: Credentials,
    service_name: String,
}

impl SaasBillingClient {
    /// Create a client authenticating with the service API key.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the billing service (e.g., `"http://saas-billing:8080"`)
    /// * `api_key` - Service API key for authentication
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self, ClientError> {
        Self::with_options(base_url, api_key, ClientOptions::default())
    }

    /// Create a service client with custom options.
    pub fn with_options(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        Self::build(
            base_url.into(),
            Credentials::Service {
                api_key: api_key.into(),
            },
            options,
        )
    }

    /// Create a client authenticating with the admin key.
    ///
    /// `admin_id` is recorded by the service in audit logs and history notes.
    pub fn admin(
        base_url: impl Into<String>,
        admin_key: impl Into<String>,
        admin_id: impl Into<String>,
    ) -> Result<Self, ClientError> {
        Self::build(
            base_url.into(),
            Credentials::Admin {
                admin_key: admin_key.into(),
                admin_id: admin_id.into(),
            },
            ClientOptions::default(),
        )
    }

    fn build(
        base_url: String,
        credentials: Credentials,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(options.timeout_seconds))
            .build()
            .map_err(|e| ClientError::Configuration(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            service_name: options.service_name,
        })
    }

    // ========================================================================
    // Subscription
    // ========================================================================

    /// Start a subscription for a tenant.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn start_subscription(
        &self,
        tenant_id: &TenantId,
        request: &StartSubscription,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription");
        self.send(self.post(&path, idempotency_key).json(request))
            .await
    }

    /// Get a tenant's subscription.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotFound`] if the tenant has no subscription.
    pub async fn get_subscription(
        &self,
        tenant_id: &TenantId,
    ) -> Result<SubscriptionView, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription");
        self.send(self.get(&path)).await
    }

    /// Change plan, now or at the next renewal.
    ///
    /// Custom plans need a client built with [`SaasBillingClient::admin`].
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn change_plan(
        &self,
        tenant_id: &TenantId,
        plan: &Plan,
        mode: ChangeMode,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/plan");
        let body = ChangePlanBody {
            plan: plan.into(),
            mode,
        };
        self.send(self.post(&path, idempotency_key).json(&body))
            .await
    }

    /// Cancel a subscription.
    ///
    /// `refund` only applies to immediate cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn cancel(
        &self,
        tenant_id: &TenantId,
        mode: CancelMode,
        reason: Option<&str>,
        refund: bool,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/cancel");
        let body = CancelBody {
            mode,
            reason,
            refund,
        };
        self.send(self.post(&path, idempotency_key).json(&body))
            .await
    }

    /// Withdraw a scheduled cancellation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn reactivate(
        &self,
        tenant_id: &TenantId,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/reactivate");
        self.send(self.post(&path, idempotency_key)).await
    }

    /// Retry a failed payment.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn retry_payment(
        &self,
        tenant_id: &TenantId,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/retry");
        self.send(self.post(&path, idempotency_key)).await
    }

    /// Convert a trial now, optionally onto a different plan than the one scheduled.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn convert_trial(
        &self,
        tenant_id: &TenantId,
        plan: Option<&Plan>,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/convert");
        let request = self.post(&path, idempotency_key);
        let request = match plan {
            Some(plan) => request.json(&PlanSelector::from(plan)),
            None => request,
        };
        self.send(request).await
    }

    /// Register or replace the card on file.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn register_billing_token(
        &self,
        tenant_id: &TenantId,
        auth_code: &str,
        customer_email: Option<&str>,
        idempotency_key: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/billing-token");
        let body = BillingTokenBody {
            auth_code,
            customer_email,
        };
        self.send(self.post(&path, idempotency_key).json(&body))
            .await
    }

    /// Plan history, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn history(&self, tenant_id: &TenantId) -> Result<Vec<HistoryRecord>, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/subscription/history");
        self.send(self.get(&path)).await
    }

    /// One page of the payment ledger, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn payments(
        &self,
        tenant_id: &TenantId,
        limit: usize,
        offset: usize,
    ) -> Result<PaymentPage, ClientError> {
        let path = format!("/v1/tenants/{tenant_id}/payments");
        self.send(
            self.get(&path)
                .query(&[("limit", limit), ("offset", offset)]),
        )
        .await
    }

    // ========================================================================
    // Admin
    // ========================================================================

    /// Correct the current billing period. Admin key only.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn correct_period(
        &self,
        tenant_id: &TenantId,
        period_start: NaiveDate,
        period_end: NaiveDate,
        note: Option<&str>,
    ) -> Result<CommandResponse, ClientError> {
        let path = format!("/v1/admin/tenants/{tenant_id}/period");
        let body = CorrectPeriodBody {
            period_start,
            period_end,
            note,
        };
        self.send(self.authorize(self.client.put(self.url(&path))).json(&body))
            .await
    }

    /// Run the daily sweep now. Admin key only.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn run_sweep(&self) -> Result<SweepReport, ClientError> {
        self.send(self.post("/v1/admin/sweep", None)).await
    }

    /// Captured payments that were never recorded. Admin key only.
    ///
    /// With `include_pending`, intents whose gateway outcome is unknown are listed too.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn reconciliation(
        &self,
        include_pending: bool,
    ) -> Result<Vec<ChargeIntent>, ClientError> {
        let list: ReconciliationList = self
            .send(
                self.get("/v1/admin/reconciliation")
                    .query(&[("include_pending", include_pending)]),
            )
            .await?;
        Ok(list.intents)
    }

    /// Close an open charge intent, refunding the payment first if asked. Admin key only.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the server returns an error.
    pub async fn resolve_reconciliation(
        &self,
        key: &str,
        refund: bool,
    ) -> Result<ChargeIntent, ClientError> {
        let mut url = Url::parse(&self.base_url)
            .map_err(|e| ClientError::Configuration(format!("invalid base url: {e}")))?;
        url.path_segments_mut()
            .map_err(|()| ClientError::Configuration("base url cannot carry a path".into()))?
            .pop_if_empty()
            .extend(["v1", "admin", "reconciliation", key, "resolve"]);

        let request = self
            .authorize(self.client.post(url))
            .json(&ResolveBody { refund });
        self.send(request).await
    }

    /// Service health.
    ///
    /// # Errors
    ///
    /// Returns an error if the service is unreachable.
    pub async fn health(&self) -> Result<HealthResponse, ClientError> {
        self.send(self.client.get(self.url("/health"))).await
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header("x-service-name", &self.service_name);
        match &self.credentials {
            Credentials::Service { api_key } => request.header("x-api-key", api_key),
            Credentials::Admin {
                admin_key,
                admin_id,
            } => request
                .header("x-admin-key", admin_key)
                .header("x-admin-id", admin_id),
        }
    }

    fn get(&self, path: &str) -> RequestBuilder {
        self.authorize(self.client.get(self.url(path)))
    }

    fn post(&self, path: &str, idempotency_key: Option<&str>) -> RequestBuilder {
        let request = self.authorize(self.client.post(self.url(path)));
        match idempotency_key {
            Some(key) => request.header(IDEMPOTENCY_KEY_HEADER, key),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// Handle API response and convert errors.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ClientError> {
        let status = response.status();

        if status.is_success() {
            return Ok(response.json().await?);
        }

        let error_body: Result<ApiErrorResponse, _> = response.json().await;

        let Ok(api_error) = error_body else {
            return Err(ClientError::Api {
                code: "unknown".to_string(),
                message: format!("HTTP {status}"),
                status: status.as_u16(),
            });
        };

        let detail = |name: &str| {
            api_error
                .error
                .details
                .as_ref()
                .and_then(|d| d.get(name))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let message = api_error.error.message.clone();

        tracing::debug!(
            status = status.as_u16(),
            code = %api_error.error.code,
            "Billing service returned an error"
        );

        // Map specific error codes to typed errors
        match api_error.error.code.as_str() {
            "invalid_transition" => Err(ClientError::InvalidTransition {
                status: detail("status"),
                message,
            }),
            "gateway_error" => Err(ClientError::PaymentFailed {
                code: detail("code"),
                message,
            }),
            "reconciliation_required" => Err(ClientError::ReconciliationRequired {
                order_id: detail("order_id"),
            }),
            "conflict" => Err(ClientError::Conflict(message)),
            "not_found" => Err(ClientError::NotFound(message)),
            "unauthorized" | "forbidden" => Err(ClientError::Unauthorized(message)),
            code => Err(ClientError::Api {
                code: code.to_string(),
                message,
                status: status.as_u16(),
            }),
        }
    }
}

/// Client options for customization.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Request timeout in seconds (default: 30).
    pub timeout_seconds: u64,
    /// Service name to include in requests.
    pub service_name: String,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            service_name: "unknown".to_string(),
        }
    }
}

impl ClientOptions {
    /// Create options with a service name.
    #[must_use]
    pub fn with_service_name(name: impl Into<String>) -> Self {
        Self {
            service_name: name.into(),
            ..Self::default()
        }
    }
}
