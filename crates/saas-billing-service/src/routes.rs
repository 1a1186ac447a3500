//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post, put};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{admin, health, subscriptions, webhooks};
use crate::state::AppState;

/// Maximum concurrent requests for API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Tenant subscription (service key or admin key)
/// - `POST /v1/tenants/:tenant_id/subscription` - Start a subscription
/// - `GET /v1/tenants/:tenant_id/subscription` - Current subscription
/// - `POST /v1/tenants/:tenant_id/subscription/plan` - Change plan
/// - `POST /v1/tenants/:tenant_id/subscription/cancel` - Cancel
/// - `POST /v1/tenants/:tenant_id/subscription/reactivate` - Withdraw cancellation
/// - `POST /v1/tenants/:tenant_id/subscription/retry` - Retry a failed payment
/// - `POST /v1/tenants/:tenant_id/subscription/convert` - Convert a trial
/// - `GET /v1/tenants/:tenant_id/subscription/history` - Plan history
/// - `POST /v1/tenants/:tenant_id/billing-token` - Register a card
/// - `GET /v1/tenants/:tenant_id/payments` - Payment ledger
///
/// ## Admin (admin key)
/// - `PUT /v1/admin/tenants/:tenant_id/period` - Correct the billing period
/// - `POST /v1/admin/sweep` - Run the daily sweep now
/// - `GET /v1/admin/reconciliation` - Unrecorded payments
/// - `POST /v1/admin/reconciliation/:key/resolve` - Close an unrecorded payment
///
/// ## Webhooks (signature verification)
/// - `POST /webhooks/gateway` - Payment gateway notifications
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    let tenant_routes = Router::new()
        .route(
            "/subscription",
            post(subscriptions::start_subscription).get(subscriptions::get_subscription),
        )
        .route("/subscription/plan", post(subscriptions::change_plan))
        .route("/subscription/cancel", post(subscriptions::cancel_subscription))
        .route(
            "/subscription/reactivate",
            post(subscriptions::reactivate_subscription),
        )
        .route("/subscription/retry", post(subscriptions::retry_payment))
        .route("/subscription/convert", post(subscriptions::convert_trial))
        .route("/subscription/history", get(subscriptions::get_history))
        .route("/billing-token", post(subscriptions::register_billing_token))
        .route("/payments", get(subscriptions::list_payments));

    let admin_routes = Router::new()
        .route("/tenants/:tenant_id/period", put(admin::correct_period))
        .route("/sweep", post(admin::run_sweep))
        .route("/reconciliation", get(admin::list_reconciliation))
        .route(
            "/reconciliation/:key/resolve",
            post(admin::resolve_reconciliation),
        );

    let api_routes = Router::new()
        .nest("/tenants/:tenant_id", tenant_routes)
        .nest("/admin", admin_routes)
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        // Webhooks (no rate limit - controlled by the gateway)
        .route("/webhooks/gateway", post(webhooks::gateway_webhook))
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
