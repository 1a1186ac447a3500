//! Payment gateway webhook handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use saas_billing_core::lifecycle::Event;
use saas_billing_core::Actor;

use super::parse_tenant;
use crate::crypto::verify_signature;
use crate::engine::Command;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the hex HMAC-SHA256 of the raw body.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Gateway webhook payload.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayWebhook {
    /// Event type.
    pub event_type: String,
    /// Event time, as sent.
    #[serde(default)]
    pub created_at: Option<String>,
    /// Event data.
    #[serde(default)]
    pub data: serde_json::Value,
}

/// Data of a `BILLING_KEY_DELETED` event.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BillingKeyDeleted {
    customer_key: String,
    #[serde(default)]
    billing_key: Option<String>,
}

/// Webhook response.
#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    /// Whether the webhook was processed.
    pub received: bool,
}

/// Handle payment gateway webhooks.
pub async fn gateway_webhook(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<WebhookResponse>, ApiError> {
    // Verify signature if webhook_secret is configured
    if let Some(secret) = &state.config.gateway_webhook_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::BadRequest("Missing gateway signature".into()))?;

        if !verify_signature(secret, &body, signature) {
            tracing::warn!("Invalid gateway webhook signature");
            return Err(ApiError::BadRequest("Invalid webhook signature".into()));
        }
    } else {
        // No webhook_secret configured - skip verification (development mode)
        tracing::warn!("Gateway webhook_secret not configured - skipping signature verification");
    }

    let webhook: GatewayWebhook =
        serde_json::from_str(&body).map_err(|e| ApiError::BadRequest(e.to_string()))?;

    tracing::info!(event_type = %webhook.event_type, "Received gateway webhook");

    match webhook.event_type.as_str() {
        "BILLING_KEY_DELETED" => handle_billing_key_deleted(&state, webhook.data).await?,
        _ => {
            tracing::debug!(event_type = %webhook.event_type, "Unhandled gateway event");
        }
    }

    Ok(Json(WebhookResponse { received: true }))
}

async fn handle_billing_key_deleted(
    state: &AppState,
    data: serde_json::Value,
) -> Result<(), ApiError> {
    let data: BillingKeyDeleted =
        serde_json::from_value(data).map_err(|e| ApiError::BadRequest(e.to_string()))?;
    let tenant_id = parse_tenant(&data.customer_key)?;

    let Some(subscription) = state.store.get_subscription(&tenant_id)? else {
        tracing::warn!(tenant_id = %tenant_id, "Billing key deleted for unknown tenant");
        return Ok(());
    };
    let Some(billing) = &subscription.billing else {
        tracing::debug!(tenant_id = %tenant_id, "Billing key already removed");
        return Ok(());
    };
    if let Some(deleted) = &data.billing_key {
        if *deleted != billing.token {
            tracing::debug!(tenant_id = %tenant_id, "Deleted billing key is no longer current");
            return Ok(());
        }
    }

    let key = format!("gateway:billing-key-deleted:{}", billing.token);
    let command = Command::new(tenant_id, Event::RevokeCredential, Actor::Gateway)
        .with_idempotency_key(Some(key));

    let outcome = state.engine.execute(command).await?;
    tracing::info!(
        tenant_id = %tenant_id,
        status = %outcome.subscription.status,
        replayed = outcome.replayed,
        "Billing credential revoked"
    );
    Ok(())
}
