//! Authentication extractors.
//!
//! This module provides extractors for:
//! - `Caller` - Tenant-facing routes; accepts the service key or the admin key
//! - `AdminAuth` - Operator-only endpoints

use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use saas_billing_core::Actor;

use crate::crypto::constant_time_eq;
use crate::error::ApiError;
use crate::state::AppState;

/// Header carrying the service API key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Header carrying the admin API key.
pub const ADMIN_KEY_HEADER: &str = "x-admin-key";

fn header<'a>(parts: &'a Parts, name: &str) -> Option<&'a str> {
    parts.headers.get(name).and_then(|v| v.to_str().ok())
}

fn key_matches(presented: &str, expected: Option<&String>) -> bool {
    expected.is_some_and(|expected| constant_time_eq(presented, expected))
}

/// The authenticated caller of a tenant route.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Tenant for the service key, admin for the admin key.
    pub actor: Actor,
    /// Service name or admin identifier, for audit logging.
    pub name: String,
}

impl Caller {
    /// Whether the caller holds the admin key.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.actor == Actor::Admin
    }
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        if header(parts, ADMIN_KEY_HEADER).is_some() {
            let admin = AdminAuth::from_request_parts(parts, state).await?;
            return Ok(Self {
                actor: Actor::Admin,
                name: admin.admin_id,
            });
        }

        let api_key = header(parts, API_KEY_HEADER).ok_or(ApiError::Unauthorized)?;
        if !key_matches(api_key, state.config.service_api_key.as_ref()) {
            return Err(ApiError::Unauthorized);
        }

        // Extract service name from header if provided
        let name = header(parts, "x-service-name")
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            actor: Actor::Tenant,
            name,
        })
    }
}

/// Admin authentication via the `X-Admin-Key` header.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

#[async_trait]
impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let admin_key = header(parts, ADMIN_KEY_HEADER).ok_or(ApiError::Unauthorized)?;
        if !key_matches(admin_key, state.config.admin_api_key.as_ref()) {
            return Err(ApiError::Unauthorized);
        }

        let admin_id = header(parts, "x-admin-id").unwrap_or("admin").to_string();

        tracing::info!(admin_id = %admin_id, "Admin authenticated");
        Ok(Self { admin_id })
    }
}
