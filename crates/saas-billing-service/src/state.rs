//! Application state.

use std::sync::Arc;
use std::time::Duration;

use saas_billing_core::BillingError;
use saas_billing_store::Store;

use crate::config::ServiceConfig;
use crate::engine::Engine;
use crate::gateway::{DisabledGateway, HttpGateway, PaymentGateway};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The storage backend.
    pub store: Arc<dyn Store>,

    /// The lifecycle engine.
    pub engine: Arc<Engine>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state, building the gateway client from
    /// the configuration.
    ///
    /// # Errors
    ///
    /// `Configuration` if the plan catalog is invalid.
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Result<Self, BillingError> {
        let gateway: Arc<dyn PaymentGateway> = match &config.gateway_secret_key {
            Some(secret) => match HttpGateway::new(
                &config.gateway_api_url,
                secret,
                Duration::from_secs(config.gateway_timeout_seconds),
            ) {
                Ok(client) => {
                    tracing::info!(gateway_url = %config.gateway_api_url, "Payment gateway enabled");
                    Arc::new(client)
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to create payment gateway client");
                    Arc::new(DisabledGateway)
                }
            },
            None => {
                tracing::warn!("Payment gateway not configured - charges will be declined");
                Arc::new(DisabledGateway)
            }
        };

        Self::with_gateway(store, gateway, config)
    }

    /// Create a new application state around an existing gateway.
    ///
    /// # Errors
    ///
    /// `Configuration` if the plan catalog is invalid.
    pub fn with_gateway(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        config: ServiceConfig,
    ) -> Result<Self, BillingError> {
        let catalog = Arc::new(config.plan_catalog()?);
        let engine = Arc::new(Engine::new(
            Arc::clone(&store),
            gateway,
            catalog,
            config.engine_config(),
        ));

        Ok(Self {
            store,
            engine,
            config,
        })
    }

    /// Check if webhook signatures are verified.
    #[must_use]
    pub fn verifies_webhooks(&self) -> bool {
        self.config.gateway_webhook_secret.is_some()
    }
}
