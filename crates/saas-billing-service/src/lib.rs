//! saas-billing HTTP API service.
//!
//! This crate hosts the subscription lifecycle engine and exposes it over
//! HTTP:
//!
//! - Subscription start, plan changes, cancellation and payment recovery
//! - Payment ledger and plan history
//! - The daily transition sweep (timer and admin endpoint)
//! - Payment gateway client and webhooks
//!
//! # Authentication
//!
//! 1. **Service API key** (`X-API-Key`) - tenant-facing calls from the product
//! 2. **Admin API key** (`X-Admin-Key`) - operator calls and overrides

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for the router

pub mod auth;
pub mod config;
pub mod crypto;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod routes;
pub mod state;

pub use config::ServiceConfig;
pub use engine::{Command, Engine, EngineConfig, Outcome, SweepReport};
pub use error::ApiError;
pub use gateway::{DisabledGateway, GatewayError, HttpGateway, PaymentGateway};
pub use routes::create_router;
pub use state::AppState;
