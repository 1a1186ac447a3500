//! saas-billing Client SDK.
//!
//! This crate provides a client library for services that manage tenant
//! subscriptions through the saas-billing API.
//!
//! # Example
//!
//! ```no_run
//! use saas_billing_client::{SaasBillingClient, StartSubscription};
//! use saas_billing_core::{ChangeMode, Plan, TenantId};
//!
//! # async fn example() -> Result<(), saas_billing_client::ClientError> {
//! let client = SaasBillingClient::new(
//!     "http://saas-billing.billing-system.svc:8080",
//!     "your-service-api-key",
//! )?;
//!
//! let tenant = TenantId::generate();
//! let started = client
//!     .start_subscription(
//!         &tenant,
//!         &StartSubscription::new(&Plan::Tier1).with_auth_code("auth-code-from-checkout"),
//!         Some("signup-42"),
//!     )
//!     .await?;
//! println!("next charge on {:?}", started.subscription.next_billing_date);
//!
//! let upgraded = client
//!     .change_plan(&tenant, &Plan::Tier2, ChangeMode::Immediate, Some("upgrade-42"))
//!     .await?;
//! if let Some(proration) = upgraded.proration {
//!     println!("charged {} for the upgrade", proration.net);
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, SaasBillingClient};
pub use error::ClientError;
pub use types::*;
