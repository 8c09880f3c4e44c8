//! Rebill - A recurring-billing engine
//!
//! Rebill manages charge and payout plans, enrolls customers, generates one
//! invoice per billing cycle, prorates mid-cycle changes, and settles due
//! invoices against an external payment processor with retry backoff. It is
//! the lifecycle core only: bring your own API layer, scheduler, and store.
//!
//! # Features
//!
//! - **Plans**: recurring charge and payout products with calendar intervals
//! - **Subscriptions**: idempotent enrollment, trials, cancellation
//! - **Invoices**: proration, coupon discounts, rollover into the next cycle
//! - **Settlement**: processor-backed collection and sweeps with retry backoff
//! - **Audit**: every processor call leaves a durable transaction row
//! - **Storage**: a trait seam with an in-memory store for tests
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use chrono::Utc;
//! use rebill::{
//!     BillingEngine, Config, InMemoryStore, Interval, MockProcessor, SubscribeOptions,
//! };
//!
//! #[tokio::main]
//! async fn main() -> rebill::Result<()> {
//!     rebill::init_tracing();
//!
//!     let engine = BillingEngine::new(
//!         InMemoryStore::new(),
//!         MockProcessor::new(),
//!         Config::default(),
//!     );
//!
//!     let now = Utc::now();
//!     let plan = engine
//!         .charges()
//!         .create_plan("acme", "starter", "Starter", 1000, Interval::MONTH, None, now)
//!         .await?;
//!     engine
//!         .charges()
//!         .subscribe(plan.id, "cust_1", SubscribeOptions::new(), now)
//!         .await?;
//!
//!     // One scheduler tick.
//!     engine.settle_all_charge_plan_debt(now).await?;
//!     engine.generate_all_invoices(now).await?;
//!     Ok(())
//! }
//! ```

#![allow(async_fn_in_trait)] // PaymentProcessor is consumed through generics only

pub mod charge;
pub mod config;
pub mod coupon;
pub mod engine;
pub mod error;
pub mod interval;
pub mod invoice;
pub mod payout;
pub mod plan;
pub mod processor;
pub mod storage;
pub mod subscription;
pub mod transaction;

// Re-exports for public API
pub use charge::{ChargeLifecycle, SubscribeOptions};
pub use config::{BillingConfig, Config, ConfigBuilder, LoggingConfig};
pub use coupon::{Coupon, CouponEngine, CouponTerms};
pub use engine::BillingEngine;
pub use error::{BillingError, Result};
pub use interval::Interval;
pub use invoice::{ChargeInvoice, PayoutInvoice};
pub use payout::PayoutLifecycle;
pub use plan::{ChargePlan, PayoutPlan};
pub use processor::{MockProcessor, PaymentProcessor, ProcessorCall};
pub use storage::memory::InMemoryStore;
pub use storage::BillingStore;
pub use subscription::{ChargeSubscription, PayoutSubscription};
pub use transaction::{Transaction, TransactionKind, TransactionStatus};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main()
/// before assembling the engine.
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "rebill=debug")
/// - `REBILL_LOG_JSON`: Set to "true" for JSON formatted logs
///
/// # Example
///
/// ```rust,no_run
/// #[tokio::main]
/// async fn main() {
///     rebill::init_tracing();
///     // ... rest of your app
/// }
/// ```
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("REBILL_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// Initialize tracing with a custom configuration
pub fn init_tracing_with_config(config: &Config) {
    let env_filter = EnvFilter::new(&config.logging.level);

    if config.logging.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
