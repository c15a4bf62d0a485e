//! Autobill - Weight-assisted automatic checkout
//!
//! Autobill turns image classifier output and load-cell readings into billing
//! records through a deterministic pipeline: confidence gate → weight sample
//! → session tracking → pricing → billing ledger.
//!
//! ## Modules
//!
//! - **Checkout Pipeline**: per-frame processing and the async checkout loop
//! - **Devices**: load cell adapters and camera discovery
//! - **Ledger**: in-order submission of billing records

pub mod billing;
pub mod camera;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod pricing;
pub mod scale;
pub mod schema;
pub mod source;
pub mod tracker;
pub mod types;

pub use billing::{BillingQueue, BillingSink, DispatchReport, HttpBillingSink, JsonLinesSink};
pub use config::Config;
pub use error::{
    BillingError, CalibrationError, CheckoutError, ConfigError, PricingError, SensorError,
    SourceError,
};
pub use pipeline::{run_checkout, CheckoutProcessor, ConfidenceGate, FramePacer, RunSummary};
pub use pricing::PricingEngine;
pub use scale::{IioScale, ReplayScale, WeightSensor};
pub use source::ClassifierSource;
pub use tracker::SessionTracker;
pub use types::{BillingRecord, Observation, SessionRecord};

/// Autobill version, sent in the ledger user agent
pub const AUTOBILL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by the CLI
pub const PRODUCER_NAME: &str = "autobill";
