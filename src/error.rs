//! Error types for Autobill
//!
//! Errors are split by the boundary they cross. Startup errors abort the
//! process, sensor and billing errors are logged and the loop carries on.

use std::path::PathBuf;
use thiserror::Error;

/// Load-cell calibration failures. Always fatal at startup.
#[derive(Debug, Error)]
pub enum CalibrationError {
    #[error("Scale device not found: {0}")]
    DeviceAbsent(PathBuf),

    #[error("Tare is unsuccessful: {valid} of {wanted} raw reads were usable")]
    TareFailed { valid: usize, wanted: usize },

    #[error("Scale I/O error during calibration: {0}")]
    Io(#[from] std::io::Error),
}

/// A single bad weight sample. Transient: observed as weight 0.
#[derive(Debug, Error)]
pub enum SensorError {
    #[error("Scale sampled before calibration")]
    NotCalibrated,

    #[error("Scale read failed: {0}")]
    Read(#[from] std::io::Error),

    #[error("Malformed scale reading: {0}")]
    Malformed(String),

    #[error("Replay has no readings left")]
    Exhausted,
}

/// Classifier runner and frame stream failures
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to start classifier runner `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Error initializing model: {0}")]
    ModelLoad(String),

    #[error("Failed to parse frame: {0}")]
    Parse(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Frame source I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration loading failures
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Cannot read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Fatal checkout errors. Everything except `Worker` happens before the
/// first frame is processed.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("Model file not found: {0}")]
    ModelNotFound(PathBuf),

    #[error("Cannot find any webcams")]
    NoCamera,

    #[error("Multiple cameras found ({0:?}); pass the camera index explicitly")]
    AmbiguousCamera(Vec<u32>),

    #[error(transparent)]
    Calibration(#[from] CalibrationError),

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Billing(#[from] BillingError),

    #[error("Checkout worker failed: {0}")]
    Worker(String),
}

/// Billing submission failures. Logged, never retried.
#[derive(Debug, Error)]
pub enum BillingError {
    #[error("Failed to build HTTP client: {0}")]
    Client(String),

    #[error("Error posting to server: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Server rejected record {id} with status {status}: {body}")]
    Status { id: u64, status: u16, body: String },

    #[error("Failed to write record: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Pricing failures. Only produced under the `reject` unknown-label policy.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PricingError {
    #[error("No catalog entry for label {0:?}")]
    UnknownLabel(String),
}
