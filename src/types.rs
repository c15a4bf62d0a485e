//! Core types for the Autobill pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! checkout: observations fed to the tracker, finalized sessions handed to the
//! pricing engine, and the billing records posted to the ledger.

use serde::{Deserialize, Serialize};

/// Integer weight in grams. `0` means the scale had no usable reading.
pub type Grams = i64;

/// Readings at or below this many grams are treated as sensor noise
pub const NOISE_FLOOR_GRAMS: Grams = 2;

/// Unit string carried by every billing record
pub const BILLING_UNITS: &str = "units";

/// One (label, weight) sample presented to the session tracker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub label: String,
    pub weight: Grams,
}

impl Observation {
    pub fn new(label: impl Into<String>, weight: Grams) -> Self {
        Self {
            label: label.into(),
            weight,
        }
    }

    /// Whether the weight clears the noise floor and should be recorded
    pub fn has_stable_weight(&self) -> bool {
        self.weight > NOISE_FLOOR_GRAMS
    }
}

/// Snapshot of a finished item session, consumed once by the pricing engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Label of the item that was on the scale
    pub label: String,
    /// Weight attributed to the item when the session closed
    pub final_weight: Grams,
    /// Rising-weight count accumulated during the session
    pub taken_count: u32,
}

/// Priced record submitted to the billing ledger
///
/// Field names are the ledger's wire names.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingRecord {
    /// Monotonic id, starting at 1
    pub id: u64,
    /// Item label
    pub name: String,
    /// Catalog unit price
    pub price: f64,
    /// Always "units"
    pub units: String,
    /// Taken count from the session
    pub taken: u32,
    /// Amount owed for this session
    pub payable: f64,
}

/// How the tracker keeps label and weight histories
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryMode {
    /// One optional reading per observation; every label change closes a run
    #[default]
    Aligned,
    /// Separate label and weight histories that can drift apart when
    /// readings fall under the noise floor
    Legacy,
}

/// What the pricing engine does with a label missing from the catalog
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnknownLabelPolicy {
    /// Bill it with the flat "Coke" price
    #[default]
    Fallback,
    /// Drop the session without consuming an id
    Reject,
}
