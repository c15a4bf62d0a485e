//! Pricing
//!
//! Maps a finished session onto the fixed product catalog and stamps it with
//! the next ledger id.

use crate::error::PricingError;
use crate::types::{BillingRecord, SessionRecord, UnknownLabelPolicy, BILLING_UNITS};

/// How an item's payable amount is derived
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Rate {
    /// `final_weight * per_gram`
    PerGram(f64),
    /// Fixed amount, weight ignored
    Flat(f64),
}

/// Catalog entry
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Product {
    pub label: &'static str,
    pub price: f64,
    pub rate: Rate,
}

impl Product {
    pub fn payable(&self, final_weight: i64) -> f64 {
        match self.rate {
            Rate::PerGram(per_gram) => final_weight as f64 * per_gram,
            Rate::Flat(amount) => amount,
        }
    }
}

/// Built-in catalog, matched case-sensitively
pub static CATALOG: [Product; 4] = [
    Product {
        label: "Apple",
        price: 10.0,
        rate: Rate::PerGram(0.01),
    },
    Product {
        label: "Banana",
        price: 20.0,
        rate: Rate::PerGram(0.02),
    },
    Product {
        label: "Lays",
        price: 1.0,
        rate: Rate::Flat(1.0),
    },
    Product {
        label: "Coke",
        price: 2.0,
        rate: Rate::Flat(2.0),
    },
];

/// Position of the entry billed for labels missing from [`CATALOG`]
const FALLBACK_INDEX: usize = 3;

/// Look up a label in the catalog
pub fn lookup(label: &str) -> Option<&'static Product> {
    CATALOG.iter().find(|product| product.label == label)
}

/// Pricing engine holding the ledger id counter
#[derive(Debug, Clone)]
pub struct PricingEngine {
    next_id: u64,
    policy: UnknownLabelPolicy,
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self::new(UnknownLabelPolicy::default())
    }
}

impl PricingEngine {
    pub fn new(policy: UnknownLabelPolicy) -> Self {
        Self { next_id: 1, policy }
    }

    /// Start numbering at `first_id` instead of 1
    pub fn starting_at(first_id: u64, policy: UnknownLabelPolicy) -> Self {
        Self {
            next_id: first_id.max(1),
            policy,
        }
    }

    /// Id the next priced session will receive
    pub fn next_id(&self) -> u64 {
        self.next_id
    }

    /// Price a finished session and advance the id counter.
    ///
    /// Never fails under [`UnknownLabelPolicy::Fallback`].
    pub fn price(&mut self, record: &SessionRecord) -> Result<BillingRecord, PricingError> {
        let product = match (lookup(&record.label), self.policy) {
            (Some(product), _) => product,
            (None, UnknownLabelPolicy::Fallback) => {
                tracing::warn!(label = %record.label, "label not in catalog, using fallback price");
                &CATALOG[FALLBACK_INDEX]
            }
            (None, UnknownLabelPolicy::Reject) => {
                return Err(PricingError::UnknownLabel(record.label.clone()));
            }
        };

        let billing = BillingRecord {
            id: self.next_id,
            name: record.label.clone(),
            price: product.price,
            units: BILLING_UNITS.to_string(),
            taken: record.taken_count,
            payable: product.payable(record.final_weight),
        };
        self.next_id += 1;

        tracing::info!(
            id = billing.id,
            name = %billing.name,
            payable = billing.payable,
            "calculated rate"
        );
        Ok(billing)
    }
}
