//! Classifier runner wire format
//!
//! This module defines the line-delimited JSON messages a classifier runner
//! produces and the adapter that parses live and recorded output.

mod adapter;
mod frame;

pub use adapter::*;
pub use frame::*;
