//! Weight sensors
//!
//! A weight sensor is calibrated once at startup and then sampled on demand.
//! Calibration failures are fatal; a failed sample is transient and the
//! checkout observes it as weight 0.

mod iio;
mod replay;

pub use iio::IioScale;
pub use replay::ReplayScale;

use crate::error::{CalibrationError, SensorError};
use crate::types::Grams;

/// Trait for load cells
pub trait WeightSensor {
    /// Tare the scale. Must succeed before any [`sample`](Self::sample).
    fn calibrate(&mut self) -> Result<(), CalibrationError>;

    /// Read the current weight in grams
    fn sample(&mut self) -> Result<Grams, SensorError>;

    /// Sample, mapping a failed read to weight 0
    fn sample_or_zero(&mut self) -> Grams {
        match self.sample() {
            Ok(grams) => {
                tracing::debug!(grams, "weight sampled");
                grams
            }
            Err(e) => {
                tracing::warn!("Error reading weight: {e}");
                0
            }
        }
    }
}

impl<S: WeightSensor + ?Sized> WeightSensor for Box<S> {
    fn calibrate(&mut self) -> Result<(), CalibrationError> {
        (**self).calibrate()
    }

    fn sample(&mut self) -> Result<Grams, SensorError> {
        (**self).sample()
    }
}
