//! HX711 load cell behind the Linux IIO subsystem
//!
//! The kernel's hx711 driver exposes the 24-bit ADC as a sysfs attribute
//! (`in_voltage0_raw`). Reading the attribute triggers one conversion.

use super::WeightSensor;
use crate::config::ScaleConfig;
use crate::error::{CalibrationError, SensorError};
use crate::types::Grams;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Load cell read through a sysfs raw channel
#[derive(Debug)]
pub struct IioScale {
    device: PathBuf,
    ratio: f64,
    samples: usize,
    tare_samples: usize,
    settle: Duration,
    offset: Option<f64>,
}

impl IioScale {
    pub fn new(config: &ScaleConfig) -> Self {
        Self {
            device: config.device.clone(),
            ratio: config.ratio,
            samples: config.samples.max(1),
            tare_samples: config.tare_samples.max(1),
            settle: Duration::from_millis(config.settle_ms),
            offset: None,
        }
    }

    pub fn device(&self) -> &Path {
        &self.device
    }

    pub fn is_calibrated(&self) -> bool {
        self.offset.is_some()
    }

    fn read_raw(&self) -> Result<i64, SensorError> {
        let text = fs::read_to_string(&self.device)?;
        let trimmed = text.trim();
        trimmed
            .parse::<i64>()
            .map_err(|_| SensorError::Malformed(trimmed.to_string()))
    }

    /// Average of the usable reads among `count` attempts
    fn read_mean(&self, count: usize) -> (Option<f64>, usize) {
        let mut sum = 0.0;
        let mut valid = 0;
        for _ in 0..count {
            match self.read_raw() {
                Ok(raw) => {
                    sum += raw as f64;
                    valid += 1;
                }
                Err(e) => tracing::trace!("discarding raw read: {e}"),
            }
        }
        let mean = (valid > 0).then(|| sum / valid as f64);
        (mean, valid)
    }
}

impl WeightSensor for IioScale {
    fn calibrate(&mut self) -> Result<(), CalibrationError> {
        tracing::info!(device = %self.device.display(), "Calibration starts");
        if !self.device.exists() {
            return Err(CalibrationError::DeviceAbsent(self.device.clone()));
        }
        // Surface permission problems as I/O errors rather than a bad tare
        fs::File::open(&self.device)?;

        let (mean, valid) = self.read_mean(self.tare_samples);
        match mean {
            Some(offset) if valid * 2 >= self.tare_samples => {
                self.offset = Some(offset);
                tracing::info!(offset, ratio = self.ratio, "Calibration ends");
                Ok(())
            }
            _ => Err(CalibrationError::TareFailed {
                valid,
                wanted: self.tare_samples,
            }),
        }
    }

    fn sample(&mut self) -> Result<Grams, SensorError> {
        let offset = self.offset.ok_or(SensorError::NotCalibrated)?;
        if !self.settle.is_zero() {
            std::thread::sleep(self.settle);
        }

        let (mean, _) = self.read_mean(self.samples);
        match mean {
            Some(mean) => Ok(((mean - offset) / self.ratio) as Grams),
            // Every attempt failed; one more read reports why
            None => self.read_raw().and(Err(SensorError::Malformed(
                "no usable raw reads".to_string(),
            ))),
        }
    }
}

impl Drop for IioScale {
    fn drop(&mut self) {
        tracing::debug!(device = %self.device.display(), "scale released");
    }
}
