//! Recorded weight readings
//!
//! Plays back a list of readings, one per `sample` call. Used for offline
//! replays of recorded sessions.

use super::WeightSensor;
use crate::error::{CalibrationError, SensorError};
use crate::types::Grams;
use std::collections::VecDeque;
use std::path::Path;

/// Scale that returns pre-recorded readings in order
#[derive(Debug, Clone, Default)]
pub struct ReplayScale {
    readings: VecDeque<Result<Grams, String>>,
    calibrated: bool,
}

impl ReplayScale {
    pub fn from_readings<I: IntoIterator<Item = Grams>>(readings: I) -> Self {
        Self {
            readings: readings.into_iter().map(Ok).collect(),
            calibrated: false,
        }
    }

    /// Parse one reading per line. Blank lines and `#` comments are skipped;
    /// anything else that is not an integer replays as a failed read.
    pub fn parse(text: &str) -> Self {
        let readings = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(|line| line.parse::<Grams>().map_err(|_| line.to_string()))
            .collect();
        Self {
            readings,
            calibrated: false,
        }
    }

    pub fn from_file(path: &Path) -> std::io::Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Readings not yet played back
    pub fn remaining(&self) -> usize {
        self.readings.len()
    }
}

impl WeightSensor for ReplayScale {
    fn calibrate(&mut self) -> Result<(), CalibrationError> {
        self.calibrated = true;
        Ok(())
    }

    fn sample(&mut self) -> Result<Grams, SensorError> {
        if !self.calibrated {
            return Err(SensorError::NotCalibrated);
        }
        match self.readings.pop_front() {
            Some(Ok(grams)) => Ok(grams),
            Some(Err(raw)) => Err(SensorError::Malformed(raw)),
            None => Err(SensorError::Exhausted),
        }
    }
}
