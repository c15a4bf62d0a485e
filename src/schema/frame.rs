//! Classifier runner message definitions
//!
//! The classifier runner writes one JSON message per line:
//! - a model description first (project and label catalog)
//! - then one classification frame per processed camera image
//!
//! Frames without a `classification` map (object detection output, for
//! instance) are valid but carry nothing for the checkout.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Project metadata announced by the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectInfo {
    pub owner: String,
    pub name: String,
}

/// Model parameters announced by the runner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelParameters {
    /// Label catalog in model order
    pub labels: Vec<String>,
}

/// First message of a runner session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub project: ProjectInfo,
    pub model_parameters: ModelParameters,
}

impl ModelInfo {
    pub fn labels(&self) -> &[String] {
        &self.model_parameters.labels
    }
}

/// Per-frame inference timing, milliseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameTiming {
    #[serde(default)]
    pub dsp: u64,
    #[serde(default)]
    pub classification: u64,
}

impl FrameTiming {
    pub fn total_ms(&self) -> u64 {
        self.dsp + self.classification
    }
}

/// Inference output of one frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FrameResult {
    /// Confidence per label, 0 to 1
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<BTreeMap<String, f64>>,
}

/// One classifier frame
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClassificationFrame {
    pub result: FrameResult,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timing: Option<FrameTiming>,
}

impl ClassificationFrame {
    /// Build a classification frame from (label, score) pairs
    pub fn from_scores<I, S>(scores: I) -> Self
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        Self {
            result: FrameResult {
                classification: Some(
                    scores
                        .into_iter()
                        .map(|(label, score)| (label.into(), score))
                        .collect(),
                ),
            },
            timing: None,
        }
    }

    /// Confidence map, if this frame carries classification output
    pub fn scores(&self) -> Option<&BTreeMap<String, f64>> {
        self.result.classification.as_ref()
    }

    pub fn score(&self, label: &str) -> Option<f64> {
        self.scores().and_then(|scores| scores.get(label).copied())
    }

    /// Validate the frame contents
    pub fn validate(&self) -> Result<(), ValidationError> {
        let Some(scores) = self.scores() else {
            return Ok(());
        };

        for (label, score) in scores {
            if label.trim().is_empty() {
                return Err(ValidationError::EmptyLabel);
            }
            if !(0.0..=1.0).contains(score) {
                return Err(ValidationError::ScoreOutOfRange {
                    label: label.clone(),
                    score: *score,
                });
            }
        }

        Ok(())
    }
}

/// Any message the runner can emit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunnerMessage {
    Model(ModelInfo),
    Frame(ClassificationFrame),
}

/// Validation errors for classifier frames
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("Frame contains an empty label")]
    EmptyLabel,

    #[error("Score for {label:?} is outside [0, 1]: {score}")]
    ScoreOutOfRange { label: String, score: f64 },
}
