//! Parsing of runner output into frames
//!
//! Handles both the live line-by-line stream and recorded NDJSON files.

use crate::error::SourceError;
use crate::schema::frame::*;

/// A recorded runner session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameLog {
    /// Model description, when the recording contains one
    pub model: Option<ModelInfo>,
    pub frames: Vec<ClassificationFrame>,
}

impl FrameLog {
    /// Labels in model order, or the union of all frame labels sorted when
    /// the recording carries no model description
    pub fn labels(&self) -> Vec<String> {
        if let Some(model) = &self.model {
            return model.labels().to_vec();
        }

        let mut labels: Vec<String> = self
            .frames
            .iter()
            .filter_map(ClassificationFrame::scores)
            .flat_map(|scores| scores.keys().cloned())
            .collect();
        labels.sort();
        labels.dedup();
        labels
    }
}

/// Adapter for turning runner output into typed messages
pub struct FrameAdapter;

impl FrameAdapter {
    /// Parse one line of runner output. Blank lines yield `None`.
    pub fn parse_line(line: &str) -> Result<Option<RunnerMessage>, SourceError> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| SourceError::Parse(e.to_string()))
    }

    /// Parse a JSON array of frames
    pub fn parse_array(json: &str) -> Result<Vec<ClassificationFrame>, SourceError> {
        let frames: Vec<ClassificationFrame> = serde_json::from_str(json)?;
        Ok(frames)
    }

    /// Parse NDJSON runner output. A model description may appear once,
    /// before any frame.
    pub fn parse_ndjson(ndjson: &str) -> Result<FrameLog, SourceError> {
        let mut log = FrameLog::default();

        for (line_num, line) in ndjson.lines().enumerate() {
            let message = Self::parse_line(line).map_err(|e| {
                SourceError::Parse(format!("Failed to parse line {}: {}", line_num + 1, e))
            })?;

            match message {
                None => continue,
                Some(RunnerMessage::Model(info)) => {
                    if log.model.is_some() || !log.frames.is_empty() {
                        return Err(SourceError::Parse(format!(
                            "Unexpected model description on line {}",
                            line_num + 1
                        )));
                    }
                    log.model = Some(info);
                }
                Some(RunnerMessage::Frame(frame)) => log.frames.push(frame),
            }
        }

        Ok(log)
    }

    /// Validate a batch of frames, returning only the failures
    pub fn validate_frames(frames: &[ClassificationFrame]) -> Vec<ValidationResult> {
        frames
            .iter()
            .enumerate()
            .filter_map(|(index, frame)| {
                frame
                    .validate()
                    .err()
                    .map(|error| ValidationResult { index, error })
            })
            .collect()
    }
}

/// A frame that failed validation
#[derive(Debug, Clone)]
pub struct ValidationResult {
    pub index: usize,
    pub error: ValidationError,
}
