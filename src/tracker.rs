//! Item session tracking
//!
//! This module turns a stream of accepted (label, weight) observations into
//! discrete item sessions. A session is a run of consecutive observations
//! sharing one label; it closes when the label changes, at which point the
//! tracker hands back a [`SessionRecord`] and starts over from empty.

use crate::types::{Grams, HistoryMode, Observation, SessionRecord};
use serde::Serialize;

/// Mutable state of the run currently on the scale
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SessionState {
    /// Label of the item believed to be on the scale
    pub current_label: Option<String>,
    /// Observations accumulated in this run
    pub observation_count: usize,
    /// Every label observed in this run, in order
    pub label_history: Vec<String>,
    /// Every weight above the noise floor, in order
    pub weight_history: Vec<Grams>,
    /// One entry per observation; `None` where the reading was noise
    pub readings: Vec<Option<Grams>>,
    /// Observations whose weight rose above the previous recorded weight
    pub taken_count: u32,
}

impl SessionState {
    pub fn is_empty(&self) -> bool {
        self.observation_count == 0
    }
}

/// Session tracker owning the single active session
#[derive(Debug, Clone, Default)]
pub struct SessionTracker {
    state: SessionState,
    mode: HistoryMode,
}

impl SessionTracker {
    pub fn new(mode: HistoryMode) -> Self {
        Self {
            state: SessionState::default(),
            mode,
        }
    }

    pub fn mode(&self) -> HistoryMode {
        self.mode
    }

    /// Current run, for inspection
    pub fn state(&self) -> &SessionState {
        &self.state
    }

    /// Feed one observation; returns the finished session when this
    /// observation reveals a label change.
    pub fn observe(&mut self, observation: &Observation) -> Option<SessionRecord> {
        let state = &mut self.state;

        let reading = if observation.has_stable_weight() {
            if state.observation_count > 0 {
                if let Some(&previous) = state.weight_history.last() {
                    if observation.weight > previous {
                        state.taken_count += 1;
                    }
                }
            }
            state.weight_history.push(observation.weight);
            Some(observation.weight)
        } else {
            None
        };

        state.label_history.push(observation.label.clone());
        state.readings.push(reading);
        state.observation_count += 1;
        state.current_label = Some(observation.label.clone());
        tracing::debug!(
            label = %observation.label,
            weight = observation.weight,
            count = state.observation_count,
            "observation recorded"
        );

        if self.mode == HistoryMode::Aligned
            && self.label_changed()
            && self.last_reading_before_boundary().is_none()
        {
            // Nothing was ever on the scale for the closing run
            tracing::debug!(label = %observation.label, "weightless run discarded");
            self.reset();
            return self.observe(observation);
        }

        let record = match self.mode {
            HistoryMode::Aligned => self.aligned_boundary(),
            HistoryMode::Legacy => self.legacy_boundary(),
        };

        if let Some(record) = &record {
            tracing::info!(
                label = %record.label,
                final_weight = record.final_weight,
                taken = record.taken_count,
                "new item detected, session closed"
            );
            self.reset();
        }

        record
    }

    /// Shorthand for [`observe`](Self::observe) with a borrowed label
    pub fn observe_reading(&mut self, label: &str, weight: Grams) -> Option<SessionRecord> {
        self.observe(&Observation::new(label, weight))
    }

    /// Drop the current run without emitting anything
    pub fn reset(&mut self) {
        self.state = SessionState::default();
    }

    /// Label change between the two newest observations
    fn label_changed(&self) -> bool {
        let labels = &self.state.label_history;
        self.state.observation_count > 1
            && labels.len() >= 2
            && labels[labels.len() - 1] != labels[labels.len() - 2]
    }

    /// Newest recorded weight of the run, excluding the newest observation
    fn last_reading_before_boundary(&self) -> Option<Grams> {
        let readings = &self.state.readings;
        readings
            .split_last()
            .and_then(|(_, earlier)| earlier.iter().rev().find_map(|reading| *reading))
    }

    fn aligned_boundary(&self) -> Option<SessionRecord> {
        if !self.label_changed() {
            return None;
        }

        let labels = &self.state.label_history;
        let final_weight = self.last_reading_before_boundary()?;

        Some(SessionRecord {
            label: labels[labels.len() - 2].clone(),
            final_weight,
            taken_count: self.state.taken_count,
        })
    }

    fn legacy_boundary(&self) -> Option<SessionRecord> {
        let weights = &self.state.weight_history;
        if weights.len() < 2 || !self.label_changed() {
            return None;
        }

        let labels = &self.state.label_history;
        Some(SessionRecord {
            label: labels[labels.len() - 2].clone(),
            final_weight: weights[weights.len() - 2],
            taken_count: self.state.taken_count,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn feed(tracker: &mut SessionTracker, observations: &[(&str, Grams)]) -> Vec<SessionRecord> {
        observations
            .iter()
            .filter_map(|(label, weight)| tracker.observe_reading(label, *weight))
            .collect()
    }

    fn record(label: &str, final_weight: Grams, taken_count: u32) -> SessionRecord {
        SessionRecord {
            label: label.to_string(),
            final_weight,
            taken_count,
        }
    }

    #[test]
    fn test_label_change_closes_session() {
        for mode in [HistoryMode::Aligned, HistoryMode::Legacy] {
            let mut tracker = SessionTracker::new(mode);
            let records = feed(&mut tracker, &[("Apple", 5), ("Apple", 8), ("Banana", 3)]);
            assert_eq!(records, vec![record("Apple", 8, 1)]);
        }
    }

    #[test]
    fn test_single_unterminated_run_emits_nothing() {
        for mode in [HistoryMode::Aligned, HistoryMode::Legacy] {
            let mut tracker = SessionTracker::new(mode);
            assert!(feed(&mut tracker, &[("Lays", 1)]).is_empty());
            assert!(feed(&mut tracker, &[("Lays", 40), ("Lays", 41), ("Lays", 39)]).is_empty());
            assert_eq!(tracker.state().observation_count, 4);
        }
    }

    #[test]
    fn test_reset_after_boundary() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        feed(&mut tracker, &[("Apple", 5), ("Apple", 8)]);
        assert_eq!(tracker.state().current_label.as_deref(), Some("Apple"));

        let closed = tracker.observe_reading("Banana", 3);
        assert!(closed.is_some());
        assert_eq!(tracker.state(), &SessionState::default());
        assert!(tracker.state().is_empty());

        // The next observation starts a fresh run
        assert!(tracker.observe_reading("Banana", 120).is_none());
        assert_eq!(tracker.state().observation_count, 1);
        assert_eq!(tracker.state().taken_count, 0);
        assert_eq!(tracker.state().weight_history, vec![120]);
    }

    #[test]
    fn test_noise_floor_samples_counted_but_not_recorded() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        feed(&mut tracker, &[("Apple", 5), ("Apple", 0), ("Apple", 2), ("Apple", 1)]);

        let state = tracker.state();
        assert_eq!(state.observation_count, 4);
        assert_eq!(state.weight_history, vec![5]);
        assert_eq!(state.readings, vec![Some(5), None, None, None]);
        assert_eq!(state.taken_count, 0);
    }

    #[test]
    fn test_zero_sample_keeps_taken_progression() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        feed(&mut tracker, &[("Apple", 5), ("Apple", 0), ("Apple", 8)]);

        let state = tracker.state();
        assert_eq!(state.weight_history, vec![5, 8]);
        assert_eq!(state.taken_count, 1);
    }

    #[test]
    fn test_taken_count_only_on_strict_rise() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        let mut seen = Vec::new();
        for weight in [50, 50, 49, 60, 61, 61, 10, 70] {
            tracker.observe_reading("Banana", weight);
            seen.push(tracker.state().taken_count);
        }
        assert_eq!(seen, vec![0, 0, 0, 1, 2, 2, 2, 3]);
    }

    #[test]
    fn test_one_record_per_terminated_run() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        let records = feed(
            &mut tracker,
            &[
                ("Apple", 100),
                ("Apple", 120),
                ("Coke", 350), // closes Apple, consumed by the reset
                ("Coke", 355),
                ("Coke", 356),
                ("Lays", 30), // closes Coke
                ("Lays", 31),
                ("Lays", 32),
            ],
        );

        // The closing Coke reading rose above 120 before the boundary fired
        assert_eq!(records, vec![record("Apple", 120, 2), record("Coke", 356, 1)]);
        assert_eq!(tracker.state().observation_count, 2);
    }

    #[test]
    fn test_weightless_run_is_never_billed() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        assert!(feed(&mut tracker, &[("Lays", 1), ("Coke", 1)]).is_empty());
        assert!(feed(&mut tracker, &[("Apple", 0), ("Banana", 0)]).is_empty());

        // The label change starts a fresh run from the new observation
        let state = tracker.state();
        assert_eq!(state.observation_count, 1);
        assert_eq!(state.label_history, vec!["Banana"]);
        assert_eq!(state.readings, vec![None]);
    }

    #[test]
    fn test_flicker_before_item_keeps_item_reading() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        let records = feed(
            &mut tracker,
            &[("Lays", 0), ("Coke", 40), ("Coke", 45), ("Apple", 10)],
        );
        assert_eq!(records, vec![record("Coke", 45, 1)]);
    }

    #[test]
    fn test_legacy_needs_two_recorded_weights() {
        let mut tracker = SessionTracker::new(HistoryMode::Legacy);
        let records = feed(&mut tracker, &[("Lays", 1), ("Coke", 1)]);
        assert!(records.is_empty());
        // Run keeps growing across the missed label change
        assert_eq!(tracker.state().label_history, vec!["Lays", "Coke"]);
        assert_eq!(tracker.state().observation_count, 2);
    }

    #[test]
    fn test_legacy_final_weight_drifts_with_noise() {
        // The boundary reading is noise, so the second-to-last recorded
        // weight is the run's first reading rather than its last.
        let mut legacy = SessionTracker::new(HistoryMode::Legacy);
        let records = feed(&mut legacy, &[("Apple", 5), ("Apple", 8), ("Banana", 0)]);
        assert_eq!(records, vec![record("Apple", 5, 1)]);

        let mut aligned = SessionTracker::new(HistoryMode::Aligned);
        let records = feed(&mut aligned, &[("Apple", 5), ("Apple", 8), ("Banana", 0)]);
        assert_eq!(records, vec![record("Apple", 8, 1)]);
    }

    #[test]
    fn test_first_observation_never_counts_as_taken() {
        let mut tracker = SessionTracker::new(HistoryMode::Aligned);
        tracker.observe_reading("Apple", 900);
        assert_eq!(tracker.state().taken_count, 0);
        assert_eq!(tracker.state().current_label.as_deref(), Some("Apple"));
    }
}
