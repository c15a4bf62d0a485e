//! Checkout orchestration
//!
//! This module provides the public API for Autobill.
//! It wires classifier frames through the confidence gate, the weight sensor,
//! the session tracker and the pricing engine, and hands finished records to
//! the billing queue.

use crate::billing::{BillingQueue, DispatchReport};
use crate::config::Config;
use crate::error::{CalibrationError, CheckoutError};
use crate::pricing::PricingEngine;
use crate::scale::WeightSensor;
use crate::schema::ClassificationFrame;
use crate::source::ClassifierSource;
use crate::tracker::SessionTracker;
use crate::types::{BillingRecord, Observation};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;
use uuid::Uuid;

/// Selects the labels a frame is confident about
#[derive(Debug, Clone)]
pub struct ConfidenceGate {
    threshold: f64,
    labels: Vec<String>,
}

impl ConfidenceGate {
    /// `labels` fixes the dispatch order; when empty, labels are taken from
    /// each frame in sorted order.
    pub fn new(threshold: f64, labels: Vec<String>) -> Self {
        Self { threshold, labels }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Labels scoring strictly above the threshold
    pub fn accepted(&self, frame: &ClassificationFrame) -> Vec<String> {
        let Some(scores) = frame.scores() else {
            return Vec::new();
        };

        if self.labels.is_empty() {
            return scores
                .iter()
                .filter(|(_, score)| **score > self.threshold)
                .map(|(label, _)| label.clone())
                .collect();
        }

        self.labels
            .iter()
            .filter(|label| scores.get(label.as_str()).is_some_and(|s| *s > self.threshold))
            .cloned()
            .collect()
    }
}

/// What one frame produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FrameOutcome {
    pub observations: Vec<Observation>,
    pub records: Vec<BillingRecord>,
}

/// Synchronous per-frame checkout step.
///
/// Owns the scale, tracker and pricing engine; nothing else mutates them.
pub struct CheckoutProcessor<S> {
    gate: ConfidenceGate,
    scale: S,
    tracker: SessionTracker,
    pricing: PricingEngine,
}

impl<S: WeightSensor> CheckoutProcessor<S> {
    /// Build from configuration. `model_labels` is used for dispatch order
    /// unless the configuration lists labels explicitly.
    pub fn new(config: &Config, model_labels: Vec<String>, scale: S) -> Self {
        let labels = if config.classifier.labels.is_empty() {
            model_labels
        } else {
            config.classifier.labels.clone()
        };

        Self::with_parts(
            ConfidenceGate::new(config.classifier.threshold, labels),
            scale,
            SessionTracker::new(config.tracker.history),
            PricingEngine::starting_at(config.pricing.first_id, config.pricing.unknown_label),
        )
    }

    pub fn with_parts(
        gate: ConfidenceGate,
        scale: S,
        tracker: SessionTracker,
        pricing: PricingEngine,
    ) -> Self {
        Self {
            gate,
            scale,
            tracker,
            pricing,
        }
    }

    /// Tare the scale. Must be called once before the first frame.
    pub fn calibrate(&mut self) -> Result<(), CalibrationError> {
        self.scale.calibrate()
    }

    /// Run one frame through the checkout.
    ///
    /// Every confident label samples the scale once and is observed in turn,
    /// so one frame can close more than one session.
    pub fn process_frame(&mut self, frame: &ClassificationFrame) -> FrameOutcome {
        if let Some(timing) = frame.timing {
            tracing::debug!("Result ({} ms.)", timing.total_ms());
        }

        let mut outcome = FrameOutcome::default();
        for label in self.gate.accepted(frame) {
            let weight = self.scale.sample_or_zero();
            tracing::info!(weight, "{label} detected");

            let observation = Observation::new(label, weight);
            if let Some(record) = self.process_observation(&observation) {
                outcome.records.push(record);
            }
            outcome.observations.push(observation);
        }
        outcome
    }

    /// Feed one observation to the tracker and price any session it closes
    pub fn process_observation(&mut self, observation: &Observation) -> Option<BillingRecord> {
        let session = self.tracker.observe(observation)?;
        match self.pricing.price(&session) {
            Ok(record) => {
                tracing::info!(
                    id = record.id,
                    name = %record.name,
                    payable = record.payable,
                    "session priced"
                );
                Some(record)
            }
            Err(e) => {
                tracing::warn!("session not billed: {e}");
                None
            }
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn pricing(&self) -> &PricingEngine {
        &self.pricing
    }

    pub fn gate(&self) -> &ConfidenceGate {
        &self.gate
    }

    /// Give the scale back, e.g. to inspect a replay
    pub fn into_scale(self) -> S {
        self.scale
    }
}

/// Enforces the minimum spacing between processed frames.
///
/// The deadline is set after a frame is processed, so the interval is
/// measured from the end of one step to the start of the next.
#[derive(Debug, Clone)]
pub struct FramePacer {
    interval: Duration,
    next_frame: Option<Instant>,
}

impl FramePacer {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            next_frame: None,
        }
    }

    /// Time left before the next frame may be processed
    pub fn remaining(&self, now: Instant) -> Duration {
        self.next_frame
            .map(|deadline| deadline.saturating_duration_since(now))
            .unwrap_or(Duration::ZERO)
    }

    pub async fn wait(&self) {
        if let Some(deadline) = self.next_frame {
            tokio::time::sleep_until(deadline).await;
        }
    }

    /// Record that a frame finished processing at `now`
    pub fn mark(&mut self, now: Instant) {
        self.next_frame = Some(now + self.interval);
    }
}

/// Why the checkout loop stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    SourceEnded,
}

/// Outcome of one checkout run
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub frames: u64,
    pub observations: u64,
    pub sessions: u64,
    pub stopped_by: StopReason,
    /// Observations of the unfinished session dropped at shutdown
    pub open_session_observations: usize,
    pub billing: DispatchReport,
}

#[derive(Debug, Default)]
struct LoopCounters {
    frames: u64,
    observations: u64,
    sessions: u64,
}

/// Drive the checkout until `cancel` fires or the source runs dry.
///
/// Each frame step runs on a blocking worker. On every exit path the source
/// is stopped, queued billing records are drained and the scale is dropped.
/// An unfinished session is discarded, never billed.
pub async fn run_checkout<S>(
    checkout: CheckoutProcessor<S>,
    mut source: ClassifierSource,
    billing: BillingQueue,
    interval: Duration,
    cancel: CancellationToken,
) -> Result<RunSummary, CheckoutError>
where
    S: WeightSensor + Send + 'static,
{
    let run_id = Uuid::new_v4();
    let span = tracing::info_span!("checkout", %run_id);

    async move {
        let started_at = Utc::now();
        let mut counters = LoopCounters::default();
        tracing::info!("checkout started");

        let result = drive(
            checkout,
            &mut source,
            &billing,
            FramePacer::new(interval),
            &cancel,
            &mut counters,
        )
        .await;

        match source.stop().await {
            Ok(forwarded) => tracing::debug!(forwarded, "frame source stopped"),
            Err(e) => tracing::warn!("frame source ended with an error: {e}"),
        }
        let billing_report = billing.finish().await;
        let (checkout, stopped_by) = result?;

        let open_session_observations = checkout.tracker().state().observation_count;
        if open_session_observations > 0 {
            tracing::info!(
                observations = open_session_observations,
                "discarding unfinished session"
            );
        }
        drop(checkout);

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            frames: counters.frames,
            observations: counters.observations,
            sessions: counters.sessions,
            stopped_by,
            open_session_observations,
            billing: billing_report,
        };
        tracing::info!(
            frames = summary.frames,
            sessions = summary.sessions,
            delivered = summary.billing.delivered,
            failed = summary.billing.failed,
            "checkout finished"
        );
        Ok(summary)
    }
    .instrument(span)
    .await
}

async fn drive<S>(
    mut checkout: CheckoutProcessor<S>,
    source: &mut ClassifierSource,
    billing: &BillingQueue,
    mut pacer: FramePacer,
    cancel: &CancellationToken,
    counters: &mut LoopCounters,
) -> Result<(CheckoutProcessor<S>, StopReason), CheckoutError>
where
    S: WeightSensor + Send + 'static,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok((checkout, StopReason::Cancelled)),
            frame = source.next_frame() => match frame {
                Some(frame) => frame,
                None => return Ok((checkout, StopReason::SourceEnded)),
            },
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok((checkout, StopReason::Cancelled)),
            _ = pacer.wait() => {}
        }

        let (returned, outcome) = tokio::task::spawn_blocking(move || {
            let outcome = checkout.process_frame(&frame);
            (checkout, outcome)
        })
        .await
        .map_err(|e| CheckoutError::Worker(e.to_string()))?;
        checkout = returned;
        pacer.mark(Instant::now());

        counters.frames += 1;
        counters.observations += outcome.observations.len() as u64;
        for record in outcome.records {
            counters.sessions += 1;
            billing.enqueue(record).await;
        }
    }
}
