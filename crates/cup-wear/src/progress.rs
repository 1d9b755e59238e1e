//! Progress reporting for long-running analysis.
//!
//! Every stage of the pipeline reports [`ProgressEvent`]s through a
//! [`ProgressReporter`]. The event's `fraction` is overall progress across
//! the whole analysis: each stage owns a fixed band of `[0, 1]` (see
//! [`stage_band`]) and the geodesic stage subdivides its band per meridian.
//!
//! Three reporters are provided:
//! - [`NoOpProgressReporter`] for blocking callers that ignore progress
//! - [`CallbackProgressReporter`] wrapping a closure
//! - [`ChannelProgressReporter`] forwarding events over an `mpsc` channel,
//!   consumed as a blocking iterator by background jobs
//!
//! # Example
//!
//! ```
//! use cup_wear::progress::{progress_channel, ProgressReporter, ProgressEvent};
//! use cup_wear::PipelineStage;
//!
//! let (reporter, events) = progress_channel();
//! reporter.report(&ProgressEvent::within(PipelineStage::SphereFit, 1.0, "fitted"));
//! drop(reporter);
//!
//! let all: Vec<_> = events.iter().collect();
//! assert_eq!(all.len(), 1);
//! assert_eq!(all[0].stage, PipelineStage::SphereFit);
//! ```

use std::sync::mpsc::{self, Receiver, Sender};
use std::time::Instant;

use tracing::trace;

use crate::pipeline::PipelineStage;

/// One progress update.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    /// Stage that is currently running.
    pub stage: PipelineStage,

    /// Overall progress in `[0, 1]`.
    pub fraction: f64,

    /// Human-readable message.
    pub message: String,
}

impl ProgressEvent {
    /// Create an event with an overall fraction.
    pub fn new(stage: PipelineStage, fraction: f64, message: impl Into<String>) -> Self {
        Self {
            stage,
            fraction: fraction.clamp(0.0, 1.0),
            message: message.into(),
        }
    }

    /// Create an event from progress within a stage, mapped into the stage's band.
    pub fn within(stage: PipelineStage, local_fraction: f64, message: impl Into<String>) -> Self {
        let (start, end) = stage_band(stage);
        let local = if local_fraction.is_finite() {
            local_fraction.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self::new(stage, start + (end - start) * local, message)
    }

    /// Overall progress as a percentage (0 to 100).
    #[inline]
    pub fn percent(&self) -> u32 {
        (self.fraction * 100.0).round() as u32
    }

    /// Check if this event marks the end of the analysis.
    #[inline]
    pub fn is_complete(&self) -> bool {
        self.fraction >= 1.0
    }
}

/// The slice of overall progress owned by a stage.
pub fn stage_band(stage: PipelineStage) -> (f64, f64) {
    match stage {
        PipelineStage::Idle => (0.0, 0.0),
        PipelineStage::Separated => (0.0, 0.10),
        PipelineStage::Trimmed => (0.10, 0.15),
        PipelineStage::SphereFit => (0.15, 0.25),
        PipelineStage::EllipsoidFit => (0.25, 0.30),
        PipelineStage::GraphBuilt => (0.30, 0.35),
        PipelineStage::GeodesicsComputed => (0.35, 0.85),
        PipelineStage::DeviationsAnalyzed => (0.85, 0.92),
        PipelineStage::VolumesComputed => (0.92, 1.0),
    }
}

/// Trait for operations that can report progress.
pub trait ProgressReporter {
    /// Report a progress update.
    fn report(&self, event: &ProgressEvent);
}

/// A no-op progress reporter that does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpProgressReporter;

impl ProgressReporter for NoOpProgressReporter {
    #[inline]
    fn report(&self, _event: &ProgressEvent) {}
}

/// Callback function for progress reporting.
pub type ProgressCallback = Box<dyn Fn(&ProgressEvent) + Send + Sync>;

/// A progress reporter that calls a callback.
pub struct CallbackProgressReporter<'a> {
    callback: &'a ProgressCallback,
    start_time: Instant,
}

impl<'a> CallbackProgressReporter<'a> {
    /// Create a new callback reporter.
    pub fn new(callback: &'a ProgressCallback) -> Self {
        Self {
            callback,
            start_time: Instant::now(),
        }
    }
}

impl ProgressReporter for CallbackProgressReporter<'_> {
    fn report(&self, event: &ProgressEvent) {
        trace!(
            target: "cup_wear::progress",
            stage = %event.stage,
            percent = event.percent(),
            elapsed_ms = format!("{:.1}", self.start_time.elapsed().as_secs_f64() * 1000.0),
            "{}",
            event.message
        );
        (self.callback)(event);
    }
}

/// A progress reporter that forwards events into a channel.
///
/// Send failures are ignored: a consumer that dropped its receiver simply
/// stops receiving updates, the work itself continues.
#[derive(Debug, Clone)]
pub struct ChannelProgressReporter {
    sender: Sender<ProgressEvent>,
}

impl ChannelProgressReporter {
    /// Wrap an existing sender.
    pub fn new(sender: Sender<ProgressEvent>) -> Self {
        Self { sender }
    }
}

impl ProgressReporter for ChannelProgressReporter {
    fn report(&self, event: &ProgressEvent) {
        trace!(
            target: "cup_wear::progress",
            stage = %event.stage,
            percent = event.percent(),
            "{}",
            event.message
        );
        let _ = self.sender.send(event.clone());
    }
}

/// Create a channel reporter and the receiving end of its events.
///
/// The receiver's `iter()` blocks until the next event and ends once every
/// reporter clone has been dropped.
pub fn progress_channel() -> (ChannelProgressReporter, Receiver<ProgressEvent>) {
    let (sender, receiver) = mpsc::channel();
    (ChannelProgressReporter::new(sender), receiver)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    const STAGES: [PipelineStage; 8] = [
        PipelineStage::Separated,
        PipelineStage::Trimmed,
        PipelineStage::SphereFit,
        PipelineStage::EllipsoidFit,
        PipelineStage::GraphBuilt,
        PipelineStage::GeodesicsComputed,
        PipelineStage::DeviationsAnalyzed,
        PipelineStage::VolumesComputed,
    ];

    #[test]
    fn test_bands_tile_unit_interval() {
        let mut previous_end = 0.0;
        for stage in STAGES {
            let (start, end) = stage_band(stage);
            assert!((start - previous_end).abs() < 1e-12, "gap before {}", stage);
            assert!(end > start);
            previous_end = end;
        }
        assert!((previous_end - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_event_within_band() {
        let e = ProgressEvent::within(PipelineStage::GeodesicsComputed, 0.5, "half");
        assert!((e.fraction - 0.6).abs() < 1e-12);
        assert_eq!(e.percent(), 60);

        let clamped = ProgressEvent::within(PipelineStage::Trimmed, 7.0, "over");
        assert!((clamped.fraction - 0.15).abs() < 1e-12);

        let nan = ProgressEvent::within(PipelineStage::Trimmed, f64::NAN, "nan");
        assert!((nan.fraction - 0.10).abs() < 1e-12);
    }

    #[test]
    fn test_final_event_is_complete() {
        let e = ProgressEvent::within(PipelineStage::VolumesComputed, 1.0, "done");
        assert!(e.is_complete());
        assert!(!ProgressEvent::within(PipelineStage::SphereFit, 1.0, "fit").is_complete());
    }

    #[test]
    fn test_noop_progress_reporter() {
        let reporter = NoOpProgressReporter;
        reporter.report(&ProgressEvent::new(PipelineStage::Separated, 0.5, "test"));
    }

    #[test]
    fn test_callback_progress_reporter() {
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let callback: ProgressCallback = Box::new(move |_e| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        });

        let reporter = CallbackProgressReporter::new(&callback);
        reporter.report(&ProgressEvent::new(PipelineStage::Separated, 0.1, "a"));
        reporter.report(&ProgressEvent::new(PipelineStage::Trimmed, 0.2, "b"));

        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_channel_reporter_closes_with_sender() {
        let (reporter, events) = progress_channel();
        let clone = reporter.clone();
        reporter.report(&ProgressEvent::new(PipelineStage::Separated, 0.1, "a"));
        clone.report(&ProgressEvent::new(PipelineStage::Trimmed, 0.2, "b"));
        drop(reporter);
        drop(clone);

        let messages: Vec<String> = events.iter().map(|e| e.message).collect();
        assert_eq!(messages, vec!["a", "b"]);
    }

    #[test]
    fn test_channel_reporter_survives_dropped_receiver() {
        let (reporter, events) = progress_channel();
        drop(events);
        reporter.report(&ProgressEvent::new(PipelineStage::Separated, 0.1, "ignored"));
    }
}
