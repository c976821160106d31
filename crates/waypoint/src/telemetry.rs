//! Duration telemetry for checkpoint operations.
//!
//! Every [`CheckpointTracker`](crate::checkpoint::CheckpointTracker) commit and
//! restore reports how long it took to a [`TelemetrySink`]. The sink is the
//! seam to whatever metrics backend the host application uses.
//!
//! | Sink | Use case |
//! |------|----------|
//! | [`NoopTelemetry`] | Tests or hosts without metrics |
//! | [`TracingTelemetry`] | Emit each sample as a `tracing` event (the default) |
//! | [`RecordingTelemetry`] | Keep samples in memory for inspection |
//! | [`CompositeTelemetry`] | Fan out to several sinks in order |
//! | Custom `impl TelemetrySink` | Forward to a metrics exporter |

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

/// The checkpoint operation a sample was taken for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointOperation {
    Commit,
    Restore,
}

impl std::fmt::Display for CheckpointOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CheckpointOperation::Commit => write!(f, "commit"),
            CheckpointOperation::Restore => write!(f, "restore"),
        }
    }
}

/// One timed checkpoint operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationSample {
    pub operation: CheckpointOperation,
    pub task_id: String,
    pub duration: Duration,
    /// Whether the operation succeeded.
    pub ok: bool,
}

/// Receives duration samples from the checkpoint tracker.
///
/// Called after the operation finishes, success or failure. Implementations
/// must not block for long: the call happens while the per-task lock is held.
pub trait TelemetrySink: Send + Sync {
    fn record_duration(&self, sample: &DurationSample);
}

/// A sink that discards every sample.
pub struct NoopTelemetry;
impl TelemetrySink for NoopTelemetry {
    fn record_duration(&self, _sample: &DurationSample) {}
}

/// Logs each sample through `tracing`. Failures log at `info`, successes at
/// `debug`.
pub struct TracingTelemetry;

impl TelemetrySink for TracingTelemetry {
    fn record_duration(&self, sample: &DurationSample) {
        if sample.ok {
            debug!(
                task_id = %sample.task_id,
                "checkpoint {} took {:.1}ms",
                sample.operation,
                sample.duration.as_secs_f64() * 1000.0,
            );
        } else {
            info!(
                task_id = %sample.task_id,
                "checkpoint {} failed after {:.1}ms",
                sample.operation,
                sample.duration.as_secs_f64() * 1000.0,
            );
        }
    }
}

/// Keeps every sample in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct RecordingTelemetry {
    samples: Arc<Mutex<Vec<DurationSample>>>,
}

impl RecordingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all samples recorded so far.
    pub fn samples(&self) -> Vec<DurationSample> {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Number of samples recorded for `operation`.
    pub fn count(&self, operation: CheckpointOperation) -> usize {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|s| s.operation == operation)
            .count()
    }
}

impl TelemetrySink for RecordingTelemetry {
    fn record_duration(&self, sample: &DurationSample) {
        self.samples
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(sample.clone());
    }
}

/// Dispatches each sample to several sinks in registration order.
///
/// ```ignore
/// let sink = CompositeTelemetry::new()
///     .with(TracingTelemetry)
///     .with(my_exporter);
/// ```
#[derive(Default)]
pub struct CompositeTelemetry {
    sinks: Vec<Box<dyn TelemetrySink>>,
}

impl CompositeTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl TelemetrySink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl TelemetrySink for CompositeTelemetry {
    fn record_duration(&self, sample: &DurationSample) {
        for sink in &self.sinks {
            sink.record_duration(sample);
        }
    }
}
