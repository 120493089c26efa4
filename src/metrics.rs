//! Per-module performance accounting.

use metrics::{counter, histogram, Unit};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

/// Whether metric descriptions have been registered.
static METRICS_INITIALIZED: AtomicBool = AtomicBool::new(false);

const FRAMES_PROCESSED: &str = "millrace_frames_processed";
const FRAMES_DROPPED: &str = "millrace_frames_dropped";
const PROCESS_TIME_NS: &str = "millrace_process_time_ns";

/// Register metric descriptions with the installed recorder.
///
/// Call once at application startup. Safe to call multiple times.
pub fn init_metrics() {
    if METRICS_INITIALIZED.swap(true, Ordering::SeqCst) {
        return;
    }
    metrics::describe_counter!(
        FRAMES_PROCESSED,
        Unit::Count,
        "Frames successfully processed per module"
    );
    metrics::describe_counter!(
        FRAMES_DROPPED,
        Unit::Count,
        "Frames dropped after a processing error per module"
    );
    metrics::describe_histogram!(
        PROCESS_TIME_NS,
        Unit::Nanoseconds,
        "Time spent in a module's process call"
    );
}

/// Record a successfully processed frame.
#[inline]
pub(crate) fn record_frame_processed(pipeline: &str, module: &str) {
    counter!(FRAMES_PROCESSED, "pipeline" => pipeline.to_string(), "module" => module.to_string())
        .increment(1);
}

/// Record a frame dropped after a processing error.
#[inline]
pub(crate) fn record_frame_dropped(pipeline: &str, module: &str) {
    counter!(FRAMES_DROPPED, "pipeline" => pipeline.to_string(), "module" => module.to_string())
        .increment(1);
}

/// Record the duration of one process call.
#[inline]
pub(crate) fn record_process_time(pipeline: &str, module: &str, duration: Duration) {
    histogram!(PROCESS_TIME_NS, "pipeline" => pipeline.to_string(), "module" => module.to_string())
        .record(duration.as_nanos() as f64);
}

/// Running average of per-frame processing cost, with fps derivation.
///
/// Workers record one dot per processed frame (or one per batch with the
/// batch size as the step); timers from multiple workers can be merged
/// with [`mix`](Self::mix) for a per-module view.
#[derive(Debug, Clone, Default)]
pub struct ProcTimer {
    last: Option<Instant>,
    count: u64,
    avg_ms: f64,
}

impl ProcTimer {
    /// Create an empty timer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `step` frames completed now, costing the time elapsed since
    /// the previous dot. The first dot only arms the timer.
    pub fn dot(&mut self, step: u32) {
        let now = Instant::now();
        if let Some(last) = self.last {
            self.dot_ms(now.duration_since(last).as_secs_f64() * 1e3, step);
        }
        self.last = Some(now);
    }

    /// Record `step` frames completed at an explicitly measured cost.
    pub fn dot_ms(&mut self, ms: f64, step: u32) {
        if step == 0 {
            return;
        }
        let step = step as u64;
        self.avg_ms = (self.avg_ms * self.count as f64 + ms) / (self.count + step) as f64;
        self.count += step;
    }

    /// Average cost per frame in milliseconds.
    pub fn avg_ms(&self) -> f64 {
        self.avg_ms
    }

    /// Number of frames recorded.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Throughput in frames per second implied by the average cost.
    pub fn fps(&self) -> f64 {
        if self.avg_ms > 0.0 {
            1e3 / self.avg_ms
        } else {
            0.0
        }
    }

    /// Merge another timer's record into this one.
    pub fn mix(&mut self, other: &ProcTimer) {
        let total = self.count + other.count;
        if total == 0 {
            return;
        }
        self.avg_ms = (self.avg_ms * self.count as f64 + other.avg_ms * other.count as f64)
            / total as f64;
        self.count = total;
    }

    /// Forget everything recorded so far.
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Log the timer under `head`.
    pub fn print_fps(&self, head: &str) {
        info!(
            target: "millrace::perf",
            frames = self.count,
            avg_ms = format!("{:.3}", self.avg_ms),
            fps = format!("{:.1}", self.fps()),
            "{head}"
        );
    }
}
