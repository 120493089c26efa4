//! A sink that discards all bundles.

use crate::error::Result;
use crate::frame::Bundle;
use crate::module::{Module, Output, ParamMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A sink that counts and discards every bundle it receives.
///
/// Useful for benchmarking pipeline throughput, testing upstream modules,
/// and draining a graph without side effects.
pub struct NullSink {
    name: String,
    count: AtomicU64,
}

impl NullSink {
    /// Create a sink named `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: AtomicU64::new(0),
        }
    }

    /// Number of bundles consumed so far.
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Acquire)
    }
}

impl Module for NullSink {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, _params: &ParamMap) -> bool {
        true
    }

    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        self.count.fetch_add(1, Ordering::AcqRel);
        Ok(Output::Discard)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::{StreamRegistry, VideoFrame};
    use crate::frame::PixelFormat;

    #[test]
    fn counts_consumed_bundles() {
        let sink = NullSink::new("sink");
        let registry = Arc::new(StreamRegistry::new());
        for i in 0..3 {
            let frame = VideoFrame::new("cam0", i, PixelFormat::Bgr24, 2, 2);
            let bundle = Bundle::create(&registry, frame).unwrap();
            sink.process(&bundle).unwrap();
        }
        assert_eq!(sink.count(), 3);
    }
}
