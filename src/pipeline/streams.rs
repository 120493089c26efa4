//! Per-stream EOS completion records.
//!
//! EOS sentinels drive a stream-scoped bitset protocol: each module's
//! record accumulates which upstream edges have delivered EOS; a module
//! completes when its expected upstream set is covered, and the stream
//! completes when every sink module has recorded EOS. The tracker is
//! pipeline-owned, keyed by stream id.

use std::collections::HashMap;
use std::sync::Mutex;
use tracing::trace;

struct StreamEos {
    /// Per-module accumulated mask of upstream modules that delivered EOS.
    arrivals: Vec<u64>,
    /// Bit i set: module i has completed EOS for this stream.
    completed: u64,
    /// Bit i set: sink module i has completed EOS for this stream.
    sinks_done: u64,
}

/// Tracks EOS progress per stream across all modules.
pub(crate) struct EosTracker {
    inner: Mutex<HashMap<String, StreamEos>>,
}

impl EosTracker {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Record an EOS delivery from upstream `from_bit` to `module`.
    ///
    /// Returns true when the module's expected upstream set is now fully
    /// observed and the module had not completed before — the caller then
    /// owns forwarding EOS downstream exactly once.
    pub fn record_arrival(
        &self,
        stream_id: &str,
        node_count: usize,
        module: u32,
        from_bit: u64,
        expected: u64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let entry = Self::entry(&mut inner, stream_id, node_count);
        entry.arrivals[module as usize] |= from_bit;
        trace!(
            stream = stream_id,
            module,
            mask = entry.arrivals[module as usize],
            expected,
            "eos arrival"
        );
        if entry.arrivals[module as usize] & expected != expected {
            return false;
        }
        Self::complete(entry, module)
    }

    /// Mark `module` complete unconditionally (modules with no upstream
    /// edges announcing their own EOS). Returns false when the module had
    /// already completed for this stream.
    pub fn mark_complete(&self, stream_id: &str, node_count: usize, module: u32) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let entry = Self::entry(&mut inner, stream_id, node_count);
        Self::complete(entry, module)
    }

    /// Record that sink `module` has completed. Returns true exactly once:
    /// when the last sink of `all_sinks` completes.
    pub fn mark_sink_done(&self, stream_id: &str, module: u32, all_sinks: u64) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.get_mut(stream_id) else {
            return false;
        };
        let before = entry.sinks_done;
        entry.sinks_done |= 1u64 << module;
        entry.sinks_done & all_sinks == all_sinks && before & all_sinks != all_sinks
    }

    /// Drop the stream's completion record.
    pub fn release(&self, stream_id: &str) {
        self.inner.lock().unwrap().remove(stream_id);
    }

    /// Number of streams with live records.
    #[cfg(test)]
    pub fn active_streams(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    fn entry<'a>(
        inner: &'a mut HashMap<String, StreamEos>,
        stream_id: &str,
        node_count: usize,
    ) -> &'a mut StreamEos {
        inner
            .entry(stream_id.to_string())
            .or_insert_with(|| StreamEos {
                arrivals: vec![0; node_count],
                completed: 0,
                sinks_done: 0,
            })
    }

    fn complete(entry: &mut StreamEos, module: u32) -> bool {
        let bit = 1u64 << module;
        if entry.completed & bit != 0 {
            return false;
        }
        entry.completed |= bit;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_upstream_completes_on_first_arrival() {
        let tracker = EosTracker::new();
        assert!(tracker.record_arrival("cam0", 3, 1, 1 << 0, 1 << 0));
        // Duplicate delivery is not a second completion.
        assert!(!tracker.record_arrival("cam0", 3, 1, 1 << 0, 1 << 0));
    }

    #[test]
    fn fan_in_waits_for_all_upstream_edges() {
        let tracker = EosTracker::new();
        let expected = (1 << 1) | (1 << 2);
        assert!(!tracker.record_arrival("cam0", 4, 3, 1 << 1, expected));
        assert!(tracker.record_arrival("cam0", 4, 3, 1 << 2, expected));
    }

    #[test]
    fn streams_are_independent() {
        let tracker = EosTracker::new();
        assert!(tracker.mark_complete("cam0", 2, 0));
        assert!(tracker.mark_complete("cam1", 2, 0));
        assert!(!tracker.mark_complete("cam0", 2, 0));
    }

    #[test]
    fn last_sink_triggers_exactly_once() {
        let tracker = EosTracker::new();
        let sinks = (1 << 2) | (1 << 3);
        tracker.mark_complete("cam0", 4, 2);
        assert!(!tracker.mark_sink_done("cam0", 2, sinks));
        assert!(tracker.mark_sink_done("cam0", 3, sinks));
        // Re-announcing changes nothing.
        assert!(!tracker.mark_sink_done("cam0", 3, sinks));
    }

    #[test]
    fn release_drops_record() {
        let tracker = EosTracker::new();
        tracker.mark_complete("cam0", 2, 0);
        assert_eq!(tracker.active_streams(), 1);
        tracker.release("cam0");
        assert_eq!(tracker.active_streams(), 0);
    }
}
