//! The shared bundle that travels through the pipeline, and per-stream
//! creation bookkeeping.

use super::VideoFrame;
use crate::error::{Error, Result};
use crate::frame::InferObject;
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use tracing::trace;

struct StreamEntry {
    channel_idx: u32,
    live: usize,
    finished: bool,
}

/// Per-stream bookkeeping for bundle creation.
///
/// The registry assigns each stream id a channel index (increasing from 0,
/// in order of first appearance) and optionally caps the number of
/// in-flight non-EOS bundles per stream, bounding memory when downstream
/// modules are slow. It is owned by one pipeline, never process-global, so
/// multiple pipelines coexist in a process.
///
/// A stream's entry is released once the stream is
/// [`finish`](Self::finish)ed and its last live bundle drops.
pub struct StreamRegistry {
    limit: Mutex<Option<usize>>,
    inner: Mutex<RegistryInner>,
    available: Condvar,
}

struct RegistryInner {
    streams: HashMap<String, StreamEntry>,
    next_channel: u32,
}

impl StreamRegistry {
    /// Create a registry with no in-flight limit.
    pub fn new() -> Self {
        Self {
            limit: Mutex::new(None),
            inner: Mutex::new(RegistryInner {
                streams: HashMap::new(),
                next_channel: 0,
            }),
            available: Condvar::new(),
        }
    }

    /// Cap the number of in-flight non-EOS bundles per stream.
    ///
    /// `None` disables the limit (the default).
    pub fn set_frame_limit(&self, limit: Option<usize>) {
        *self.limit.lock().unwrap() = limit;
        self.available.notify_all();
    }

    /// The current per-stream in-flight limit.
    pub fn frame_limit(&self) -> Option<usize> {
        *self.limit.lock().unwrap()
    }

    /// Channel index assigned to `stream_id`, if the stream is known.
    pub fn channel_index(&self, stream_id: &str) -> Option<u32> {
        self.inner
            .lock()
            .unwrap()
            .streams
            .get(stream_id)
            .map(|e| e.channel_idx)
    }

    /// Number of streams with live bookkeeping entries.
    pub fn active_streams(&self) -> usize {
        self.inner.lock().unwrap().streams.len()
    }

    /// Mark a stream finished. Its entry is released once the last live
    /// bundle drops (immediately, if none are live).
    pub fn finish(&self, stream_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.streams.get_mut(stream_id) {
            entry.finished = true;
            if entry.live == 0 {
                inner.streams.remove(stream_id);
                trace!(stream = stream_id, "stream bookkeeping released");
            }
        }
        self.available.notify_all();
    }

    /// Take one in-flight slot for `stream_id`, registering the stream on
    /// first use. Blocks while the stream is at its limit when `blocking`.
    fn acquire(&self, stream_id: &str, blocking: bool) -> Result<u32> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            let limit = *self.limit.lock().unwrap();
            if !inner.streams.contains_key(stream_id) {
                let channel_idx = inner.next_channel;
                inner.next_channel += 1;
                inner.streams.insert(
                    stream_id.to_string(),
                    StreamEntry {
                        channel_idx,
                        live: 0,
                        finished: false,
                    },
                );
            }
            let entry = inner.streams.get_mut(stream_id).unwrap();
            match limit {
                Some(cap) if entry.live >= cap => {
                    if !blocking {
                        return Err(Error::StreamBusy(stream_id.to_string()));
                    }
                    inner = self.available.wait(inner).unwrap();
                }
                _ => {
                    entry.live += 1;
                    return Ok(entry.channel_idx);
                }
            }
        }
    }

    /// Register a stream without taking a slot (EOS bundles).
    fn touch(&self, stream_id: &str) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.streams.get(stream_id) {
            return entry.channel_idx;
        }
        let channel_idx = inner.next_channel;
        inner.next_channel += 1;
        inner.streams.insert(
            stream_id.to_string(),
            StreamEntry {
                channel_idx,
                live: 0,
                finished: false,
            },
        );
        channel_idx
    }

    /// Give back an in-flight slot; drops the entry if the stream is
    /// finished and this was its last live bundle.
    fn release(&self, stream_id: &str) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.streams.get_mut(stream_id) {
            entry.live = entry.live.saturating_sub(1);
            if entry.finished && entry.live == 0 {
                inner.streams.remove(stream_id);
                trace!(stream = stream_id, "stream bookkeeping released");
            }
        }
        drop(inner);
        self.available.notify_all();
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-bundle transport bookkeeping.
#[derive(Default)]
struct BundleMasks {
    /// Bit i set: module i has finished/forwarded this bundle.
    forwarded: u64,
    /// Per fan-in module: accumulated mask of upstream modules that have
    /// delivered this bundle so far.
    arrivals: HashMap<u32, u64>,
}

/// One frame plus its derived results and completion bookkeeping.
///
/// Bundles are passed by shared handle (`Arc<Bundle>`) through the
/// pipeline: fan-out duplicates the handle, never the payload. The frame
/// itself is immutable once bundled; the derived-results collection and
/// the transport masks are individually mutex-guarded so the rest of the
/// bundle stays freely shareable.
pub struct Bundle {
    channel_idx: u32,
    frame: VideoFrame,
    objects: Mutex<Vec<Arc<InferObject>>>,
    masks: Mutex<BundleMasks>,
    registry: Arc<StreamRegistry>,
    counted: bool,
}

impl Bundle {
    /// Wrap a frame into a shared bundle, taking an in-flight slot for its
    /// stream. Blocks while the stream is at its frame limit. EOS frames
    /// are exempt from the limit.
    pub fn create(registry: &Arc<StreamRegistry>, frame: VideoFrame) -> Result<Arc<Self>> {
        Self::build(registry, frame, true)
    }

    /// Like [`create`](Self::create), but fails with
    /// [`Error::StreamBusy`] instead of blocking at the frame limit.
    pub fn try_create(registry: &Arc<StreamRegistry>, frame: VideoFrame) -> Result<Arc<Self>> {
        Self::build(registry, frame, false)
    }

    /// Create an end-of-stream sentinel bundle for `stream_id`.
    pub fn eos(registry: &Arc<StreamRegistry>, stream_id: &str) -> Arc<Self> {
        let frame = VideoFrame::eos(stream_id);
        let channel_idx = registry.touch(stream_id);
        Arc::new(Self {
            channel_idx,
            frame,
            objects: Mutex::new(Vec::new()),
            masks: Mutex::new(BundleMasks::default()),
            registry: registry.clone(),
            counted: false,
        })
    }

    fn build(
        registry: &Arc<StreamRegistry>,
        frame: VideoFrame,
        blocking: bool,
    ) -> Result<Arc<Self>> {
        let (channel_idx, counted) = if frame.is_eos() {
            (registry.touch(&frame.stream_id), false)
        } else {
            (registry.acquire(&frame.stream_id, blocking)?, true)
        };
        Ok(Arc::new(Self {
            channel_idx,
            frame,
            objects: Mutex::new(Vec::new()),
            masks: Mutex::new(BundleMasks::default()),
            registry: registry.clone(),
            counted,
        }))
    }

    /// Channel index of the originating stream.
    pub fn channel_idx(&self) -> u32 {
        self.channel_idx
    }

    /// The wrapped frame.
    pub fn frame(&self) -> &VideoFrame {
        &self.frame
    }

    /// Stream id this bundle belongs to.
    pub fn stream_id(&self) -> &str {
        &self.frame.stream_id
    }

    /// Whether this bundle is an end-of-stream sentinel.
    pub fn is_eos(&self) -> bool {
        self.frame.is_eos()
    }

    /// Append a derived result object.
    pub fn add_object(&self, object: Arc<InferObject>) {
        self.objects.lock().unwrap().push(object);
    }

    /// Snapshot of the derived result objects.
    pub fn objects(&self) -> Vec<Arc<InferObject>> {
        self.objects.lock().unwrap().clone()
    }

    /// Record that module `module_idx` has forwarded this bundle.
    ///
    /// Returns false when the module had already forwarded it (duplicate
    /// completion).
    pub(crate) fn mark_forwarded(&self, module_idx: u32) -> bool {
        let mut masks = self.masks.lock().unwrap();
        let bit = 1u64 << module_idx;
        if masks.forwarded & bit != 0 {
            return false;
        }
        masks.forwarded |= bit;
        true
    }

    /// Accumulate an upstream delivery toward fan-in module `target`.
    /// Returns the mask after accumulation.
    pub(crate) fn record_arrival(&self, target: u32, from_bit: u64) -> u64 {
        let mut masks = self.masks.lock().unwrap();
        let entry = masks.arrivals.entry(target).or_insert(0);
        *entry |= from_bit;
        *entry
    }

    /// Drop fan-in bookkeeping for `target` once it has processed the
    /// bundle.
    pub(crate) fn clear_arrival(&self, target: u32) {
        self.masks.lock().unwrap().arrivals.remove(&target);
    }
}

impl Drop for Bundle {
    fn drop(&mut self) {
        if self.counted {
            self.registry.release(&self.frame.stream_id);
        }
    }
}

impl std::fmt::Debug for Bundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bundle")
            .field("stream_id", &self.stream_id())
            .field("frame_id", &self.frame.frame_id)
            .field("channel_idx", &self.channel_idx)
            .field("eos", &self.is_eos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::thread;
    use std::time::Duration;

    fn frame(stream: &str, id: i64) -> VideoFrame {
        VideoFrame::new(stream, id, PixelFormat::Bgr24, 2, 2)
    }

    #[test]
    fn channel_indices_assigned_in_order() {
        let registry = Arc::new(StreamRegistry::new());
        let a = Bundle::create(&registry, frame("cam0", 0)).unwrap();
        let b = Bundle::create(&registry, frame("cam1", 0)).unwrap();
        let c = Bundle::create(&registry, frame("cam0", 1)).unwrap();
        assert_eq!(a.channel_idx(), 0);
        assert_eq!(b.channel_idx(), 1);
        assert_eq!(c.channel_idx(), 0);
    }

    #[test]
    fn frame_limit_fails_fast_and_releases_on_drop() {
        let registry = Arc::new(StreamRegistry::new());
        registry.set_frame_limit(Some(2));

        let a = Bundle::try_create(&registry, frame("cam0", 0)).unwrap();
        let _b = Bundle::try_create(&registry, frame("cam0", 1)).unwrap();
        assert!(matches!(
            Bundle::try_create(&registry, frame("cam0", 2)),
            Err(Error::StreamBusy(_))
        ));

        // Other streams are unaffected.
        let _other = Bundle::try_create(&registry, frame("cam1", 0)).unwrap();

        drop(a);
        assert!(Bundle::try_create(&registry, frame("cam0", 2)).is_ok());
    }

    #[test]
    fn blocking_create_waits_for_slot() {
        let registry = Arc::new(StreamRegistry::new());
        registry.set_frame_limit(Some(1));
        let held = Bundle::create(&registry, frame("cam0", 0)).unwrap();

        let registry2 = registry.clone();
        let waiter = thread::spawn(move || Bundle::create(&registry2, frame("cam0", 1)));

        thread::sleep(Duration::from_millis(50));
        drop(held);
        let bundle = waiter.join().unwrap().unwrap();
        assert_eq!(bundle.frame().frame_id, 1);
    }

    #[test]
    fn eos_exempt_from_limit() {
        let registry = Arc::new(StreamRegistry::new());
        registry.set_frame_limit(Some(1));
        let _held = Bundle::create(&registry, frame("cam0", 0)).unwrap();
        let eos = Bundle::eos(&registry, "cam0");
        assert!(eos.is_eos());
    }

    #[test]
    fn finished_stream_entry_released_with_last_bundle() {
        let registry = Arc::new(StreamRegistry::new());
        let bundle = Bundle::create(&registry, frame("cam0", 0)).unwrap();
        registry.finish("cam0");
        // Entry survives while a bundle is live.
        assert_eq!(registry.active_streams(), 1);
        drop(bundle);
        assert_eq!(registry.active_streams(), 0);
    }

    #[test]
    fn duplicate_forward_detected() {
        let registry = Arc::new(StreamRegistry::new());
        let bundle = Bundle::create(&registry, frame("cam0", 0)).unwrap();
        assert!(bundle.mark_forwarded(3));
        assert!(!bundle.mark_forwarded(3));
        assert!(bundle.mark_forwarded(4));
    }

    #[test]
    fn fan_in_arrivals_accumulate() {
        let registry = Arc::new(StreamRegistry::new());
        let bundle = Bundle::create(&registry, frame("cam0", 0)).unwrap();
        assert_eq!(bundle.record_arrival(5, 1 << 1), 1 << 1);
        assert_eq!(bundle.record_arrival(5, 1 << 2), (1 << 1) | (1 << 2));
        bundle.clear_arrival(5);
        assert_eq!(bundle.record_arrival(5, 1 << 1), 1 << 1);
    }
}
