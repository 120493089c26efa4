//! A frame-generating source for tests and benchmarks.

use crate::error::Result;
use crate::frame::{Bundle, PixelFormat, StreamRegistry, VideoFrame};
use crate::memory::{DeviceRuntime, SimDevice};
use crate::module::{Module, Output, ParamMap};
use std::sync::Arc;

/// A source module that fabricates frames on demand.
///
/// Sources run with parallelism 0: the pipeline gives them no workers and
/// no input queues; they inject downstream through the pipeline's
/// data-injection entry point from whatever thread drives them. This one
/// fabricates deterministic test frames — each plane is filled with the
/// low byte of the frame index, so sinks can verify payload integrity.
///
/// Parameters:
///
/// - `width`, `height`: frame geometry (default 64x36)
/// - `format`: `nv12`, `nv21`, `bgr24`, or `rgb24` (default `nv12`)
pub struct TestSource {
    name: String,
    width: u32,
    height: u32,
    format: PixelFormat,
    runtime: Arc<dyn DeviceRuntime>,
}

impl TestSource {
    /// Create a source named `name` with default geometry.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            width: 64,
            height: 36,
            format: PixelFormat::Nv12,
            runtime: Arc::new(SimDevice::new()),
        }
    }

    /// Fabricate one frame with synced payload planes.
    pub fn make_frame(&self, stream_id: &str, frame_id: i64) -> Result<VideoFrame> {
        let mut frame = VideoFrame::new(stream_id, frame_id, self.format, self.width, self.height);
        frame.timestamp = frame_id;
        for plane in 0..self.format.planes() {
            let bytes = frame.plane_bytes(plane)?;
            frame.set_host_plane(plane, vec![frame_id as u8; bytes])?;
        }
        frame.copy_to_synced(&self.runtime)?;
        Ok(frame)
    }

    /// Fabricate one frame and wrap it into a bundle.
    pub fn make_bundle(
        &self,
        registry: &Arc<StreamRegistry>,
        stream_id: &str,
        frame_id: i64,
    ) -> Result<Arc<Bundle>> {
        Bundle::create(registry, self.make_frame(stream_id, frame_id)?)
    }
}

impl Module for TestSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn open(&mut self, params: &ParamMap) -> bool {
        if let Some(width) = params.get("width") {
            match width.parse() {
                Ok(w) if w > 0 => self.width = w,
                _ => return false,
            }
        }
        if let Some(height) = params.get("height") {
            match height.parse() {
                Ok(h) if h > 0 => self.height = h,
                _ => return false,
            }
        }
        if let Some(format) = params.get("format") {
            self.format = match format.as_str() {
                "nv12" => PixelFormat::Nv12,
                "nv21" => PixelFormat::Nv21,
                "bgr24" => PixelFormat::Bgr24,
                "rgb24" => PixelFormat::Rgb24,
                _ => return false,
            };
        }
        true
    }

    fn process(&self, _bundle: &Arc<Bundle>) -> Result<Output> {
        // Externally driven; the pipeline never routes bundles here.
        Ok(Output::Discard)
    }

    fn close(&mut self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_parses_geometry() {
        let mut src = TestSource::new("src");
        let mut params = ParamMap::new();
        params.insert("width".into(), "16".into());
        params.insert("height".into(), "8".into());
        params.insert("format".into(), "bgr24".into());
        assert!(src.open(&params));

        let frame = src.make_frame("cam0", 7).unwrap();
        assert_eq!(frame.width, 16);
        assert_eq!(frame.data.len(), 1);
        assert!(frame.data[0].host().unwrap().iter().all(|&b| b == 7));
    }

    #[test]
    fn open_rejects_bad_params() {
        let mut src = TestSource::new("src");
        let mut params = ParamMap::new();
        params.insert("format".into(), "yuv9000".into());
        assert!(!src.open(&params));

        let mut params = ParamMap::new();
        params.insert("width".into(), "0".into());
        assert!(!src.open(&params));
    }
}
