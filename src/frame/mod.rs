//! Frame types: raw media frames, derived inference results, and the
//! shared bundle that travels through the pipeline.

mod bundle;
mod objects;

pub use bundle::{Bundle, StreamRegistry};
pub use objects::{Attr, BoundingBox, InferObject};

use crate::error::{Error, Result};
use crate::memory::{DeviceLocation, DevicePtr, DeviceRuntime, SyncedBuffer};
use smallvec::SmallVec;
use std::sync::Arc;

/// Maximum number of data planes per frame.
pub const MAX_PLANES: usize = 6;

/// Frame flag: this frame is the end of a stream.
const FLAG_EOS: u32 = 1 << 0;

/// Pixel format of a frame's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar, V before U in the chroma plane.
    Nv21,
    /// YUV 4:2:0 semi-planar, U before V in the chroma plane.
    Nv12,
    /// Packed 8-bit BGR.
    Bgr24,
    /// Packed 8-bit RGB.
    Rgb24,
}

impl PixelFormat {
    /// Number of data planes for this format.
    pub fn planes(&self) -> usize {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => 2,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 1,
        }
    }

    /// Default row stride for a frame of `width` pixels.
    pub fn default_stride(&self, width: u32) -> usize {
        match self {
            PixelFormat::Nv21 | PixelFormat::Nv12 => width as usize,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => width as usize * 3,
        }
    }
}

/// Which address space a frame's raw planes live in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameLocation {
    /// Planes are in process memory.
    Host,
    /// Planes are device allocations at the given location.
    Device(DeviceLocation),
}

/// Source of one raw data plane, before it is copied into synced memory.
enum PlaneSource {
    /// Host data owned by the frame.
    Owned(Vec<u8>),
    /// Externally-owned host data. Valid until the frame is dropped or
    /// copied to synced memory, per the producer's contract.
    BorrowedHost(*const u8),
    /// A device allocation, owned by the producer (usually a decoder).
    Device(DevicePtr),
}

/// One frame of media data.
///
/// A frame starts life with raw plane pointers filled in by its producer
/// (a decoder or capture source), plus an optional release callback for
/// producer-owned memory. [`copy_to_synced`](Self::copy_to_synced) then
/// materializes one [`SyncedBuffer`] per plane and releases the raw
/// sources; from that point the frame is immutable and safe to share.
///
/// A frame marked EOS carries no payload: its `data` is empty and modules
/// must not touch it.
pub struct VideoFrame {
    /// Logical source-stream name this frame belongs to.
    pub stream_id: String,
    /// Frame index within the stream, increasing from 0.
    pub frame_id: i64,
    /// Presentation timestamp.
    pub timestamp: i64,
    /// Pixel format of the payload.
    pub format: PixelFormat,
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Row stride per plane, in bytes.
    pub strides: [usize; MAX_PLANES],
    /// Where the raw planes live.
    pub location: FrameLocation,
    /// Synced per-plane payload, filled by [`copy_to_synced`](Self::copy_to_synced).
    pub data: SmallVec<[Arc<SyncedBuffer>; MAX_PLANES]>,

    flags: u32,
    sources: SmallVec<[Option<PlaneSource>; MAX_PLANES]>,
    release: Option<Box<dyn FnOnce() + Send>>,
}

// SAFETY: the raw pointer in PlaneSource::BorrowedHost is only read inside
// copy_to_synced (&mut self); its validity is the producer's documented
// contract.
unsafe impl Send for VideoFrame {}
unsafe impl Sync for VideoFrame {}

impl VideoFrame {
    /// Create a data frame with default strides and no planes attached.
    pub fn new(
        stream_id: impl Into<String>,
        frame_id: i64,
        format: PixelFormat,
        width: u32,
        height: u32,
    ) -> Self {
        let mut strides = [0usize; MAX_PLANES];
        for stride in strides.iter_mut().take(format.planes()) {
            *stride = format.default_stride(width);
        }
        let mut sources: SmallVec<[Option<PlaneSource>; MAX_PLANES]> = SmallVec::new();
        for _ in 0..format.planes() {
            sources.push(None);
        }
        Self {
            stream_id: stream_id.into(),
            frame_id,
            timestamp: 0,
            format,
            width,
            height,
            strides,
            location: FrameLocation::Host,
            data: SmallVec::new(),
            flags: 0,
            sources,
            release: None,
        }
    }

    /// Create an end-of-stream sentinel frame. It carries no payload.
    pub fn eos(stream_id: impl Into<String>) -> Self {
        let mut frame = Self::new(stream_id, -1, PixelFormat::Nv12, 0, 0);
        frame.flags |= FLAG_EOS;
        frame.sources.clear();
        frame
    }

    /// Check the end-of-stream flag.
    pub fn is_eos(&self) -> bool {
        self.flags & FLAG_EOS != 0
    }

    /// Byte size of plane `idx` given the frame's format and strides.
    pub fn plane_bytes(&self, idx: usize) -> Result<usize> {
        if idx >= self.format.planes() {
            return Err(Error::InvalidArgument(format!(
                "plane {idx} out of range for {:?}",
                self.format
            )));
        }
        let height = self.height as usize;
        let bytes = match (self.format, idx) {
            (PixelFormat::Nv21 | PixelFormat::Nv12, 0) => self.strides[0] * height,
            // 4:2:0 chroma plane is half height.
            (PixelFormat::Nv21 | PixelFormat::Nv12, _) => self.strides[1] * height / 2,
            (PixelFormat::Bgr24 | PixelFormat::Rgb24, _) => self.strides[0] * height,
        };
        Ok(bytes)
    }

    /// Total payload size in bytes.
    pub fn bytes(&self) -> usize {
        (0..self.format.planes())
            .map(|i| self.plane_bytes(i).unwrap_or(0))
            .sum()
    }

    /// Attach an owned host plane.
    pub fn set_host_plane(&mut self, idx: usize, data: Vec<u8>) -> Result<()> {
        let expected = self.plane_bytes(idx)?;
        if data.len() != expected {
            return Err(Error::InvalidArgument(format!(
                "plane {idx} is {} bytes, expected {expected}",
                data.len()
            )));
        }
        self.source_slot(idx)?;
        self.sources[idx] = Some(PlaneSource::Owned(data));
        Ok(())
    }

    fn source_slot(&self, idx: usize) -> Result<()> {
        if idx >= self.sources.len() {
            return Err(Error::InvalidArgument(format!(
                "frame carries no source slot for plane {idx}"
            )));
        }
        Ok(())
    }

    /// Attach an externally-owned host plane.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid for [`plane_bytes`](Self::plane_bytes)`(idx)`
    /// bytes until the frame is dropped or copied to synced memory.
    pub unsafe fn set_raw_plane(&mut self, idx: usize, ptr: *const u8) -> Result<()> {
        self.plane_bytes(idx)?;
        self.source_slot(idx)?;
        self.sources[idx] = Some(PlaneSource::BorrowedHost(ptr));
        Ok(())
    }

    /// Attach a producer-owned device plane.
    pub fn set_device_plane(&mut self, idx: usize, ptr: DevicePtr) -> Result<()> {
        self.plane_bytes(idx)?;
        self.source_slot(idx)?;
        self.sources[idx] = Some(PlaneSource::Device(ptr));
        Ok(())
    }

    /// Install a release callback for producer-owned plane memory.
    ///
    /// Invoked exactly once, after [`copy_to_synced`](Self::copy_to_synced)
    /// or on drop, whichever comes first.
    pub fn set_release(&mut self, release: impl FnOnce() + Send + 'static) {
        self.release = Some(Box::new(release));
    }

    /// Copy the raw plane sources into per-plane synced buffers, then
    /// release the sources.
    ///
    /// Device planes are read back through `runtime`; host planes are
    /// copied directly. After this call `data` holds one buffer per plane
    /// and the producer's memory is no longer referenced.
    pub fn copy_to_synced(&mut self, runtime: &Arc<dyn DeviceRuntime>) -> Result<()> {
        if self.is_eos() {
            return Err(Error::InvalidArgument(
                "EOS frames carry no payload".into(),
            ));
        }
        let location = match self.location {
            FrameLocation::Host => DeviceLocation::default(),
            FrameLocation::Device(loc) => loc,
        };
        let mut data = SmallVec::new();
        for idx in 0..self.format.planes() {
            let bytes = self.plane_bytes(idx)?;
            let source = self.sources[idx].take().ok_or_else(|| {
                Error::InvalidArgument(format!("plane {idx} has no source data"))
            })?;
            let buffer = SyncedBuffer::with_location(bytes, runtime.clone(), location);
            {
                let mut view = buffer.host_mut()?;
                match source {
                    PlaneSource::Owned(vec) => view.copy_from_slice(&vec),
                    PlaneSource::BorrowedHost(ptr) => {
                        // SAFETY: producer contract, see set_raw_plane.
                        let src = unsafe { std::slice::from_raw_parts(ptr, bytes) };
                        view.copy_from_slice(src);
                    }
                    PlaneSource::Device(dev) => runtime.copy_to_host(&mut view, dev)?,
                }
            }
            data.push(Arc::new(buffer));
        }
        self.data = data;
        if let Some(release) = self.release.take() {
            release();
        }
        Ok(())
    }
}

impl Drop for VideoFrame {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("stream_id", &self.stream_id)
            .field("frame_id", &self.frame_id)
            .field("format", &self.format)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("eos", &self.is_eos())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{SimDevice, SyncState};
    use std::sync::atomic::{AtomicBool, Ordering};

    fn runtime() -> Arc<dyn DeviceRuntime> {
        Arc::new(SimDevice::new())
    }

    #[test]
    fn plane_geometry_nv12() {
        let frame = VideoFrame::new("cam0", 0, PixelFormat::Nv12, 16, 8);
        assert_eq!(frame.format.planes(), 2);
        assert_eq!(frame.plane_bytes(0).unwrap(), 16 * 8);
        assert_eq!(frame.plane_bytes(1).unwrap(), 16 * 8 / 2);
        assert_eq!(frame.bytes(), 16 * 8 + 16 * 4);
        assert!(frame.plane_bytes(2).is_err());
    }

    #[test]
    fn plane_geometry_bgr() {
        let frame = VideoFrame::new("cam0", 0, PixelFormat::Bgr24, 4, 4);
        assert_eq!(frame.format.planes(), 1);
        assert_eq!(frame.plane_bytes(0).unwrap(), 4 * 3 * 4);
    }

    #[test]
    fn copy_host_planes_to_synced() {
        let rt = runtime();
        let mut frame = VideoFrame::new("cam0", 3, PixelFormat::Nv12, 4, 2);
        frame.set_host_plane(0, vec![1u8; 8]).unwrap();
        frame.set_host_plane(1, vec![2u8; 4]).unwrap();
        frame.copy_to_synced(&rt).unwrap();

        assert_eq!(frame.data.len(), 2);
        assert_eq!(frame.data[0].state(), SyncState::ValidOnHost);
        assert_eq!(&*frame.data[0].host().unwrap(), &[1u8; 8][..]);
        assert_eq!(&*frame.data[1].host().unwrap(), &[2u8; 4][..]);
    }

    #[test]
    fn copy_device_plane_to_synced() {
        let sim = Arc::new(SimDevice::new());
        let rt: Arc<dyn DeviceRuntime> = sim.clone();
        let dev = sim.alloc(12, DeviceLocation::default()).unwrap();
        sim.copy_to_device(dev, &[5u8; 12]).unwrap();

        let mut frame = VideoFrame::new("cam0", 0, PixelFormat::Bgr24, 2, 2);
        frame.location = FrameLocation::Device(DeviceLocation::default());
        frame.set_device_plane(0, dev).unwrap();
        frame.copy_to_synced(&rt).unwrap();
        assert_eq!(&*frame.data[0].host().unwrap(), &[5u8; 12][..]);
    }

    #[test]
    fn release_runs_once_after_copy() {
        static RELEASED: AtomicBool = AtomicBool::new(false);
        let rt = runtime();
        let mut frame = VideoFrame::new("cam0", 0, PixelFormat::Bgr24, 2, 2);
        frame.set_host_plane(0, vec![0u8; 12]).unwrap();
        frame.set_release(|| RELEASED.store(true, Ordering::SeqCst));
        frame.copy_to_synced(&rt).unwrap();
        assert!(RELEASED.load(Ordering::SeqCst));
    }

    #[test]
    fn eos_frame_has_no_payload() {
        let rt = runtime();
        let mut frame = VideoFrame::eos("cam0");
        assert!(frame.is_eos());
        assert!(frame.data.is_empty());
        assert!(frame.copy_to_synced(&rt).is_err());
    }

    #[test]
    fn wrong_plane_size_rejected() {
        let mut frame = VideoFrame::new("cam0", 0, PixelFormat::Bgr24, 2, 2);
        assert!(frame.set_host_plane(0, vec![0u8; 5]).is_err());
    }
}
