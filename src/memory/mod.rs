//! Memory management: host blocks, device runtimes, and synced buffers.
//!
//! The pipeline moves frame payloads between two address spaces: process
//! memory ("host") and an accelerator's memory ("device"). This module
//! provides:
//!
//! - [`DeviceRuntime`]: the narrow collaborator interface a device backend
//!   must implement (allocate, free, copy in both directions)
//! - [`SimDevice`]: a process-memory emulation of a device address space,
//!   used by tests and CPU-only pipelines
//! - [`HostBlock`]: an owned, aligned host allocation
//! - [`SyncedBuffer`]: one logical buffer that can materialize on either
//!   side and copies lazily on access

mod host;
mod sim;
mod synced;

pub use host::HostBlock;
pub use sim::SimDevice;
pub use synced::{HostView, HostViewMut, SyncState, SyncedBuffer};

use crate::error::Result;

/// Number of logical memory channels per device.
pub const DEVICE_CHANNELS: u32 = 4;

/// An opaque address in a device's memory space.
///
/// The value is only meaningful to the [`DeviceRuntime`] that produced it.
/// Address 0 is reserved as the null handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device pointer.
    pub const fn null() -> Self {
        Self(0)
    }

    /// Check if this pointer is null.
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }
}

/// Where on a device an allocation should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceLocation {
    /// Device ordinal, increasing from 0.
    pub device_id: u32,
    /// Logical memory channel, in `0..DEVICE_CHANNELS`.
    pub channel: u32,
}

impl DeviceLocation {
    /// Create a location, validating the channel range.
    pub fn new(device_id: u32, channel: u32) -> Result<Self> {
        if channel >= DEVICE_CHANNELS {
            return Err(crate::error::Error::InvalidArgument(format!(
                "device channel {} out of range (max {})",
                channel,
                DEVICE_CHANNELS - 1
            )));
        }
        Ok(Self { device_id, channel })
    }
}

/// Interface to a device memory runtime.
///
/// This is the seam between the pipeline core and hardware bindings. A real
/// backend wraps driver calls; [`SimDevice`] emulates one in process memory.
/// Implementations must be safe to call from any worker thread.
///
/// Failures must be reported through `Result` — a runtime that silently
/// corrupts or drops a copy breaks the synced-buffer state machine.
pub trait DeviceRuntime: Send + Sync {
    /// Allocate `bytes` of device memory at `location`.
    fn alloc(&self, bytes: usize, location: DeviceLocation) -> Result<DevicePtr>;

    /// Free a device allocation previously returned by [`alloc`](Self::alloc).
    fn free(&self, ptr: DevicePtr) -> Result<()>;

    /// Copy host memory into a device allocation.
    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()>;

    /// Copy a device allocation into host memory.
    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_location_validates_channel() {
        assert!(DeviceLocation::new(0, 0).is_ok());
        assert!(DeviceLocation::new(0, DEVICE_CHANNELS - 1).is_ok());
        assert!(DeviceLocation::new(0, DEVICE_CHANNELS).is_err());
    }

    #[test]
    fn null_pointer() {
        assert!(DevicePtr::null().is_null());
        assert!(!DevicePtr(1).is_null());
    }
}
