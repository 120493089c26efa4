//! Simulated device runtime backed by process memory.

use super::{DeviceLocation, DevicePtr, DeviceRuntime, DEVICE_CHANNELS};
use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// A device runtime that emulates an accelerator address space in process
/// memory.
///
/// Every allocation gets a fresh opaque handle; copies are plain memcpys.
/// This is the default runtime for tests and for pipelines that never leave
/// the host, and it doubles as a reference implementation of the
/// [`DeviceRuntime`] contract (bounds checking, unknown-handle rejection).
///
/// # Example
///
/// ```rust
/// use millrace::memory::{DeviceLocation, DeviceRuntime, SimDevice};
///
/// let dev = SimDevice::new();
/// let ptr = dev.alloc(16, DeviceLocation::default()).unwrap();
/// dev.copy_to_device(ptr, b"0123456789abcdef").unwrap();
///
/// let mut out = [0u8; 16];
/// dev.copy_to_host(&mut out, ptr).unwrap();
/// assert_eq!(&out, b"0123456789abcdef");
/// dev.free(ptr).unwrap();
/// ```
pub struct SimDevice {
    allocations: Mutex<HashMap<u64, Box<[u8]>>>,
    next_handle: AtomicU64,
}

impl SimDevice {
    /// Create an empty simulated device.
    pub fn new() -> Self {
        Self {
            allocations: Mutex::new(HashMap::new()),
            // 0 is the null handle.
            next_handle: AtomicU64::new(1),
        }
    }

    /// Number of live allocations.
    pub fn live_allocations(&self) -> usize {
        self.allocations.lock().unwrap().len()
    }
}

impl Default for SimDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceRuntime for SimDevice {
    fn alloc(&self, bytes: usize, location: DeviceLocation) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(Error::Device("cannot allocate 0 bytes".into()));
        }
        if location.channel >= DEVICE_CHANNELS {
            return Err(Error::Device(format!(
                "channel {} out of range",
                location.channel
            )));
        }
        let handle = self.next_handle.fetch_add(1, Ordering::Relaxed);
        self.allocations
            .lock()
            .unwrap()
            .insert(handle, vec![0u8; bytes].into_boxed_slice());
        Ok(DevicePtr(handle))
    }

    fn free(&self, ptr: DevicePtr) -> Result<()> {
        self.allocations
            .lock()
            .unwrap()
            .remove(&ptr.0)
            .map(|_| ())
            .ok_or_else(|| Error::Device(format!("free of unknown handle {:#x}", ptr.0)))
    }

    fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
        let mut allocations = self.allocations.lock().unwrap();
        let block = allocations
            .get_mut(&dst.0)
            .ok_or_else(|| Error::Device(format!("copy to unknown handle {:#x}", dst.0)))?;
        if src.len() > block.len() {
            return Err(Error::Device(format!(
                "copy of {} bytes exceeds allocation of {}",
                src.len(),
                block.len()
            )));
        }
        block[..src.len()].copy_from_slice(src);
        Ok(())
    }

    fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
        let allocations = self.allocations.lock().unwrap();
        let block = allocations
            .get(&src.0)
            .ok_or_else(|| Error::Device(format!("copy from unknown handle {:#x}", src.0)))?;
        if dst.len() > block.len() {
            return Err(Error::Device(format!(
                "copy of {} bytes exceeds allocation of {}",
                dst.len(),
                block.len()
            )));
        }
        dst.copy_from_slice(&block[..dst.len()]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let dev = SimDevice::new();
        let ptr = dev.alloc(8, DeviceLocation::default()).unwrap();
        dev.copy_to_device(ptr, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut out = [0u8; 8];
        dev.copy_to_host(&mut out, ptr).unwrap();
        assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
        dev.free(ptr).unwrap();
        assert_eq!(dev.live_allocations(), 0);
    }

    #[test]
    fn unknown_handle_rejected() {
        let dev = SimDevice::new();
        assert!(dev.free(DevicePtr(42)).is_err());
        assert!(dev.copy_to_device(DevicePtr(42), &[0]).is_err());
        let mut out = [0u8; 1];
        assert!(dev.copy_to_host(&mut out, DevicePtr(42)).is_err());
    }

    #[test]
    fn oversized_copy_rejected() {
        let dev = SimDevice::new();
        let ptr = dev.alloc(4, DeviceLocation::default()).unwrap();
        assert!(dev.copy_to_device(ptr, &[0u8; 8]).is_err());
    }

    #[test]
    fn alloc_is_zeroed() {
        let dev = SimDevice::new();
        let ptr = dev.alloc(16, DeviceLocation::default()).unwrap();
        let mut out = [0xffu8; 16];
        dev.copy_to_host(&mut out, ptr).unwrap();
        assert!(out.iter().all(|&b| b == 0));
    }
}
