//! A buffer with two possible physical locations and lazy, state-tracked
//! copying between them.

use super::{DeviceLocation, DevicePtr, DeviceRuntime, HostBlock};
use crate::error::{Error, Result};
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::error;

/// Which side of a [`SyncedBuffer`] currently holds authoritative data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    /// No data has been written on either side.
    #[default]
    Uninitialized,
    /// Host data is newer than device data.
    ValidOnHost,
    /// Device data is newer than host data.
    ValidOnDevice,
    /// Both sides hold the same data.
    Synced,
}

enum HostSide {
    Unallocated,
    Owned(HostBlock),
    /// Externally-owned memory. The binder guarantees the pointer stays
    /// valid for the buffer's size until rebound or destruction.
    Borrowed(*mut u8),
}

enum DeviceSide {
    Unallocated,
    Owned(DevicePtr),
    Borrowed(DevicePtr),
}

struct Inner {
    state: SyncState,
    host: HostSide,
    device: DeviceSide,
    location: DeviceLocation,
}

// SAFETY: the raw host pointer in HostSide::Borrowed is only dereferenced
// through views that hold the buffer lock; validity is the binder's
// documented contract.
unsafe impl Send for Inner {}

impl Inner {
    fn host_ptr(&self) -> *mut u8 {
        match &self.host {
            HostSide::Unallocated => std::ptr::null_mut(),
            HostSide::Owned(block) => block.as_mut_ptr(),
            HostSide::Borrowed(ptr) => *ptr,
        }
    }

    fn device_ptr(&self) -> DevicePtr {
        match &self.device {
            DeviceSide::Unallocated => DevicePtr::null(),
            DeviceSide::Owned(ptr) | DeviceSide::Borrowed(ptr) => *ptr,
        }
    }
}

/// One logical buffer that can materialize on the host, on a device, or
/// both.
///
/// The buffer tracks which side is authoritative and copies lazily: reading
/// a side that is stale triggers exactly one copy through the
/// [`DeviceRuntime`] and transitions the buffer to [`SyncState::Synced`];
/// mutable access to one side invalidates the other. All transitions happen
/// under a per-buffer lock, so concurrent readers never race or double-copy.
///
/// A buffer of size 0 always reports [`SyncState::Uninitialized`] and
/// yields no view on either side.
///
/// # Example
///
/// ```rust
/// use millrace::memory::{SimDevice, SyncState, SyncedBuffer};
/// use std::sync::Arc;
///
/// let runtime = Arc::new(SimDevice::new());
/// let buf = SyncedBuffer::new(4, runtime);
///
/// buf.host_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
/// assert_eq!(buf.state(), SyncState::ValidOnHost);
///
/// // First device access copies host -> device.
/// let _ptr = buf.device().unwrap();
/// assert_eq!(buf.state(), SyncState::Synced);
/// ```
pub struct SyncedBuffer {
    size: usize,
    runtime: Arc<dyn DeviceRuntime>,
    inner: Mutex<Inner>,
}

impl SyncedBuffer {
    /// Create a buffer of `size` bytes with the default device location.
    ///
    /// No memory is allocated until one side is accessed.
    pub fn new(size: usize, runtime: Arc<dyn DeviceRuntime>) -> Self {
        Self::with_location(size, runtime, DeviceLocation::default())
    }

    /// Create a buffer whose device side will allocate at `location`.
    pub fn with_location(
        size: usize,
        runtime: Arc<dyn DeviceRuntime>,
        location: DeviceLocation,
    ) -> Self {
        Self {
            size,
            runtime,
            inner: Mutex::new(Inner {
                state: SyncState::Uninitialized,
                host: HostSide::Unallocated,
                device: DeviceSide::Unallocated,
                location,
            }),
        }
    }

    /// Size of the buffer in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Current synchronization state.
    pub fn state(&self) -> SyncState {
        if self.size == 0 {
            return SyncState::Uninitialized;
        }
        self.lock().state
    }

    /// Device location the device side allocates at.
    pub fn location(&self) -> DeviceLocation {
        self.lock().location
    }

    /// Change the device location.
    ///
    /// Only valid before any data access: once either side holds data the
    /// location is fixed.
    pub fn set_location(&self, location: DeviceLocation) -> Result<()> {
        if location.channel >= super::DEVICE_CHANNELS {
            return Err(Error::InvalidArgument(format!(
                "device channel {} out of range",
                location.channel
            )));
        }
        let mut inner = self.lock();
        if inner.state != SyncState::Uninitialized
            || !matches!(inner.device, DeviceSide::Unallocated)
        {
            return Err(Error::State(
                "device location must be set before any data access".into(),
            ));
        }
        inner.location = location;
        Ok(())
    }

    /// Read-only view of the host side.
    ///
    /// Copies device data to the host first if the device side is
    /// authoritative. The view holds the buffer lock for its lifetime.
    ///
    /// # Errors
    ///
    /// [`Error::EmptyBuffer`] for size-0 buffers; [`Error::Device`] when a
    /// required device-to-host copy fails.
    pub fn host(&self) -> Result<HostView<'_>> {
        let mut inner = self.require_data()?;
        self.sync_to_host(&mut inner)?;
        Ok(HostView {
            guard: inner,
            len: self.size,
        })
    }

    /// Mutable view of the host side. Invalidates the device side.
    pub fn host_mut(&self) -> Result<HostViewMut<'_>> {
        let mut inner = self.require_data()?;
        self.sync_to_host(&mut inner)?;
        inner.state = SyncState::ValidOnHost;
        Ok(HostViewMut {
            guard: inner,
            len: self.size,
        })
    }

    /// Device address of the buffer's data, for read access.
    ///
    /// Copies host data to the device first if the host side is
    /// authoritative.
    pub fn device(&self) -> Result<DevicePtr> {
        let mut inner = self.require_data()?;
        self.sync_to_device(&mut inner)?;
        Ok(inner.device_ptr())
    }

    /// Device address of the buffer's data, for write access. Invalidates
    /// the host side.
    pub fn device_mut(&self) -> Result<DevicePtr> {
        let mut inner = self.require_data()?;
        self.sync_to_device(&mut inner)?;
        inner.state = SyncState::ValidOnDevice;
        Ok(inner.device_ptr())
    }

    /// Rebind the host side to externally-owned memory.
    ///
    /// Any owned host allocation is released. The host side becomes
    /// authoritative.
    ///
    /// # Safety
    ///
    /// `ptr` must stay valid and writable for [`size`](Self::size) bytes
    /// until the buffer is rebound or dropped. The buffer never frees it.
    pub unsafe fn bind_host(&self, ptr: *mut u8) -> Result<()> {
        if self.size == 0 {
            return Err(Error::EmptyBuffer);
        }
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null host pointer".into()));
        }
        let mut inner = self.lock();
        inner.host = HostSide::Borrowed(ptr);
        inner.state = SyncState::ValidOnHost;
        Ok(())
    }

    /// Rebind the device side to an externally-owned allocation.
    ///
    /// Any owned device allocation is released. The device side becomes
    /// authoritative. The binder guarantees the allocation outlives the
    /// buffer and spans at least [`size`](Self::size) bytes.
    pub fn bind_device(&self, ptr: DevicePtr) -> Result<()> {
        if self.size == 0 {
            return Err(Error::EmptyBuffer);
        }
        if ptr.is_null() {
            return Err(Error::InvalidArgument("null device pointer".into()));
        }
        let mut inner = self.lock();
        if let DeviceSide::Owned(old) = inner.device {
            if let Err(e) = self.runtime.free(old) {
                error!(error = %e, "failed to free owned device allocation on rebind");
            }
        }
        inner.device = DeviceSide::Borrowed(ptr);
        inner.state = SyncState::ValidOnDevice;
        Ok(())
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn require_data(&self) -> Result<MutexGuard<'_, Inner>> {
        if self.size == 0 {
            return Err(Error::EmptyBuffer);
        }
        Ok(self.lock())
    }

    /// Make the host side valid, copying from the device if needed.
    fn sync_to_host(&self, inner: &mut Inner) -> Result<()> {
        if matches!(inner.host, HostSide::Unallocated) {
            inner.host = HostSide::Owned(HostBlock::new(self.size)?);
        }
        match inner.state {
            SyncState::Uninitialized => {
                inner.state = SyncState::ValidOnHost;
            }
            SyncState::ValidOnDevice => {
                let src = inner.device_ptr();
                // SAFETY: host side was just ensured allocated for self.size bytes.
                let dst = unsafe {
                    std::slice::from_raw_parts_mut(inner.host_ptr(), self.size)
                };
                self.runtime.copy_to_host(dst, src)?;
                inner.state = SyncState::Synced;
            }
            SyncState::ValidOnHost | SyncState::Synced => {}
        }
        Ok(())
    }

    /// Make the device side valid, copying from the host if needed.
    fn sync_to_device(&self, inner: &mut Inner) -> Result<()> {
        if matches!(inner.device, DeviceSide::Unallocated) {
            let ptr = self.runtime.alloc(self.size, inner.location)?;
            inner.device = DeviceSide::Owned(ptr);
        }
        match inner.state {
            SyncState::Uninitialized => {
                inner.state = SyncState::ValidOnDevice;
            }
            SyncState::ValidOnHost => {
                let dst = inner.device_ptr();
                // SAFETY: host side holds valid data for self.size bytes.
                let src = unsafe {
                    std::slice::from_raw_parts(inner.host_ptr(), self.size)
                };
                self.runtime.copy_to_device(dst, src)?;
                inner.state = SyncState::Synced;
            }
            SyncState::ValidOnDevice | SyncState::Synced => {}
        }
        Ok(())
    }
}

impl Drop for SyncedBuffer {
    fn drop(&mut self) {
        let inner = self.inner.get_mut().unwrap();
        if let DeviceSide::Owned(ptr) = inner.device {
            if let Err(e) = self.runtime.free(ptr) {
                error!(error = %e, "failed to free owned device allocation");
            }
        }
        // Owned host memory drops with HostBlock; borrowed memory is never
        // freed here.
    }
}

impl std::fmt::Debug for SyncedBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncedBuffer")
            .field("size", &self.size)
            .field("state", &self.state())
            .finish()
    }
}

/// Read-only host view of a [`SyncedBuffer`]. Holds the buffer lock.
pub struct HostView<'a> {
    guard: MutexGuard<'a, Inner>,
    len: usize,
}

impl Deref for HostView<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: the host side is allocated and valid for len bytes while
        // the lock is held.
        unsafe { std::slice::from_raw_parts(self.guard.host_ptr(), self.len) }
    }
}

/// Mutable host view of a [`SyncedBuffer`]. Holds the buffer lock.
pub struct HostViewMut<'a> {
    guard: MutexGuard<'a, Inner>,
    len: usize,
}

impl Deref for HostViewMut<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: as for HostView.
        unsafe { std::slice::from_raw_parts(self.guard.host_ptr(), self.len) }
    }
}

impl DerefMut for HostViewMut<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: as for HostView; exclusive access through &mut self.
        unsafe { std::slice::from_raw_parts_mut(self.guard.host_ptr(), self.len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::SimDevice;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Wraps SimDevice and counts copies in each direction.
    struct CountingRuntime {
        inner: SimDevice,
        to_host: AtomicUsize,
        to_device: AtomicUsize,
    }

    impl CountingRuntime {
        fn new() -> Self {
            Self {
                inner: SimDevice::new(),
                to_host: AtomicUsize::new(0),
                to_device: AtomicUsize::new(0),
            }
        }
    }

    impl DeviceRuntime for CountingRuntime {
        fn alloc(&self, bytes: usize, location: DeviceLocation) -> Result<DevicePtr> {
            self.inner.alloc(bytes, location)
        }
        fn free(&self, ptr: DevicePtr) -> Result<()> {
            self.inner.free(ptr)
        }
        fn copy_to_device(&self, dst: DevicePtr, src: &[u8]) -> Result<()> {
            self.to_device.fetch_add(1, Ordering::Relaxed);
            self.inner.copy_to_device(dst, src)
        }
        fn copy_to_host(&self, dst: &mut [u8], src: DevicePtr) -> Result<()> {
            self.to_host.fetch_add(1, Ordering::Relaxed);
            self.inner.copy_to_host(dst, src)
        }
    }

    #[test]
    fn zero_size_is_always_uninitialized() {
        let buf = SyncedBuffer::new(0, Arc::new(SimDevice::new()));
        assert_eq!(buf.state(), SyncState::Uninitialized);
        assert!(matches!(buf.host(), Err(Error::EmptyBuffer)));
        assert!(matches!(buf.device(), Err(Error::EmptyBuffer)));
    }

    #[test]
    fn first_host_access_initializes() {
        let buf = SyncedBuffer::new(8, Arc::new(SimDevice::new()));
        {
            let view = buf.host().unwrap();
            assert!(view.iter().all(|&b| b == 0));
        }
        assert_eq!(buf.state(), SyncState::ValidOnHost);
    }

    #[test]
    fn device_write_then_host_read_copies_once() {
        let runtime = Arc::new(CountingRuntime::new());
        let buf = SyncedBuffer::new(4, runtime.clone());

        // Write on the device side only.
        let ptr = buf.device_mut().unwrap();
        runtime.inner.copy_to_device(ptr, &[9, 9, 9, 9]).unwrap();
        assert_eq!(buf.state(), SyncState::ValidOnDevice);

        // First host read triggers exactly one d2h copy.
        assert_eq!(&*buf.host().unwrap(), &[9, 9, 9, 9]);
        assert_eq!(runtime.to_host.load(Ordering::Relaxed), 1);
        assert_eq!(buf.state(), SyncState::Synced);

        // Synced is sticky: further reads copy nothing.
        let _ = buf.host().unwrap();
        let _ = buf.device().unwrap();
        assert_eq!(runtime.to_host.load(Ordering::Relaxed), 1);
        assert_eq!(runtime.to_device.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn host_write_invalidates_device() {
        let runtime = Arc::new(CountingRuntime::new());
        let buf = SyncedBuffer::new(4, runtime.clone());

        buf.host_mut().unwrap().copy_from_slice(&[1, 2, 3, 4]);
        let _ = buf.device().unwrap();
        assert_eq!(buf.state(), SyncState::Synced);

        // Mutable host access makes the device side stale again.
        buf.host_mut().unwrap()[0] = 42;
        assert_eq!(buf.state(), SyncState::ValidOnHost);
        let ptr = buf.device().unwrap();
        assert_eq!(runtime.to_device.load(Ordering::Relaxed), 2);

        let mut out = [0u8; 4];
        runtime.inner.copy_to_host(&mut out, ptr).unwrap();
        assert_eq!(out, [42, 2, 3, 4]);
    }

    #[test]
    fn bind_host_rebinds_to_external_memory() {
        let buf = SyncedBuffer::new(4, Arc::new(SimDevice::new()));
        let mut external = vec![7u8; 4];
        // SAFETY: `external` outlives the buffer in this test.
        unsafe { buf.bind_host(external.as_mut_ptr()).unwrap() };
        assert_eq!(buf.state(), SyncState::ValidOnHost);
        assert_eq!(&*buf.host().unwrap(), &[7, 7, 7, 7]);
    }

    #[test]
    fn set_location_only_before_access() {
        let buf = SyncedBuffer::new(4, Arc::new(SimDevice::new()));
        buf.set_location(DeviceLocation::new(1, 2).unwrap()).unwrap();
        let _ = buf.host().unwrap();
        assert!(buf.set_location(DeviceLocation::default()).is_err());
    }

    #[test]
    fn owned_device_memory_freed_on_drop() {
        let runtime = Arc::new(SimDevice::new());
        {
            let buf = SyncedBuffer::new(16, runtime.clone());
            let _ = buf.device().unwrap();
            assert_eq!(runtime.live_allocations(), 1);
        }
        assert_eq!(runtime.live_allocations(), 0);
    }
}
