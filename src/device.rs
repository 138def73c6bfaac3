//! Bridges device memory with the host-side buffers that negotiation and
//! collective calls operate on.
//!
//! fusor operates on raw `u64` pointers + byte counts. The `DeviceAdapter`
//! handles staging data between device memory and host buffers.
//!
//! - `CpuAdapter` (built-in): direct pointer access for host memory. It also
//!   treats accelerator-tagged pointers as host pointers, which makes it the
//!   test double for accelerator devices.
//! - GPU adapters: device-to-host / host-to-device copies (implemented
//!   externally against this trait).

use crate::error::Result;
use crate::types::Device;

pub trait DeviceAdapter: Send + Sync {
    /// Copy `dst.len()` bytes from `ptr` on `device` into the host slice.
    ///
    /// # Safety
    /// `ptr` must be a valid pointer on `device` to at least `dst.len()` bytes.
    unsafe fn stage_into(&self, device: Device, ptr: u64, dst: &mut [u8]) -> Result<()>;

    /// Copy from device memory to a fresh host buffer.
    ///
    /// # Safety
    /// `ptr` must be a valid pointer on `device` to at least `size_bytes` bytes.
    unsafe fn stage_for_send(&self, device: Device, ptr: u64, size_bytes: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; size_bytes];
        unsafe { self.stage_into(device, ptr, &mut buf)? };
        Ok(buf)
    }

    /// Copy host data into device memory at `dst_ptr`.
    ///
    /// # Safety
    /// `dst_ptr` must be a valid pointer on `device` to at least `data.len()` bytes.
    unsafe fn receive_to_device(&self, device: Device, data: &[u8], dst_ptr: u64) -> Result<()>;
}

/// DeviceAdapter for host (CPU) memory. Direct pointer access, no copies
/// beyond the staging move itself.
#[derive(Debug, Clone, Default)]
pub struct CpuAdapter;

impl CpuAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl DeviceAdapter for CpuAdapter {
    unsafe fn stage_into(&self, _device: Device, ptr: u64, dst: &mut [u8]) -> Result<()> {
        let src = unsafe { std::slice::from_raw_parts(ptr as *const u8, dst.len()) };
        dst.copy_from_slice(src);
        Ok(())
    }

    unsafe fn receive_to_device(&self, _device: Device, data: &[u8], dst_ptr: u64) -> Result<()> {
        unsafe {
            std::ptr::copy(data.as_ptr(), dst_ptr as *mut u8, data.len());
        }
        Ok(())
    }
}
