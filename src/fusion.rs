//! Tensor fusion buffer management.
//!
//! One scratch region per (device, context) pair batches many small tensors
//! into one physical collective call. Buffers are allocated lazily on first
//! use, reused across cycles, and live until process shutdown.

use std::collections::HashMap;

use crate::device::DeviceAdapter;
use crate::error::{FusorError, Result};
use crate::table::TensorTableEntry;
use crate::types::Device;

/// Granularity unit for hierarchical padding. The padded byte length of a
/// fused group is a multiple of `local_size * FUSION_BUFFER_ATOMIC_UNIT`,
/// which keeps the divisible part balanced across local ranks.
pub const FUSION_BUFFER_ATOMIC_UNIT: usize = 64;

/// One pre-allocated scratch region.
pub struct FusionBuffer {
    data: Vec<u8>,
}

impl FusionBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Pack each entry's input tensor contiguously, in entries order.
    /// Returns the total packed length in bytes.
    pub fn memcpy_in(
        &mut self,
        entries: &[TensorTableEntry],
        adapter: &dyn DeviceAdapter,
    ) -> Result<usize> {
        let total: usize = entries.iter().map(|e| e.size_in_bytes()).sum();
        if total > self.data.len() {
            return Err(FusorError::PreconditionError(format!(
                "fused group of {total} bytes exceeds fusion buffer of {} bytes",
                self.data.len()
            )));
        }
        let mut offset = 0;
        for e in entries {
            let len = e.size_in_bytes();
            unsafe {
                adapter.stage_into(e.device, e.input_ptr, &mut self.data[offset..offset + len])?;
            }
            offset += len;
        }
        Ok(total)
    }

    /// Scatter the buffer back into each entry's output tensor at the same
    /// offsets `memcpy_in` packed them at.
    pub fn memcpy_out(
        &self,
        entries: &[TensorTableEntry],
        adapter: &dyn DeviceAdapter,
    ) -> Result<()> {
        let mut offset = 0;
        for e in entries {
            let len = e.size_in_bytes();
            let out = e.output_ptr.ok_or_else(|| {
                FusorError::PreconditionError(format!(
                    "entry {} has no output buffer to unpack into",
                    e.tensor_name
                ))
            })?;
            unsafe {
                adapter.receive_to_device(e.device, &self.data[offset..offset + len], out)?;
            }
            offset += len;
        }
        Ok(())
    }
}

/// Process-wide owner of fusion buffers, keyed by (device, context).
#[derive(Default)]
pub struct FusionBufferManager {
    buffers: HashMap<(Device, u64), FusionBuffer>,
}

impl FusionBufferManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lazily allocate (or reuse) the scratch region for (device, context),
    /// sized at least `threshold_bytes`. `on_start`/`on_end` bracket any
    /// actual allocation work so the timeline can attribute it.
    pub fn initialize_buffer(
        &mut self,
        threshold_bytes: usize,
        device: Device,
        context_id: u64,
        on_start: impl FnOnce(),
        on_end: impl FnOnce(),
    ) -> Result<()> {
        if let Some(buf) = self.buffers.get(&(device, context_id)) {
            if buf.len() >= threshold_bytes {
                return Ok(());
            }
        }

        on_start();
        let mut data = Vec::new();
        let result = data
            .try_reserve_exact(threshold_bytes)
            .map_err(|e| FusorError::AllocationFailed {
                device,
                requested_bytes: threshold_bytes,
                reason: e.to_string(),
            });
        on_end();
        result?;

        data.resize(threshold_bytes, 0);
        tracing::debug!(
            %device,
            context_id,
            bytes = threshold_bytes,
            "initialized fusion buffer"
        );
        self.buffers.insert((device, context_id), FusionBuffer { data });
        Ok(())
    }

    /// The buffer for (device, context); `initialize_buffer` must have
    /// succeeded for the pair earlier in the cycle.
    pub fn buffer_mut(&mut self, device: Device, context_id: u64) -> Result<&mut FusionBuffer> {
        self.buffers
            .get_mut(&(device, context_id))
            .ok_or_else(|| {
                FusorError::PreconditionError(format!(
                    "fusion buffer for ({device}, context {context_id}) was never initialized"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::CpuAdapter;
    use crate::types::DataType;

    fn entry(name: &str, data: &mut Vec<f32>, out: &mut Vec<f32>) -> TensorTableEntry {
        TensorTableEntry {
            tensor_name: name.into(),
            context: None,
            input_ptr: data.as_ptr() as u64,
            output_ptr: Some(out.as_mut_ptr() as u64),
            dtype: DataType::F32,
            shape: vec![data.len() as u64],
            device: Device::Host,
            root_rank: None,
            ready_event: None,
            callback: None,
        }
    }

    #[test]
    fn test_initialize_is_lazy_and_reused() {
        let mut mgr = FusionBufferManager::new();
        let mut allocations = 0;
        mgr.initialize_buffer(1024, Device::Host, 0, || allocations += 1, || {})
            .unwrap();
        mgr.initialize_buffer(1024, Device::Host, 0, || allocations += 1, || {})
            .unwrap();
        assert_eq!(allocations, 1);
        assert_eq!(mgr.buffer_mut(Device::Host, 0).unwrap().len(), 1024);
    }

    #[test]
    fn test_separate_buffers_per_device_context() {
        let mut mgr = FusionBufferManager::new();
        mgr.initialize_buffer(64, Device::Host, 0, || {}, || {}).unwrap();
        mgr.initialize_buffer(64, Device::Accelerator(0), 0, || {}, || {})
            .unwrap();
        mgr.initialize_buffer(64, Device::Host, 7, || {}, || {}).unwrap();
        assert!(mgr.buffer_mut(Device::Accelerator(0), 0).is_ok());
        assert!(mgr.buffer_mut(Device::Accelerator(1), 0).is_err());
    }

    #[test]
    fn test_memcpy_roundtrip_bit_identical() {
        let adapter = CpuAdapter::new();
        let mut mgr = FusionBufferManager::new();
        mgr.initialize_buffer(4096, Device::Host, 0, || {}, || {}).unwrap();

        let mut a_in: Vec<f32> = vec![1.5, -2.25, 3.0];
        let mut b_in: Vec<f32> = vec![7.0; 5];
        let mut a_out = vec![0.0f32; 3];
        let mut b_out = vec![0.0f32; 5];
        let entries = vec![
            entry("a", &mut a_in, &mut a_out),
            entry("b", &mut b_in, &mut b_out),
        ];

        let buf = mgr.buffer_mut(Device::Host, 0).unwrap();
        let total = buf.memcpy_in(&entries, &adapter).unwrap();
        assert_eq!(total, 32);
        buf.memcpy_out(&entries, &adapter).unwrap();

        assert_eq!(a_out, a_in);
        assert_eq!(b_out, b_in);
    }

    #[test]
    fn test_memcpy_roundtrip_random_group() {
        use rand::Rng;

        let adapter = CpuAdapter::new();
        let mut mgr = FusionBufferManager::new();
        mgr.initialize_buffer(1 << 16, Device::Host, 0, || {}, || {}).unwrap();

        let mut rng = rand::thread_rng();
        let mut inputs: Vec<Vec<f32>> = (0..7)
            .map(|_| (0..rng.gen_range(1..512)).map(|_| rng.r#gen::<f32>()).collect())
            .collect();
        let mut outputs: Vec<Vec<f32>> = inputs.iter().map(|v| vec![0.0; v.len()]).collect();
        let entries: Vec<TensorTableEntry> = (0..7)
            .map(|i| {
                let (input, output) = (&mut inputs[i], &mut outputs[i]);
                TensorTableEntry {
                    tensor_name: format!("t{i}"),
                    context: None,
                    input_ptr: input.as_ptr() as u64,
                    output_ptr: Some(output.as_mut_ptr() as u64),
                    dtype: DataType::F32,
                    shape: vec![input.len() as u64],
                    device: Device::Host,
                    root_rank: None,
                    ready_event: None,
                    callback: None,
                }
            })
            .collect();

        let buf = mgr.buffer_mut(Device::Host, 0).unwrap();
        buf.memcpy_in(&entries, &adapter).unwrap();
        buf.memcpy_out(&entries, &adapter).unwrap();
        assert_eq!(outputs, inputs);
    }

    #[test]
    fn test_memcpy_in_overflow_rejected() {
        let adapter = CpuAdapter::new();
        let mut mgr = FusionBufferManager::new();
        mgr.initialize_buffer(8, Device::Host, 0, || {}, || {}).unwrap();

        let mut data: Vec<f32> = vec![0.0; 4];
        let mut out = vec![0.0f32; 4];
        let entries = vec![entry("big", &mut data, &mut out)];
        let buf = mgr.buffer_mut(Device::Host, 0).unwrap();
        assert!(matches!(
            buf.memcpy_in(&entries, &adapter),
            Err(FusorError::PreconditionError(_))
        ));
    }
}
