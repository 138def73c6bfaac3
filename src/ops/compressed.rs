//! Allreduce through the gradient-compression hook.
//!
//! Each rank compresses its (fused) gradient bytes, the compressed payloads
//! are exchanged with one variable-count gather, and every rank decompresses
//! and accumulates locally. The selection math lives behind the
//! [`Compressor`] trait; this variant only orchestrates the exchange.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::backend::CommScope;
use crate::compression::{CompressedTensor, Compressor};
use crate::error::{FusorError, Result};
use crate::message::Response;
use crate::ops::{CollectiveOp, ExecutionContext};
use crate::reduce::reduce_slice;
use crate::table::TensorTableEntry;
use crate::timeline::activity;
use crate::types::{DataType, ReduceOp};

pub struct CompressedAllreduce {
    compressor: Arc<dyn Compressor>,
    /// Error-feedback residuals, keyed by the fused group's name list.
    residuals: Mutex<HashMap<String, Vec<u8>>>,
}

impl CompressedAllreduce {
    pub fn new(compressor: Arc<dyn Compressor>) -> Self {
        Self {
            compressor,
            residuals: Mutex::new(HashMap::new()),
        }
    }
}

impl CollectiveOp for CompressedAllreduce {
    fn enabled(
        &self,
        _ctx: &ExecutionContext<'_>,
        entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        // The accumulation step needs a dense-reducible dtype.
        matches!(entries[0].dtype, DataType::F32 | DataType::F64)
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Result<()> {
        let comm = ctx.backend.communicator(CommScope::Global)?;
        let dtype = entries[0].dtype;
        let device = entries[0].device;
        let elem = dtype.size_in_bytes();
        let total_elements: usize = entries.iter().map(|e| e.num_elements()).sum();
        let total_bytes = total_elements * elem;
        let group = comm.size() as usize;

        // Pack inputs contiguously into a host buffer.
        let mut dense = ctx.staging.get(total_bytes);
        let mut offset = 0;
        for e in entries.iter() {
            let len = e.size_in_bytes();
            unsafe {
                ctx.adapter
                    .stage_into(device, e.input_ptr, &mut dense[offset..offset + len])?;
            }
            offset += len;
        }

        let key = response.tensor_names_string();
        ctx.timeline.activity_start_all(entries, activity::COMPRESS);
        let compressed = {
            let mut residuals = self
                .residuals
                .lock()
                .map_err(|_| FusorError::collective("compress", "residual lock poisoned"))?;
            let residual = residuals.entry(key).or_default();
            if residual.len() != total_bytes {
                residual.clear();
                residual.resize(total_bytes, 0);
            }
            self.compressor
                .compress(&dense, total_elements, dtype, residual)
        };
        ctx.timeline.activity_end_all(entries);

        // Compressed sizes vary per rank: exchange lengths first, then the
        // payloads in one variable-count gather.
        ctx.timeline.activity_start_all(entries, activity::ALLREDUCE);
        let lens = comm.allgather(&(compressed.data.len() as u64).to_le_bytes())?;
        let counts: Vec<usize> = lens
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().expect("8-byte chunks")) as usize)
            .collect();
        let payloads = comm.allgatherv(&compressed.data, &counts)?;
        ctx.timeline.activity_end_all(entries);

        // Decompress every rank's selection into a dense scratch and
        // accumulate the sum.
        ctx.timeline
            .activity_start_all(entries, activity::DECOMPRESS);
        dense.fill(0);
        let mut scratch = ctx.staging.get(total_bytes);
        let mut offset = 0;
        for r in 0..group {
            let part = CompressedTensor::from_wire(
                payloads[offset..offset + counts[r]].to_vec(),
                total_elements,
                dtype,
            );
            offset += counts[r];
            scratch.fill(0);
            self.compressor.decompress(&part, &mut scratch);
            reduce_slice(&mut dense, &scratch, total_elements, dtype, ReduceOp::Sum)?;
        }
        ctx.staging.put(scratch);
        ctx.timeline.activity_end_all(entries);

        // Scatter the accumulated result back to the output tensors.
        let mut offset = 0;
        for e in entries.iter() {
            let len = e.size_in_bytes();
            let output = e.output_ptr.ok_or_else(|| {
                FusorError::PreconditionError(format!(
                    "allreduce entry {} has no output",
                    e.tensor_name
                ))
            })?;
            unsafe {
                ctx.adapter
                    .receive_to_device(device, &dense[offset..offset + len], output)?;
            }
            offset += len;
        }
        ctx.staging.put(dense);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_decode() {
        let lens: Vec<u8> = [3u64, 17, 0]
            .iter()
            .flat_map(|n| n.to_le_bytes())
            .collect();
        let counts: Vec<usize> = lens
            .chunks_exact(8)
            .map(|c| u64::from_le_bytes(c.try_into().unwrap()) as usize)
            .collect();
        assert_eq!(counts, vec![3, 17, 0]);
    }
}
