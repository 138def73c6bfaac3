//! Single-link operation variants: one collective call over the global
//! communicator, with fusion-buffer packing for multi-entry groups.

use crate::backend::CommScope;
use crate::error::{FusorError, Result};
use crate::message::Response;
use crate::ops::{CollectiveOp, ExecutionContext, context_id};
use crate::table::TensorTableEntry;
use crate::timeline::activity;
use crate::types::{Rank, ReduceOp};

/// Fallback allreduce: always enabled, one sum-reduce over the global
/// communicator.
pub struct BasicAllreduce;

impl CollectiveOp for BasicAllreduce {
    fn enabled(
        &self,
        _ctx: &ExecutionContext<'_>,
        _entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        true
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        _response: &Response,
    ) -> Result<()> {
        let comm = ctx.backend.communicator(CommScope::Global)?;
        let dtype = entries[0].dtype;
        let device = entries[0].device;
        let total_elements: usize = entries.iter().map(|e| e.num_elements()).sum();

        if entries.len() > 1 {
            let ctx_key = context_id(entries);

            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_IN_FUSION_BUFFER);
            let buf = ctx.fusion.buffer_mut(device, ctx_key)?;
            let total_bytes = buf.memcpy_in(entries, ctx.adapter)?;
            ctx.timeline.activity_end_all(entries);

            ctx.timeline.activity_start_all(entries, activity::ALLREDUCE);
            comm.allreduce(
                &mut buf.as_mut_slice()[..total_bytes],
                total_elements,
                dtype,
                ReduceOp::Sum,
            )?;
            ctx.timeline.activity_end_all(entries);

            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_OUT_FUSION_BUFFER);
            buf.memcpy_out(entries, ctx.adapter)?;
            ctx.timeline.activity_end_all(entries);
        } else {
            let e = &entries[0];
            let name = e.tensor_name.clone();
            let mut data = ctx.staging.get(e.size_in_bytes());

            ctx.timeline
                .activity_start(&name, activity::MEMCPY_IN_HOST_BUFFER);
            unsafe { ctx.adapter.stage_into(e.device, e.input_ptr, &mut data)? };
            ctx.timeline.activity_end(&name);

            ctx.timeline.activity_start(&name, activity::ALLREDUCE);
            comm.allreduce(&mut data, e.num_elements(), dtype, ReduceOp::Sum)?;
            ctx.timeline.activity_end(&name);

            let output = e.output_ptr.ok_or_else(|| {
                FusorError::PreconditionError(format!("allreduce entry {name} has no output"))
            })?;
            ctx.timeline
                .activity_start(&name, activity::MEMCPY_OUT_HOST_BUFFER);
            unsafe { ctx.adapter.receive_to_device(e.device, &data, output)? };
            ctx.timeline.activity_end(&name);

            ctx.staging.put(data);
        }
        Ok(())
    }
}

/// Fallback allgather: one variable-count gather over the global
/// communicator, output allocated through the entry's context.
pub struct BasicAllgather;

impl CollectiveOp for BasicAllgather {
    fn enabled(
        &self,
        _ctx: &ExecutionContext<'_>,
        _entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        true
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Result<()> {
        let comm = ctx.backend.communicator(CommScope::Global)?;
        let e = &mut entries[0];
        let name = e.tensor_name.clone();

        let counts = allgather_byte_counts(e, response)?;
        let staged = unsafe {
            ctx.adapter
                .stage_for_send(e.device, e.input_ptr, e.size_in_bytes())?
        };

        ctx.timeline.activity_start(&name, activity::ALLGATHER);
        let gathered = comm.allgatherv(&staged, &counts)?;
        ctx.timeline.activity_end(&name);

        let context = e.context.as_ref().ok_or_else(|| {
            FusorError::PreconditionError(format!(
                "allgather entry {name} has no output-allocating context"
            ))
        })?;
        let output = context.allocate_output(gathered.len())?;
        e.output_ptr = Some(output);

        ctx.timeline
            .activity_start(&name, activity::MEMCPY_OUT_HOST_BUFFER);
        unsafe { ctx.adapter.receive_to_device(e.device, &gathered, output)? };
        ctx.timeline.activity_end(&name);
        Ok(())
    }
}

/// Per-rank byte counts for an allgather entry, from the negotiated
/// first-dimension sizes.
pub(crate) fn allgather_byte_counts(
    entry: &TensorTableEntry,
    response: &Response,
) -> Result<Vec<usize>> {
    if response.tensor_sizes.is_empty() {
        return Err(FusorError::PreconditionError(format!(
            "allgather response for {} carries no tensor sizes",
            entry.tensor_name
        )));
    }
    let row_bytes: usize = entry.shape[1..].iter().product::<u64>() as usize
        * entry.dtype.size_in_bytes();
    Ok(response
        .tensor_sizes
        .iter()
        .map(|&first_dim| first_dim as usize * row_bytes)
        .collect())
}

/// Broadcast from the negotiated root to every rank.
pub struct BasicBroadcast;

impl CollectiveOp for BasicBroadcast {
    fn enabled(
        &self,
        _ctx: &ExecutionContext<'_>,
        _entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        true
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        _response: &Response,
    ) -> Result<()> {
        let comm = ctx.backend.communicator(CommScope::Global)?;
        let e = &entries[0];
        let name = e.tensor_name.clone();
        let root: Rank = e.root_rank.ok_or_else(|| {
            FusorError::PreconditionError(format!("broadcast entry {name} has no root rank"))
        })?;
        let is_root = ctx.topology.rank == root;

        let mut data = if is_root {
            unsafe {
                ctx.adapter
                    .stage_for_send(e.device, e.input_ptr, e.size_in_bytes())?
            }
        } else {
            Vec::new()
        };

        ctx.timeline.activity_start(&name, activity::BROADCAST);
        comm.broadcast(&mut data, root)?;
        ctx.timeline.activity_end(&name);

        if data.len() != e.size_in_bytes() {
            return Err(FusorError::BufferSizeMismatch {
                expected: e.size_in_bytes(),
                actual: data.len(),
            });
        }
        let output = e.output_ptr.ok_or_else(|| {
            FusorError::PreconditionError(format!("broadcast entry {name} has no output"))
        })?;
        unsafe { ctx.adapter.receive_to_device(e.device, &data, output)? };
        Ok(())
    }
}
