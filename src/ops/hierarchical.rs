//! Hierarchical operation variants: exploit fast intra-node links before
//! the slower cross-node path.
//!
//! Allreduce decomposes into ReduceScatter (node) → allreduce of each local
//! rank's own shard (cross-node) → Allgather (node), with a remainder that
//! does not divide evenly across local ranks reduced onto the node root and
//! broadcast back after its cross-node reduction.

use crate::backend::CommScope;
use crate::error::{FusorError, Result};
use crate::fusion::FUSION_BUFFER_ATOMIC_UNIT;
use crate::message::Response;
use crate::ops::basic::allgather_byte_counts;
use crate::ops::{CollectiveOp, ExecutionContext, context_id};
use crate::table::TensorTableEntry;
use crate::timeline::activity;
use crate::types::{Rank, ReduceOp};

/// One contiguous run of a source tensor inside an owned byte range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardSegment {
    /// Index of the source tensor within the fused group.
    pub tensor: usize,
    /// Element offset within that tensor.
    pub tensor_offset: usize,
    /// Number of elements of that tensor in this range.
    pub count: usize,
}

/// Attribution of fused tensor elements to the byte ranges owned during the
/// hierarchical split.
///
/// The divisible part is split into `local_size` equal shards of `per_rank`
/// elements; everything after it is the remainder owned by the node root.
/// A tensor straddling a boundary contributes a segment to each side, so
/// the per-tensor counts across all ranges sum exactly to the original
/// element counts — no loss, no duplication. Padding elements past the last
/// tensor belong to no segment.
#[derive(Debug, Clone)]
pub struct TensorShardLayout {
    /// Segments owned by each local rank's shard of the divisible part.
    pub rank_segments: Vec<Vec<ShardSegment>>,
    /// Segments in the remainder range.
    pub remainder_segments: Vec<ShardSegment>,
}

impl TensorShardLayout {
    pub fn new(tensor_counts: &[usize], local_size: usize, per_rank: usize) -> Self {
        let rank_segments = (0..local_size)
            .map(|r| segments_in_range(tensor_counts, r * per_rank, (r + 1) * per_rank))
            .collect();
        let total: usize = tensor_counts.iter().sum();
        let remainder_segments = segments_in_range(tensor_counts, local_size * per_rank, total);
        Self {
            rank_segments,
            remainder_segments,
        }
    }

    /// Elements of each tensor inside local rank `r`'s shard.
    pub fn rank_counts(&self, r: usize) -> Vec<usize> {
        per_tensor_counts(&self.rank_segments[r], self.num_tensors())
    }

    /// Elements of each tensor inside the remainder range.
    pub fn remainder_counts(&self) -> Vec<usize> {
        per_tensor_counts(&self.remainder_segments, self.num_tensors())
    }

    fn num_tensors(&self) -> usize {
        self.rank_segments
            .iter()
            .chain(std::iter::once(&self.remainder_segments))
            .flat_map(|segs| segs.iter().map(|s| s.tensor + 1))
            .max()
            .unwrap_or(0)
    }
}

fn segments_in_range(tensor_counts: &[usize], start: usize, end: usize) -> Vec<ShardSegment> {
    let mut segments = Vec::new();
    let mut tensor_start = 0;
    for (tensor, &count) in tensor_counts.iter().enumerate() {
        let tensor_end = tensor_start + count;
        let lo = tensor_start.max(start);
        let hi = tensor_end.min(end);
        if lo < hi {
            segments.push(ShardSegment {
                tensor,
                tensor_offset: lo - tensor_start,
                count: hi - lo,
            });
        }
        tensor_start = tensor_end;
    }
    segments
}

fn per_tensor_counts(segments: &[ShardSegment], num_tensors: usize) -> Vec<usize> {
    let mut counts = vec![0; num_tensors];
    for s in segments {
        counts[s.tensor] += s.count;
    }
    counts
}

/// ReduceScatter → cross-node allreduce → Allgather/Broadcast.
pub struct HierarchicalAllreduce;

impl CollectiveOp for HierarchicalAllreduce {
    fn enabled(
        &self,
        ctx: &ExecutionContext<'_>,
        entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        ctx.config.hierarchical_allreduce
            && ctx.topology.multi_node()
            && !entries[0].device.is_host()
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        _response: &Response,
    ) -> Result<()> {
        let local = ctx.backend.communicator(CommScope::Node)?;
        let cross = ctx.backend.communicator(CommScope::CrossNode)?;

        let dtype = entries[0].dtype;
        let device = entries[0].device;
        let elem = dtype.size_in_bytes();
        let local_size = ctx.topology.local_size as usize;
        let local_rank = ctx.topology.local_rank as usize;
        let root = local_size - 1;
        let is_root = local_rank == root;
        let homogeneous = ctx.topology.is_homogeneous();

        let entry_counts: Vec<usize> = entries.iter().map(|e| e.num_elements()).collect();
        let data_bytes: usize = entry_counts.iter().sum::<usize>() * elem;
        let use_fusion = entries.len() > 1;
        let ctx_key = context_id(entries);

        let mut local_buf = Vec::new();
        if use_fusion {
            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_IN_FUSION_BUFFER);
            let buf = ctx.fusion.buffer_mut(device, ctx_key)?;
            buf.memcpy_in(entries, ctx.adapter)?;
            ctx.timeline.activity_end_all(entries);
        } else {
            local_buf = ctx.staging.get(data_bytes);
            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_IN_HOST_BUFFER);
            unsafe {
                ctx.adapter
                    .stage_into(device, entries[0].input_ptr, &mut local_buf)?;
            }
            ctx.timeline.activity_end_all(entries);
        }

        {
            let work: &mut [u8] = if use_fusion {
                ctx.fusion.buffer_mut(device, ctx_key)?.as_mut_slice()
            } else {
                &mut local_buf
            };

            let mut num_elements = data_bytes / elem;

            // Padding keeps the divisible part balanced across local ranks
            // when fusing in a homogeneous cluster. The padded length only
            // stays inside the buffer if the threshold itself is divisible
            // by the padding unit; a misconfigured threshold must fail here
            // rather than overrun.
            if homogeneous && use_fusion {
                let div = local_size * FUSION_BUFFER_ATOMIC_UNIT;
                if work.len() % div != 0 {
                    return Err(FusorError::PreconditionError(format!(
                        "fusion threshold of {} bytes is not divisible by \
                         local_size * {FUSION_BUFFER_ATOMIC_UNIT} = {div}",
                        work.len()
                    )));
                }
                let padded_bytes = data_bytes.div_ceil(div) * div;
                work[data_bytes..padded_bytes].fill(0);
                num_elements = padded_bytes / elem;
            }

            let per_rank = if homogeneous {
                num_elements / local_size
            } else {
                0
            };
            let remainder = num_elements - per_rank * local_size;
            let div_bytes = per_rank * local_size * elem;
            let num_bytes = num_elements * elem;

            let layout = TensorShardLayout::new(&entry_counts, local_size, per_rank);
            tracing::trace!(
                per_rank,
                remainder,
                owned = ?layout.rank_counts(local_rank),
                "hierarchical split"
            );

            // Host staging buffer sized to this rank's owned byte range;
            // the node root additionally owns the remainder.
            let own_bytes = per_rank * elem + if is_root { remainder * elem } else { 0 };
            let mut own = ctx.staging.get(own_bytes);

            if per_rank > 0 {
                ctx.timeline
                    .activity_start_all(entries, activity::REDUCE_SCATTER);
                local.reduce_scatter(
                    &work[..div_bytes],
                    &mut own[..per_rank * elem],
                    per_rank,
                    dtype,
                    ReduceOp::Sum,
                )?;
                ctx.timeline.activity_end_all(entries);
            }
            if remainder > 0 {
                ctx.timeline.activity_start_all(entries, activity::REDUCE);
                local.reduce(
                    &work[div_bytes..num_bytes],
                    is_root.then(|| &mut own[per_rank * elem..]),
                    remainder,
                    dtype,
                    ReduceOp::Sum,
                    root as Rank,
                )?;
                ctx.timeline.activity_end_all(entries);
            }

            // Every shard-holding local rank reduces its own byte range
            // across nodes in parallel; the root's call carries the
            // remainder in the same combined buffer.
            let own_elements = own_bytes / elem;
            if own_elements > 0 {
                ctx.timeline
                    .activity_start_all(entries, activity::CROSS_NODE_ALLREDUCE);
                cross.allreduce(&mut own, own_elements, dtype, ReduceOp::Sum)?;
                ctx.timeline.activity_end_all(entries);
            }

            if per_rank > 0 {
                ctx.timeline.activity_start_all(entries, activity::ALLGATHER);
                let gathered = local.allgather(&own[..per_rank * elem])?;
                work[..div_bytes].copy_from_slice(&gathered);
                ctx.timeline.activity_end_all(entries);
            }
            if remainder > 0 {
                ctx.timeline.activity_start_all(entries, activity::BROADCAST);
                let mut rem_buf = if is_root {
                    own[per_rank * elem..].to_vec()
                } else {
                    Vec::new()
                };
                local.broadcast(&mut rem_buf, root as Rank)?;
                work[div_bytes..num_bytes].copy_from_slice(&rem_buf);
                ctx.timeline.activity_end_all(entries);
            }

            ctx.staging.put(own);
        }

        if use_fusion {
            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_OUT_FUSION_BUFFER);
            ctx.fusion
                .buffer_mut(device, ctx_key)?
                .memcpy_out(entries, ctx.adapter)?;
            ctx.timeline.activity_end_all(entries);
        } else {
            let e = &entries[0];
            let output = e.output_ptr.ok_or_else(|| {
                FusorError::PreconditionError(format!(
                    "allreduce entry {} has no output",
                    e.tensor_name
                ))
            })?;
            ctx.timeline
                .activity_start_all(entries, activity::MEMCPY_OUT_HOST_BUFFER);
            unsafe {
                ctx.adapter
                    .receive_to_device(device, &local_buf[..data_bytes], output)?;
            }
            ctx.timeline.activity_end_all(entries);
            ctx.staging.put(local_buf);
        }
        Ok(())
    }
}

/// Node-local gather, then one cross-node gather of whole node blocks.
/// Ranks are assigned to nodes contiguously, so concatenating node blocks
/// in node order reproduces global rank order.
pub struct HierarchicalAllgather;

impl CollectiveOp for HierarchicalAllgather {
    fn enabled(
        &self,
        ctx: &ExecutionContext<'_>,
        _entries: &[TensorTableEntry],
        _response: &Response,
    ) -> bool {
        ctx.config.hierarchical_allgather
            && ctx.topology.multi_node()
            && ctx.topology.is_homogeneous()
    }

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Result<()> {
        let local = ctx.backend.communicator(CommScope::Node)?;
        let cross = ctx.backend.communicator(CommScope::CrossNode)?;
        let e = &mut entries[0];
        let name = e.tensor_name.clone();

        let counts = allgather_byte_counts(e, response)?;
        let local_size = ctx.topology.local_size as usize;
        let node = (ctx.topology.rank - ctx.topology.local_rank) as usize / local_size;
        let node_counts = &counts[node * local_size..(node + 1) * local_size];

        let staged = unsafe {
            ctx.adapter
                .stage_for_send(e.device, e.input_ptr, e.size_in_bytes())?
        };

        ctx.timeline.activity_start(&name, activity::ALLGATHER);
        let node_block = local.allgatherv(&staged, node_counts)?;
        let block_counts: Vec<usize> = counts
            .chunks(local_size)
            .map(|chunk| chunk.iter().sum())
            .collect();
        let gathered = cross.allgatherv(&node_block, &block_counts)?;
        ctx.timeline.activity_end(&name);

        let context = e.context.as_ref().ok_or_else(|| {
            FusorError::PreconditionError(format!(
                "allgather entry {name} has no output-allocating context"
            ))
        })?;
        let output = context.allocate_output(gathered.len())?;
        e.output_ptr = Some(output);
        unsafe { ctx.adapter.receive_to_device(e.device, &gathered, output)? };
        Ok(())
    }
}
