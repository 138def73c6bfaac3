//! Operation execution layer.
//!
//! A small closed set of operation variants implements one capability
//! interface: `enabled` (can this variant run the given response here?) and
//! `execute`. Selection is a priority-ordered scan over enabled variants —
//! the first enabled one runs.

mod basic;
mod compressed;
mod hierarchical;

pub use basic::{BasicAllgather, BasicAllreduce, BasicBroadcast};
pub use compressed::CompressedAllreduce;
pub use hierarchical::{
    HierarchicalAllgather, HierarchicalAllreduce, ShardSegment, TensorShardLayout,
};

use std::sync::Arc;

use crate::backend::CollectiveBackend;
use crate::compression::Compressor;
use crate::config::FusorConfig;
use crate::device::DeviceAdapter;
use crate::error::{FusorError, Result};
use crate::fusion::FusionBufferManager;
use crate::message::{Response, ResponseType};
use crate::staging::StagingPool;
use crate::table::TensorTableEntry;
use crate::timeline::Timeline;

/// Everything an operation variant may touch while executing. Exclusively
/// owned by the background thread.
pub struct ExecutionContext<'a> {
    pub topology: &'a crate::backend::Topology,
    pub backend: &'a dyn CollectiveBackend,
    pub adapter: &'a dyn DeviceAdapter,
    pub timeline: &'a dyn Timeline,
    pub fusion: &'a mut FusionBufferManager,
    pub staging: &'a StagingPool,
    pub config: &'a FusorConfig,
}

/// Fusion-buffer context key for a group of entries.
pub(crate) fn context_id(entries: &[TensorTableEntry]) -> u64 {
    entries[0]
        .context
        .as_ref()
        .map(|c| c.context_id())
        .unwrap_or(0)
}

/// One operation variant.
pub trait CollectiveOp: Send + Sync {
    /// Whether this variant can execute the response in the current
    /// context. Checked in priority order; never called on error responses.
    fn enabled(
        &self,
        ctx: &ExecutionContext<'_>,
        entries: &[TensorTableEntry],
        response: &Response,
    ) -> bool;

    fn execute(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Result<()>;
}

/// Owns the variant lists and dispatches each agreed response to the first
/// enabled variant for its type.
pub struct OperationManager {
    allreduce_ops: Vec<Box<dyn CollectiveOp>>,
    allgather_ops: Vec<Box<dyn CollectiveOp>>,
    broadcast_ops: Vec<Box<dyn CollectiveOp>>,
}

impl OperationManager {
    /// The standard priority ordering: compressed (when a compressor is
    /// supplied), then hierarchical, then the single-link fallbacks.
    pub fn standard(compressor: Option<Arc<dyn Compressor>>) -> Self {
        let mut allreduce_ops: Vec<Box<dyn CollectiveOp>> = Vec::new();
        if let Some(compressor) = compressor {
            allreduce_ops.push(Box::new(CompressedAllreduce::new(compressor)));
        }
        allreduce_ops.push(Box::new(HierarchicalAllreduce));
        allreduce_ops.push(Box::new(BasicAllreduce));

        Self {
            allreduce_ops,
            allgather_ops: vec![Box::new(HierarchicalAllgather), Box::new(BasicAllgather)],
            broadcast_ops: vec![Box::new(BasicBroadcast)],
        }
    }

    /// Execute one agreed response. Error responses resolve to the
    /// negotiated error status without touching any backend.
    pub fn execute_operation(
        &self,
        ctx: &mut ExecutionContext<'_>,
        entries: &mut [TensorTableEntry],
        response: &Response,
    ) -> Result<()> {
        let ops = match response.response_type {
            ResponseType::Allreduce => &self.allreduce_ops,
            ResponseType::Allgather => &self.allgather_ops,
            ResponseType::Broadcast => &self.broadcast_ops,
            ResponseType::Error => {
                let message = response
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "negotiation failed".to_string());
                return Err(FusorError::InvalidArgument(message));
            }
        };
        for op in ops {
            if op.enabled(ctx, entries, response) {
                return op.execute(ctx, entries, response);
            }
        }
        Err(FusorError::PreconditionError(format!(
            "no enabled operation variant for {} response",
            response.response_type
        )))
    }
}
