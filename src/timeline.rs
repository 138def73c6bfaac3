//! Start/end event sink for per-tensor operations and named activities.
//!
//! The actual timeline file writer lives outside the crate; the core only
//! emits events through this trait. `NoopTimeline` is the default,
//! `TracingTimeline` mirrors events onto `tracing` for debugging.

use crate::message::ResponseType;
use crate::table::TensorTableEntry;

/// Activity names emitted by the scheduler and execution layer.
pub mod activity {
    pub const INIT_FUSION_BUFFER: &str = "INIT_FUSION_BUFFER";
    pub const WAIT_FOR_DATA: &str = "WAIT_FOR_DATA";
    pub const WAIT_FOR_OTHER_TENSOR_DATA: &str = "WAIT_FOR_OTHER_TENSOR_DATA";
    pub const MEMCPY_IN_FUSION_BUFFER: &str = "MEMCPY_IN_FUSION_BUFFER";
    pub const MEMCPY_OUT_FUSION_BUFFER: &str = "MEMCPY_OUT_FUSION_BUFFER";
    pub const MEMCPY_IN_HOST_BUFFER: &str = "MEMCPY_IN_HOST_BUFFER";
    pub const MEMCPY_OUT_HOST_BUFFER: &str = "MEMCPY_OUT_HOST_BUFFER";
    pub const ALLREDUCE: &str = "ALLREDUCE";
    pub const REDUCE_SCATTER: &str = "REDUCE_SCATTER";
    pub const REDUCE: &str = "REDUCE";
    pub const CROSS_NODE_ALLREDUCE: &str = "CROSS_NODE_ALLREDUCE";
    pub const ALLGATHER: &str = "ALLGATHER";
    pub const BROADCAST: &str = "BROADCAST";
    pub const COMPRESS: &str = "COMPRESS";
    pub const DECOMPRESS: &str = "DECOMPRESS";
}

pub trait Timeline: Send + Sync {
    /// An operation on `tensor_name` has been scheduled for execution.
    fn start(&self, tensor_name: &str, response_type: ResponseType);

    /// The operation on `tensor_name` finished; `ok` reflects its status.
    fn end(&self, tensor_name: &str, ok: bool);

    /// A named activity began for `tensor_name`.
    fn activity_start(&self, tensor_name: &str, activity: &str);

    /// The current activity for `tensor_name` ended.
    fn activity_end(&self, tensor_name: &str);

    /// Marks the start of a scheduler cycle (optional).
    fn mark_cycle_start(&self) {}

    fn activity_start_all(&self, entries: &[TensorTableEntry], activity: &str) {
        for e in entries {
            self.activity_start(&e.tensor_name, activity);
        }
    }

    fn activity_end_all(&self, entries: &[TensorTableEntry]) {
        for e in entries {
            self.activity_end(&e.tensor_name);
        }
    }
}

/// Discards all events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTimeline;

impl Timeline for NoopTimeline {
    fn start(&self, _tensor_name: &str, _response_type: ResponseType) {}
    fn end(&self, _tensor_name: &str, _ok: bool) {}
    fn activity_start(&self, _tensor_name: &str, _activity: &str) {}
    fn activity_end(&self, _tensor_name: &str) {}
}

/// Emits every event as a `tracing` trace-level record.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingTimeline;

impl Timeline for TracingTimeline {
    fn start(&self, tensor_name: &str, response_type: ResponseType) {
        tracing::trace!(tensor = tensor_name, op = %response_type, "op start");
    }

    fn end(&self, tensor_name: &str, ok: bool) {
        tracing::trace!(tensor = tensor_name, ok, "op end");
    }

    fn activity_start(&self, tensor_name: &str, activity: &str) {
        tracing::trace!(tensor = tensor_name, activity, "activity start");
    }

    fn activity_end(&self, tensor_name: &str) {
        tracing::trace!(tensor = tensor_name, "activity end");
    }

    fn mark_cycle_start(&self) {
        tracing::trace!("cycle start");
    }
}
