//! Process-wide table of pending tensor operations.
//!
//! Producer threads insert entries through the enqueue API; the background
//! thread removes them when a negotiated response resolves them (or fails
//! them all at shutdown). Entries are exclusively owned by the table in
//! between.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{FusorError, Result};
use crate::types::{DataType, Device, Rank};

/// Completion callback for one enqueued operation. Invoked exactly once by
/// the background thread; the output tensor is only valid when the status
/// is `Ok`.
pub type StatusCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Non-blocking readiness signal for device-side tensor data.
///
/// The background thread polls `try_ready` from its single scheduling loop;
/// implementations must not block.
pub trait ReadyEvent: Send {
    fn try_ready(&self) -> bool;
}

/// Per-operation context supplied by the framework adapter.
///
/// Allgather output sizes are only known after negotiation, so the output
/// buffer is allocated through this seam during execution; the context
/// implementation owns the allocation and the caller reads it back after
/// the completion callback fires.
pub trait OpContext: Send + Sync {
    /// Allocate `size_bytes` of output storage on the entry's device and
    /// return a pointer valid until the entry's callback has run.
    fn allocate_output(&self, size_bytes: usize) -> Result<u64>;

    /// Stable identifier keying fusion buffers per framework context.
    fn context_id(&self) -> u64 {
        0
    }
}

/// One pending operation: buffers, readiness signal, completion callback.
pub struct TensorTableEntry {
    pub tensor_name: String,
    pub context: Option<Arc<dyn OpContext>>,
    /// Raw pointer to the input tensor on `device`.
    pub input_ptr: u64,
    /// Output pointer. Pre-supplied for allreduce/broadcast; populated by
    /// the execution layer for allgather.
    pub output_ptr: Option<u64>,
    pub dtype: DataType,
    pub shape: Vec<u64>,
    pub device: Device,
    /// Broadcast only.
    pub root_rank: Option<Rank>,
    pub ready_event: Option<Box<dyn ReadyEvent>>,
    pub callback: Option<StatusCallback>,
}

impl TensorTableEntry {
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }

    /// Deliver the final status, consuming the callback.
    pub fn complete(&mut self, status: Result<()>) {
        if let Some(cb) = self.callback.take() {
            cb(status);
        }
    }
}

impl std::fmt::Debug for TensorTableEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TensorTableEntry")
            .field("tensor_name", &self.tensor_name)
            .field("dtype", &self.dtype)
            .field("shape", &self.shape)
            .field("device", &self.device)
            .finish_non_exhaustive()
    }
}

/// Mapping from tensor name to its pending operation.
#[derive(Default)]
pub struct TensorTable {
    entries: HashMap<String, TensorTableEntry>,
}

impl TensorTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, rejecting names that already have an outstanding
    /// operation.
    pub fn insert(&mut self, entry: TensorTableEntry) -> Result<()> {
        if self.entries.contains_key(&entry.tensor_name) {
            return Err(FusorError::duplicate(&entry.tensor_name));
        }
        self.entries.insert(entry.tensor_name.clone(), entry);
        Ok(())
    }

    /// Remove and return the entry for `name`.
    pub fn take(&mut self, name: &str) -> Option<TensorTableEntry> {
        self.entries.remove(name)
    }

    pub fn get(&self, name: &str) -> Option<&TensorTableEntry> {
        self.entries.get(name)
    }

    /// Remove and return every entry, in no particular order. Used by the
    /// shutdown drain.
    pub fn drain(&mut self) -> Vec<TensorTableEntry> {
        self.entries.drain().map(|(_, e)| e).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }
}
