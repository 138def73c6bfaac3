//! The fusor runtime: one explicitly-constructed object per process owning
//! the background negotiation/execution thread.
//!
//! The background thread exists because the underlying collective libraries
//! are not safe to call from arbitrary threads; producer threads only
//! enqueue under one mutex and return immediately. Construction spawns the
//! thread and blocks until it reports ready; `shutdown` joins it after the
//! cluster-wide terminal handshake.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{CollectiveBackend, CommScope, Topology};
use crate::compression::Compressor;
use crate::config::FusorConfig;
use crate::controller::Controller;
use crate::device::DeviceAdapter;
use crate::error::{FusorError, Result};
use crate::fusion::FusionBufferManager;
use crate::message::{Request, RequestType, Response, ResponseType};
use crate::ops::{ExecutionContext, OperationManager, context_id};
use crate::staging::StagingPool;
use crate::table::{OpContext, ReadyEvent, StatusCallback, TensorTable, TensorTableEntry};
use crate::timeline::{NoopTimeline, Timeline, activity};
use crate::types::{Device, Rank, TensorDesc};

/// Receives per-cycle allreduce volume when autotuning is enabled. The
/// tuning heuristic itself lives outside the crate.
pub trait TuningSink: Send + Sync {
    fn record_cycle(&self, tensor_names: &[String], total_bytes: u64);
}

/// Collaborators and configuration for one runtime.
pub struct FusorOptions {
    pub config: FusorConfig,
    pub backend: Arc<dyn CollectiveBackend>,
    pub adapter: Arc<dyn DeviceAdapter>,
    pub timeline: Arc<dyn Timeline>,
    pub compressor: Option<Arc<dyn Compressor>>,
    pub tuning: Option<Arc<dyn TuningSink>>,
}

impl FusorOptions {
    pub fn new(backend: Arc<dyn CollectiveBackend>, adapter: Arc<dyn DeviceAdapter>) -> Self {
        Self {
            config: FusorConfig::default(),
            backend,
            adapter,
            timeline: Arc::new(NoopTimeline),
            compressor: None,
            tuning: None,
        }
    }
}

struct PendingOps {
    table: TensorTable,
    queue: VecDeque<Request>,
}

struct SharedState {
    /// One mutex guards both the tensor table and the request queue.
    pending: Mutex<PendingOps>,
    shut_down: AtomicBool,
    initialization_done: AtomicBool,
}

fn lock_pending(shared: &SharedState) -> MutexGuard<'_, PendingOps> {
    shared
        .pending
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

pub struct Fusor {
    shared: Arc<SharedState>,
    topology: Topology,
    background: Option<thread::JoinHandle<()>>,
}

impl Fusor {
    /// Spawn the background thread and wait for it to finish initializing.
    pub fn init(options: FusorOptions) -> Result<Self> {
        let topology = options.backend.topology().clone();
        let shared = Arc::new(SharedState {
            pending: Mutex::new(PendingOps {
                table: TensorTable::new(),
                queue: VecDeque::new(),
            }),
            shut_down: AtomicBool::new(false),
            initialization_done: AtomicBool::new(false),
        });

        let thread_shared = Arc::clone(&shared);
        let background = thread::Builder::new()
            .name("fusor-background".into())
            .spawn(move || background_loop(thread_shared, options))
            .map_err(|e| {
                FusorError::UnknownError(format!("failed to spawn background thread: {e}"))
            })?;

        while !shared.initialization_done.load(Ordering::Acquire) {
            if background.is_finished() {
                let _ = background.join();
                return Err(FusorError::UnknownError(
                    "background thread exited during initialization".into(),
                ));
            }
            thread::sleep(Duration::from_millis(1));
        }

        Ok(Self {
            shared,
            topology,
            background: Some(background),
        })
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shared.shut_down.load(Ordering::Relaxed) {
            return Err(FusorError::ShutDown);
        }
        if !self.shared.initialization_done.load(Ordering::Acquire) {
            return Err(FusorError::NotInitialized);
        }
        Ok(())
    }

    pub fn rank(&self) -> Result<Rank> {
        self.ensure_running()?;
        Ok(self.topology.rank)
    }

    pub fn size(&self) -> Result<u32> {
        self.ensure_running()?;
        Ok(self.topology.size)
    }

    pub fn local_rank(&self) -> Result<Rank> {
        self.ensure_running()?;
        Ok(self.topology.local_rank)
    }

    pub fn local_size(&self) -> Result<u32> {
        self.ensure_running()?;
        Ok(self.topology.local_size)
    }

    /// Enqueue an allreduce of `tensor` into `output_ptr`. Returns
    /// immediately; the result arrives through `callback`.
    ///
    /// # Safety
    /// `tensor.ptr` and `output_ptr` must stay valid on `device` until the
    /// callback has run.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn enqueue_allreduce(
        &self,
        context: Option<Arc<dyn OpContext>>,
        tensor: TensorDesc,
        output_ptr: u64,
        ready_event: Option<Box<dyn ReadyEvent>>,
        name: &str,
        device: Device,
        callback: StatusCallback,
    ) -> Result<()> {
        let request = self.request(RequestType::Allreduce, &tensor, name, device, None);
        let entry = TensorTableEntry {
            tensor_name: name.into(),
            context,
            input_ptr: tensor.ptr,
            output_ptr: Some(output_ptr),
            dtype: tensor.dtype,
            shape: tensor.shape,
            device,
            root_rank: None,
            ready_event,
            callback: Some(callback),
        };
        self.submit(request, entry)
    }

    /// Enqueue an allgather of `tensor`. The output buffer is allocated
    /// through `context` during execution, since its size depends on every
    /// rank's first dimension.
    ///
    /// # Safety
    /// `tensor.ptr` must stay valid on `device` until the callback has run.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn enqueue_allgather(
        &self,
        context: Arc<dyn OpContext>,
        tensor: TensorDesc,
        ready_event: Option<Box<dyn ReadyEvent>>,
        name: &str,
        device: Device,
        callback: StatusCallback,
    ) -> Result<()> {
        let request = self.request(RequestType::Allgather, &tensor, name, device, None);
        let entry = TensorTableEntry {
            tensor_name: name.into(),
            context: Some(context),
            input_ptr: tensor.ptr,
            output_ptr: None,
            dtype: tensor.dtype,
            shape: tensor.shape,
            device,
            root_rank: None,
            ready_event,
            callback: Some(callback),
        };
        self.submit(request, entry)
    }

    /// Enqueue a broadcast of `tensor` from `root_rank` into `output_ptr`.
    ///
    /// # Safety
    /// `tensor.ptr` and `output_ptr` must stay valid on `device` until the
    /// callback has run. `output_ptr` may equal `tensor.ptr` on the root.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn enqueue_broadcast(
        &self,
        context: Option<Arc<dyn OpContext>>,
        tensor: TensorDesc,
        output_ptr: u64,
        root_rank: Rank,
        ready_event: Option<Box<dyn ReadyEvent>>,
        name: &str,
        device: Device,
        callback: StatusCallback,
    ) -> Result<()> {
        let request = self.request(
            RequestType::Broadcast,
            &tensor,
            name,
            device,
            Some(root_rank),
        );
        let entry = TensorTableEntry {
            tensor_name: name.into(),
            context,
            input_ptr: tensor.ptr,
            output_ptr: Some(output_ptr),
            dtype: tensor.dtype,
            shape: tensor.shape,
            device,
            root_rank: Some(root_rank),
            ready_event,
            callback: Some(callback),
        };
        self.submit(request, entry)
    }

    fn request(
        &self,
        request_type: RequestType,
        tensor: &TensorDesc,
        name: &str,
        device: Device,
        root_rank: Option<Rank>,
    ) -> Request {
        Request {
            request_rank: self.topology.rank,
            tensor_name: name.into(),
            request_type,
            dtype: tensor.dtype,
            shape: tensor.shape.clone(),
            device,
            root_rank,
        }
    }

    fn submit(&self, request: Request, entry: TensorTableEntry) -> Result<()> {
        let mut pending = lock_pending(&self.shared);
        if self.shared.shut_down.load(Ordering::Relaxed) {
            return Err(FusorError::ShutDown);
        }
        pending.table.insert(entry)?;
        tracing::trace!(
            rank = self.topology.rank,
            tensor = %request.tensor_name,
            op = %request.request_type,
            "enqueued"
        );
        pending.queue.push_back(request);
        Ok(())
    }

    /// Signal shutdown and join the background thread. The thread keeps
    /// cycling until every rank has signalled and nothing is pending, then
    /// fails all outstanding entries with a shutdown error. Idempotent.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.background.take() else {
            return;
        };
        self.shared.shut_down.store(true, Ordering::Relaxed);
        if handle.join().is_err() {
            tracing::error!("background thread panicked during shutdown");
        }
        self.shared.initialization_done.store(false, Ordering::Release);
    }
}

impl Drop for Fusor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn background_loop(shared: Arc<SharedState>, options: FusorOptions) {
    let topology = options.backend.topology().clone();
    let comm = match options.backend.communicator(CommScope::Global) {
        Ok(comm) => comm,
        Err(e) => {
            tracing::error!(error = %e, "failed to create the global communicator");
            return;
        }
    };
    let mut controller = Controller::new(topology.clone(), comm, options.config.clone());
    let op_manager = OperationManager::standard(options.compressor.clone());
    let mut fusion = FusionBufferManager::new();
    let staging = StagingPool::new();

    if topology.is_coordinator()
        && (options.config.hierarchical_allreduce || options.config.hierarchical_allgather)
        && !topology.is_homogeneous()
    {
        tracing::warn!(
            "different numbers of ranks per node degrade hierarchical \
             operations; consider assigning the same number of ranks to \
             each node or disabling hierarchical modes"
        );
    }

    shared.initialization_done.store(true, Ordering::Release);
    tracing::info!(
        rank = topology.rank,
        size = topology.size,
        local_rank = topology.local_rank,
        local_size = topology.local_size,
        "fusor initialized"
    );

    let mut last_cycle = Instant::now();
    loop {
        // Self-pace to the configured cycle time.
        let next = last_cycle + options.config.cycle_time;
        let now = Instant::now();
        if next > now {
            thread::sleep(next - now);
        }
        last_cycle = Instant::now();

        if options.config.mark_cycles_in_timeline {
            options.timeline.mark_cycle_start();
        }

        let (drained, shutdown_requested) = {
            let mut pending = lock_pending(&shared);
            let drained: Vec<Request> = pending.queue.drain(..).collect();
            (drained, shared.shut_down.load(Ordering::Relaxed))
        };

        let list = match controller.compute_response_list(drained, shutdown_requested) {
            Ok(list) => list,
            Err(e) => {
                tracing::error!(error = %e, "negotiation failed; shutting down");
                break;
            }
        };

        let tuning_data = if options.config.autotune && options.tuning.is_some() {
            Some(allreduce_volume(&shared, &list.responses))
        } else {
            None
        };

        for response in &list.responses {
            tracing::debug!(
                rank = topology.rank,
                tensors = %response.tensor_names_string(),
                op = %response.response_type,
                "processing response"
            );
            perform_operation(
                &shared,
                &topology,
                &options,
                &op_manager,
                &mut fusion,
                &staging,
                response,
            );
        }

        if let (Some((names, bytes)), Some(sink)) = (tuning_data, options.tuning.as_ref()) {
            sink.record_cycle(&names, bytes);
        }

        if list.shutdown {
            break;
        }
    }

    // Terminal drain: fail every outstanding entry exactly once.
    shared.shut_down.store(true, Ordering::Relaxed);
    let mut outstanding = {
        let mut pending = lock_pending(&shared);
        pending.queue.clear();
        pending.table.drain()
    };
    if !outstanding.is_empty() {
        tracing::debug!(
            rank = topology.rank,
            count = outstanding.len(),
            "failing outstanding entries with shutdown error"
        );
    }
    for entry in &mut outstanding {
        entry.complete(Err(FusorError::ShutDown));
    }
    tracing::info!(rank = topology.rank, "background thread exiting");
}

/// Tensor names and total input bytes of this cycle's allreduce responses,
/// for the tuning sink.
fn allreduce_volume(shared: &SharedState, responses: &[Response]) -> (Vec<String>, u64) {
    let pending = lock_pending(shared);
    let mut names = Vec::new();
    let mut total = 0u64;
    for response in responses {
        if response.response_type != ResponseType::Allreduce {
            continue;
        }
        for name in &response.tensor_names {
            if let Some(entry) = pending.table.get(name) {
                total += entry.size_in_bytes() as u64;
            }
            names.push(name.clone());
        }
    }
    (names, total)
}

/// Process one agreed response: take its entries, wait on their readiness
/// events, execute through the operation manager, and deliver callbacks.
fn perform_operation(
    shared: &SharedState,
    topology: &Topology,
    options: &FusorOptions,
    op_manager: &OperationManager,
    fusion: &mut FusionBufferManager,
    staging: &StagingPool,
    response: &Response,
) {
    let timeline = options.timeline.as_ref();

    let mut entries: Vec<TensorTableEntry> = {
        let mut pending = lock_pending(shared);
        response
            .tensor_names
            .iter()
            .filter_map(|name| {
                let entry = pending.table.take(name);
                if entry.is_none() {
                    tracing::error!(tensor = %name, "negotiated tensor missing from table");
                }
                entry
            })
            .collect()
    };
    if entries.is_empty() {
        return;
    }

    for e in &entries {
        timeline.start(&e.tensor_name, response.response_type);
    }

    if entries.len() > 1 {
        let device = entries[0].device;
        let key = context_id(&entries);
        let status = fusion.initialize_buffer(
            options.config.fusion_threshold_bytes,
            device,
            key,
            || timeline.activity_start_all(&entries, activity::INIT_FUSION_BUFFER),
            || timeline.activity_end_all(&entries),
        );
        if let Err(e) = status {
            tracing::error!(error = %e, "fusion buffer initialization failed");
            for entry in &mut entries {
                timeline.end(&entry.tensor_name, false);
                entry.complete(Err(e.clone()));
            }
            return;
        }
    }

    // Device-side readiness is observed by non-blocking polls from this one
    // loop, bounded by real device completion.
    let mut waiting: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.ready_event.is_some())
        .map(|(i, _)| i)
        .collect();
    for &i in &waiting {
        timeline.activity_start(&entries[i].tensor_name, activity::WAIT_FOR_DATA);
    }
    while !waiting.is_empty() {
        waiting.retain(|&i| {
            let e = &entries[i];
            let ready = e
                .ready_event
                .as_ref()
                .is_some_and(|event| event.try_ready());
            if ready {
                timeline.activity_end(&e.tensor_name);
                timeline.activity_start(&e.tensor_name, activity::WAIT_FOR_OTHER_TENSOR_DATA);
            }
            !ready
        });
        if !waiting.is_empty() {
            thread::sleep(Duration::from_nanos(100));
        }
    }
    for e in &entries {
        if e.ready_event.is_some() {
            timeline.activity_end(&e.tensor_name);
        }
    }

    let mut ctx = ExecutionContext {
        topology,
        backend: options.backend.as_ref(),
        adapter: options.adapter.as_ref(),
        timeline,
        fusion,
        staging,
        config: &options.config,
    };
    let status = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        op_manager.execute_operation(&mut ctx, &mut entries, response)
    }))
    .unwrap_or_else(|payload| Err(FusorError::UnknownError(panic_message(payload))));

    if status.is_err() && response.response_type != ResponseType::Error {
        tracing::error!(
            tensors = %response.tensor_names_string(),
            error = %status.as_ref().unwrap_err(),
            "operation failed"
        );
    }
    for entry in &mut entries {
        timeline.end(&entry.tensor_name, status.is_ok());
        entry.complete(status.clone());
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "execution panicked".to_string()
    }
}
