//! Shared harness for multi-rank tests: spawns one thread per simulated
//! rank, each driving its own runtime against an in-process cluster.
#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, channel};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fusor::{
    CpuAdapter, Fusor, FusorConfig, FusorOptions, LocalBackend, OpContext, ReadyEvent,
    Result, StatusCallback,
};

pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(20);

/// Run `f` once per rank on its own thread, each with a fully-initialized
/// runtime. Runtimes shut down (and reach terminal consensus) on drop.
pub fn run_cluster<F>(ranks_per_node: &[u32], config: FusorConfig, f: F)
where
    F: Fn(&mut Fusor) + Send + Sync + Clone + 'static,
{
    run_cluster_with(ranks_per_node, config, None, f);
}

pub fn run_cluster_with<F>(
    ranks_per_node: &[u32],
    config: FusorConfig,
    compressor: Option<Arc<dyn fusor::Compressor>>,
    f: F,
) where
    F: Fn(&mut Fusor) + Send + Sync + Clone + 'static,
{
    let backends = fusor::LocalCluster::spawn(ranks_per_node);
    let handles: Vec<_> = backends
        .into_iter()
        .map(|backend: LocalBackend| {
            let f = f.clone();
            let config = config.clone();
            let compressor = compressor.clone();
            std::thread::spawn(move || {
                let mut options =
                    FusorOptions::new(Arc::new(backend), Arc::new(CpuAdapter::new()));
                options.config = config;
                options.compressor = compressor;
                let mut runtime = Fusor::init(options).expect("runtime init");
                f(&mut runtime);
            })
        })
        .collect();
    for h in handles {
        h.join().expect("rank thread panicked");
    }
}

/// A status callback paired with a channel to wait on.
pub fn status_channel() -> (StatusCallback, Receiver<Result<()>>) {
    let (tx, rx): (Sender<Result<()>>, _) = channel();
    let cb: StatusCallback = Box::new(move |status| {
        tx.send(status).expect("status receiver alive");
    });
    (cb, rx)
}

/// Output-allocating context backed by a host arena. Allocations stay alive
/// for the arena's lifetime so callers can read results after completion.
#[derive(Default)]
pub struct HostArena {
    buffers: Mutex<Vec<Box<[u8]>>>,
}

impl HostArena {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Contents of the most recent allocation.
    pub fn last(&self) -> Vec<u8> {
        let buffers = self.buffers.lock().unwrap();
        buffers.last().map(|b| b.to_vec()).unwrap_or_default()
    }
}

impl OpContext for HostArena {
    fn allocate_output(&self, size_bytes: usize) -> Result<u64> {
        let mut buf = vec![0u8; size_bytes].into_boxed_slice();
        let ptr = buf.as_mut_ptr() as u64;
        self.buffers.lock().unwrap().push(buf);
        Ok(ptr)
    }
}

/// Readiness signal driven by a shared flag.
pub struct FlagEvent {
    flag: Arc<AtomicBool>,
}

impl FlagEvent {
    pub fn new() -> (Box<Self>, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (
            Box::new(Self {
                flag: Arc::clone(&flag),
            }),
            flag,
        )
    }
}

impl ReadyEvent for FlagEvent {
    fn try_ready(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}
