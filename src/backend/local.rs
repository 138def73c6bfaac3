//! In-process collective backend.
//!
//! Implements every capability over shared memory, with one rendezvous slot
//! per (communicator, sequence number). Serves as the CPU fallback and as
//! the multi-rank simulation harness for tests: `LocalCluster::spawn`
//! returns one backend per simulated rank, and each rank drives its own
//! background thread against it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::backend::{CollectiveBackend, CommScope, Communicator, Topology};
use crate::error::{FusorError, Result};
use crate::reduce::reduce_slice;
use crate::types::{DataType, Rank, ReduceOp};

/// How long any one rendezvous waits for the rest of the group before the
/// call is failed. Mirrors a collective library's operation timeout.
const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Slot {
    /// Contributions keyed by group-local rank; BTreeMap keeps them in
    /// member order for concatenation.
    parts: BTreeMap<u32, Vec<u8>>,
    taken: u32,
}

#[derive(Default)]
struct ClusterShared {
    slots: Mutex<HashMap<(String, u64), Slot>>,
    slots_cv: Condvar,
    mail: Mutex<HashMap<(String, Rank, Rank), VecDeque<Vec<u8>>>>,
    mail_cv: Condvar,
}

/// Factory for a simulated multi-rank, multi-node cluster in one process.
pub struct LocalCluster;

impl LocalCluster {
    /// One backend per rank, ranks assigned to nodes contiguously according
    /// to `ranks_per_node`.
    pub fn spawn(ranks_per_node: &[u32]) -> Vec<LocalBackend> {
        let size: u32 = ranks_per_node.iter().sum();
        let shared = Arc::new(ClusterShared::default());
        let mut backends = Vec::with_capacity(size as usize);
        let mut rank = 0;
        for &node_ranks in ranks_per_node {
            for local_rank in 0..node_ranks {
                backends.push(LocalBackend {
                    topology: Topology {
                        rank,
                        size,
                        local_rank,
                        local_size: node_ranks,
                        ranks_per_node: ranks_per_node.to_vec(),
                    },
                    shared: Arc::clone(&shared),
                    comms: Mutex::new(HashMap::new()),
                });
                rank += 1;
            }
        }
        backends
    }

    /// Convenience: a single node holding all `world_size` ranks.
    pub fn spawn_single_node(world_size: u32) -> Vec<LocalBackend> {
        Self::spawn(&[world_size])
    }
}

pub struct LocalBackend {
    topology: Topology,
    shared: Arc<ClusterShared>,
    comms: Mutex<HashMap<CommScope, Arc<LocalCommunicator>>>,
}

impl LocalBackend {
    /// Global ranks belonging to the communicator at `scope`, plus its
    /// fingerprint key.
    fn members_for(&self, scope: CommScope) -> (String, Vec<Rank>) {
        let t = &self.topology;
        match scope {
            CommScope::Global => ("global".to_string(), (0..t.size).collect()),
            CommScope::Node => {
                let start = t.rank - t.local_rank;
                (
                    format!("node@{start}"),
                    (start..start + t.local_size).collect(),
                )
            }
            CommScope::CrossNode => {
                let mut members = Vec::new();
                let mut base = 0;
                for &node_ranks in &t.ranks_per_node {
                    if t.local_rank < node_ranks {
                        members.push(base + t.local_rank);
                    }
                    base += node_ranks;
                }
                (format!("cross@{}", t.local_rank), members)
            }
        }
    }
}

impl CollectiveBackend for LocalBackend {
    fn topology(&self) -> &Topology {
        &self.topology
    }

    fn communicator(&self, scope: CommScope) -> Result<Arc<dyn Communicator>> {
        let mut comms = self
            .comms
            .lock()
            .map_err(|_| FusorError::collective("communicator", "backend lock poisoned"))?;
        if let Some(comm) = comms.get(&scope) {
            return Ok(Arc::clone(comm) as Arc<dyn Communicator>);
        }
        let (key, members) = self.members_for(scope);
        let index = members
            .iter()
            .position(|&r| r == self.topology.rank)
            .ok_or_else(|| {
                FusorError::PreconditionError(format!(
                    "rank {} is not a member of the {scope} communicator",
                    self.topology.rank
                ))
            })? as u32;
        let comm = Arc::new(LocalCommunicator {
            key,
            members,
            index,
            shared: Arc::clone(&self.shared),
            seq: AtomicU64::new(0),
        });
        comms.insert(scope, Arc::clone(&comm));
        Ok(comm)
    }
}

pub struct LocalCommunicator {
    key: String,
    members: Vec<Rank>,
    index: u32,
    shared: Arc<ClusterShared>,
    seq: AtomicU64,
}

impl LocalCommunicator {
    fn lock_slots(&self, operation: &'static str) -> Result<MutexGuard<'_, HashMap<(String, u64), Slot>>> {
        self.shared
            .slots
            .lock()
            .map_err(|_| FusorError::collective(operation, "rendezvous lock poisoned"))
    }

    /// Contribute `part` and wait for every member's contribution, returned
    /// in member order. The backbone of every collective below.
    fn exchange(&self, part: Vec<u8>, operation: &'static str) -> Result<Vec<Vec<u8>>> {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let key = (self.key.clone(), seq);
        let group = self.members.len();

        let mut slots = self.lock_slots(operation)?;
        slots.entry(key.clone()).or_default().parts.insert(self.index, part);
        self.shared.slots_cv.notify_all();

        let deadline = Instant::now() + EXCHANGE_TIMEOUT;
        loop {
            if slots
                .get(&key)
                .is_some_and(|slot| slot.parts.len() == group)
            {
                break;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FusorError::collective(
                    operation,
                    format!(
                        "timed out after {}s waiting for {} group members",
                        EXCHANGE_TIMEOUT.as_secs(),
                        group
                    ),
                ));
            }
            let (guard, _) = self
                .shared
                .slots_cv
                .wait_timeout(slots, remaining)
                .map_err(|_| FusorError::collective(operation, "rendezvous lock poisoned"))?;
            slots = guard;
        }

        let slot = slots.get_mut(&key).expect("slot present while takers remain");
        let parts: Vec<Vec<u8>> = slot.parts.values().cloned().collect();
        slot.taken += 1;
        if slot.taken as usize == group {
            slots.remove(&key);
        }
        Ok(parts)
    }

    fn check_len(actual: usize, expected: usize, operation: &'static str) -> Result<()> {
        if actual != expected {
            return Err(FusorError::collective(
                operation,
                format!("buffer holds {actual} bytes, expected {expected}"),
            ));
        }
        Ok(())
    }
}

impl Communicator for LocalCommunicator {
    fn rank(&self) -> Rank {
        self.index
    }

    fn size(&self) -> u32 {
        self.members.len() as u32
    }

    fn allreduce(
        &self,
        data: &mut [u8],
        count: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        Self::check_len(data.len(), count * dtype.size_in_bytes(), "allreduce")?;
        let parts = self.exchange(data.to_vec(), "allreduce")?;
        data.copy_from_slice(&parts[0]);
        for part in &parts[1..] {
            reduce_slice(data, part, count, dtype, op)?;
        }
        Ok(())
    }

    fn reduce_scatter(
        &self,
        send: &[u8],
        recv: &mut [u8],
        count_per_rank: usize,
        dtype: DataType,
        op: ReduceOp,
    ) -> Result<()> {
        if count_per_rank == 0 {
            return Ok(());
        }
        let elem = dtype.size_in_bytes();
        let group = self.members.len();
        Self::check_len(send.len(), count_per_rank * group * elem, "reduce_scatter")?;
        Self::check_len(recv.len(), count_per_rank * elem, "reduce_scatter")?;

        let parts = self.exchange(send.to_vec(), "reduce_scatter")?;
        let mut full = parts[0].clone();
        for part in &parts[1..] {
            reduce_slice(&mut full, part, count_per_rank * group, dtype, op)?;
        }
        let offset = self.index as usize * count_per_rank * elem;
        recv.copy_from_slice(&full[offset..offset + count_per_rank * elem]);
        Ok(())
    }

    fn reduce(
        &self,
        send: &[u8],
        recv: Option<&mut [u8]>,
        count: usize,
        dtype: DataType,
        op: ReduceOp,
        root: Rank,
    ) -> Result<()> {
        Self::check_len(send.len(), count * dtype.size_in_bytes(), "reduce")?;
        let parts = self.exchange(send.to_vec(), "reduce")?;
        if self.index != root {
            return Ok(());
        }
        let recv = recv.ok_or_else(|| {
            FusorError::collective("reduce", "root rank called without a receive buffer")
        })?;
        Self::check_len(recv.len(), count * dtype.size_in_bytes(), "reduce")?;
        recv.copy_from_slice(&parts[0]);
        for part in &parts[1..] {
            reduce_slice(recv, part, count, dtype, op)?;
        }
        Ok(())
    }

    fn allgather(&self, send: &[u8]) -> Result<Vec<u8>> {
        let parts = self.exchange(send.to_vec(), "allgather")?;
        for part in &parts {
            Self::check_len(part.len(), send.len(), "allgather")?;
        }
        Ok(parts.concat())
    }

    fn allgatherv(&self, send: &[u8], counts: &[usize]) -> Result<Vec<u8>> {
        if counts.len() != self.members.len() {
            return Err(FusorError::collective(
                "allgatherv",
                format!(
                    "got {} counts for a group of {}",
                    counts.len(),
                    self.members.len()
                ),
            ));
        }
        Self::check_len(send.len(), counts[self.index as usize], "allgatherv")?;
        let parts = self.exchange(send.to_vec(), "allgatherv")?;
        for (part, &expected) in parts.iter().zip(counts) {
            Self::check_len(part.len(), expected, "allgatherv")?;
        }
        Ok(parts.concat())
    }

    fn broadcast(&self, data: &mut Vec<u8>, root: Rank) -> Result<()> {
        let part = if self.index == root {
            data.clone()
        } else {
            Vec::new()
        };
        let parts = self.exchange(part, "broadcast")?;
        if self.index != root {
            *data = parts[root as usize].clone();
        }
        Ok(())
    }

    fn send(&self, dest: Rank, data: &[u8]) -> Result<()> {
        if dest >= self.size() {
            return Err(FusorError::collective(
                "send",
                format!("destination {dest} outside group of {}", self.size()),
            ));
        }
        let mut mail = self
            .shared
            .mail
            .lock()
            .map_err(|_| FusorError::collective("send", "mailbox lock poisoned"))?;
        mail.entry((self.key.clone(), self.index, dest))
            .or_default()
            .push_back(data.to_vec());
        self.shared.mail_cv.notify_all();
        Ok(())
    }

    fn recv(&self, src: Rank) -> Result<Vec<u8>> {
        if src >= self.size() {
            return Err(FusorError::collective(
                "recv",
                format!("source {src} outside group of {}", self.size()),
            ));
        }
        let key = (self.key.clone(), src, self.index);
        let mut mail = self
            .shared
            .mail
            .lock()
            .map_err(|_| FusorError::collective("recv", "mailbox lock poisoned"))?;
        let deadline = Instant::now() + EXCHANGE_TIMEOUT;
        loop {
            if let Some(queue) = mail.get_mut(&key) {
                if let Some(data) = queue.pop_front() {
                    return Ok(data);
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(FusorError::collective(
                    "recv",
                    format!(
                        "timed out after {}s waiting for rank {src}",
                        EXCHANGE_TIMEOUT.as_secs()
                    ),
                ));
            }
            let (guard, _) = self
                .shared
                .mail_cv
                .wait_timeout(mail, remaining)
                .map_err(|_| FusorError::collective("recv", "mailbox lock poisoned"))?;
            mail = guard;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_group<F>(ranks_per_node: &[u32], f: F)
    where
        F: Fn(LocalBackend) + Send + Sync + Clone + 'static,
    {
        let backends = LocalCluster::spawn(ranks_per_node);
        let handles: Vec<_> = backends
            .into_iter()
            .map(|b| {
                let f = f.clone();
                std::thread::spawn(move || f(b))
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    fn as_bytes_mut<T>(v: &mut [T]) -> &mut [u8] {
        unsafe {
            std::slice::from_raw_parts_mut(v.as_mut_ptr() as *mut u8, std::mem::size_of_val(v))
        }
    }

    #[test]
    fn test_topology_assignment() {
        let backends = LocalCluster::spawn(&[2, 3]);
        assert_eq!(backends.len(), 5);
        assert_eq!(backends[3].topology().local_rank, 1);
        assert_eq!(backends[3].topology().local_size, 3);
        assert!(!backends[0].topology().is_homogeneous());
        assert!(backends[4].topology().multi_node());
    }

    #[test]
    fn test_cross_node_members_heterogeneous() {
        let backends = LocalCluster::spawn(&[2, 3]);
        // local_rank 2 exists only on the second node.
        let (_, members) = backends[4].members_for(CommScope::CrossNode);
        assert_eq!(members, vec![4]);
        let (_, members) = backends[2].members_for(CommScope::CrossNode);
        assert_eq!(members, vec![0, 2]);
    }

    #[test]
    fn test_allreduce_sum() {
        run_group(&[4], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            let mut data = vec![(comm.rank() + 1) as f32; 8];
            comm.allreduce(as_bytes_mut(&mut data), 8, DataType::F32, ReduceOp::Sum)
                .unwrap();
            assert_eq!(data, vec![10.0f32; 8]);
        });
    }

    #[test]
    fn test_reduce_scatter_shards() {
        run_group(&[4], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            // Every rank contributes [0, 1, 2, ..., 7]; shard r is [2r, 2r+1] * 4.
            let mut send: Vec<f32> = (0..8).map(|i| i as f32).collect();
            let mut recv = vec![0.0f32; 2];
            comm.reduce_scatter(
                as_bytes_mut(&mut send),
                as_bytes_mut(&mut recv),
                2,
                DataType::F32,
                ReduceOp::Sum,
            )
            .unwrap();
            let base = (comm.rank() * 2) as f32;
            assert_eq!(recv, vec![base * 4.0, (base + 1.0) * 4.0]);
        });
    }

    #[test]
    fn test_reduce_to_root_only() {
        run_group(&[3], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            let mut send = vec![1.0f32; 4];
            let mut recv = vec![0.0f32; 4];
            let root = 2;
            let recv_arg = if comm.rank() == root {
                Some(as_bytes_mut(&mut recv))
            } else {
                None
            };
            comm.reduce(
                as_bytes_mut(&mut send),
                recv_arg,
                4,
                DataType::F32,
                ReduceOp::Sum,
                root,
            )
            .unwrap();
            if comm.rank() == root {
                assert_eq!(recv, vec![3.0f32; 4]);
            }
        });
    }

    #[test]
    fn test_allgather_orders_by_member() {
        run_group(&[3], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            let send = vec![comm.rank() as u8; 2];
            let out = comm.allgather(&send).unwrap();
            assert_eq!(out, vec![0, 0, 1, 1, 2, 2]);
        });
    }

    #[test]
    fn test_allgatherv_uneven() {
        run_group(&[3], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            let counts = [1usize, 3, 2];
            let send = vec![comm.rank() as u8; counts[comm.rank() as usize]];
            let out = comm.allgatherv(&send, &counts).unwrap();
            assert_eq!(out, vec![0, 1, 1, 1, 2, 2]);
        });
    }

    #[test]
    fn test_broadcast_replaces_non_root() {
        run_group(&[4], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            let mut data = if comm.rank() == 1 {
                vec![9, 8, 7]
            } else {
                Vec::new()
            };
            comm.broadcast(&mut data, 1).unwrap();
            assert_eq!(data, vec![9, 8, 7]);
        });
    }

    #[test]
    fn test_send_recv_fifo() {
        run_group(&[2], |backend| {
            let comm = backend.communicator(CommScope::Global).unwrap();
            if comm.rank() == 0 {
                comm.send(1, b"first").unwrap();
                comm.send(1, b"second").unwrap();
            } else {
                assert_eq!(comm.recv(0).unwrap(), b"first");
                assert_eq!(comm.recv(0).unwrap(), b"second");
            }
        });
    }

    #[test]
    fn test_node_scope_is_local() {
        run_group(&[2, 2], |backend| {
            let node = backend.communicator(CommScope::Node).unwrap();
            assert_eq!(node.size(), 2);
            let mut data = vec![1.0f32; 2];
            node.allreduce(as_bytes_mut(&mut data), 2, DataType::F32, ReduceOp::Sum)
                .unwrap();
            // Only the two node-local ranks contribute.
            assert_eq!(data, vec![2.0f32; 2]);
        });
    }

    #[test]
    fn test_cross_node_scope() {
        run_group(&[2, 2], |backend| {
            let cross = backend.communicator(CommScope::CrossNode).unwrap();
            assert_eq!(cross.size(), 2);
            let mut data = vec![(backend.topology().rank + 1) as f32; 1];
            cross
                .allreduce(as_bytes_mut(&mut data), 1, DataType::F32, ReduceOp::Sum)
                .unwrap();
            // Ranks 0+2 or 1+3 pair up: sums are 4.0 and 6.0.
            let expected = if backend.topology().local_rank == 0 { 4.0 } else { 6.0 };
            assert_eq!(data, vec![expected]);
        });
    }
}
