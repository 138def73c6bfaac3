//! Per-cycle rendezvous protocol.
//!
//! Every cycle each rank drains its local request queue and submits the
//! list to the coordinator; the coordinator merges all lists into a single
//! ordered agenda of fusable responses and broadcasts it. The broadcast is
//! the synchronization point: all ranks decode the same bytes, so all ranks
//! execute the same operations in the same order, or uniformly observe the
//! terminal shutdown flag.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{Communicator, Topology};
use crate::cache::{ResponseCache, fingerprint};
use crate::config::FusorConfig;
use crate::error::Result;
use crate::message::{
    Request, RequestList, RequestType, Response, ResponseList, decode_request_list,
    decode_response_list, encode_request_list, encode_response_list,
};
use crate::message_table::{MessageTable, MessageTableEntry};
use crate::types::DataType;

/// A constructed response plus the attributes fusion decisions need.
struct NegotiatedResponse {
    response: Response,
    dtype: Option<DataType>,
    size_bytes: usize,
}

pub struct Controller {
    topology: Topology,
    comm: Arc<dyn Communicator>,
    config: FusorConfig,
    cache: ResponseCache,
    /// Present only on the coordinator.
    message_table: Option<MessageTable>,
    last_stall_report: Instant,
    /// Cycles resolved through the response cache, as observed by this rank.
    pub cache_hits: u64,
}

impl Controller {
    pub fn new(topology: Topology, comm: Arc<dyn Communicator>, config: FusorConfig) -> Self {
        let message_table = topology.is_coordinator().then(MessageTable::new);
        let cache = ResponseCache::new(config.cache_capacity);
        Self {
            topology,
            comm,
            config,
            cache,
            message_table,
            last_stall_report: Instant::now(),
            cache_hits: 0,
        }
    }

    pub fn is_coordinator(&self) -> bool {
        self.topology.is_coordinator()
    }

    /// Run one negotiation round: submit this rank's drained requests,
    /// participate in the global exchange, and return the cluster-agreed
    /// response list. An error here is fatal for the run.
    pub fn compute_response_list(
        &mut self,
        drained: Vec<Request>,
        shutdown_requested: bool,
    ) -> Result<ResponseList> {
        let drained_names: BTreeSet<String> =
            drained.iter().map(|r| r.tensor_name.clone()).collect();
        let drained_fp = if self.cache.enabled() && !drained.is_empty() {
            Some(fingerprint(&drained))
        } else {
            None
        };
        let proposal = drained_fp.filter(|fp| self.cache.contains(*fp));

        let own = RequestList {
            requests: drained,
            shutdown: shutdown_requested,
            cache_fingerprint: proposal,
        };

        let coordinator = self.topology.coordinator_rank();
        let list = if self.is_coordinator() {
            let mut lists = Vec::with_capacity(self.topology.size as usize);
            for rank in 0..self.topology.size {
                if rank == self.topology.rank {
                    lists.push(own.clone());
                } else {
                    let bytes = self.comm.recv(rank)?;
                    lists.push(decode_request_list(&bytes)?);
                }
            }
            let list = self.negotiate(lists);
            let mut bytes = encode_response_list(&list)?;
            self.comm.broadcast(&mut bytes, coordinator)?;
            list
        } else {
            self.comm.send(coordinator, &encode_request_list(&own)?)?;
            let mut bytes = Vec::new();
            self.comm.broadcast(&mut bytes, coordinator)?;
            decode_response_list(&bytes)?
        };

        self.observe_cache_outcome(&drained_names, drained_fp, &list);
        Ok(list)
    }

    /// Merge all ranks' request lists into the agreed agenda. Coordinator
    /// only; does not touch the transport.
    fn negotiate(&mut self, lists: Vec<RequestList>) -> ResponseList {
        let world = self.topology.size;
        let all_shutdown = lists.iter().all(|l| l.shutdown);

        // Cache short-circuit: only when every rank proposed the same
        // fingerprint this cycle and the coordinator's replica holds it.
        let first_fp = lists[0].cache_fingerprint;
        if self.cache.enabled()
            && first_fp.is_some()
            && lists.iter().all(|l| l.cache_fingerprint == first_fp)
        {
            let fp = first_fp.expect("checked above");
            if let Some(cached) = self.cache.get(fp).cloned() {
                let table = self
                    .message_table
                    .as_mut()
                    .expect("coordinator owns the message table");
                for response in &cached {
                    for name in &response.tensor_names {
                        table.remove(name);
                    }
                }
                tracing::debug!(
                    fingerprint = fp,
                    responses = cached.len(),
                    "negotiation short-circuited by response cache"
                );
                // Never terminal: cached responses are progress, and the
                // terminal transition requires an empty response list.
                return ResponseList {
                    responses: cached,
                    shutdown: false,
                    cache_hit: Some(fp),
                };
            }
        }

        let table = self
            .message_table
            .as_mut()
            .expect("coordinator owns the message table");

        // Merge in rank order; a name's readiness position is deterministic
        // because the lists are always walked in the same order.
        let mut ready: Vec<String> = Vec::new();
        for list in &lists {
            for request in &list.requests {
                tracing::trace!(
                    tensor = %request.tensor_name,
                    rank = request.request_rank,
                    "recording request"
                );
                if table.record(request.clone(), world) {
                    ready.push(request.tensor_name.clone());
                }
            }
        }

        let mut negotiated = Vec::with_capacity(ready.len());
        for name in ready {
            let entry = table.take(&name).expect("ready name was recorded");
            negotiated.push(construct_response(name, entry, world));
        }
        let responses = fuse_responses(negotiated, self.config.fusion_threshold_bytes);

        // Terminal only on unanimous shutdown with nothing left to process
        // this cycle. Once every rank has signalled, its enqueue path is
        // closed, so a name still missing ranks can never become ready —
        // those entries are abandoned to the shutdown drain.
        let shutdown = all_shutdown && responses.is_empty();
        if shutdown && !table.is_empty() {
            tracing::warn!(
                abandoned = table.len(),
                "shutting down with tensors that never reached all ranks"
            );
        }

        let stalled = table.stalled(self.config.stall_warning, world);
        if !stalled.is_empty() && self.last_stall_report.elapsed() >= self.config.stall_warning {
            for (name, missing) in &stalled {
                tracing::warn!(
                    tensor = %name,
                    ?missing,
                    "tensor stalled: one or more ranks have not submitted it"
                );
            }
            self.last_stall_report = Instant::now();
        }

        ResponseList {
            responses,
            shutdown,
            cache_hit: None,
        }
    }

    /// Replicate the coordinator's cache decision locally. Insertions only
    /// happen for cycles whose agreed responses cover exactly this rank's
    /// drained set — the precondition for the fingerprint to be proposable
    /// next time — so all replicas that took part converge on the same
    /// contents.
    fn observe_cache_outcome(
        &mut self,
        drained_names: &BTreeSet<String>,
        drained_fp: Option<u64>,
        list: &ResponseList,
    ) {
        if !self.cache.enabled() {
            return;
        }
        if let Some(fp) = list.cache_hit {
            self.cache_hits += 1;
            // Refresh LRU position identically on every rank.
            let _ = self.cache.get(fp);
            return;
        }
        let Some(fp) = drained_fp else { return };
        if list.responses.is_empty() {
            return;
        }
        let clean = list
            .responses
            .iter()
            .all(|r| r.response_type != crate::message::ResponseType::Error);
        if !clean {
            return;
        }
        let resolved: BTreeSet<String> = list
            .responses
            .iter()
            .flat_map(|r| r.tensor_names.iter().cloned())
            .collect();
        if resolved == *drained_names {
            self.cache.put(fp, list.responses.clone());
        }
    }
}

/// Validate the recorded requests for one ready name and build its
/// response. A mismatch produces an error response for this tensor only.
fn construct_response(name: String, entry: MessageTableEntry, world: u32) -> NegotiatedResponse {
    let requests = entry.requests;
    let first = &requests[0];

    let error = |message: String| NegotiatedResponse {
        response: Response::error(name.clone(), message),
        dtype: None,
        size_bytes: 0,
    };

    for other in &requests[1..] {
        if other.request_type != first.request_type {
            return error(format!(
                "mismatched operations: rank {} requested {}, but rank {} requested {}",
                first.request_rank, first.request_type, other.request_rank, other.request_type
            ));
        }
        if other.dtype != first.dtype {
            return error(format!(
                "mismatched data types: rank {} sent {}, but rank {} sent {}",
                first.request_rank, first.dtype, other.request_rank, other.dtype
            ));
        }
    }

    match first.request_type {
        RequestType::Allreduce | RequestType::Broadcast => {
            for other in &requests[1..] {
                if other.shape != first.shape {
                    return error(format!(
                        "mismatched {} tensor shapes: rank {} sent {:?}, but rank {} sent {:?}",
                        first.request_type,
                        first.request_rank,
                        first.shape,
                        other.request_rank,
                        other.shape
                    ));
                }
            }
        }
        RequestType::Allgather => {
            for other in &requests[1..] {
                if other.shape.len() != first.shape.len()
                    || other.shape.get(1..) != first.shape.get(1..)
                {
                    return error(format!(
                        "mismatched allgather tensor shapes: non-first dimensions must \
                         match, rank {} sent {:?}, but rank {} sent {:?}",
                        first.request_rank, first.shape, other.request_rank, other.shape
                    ));
                }
            }
            if first.shape.is_empty() {
                return error("allgather requires at least one dimension".to_string());
            }
        }
    }

    if first.request_type == RequestType::Broadcast {
        if first.root_rank.is_none() {
            return error("broadcast requires a root rank".to_string());
        }
        for other in &requests[1..] {
            if other.root_rank != first.root_rank {
                return error(format!(
                    "mismatched broadcast root ranks: rank {} sent {:?}, but rank {} sent {:?}",
                    first.request_rank, first.root_rank, other.request_rank, other.root_rank
                ));
            }
        }
    }

    // Per-rank attributes, indexed by rank.
    let mut by_rank = requests.clone();
    by_rank.sort_by_key(|r| r.request_rank);
    debug_assert_eq!(by_rank.len(), world as usize);
    let devices = by_rank.iter().map(|r| r.device).collect();

    let (response, size_bytes) = match first.request_type {
        RequestType::Allreduce => {
            let size = first.size_in_bytes();
            (Response::allreduce(vec![name], devices), size)
        }
        RequestType::Allgather => {
            let sizes = by_rank.iter().map(|r| r.shape[0]).collect();
            (Response::allgather(name, devices, sizes), 0)
        }
        RequestType::Broadcast => (Response::broadcast(name, devices), 0),
    };

    NegotiatedResponse {
        response,
        dtype: (first.request_type == RequestType::Allreduce).then_some(first.dtype),
        size_bytes,
    }
}

/// Group consecutive ready allreduce responses up to the fusion threshold.
/// Arrival order is preserved; groups never mix response types, dtypes, or
/// device placements. Allgather, broadcast, and error responses pass
/// through unfused.
fn fuse_responses(items: Vec<NegotiatedResponse>, threshold_bytes: usize) -> Vec<Response> {
    let mut fused: Vec<NegotiatedResponse> = Vec::with_capacity(items.len());
    for item in items {
        if let (Some(dtype), Some(last)) = (item.dtype, fused.last_mut()) {
            if last.dtype == Some(dtype)
                && last.response.devices == item.response.devices
                && last.size_bytes + item.size_bytes <= threshold_bytes
            {
                last.response
                    .tensor_names
                    .extend(item.response.tensor_names);
                last.size_bytes += item.size_bytes;
                continue;
            }
        }
        fused.push(item);
    }
    fused.into_iter().map(|i| i.response).collect()
}
