//! Coordinator-only bookkeeping of which ranks have requested which tensor.
//!
//! A name becomes ready to negotiate once every active rank has submitted a
//! request for it; until then its requests accumulate here across cycles.
//! Mismatch detection against the recorded requests happens when the
//! response is constructed, so a bad request never poisons other names.

use std::collections::HashMap;
use std::time::Instant;

use crate::message::Request;
use crate::types::Rank;

/// Recorded requests for one tensor name, in arrival order.
pub struct MessageTableEntry {
    pub requests: Vec<Request>,
    pub first_seen: Instant,
}

impl MessageTableEntry {
    fn has_rank(&self, rank: Rank) -> bool {
        self.requests.iter().any(|r| r.request_rank == rank)
    }

    /// Ranks that have not yet requested this name.
    pub fn missing_ranks(&self, world_size: u32) -> Vec<Rank> {
        (0..world_size).filter(|r| !self.has_rank(*r)).collect()
    }
}

#[derive(Default)]
pub struct MessageTable {
    entries: HashMap<String, MessageTableEntry>,
}

impl MessageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request; returns true when all `world_size` ranks have now
    /// requested this name. A repeated request from the same rank is dropped
    /// (the per-rank duplicate-name guard makes this unreachable in normal
    /// operation).
    pub fn record(&mut self, request: Request, world_size: u32) -> bool {
        let entry = self
            .entries
            .entry(request.tensor_name.clone())
            .or_insert_with(|| MessageTableEntry {
                requests: Vec::new(),
                first_seen: Instant::now(),
            });
        if entry.has_rank(request.request_rank) {
            tracing::warn!(
                tensor = %request.tensor_name,
                rank = request.request_rank,
                "dropping repeated request from rank"
            );
            return false;
        }
        entry.requests.push(request);
        entry.requests.len() as u32 == world_size
    }

    /// Remove and return the recorded requests for `name`.
    pub fn take(&mut self, name: &str) -> Option<MessageTableEntry> {
        self.entries.remove(name)
    }

    /// Discard any partial record for `name` (cache-hit path).
    pub fn remove(&mut self, name: &str) {
        self.entries.remove(name);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Names that have been waiting on missing ranks longer than `window`,
    /// with the ranks still missing. Feeds the external stall inspector.
    pub fn stalled(&self, window: std::time::Duration, world_size: u32) -> Vec<(String, Vec<Rank>)> {
        let now = Instant::now();
        let mut out: Vec<(String, Vec<Rank>)> = self
            .entries
            .iter()
            .filter(|(_, e)| now.duration_since(e.first_seen) >= window)
            .map(|(name, e)| (name.clone(), e.missing_ranks(world_size)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::RequestType;
    use crate::types::{DataType, Device};

    fn request(rank: Rank, name: &str) -> Request {
        Request {
            request_rank: rank,
            tensor_name: name.into(),
            request_type: RequestType::Allreduce,
            dtype: DataType::F32,
            shape: vec![8],
            device: Device::Host,
            root_rank: None,
        }
    }

    #[test]
    fn test_ready_when_all_ranks_reported() {
        let mut table = MessageTable::new();
        assert!(!table.record(request(0, "t"), 3));
        assert!(!table.record(request(2, "t"), 3));
        assert!(table.record(request(1, "t"), 3));
    }

    #[test]
    fn test_repeated_rank_not_double_counted() {
        let mut table = MessageTable::new();
        assert!(!table.record(request(0, "t"), 2));
        assert!(!table.record(request(0, "t"), 2));
        assert!(table.record(request(1, "t"), 2));
    }

    #[test]
    fn test_take_returns_requests_in_arrival_order() {
        let mut table = MessageTable::new();
        table.record(request(1, "t"), 3);
        table.record(request(0, "t"), 3);
        table.record(request(2, "t"), 3);
        let entry = table.take("t").unwrap();
        let ranks: Vec<Rank> = entry.requests.iter().map(|r| r.request_rank).collect();
        assert_eq!(ranks, vec![1, 0, 2]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_missing_ranks() {
        let mut table = MessageTable::new();
        table.record(request(1, "t"), 4);
        let stalled = table.stalled(std::time::Duration::ZERO, 4);
        assert_eq!(stalled.len(), 1);
        assert_eq!(stalled[0].0, "t");
        assert_eq!(stalled[0].1, vec![0, 2, 3]);
    }

    #[test]
    fn test_stall_window_filters_fresh_entries() {
        let mut table = MessageTable::new();
        table.record(request(0, "t"), 2);
        let stalled = table.stalled(std::time::Duration::from_secs(3600), 2);
        assert!(stalled.is_empty());
    }
}
