//! Wire-format message catalog for the negotiation protocol.
//!
//! `Request`/`RequestList` travel rank → coordinator; `Response`/
//! `ResponseList` travel coordinator → all ranks. Serialization uses rkyv;
//! the encoded bytes of a `ResponseList` are the consensus artifact — every
//! rank decodes the same broadcast buffer, so identical bytes imply
//! identical execution order.

use crate::error::{FusorError, Result};
use crate::types::{DataType, Device, Rank};

/// The collective operation a rank is asking for.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[repr(u8)]
pub enum RequestType {
    Allreduce = 0,
    Allgather = 1,
    Broadcast = 2,
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RequestType::Allreduce => f.write_str("allreduce"),
            RequestType::Allgather => f.write_str("allgather"),
            RequestType::Broadcast => f.write_str("broadcast"),
        }
    }
}

/// One rank's wish to process one named tensor. Immutable once created;
/// consumed by the coordinator during a single cycle.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Request {
    pub request_rank: Rank,
    pub tensor_name: String,
    pub request_type: RequestType,
    pub dtype: DataType,
    /// Ordered dimensions; empty means a scalar.
    pub shape: Vec<u64>,
    pub device: Device,
    /// Broadcast only: the rank holding the source value.
    pub root_rank: Option<Rank>,
}

impl Request {
    /// Total number of elements described by `shape`.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    /// Total tensor size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }
}

/// Everything one rank submits to the coordinator in one cycle: the requests
/// drained from its queue since the last cycle, its shutdown signal, and an
/// optional response-cache proposal.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct RequestList {
    pub requests: Vec<Request>,
    /// True once this rank has asked the cluster to shut down.
    pub shutdown: bool,
    /// Fingerprint of the drained request set, proposed when this rank's
    /// response cache already holds an agreed response list for it.
    pub cache_fingerprint: Option<u64>,
}

/// The operation the cluster agreed to perform for a fused group.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    rkyv::Archive,
    rkyv::Serialize,
    rkyv::Deserialize,
)]
#[repr(u8)]
pub enum ResponseType {
    Allreduce = 0,
    Allgather = 1,
    Broadcast = 2,
    Error = 3,
}

impl std::fmt::Display for ResponseType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseType::Allreduce => f.write_str("allreduce"),
            ResponseType::Allgather => f.write_str("allgather"),
            ResponseType::Broadcast => f.write_str("broadcast"),
            ResponseType::Error => f.write_str("error"),
        }
    }
}

/// One negotiated, fusable group of tensors. Broadcast verbatim to all
/// ranks and consumed exactly once by the execution layer.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct Response {
    pub response_type: ResponseType,
    /// Insertion order is processing order inside the fused group.
    pub tensor_names: Vec<String>,
    /// Per-rank device of the tensor, indexed by rank.
    pub devices: Vec<Device>,
    /// Allgather only: each rank's first-dimension size, indexed by rank,
    /// so receive counts and output displacements need no second exchange.
    pub tensor_sizes: Vec<u64>,
    /// Error responses only.
    pub error_message: Option<String>,
}

impl Response {
    pub fn allreduce(tensor_names: Vec<String>, devices: Vec<Device>) -> Self {
        Self {
            response_type: ResponseType::Allreduce,
            tensor_names,
            devices,
            tensor_sizes: Vec::new(),
            error_message: None,
        }
    }

    pub fn allgather(tensor_name: String, devices: Vec<Device>, tensor_sizes: Vec<u64>) -> Self {
        Self {
            response_type: ResponseType::Allgather,
            tensor_names: vec![tensor_name],
            devices,
            tensor_sizes,
            error_message: None,
        }
    }

    pub fn broadcast(tensor_name: String, devices: Vec<Device>) -> Self {
        Self {
            response_type: ResponseType::Broadcast,
            tensor_names: vec![tensor_name],
            devices,
            tensor_sizes: Vec::new(),
            error_message: None,
        }
    }

    pub fn error(tensor_name: String, message: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Error,
            tensor_names: vec![tensor_name],
            devices: Vec::new(),
            tensor_sizes: Vec::new(),
            error_message: Some(message.into()),
        }
    }

    /// Comma-joined tensor names, for log lines.
    pub fn tensor_names_string(&self) -> String {
        self.tensor_names.join(", ")
    }
}

/// The coordinator's finalized agenda for one cycle. The broadcast of this
/// list is the synchronization point of the protocol.
#[derive(Debug, Clone, PartialEq, rkyv::Archive, rkyv::Serialize, rkyv::Deserialize)]
pub struct ResponseList {
    pub responses: Vec<Response>,
    /// Terminal flag: set only when every rank signalled shutdown and no
    /// tensor names remain pending.
    pub shutdown: bool,
    /// Set when the coordinator short-circuited negotiation to a cached
    /// response list; carries the agreed fingerprint so every rank observes
    /// the same hit/miss decision.
    pub cache_hit: Option<u64>,
}

impl ResponseList {
    pub fn empty() -> Self {
        Self {
            responses: Vec::new(),
            shutdown: false,
            cache_hit: None,
        }
    }
}

pub fn encode_request_list(list: &RequestList) -> Result<Vec<u8>> {
    rkyv::to_bytes::<rkyv::rancor::Error>(list)
        .map(|b| b.to_vec())
        .map_err(|e| FusorError::EncodeFailed(e.to_string()))
}

pub fn decode_request_list(bytes: &[u8]) -> Result<RequestList> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<RequestList, rkyv::rancor::Error>(&aligned)
        .map_err(|e| FusorError::DecodeFailed(e.to_string()))
}

pub fn encode_response_list(list: &ResponseList) -> Result<Vec<u8>> {
    rkyv::to_bytes::<rkyv::rancor::Error>(list)
        .map(|b| b.to_vec())
        .map_err(|e| FusorError::EncodeFailed(e.to_string()))
}

pub fn decode_response_list(bytes: &[u8]) -> Result<ResponseList> {
    let mut aligned = rkyv::util::AlignedVec::<16>::new();
    aligned.extend_from_slice(bytes);
    rkyv::from_bytes::<ResponseList, rkyv::rancor::Error>(&aligned)
        .map_err(|e| FusorError::DecodeFailed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_request(rank: Rank, name: &str) -> Request {
        Request {
            request_rank: rank,
            tensor_name: name.into(),
            request_type: RequestType::Allreduce,
            dtype: DataType::F32,
            shape: vec![32, 16],
            device: Device::Accelerator(0),
            root_rank: None,
        }
    }

    #[test]
    fn test_request_sizes() {
        let r = sample_request(0, "grad/w");
        assert_eq!(r.num_elements(), 512);
        assert_eq!(r.size_in_bytes(), 2048);
    }

    #[test]
    fn test_request_list_roundtrip() {
        let list = RequestList {
            requests: vec![sample_request(1, "grad/w"), sample_request(1, "grad/b")],
            shutdown: false,
            cache_fingerprint: Some(0xDEADBEEF),
        };
        let bytes = encode_request_list(&list).unwrap();
        let back = decode_request_list(&bytes).unwrap();
        assert_eq!(list, back);
    }

    #[test]
    fn test_response_list_roundtrip() {
        let list = ResponseList {
            responses: vec![
                Response::allreduce(
                    vec!["grad/w".into(), "grad/b".into()],
                    vec![Device::Accelerator(0); 4],
                ),
                Response::allgather("indices".into(), vec![Device::Host; 4], vec![3, 5, 2, 7]),
                Response::error("grad/bad".into(), "mismatched shapes"),
            ],
            shutdown: true,
            cache_hit: None,
        };
        let bytes = encode_response_list(&list).unwrap();
        let back = decode_response_list(&bytes).unwrap();
        assert_eq!(list, back);
    }

    #[test]
    fn test_identical_lists_encode_identically() {
        // The consensus property depends on deterministic encoding.
        let make = || ResponseList {
            responses: vec![Response::broadcast("step".into(), vec![Device::Host; 2])],
            shutdown: false,
            cache_hit: Some(42),
        };
        assert_eq!(
            encode_response_list(&make()).unwrap(),
            encode_response_list(&make()).unwrap()
        );
    }

    #[test]
    fn test_tensor_names_string() {
        let r = Response::allreduce(vec!["a".into(), "b".into()], vec![]);
        assert_eq!(r.tensor_names_string(), "a, b");
    }
}
