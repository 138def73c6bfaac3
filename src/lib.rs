pub mod backend;
pub mod cache;
pub mod compression;
pub mod config;
pub mod controller;
pub mod device;
pub mod error;
pub mod fusion;
pub mod message;
pub mod message_table;
pub mod ops;
mod reduce;
pub mod runtime;
pub mod staging;
pub mod table;
pub mod timeline;
pub mod types;

pub use backend::{CollectiveBackend, CommScope, Communicator, LocalBackend, LocalCluster, Topology};
pub use compression::{CompressedTensor, Compressor, NoCompression};
pub use config::FusorConfig;
pub use controller::Controller;
pub use device::{CpuAdapter, DeviceAdapter};
pub use error::{FusorError, Result};
pub use fusion::{FUSION_BUFFER_ATOMIC_UNIT, FusionBuffer, FusionBufferManager};
pub use message::{Request, RequestList, RequestType, Response, ResponseList, ResponseType};
pub use ops::{OperationManager, TensorShardLayout};
pub use runtime::{Fusor, FusorOptions, TuningSink};
pub use table::{OpContext, ReadyEvent, StatusCallback, TensorTable, TensorTableEntry};
pub use timeline::{NoopTimeline, Timeline, TracingTimeline};
pub use types::{DataType, Device, Rank, ReduceOp, TensorDesc};
