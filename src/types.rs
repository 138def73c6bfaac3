/// Rank of a participating process in the distributed job (0-indexed).
pub type Rank = u32;

/// Data types supported by fusor for tensor operations.
///
/// fusor defines its own type enum so it remains a standalone library
/// usable by any framework adapter.
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
pub enum DataType {
    F32 = 0,
    F64 = 1,
    F16 = 2,
    BF16 = 3,
    I8 = 4,
    I32 = 5,
    I64 = 6,
    U8 = 7,
    U32 = 8,
    U64 = 9,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size_in_bytes(self) -> usize {
        match self {
            DataType::F32 | DataType::I32 | DataType::U32 => 4,
            DataType::F64 | DataType::I64 | DataType::U64 => 8,
            DataType::F16 | DataType::BF16 => 2,
            DataType::I8 | DataType::U8 => 1,
        }
    }

    /// Human-readable name.
    pub const fn name(self) -> &'static str {
        match self {
            DataType::F32 => "f32",
            DataType::F64 => "f64",
            DataType::F16 => "f16",
            DataType::BF16 => "bf16",
            DataType::I8 => "i8",
            DataType::I32 => "i32",
            DataType::I64 => "i64",
            DataType::U8 => "u8",
            DataType::U32 => "u32",
            DataType::U64 => "u64",
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reduction operations for collective communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    /// Element-wise sum across ranks.
    Sum,
    /// Element-wise minimum across ranks.
    Min,
    /// Element-wise maximum across ranks.
    Max,
}

impl std::fmt::Display for ReduceOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReduceOp::Sum => f.write_str("sum"),
            ReduceOp::Min => f.write_str("min"),
            ReduceOp::Max => f.write_str("max"),
        }
    }
}

/// The device a tensor lives on.
///
/// Execution variants use this for capability checks (the hierarchical
/// reduction path only applies to accelerator-resident tensors) and the
/// fusion buffer manager keys scratch allocations by it.
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
pub enum Device {
    /// Host (CPU) memory.
    Host,
    /// Accelerator device, identified by its ordinal on the node.
    Accelerator(u32),
}

impl Device {
    pub fn is_host(self) -> bool {
        matches!(self, Device::Host)
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Host => f.write_str("host"),
            Device::Accelerator(ordinal) => write!(f, "accelerator:{ordinal}"),
        }
    }
}

/// Describes one tensor handed to the enqueue API: a raw pointer plus the
/// metadata fusor needs to negotiate and move it. The framework adapter that
/// produced the pointer guarantees it stays valid until the completion
/// callback fires.
#[derive(Debug, Clone)]
pub struct TensorDesc {
    /// Raw pointer to the first element, in the address space of `device`.
    pub ptr: u64,
    /// Element data type.
    pub dtype: DataType,
    /// Ordered dimensions; empty means a scalar.
    pub shape: Vec<u64>,
}

impl TensorDesc {
    pub fn new(ptr: u64, dtype: DataType, shape: Vec<u64>) -> Self {
        Self { ptr, dtype, shape }
    }

    /// Total number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product::<u64>() as usize
    }

    /// Total size in bytes.
    pub fn size_in_bytes(&self) -> usize {
        self.num_elements() * self.dtype.size_in_bytes()
    }
}
