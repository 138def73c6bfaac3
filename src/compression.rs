//! Gradient compression orchestration seam.
//!
//! The selection/quantization math lives outside the crate; the core only
//! needs a compress/decompress pair it can hook into the allreduce path,
//! plus a wire framing for the compressed payloads it exchanges.
//!
//! Wire format: `[k:u32][indices:k*u32][values:k*elem_size]` where `k` is
//! the number of selected elements.

use crate::types::DataType;

/// Compressed representation of a tensor.
pub struct CompressedTensor {
    /// Serialized compressed data.
    pub data: Vec<u8>,
    /// Number of elements in the original uncompressed tensor.
    pub original_count: usize,
    /// Element data type.
    pub dtype: DataType,
}

impl CompressedTensor {
    /// Number of selected elements (k) from the wire format header.
    pub fn k(&self) -> usize {
        if self.data.len() < 4 {
            return 0;
        }
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]]) as usize
    }

    /// Encode a compressed tensor from indices and values.
    pub fn encode(indices: &[u32], values: &[u8], original_count: usize, dtype: DataType) -> Self {
        let k = indices.len();
        let elem_size = dtype.size_in_bytes();
        let mut data = Vec::with_capacity(4 + k * 4 + k * elem_size);
        data.extend_from_slice(&(k as u32).to_le_bytes());
        for &idx in indices {
            data.extend_from_slice(&idx.to_le_bytes());
        }
        data.extend_from_slice(&values[..k * elem_size]);
        Self {
            data,
            original_count,
            dtype,
        }
    }

    /// Reconstruct a `CompressedTensor` from wire bytes received from a peer.
    pub fn from_wire(data: Vec<u8>, original_count: usize, dtype: DataType) -> Self {
        Self {
            data,
            original_count,
            dtype,
        }
    }

    /// Decode the index array from the wire format.
    pub fn decode_indices(&self) -> Vec<u32> {
        let k = self.k();
        let mut indices = Vec::with_capacity(k);
        for i in 0..k {
            let off = 4 + i * 4;
            indices.push(u32::from_le_bytes([
                self.data[off],
                self.data[off + 1],
                self.data[off + 2],
                self.data[off + 3],
            ]));
        }
        indices
    }

    /// Byte slice of compressed values (after the index array).
    pub fn values_bytes(&self) -> &[u8] {
        let k = self.k();
        &self.data[4 + k * 4..]
    }
}

/// Trait for gradient compressors.
///
/// The residual buffer carries error feedback between steps: before
/// selection, `residual += input`; selected positions are zeroed in the
/// residual afterwards. Callers pass a zero-filled residual on first use.
pub trait Compressor: Send + Sync {
    /// Compress `input` (raw bytes for `count` elements of `dtype`).
    fn compress(
        &self,
        input: &[u8],
        count: usize,
        dtype: DataType,
        residual: &mut [u8],
    ) -> CompressedTensor;

    /// Decompress into a pre-zeroed dense buffer of
    /// `original_count * dtype.size_in_bytes()` bytes.
    fn decompress(&self, compressed: &CompressedTensor, output: &mut [u8]);
}

/// Identity compressor: passes all elements through. Useful as the default
/// hook target and for exercising the compressed exchange path exactly.
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(
        &self,
        input: &[u8],
        count: usize,
        dtype: DataType,
        _residual: &mut [u8],
    ) -> CompressedTensor {
        let indices: Vec<u32> = (0..count as u32).collect();
        CompressedTensor::encode(&indices, input, count, dtype)
    }

    fn decompress(&self, compressed: &CompressedTensor, output: &mut [u8]) {
        let elem_size = compressed.dtype.size_in_bytes();
        let indices = compressed.decode_indices();
        let values = compressed.values_bytes();
        for (i, &idx) in indices.iter().enumerate() {
            let src_off = i * elem_size;
            let dst_off = idx as usize * elem_size;
            output[dst_off..dst_off + elem_size]
                .copy_from_slice(&values[src_off..src_off + elem_size]);
        }
    }
}
