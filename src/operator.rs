//! Pluggable block operators (compression codecs).
//!
//! Operators are opaque to the core: a `(bytes, dims, dtype) -> bytes`
//! transform plus its inverse. The serializer allocates the worst-case
//! output region up front, lets the operator fill it, and shrinks the
//! allocation to the reported size; the deserializer always fetches whole
//! compressed blocks because no codec here supports partial decode.

use std::fmt;

use crate::error::Result;
use crate::types::DataType;

#[cfg(feature = "lz4_flex")]
use crate::error::Bp5Error;

/// Interface for block compression operators.
pub trait Operator: Send + Sync + fmt::Debug {
    /// The operator type string recorded in variable metadata (lowercase).
    fn type_string(&self) -> &'static str;

    /// Worst-case compressed size for `src_len` input bytes.
    fn compress_bound(&self, src_len: usize) -> usize;

    /// Compresses one block into `dest` (at least [`Operator::compress_bound`]
    /// bytes long), returning the compressed length.
    fn compress(
        &self,
        src: &[u8],
        count: &[u64],
        dtype: DataType,
        dest: &mut [u8],
    ) -> Result<usize>;

    /// Decompresses one block into `dest` (exactly the uncompressed length),
    /// returning the decompressed length.
    fn decompress(&self, src: &[u8], dest: &mut [u8]) -> Result<usize>;
}

// --- LZ4 (Optional) ---

/// LZ4 block operator.
#[cfg(feature = "lz4_flex")]
#[derive(Debug, Clone, Copy)]
pub struct Lz4Operator;

#[cfg(feature = "lz4_flex")]
impl Operator for Lz4Operator {
    fn type_string(&self) -> &'static str {
        "lz4"
    }

    fn compress_bound(&self, src_len: usize) -> usize {
        lz4_flex::block::get_maximum_output_size(src_len)
    }

    fn compress(
        &self,
        src: &[u8],
        _count: &[u64],
        _dtype: DataType,
        dest: &mut [u8],
    ) -> Result<usize> {
        lz4_flex::block::compress_into(src, dest)
            .map_err(|e| Bp5Error::Operator(format!("lz4 compress: {e}")))
    }

    fn decompress(&self, src: &[u8], dest: &mut [u8]) -> Result<usize> {
        lz4_flex::block::decompress_into(src, dest)
            .map_err(|e| Bp5Error::Operator(format!("lz4 decompress: {e}")))
    }
}

// --- REGISTRY ---

/// Registry of operators available to one engine, keyed by type string.
#[derive(Debug)]
pub struct OperatorRegistry {
    operators: Vec<Box<dyn Operator>>,
}

impl OperatorRegistry {
    /// A registry holding the built-in operators.
    pub fn new() -> Self {
        #[allow(unused_mut)]
        let mut reg = Self { operators: Vec::new() };
        #[cfg(feature = "lz4_flex")]
        reg.register(Box::new(Lz4Operator));
        reg
    }

    /// Adds an operator. A later registration under the same type string
    /// shadows the earlier one.
    pub fn register(&mut self, op: Box<dyn Operator>) {
        self.operators.insert(0, op);
    }

    /// Finds an operator by type string (case-insensitive).
    pub fn get(&self, type_string: &str) -> Result<&dyn Operator> {
        let wanted = type_string.to_ascii_lowercase();
        self.operators
            .iter()
            .find(|op| op.type_string() == wanted)
            .map(|op| op.as_ref())
            .ok_or_else(|| {
                crate::error::Bp5Error::Operator(format!(
                    "Operator \"{type_string}\" is not registered"
                ))
            })
    }
}

impl Default for OperatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
