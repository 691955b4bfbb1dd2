//! # bp5
//!
//! A self-describing, step-oriented binary container core for scientific and
//! HPC workloads: many parallel producers emit labeled multi-dimensional
//! arrays and scalars over a sequence of steps, and independent consumers
//! later retrieve arbitrary subregions of those arrays, step by step or in
//! random-access fashion.
//!
//! ## Overview
//!
//! The crate is the format engine, not the I/O stack. It produces and
//! consumes byte vectors; moving them (local files, staging networks,
//! in-memory pipes) is the transport's job. Per step, every writer rank
//! produces two compact streams:
//!
//! - a **metadata block**: a packed, self-describing record carrying a
//!   written-variables bitfield, inline scalar values, and per-variable
//!   block geometry (shape, per-block counts and offsets, data locations,
//!   optional compressed sizes and min/max statistics), and
//! - a **data block**: the concatenated array payloads, aligned, with
//!   optional per-block compression.
//!
//! Because writer cohorts are heterogeneous (ranks may carry different
//! variable sets), every record layout travels once as a "meta-meta" block;
//! a reader can decode any rank's metadata with no out-of-band schema.
//!
//! ### Write side
//!
//! [`Serializer`] accumulates puts between [`Serializer::init_step`] and
//! [`Serializer::close_timestep`]. Array payloads are copied, compressed,
//! reserved as caller-writable spans, or held deferred (zero-copy) until the
//! step flushes. [`serializer::TimestepInfo`] hands the transport the new
//! meta-meta blocks, the encoded metadata and attribute records, and the
//! staged data. [`aggregate`] packs a whole cohort's products into one
//! contiguous buffer and breaks it back out on the far side.
//!
//! ### Read side
//!
//! [`Deserializer`] ingests the cohort's merged metadata per step, discovers
//! variables from the record layouts, and services typed reads:
//! [`Deserializer::queue_get`] resolves scalars immediately and queues array
//! selections; [`Deserializer::generate_read_requests`] plans the minimal
//! byte ranges (block intersection, whole blocks under compression);
//! [`Deserializer::finalize_gets`] decompresses and scatters each fetched
//! range into the destination with an N-dimensional strided copy, reversing
//! dimension order when writer and reader majornesses differ.
//!
//! ## Example
//!
//! ```rust
//! use bp5::{BufferV, Deserializer, DeserializerOptions, MarshalData, PutSpec,
//!           Serializer, SerializerOptions};
//! use bp5::aggregate::{breakout_contiguous_metadata, copy_metadata_to_contiguous};
//! use bp5::types::DataType;
//! use bytes::Bytes;
//!
//! # fn main() -> bp5::Result<()> {
//! // One writer, one step, one 1-D global array.
//! let mut writer = Serializer::new(SerializerOptions::default());
//! writer.init_step(BufferV::new())?;
//! let data: Vec<u8> = (0u32..8).flat_map(|v| v.to_le_bytes()).collect();
//! writer.marshal(
//!     &PutSpec::global_array("x", DataType::UInt32, &[8], &[8], &[0]),
//!     MarshalData::Array(Bytes::from(data)),
//!     false,
//! )?;
//! let step = writer.close_timestep(0, true)?;
//!
//! // Transport: aggregate, ship, break out.
//! let packed = copy_metadata_to_contiguous(
//!     &step.new_meta_meta_blocks,
//!     &[step.metadata.clone()],
//!     &[],
//!     &[step.data.size()],
//!     &[0],
//! );
//! let broken = breakout_contiguous_metadata(&Bytes::from(packed), 1)?;
//!
//! // Reader: install, select, read.
//! let mut reader = Deserializer::new(DeserializerOptions::default());
//! for mm in &broken.unique_meta_meta_blocks {
//!     reader.install_meta_meta_data(mm)?;
//! }
//! reader.setup_for_step(0, 1);
//! reader.install_meta_data(broken.metadata_blocks[0].clone(), 0, 0)?;
//! let var = reader.var("x").expect("discovered");
//! reader.set_selection(var, &[2], &[3])?;
//! let (handle, _) = reader.queue_get(var)?;
//! let (reads, _max) = reader.generate_read_requests(true)?;
//!
//! // Transport: serve each read from the writer's data stream.
//! let stream = step.data.to_vec();
//! let mut served = Vec::new();
//! for mut rr in reads {
//!     let at = rr.start_offset as usize;
//!     rr.destination = Some(stream[at..at + rr.read_length as usize].to_vec());
//!     served.push(rr);
//! }
//! reader.finalize_gets(served)?;
//! let out = reader.take_data(handle).expect("filled");
//! assert_eq!(out.len(), 12);
//! # Ok(())
//! # }
//! ```
//!
//! ## Concurrency
//!
//! Engines are single-threaded; parallelism lives in the rank structure, not
//! in threads. The one shared resource is the read-side decompression path,
//! which is serialized by a mutex because codecs are not required to be
//! re-entrant.

#![deny(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::panic)]
#![warn(missing_docs)]

// --- PUBLIC API MODULES ---
pub mod aggregate;
pub mod deserializer;
pub mod error;
pub mod ndcopy;
pub mod operator;
pub mod schema;
pub mod serializer;
pub mod stager;
pub mod types;

// --- RE-EXPORTS ---

pub use deserializer::{
    AttrValue, Deserializer, DeserializerOptions, GetHandle, MinBlockInfo, MinVarInfo,
    ReadRequest, VarId, VariableInfo, ALL_STEPS,
};
pub use error::{Bp5Error, Result};
pub use operator::{Operator, OperatorRegistry};
pub use schema::MetaMetaInfoBlock;
pub use serializer::{
    AttrData, MarshalData, PutSpec, Serializer, SerializerOptions, TimestepInfo,
};
pub use stager::{BufferPos, BufferV, StageSource};
pub use types::{DataType, MemorySpace, MinMaxStruct, ScalarValue, ShapeId};

#[cfg(feature = "lz4_flex")]
pub use operator::Lz4Operator;

/// Constants used throughout the library.
pub mod constants {
    /// Default alignment of the end-of-step pad.
    pub const DEFAULT_BUFFER_BLOCK_SIZE: u64 = 4096;
}
