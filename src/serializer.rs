//! The write-side engine: per-step metadata accumulation and data staging.
//!
//! A writer registers variables implicitly on first [`Serializer::marshal`]
//! and from then on owns a slot in the step's packed metadata record. Each
//! marshal either stores an inline scalar, appends an array block to the
//! variable's `MetaArray` entry, or reserves a span the caller fills in
//! place. [`Serializer::close_timestep`] flushes deferred payloads, encodes
//! the metadata (and attribute) record through the format context, and hands
//! the transport everything it needs: any newly minted meta-meta blocks, the
//! encoded blobs, and the staged data buffer.
//!
//! ## Staging strategies
//!
//! | Put | Strategy |
//! |---|---|
//! | operator attached | allocate worst case, compress in place, downsize |
//! | span requested | allocate, caller writes through [`Serializer::span_mut`] |
//! | `sync` | copy into the stager immediately |
//! | otherwise | hold the refcounted payload, stage at flush, patch offset |

use std::collections::HashMap;

use bytes::Bytes;

use crate::error::{Bp5Error, Result};
use crate::operator::OperatorRegistry;
use crate::schema::{
    format_id_bytes, FormatContext, FormatHandle, LayoutBuilder, MetaMetaInfoBlock, RecordEncoder,
    RecordLayout,
};
use crate::stager::{BufferPos, BufferV, StageSource};
use crate::types::{compute_min_max, elem_product, DataType, MemorySpace, ShapeId};

/// Fixed image size of a plain `MetaArray` field (seven u64 slots).
pub(crate) const META_ARRAY_SIZE: u64 = 7 * 8;
/// Image size with the operator extension (`DataBlockSize` slot).
pub(crate) const META_ARRAY_OP_SIZE: u64 = META_ARRAY_SIZE + 8;

/// Writer-side configuration.
#[derive(Debug, Clone)]
pub struct SerializerOptions {
    /// Statistics level; 0 disables per-block min/max maintenance.
    pub stats_level: u8,
    /// Alignment of the end-of-step pad (the transport's output block size).
    pub buffer_block_size: u64,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self { stats_level: 1, buffer_block_size: 4096 }
    }
}

/// Everything the engine layer needs to describe one put.
#[derive(Debug, Clone, Copy)]
pub struct PutSpec<'a> {
    /// Variable name (unique per writer).
    pub name: &'a str,
    /// Element type.
    pub dtype: DataType,
    /// Geometric kind.
    pub shape_id: ShapeId,
    /// Global shape, absent for local arrays.
    pub shape: Option<&'a [u64]>,
    /// Per-dimension extent of this block; empty for scalars.
    pub count: &'a [u64],
    /// Position of this block in the global array, absent for local arrays.
    pub offsets: Option<&'a [u64]>,
    /// Compression operator type string, if any. Fixed on first sight.
    pub operator: Option<&'a str>,
    /// Where the payload lives.
    pub mem_space: MemorySpace,
}

impl<'a> PutSpec<'a> {
    /// A global single value.
    pub fn scalar(name: &'a str, dtype: DataType) -> Self {
        Self {
            name,
            dtype,
            shape_id: ShapeId::GlobalValue,
            shape: None,
            count: &[],
            offsets: None,
            operator: None,
            mem_space: MemorySpace::Host,
        }
    }

    /// A per-writer single value (readers see a 1-D array of cohort size).
    pub fn local_value(name: &'a str, dtype: DataType) -> Self {
        Self { shape_id: ShapeId::LocalValue, ..Self::scalar(name, dtype) }
    }

    /// A block of a global array.
    pub fn global_array(
        name: &'a str,
        dtype: DataType,
        shape: &'a [u64],
        count: &'a [u64],
        offsets: &'a [u64],
    ) -> Self {
        Self {
            name,
            dtype,
            shape_id: ShapeId::GlobalArray,
            shape: Some(shape),
            count,
            offsets: Some(offsets),
            operator: None,
            mem_space: MemorySpace::Host,
        }
    }

    /// A local array block (no global shape, no offsets).
    pub fn local_array(name: &'a str, dtype: DataType, count: &'a [u64]) -> Self {
        Self {
            name,
            dtype,
            shape_id: ShapeId::LocalArray,
            shape: None,
            count,
            offsets: None,
            operator: None,
            mem_space: MemorySpace::Host,
        }
    }

    /// Attaches a compression operator.
    pub fn with_operator(mut self, operator: &'a str) -> Self {
        self.operator = Some(operator);
        self
    }
}

/// The value side of one marshal call.
#[derive(Debug)]
pub enum MarshalData<'a> {
    /// Little-endian scalar bytes, exactly one element long.
    Scalar(&'a [u8]),
    /// A scalar string.
    Str(&'a str),
    /// An array payload. Deferred puts keep the refcounted slice until
    /// flush; the caller must not mutate it before then.
    Array(Bytes),
}

/// One attribute's value.
#[derive(Debug)]
pub enum AttrData<'a> {
    /// Little-endian scalar bytes.
    Scalar(&'a [u8]),
    /// A scalar string.
    Str(&'a str),
    /// A packed element array.
    Array(&'a [u8]),
    /// A string array.
    StrArray(&'a [String]),
}

/// The products of one closed step, handed to the transport.
#[derive(Debug)]
pub struct TimestepInfo {
    /// Meta-meta blocks minted this step (layout changed or first step).
    pub new_meta_meta_blocks: Vec<MetaMetaInfoBlock>,
    /// The encoded metadata record.
    pub metadata: Bytes,
    /// The encoded attribute record, if attributes were marshaled.
    pub attribute_data: Option<Bytes>,
    /// The staged data payloads.
    pub data: BufferV,
}

#[derive(Debug)]
struct WriterRec {
    field_id: usize,
    meta_offset: u64,
    dim_count: u64,
    dtype: DataType,
    elem_size: u64,
    operator: Option<String>,
    has_min_max: bool,
}

#[derive(Debug, Default)]
struct MetaArrayState {
    dims: u64,
    shape: Option<Vec<u64>>,
    count: Vec<u64>,
    offsets: Option<Vec<u64>>,
    block_count: u64,
    locations: Vec<u64>,
    sizes: Option<Vec<u64>>,
    min_max: Option<Vec<u8>>,
}

#[derive(Debug)]
enum FieldState {
    Scalar(Vec<u8>),
    Str(Option<String>),
    MetaArray(MetaArrayState),
    Blob(Vec<u8>),
    StrArray(Vec<String>),
}

#[derive(Debug)]
struct DeferredExtern {
    rec_idx: usize,
    block_id: usize,
    data: Bytes,
    align: u64,
}

/// The step serializer.
#[derive(Debug)]
pub struct Serializer {
    ctx: FormatContext,
    operators: OperatorRegistry,
    options: SerializerOptions,

    recs: Vec<WriterRec>,
    rec_by_name: HashMap<String, usize>,

    meta_layout: LayoutBuilder,
    meta_format: Option<FormatHandle>,
    meta_fields: HashMap<u64, FieldState>,
    bitfield: Vec<u64>,

    attr_layout: LayoutBuilder,
    attr_fields: HashMap<u64, FieldState>,
    attr_offsets: HashMap<String, u64>,
    new_attribute: bool,

    cur_buffer: Option<BufferV>,
    prior_data_size: u64,
    deferred: Vec<DeferredExtern>,
}

impl Serializer {
    /// A serializer with the given options.
    pub fn new(options: SerializerOptions) -> Self {
        let mut meta_layout = LayoutBuilder::new("MetaData");
        meta_layout.add_field("BitFieldCount", "integer", 8);
        meta_layout.add_field("BitField", "integer[BitFieldCount]", 8);
        meta_layout.add_field("DataBlockSize", "integer", 8);
        Self {
            ctx: FormatContext::new(),
            operators: OperatorRegistry::new(),
            options,
            recs: Vec::new(),
            rec_by_name: HashMap::new(),
            meta_layout,
            meta_format: None,
            meta_fields: HashMap::new(),
            bitfield: Vec::new(),
            attr_layout: LayoutBuilder::new("Attributes"),
            attr_fields: HashMap::new(),
            attr_offsets: HashMap::new(),
            new_attribute: false,
            cur_buffer: None,
            prior_data_size: 0,
            deferred: Vec::new(),
        }
    }

    /// Access to the operator registry, for installing custom codecs.
    pub fn operators_mut(&mut self) -> &mut OperatorRegistry {
        &mut self.operators
    }

    /// Attaches a fresh data stager for the step about to begin.
    pub fn init_step(&mut self, buffer: BufferV) -> Result<()> {
        if self.cur_buffer.is_some() {
            return Err(Bp5Error::Logic("InitStep without prior Close".into()));
        }
        self.cur_buffer = Some(buffer);
        self.prior_data_size = 0;
        Ok(())
    }

    /// Swaps the data stager mid-step, returning the previous one. Deferred
    /// payloads are flushed into the outgoing buffer first.
    pub fn reinit_step_data(&mut self, buffer: BufferV, force_copy: bool) -> Result<BufferV> {
        if self.cur_buffer.is_none() {
            return Err(Bp5Error::Logic("ReinitStepData without prior Init".into()));
        }
        self.dump_deferred_blocks(force_copy)?;
        let block_size = self.options.buffer_block_size;
        let old = self.cur_buffer.as_mut().ok_or_else(|| {
            Bp5Error::Logic("ReinitStepData without prior Init".into())
        })?;
        self.prior_data_size += old.add_to_vec(StageSource::Empty, block_size, true);
        let old = std::mem::replace(old, buffer);
        Ok(old)
    }

    /// Flushes deferred payloads into the stager now.
    pub fn perform_puts(&mut self, force_copy: bool) -> Result<()> {
        self.dump_deferred_blocks(force_copy)
    }

    /// Bytes staged so far in the current buffer (diagnostics).
    pub fn staged_data_size(&self) -> u64 {
        self.cur_buffer.as_ref().map(|b| b.size()).unwrap_or(0)
    }

    fn dump_deferred_blocks(&mut self, force_copy: bool) -> Result<()> {
        let deferred = std::mem::take(&mut self.deferred);
        if deferred.is_empty() {
            return Ok(());
        }
        let buf = self
            .cur_buffer
            .as_mut()
            .ok_or_else(|| Bp5Error::Logic("Deferred flush without a data buffer".into()))?;
        for d in deferred {
            let pos = self.prior_data_size
                + buf.add_to_vec(StageSource::Shared(d.data), d.align, force_copy);
            let rec = self
                .recs
                .get(d.rec_idx)
                .ok_or_else(|| Bp5Error::Logic("Deferred put for unknown variable".into()))?;
            let Some(FieldState::MetaArray(ma)) = self.meta_fields.get_mut(&rec.meta_offset)
            else {
                return Err(Bp5Error::Logic("Deferred put without array metadata".into()));
            };
            let slot = ma.locations.get_mut(d.block_id).ok_or_else(|| {
                Bp5Error::Logic("Deferred put for an unrecorded block".into())
            })?;
            *slot = pos;
        }
        Ok(())
    }

    fn set_bit(&mut self, field_id: usize) -> bool {
        let word = field_id / 64;
        let mask = 1u64 << (field_id % 64);
        if self.bitfield.len() <= word {
            self.bitfield.resize(word + 1, 0);
        }
        let already = self.bitfield[word] & mask != 0;
        self.bitfield[word] |= mask;
        already
    }

    fn create_writer_rec(&mut self, spec: &PutSpec<'_>, dim_count: u64) -> Result<usize> {
        let elem_size =
            if spec.dtype == DataType::String { 8 } else { spec.dtype.size() };
        let wire_tag = spec.dtype.wire_tag().ok_or_else(|| {
            Bp5Error::InvalidArgument(format!(
                "Type {:?} cannot be marshaled",
                spec.dtype
            ))
        })?;
        let field_id = self.recs.len();
        let prefix = spec.shape_id.prefix();

        let (meta_offset, has_min_max) = if dim_count == 0 {
            let field_name = format!("{prefix}_{}", spec.name);
            (self.meta_layout.add_field(&field_name, wire_tag, elem_size), false)
        } else {
            let mut field_name =
                format!("{prefix}_{}_{}_{}", elem_size, spec.dtype.code(), spec.name);
            let mut type_name = String::from("MetaArray");
            let mut field_size = META_ARRAY_SIZE;
            if let Some(op) = spec.operator {
                // The codec travels in the field name so readers can find
                // the matching decompressor.
                type_name.push_str("Op");
                field_size = META_ARRAY_OP_SIZE;
                field_name.push_str(&format!("+{}O", op.to_lowercase()));
            }
            let has_mm = self.options.stats_level > 0;
            if has_mm {
                type_name.push_str(&format!("MM{elem_size}"));
                field_size += 8;
            }
            (self.meta_layout.add_field(&field_name, &type_name, field_size), has_mm)
        };

        // The layout changed; the cached format is no longer valid and will
        // be re-registered at close.
        self.meta_format = None;

        self.recs.push(WriterRec {
            field_id,
            meta_offset,
            dim_count,
            dtype: spec.dtype,
            elem_size,
            operator: spec.operator.map(str::to_lowercase),
            has_min_max,
        });
        self.rec_by_name.insert(spec.name.to_string(), field_id);
        Ok(field_id)
    }

    fn lookup_or_create(&mut self, spec: &PutSpec<'_>, dim_count: u64) -> Result<usize> {
        if spec.name.is_empty() || spec.name.contains('+') {
            return Err(Bp5Error::InvalidArgument(format!(
                "Variable name \"{}\" is empty or contains '+'",
                spec.name
            )));
        }
        if let Some(&idx) = self.rec_by_name.get(spec.name) {
            let rec = &self.recs[idx];
            if rec.dim_count != dim_count {
                return Err(Bp5Error::InvalidArgument(format!(
                    "Variable \"{}\" was registered with {} dimensions, put has {}",
                    spec.name, rec.dim_count, dim_count
                )));
            }
            if rec.dtype != spec.dtype {
                return Err(Bp5Error::InvalidArgument(format!(
                    "Variable \"{}\" was registered as {:?}, put is {:?}",
                    spec.name, rec.dtype, spec.dtype
                )));
            }
            return Ok(idx);
        }
        self.create_writer_rec(spec, dim_count)
    }

    fn validate_array_geometry(
        spec: &PutSpec<'_>,
        dim_count: u64,
        prior: Option<&MetaArrayState>,
    ) -> Result<()> {
        if spec.count.len() as u64 != dim_count {
            return Err(Bp5Error::InvalidArgument(format!(
                "Count has {} entries for a {}-dimensional variable",
                spec.count.len(),
                dim_count
            )));
        }
        for (name, dims) in [("Shape", spec.shape), ("Offsets", spec.offsets)] {
            if let Some(d) = dims {
                if d.len() as u64 != dim_count {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "{name} has {} entries for a {}-dimensional variable",
                        d.len(),
                        dim_count
                    )));
                }
            }
        }
        // A block must fit inside the shape it is being put against.
        if let (Some(shape), Some(offsets)) = (spec.shape, spec.offsets) {
            for d in 0..dim_count as usize {
                if offsets[d] + spec.count[d] > shape[d] {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "Block [offset {} count {}] exceeds shape {} in dimension {d}",
                        offsets[d], spec.count[d], shape[d]
                    )));
                }
            }
        }
        // A refined shape may grow, but must still cover every block already
        // recorded this step.
        if let (Some(shape), Some(prior)) = (spec.shape, prior) {
            if let Some(prior_offsets) = &prior.offsets {
                let dims = dim_count as usize;
                for b in 0..prior.block_count as usize {
                    for d in 0..dims {
                        let end = prior_offsets[b * dims + d] + prior.count[b * dims + d];
                        if shape[d] < end {
                            return Err(Bp5Error::InvalidArgument(format!(
                                "Shape {} in dimension {d} drops below recorded block end {end}",
                                shape[d]
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Marshals one put: resolves (or creates) the variable's record, sets
    /// its bit for the step, and stores the value or stages the block.
    ///
    /// With `sync` unset, an array payload without an operator is held as a
    /// deferred extern: its refcounted bytes are staged and its data offset
    /// patched when the step flushes.
    pub fn marshal(&mut self, spec: &PutSpec<'_>, data: MarshalData<'_>, sync: bool) -> Result<()> {
        let is_value =
            matches!(spec.shape_id, ShapeId::GlobalValue | ShapeId::LocalValue);
        let dim_count = if is_value { 0 } else { spec.count.len() as u64 };

        if dim_count == 0 {
            let rec_idx = self.lookup_or_create(spec, 0)?;
            let rec = &self.recs[rec_idx];
            let (field_id, meta_offset, elem_size, dtype) =
                (rec.field_id, rec.meta_offset, rec.elem_size, rec.dtype);
            match data {
                MarshalData::Str(s) if dtype == DataType::String => {
                    self.set_bit(field_id);
                    // Overwriting releases the prior duplicate.
                    self.meta_fields.insert(meta_offset, FieldState::Str(Some(s.to_string())));
                }
                MarshalData::Scalar(bytes) if dtype != DataType::String => {
                    if bytes.len() as u64 != elem_size {
                        return Err(Bp5Error::InvalidArgument(format!(
                            "Scalar put of {} bytes for an element size of {elem_size}",
                            bytes.len()
                        )));
                    }
                    self.set_bit(field_id);
                    self.meta_fields.insert(meta_offset, FieldState::Scalar(bytes.to_vec()));
                }
                _ => {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "Scalar put data does not match type {dtype:?}"
                    )));
                }
            }
            return Ok(());
        }

        let MarshalData::Array(bytes) = data else {
            return Err(Bp5Error::InvalidArgument(
                "Array put requires MarshalData::Array".into(),
            ));
        };
        if self.cur_buffer.is_none() {
            return Err(Bp5Error::Logic("Marshal without prior Init".into()));
        }
        let rec_idx = self.lookup_or_create(spec, dim_count)?;
        let rec = &self.recs[rec_idx];
        let (field_id, meta_offset, elem_size, dtype, has_min_max) =
            (rec.field_id, rec.meta_offset, rec.elem_size, rec.dtype, rec.has_min_max);
        let operator = rec.operator.clone();
        let elem_count = elem_product(spec.count);
        if bytes.len() as u64 != elem_count * elem_size {
            return Err(Bp5Error::InvalidArgument(format!(
                "Array put of {} bytes, geometry says {}",
                bytes.len(),
                elem_count * elem_size
            )));
        }
        let prior = match self.meta_fields.get(&meta_offset) {
            Some(FieldState::MetaArray(ma)) if ma.block_count > 0 => Some(ma),
            _ => None,
        };
        Self::validate_array_geometry(spec, dim_count, prior)?;

        let stats = if has_min_max {
            Some(
                compute_min_max(&bytes, dtype)
                    .map(|(mut min, max)| {
                        min.extend_from_slice(&max);
                        min
                    })
                    .unwrap_or_else(|| vec![0u8; (elem_size * 2) as usize]),
            )
        } else {
            None
        };

        // Staging strategy.
        let mut data_offset = 0u64;
        let mut compressed_size = None;
        let mut defer = false;
        if let Some(op_name) = operator {
            let op = self.operators.get(&op_name)?;
            let alloc = op.compress_bound(bytes.len());
            let buf = self
                .cur_buffer
                .as_mut()
                .ok_or_else(|| Bp5Error::Logic("Marshal without prior Init".into()))?;
            let pos = buf.allocate(alloc, elem_size);
            let clen = {
                let dest = buf.get_mut(&pos, alloc)?;
                op.compress(&bytes, spec.count, dtype, dest)?
            };
            buf.downsize_last_alloc(alloc, clen)?;
            data_offset = self.prior_data_size + pos.global_pos;
            compressed_size = Some(clen as u64);
        } else if sync {
            let buf = self
                .cur_buffer
                .as_mut()
                .ok_or_else(|| Bp5Error::Logic("Marshal without prior Init".into()))?;
            data_offset = self.prior_data_size
                + buf.add_to_vec(StageSource::Shared(bytes.clone()), elem_size, true);
        } else {
            defer = true;
        }

        let already = self.set_bit(field_id);
        let entry = self
            .meta_fields
            .entry(meta_offset)
            .or_insert_with(|| FieldState::MetaArray(MetaArrayState::default()));
        let FieldState::MetaArray(ma) = entry else {
            return Err(Bp5Error::Logic("Array metadata slot holds a scalar".into()));
        };
        let block_id;
        if !already || ma.block_count == 0 {
            *ma = MetaArrayState {
                dims: dim_count,
                shape: spec.shape.map(<[u64]>::to_vec),
                count: spec.count.to_vec(),
                offsets: spec.offsets.map(<[u64]>::to_vec),
                block_count: 1,
                locations: vec![data_offset],
                sizes: compressed_size.map(|s| vec![s]),
                min_max: stats,
            };
            block_id = 0;
        } else {
            if let (Some(new_shape), Some(stored)) = (spec.shape, &mut ma.shape) {
                // Writers may refine the global shape on later blocks.
                stored.copy_from_slice(new_shape);
            }
            ma.count.extend_from_slice(spec.count);
            if let (Some(new_offsets), Some(stored)) = (spec.offsets, &mut ma.offsets) {
                stored.extend_from_slice(new_offsets);
            }
            ma.block_count += 1;
            ma.locations.push(data_offset);
            if let (Some(clen), Some(sizes)) = (compressed_size, &mut ma.sizes) {
                sizes.push(clen);
            }
            if let (Some(new_mm), Some(mm)) = (stats, &mut ma.min_max) {
                mm.extend_from_slice(&new_mm);
            }
            block_id = (ma.block_count - 1) as usize;
        }

        if defer {
            self.deferred.push(DeferredExtern {
                rec_idx,
                block_id,
                data: bytes,
                align: elem_size,
            });
        }
        Ok(())
    }

    /// Reserves an in-place span for one array block and records its
    /// metadata. The caller fills the region through [`Serializer::span_mut`]
    /// before the step closes. Statistics cannot be maintained for span puts
    /// and the block's min/max slot stays at its initialized extremes.
    pub fn marshal_span(&mut self, spec: &PutSpec<'_>) -> Result<BufferPos> {
        if spec.operator.is_some() {
            return Err(Bp5Error::InvalidArgument(
                "Span puts cannot carry an operator".into(),
            ));
        }
        let dim_count = spec.count.len() as u64;
        if dim_count == 0 {
            return Err(Bp5Error::InvalidArgument("Span puts are for arrays".into()));
        }
        if self.cur_buffer.is_none() {
            return Err(Bp5Error::Logic("Marshal without prior Init".into()));
        }
        let rec_idx = self.lookup_or_create(spec, dim_count)?;
        let rec = &self.recs[rec_idx];
        let elem_count = elem_product(spec.count);
        let prior = match self.meta_fields.get(&rec.meta_offset) {
            Some(FieldState::MetaArray(ma)) if ma.block_count > 0 => Some(ma),
            _ => None,
        };
        Self::validate_array_geometry(spec, dim_count, prior)?;

        let (elem_size, has_mm, field_id, meta_offset) =
            (rec.elem_size, rec.has_min_max, rec.field_id, rec.meta_offset);
        let buf = self
            .cur_buffer
            .as_mut()
            .ok_or_else(|| Bp5Error::Logic("Marshal without prior Init".into()))?;
        let pos = buf.allocate((elem_count * elem_size) as usize, elem_size);
        let data_offset = self.prior_data_size + pos.global_pos;

        let already = self.set_bit(field_id);
        let stats = has_mm.then(|| vec![0u8; (elem_size * 2) as usize]);
        let entry = self
            .meta_fields
            .entry(meta_offset)
            .or_insert_with(|| FieldState::MetaArray(MetaArrayState::default()));
        let FieldState::MetaArray(ma) = entry else {
            return Err(Bp5Error::Logic("Array metadata slot holds a scalar".into()));
        };
        if !already || ma.block_count == 0 {
            *ma = MetaArrayState {
                dims: dim_count,
                shape: spec.shape.map(<[u64]>::to_vec),
                count: spec.count.to_vec(),
                offsets: spec.offsets.map(<[u64]>::to_vec),
                block_count: 1,
                locations: vec![data_offset],
                sizes: None,
                min_max: stats,
            };
        } else {
            if let (Some(new_shape), Some(stored)) = (spec.shape, &mut ma.shape) {
                stored.copy_from_slice(new_shape);
            }
            ma.count.extend_from_slice(spec.count);
            if let (Some(new_offsets), Some(stored)) = (spec.offsets, &mut ma.offsets) {
                stored.extend_from_slice(new_offsets);
            }
            ma.block_count += 1;
            ma.locations.push(data_offset);
            if let (Some(new_mm), Some(mm)) = (stats, &mut ma.min_max) {
                mm.extend_from_slice(&new_mm);
            }
        }
        Ok(pos)
    }

    /// The writable bytes behind a span returned by [`Serializer::marshal_span`].
    pub fn span_mut(&mut self, pos: &BufferPos, len: usize) -> Result<&mut [u8]> {
        self.cur_buffer
            .as_mut()
            .ok_or_else(|| Bp5Error::Logic("Span access without a data buffer".into()))?
            .get_mut(pos, len)
    }

    fn attr_scalar_offset(
        &mut self,
        name: &str,
        dtype: DataType,
        wire_tag: &str,
        elem_size: u64,
    ) -> u64 {
        let field_name = format!("BPg_{}_{}_{}", elem_size, dtype.code(), name);
        match self.attr_offsets.get(&field_name) {
            Some(&o) => o,
            None => {
                let o = self.attr_layout.add_field(&field_name, wire_tag, elem_size);
                self.attr_offsets.insert(field_name, o);
                o
            }
        }
    }

    /// Marshals one attribute. Attributes are re-declared every step they
    /// change; a second marshal of the same name in one step overwrites.
    pub fn marshal_attribute(
        &mut self,
        name: &str,
        dtype: DataType,
        data: AttrData<'_>,
    ) -> Result<()> {
        let wire_tag = dtype.wire_tag().ok_or_else(|| {
            Bp5Error::InvalidArgument(format!("Type {dtype:?} cannot be an attribute"))
        })?;
        let elem_size = if dtype == DataType::String { 8 } else { dtype.size() };
        self.new_attribute = true;

        match data {
            AttrData::Scalar(bytes) if dtype != DataType::String => {
                if bytes.len() as u64 != elem_size {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "Attribute \"{name}\" scalar has {} bytes, element size is {elem_size}",
                        bytes.len()
                    )));
                }
                let offset = self.attr_scalar_offset(name, dtype, wire_tag, elem_size);
                self.attr_fields.insert(offset, FieldState::Scalar(bytes.to_vec()));
            }
            AttrData::Str(s) if dtype == DataType::String => {
                let offset = self.attr_scalar_offset(name, dtype, wire_tag, elem_size);
                self.attr_fields.insert(offset, FieldState::Str(Some(s.to_string())));
            }
            AttrData::Array(bytes) if dtype != DataType::String => {
                if bytes.len() as u64 % elem_size != 0 {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "Attribute \"{name}\" array is not a multiple of the element size"
                    )));
                }
                let elem_count = bytes.len() as u64 / elem_size;
                let array_name = format!("BPG_{name}");
                let count_name = format!("{array_name}_ElemCount");
                let (count_off, data_off) = match self.attr_offsets.get(&array_name) {
                    Some(&data_off) => {
                        let count_off = *self.attr_offsets.get(&count_name).ok_or_else(|| {
                            Bp5Error::Logic("Attribute count field missing".into())
                        })?;
                        (count_off, data_off)
                    }
                    None => {
                        let count_off = self.attr_layout.add_field(&count_name, "integer", 8);
                        let data_type = format!("{wire_tag}[{count_name}]");
                        let data_off =
                            self.attr_layout.add_field(&array_name, &data_type, elem_size);
                        self.attr_offsets.insert(count_name, count_off);
                        self.attr_offsets.insert(array_name, data_off);
                        (count_off, data_off)
                    }
                };
                self.attr_fields
                    .insert(count_off, FieldState::Scalar(elem_count.to_le_bytes().to_vec()));
                self.attr_fields.insert(data_off, FieldState::Blob(bytes.to_vec()));
            }
            AttrData::StrArray(strings) if dtype == DataType::String => {
                let array_name = format!("BPG_{name}");
                let count_name = format!("{array_name}_ElemCount");
                let (count_off, data_off) = match self.attr_offsets.get(&array_name) {
                    Some(&data_off) => {
                        let count_off = *self.attr_offsets.get(&count_name).ok_or_else(|| {
                            Bp5Error::Logic("Attribute count field missing".into())
                        })?;
                        (count_off, data_off)
                    }
                    None => {
                        let count_off = self.attr_layout.add_field(&count_name, "integer", 8);
                        let data_type = format!("string[{count_name}]");
                        let data_off = self.attr_layout.add_field(&array_name, &data_type, 8);
                        self.attr_offsets.insert(count_name, count_off);
                        self.attr_offsets.insert(array_name, data_off);
                        (count_off, data_off)
                    }
                };
                self.attr_fields.insert(
                    count_off,
                    FieldState::Scalar((strings.len() as u64).to_le_bytes().to_vec()),
                );
                self.attr_fields.insert(data_off, FieldState::StrArray(strings.to_vec()));
            }
            _ => {
                return Err(Bp5Error::InvalidArgument(format!(
                    "Attribute \"{name}\" data does not match type {dtype:?}"
                )));
            }
        }
        Ok(())
    }

    fn encode_meta_array(
        enc: &mut RecordEncoder,
        offset: u64,
        ma: &MetaArrayState,
        has_op: bool,
        mm_offset: Option<u64>,
    ) -> Result<()> {
        enc.put_u64(offset, ma.dims)?;
        let shape_ptr = match &ma.shape {
            Some(s) => enc.alloc_heap_u64s(s),
            None => 0,
        };
        enc.put_u64(offset + 8, shape_ptr)?;
        enc.put_u64(offset + 16, ma.count.len() as u64)?;
        let count_ptr =
            if ma.count.is_empty() { 0 } else { enc.alloc_heap_u64s(&ma.count) };
        enc.put_u64(offset + 24, count_ptr)?;
        let offsets_ptr = match &ma.offsets {
            Some(o) => enc.alloc_heap_u64s(o),
            None => 0,
        };
        enc.put_u64(offset + 32, offsets_ptr)?;
        enc.put_u64(offset + 40, ma.block_count)?;
        let loc_ptr =
            if ma.locations.is_empty() { 0 } else { enc.alloc_heap_u64s(&ma.locations) };
        enc.put_u64(offset + 48, loc_ptr)?;
        if has_op {
            let sizes_ptr = match &ma.sizes {
                Some(s) if !s.is_empty() => enc.alloc_heap_u64s(s),
                _ => 0,
            };
            enc.put_u64(offset + 56, sizes_ptr)?;
        }
        if let Some(mm_off) = mm_offset {
            let mm_ptr = match &ma.min_max {
                Some(mm) if !mm.is_empty() => enc.alloc_heap(mm),
                _ => 0,
            };
            enc.put_u64(offset + mm_off, mm_ptr)?;
        }
        Ok(())
    }

    fn encode_record(
        &self,
        layout: &RecordLayout,
        fields: &HashMap<u64, FieldState>,
        handle: FormatHandle,
        data_block_size: u64,
    ) -> Result<Bytes> {
        let mut enc = RecordEncoder::new(layout.record_size);
        for field in &layout.fields {
            match field.name.as_str() {
                "BitFieldCount" => enc.put_u64(field.offset, self.bitfield.len() as u64)?,
                "BitField" => {
                    let ptr = if self.bitfield.is_empty() {
                        0
                    } else {
                        enc.alloc_heap_u64s(&self.bitfield)
                    };
                    enc.put_u64(field.offset, ptr)?;
                }
                "DataBlockSize" => enc.put_u64(field.offset, data_block_size)?,
                _ => match fields.get(&field.offset) {
                    None => {}
                    Some(FieldState::Scalar(bytes)) => enc.put_bytes(field.offset, bytes)?,
                    Some(FieldState::Str(s)) => {
                        let ptr = match s {
                            Some(s) => enc.alloc_heap_cstr(s),
                            None => 0,
                        };
                        enc.put_u64(field.offset, ptr)?;
                    }
                    Some(FieldState::Blob(bytes)) => {
                        let ptr = enc.alloc_heap(bytes);
                        enc.put_u64(field.offset, ptr)?;
                    }
                    Some(FieldState::StrArray(strings)) => {
                        let mut packed = Vec::new();
                        for s in strings {
                            packed.extend_from_slice(s.as_bytes());
                            packed.push(0);
                        }
                        let ptr = enc.alloc_heap(&packed);
                        enc.put_u64(field.offset, ptr)?;
                    }
                    Some(FieldState::MetaArray(ma)) => {
                        let has_op = field.type_str.starts_with("MetaArrayOp");
                        let mm_offset = field.type_str.contains("MM").then(|| {
                            if has_op { META_ARRAY_OP_SIZE } else { META_ARRAY_SIZE }
                        });
                        Self::encode_meta_array(&mut enc, field.offset, ma, has_op, mm_offset)?;
                    }
                },
            }
        }
        Ok(enc.finish(&format_id_bytes(&self.ctx, handle)?))
    }

    /// Closes the step: flushes deferred payloads, pads the data stream to
    /// the output block size, (re-)registers any changed layouts, encodes
    /// the metadata and attribute records, resets per-step state, and
    /// returns the step's products.
    pub fn close_timestep(&mut self, _timestep: u64, force_copy: bool) -> Result<TimestepInfo> {
        if self.cur_buffer.is_none() {
            return Err(Bp5Error::Logic("CloseTimestep without prior Init".into()));
        }
        self.dump_deferred_blocks(force_copy)?;

        let block_size = self.options.buffer_block_size;
        let data_block_size = {
            let buf = self
                .cur_buffer
                .as_mut()
                .ok_or_else(|| Bp5Error::Logic("CloseTimestep without prior Init".into()))?;
            self.prior_data_size + buf.add_to_vec(StageSource::Empty, block_size, true)
        };

        let mut formats = Vec::new();
        let meta_handle = match self.meta_format {
            Some(h) => h,
            None => {
                let (h, block) = self.ctx.register(self.meta_layout.build())?;
                if let Some(block) = block {
                    formats.push(block);
                }
                self.meta_format = Some(h);
                h
            }
        };
        let meta_layout = self.ctx.layout(meta_handle)?.clone();
        let metadata =
            self.encode_record(&meta_layout, &self.meta_fields, meta_handle, data_block_size)?;

        let attribute_data = if self.new_attribute && !self.attr_layout.is_empty() {
            let (h, block) = self.ctx.register(self.attr_layout.build())?;
            if let Some(block) = block {
                formats.push(block);
            }
            let layout = self.ctx.layout(h)?.clone();
            Some(self.encode_record(&layout, &self.attr_fields, h, 0)?)
        } else {
            None
        };

        // Reset per-step state: bits cleared, array entries released, scalar
        // slots zeroed, string duplicates dropped.
        self.bitfield.iter_mut().for_each(|w| *w = 0);
        for state in self.meta_fields.values_mut() {
            match state {
                FieldState::Scalar(bytes) => bytes.iter_mut().for_each(|b| *b = 0),
                FieldState::Str(s) => *s = None,
                FieldState::MetaArray(ma) => *ma = MetaArrayState::default(),
                FieldState::Blob(bytes) => bytes.clear(),
                FieldState::StrArray(strings) => strings.clear(),
            }
        }
        self.attr_layout.clear();
        self.attr_fields.clear();
        self.attr_offsets.clear();
        self.new_attribute = false;

        let data = self
            .cur_buffer
            .take()
            .ok_or_else(|| Bp5Error::Logic("CloseTimestep without prior Init".into()))?;
        self.prior_data_size = 0;

        Ok(TimestepInfo { new_meta_meta_blocks: formats, metadata, attribute_data, data })
    }
}
