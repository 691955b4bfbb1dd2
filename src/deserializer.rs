//! The read-side engine: metadata installation, read planning, and typed
//! subarray extraction.
//!
//! A transport hands the deserializer each writer's encoded metadata for a
//! step (plus any previously-unseen meta-meta blocks). Variables are
//! discovered on first sight from the record layouts themselves; per-writer
//! block geometry is then read directly out of the installed blobs, in
//! place. `queue_get` satisfies scalars immediately from metadata and queues
//! array requests; `generate_read_requests` intersects every queued
//! selection against every writer's blocks and returns the minimal byte
//! ranges to fetch; `finalize_get` decompresses where needed and scatters
//! each fetched range into the destination buffer with an N-d copy.
//!
//! ## Modes
//!
//! In streaming mode only the current step's metadata is live and the
//! user-visible variable set is purged between steps. In random-access mode
//! every step's metadata and control state is retained, and step selections
//! address any previously installed step.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::Mutex;

use bytes::Bytes;

use crate::error::{Bp5Error, Result};
use crate::ndcopy::{intersection_start_count, linear_index, nd_copy};
use crate::operator::OperatorRegistry;
use crate::schema::{
    dump_record, read_cstr, read_u64, read_u64_array, FormatContext, FormatHandle,
    MetaMetaInfoBlock, RECORD_IMAGE_BASE,
};
use crate::serializer::{META_ARRAY_OP_SIZE, META_ARRAY_SIZE};
use crate::types::{elem_product, DataType, MemorySpace, MinMaxStruct, ShapeId};

/// Step sentinel: fold statistics over every available step.
pub const ALL_STEPS: u64 = u64::MAX;

/// Reader-side configuration.
#[derive(Debug, Clone)]
pub struct DeserializerOptions {
    /// Majorness the writer cohort stored its dimension tuples in.
    pub writer_is_row_major: bool,
    /// Majorness the reading application expects.
    pub reader_is_row_major: bool,
    /// Retain all steps and allow arbitrary step selections.
    pub random_access: bool,
}

impl Default for DeserializerOptions {
    fn default() -> Self {
        Self { writer_is_row_major: true, reader_is_row_major: true, random_access: false }
    }
}

/// Opaque handle to a discovered variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VarId(pub(crate) usize);

/// Opaque handle to a queued get's destination buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GetHandle(pub(crate) usize);

/// A reader-visible snapshot of one variable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableInfo {
    /// Variable name as the writer declared it.
    pub name: String,
    /// Element type.
    pub dtype: DataType,
    /// The writer-side geometric kind.
    pub shape_id: ShapeId,
    /// Dimensionality (local values appear as 1-D).
    pub dims: u64,
    /// The global shape, when one exists.
    pub shape: Option<Vec<u64>>,
    /// Steps on which this variable has appeared.
    pub available_steps: u64,
}

/// One attribute's installed value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    /// A scalar string.
    Str(String),
    /// A string array.
    StrArray(Vec<String>),
    /// A scalar, as little-endian element bytes.
    Data {
        /// Element type.
        dtype: DataType,
        /// The element bytes.
        bytes: Vec<u8>,
    },
    /// A packed element array.
    DataArray {
        /// Element type.
        dtype: DataType,
        /// The packed elements.
        bytes: Vec<u8>,
        /// Number of elements.
        elem_count: u64,
    },
}

/// One byte range the transport must fetch.
#[derive(Debug)]
pub struct ReadRequest {
    /// Step the range belongs to.
    pub timestep: u64,
    /// Writer whose data stream holds the range.
    pub writer_rank: usize,
    /// Byte offset inside that writer's data stream.
    pub start_offset: u64,
    /// Bytes to read.
    pub read_length: u64,
    /// Filled by the transport (pre-allocated when temp buffers were
    /// requested); exactly `read_length` bytes.
    pub destination: Option<Vec<u8>>,
    /// Offset of the fetched range inside its (virtual) whole block.
    pub offset_in_block: u64,
    /// Index of the pending request this read serves.
    pub req_index: usize,
    /// The writer-local block the range comes from.
    pub block_id: u64,
    /// Opaque slot for the transport's own bookkeeping.
    pub internal: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum SelType {
    #[default]
    BoundingBox,
    WriteBlock,
}

#[derive(Debug, Clone)]
struct Selection {
    sel_type: SelType,
    start: Option<Vec<u64>>,
    count: Option<Vec<u64>>,
    block_id: u64,
    steps_start: u64,
    steps_count: u64,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            sel_type: SelType::BoundingBox,
            start: None,
            count: None,
            block_id: 0,
            steps_start: 0,
            steps_count: 1,
        }
    }
}

#[derive(Debug)]
struct VarRec {
    name: String,
    var_num: usize,
    dtype: DataType,
    elem_size: u64,
    dim_count: u64,
    orig_shape_id: ShapeId,
    operator: Option<String>,
    min_max_offset: Option<u64>,
    global_dims: Option<Vec<u64>>,

    // Streaming-mode per-writer state; 0 marks "not written this step".
    per_writer_meta_offset: Vec<u64>,
    per_writer_block_start: Vec<u64>,

    first_ts_seen: Option<u64>,
    last_ts_added: Option<u64>,
    available_steps: u64,
    abs_step_from_rel: Vec<u64>,

    created: bool,
    available: bool,
    // Reader handle geometry (count == shape for global arrays).
    start: Vec<u64>,
    count: Vec<u64>,
    sel: Selection,
}

#[derive(Debug, Clone)]
struct ControlField {
    field_offset: u64,
    orig_shape_id: ShapeId,
    var: usize,
    is_array: bool,
}

#[derive(Debug, Default)]
struct ControlInfo {
    controls: Vec<ControlField>,
    meta_field_offset: Vec<u64>,
    ci_var_index: Vec<usize>,
}

#[derive(Debug)]
enum MetaBlob {
    Shared(Bytes),
    Owned(Vec<u8>),
}

impl MetaBlob {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Shared(b) => b.as_ref(),
            Self::Owned(v) => v.as_slice(),
        }
    }

    fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        if let Self::Shared(b) = self {
            *self = Self::Owned(b.to_vec());
        }
        match self {
            Self::Owned(v) => v,
            // Shared was just replaced by Owned above
            Self::Shared(_) => unreachable!(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReqType {
    Global,
    Local,
}

#[derive(Debug, Clone)]
struct ArrayRequest {
    var: usize,
    req_type: ReqType,
    step: u64,
    block_id: u64,
    start: Option<Vec<u64>>,
    count: Option<Vec<u64>>,
    handle: usize,
    dest_offset: u64,
    mem_space: MemorySpace,
}

// --- FIELD NAME / TYPE PARSING ---

fn parse_field_type(type_str: &str) -> Result<(bool, bool)> {
    let rest = type_str.strip_prefix("MetaArray").ok_or_else(|| {
        Bp5Error::Format(format!("Array field type \"{type_str}\" is not a MetaArray"))
    })?;
    let (has_op, rest) = match rest.strip_prefix("Op") {
        Some(r) => (true, r),
        None => (false, rest),
    };
    if rest.is_empty() {
        return Ok((has_op, false));
    }
    let mm = rest.strip_prefix("MM").ok_or_else(|| {
        Bp5Error::Format(format!("Unrecognized MetaArray suffix in \"{type_str}\""))
    })?;
    if mm.is_empty() || !mm.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Bp5Error::Format(format!(
            "Unrecognized MetaArray suffix in \"{type_str}\""
        )));
    }
    Ok((has_op, true))
}

/// Parses `{size}_{code}_{rest}` out of a field name past its prefix.
fn parse_sized_name(tail: &str) -> Result<(u64, u32, &str)> {
    let mut parts = tail.splitn(3, '_');
    let size = parts
        .next()
        .and_then(|s| s.parse::<u64>().ok())
        .ok_or_else(|| Bp5Error::Format(format!("Unparseable field name \"{tail}\"")))?;
    let code = parts
        .next()
        .and_then(|s| s.parse::<u32>().ok())
        .ok_or_else(|| Bp5Error::Format(format!("Unparseable field name \"{tail}\"")))?;
    let rest = parts
        .next()
        .ok_or_else(|| Bp5Error::Format(format!("Unparseable field name \"{tail}\"")))?;
    Ok((size, code, rest))
}

/// Splits the optional `+{operator}O` suffix off an array variable name.
fn split_operator_suffix(name: &str) -> Result<(&str, Option<&str>)> {
    match name.find('+') {
        None => Ok((name, None)),
        Some(at) => {
            let suffix = &name[at + 1..];
            let op = suffix.strip_suffix('O').ok_or_else(|| {
                Bp5Error::Format(format!("Unrecognized name suffix in \"{name}\""))
            })?;
            if op.is_empty() || op.contains('+') {
                return Err(Bp5Error::Format(format!(
                    "Unrecognized name suffix in \"{name}\""
                )));
            }
            Ok((&name[..at], Some(op)))
        }
    }
}

fn field_prefix(name: &str) -> Result<ShapeId> {
    let bytes = name.as_bytes();
    if bytes.len() < 5 || !name.starts_with("BP") || bytes[3] != b'_' {
        return Err(Bp5Error::Format(format!("Unparseable metadata field name \"{name}\"")));
    }
    Ok(ShapeId::from_prefix_char(bytes[2]))
}

// --- PACKED META-ARRAY ACCESS ---

fn ma_dims(blob: &[u8], base: u64) -> Result<u64> {
    read_u64(blob, base)
}

fn ma_db_count(blob: &[u8], base: u64) -> Result<u64> {
    read_u64(blob, base + 16)
}

fn ma_shape(blob: &[u8], base: u64, dims: u64) -> Result<Option<Vec<u64>>> {
    let ptr = read_u64(blob, base + 8)?;
    read_u64_array(blob, ptr, dims)
}

fn ma_dim_group(blob: &[u8], base: u64, field: u64, dims: u64, block: u64) -> Result<Option<Vec<u64>>> {
    let ptr = read_u64(blob, base + field)?;
    if ptr == 0 {
        return Ok(None);
    }
    read_u64_array(blob, ptr + block * dims * 8, dims)
}

fn ma_count_block(blob: &[u8], base: u64, dims: u64, block: u64) -> Result<Vec<u64>> {
    ma_dim_group(blob, base, 24, dims, block)?
        .ok_or_else(|| Bp5Error::Format("Array metadata is missing its Count".into()))
}

fn ma_offsets_block(blob: &[u8], base: u64, dims: u64, block: u64) -> Result<Option<Vec<u64>>> {
    ma_dim_group(blob, base, 32, dims, block)
}

fn ma_location(blob: &[u8], base: u64, block: u64) -> Result<u64> {
    let ptr = read_u64(blob, base + 48)?;
    read_u64(blob, ptr + block * 8)
}

fn ma_data_block_size(blob: &[u8], base: u64, block: u64) -> Result<u64> {
    let ptr = read_u64(blob, base + 56)?;
    read_u64(blob, ptr + block * 8)
}

fn ma_min_max(
    blob: &[u8],
    base: u64,
    mm_offset: u64,
    elem_size: u64,
    block: u64,
) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
    let ptr = read_u64(blob, base + mm_offset)?;
    if ptr == 0 {
        return Ok(None);
    }
    let at = |i: u64| -> Result<Vec<u8>> {
        let start = (ptr + i * elem_size) as usize;
        blob.get(start..start + elem_size as usize)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| Bp5Error::Format("Min/max pair out of bounds".into()))
    };
    Ok(Some((at(2 * block)?, at(2 * block + 1)?)))
}

fn bitfield_test(blob: &[u8], bit: usize) -> Result<bool> {
    let count = read_u64(blob, RECORD_IMAGE_BASE)?;
    let word = (bit / 64) as u64;
    if word >= count {
        return Ok(false);
    }
    let ptr = read_u64(blob, RECORD_IMAGE_BASE + 8)?;
    if ptr == 0 {
        return Ok(false);
    }
    let w = read_u64(blob, ptr + word * 8)?;
    Ok(w & (1u64 << (bit % 64)) != 0)
}

fn reverse_dim_groups(blob: &mut [u8], ptr: u64, dims: u64, times: u64) {
    if ptr == 0 || dims < 2 {
        return;
    }
    for group in 0..times {
        let base = (ptr + group * dims * 8) as usize;
        for i in 0..(dims as usize) / 2 {
            let a = base + i * 8;
            let b = base + (dims as usize - 1 - i) * 8;
            if b + 8 <= blob.len() {
                for k in 0..8 {
                    blob.swap(a + k, b + k);
                }
            }
        }
    }
}

/// Per-block geometry and statistics, for introspection.
#[derive(Debug, Clone)]
pub struct MinBlockInfo {
    /// The writer that produced the block.
    pub writer_id: usize,
    /// Global block ID (cohort-wide numbering).
    pub block_id: u64,
    /// Block offsets in the global array, when present.
    pub start: Option<Vec<u64>>,
    /// Block extent.
    pub count: Option<Vec<u64>>,
    /// Per-block min/max, when statistics were maintained.
    pub min_max: Option<MinMaxStruct>,
}

/// The per-step block map of one variable.
#[derive(Debug, Clone)]
pub struct MinVarInfo {
    /// Step the map describes.
    pub step: u64,
    /// Dimensionality.
    pub dims: u64,
    /// Global shape, when one exists.
    pub shape: Option<Vec<u64>>,
    /// Whether dimension tuples were reversed on installation.
    pub is_reverse_dims: bool,
    /// Whether the variable was a per-writer single value.
    pub was_local_value: bool,
    /// Whether the variable is a single value.
    pub is_value: bool,
    /// All blocks of the step, in (writer, local block) order.
    pub blocks: Vec<MinBlockInfo>,
}

/// The step deserializer.
#[derive(Debug)]
pub struct Deserializer {
    ctx: FormatContext,
    operators: OperatorRegistry,
    options: DeserializerOptions,
    dump_metadata: bool,

    vars: Vec<VarRec>,
    var_by_name: HashMap<String, usize>,

    controls: Vec<ControlInfo>,
    control_by_format: HashMap<FormatHandle, usize>,

    cur_timestep: u64,
    // Streaming mode: current step only.
    metadata_base: Vec<Option<MetaBlob>>,
    cur_cohort_size: usize,
    // Random-access mode: everything, indexed by step.
    control_array: Vec<Vec<Option<usize>>>,
    metadata_array: Vec<Vec<Option<MetaBlob>>>,
    cohort_sizes: Vec<usize>,

    attrs: BTreeMap<String, AttrValue>,
    last_attr_step: Option<u64>,

    pending: Vec<ArrayRequest>,
    results: Vec<Option<Vec<u8>>>,

    // Codecs are not required to be thread-safe.
    decompress_lock: Mutex<()>,
}

impl Deserializer {
    /// A deserializer with the given options. The metadata dump toggle is
    /// read from the environment once, here.
    pub fn new(options: DeserializerOptions) -> Self {
        let dump_metadata =
            std::env::var("BP5DumpMetadata").map(|v| !v.is_empty()).unwrap_or(false);
        Self {
            ctx: FormatContext::new(),
            operators: OperatorRegistry::new(),
            options,
            dump_metadata,
            vars: Vec::new(),
            var_by_name: HashMap::new(),
            controls: Vec::new(),
            control_by_format: HashMap::new(),
            cur_timestep: 0,
            metadata_base: Vec::new(),
            cur_cohort_size: 0,
            control_array: Vec::new(),
            metadata_array: Vec::new(),
            cohort_sizes: Vec::new(),
            attrs: BTreeMap::new(),
            last_attr_step: None,
            pending: Vec::new(),
            results: Vec::new(),
            decompress_lock: Mutex::new(()),
        }
    }

    /// Access to the operator registry, for installing custom codecs.
    pub fn operators_mut(&mut self) -> &mut OperatorRegistry {
        &mut self.operators
    }

    /// Loads a previously-unseen schema blob.
    pub fn install_meta_meta_data(&mut self, block: &MetaMetaInfoBlock) -> Result<()> {
        self.ctx.install(block)?;
        Ok(())
    }

    fn writer_cohort_size(&self, step: u64) -> usize {
        if self.options.random_access {
            self.cohort_sizes
                .get(step as usize)
                .copied()
                .or_else(|| self.cohort_sizes.last().copied())
                .unwrap_or(0)
        } else {
            self.cur_cohort_size
        }
    }

    /// Declares the step about to be installed and its cohort size. In
    /// streaming mode this also purges the user-visible variable set and the
    /// pending queue.
    pub fn setup_for_step(&mut self, step: u64, writer_count: usize) {
        self.cur_timestep = step;
        if self.options.random_access {
            if self.cohort_sizes.len() <= step as usize {
                self.cohort_sizes.resize(step as usize + 1, 0);
            }
            self.cohort_sizes[step as usize] = writer_count;
        } else {
            self.pending.clear();
            for var in &mut self.vars {
                var.available = false;
                var.per_writer_meta_offset.iter_mut().for_each(|o| *o = 0);
            }
            self.metadata_base.clear();
            self.cur_cohort_size = writer_count;
        }
    }

    fn create_var_rec(
        &mut self,
        name: &str,
        dtype: DataType,
        elem_size: u64,
        orig_shape_id: ShapeId,
        operator: Option<String>,
        min_max_offset: Option<u64>,
    ) -> usize {
        let var_num = self.vars.len();
        self.vars.push(VarRec {
            name: name.to_string(),
            var_num,
            dtype,
            elem_size,
            dim_count: 0,
            orig_shape_id,
            operator,
            min_max_offset,
            global_dims: None,
            per_writer_meta_offset: Vec::new(),
            per_writer_block_start: Vec::new(),
            first_ts_seen: None,
            last_ts_added: None,
            available_steps: 0,
            abs_step_from_rel: Vec::new(),
            created: false,
            available: false,
            start: Vec::new(),
            count: Vec::new(),
            sel: Selection::default(),
        });
        self.var_by_name.insert(name.to_string(), var_num);
        var_num
    }

    fn build_control(&mut self, handle: FormatHandle) -> Result<usize> {
        let layout = self.ctx.layout(handle)?.clone();
        let mut info = ControlInfo::default();
        for field in &layout.fields {
            if matches!(field.name.as_str(), "BitFieldCount" | "BitField" | "DataBlockSize") {
                continue;
            }
            let orig_shape_id = field_prefix(&field.name)?;
            let is_array = orig_shape_id.is_array();
            let var = if is_array {
                let (has_op, has_mm) = parse_field_type(&field.type_str)?;
                let (size, code, named) = parse_sized_name(&field.name[4..])?;
                let (base_name, op_name) = split_operator_suffix(named)?;
                if has_op != op_name.is_some() {
                    return Err(Bp5Error::Format(format!(
                        "Field \"{}\" disagrees with its type about an operator",
                        field.name
                    )));
                }
                let dtype = DataType::from_code(code)?;
                match self.var_by_name.get(base_name) {
                    Some(&v) => v,
                    None => {
                        let mm_offset = has_mm.then(|| {
                            if has_op { META_ARRAY_OP_SIZE } else { META_ARRAY_SIZE }
                        });
                        self.create_var_rec(
                            base_name,
                            dtype,
                            size,
                            orig_shape_id,
                            op_name.map(str::to_string),
                            mm_offset,
                        )
                    }
                }
            } else {
                let base_name = &field.name[4..];
                let dtype = DataType::from_wire(&field.type_str, field.size)?;
                match self.var_by_name.get(base_name) {
                    Some(&v) => v,
                    None => {
                        self.create_var_rec(base_name, dtype, field.size, orig_shape_id, None, None)
                    }
                }
            };
            let var_num = var;
            if info.meta_field_offset.len() <= var_num {
                info.meta_field_offset.resize(var_num + 1, 0);
                info.ci_var_index.resize(var_num + 1, 0);
            }
            info.ci_var_index[var_num] = info.controls.len();
            info.meta_field_offset[var_num] = field.offset;
            info.controls.push(ControlField {
                field_offset: field.offset,
                orig_shape_id,
                var: var_num,
                is_array,
            });
        }
        let idx = self.controls.len();
        self.controls.push(info);
        self.control_by_format.insert(handle, idx);
        Ok(idx)
    }

    /// Installs one writer's merged metadata for a step.
    pub fn install_meta_data(
        &mut self,
        block: Bytes,
        writer_rank: usize,
        step: u64,
    ) -> Result<()> {
        let handle = self.ctx.identify_incoming(&block).map_err(|_| {
            Bp5Error::Format(
                "Internal error or file corruption, no known format for metadata block".into(),
            )
        })?;
        if !self.ctx.has_conversion(handle) {
            self.ctx.establish_conversion(handle)?;
        }
        if self.dump_metadata {
            let layout = self.ctx.layout(handle)?;
            eprintln!(
                "Incoming metadata block from writer rank {writer_rank}:\n{}",
                dump_record(layout, &block)
            );
        }
        let control_idx = match self.control_by_format.get(&handle) {
            Some(&i) => i,
            None => self.build_control(handle)?,
        };

        let cohort = self.writer_cohort_size(step);
        if writer_rank >= cohort {
            return Err(Bp5Error::InvalidArgument(format!(
                "Writer rank {writer_rank} is outside the declared cohort of {cohort}"
            )));
        }
        let needs_reverse = self.options.writer_is_row_major != self.options.reader_is_row_major;
        // Dimension reversal mutates the record, so a majorness mismatch
        // decodes into a scratch buffer sized by the format context;
        // otherwise the incoming block is read in place.
        let mut blob = if needs_reverse {
            let mut scratch = vec![0u8; self.ctx.estimate_decode_size(handle, block.len())];
            scratch[..block.len()].copy_from_slice(&block);
            MetaBlob::Owned(scratch)
        } else {
            MetaBlob::Shared(block)
        };

        let fields: Vec<ControlField> = self.controls[control_idx].controls.clone();
        for (i, cf) in fields.iter().enumerate() {
            if !bitfield_test(blob.as_slice(), i)? {
                continue;
            }
            let base = RECORD_IMAGE_BASE + cf.field_offset;
            {
                let var = &mut self.vars[cf.var];
                if !self.options.random_access {
                    if var.per_writer_meta_offset.len() < cohort {
                        var.per_writer_meta_offset.resize(cohort, 0);
                        var.per_writer_block_start.resize(cohort, 0);
                    }
                    var.per_writer_meta_offset[writer_rank] = cf.field_offset;
                } else if var.abs_step_from_rel.last() != Some(&step) {
                    var.abs_step_from_rel.push(step);
                }
            }

            if cf.is_array {
                let dims = ma_dims(blob.as_slice(), base)?;
                let db_count = ma_db_count(blob.as_slice(), base)?;
                let block_count = if dims > 0 { db_count / dims } else { 1 };
                if dims > 1 && needs_reverse {
                    // Dimension tuples arrive in the writer's majorness;
                    // reverse them exactly once on installation.
                    let shape_ptr = read_u64(blob.as_slice(), base + 8)?;
                    let count_ptr = read_u64(blob.as_slice(), base + 24)?;
                    let offsets_ptr = read_u64(blob.as_slice(), base + 32)?;
                    let owned = blob.as_mut_vec();
                    reverse_dim_groups(owned, shape_ptr, dims, 1);
                    reverse_dim_groups(owned, count_ptr, dims, block_count);
                    reverse_dim_groups(owned, offsets_ptr, dims, block_count);
                }
                let shape = ma_shape(blob.as_slice(), base, dims)?;
                let var = &mut self.vars[cf.var];
                if writer_rank == 0 || var.global_dims.is_none() {
                    // The first shape observed is authoritative.
                    var.global_dims = shape.clone();
                }
                if !var.created {
                    match &shape {
                        Some(shape) => {
                            var.start = vec![0; dims as usize];
                            var.count = shape.clone();
                        }
                        None => {
                            var.start = Vec::new();
                            var.count = ma_count_block(blob.as_slice(), base, dims, 0)?;
                        }
                    }
                    var.created = true;
                    var.available_steps = 1;
                    var.last_ts_added = Some(step);
                }
                var.dim_count = dims;
                if !self.options.random_access {
                    if writer_rank == 0 {
                        var.per_writer_block_start[0] = 0;
                        if cohort > 1 {
                            var.per_writer_block_start[1] = block_count;
                        }
                    }
                    if writer_rank + 1 < cohort {
                        var.per_writer_block_start[writer_rank + 1] =
                            var.per_writer_block_start[writer_rank] + block_count;
                    }
                }
            } else {
                let var = &mut self.vars[cf.var];
                if !var.created {
                    if cf.orig_shape_id == ShapeId::LocalValue {
                        // Local single values show up as a 1-D global array
                        // of cohort size on the reader.
                        var.dim_count = 1;
                        var.start = vec![0];
                        var.count = vec![cohort as u64];
                    }
                    var.created = true;
                    var.available_steps = 1;
                    var.last_ts_added = Some(step);
                }
                if cf.orig_shape_id == ShapeId::LocalValue {
                    var.count = vec![cohort as u64];
                }
            }

            let var = &mut self.vars[cf.var];
            if var.first_ts_seen.is_none() {
                var.first_ts_seen = Some(step);
            }
            if self.options.random_access && var.last_ts_added != Some(step) {
                var.available_steps += 1;
                var.last_ts_added = Some(step);
            }
            var.available = true;
        }

        if self.options.random_access {
            let s = step as usize;
            if self.control_array.len() <= s {
                self.control_array.resize(s + 1, Vec::new());
                self.metadata_array.resize_with(s + 1, Vec::new);
            }
            if self.control_array[s].is_empty() {
                self.control_array[s].resize(cohort, None);
                self.metadata_array[s].resize_with(cohort, || None);
            }
            self.control_array[s][writer_rank] = Some(control_idx);
            self.metadata_array[s][writer_rank] = Some(blob);
        } else {
            if self.metadata_base.len() < cohort {
                self.metadata_base.resize_with(cohort, || None);
            }
            self.metadata_base[writer_rank] = Some(blob);
        }
        Ok(())
    }

    /// Installs a step's attribute record, clearing existing attributes when
    /// the step changes.
    pub fn install_attribute_data(&mut self, block: Bytes, step: u64) -> Result<()> {
        if block.is_empty() {
            return Ok(());
        }
        if self.last_attr_step != Some(step) {
            self.attrs.clear();
            self.last_attr_step = Some(step);
        }
        let handle = self.ctx.identify_incoming(&block).map_err(|_| {
            Bp5Error::Format(
                "Internal error or file corruption, no known format for attribute block".into(),
            )
        })?;
        if !self.ctx.has_conversion(handle) {
            self.ctx.establish_conversion(handle)?;
        }
        let layout = self.ctx.layout(handle)?.clone();
        if self.dump_metadata {
            eprintln!("Incoming attribute block:\n{}", dump_record(&layout, &block));
        }

        let blob: &[u8] = &block;
        let mut i = 0;
        while i < layout.fields.len() {
            let field = &layout.fields[i];
            let base = RECORD_IMAGE_BASE + field.offset;
            if field.name.ends_with("_ElemCount") {
                let elem_count = read_u64(blob, base)?;
                let data_field = layout.fields.get(i + 1).ok_or_else(|| {
                    Bp5Error::Format("Attribute array is missing its data field".into())
                })?;
                let name = data_field
                    .name
                    .get(4..)
                    .ok_or_else(|| Bp5Error::Format("Unparseable attribute name".into()))?;
                let tag = data_field.type_str.split('[').next().unwrap_or("");
                let dtype = DataType::from_wire(tag, data_field.size)?;
                let ptr = read_u64(blob, RECORD_IMAGE_BASE + data_field.offset)?;
                if dtype == DataType::String {
                    let mut strings = Vec::with_capacity(elem_count as usize);
                    let mut at = ptr;
                    for _ in 0..elem_count {
                        let s = read_cstr(blob, at)?;
                        at += s.len() as u64 + 1;
                        strings.push(s);
                    }
                    self.attrs.insert(name.to_string(), AttrValue::StrArray(strings));
                } else {
                    let len = (elem_count * data_field.size) as usize;
                    let start = ptr as usize;
                    let bytes = blob
                        .get(start..start + len)
                        .ok_or_else(|| {
                            Bp5Error::Format("Attribute array out of bounds".into())
                        })?
                        .to_vec();
                    self.attrs.insert(
                        name.to_string(),
                        AttrValue::DataArray { dtype, bytes, elem_count },
                    );
                }
                i += 2;
            } else {
                let (size, code, name) = parse_sized_name(
                    field
                        .name
                        .get(4..)
                        .ok_or_else(|| Bp5Error::Format("Unparseable attribute name".into()))?,
                )?;
                let dtype = DataType::from_code(code)?;
                if dtype == DataType::String {
                    let ptr = read_u64(blob, base)?;
                    let s = if ptr == 0 { String::new() } else { read_cstr(blob, ptr)? };
                    self.attrs.insert(name.to_string(), AttrValue::Str(s));
                } else {
                    let start = base as usize;
                    let bytes = blob
                        .get(start..start + size as usize)
                        .ok_or_else(|| {
                            Bp5Error::Format("Attribute value out of bounds".into())
                        })?
                        .to_vec();
                    self.attrs.insert(name.to_string(), AttrValue::Data { dtype, bytes });
                }
                i += 1;
            }
        }
        Ok(())
    }

    /// The currently installed attributes.
    pub fn attributes(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    // --- VARIABLE DISCOVERY & SELECTIONS ---

    /// Looks a live variable up by name.
    pub fn var(&self, name: &str) -> Option<VarId> {
        let &idx = self.var_by_name.get(name)?;
        let var = &self.vars[idx];
        if var.available || self.options.random_access { Some(VarId(idx)) } else { None }
    }

    /// All live variables.
    pub fn variables(&self) -> Vec<VarId> {
        self.vars
            .iter()
            .filter(|v| v.available || self.options.random_access)
            .map(|v| VarId(v.var_num))
            .collect()
    }

    /// A snapshot of one variable's reader-visible state.
    pub fn var_info(&self, id: VarId) -> Result<VariableInfo> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        Ok(VariableInfo {
            name: var.name.clone(),
            dtype: var.dtype,
            shape_id: var.orig_shape_id,
            dims: var.dim_count,
            shape: var.global_dims.clone(),
            available_steps: var.available_steps,
        })
    }

    fn var_mut(&mut self, id: VarId) -> Result<&mut VarRec> {
        self.vars
            .get_mut(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))
    }

    /// Selects a bounding box for subsequent gets on this variable.
    pub fn set_selection(&mut self, id: VarId, start: &[u64], count: &[u64]) -> Result<()> {
        let dims = self.vars.get(id.0).map(|v| v.dim_count).unwrap_or(0);
        if start.len() != count.len() || (dims > 0 && start.len() as u64 != dims) {
            return Err(Bp5Error::InvalidArgument(format!(
                "Selection rank {} does not match variable rank {dims}",
                start.len()
            )));
        }
        let var = self.var_mut(id)?;
        var.sel.sel_type = SelType::BoundingBox;
        var.sel.start = Some(start.to_vec());
        var.sel.count = Some(count.to_vec());
        Ok(())
    }

    /// Selects one block (cohort-wide numbering) for subsequent gets.
    pub fn set_block_selection(&mut self, id: VarId, block_id: u64) -> Result<()> {
        let var = self.var_mut(id)?;
        var.sel.sel_type = SelType::WriteBlock;
        var.sel.block_id = block_id;
        var.sel.start = None;
        var.sel.count = None;
        Ok(())
    }

    /// Selects a relative step range (random-access mode).
    pub fn set_step_selection(&mut self, id: VarId, start: u64, count: u64) -> Result<()> {
        if count == 0 {
            return Err(Bp5Error::InvalidArgument("Step selection of zero steps".into()));
        }
        let var = self.var_mut(id)?;
        var.sel.steps_start = start;
        var.sel.steps_count = count;
        Ok(())
    }

    // --- METADATA LOOKUP ---

    fn metadata_field(&self, var_idx: usize, step: u64, writer: usize) -> Option<(&[u8], u64)> {
        let var = self.vars.get(var_idx)?;
        if self.options.random_access {
            let ci_idx = *self
                .control_array
                .get(step as usize)?
                .get(writer)?
                .as_ref()?;
            let ci = self.controls.get(ci_idx)?;
            let field_offset = *ci.meta_field_offset.get(var.var_num)?;
            if field_offset == 0 {
                return None;
            }
            let blob = self.metadata_array.get(step as usize)?.get(writer)?.as_ref()?;
            let bit = *ci.ci_var_index.get(var.var_num)?;
            if !bitfield_test(blob.as_slice(), bit).ok()? {
                return None;
            }
            Some((blob.as_slice(), RECORD_IMAGE_BASE + field_offset))
        } else {
            let field_offset = *var.per_writer_meta_offset.get(writer)?;
            if field_offset == 0 {
                return None;
            }
            let blob = self.metadata_base.get(writer)?.as_ref()?;
            Some((blob.as_slice(), RECORD_IMAGE_BASE + field_offset))
        }
    }

    // --- QUEUEING GETS ---

    fn local_block_geometry(
        &self,
        var_idx: usize,
        step: u64,
        block_id: u64,
    ) -> Result<Option<(usize, u64, Vec<u64>)>> {
        // Walk writers in rank order, mapping the cohort-wide block ID to a
        // (writer, local block) pair.
        let var = &self.vars[var_idx];
        let dims = var.dim_count;
        let mut node_first_block = 0u64;
        for writer in 0..self.writer_cohort_size(step) {
            let Some((blob, base)) = self.metadata_field(var_idx, step, writer) else {
                continue;
            };
            let db_count = ma_db_count(blob, base)?;
            let block_count = if dims > 0 { db_count / dims } else { 1 };
            if block_id >= node_first_block && block_id < node_first_block + block_count {
                let local = block_id - node_first_block;
                let count = ma_count_block(blob, base, dims, local)?;
                return Ok(Some((writer, local, count)));
            }
            node_first_block += block_count;
        }
        Ok(None)
    }

    fn request_size(&self, var_idx: usize, step: u64) -> Result<u64> {
        let var = &self.vars[var_idx];
        let elem = var.elem_size;
        if var.dtype == DataType::String {
            return Ok(0);
        }
        match var.orig_shape_id {
            ShapeId::GlobalValue => Ok(elem),
            ShapeId::LocalValue => {
                let count = var
                    .sel
                    .count
                    .as_ref()
                    .and_then(|c| c.first().copied())
                    .unwrap_or(self.writer_cohort_size(step) as u64);
                Ok(count * elem)
            }
            _ => match var.sel.sel_type {
                SelType::WriteBlock => {
                    if let Some(count) = &var.sel.count {
                        return Ok(elem_product(count) * elem);
                    }
                    match self.local_block_geometry(var_idx, step, var.sel.block_id)? {
                        Some((_, _, count)) => Ok(elem_product(&count) * elem),
                        None => Ok(0),
                    }
                }
                SelType::BoundingBox => {
                    let count = var.sel.count.as_ref().unwrap_or(&var.count);
                    Ok(elem_product(count) * elem)
                }
            },
        }
    }

    fn alloc_result(&mut self, size: u64, existing: Option<Vec<u8>>) -> Result<usize> {
        let buf = match existing {
            Some(buf) => {
                if (buf.len() as u64) < size {
                    return Err(Bp5Error::InvalidArgument(format!(
                        "Destination buffer of {} bytes is smaller than the {} required",
                        buf.len(),
                        size
                    )));
                }
                buf
            }
            None => vec![0u8; size as usize],
        };
        self.results.push(Some(buf));
        Ok(self.results.len() - 1)
    }

    fn copy_into_result(&mut self, handle: usize, at: u64, bytes: &[u8]) -> Result<()> {
        let dest = self
            .results
            .get_mut(handle)
            .and_then(|r| r.as_mut())
            .ok_or_else(|| Bp5Error::Logic("Get destination already taken".into()))?;
        let at = at as usize;
        if dest.len() < at + bytes.len() {
            dest.resize(at + bytes.len(), 0);
        }
        dest[at..at + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    fn queue_get_single(
        &mut self,
        var_idx: usize,
        step: u64,
        handle: usize,
        dest_offset: u64,
    ) -> Result<bool> {
        let var = &self.vars[var_idx];
        let elem = var.elem_size;
        let dtype = var.dtype;
        match var.orig_shape_id {
            ShapeId::GlobalValue => {
                // A block selection picks the writer; otherwise the first
                // writer that wrote the value serves it.
                let writers: Vec<usize> = match var.sel.sel_type {
                    SelType::WriteBlock => vec![var.sel.block_id as usize],
                    SelType::BoundingBox => (0..self.writer_cohort_size(step)).collect(),
                };
                for writer in writers {
                    if let Some((blob, off)) = self.metadata_field(var_idx, step, writer) {
                        let bytes = if dtype == DataType::String {
                            let ptr = read_u64(blob, off)?;
                            let s = if ptr == 0 { String::new() } else { read_cstr(blob, ptr)? };
                            s.into_bytes()
                        } else {
                            let off = off as usize;
                            blob.get(off..off + elem as usize)
                                .ok_or_else(|| {
                                    Bp5Error::Format("Scalar value out of bounds".into())
                                })?
                                .to_vec()
                        };
                        self.copy_into_result(handle, dest_offset, &bytes)?;
                        return Ok(false);
                    }
                }
                Ok(false)
            }
            ShapeId::LocalValue => {
                let first = var
                    .sel
                    .start
                    .as_ref()
                    .and_then(|s| s.first().copied())
                    .unwrap_or(0);
                let count = var
                    .sel
                    .count
                    .as_ref()
                    .and_then(|c| c.first().copied())
                    .unwrap_or(self.writer_cohort_size(step) as u64);
                let mut string_at = dest_offset;
                for i in 0..count {
                    let writer = (first + i) as usize;
                    let Some((blob, off)) = self.metadata_field(var_idx, step, writer) else {
                        continue;
                    };
                    if dtype == DataType::String {
                        let ptr = read_u64(blob, off)?;
                        let s = if ptr == 0 { String::new() } else { read_cstr(blob, ptr)? };
                        let mut bytes = s.into_bytes();
                        bytes.push(0);
                        self.copy_into_result(handle, string_at, &bytes)?;
                        string_at += bytes.len() as u64;
                    } else {
                        let off = off as usize;
                        let bytes = blob
                            .get(off..off + elem as usize)
                            .ok_or_else(|| {
                                Bp5Error::Format("Scalar value out of bounds".into())
                            })?
                            .to_vec();
                        self.copy_into_result(handle, dest_offset + i * elem, &bytes)?;
                    }
                }
                Ok(false)
            }
            _ => {
                let is_global = var.sel.sel_type == SelType::BoundingBox
                    && matches!(
                        var.orig_shape_id,
                        ShapeId::GlobalArray | ShapeId::JoinedArray
                    );
                let req = if is_global {
                    ArrayRequest {
                        var: var_idx,
                        req_type: ReqType::Global,
                        step,
                        block_id: var.sel.block_id,
                        start: Some(var.sel.start.clone().unwrap_or_else(|| var.start.clone())),
                        count: Some(var.sel.count.clone().unwrap_or_else(|| var.count.clone())),
                        handle,
                        dest_offset,
                        mem_space: MemorySpace::Host,
                    }
                } else {
                    ArrayRequest {
                        var: var_idx,
                        req_type: ReqType::Local,
                        step,
                        block_id: var.sel.block_id,
                        start: var.sel.start.clone(),
                        count: var.sel.count.clone(),
                        handle,
                        dest_offset,
                        mem_space: MemorySpace::Host,
                    }
                };
                self.pending.push(req);
                Ok(true)
            }
        }
    }

    /// Queues one get against the variable's current selection, allocating
    /// an owned destination buffer. Scalars are satisfied immediately from
    /// installed metadata; the returned flag is true iff the get was
    /// deferred to the read/finalize cycle.
    pub fn queue_get(&mut self, id: VarId) -> Result<(GetHandle, bool)> {
        self.queue_get_impl(id, None)
    }

    /// Like [`Deserializer::queue_get`], reusing a caller-provided buffer.
    /// Regions no block intersects keep the caller's bytes.
    pub fn queue_get_into(&mut self, id: VarId, dest: Vec<u8>) -> Result<(GetHandle, bool)> {
        self.queue_get_impl(id, Some(dest))
    }

    fn queue_get_impl(&mut self, id: VarId, dest: Option<Vec<u8>>) -> Result<(GetHandle, bool)> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        if !self.options.random_access {
            let step = self.cur_timestep;
            let size = self.request_size(id.0, step)?;
            let handle = self.alloc_result(size, dest)?;
            let deferred = self.queue_get_single(id.0, step, handle, 0)?;
            return Ok((GetHandle(handle), deferred));
        }

        let (steps_start, steps_count) = (var.sel.steps_start, var.sel.steps_count);
        let available = var.abs_step_from_rel.len() as u64;
        if steps_start + steps_count > available {
            return Err(Bp5Error::InvalidArgument(format!(
                "Step selection [{steps_start}, {steps_start}+{steps_count}) in variable \"{}\" \
                 is beyond the largest available relative step {available}",
                var.name
            )));
        }
        let abs_steps: Vec<u64> = (steps_start..steps_start + steps_count)
            .map(|r| var.abs_step_from_rel[r as usize])
            .collect();
        let mut sizes = Vec::with_capacity(abs_steps.len());
        let mut total = 0u64;
        for s in &abs_steps {
            let size = self.request_size(id.0, *s)?;
            sizes.push(size);
            total += size;
        }
        let handle = self.alloc_result(total, dest)?;
        let mut deferred = false;
        let mut offset = 0u64;
        for (s, size) in abs_steps.iter().zip(sizes) {
            let cohort = self.writer_cohort_size(*s);
            let written = (0..cohort).any(|w| self.metadata_field(id.0, *s, w).is_some());
            if written {
                deferred |= self.queue_get_single(id.0, *s, handle, offset)?;
                offset += size;
            }
        }
        Ok((GetHandle(handle), deferred))
    }

    /// Returns (and detaches) a get's destination buffer. Call after
    /// [`Deserializer::finalize_gets`].
    pub fn take_data(&mut self, handle: GetHandle) -> Option<Vec<u8>> {
        self.results.get_mut(handle.0).and_then(Option::take)
    }

    // --- READ PLANNING ---

    /// Plans the minimal byte-range reads covering every pending request.
    /// Returns the requests plus the largest single read length, so the
    /// transport can size its staging.
    pub fn generate_read_requests(
        &self,
        alloc_temp_buffers: bool,
    ) -> Result<(Vec<ReadRequest>, u64)> {
        let mut out = Vec::new();
        let mut max_read = 0u64;
        for (req_index, req) in self.pending.iter().enumerate() {
            let var = &self.vars[req.var];
            let dims = var.dim_count;
            let elem = var.elem_size;
            match req.req_type {
                ReqType::Local => {
                    let mut node_first_block = 0u64;
                    for writer in 0..self.writer_cohort_size(req.step) {
                        let Some((blob, base)) = self.metadata_field(req.var, req.step, writer)
                        else {
                            continue;
                        };
                        let db_count = ma_db_count(blob, base)?;
                        let block_count = if dims > 0 { db_count / dims } else { 1 };
                        let node_last_block = node_first_block + block_count;
                        if req.block_id >= node_first_block && req.block_id < node_last_block {
                            let local = req.block_id - node_first_block;
                            let count = ma_count_block(blob, base, dims, local)?;
                            let read_length = if var.operator.is_some() {
                                ma_data_block_size(blob, base, local)?
                            } else {
                                elem * elem_product(&count)
                            };
                            let rr = ReadRequest {
                                timestep: req.step,
                                writer_rank: writer,
                                start_offset: ma_location(blob, base, local)?,
                                read_length,
                                destination: alloc_temp_buffers
                                    .then(|| vec![0u8; read_length as usize]),
                                offset_in_block: 0,
                                req_index,
                                block_id: local,
                                internal: None,
                            };
                            max_read = max_read.max(rr.read_length);
                            out.push(rr);
                            break;
                        }
                        node_first_block += block_count;
                    }
                }
                ReqType::Global => {
                    let sel_start = req.start.as_deref().unwrap_or(&[]);
                    let sel_count = req.count.as_deref().unwrap_or(&[]);
                    for writer in 0..self.writer_cohort_size(req.step) {
                        let Some((blob, base)) = self.metadata_field(req.var, req.step, writer)
                        else {
                            continue;
                        };
                        let db_count = ma_db_count(blob, base)?;
                        let block_count = if dims > 0 { db_count / dims } else { 1 };
                        for block in 0..block_count {
                            let offsets = ma_offsets_block(blob, base, dims, block)?
                                .unwrap_or_else(|| vec![0; dims as usize]);
                            let count = ma_count_block(blob, base, dims, block)?;
                            let Some((mut inter_start, inter_count)) =
                                intersection_start_count(sel_start, sel_count, &offsets, &count)
                            else {
                                continue;
                            };
                            let rr = if var.operator.is_some() {
                                // Decompression needs the whole block.
                                let read_length = ma_data_block_size(blob, base, block)?;
                                ReadRequest {
                                    timestep: req.step,
                                    writer_rank: writer,
                                    start_offset: ma_location(blob, base, block)?,
                                    read_length,
                                    destination: alloc_temp_buffers
                                        .then(|| vec![0u8; read_length as usize]),
                                    offset_in_block: 0,
                                    req_index,
                                    block_id: block,
                                    internal: None,
                                }
                            } else {
                                for d in 0..dims as usize {
                                    inter_start[d] -= offsets[d];
                                }
                                let start_off = elem
                                    * linear_index(
                                        &count,
                                        &inter_start,
                                        self.options.reader_is_row_major,
                                    );
                                for d in 0..dims as usize {
                                    inter_start[d] += inter_count[d] - 1;
                                }
                                let end_off = elem
                                    * (linear_index(
                                        &count,
                                        &inter_start,
                                        self.options.reader_is_row_major,
                                    ) + 1);
                                let read_length = end_off - start_off;
                                ReadRequest {
                                    timestep: req.step,
                                    writer_rank: writer,
                                    start_offset: ma_location(blob, base, block)? + start_off,
                                    read_length,
                                    destination: alloc_temp_buffers
                                        .then(|| vec![0u8; read_length as usize]),
                                    offset_in_block: start_off,
                                    req_index,
                                    block_id: block,
                                    internal: None,
                                }
                            };
                            max_read = max_read.max(rr.read_length);
                            out.push(rr);
                        }
                    }
                }
            }
        }
        Ok((out, max_read))
    }

    // --- FINALIZATION ---

    /// Performs decompression and the N-d copy for one completed read.
    pub fn finalize_get(&mut self, read: ReadRequest) -> Result<()> {
        let req = self
            .pending
            .get(read.req_index)
            .ok_or_else(|| Bp5Error::InvalidArgument("Read serves no pending request".into()))?
            .clone();
        let var = &self.vars[req.var];
        let elem = var.elem_size;
        let dims_usize;
        let (rank_offset, rank_size, db_size) = {
            let (blob, base) = self.metadata_field(req.var, req.step, read.writer_rank)
                .ok_or_else(|| {
                    Bp5Error::Format("Completed read has no installed metadata".into())
                })?;
            let dims = ma_dims(blob, base)?;
            dims_usize = dims as usize;
            let rank_offset = ma_offsets_block(blob, base, dims, read.block_id)?
                .unwrap_or_else(|| vec![0; dims_usize]);
            let rank_size = ma_count_block(blob, base, dims, read.block_id)?;
            let db_size = if var.operator.is_some() {
                Some(ma_data_block_size(blob, base, read.block_id)?)
            } else {
                None
            };
            (rank_offset, rank_size, db_size)
        };

        let mut incoming = read
            .destination
            .ok_or_else(|| Bp5Error::InvalidArgument("Read has no destination bytes".into()))?;
        let mut offset_in_block = read.offset_in_block;

        if let Some(op_name) = var.operator.as_deref() {
            let db_size = db_size.unwrap_or(incoming.len() as u64) as usize;
            let mut scratch = vec![0u8; (elem * elem_product(&rank_size)) as usize];
            {
                let op = self.operators.get(op_name)?;
                let _serialize_codec = self
                    .decompress_lock
                    .lock()
                    .map_err(|_| Bp5Error::Logic("Decompression mutex poisoned".into()))?;
                let src = incoming.get(..db_size).ok_or_else(|| {
                    Bp5Error::Operator("Compressed block shorter than its recorded size".into())
                })?;
                op.decompress(src, &mut scratch)?;
            }
            incoming = scratch;
            offset_in_block = 0;
        }

        let mut in_start = rank_offset;
        let mut in_count = rank_size.clone();
        let mut out_start = req
            .start
            .clone()
            .unwrap_or_else(|| vec![0; dims_usize]);
        let mut out_count = req.count.clone().unwrap_or_else(|| rank_size.clone());
        if req.req_type == ReqType::Local {
            in_start = vec![0; dims_usize];
        }

        if !self.options.reader_is_row_major {
            in_start.reverse();
            in_count.reverse();
            out_start.reverse();
            out_count.reverse();
        }

        let dest_len = (elem * elem_product(&out_count)) as usize;
        let dest = self
            .results
            .get_mut(req.handle)
            .and_then(|r| r.as_mut())
            .ok_or_else(|| Bp5Error::Logic("Get destination already taken".into()))?;
        let at = req.dest_offset as usize;
        let dest = dest
            .get_mut(at..at + dest_len)
            .ok_or_else(|| Bp5Error::Logic("Get destination smaller than its selection".into()))?;

        nd_copy(
            &incoming,
            offset_in_block,
            &in_start,
            &in_count,
            true,
            dest,
            &out_start,
            &out_count,
            true,
            elem,
            req.mem_space,
        )
    }

    /// Finalizes a batch of completed reads and clears the pending queue.
    /// An operator failure aborts only its own block; the first such error
    /// is returned after the rest of the batch has been processed.
    pub fn finalize_gets(&mut self, reads: Vec<ReadRequest>) -> Result<()> {
        let mut first_err = None;
        for read in reads {
            if let Err(e) = self.finalize_get(read) {
                first_err.get_or_insert(e);
            }
        }
        self.pending.clear();
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    // --- INTROSPECTION ---

    /// The global shape of a variable at a relative step (random access) or
    /// the current step.
    pub fn var_shape(&self, id: VarId, rel_step: Option<u64>) -> Result<Option<Vec<u64>>> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        if !matches!(var.orig_shape_id, ShapeId::GlobalArray | ShapeId::JoinedArray) {
            return Ok(None);
        }
        let abs_step = if self.options.random_access {
            let rel = rel_step.unwrap_or(var.sel.steps_start);
            *var.abs_step_from_rel.get(rel as usize).ok_or_else(|| {
                Bp5Error::InvalidArgument(format!(
                    "Relative step {rel} is beyond the available steps"
                ))
            })?
        } else {
            self.cur_timestep
        };
        for writer in 0..self.writer_cohort_size(abs_step) {
            if let Some((blob, base)) = self.metadata_field(id.0, abs_step, writer) {
                let dims = ma_dims(blob, base)?;
                if let Some(shape) = ma_shape(blob, base, dims)? {
                    return Ok(Some(shape));
                }
            }
        }
        Ok(None)
    }

    /// The absolute steps on which a variable appears (random access).
    pub fn get_absolute_steps(&self, id: VarId) -> Result<Vec<u64>> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        Ok(var.abs_step_from_rel.clone())
    }

    fn steps_to_scan(&self, step: u64) -> Vec<u64> {
        if step == ALL_STEPS {
            if self.options.random_access {
                (0..self.control_array.len() as u64).collect()
            } else {
                vec![self.cur_timestep]
            }
        } else {
            vec![step]
        }
    }

    /// Folds the per-block statistics of a variable over one step (or all
    /// steps with [`ALL_STEPS`]). `Ok(None)` means the variable carries no
    /// statistics.
    pub fn variable_min_max(&self, id: VarId, step: u64) -> Result<Option<MinMaxStruct>> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        if var.orig_shape_id.is_array() && var.min_max_offset.is_none() {
            return Ok(None);
        }
        let mut mm = MinMaxStruct::init(var.dtype);
        if mm.min.is_none() {
            return Ok(None);
        }
        for s in self.steps_to_scan(step) {
            let cohort = self.writer_cohort_size(s);
            if var.orig_shape_id.is_array() {
                let Some(mm_off) = var.min_max_offset else {
                    continue;
                };
                for writer in 0..cohort {
                    let Some((blob, base)) = self.metadata_field(id.0, s, writer) else {
                        continue;
                    };
                    let dims = ma_dims(blob, base)?;
                    let db_count = ma_db_count(blob, base)?;
                    let blocks = if dims > 0 { db_count / dims } else { 1 };
                    for b in 0..blocks {
                        if let Some((min, max)) =
                            ma_min_max(blob, base, mm_off, var.elem_size, b)?
                        {
                            mm.apply_element(&min);
                            mm.apply_element(&max);
                        }
                    }
                }
            } else {
                // Values fold the value itself, across every writer that
                // wrote one.
                for writer in 0..cohort {
                    let Some((blob, off)) = self.metadata_field(id.0, s, writer) else {
                        continue;
                    };
                    let off = off as usize;
                    if let Some(bytes) = blob.get(off..off + var.elem_size as usize) {
                        mm.apply_element(bytes);
                    }
                }
            }
        }
        Ok(Some(mm))
    }

    /// Per-block geometry and statistics for one step.
    pub fn min_blocks_info(&self, id: VarId, step: u64) -> Result<MinVarInfo> {
        let var = self
            .vars
            .get(id.0)
            .ok_or_else(|| Bp5Error::InvalidArgument("Unknown variable".into()))?;
        let cohort = self.writer_cohort_size(step);
        let is_value = !var.orig_shape_id.is_array();
        let was_local_value = var.orig_shape_id == ShapeId::LocalValue;
        let mut mv = MinVarInfo {
            step,
            dims: if was_local_value { 1 } else { var.dim_count },
            shape: if was_local_value { Some(vec![cohort as u64]) } else { var.global_dims.clone() },
            is_reverse_dims: var.dim_count > 1
                && self.options.writer_is_row_major != self.options.reader_is_row_major,
            was_local_value,
            is_value: is_value && !was_local_value,
            blocks: Vec::new(),
        };

        if is_value {
            let mut id_counter = 0u64;
            for writer in 0..cohort {
                let Some((blob, off)) = self.metadata_field(id.0, step, writer) else {
                    continue;
                };
                let mut mm = MinMaxStruct::init(var.dtype);
                let off = off as usize;
                if let Some(bytes) = blob.get(off..off + var.elem_size as usize) {
                    mm.apply_element(bytes);
                }
                mv.blocks.push(MinBlockInfo {
                    writer_id: writer,
                    block_id: id_counter,
                    start: was_local_value.then(|| vec![writer as u64]),
                    count: was_local_value.then(|| vec![1]),
                    min_max: mm.min.is_some().then_some(mm),
                });
                id_counter += 1;
            }
            return Ok(mv);
        }

        let mut id_counter = 0u64;
        for writer in 0..cohort {
            let Some((blob, base)) = self.metadata_field(id.0, step, writer) else {
                continue;
            };
            let dims = ma_dims(blob, base)?;
            let db_count = ma_db_count(blob, base)?;
            let blocks = if dims > 0 { db_count / dims } else { 1 };
            if mv.shape.is_none() {
                mv.shape = ma_shape(blob, base, dims)?;
            }
            for b in 0..blocks {
                let min_max = match var.min_max_offset {
                    Some(mm_off) => {
                        ma_min_max(blob, base, mm_off, var.elem_size, b)?.map(|(min, max)| {
                            let mut mm = MinMaxStruct::init(var.dtype);
                            mm.apply_element(&min);
                            mm.apply_element(&max);
                            mm
                        })
                    }
                    None => None,
                };
                mv.blocks.push(MinBlockInfo {
                    writer_id: writer,
                    block_id: id_counter,
                    start: ma_offsets_block(blob, base, dims, b)?,
                    count: Some(ma_count_block(blob, base, dims, b)?),
                    min_max,
                });
                id_counter += 1;
            }
        }
        Ok(mv)
    }
}
