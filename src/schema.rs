//! The self-describing schema registry (format context).
//!
//! Writer cohorts are heterogeneous: two ranks may carry different variable
//! sets and therefore different metadata record layouts. The reader must be
//! able to decode any rank's record without out-of-band schema, so every
//! layout travels once as a "meta-meta" block: a stable content-derived
//! format ID plus a descriptor blob listing the record's fields.
//!
//! ## Encoded record blobs
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │ format ID (u64 LE)                            │
//! ├───────────────────────────────────────────────┤
//! │ record image (record_size bytes)              │
//! │   - each field packed at its layout offset    │
//! ├───────────────────────────────────────────────┤
//! │ heap (variable length)                        │
//! │   - dimension vectors, bitfield words,        │
//! │     min/max pairs, strings (NUL-terminated)   │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Pointer-valued fields store a `u64` absolute byte offset from blob start
//! into the heap; `0` encodes NULL. Heap entries are 8-byte aligned. All
//! integers are little-endian. Because the image is a plain packed layout,
//! a record whose format has been registered here can be read in place from
//! the incoming buffer; a scratch copy is only needed when the caller wants
//! to mutate it (e.g. dimension reversal on a majorness mismatch).

use std::collections::HashMap;
use std::fmt::Write as _;
use std::hash::Hasher;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use twox_hash::XxHash64;

use crate::error::{Bp5Error, Result};

/// Byte offset of the record image inside an encoded blob (the format ID
/// prefix comes first).
pub const RECORD_IMAGE_BASE: u64 = 8;

/// One field of a record layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Encoded field name (carries the shape prefix and, for arrays, the
    /// element size and type code).
    pub name: String,
    /// Wire type: a scalar tag, `tag[CountField]` for a heap array, or a
    /// `MetaArray` variant name.
    pub type_str: String,
    /// Element size in bytes (for `MetaArray` fields, the fixed image size).
    pub size: u64,
    /// Byte offset of the field inside the record image.
    pub offset: u64,
}

impl FieldDef {
    /// True when the field's value lives in the heap (the image holds an
    /// offset rather than the value itself).
    pub fn is_heap_ref(&self) -> bool {
        self.type_str.contains('[') || self.type_str == "string"
    }
}

/// An interned record layout: ordered fields plus the packed image size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    /// Record name ("MetaData" or "Attributes").
    pub name: String,
    /// Fields in declaration order.
    pub fields: Vec<FieldDef>,
    /// Size of the packed image, rounded up to 8 bytes.
    pub record_size: u64,
}

/// Incremental builder for a record layout, assigning field offsets with the
/// same alignment discipline the packed image uses: each field is aligned to
/// `min(size, 8)` bytes.
#[derive(Debug, Clone)]
pub struct LayoutBuilder {
    name: String,
    fields: Vec<FieldDef>,
}

impl LayoutBuilder {
    /// A new, empty layout.
    pub fn new(name: &str) -> Self {
        Self { name: name.to_string(), fields: Vec::new() }
    }

    /// Appends a field and returns its assigned offset.
    pub fn add_field(&mut self, name: &str, type_str: &str, size: u64) -> u64 {
        let align = size.clamp(1, 8);
        let end = self
            .fields
            .last()
            .map(|f| {
                // A heap reference occupies 8 bytes in the image regardless
                // of its recorded element size.
                let occupied = if f.is_heap_ref() { 8 } else { f.size };
                f.offset + occupied
            })
            .unwrap_or(0);
        let offset = end.div_ceil(align) * align;
        self.fields.push(FieldDef {
            name: name.to_string(),
            type_str: type_str.to_string(),
            size,
            offset,
        });
        offset
    }

    /// Number of fields added so far.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// True when no fields have been added.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Snapshots the current layout.
    pub fn build(&self) -> RecordLayout {
        let end = self
            .fields
            .last()
            .map(|f| {
                let occupied = if f.is_heap_ref() { 8 } else { f.size };
                f.offset + occupied
            })
            .unwrap_or(0);
        RecordLayout {
            name: self.name.clone(),
            fields: self.fields.clone(),
            record_size: end.div_ceil(8) * 8,
        }
    }

    /// Drops all fields, keeping the record name.
    pub fn clear(&mut self) {
        self.fields.clear();
    }

    /// The fields added so far, in order.
    pub fn fields(&self) -> &[FieldDef] {
        &self.fields
    }
}

/// The self-describing schema blob for one format: a stable ID plus the
/// descriptor needed to decode records of that format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaMetaInfoBlock {
    /// Content-derived format ID (8 bytes, little-endian u64).
    pub id: Bytes,
    /// Serialized [`RecordLayout`].
    pub info: Bytes,
}

/// Opaque handle to a registered format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FormatHandle(pub(crate) usize);

#[derive(Debug)]
struct Format {
    id: u64,
    layout: RecordLayout,
    converted: bool,
}

/// Registry of record layouts known to one engine instance.
///
/// Registration is idempotent on equal layouts: the ID is a hash of the
/// canonical descriptor encoding, so byte-equal descriptors intern to the
/// same handle and re-registering an already-known layout emits no new
/// meta-meta block.
#[derive(Debug, Default)]
pub struct FormatContext {
    formats: Vec<Format>,
    by_id: HashMap<u64, FormatHandle>,
}

impl FormatContext {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn descriptor_of(layout: &RecordLayout) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(layout, bincode::config::standard())
            .map_err(|e| Bp5Error::Format(format!("Layout descriptor encode failed: {e}")))
    }

    /// Interns a layout, returning its handle and, when the layout was
    /// previously unseen, the meta-meta block a writer must ship.
    pub fn register(
        &mut self,
        layout: RecordLayout,
    ) -> Result<(FormatHandle, Option<MetaMetaInfoBlock>)> {
        let descriptor = Self::descriptor_of(&layout)?;
        let mut hasher = XxHash64::with_seed(0);
        hasher.write(&descriptor);
        let id = hasher.finish();

        if let Some(&handle) = self.by_id.get(&id) {
            return Ok((handle, None));
        }
        let handle = FormatHandle(self.formats.len());
        self.formats.push(Format { id, layout, converted: true });
        self.by_id.insert(id, handle);
        let block = MetaMetaInfoBlock {
            id: Bytes::copy_from_slice(&id.to_le_bytes()),
            info: Bytes::from(descriptor),
        };
        Ok((handle, Some(block)))
    }

    /// Loads an externally received meta-meta block. Unknown IDs become
    /// decodable from this point on; known IDs are a no-op.
    pub fn install(&mut self, block: &MetaMetaInfoBlock) -> Result<FormatHandle> {
        if block.id.len() != 8 {
            return Err(Bp5Error::Format(format!(
                "Meta-meta ID has length {}, expected 8",
                block.id.len()
            )));
        }
        let id = u64::from_le_bytes(
            block.id[..].try_into().map_err(|_| Bp5Error::Format("Bad meta-meta ID".into()))?,
        );
        if let Some(&handle) = self.by_id.get(&id) {
            return Ok(handle);
        }
        let layout: RecordLayout =
            bincode::serde::decode_from_slice(&block.info, bincode::config::standard())
                .map(|(layout, _)| layout)
                .map_err(|e| Bp5Error::Format(format!("Layout descriptor decode failed: {e}")))?;
        let handle = FormatHandle(self.formats.len());
        self.formats.push(Format { id, layout, converted: false });
        self.by_id.insert(id, handle);
        Ok(handle)
    }

    /// Recognizes an encoded record by its leading format ID.
    pub fn identify_incoming(&self, blob: &[u8]) -> Result<FormatHandle> {
        let id_bytes = blob
            .get(..8)
            .ok_or_else(|| Bp5Error::Format("Record blob shorter than format ID".into()))?;
        let id = u64::from_le_bytes(
            id_bytes.try_into().map_err(|_| Bp5Error::Format("Bad format ID".into()))?,
        );
        self.by_id.get(&id).copied().ok_or_else(|| {
            Bp5Error::Format(format!("No known format for record ID {id:#018x}"))
        })
    }

    /// Required once per previously-unseen incoming format: validates the
    /// layout so later field access can trust its offsets.
    pub fn establish_conversion(&mut self, handle: FormatHandle) -> Result<()> {
        let format = self
            .formats
            .get_mut(handle.0)
            .ok_or_else(|| Bp5Error::Format("Unknown format handle".into()))?;
        if format.converted {
            return Ok(());
        }
        let layout = &format.layout;
        let mut prev_end = 0u64;
        for f in &layout.fields {
            let occupied = if f.is_heap_ref() { 8 } else { f.size };
            if f.offset < prev_end || f.offset + occupied > layout.record_size {
                return Err(Bp5Error::Format(format!(
                    "Field \"{}\" at offset {} overlaps or exceeds record of size {}",
                    f.name, f.offset, layout.record_size
                )));
            }
            prev_end = f.offset + occupied;
        }
        format.converted = true;
        Ok(())
    }

    /// Whether [`FormatContext::establish_conversion`] has run for a handle.
    pub fn has_conversion(&self, handle: FormatHandle) -> bool {
        self.formats.get(handle.0).map(|f| f.converted).unwrap_or(false)
    }

    /// Scratch-buffer size needed to decode a blob of this format: the blob
    /// is its own decoded form, so its length is the answer, bounded below
    /// by the image plus prefix.
    pub fn estimate_decode_size(&self, handle: FormatHandle, blob_len: usize) -> usize {
        let record = self
            .formats
            .get(handle.0)
            .map(|f| f.layout.record_size as usize + RECORD_IMAGE_BASE as usize)
            .unwrap_or(0);
        blob_len.max(record)
    }

    /// The layout behind a handle.
    pub fn layout(&self, handle: FormatHandle) -> Result<&RecordLayout> {
        self.formats
            .get(handle.0)
            .map(|f| &f.layout)
            .ok_or_else(|| Bp5Error::Format("Unknown format handle".into()))
    }
}

// --- PACKED RECORD ACCESS ---

/// Reads a little-endian u64 at an absolute blob offset.
pub fn read_u64(blob: &[u8], off: u64) -> Result<u64> {
    let off = off as usize;
    let bytes = blob
        .get(off..off + 8)
        .ok_or_else(|| Bp5Error::Format(format!("Record read at {off} out of bounds")))?;
    Ok(u64::from_le_bytes(
        bytes.try_into().map_err(|_| Bp5Error::Format("Bad u64 slice".into()))?,
    ))
}

/// Follows a heap pointer and reads `count` little-endian u64s.
/// A NULL pointer yields `None`.
pub fn read_u64_array(blob: &[u8], ptr: u64, count: u64) -> Result<Option<Vec<u64>>> {
    if ptr == 0 {
        return Ok(None);
    }
    let mut out = Vec::with_capacity(count as usize);
    for i in 0..count {
        out.push(read_u64(blob, ptr + i * 8)?);
    }
    Ok(Some(out))
}

/// Follows a heap pointer to a NUL-terminated string.
pub fn read_cstr(blob: &[u8], ptr: u64) -> Result<String> {
    let start = ptr as usize;
    let tail = blob
        .get(start..)
        .ok_or_else(|| Bp5Error::Format(format!("String pointer {start} out of bounds")))?;
    let end = tail
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| Bp5Error::Format("Unterminated string in record heap".into()))?;
    String::from_utf8(tail[..end].to_vec())
        .map_err(|_| Bp5Error::Format("Record string is not valid UTF-8".into()))
}

/// Builds an encoded record blob: format-ID prefix, packed image, heap.
///
/// The writer fills image fields at their layout offsets and appends heap
/// entries through [`RecordEncoder::alloc_heap`], which returns the absolute
/// offset to store in the corresponding pointer field.
#[derive(Debug)]
pub struct RecordEncoder {
    image: Vec<u8>,
    heap: Vec<u8>,
}

impl RecordEncoder {
    /// An encoder for a record of `record_size` bytes, zero-initialized.
    pub fn new(record_size: u64) -> Self {
        Self { image: vec![0u8; record_size as usize], heap: Vec::new() }
    }

    /// Writes a u64 image field.
    pub fn put_u64(&mut self, off: u64, val: u64) -> Result<()> {
        self.put_bytes(off, &val.to_le_bytes())
    }

    /// Writes raw bytes at an image offset.
    pub fn put_bytes(&mut self, off: u64, bytes: &[u8]) -> Result<()> {
        let off = off as usize;
        let slot = self
            .image
            .get_mut(off..off + bytes.len())
            .ok_or_else(|| Bp5Error::Format(format!("Record write at {off} out of bounds")))?;
        slot.copy_from_slice(bytes);
        Ok(())
    }

    /// Appends a heap entry (8-byte aligned) and returns the absolute blob
    /// offset a pointer field should store.
    pub fn alloc_heap(&mut self, bytes: &[u8]) -> u64 {
        while self.heap.len() % 8 != 0 {
            self.heap.push(0);
        }
        let off = RECORD_IMAGE_BASE + self.image.len() as u64 + self.heap.len() as u64;
        self.heap.extend_from_slice(bytes);
        off
    }

    /// Appends a slice of u64s to the heap.
    pub fn alloc_heap_u64s(&mut self, vals: &[u64]) -> u64 {
        let mut bytes = Vec::with_capacity(vals.len() * 8);
        for v in vals {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.alloc_heap(&bytes)
    }

    /// Appends a NUL-terminated string to the heap.
    pub fn alloc_heap_cstr(&mut self, s: &str) -> u64 {
        let mut bytes = Vec::with_capacity(s.len() + 1);
        bytes.extend_from_slice(s.as_bytes());
        bytes.push(0);
        self.alloc_heap(&bytes)
    }

    /// Finalizes the blob for a given format ID.
    pub fn finish(self, format_id_le: &[u8; 8]) -> Bytes {
        let mut out = Vec::with_capacity(8 + self.image.len() + self.heap.len());
        out.extend_from_slice(format_id_le);
        out.extend_from_slice(&self.image);
        out.extend_from_slice(&self.heap);
        Bytes::from(out)
    }
}

/// The format-ID prefix of an already-encoded blob, for re-encoding.
pub fn format_id_bytes(ctx: &FormatContext, handle: FormatHandle) -> Result<[u8; 8]> {
    ctx.formats
        .get(handle.0)
        .map(|f| f.id.to_le_bytes())
        .ok_or_else(|| Bp5Error::Format("Unknown format handle".into()))
}

/// Human-readable field/value listing of an encoded record, for the
/// env-gated metadata dump.
pub fn dump_record(layout: &RecordLayout, blob: &[u8]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "record \"{}\" ({} bytes):", layout.name, blob.len());
    for f in &layout.fields {
        let off = RECORD_IMAGE_BASE + f.offset;
        let rendered = if f.type_str.starts_with("MetaArray") {
            match (read_u64(blob, off), read_u64(blob, off + 40)) {
                (Ok(dims), Ok(blocks)) => format!("dims={dims} blocks={blocks}"),
                _ => "<truncated>".to_string(),
            }
        } else if f.type_str == "string" {
            match read_u64(blob, off).and_then(|p| {
                if p == 0 { Ok("<null>".to_string()) } else { read_cstr(blob, p) }
            }) {
                Ok(s) => format!("{s:?}"),
                Err(_) => "<truncated>".to_string(),
            }
        } else if f.is_heap_ref() {
            match read_u64(blob, off) {
                Ok(p) => format!("-> {p:#x}"),
                Err(_) => "<truncated>".to_string(),
            }
        } else {
            let off = off as usize;
            match blob.get(off..off + f.size as usize) {
                Some(raw) if f.size <= 8 => {
                    let mut buf = [0u8; 8];
                    buf[..raw.len()].copy_from_slice(raw);
                    format!("{}", u64::from_le_bytes(buf))
                }
                Some(raw) => format!("{raw:02x?}"),
                None => "<truncated>".to_string(),
            }
        };
        let _ = writeln!(out, "  {} ({}): {}", f.name, f.type_str, rendered);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_offsets_follow_alignment() {
        let mut b = LayoutBuilder::new("MetaData");
        assert_eq!(b.add_field("BitFieldCount", "integer", 8), 0);
        assert_eq!(b.add_field("BitField", "integer[BitFieldCount]", 8), 8);
        assert_eq!(b.add_field("DataBlockSize", "integer", 8), 16);
        assert_eq!(b.add_field("BPg_small", "integer", 2), 24);
        // 2-byte scalar ends at 26; next 8-byte field aligns up.
        assert_eq!(b.add_field("BPg_big", "float", 8), 32);
        let layout = b.build();
        assert_eq!(layout.record_size, 40);
    }

    #[test]
    fn register_is_idempotent() {
        let mut ctx = FormatContext::new();
        let mut b = LayoutBuilder::new("MetaData");
        b.add_field("BitFieldCount", "integer", 8);
        let (h1, block) = ctx.register(b.build()).expect("register");
        assert!(block.is_some());
        let (h2, dup) = ctx.register(b.build()).expect("register again");
        assert_eq!(h1, h2);
        assert!(dup.is_none());
    }

    #[test]
    fn install_then_identify() {
        let mut writer_ctx = FormatContext::new();
        let mut b = LayoutBuilder::new("MetaData");
        b.add_field("BitFieldCount", "integer", 8);
        let (h, block) = writer_ctx.register(b.build()).expect("register");
        let block = block.expect("new block");

        let mut reader_ctx = FormatContext::new();
        let rh = reader_ctx.install(&block).expect("install");
        reader_ctx.establish_conversion(rh).expect("conversion");

        let id = format_id_bytes(&writer_ctx, h).expect("id");
        let enc = RecordEncoder::new(8).finish(&id);
        let found = reader_ctx.identify_incoming(&enc).expect("identify");
        assert_eq!(found, rh);
    }

    #[test]
    fn unknown_format_is_an_error() {
        let ctx = FormatContext::new();
        let err = ctx.identify_incoming(&[0u8; 16]).expect_err("should fail");
        assert!(matches!(err, Bp5Error::Format(_)));
    }

    #[test]
    fn heap_round_trip() {
        let mut enc = RecordEncoder::new(24);
        let ptr = enc.alloc_heap_u64s(&[3, 4, 5]);
        enc.put_u64(0, ptr).expect("field");
        let s_ptr = enc.alloc_heap_cstr("hello");
        enc.put_u64(8, s_ptr).expect("field");
        let blob = enc.finish(&7u64.to_le_bytes());

        let p = read_u64(&blob, RECORD_IMAGE_BASE).expect("ptr");
        let dims = read_u64_array(&blob, p, 3).expect("dims").expect("non-null");
        assert_eq!(dims, vec![3, 4, 5]);
        let sp = read_u64(&blob, RECORD_IMAGE_BASE + 8).expect("sptr");
        assert_eq!(read_cstr(&blob, sp).expect("str"), "hello");
    }
}
