//! The data stager: an append-only ordered sequence of byte segments with
//! alignment-aware allocation, zero-copy shared segments for deferred puts,
//! and caller-writable spans.
//!
//! A writer accumulates one of these per step. Payload bytes either get
//! copied into an owned tail segment, appended as a refcounted shared
//! segment without copying, or reserved up front so the caller (or a
//! compression operator) can fill the region in place. Global positions are
//! byte offsets from the start of the step's concatenated data stream; they
//! are exactly the offsets recorded in the step's metadata.

use bytes::Bytes;

use crate::error::{Bp5Error, Result};

/// A reserved, caller-writable region inside the stager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPos {
    /// Index of the segment holding the region.
    pub buffer_idx: usize,
    /// Byte offset of the region inside that segment.
    pub pos_in_buffer: usize,
    /// Byte offset of the region in the concatenated stream.
    pub global_pos: u64,
}

/// What to append in [`BufferV::add_to_vec`].
#[derive(Debug)]
pub enum StageSource<'a> {
    /// Copy these bytes into the stager now.
    Copy(&'a [u8]),
    /// Append a refcounted slice; kept zero-copy unless a copy is forced.
    Shared(Bytes),
    /// Nothing to append; used for end-of-step alignment pads.
    Empty,
}

#[derive(Debug)]
enum Segment {
    Owned(Vec<u8>),
    Shared(Bytes),
}

impl Segment {
    fn as_slice(&self) -> &[u8] {
        match self {
            Self::Owned(v) => v.as_slice(),
            Self::Shared(b) => b.as_ref(),
        }
    }
}

/// Append-only staging buffer for one step's data payloads.
#[derive(Debug)]
pub struct BufferV {
    segments: Vec<Segment>,
    size: u64,
}

impl BufferV {
    /// A fresh, empty stager.
    pub fn new() -> Self {
        Self { segments: Vec::new(), size: 0 }
    }

    /// Total bytes staged so far, alignment pads included.
    pub fn size(&self) -> u64 {
        self.size
    }

    fn owned_tail(&mut self) -> &mut Vec<u8> {
        let need_new = !matches!(self.segments.last(), Some(Segment::Owned(_)));
        if need_new {
            self.segments.push(Segment::Owned(Vec::new()));
        }
        match self.segments.last_mut() {
            Some(Segment::Owned(v)) => v,
            // owned_tail just pushed an Owned segment if the tail was not one
            _ => unreachable!(),
        }
    }

    fn pad_to(&mut self, align: u64) {
        if align <= 1 {
            return;
        }
        let rem = self.size % align;
        if rem == 0 {
            return;
        }
        let pad = (align - rem) as usize;
        let tail = self.owned_tail();
        tail.resize(tail.len() + pad, 0);
        self.size += pad as u64;
    }

    /// Appends `src` after padding the stream to `align` bytes, returning the
    /// aligned position the appended bytes start at (for [`StageSource::Empty`],
    /// the aligned end-of-stream position).
    ///
    /// A [`StageSource::Shared`] append stays zero-copy unless `force_copy`
    /// is set; the refcounted slice is released when the step's data buffer
    /// is released by the transport.
    pub fn add_to_vec(&mut self, src: StageSource<'_>, align: u64, force_copy: bool) -> u64 {
        self.pad_to(align);
        let pos = self.size;
        match src {
            StageSource::Copy(bytes) => {
                self.owned_tail().extend_from_slice(bytes);
                self.size += bytes.len() as u64;
            }
            StageSource::Shared(bytes) => {
                if force_copy {
                    self.owned_tail().extend_from_slice(&bytes);
                } else if !bytes.is_empty() {
                    self.segments.push(Segment::Shared(bytes.clone()));
                }
                self.size += bytes.len() as u64;
            }
            StageSource::Empty => {}
        }
        pos
    }

    /// Reserves a contiguous writable region of `size` bytes (zero-filled),
    /// padded to `align`. The caller fills it through [`BufferV::get_mut`].
    pub fn allocate(&mut self, size: usize, align: u64) -> BufferPos {
        self.pad_to(align);
        let global_pos = self.size;
        let tail = self.owned_tail();
        let pos_in_buffer = tail.len();
        tail.resize(pos_in_buffer + size, 0);
        self.size += size as u64;
        BufferPos { buffer_idx: self.segments.len() - 1, pos_in_buffer, global_pos }
    }

    /// Shrinks the most recent [`BufferV::allocate`] from `old` to `new`
    /// bytes (a compression operator reporting its actual output size).
    pub fn downsize_last_alloc(&mut self, old: usize, new: usize) -> Result<()> {
        if new > old {
            return Err(Bp5Error::InvalidArgument(format!(
                "Downsize from {old} to {new} would grow the allocation"
            )));
        }
        let Some(Segment::Owned(tail)) = self.segments.last_mut() else {
            return Err(Bp5Error::Logic("Downsize without a prior allocation".into()));
        };
        if tail.len() < old {
            return Err(Bp5Error::Logic("Downsize exceeds the last allocation".into()));
        }
        tail.truncate(tail.len() - (old - new));
        self.size -= (old - new) as u64;
        Ok(())
    }

    /// Mutable access to a reserved region.
    pub fn get_mut(&mut self, pos: &BufferPos, len: usize) -> Result<&mut [u8]> {
        let seg = self
            .segments
            .get_mut(pos.buffer_idx)
            .ok_or_else(|| Bp5Error::InvalidArgument("Span segment out of range".into()))?;
        let Segment::Owned(v) = seg else {
            return Err(Bp5Error::InvalidArgument("Span points at a shared segment".into()));
        };
        v.get_mut(pos.pos_in_buffer..pos.pos_in_buffer + len)
            .ok_or_else(|| Bp5Error::InvalidArgument("Span range out of bounds".into()))
    }

    /// The staged segments in stream order, for a gather-style transport.
    pub fn segments(&self) -> impl Iterator<Item = &[u8]> {
        self.segments.iter().map(Segment::as_slice)
    }

    /// Concatenates the staged bytes into one vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.size as usize);
        for seg in &self.segments {
            out.extend_from_slice(seg.as_slice());
        }
        out
    }
}

impl Default for BufferV {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_account_for_alignment() {
        let mut b = BufferV::new();
        let p0 = b.add_to_vec(StageSource::Copy(&[1, 2, 3]), 4, true);
        assert_eq!(p0, 0);
        let p1 = b.add_to_vec(StageSource::Copy(&[9; 8]), 8, true);
        assert_eq!(p1, 8);
        assert_eq!(b.size(), 16);
        let data = b.to_vec();
        assert_eq!(&data[..3], &[1, 2, 3]);
        assert_eq!(&data[8..16], &[9; 8]);
    }

    #[test]
    fn shared_segments_stay_zero_copy() {
        let mut b = BufferV::new();
        b.add_to_vec(StageSource::Copy(&[1; 5]), 1, true);
        let shared = Bytes::from(vec![7u8; 11]);
        let pos = b.add_to_vec(StageSource::Shared(shared), 1, false);
        assert_eq!(pos, 5);
        assert_eq!(b.size(), 16);
        assert_eq!(b.segments().count(), 2);
        assert_eq!(&b.to_vec()[5..], &[7u8; 11]);
    }

    #[test]
    fn allocate_and_downsize() {
        let mut b = BufferV::new();
        let pos = b.allocate(100, 4);
        b.get_mut(&pos, 100).expect("span").fill(0xAB);
        b.downsize_last_alloc(100, 40).expect("downsize");
        assert_eq!(b.size(), 40);
        assert_eq!(b.to_vec(), vec![0xAB; 40]);
    }

    #[test]
    fn empty_append_returns_aligned_size() {
        let mut b = BufferV::new();
        b.add_to_vec(StageSource::Copy(&[0; 10]), 1, true);
        let end = b.add_to_vec(StageSource::Empty, 64, true);
        assert_eq!(end, 64);
        assert_eq!(b.size(), 64);
    }
}
