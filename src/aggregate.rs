//! Cohort aggregation codec.
//!
//! A writer cohort's per-rank products (new meta-meta blocks, encoded
//! metadata, encoded attributes, data sizes, data positions) are packed into
//! one contiguous byte vector per rank so the transport can gather them with
//! a single collective; the reader breaks the concatenation back out into
//! zero-copy views and deduplicates meta-meta blocks by byte-equal ID.
//!
//! ## Encoding (per rank section, all integers u64 LE)
//!
//! ```text
//! NMMB ; per block: idLen, infoLen, id[idLen], info[infoLen]
//! MB   ; per blob:  alignedLen, blob, zero-pad to 8
//! AB   ; per blob:  alignedLen, blob, zero-pad to 8   (0-length permitted)
//! DS   ; DS × dataSize
//! WDP  ; WDP × writerDataPosition
//! ```

use bytes::Bytes;

use crate::error::{Bp5Error, Result};
use crate::schema::MetaMetaInfoBlock;

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_aligned_blob(out: &mut Vec<u8>, blob: &[u8]) {
    let aligned = blob.len().div_ceil(8) * 8;
    put_u64(out, aligned as u64);
    out.extend_from_slice(blob);
    out.resize(out.len() + (aligned - blob.len()), 0);
}

/// Packs one rank's step products into a contiguous byte vector.
pub fn copy_metadata_to_contiguous(
    new_meta_meta_blocks: &[MetaMetaInfoBlock],
    meta_encode_buffers: &[Bytes],
    attribute_encode_buffers: &[Bytes],
    data_sizes: &[u64],
    writer_data_positions: &[u64],
) -> Vec<u8> {
    let mut out = Vec::new();

    put_u64(&mut out, new_meta_meta_blocks.len() as u64);
    for block in new_meta_meta_blocks {
        put_u64(&mut out, block.id.len() as u64);
        put_u64(&mut out, block.info.len() as u64);
        out.extend_from_slice(&block.id);
        out.extend_from_slice(&block.info);
    }

    put_u64(&mut out, meta_encode_buffers.len() as u64);
    for blob in meta_encode_buffers {
        put_aligned_blob(&mut out, blob);
    }

    put_u64(&mut out, attribute_encode_buffers.len() as u64);
    for blob in attribute_encode_buffers {
        put_aligned_blob(&mut out, blob);
    }

    put_u64(&mut out, data_sizes.len() as u64);
    for v in data_sizes {
        put_u64(&mut out, *v);
    }
    put_u64(&mut out, writer_data_positions.len() as u64);
    for v in writer_data_positions {
        put_u64(&mut out, *v);
    }
    out
}

/// The broken-out view of an aggregated metadata buffer.
///
/// All `Bytes` here are subslices of the aggregate: no blob is copied.
#[derive(Debug, Default)]
pub struct BrokenOutMetadata {
    /// One encoded metadata blob per writer, in rank order.
    pub metadata_blocks: Vec<Bytes>,
    /// Meta-meta blocks deduplicated by byte-equal ID.
    pub unique_meta_meta_blocks: Vec<MetaMetaInfoBlock>,
    /// Attribute blobs in rank order (zero-length entries preserved).
    pub attribute_blocks: Vec<Bytes>,
    /// Per-writer data stream sizes.
    pub data_sizes: Vec<u64>,
    /// Per-writer data stream positions.
    pub writer_data_positions: Vec<u64>,
}

struct Reader<'a> {
    buf: &'a Bytes,
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u64(&mut self) -> Result<u64> {
        let bytes = self
            .buf
            .get(self.pos..self.pos + 8)
            .ok_or_else(|| Bp5Error::Format("Aggregated metadata truncated".into()))?;
        self.pos += 8;
        Ok(u64::from_le_bytes(
            bytes.try_into().map_err(|_| Bp5Error::Format("Bad u64".into()))?,
        ))
    }

    fn slice(&mut self, len: usize) -> Result<Bytes> {
        if self.pos + len > self.buf.len() {
            return Err(Bp5Error::Format("Aggregated metadata truncated".into()));
        }
        let out = self.buf.slice(self.pos..self.pos + len);
        self.pos += len;
        Ok(out)
    }
}

/// Exact inverse of [`copy_metadata_to_contiguous`] over `rank_count`
/// concatenated rank sections.
pub fn breakout_contiguous_metadata(
    aggregate: &Bytes,
    rank_count: usize,
) -> Result<BrokenOutMetadata> {
    let mut r = Reader { buf: aggregate, pos: 0 };
    let mut out = BrokenOutMetadata::default();

    for _rank in 0..rank_count {
        let nmmb = r.u64()?;
        for _ in 0..nmmb {
            let id_len = r.u64()? as usize;
            let info_len = r.u64()? as usize;
            let id = r.slice(id_len)?;
            let info = r.slice(info_len)?;
            let known = out.unique_meta_meta_blocks.iter().any(|o| o.id == id);
            if !known {
                out.unique_meta_meta_blocks.push(MetaMetaInfoBlock { id, info });
            }
        }

        let mb = r.u64()?;
        for _ in 0..mb {
            let len = r.u64()? as usize;
            out.metadata_blocks.push(r.slice(len)?);
        }

        let ab = r.u64()?;
        for _ in 0..ab {
            let len = r.u64()? as usize;
            out.attribute_blocks.push(r.slice(len)?);
        }

        let ds = r.u64()?;
        for _ in 0..ds {
            let v = r.u64()?;
            out.data_sizes.push(v);
        }
        let wdp = r.u64()?;
        for _ in 0..wdp {
            let v = r.u64()?;
            out.writer_data_positions.push(v);
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mm(id: u8, info: &[u8]) -> MetaMetaInfoBlock {
        MetaMetaInfoBlock {
            id: Bytes::copy_from_slice(&[id; 8]),
            info: Bytes::copy_from_slice(info),
        }
    }

    #[test]
    fn round_trip_single_rank() {
        let blocks = vec![mm(1, b"layout-one")];
        let meta = vec![Bytes::from_static(b"metadata-bytes")];
        let attrs = vec![Bytes::from_static(b"attr")];
        let packed = copy_metadata_to_contiguous(&blocks, &meta, &attrs, &[1234], &[0]);

        let agg = Bytes::from(packed);
        let out = breakout_contiguous_metadata(&agg, 1).expect("breakout");
        assert_eq!(out.unique_meta_meta_blocks, blocks);
        assert_eq!(out.metadata_blocks.len(), 1);
        // Blobs come back padded to 8 bytes; content prefix must match.
        assert_eq!(&out.metadata_blocks[0][..14], b"metadata-bytes");
        assert_eq!(&out.attribute_blocks[0][..4], b"attr");
        assert_eq!(out.data_sizes, vec![1234]);
        assert_eq!(out.writer_data_positions, vec![0]);
    }

    #[test]
    fn duplicate_meta_meta_is_deduplicated() {
        let rank0 = copy_metadata_to_contiguous(
            &[mm(7, b"shared-layout")],
            &[Bytes::from_static(b"rank0-md")],
            &[],
            &[10],
            &[0],
        );
        let rank1 = copy_metadata_to_contiguous(
            &[mm(7, b"shared-layout")],
            &[Bytes::from_static(b"rank1-md")],
            &[],
            &[20],
            &[10],
        );
        let mut agg = rank0;
        agg.extend_from_slice(&rank1);

        let out = breakout_contiguous_metadata(&Bytes::from(agg), 2).expect("breakout");
        assert_eq!(out.unique_meta_meta_blocks.len(), 1);
        assert_eq!(out.metadata_blocks.len(), 2);
        assert_eq!(out.data_sizes, vec![10, 20]);
        assert_eq!(out.writer_data_positions, vec![0, 10]);
    }

    #[test]
    fn zero_length_attribute_blob_is_preserved() {
        let packed = copy_metadata_to_contiguous(
            &[],
            &[Bytes::from_static(b"md")],
            &[Bytes::new()],
            &[0],
            &[0],
        );
        let out = breakout_contiguous_metadata(&Bytes::from(packed), 1).expect("breakout");
        assert_eq!(out.attribute_blocks.len(), 1);
        assert!(out.attribute_blocks[0].is_empty());
    }

    #[test]
    fn truncated_aggregate_is_a_format_error() {
        let packed = copy_metadata_to_contiguous(&[], &[Bytes::from_static(b"md")], &[], &[], &[]);
        let truncated = Bytes::from(packed[..packed.len() - 4].to_vec());
        assert!(matches!(
            breakout_contiguous_metadata(&truncated, 1),
            Err(Bp5Error::Format(_))
        ));
    }
}
