//! N-dimensional strided copy between a source hyperrectangle and a
//! destination hyperrectangle, in possibly different majornesses.
//!
//! Both sides are described in global coordinates: the source buffer holds
//! the block `[in_start, in_start + in_count)`, the destination holds the
//! selection `[out_start, out_start + out_count)`, and the copy transfers
//! their overlap. The source may be partial: `src_byte_offset` says how many
//! bytes of the virtual full block precede `src[0]`, so a planner that read
//! only the overlapping byte range can still address the block as if it were
//! whole. Indices are computed slice-relative and bounds-checked; there is
//! no out-of-bounds base pointer anywhere.

use crate::error::{Bp5Error, Result};
use crate::types::MemorySpace;

/// Flat element index of `pos` inside an array of extents `count`.
pub(crate) fn linear_index(count: &[u64], pos: &[u64], row_major: bool) -> u64 {
    let mut off = 0u64;
    if row_major {
        for d in 0..count.len() {
            off = off * count[d] + pos[d];
        }
    } else {
        for d in (0..count.len()).rev() {
            off = off * count[d] + pos[d];
        }
    }
    off
}

/// Per-dimension overlap of two `[start, start + count)` boxes.
/// Returns `None` when the boxes do not intersect.
pub(crate) fn intersection_start_count(
    start1: &[u64],
    count1: &[u64],
    start2: &[u64],
    count2: &[u64],
) -> Option<(Vec<u64>, Vec<u64>)> {
    let dims = start1.len();
    let mut out_start = Vec::with_capacity(dims);
    let mut out_count = Vec::with_capacity(dims);
    for d in 0..dims {
        if count1[d] == 0 || count2[d] == 0 {
            return None;
        }
        let begin = start1[d].max(start2[d]);
        let end = (start1[d] + count1[d]).min(start2[d] + count2[d]);
        if end <= begin {
            return None;
        }
        out_start.push(begin);
        out_count.push(end - begin);
    }
    Some((out_start, out_count))
}

fn copy_run(
    src: &[u8],
    src_byte: i128,
    dst: &mut [u8],
    dst_byte: usize,
    len: usize,
) -> Result<()> {
    let start = usize::try_from(src_byte)
        .map_err(|_| Bp5Error::Format("Source run precedes the bytes actually read".into()))?;
    let from = src
        .get(start..start + len)
        .ok_or_else(|| Bp5Error::Format("Source run exceeds the bytes actually read".into()))?;
    let to = dst
        .get_mut(dst_byte..dst_byte + len)
        .ok_or_else(|| Bp5Error::Format("Destination run out of bounds".into()))?;
    to.copy_from_slice(from);
    Ok(())
}

/// Copies the overlap of the source block and the destination selection.
///
/// `mem_space` tags where `dst` lives; the tag is carried for embedders that
/// route device destinations through a staging copy, the in-crate copy leg
/// is always host memory.
#[allow(clippy::too_many_arguments)]
pub fn nd_copy(
    src: &[u8],
    src_byte_offset: u64,
    in_start: &[u64],
    in_count: &[u64],
    src_row_major: bool,
    dst: &mut [u8],
    out_start: &[u64],
    out_count: &[u64],
    dst_row_major: bool,
    elem_size: u64,
    _mem_space: MemorySpace,
) -> Result<()> {
    let dims = in_count.len();
    if dims != in_start.len() || dims != out_start.len() || dims != out_count.len() {
        return Err(Bp5Error::InvalidArgument(
            "Dimension tuples disagree on rank".into(),
        ));
    }
    let elem = elem_size as usize;
    if dims == 0 {
        return copy_run(src, -(src_byte_offset as i128), dst, 0, elem);
    }
    let Some((ov_start, ov_count)) =
        intersection_start_count(in_start, in_count, out_start, out_count)
    else {
        return Ok(());
    };

    // Equal majornesses reduce to the row-major walk: reversing every tuple
    // maps a column-major layout onto the row-major address function.
    if src_row_major == dst_row_major {
        let reverse = !src_row_major;
        let rev = |v: &[u64]| -> Vec<u64> {
            if reverse {
                v.iter().rev().copied().collect()
            } else {
                v.to_vec()
            }
        };
        return nd_copy_same_major(
            src,
            src_byte_offset,
            &rev(in_start),
            &rev(in_count),
            dst,
            &rev(out_start),
            &rev(out_count),
            &rev(&ov_start),
            &rev(&ov_count),
            elem,
        );
    }

    // Mixed majorness: walk every element of the overlap.
    let mut pos = ov_start.clone();
    loop {
        let src_rel: Vec<u64> = (0..dims).map(|d| pos[d] - in_start[d]).collect();
        let dst_rel: Vec<u64> = (0..dims).map(|d| pos[d] - out_start[d]).collect();
        let src_byte = linear_index(in_count, &src_rel, src_row_major) as i128 * elem as i128
            - src_byte_offset as i128;
        let dst_byte = linear_index(out_count, &dst_rel, dst_row_major) as usize * elem;
        copy_run(src, src_byte, dst, dst_byte, elem)?;

        // Odometer.
        let mut d = dims;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            pos[d] += 1;
            if pos[d] < ov_start[d] + ov_count[d] {
                break;
            }
            pos[d] = ov_start[d];
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn nd_copy_same_major(
    src: &[u8],
    src_byte_offset: u64,
    in_start: &[u64],
    in_count: &[u64],
    dst: &mut [u8],
    out_start: &[u64],
    out_count: &[u64],
    ov_start: &[u64],
    ov_count: &[u64],
    elem: usize,
) -> Result<()> {
    let dims = in_count.len();
    let inner = dims - 1;
    let run = ov_count[inner] as usize * elem;

    let mut pos = ov_start.to_vec();
    loop {
        let src_rel: Vec<u64> = (0..dims).map(|d| pos[d] - in_start[d]).collect();
        let dst_rel: Vec<u64> = (0..dims).map(|d| pos[d] - out_start[d]).collect();
        let src_byte = linear_index(in_count, &src_rel, true) as i128 * elem as i128
            - src_byte_offset as i128;
        let dst_byte = linear_index(out_count, &dst_rel, true) as usize * elem;
        copy_run(src, src_byte, dst, dst_byte, run)?;

        // Advance the outer dimensions; the inner one is the run itself.
        let mut d = inner;
        loop {
            if d == 0 {
                return Ok(());
            }
            d -= 1;
            pos[d] += 1;
            if pos[d] < ov_start[d] + ov_count[d] {
                break;
            }
            pos[d] = ov_start[d];
        }
    }
}
