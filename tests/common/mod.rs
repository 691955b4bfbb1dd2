//! A minimal in-memory transport for exercising the full write → aggregate →
//! install → plan → serve → finalize cycle.

#![allow(dead_code)]

use bp5::aggregate::{breakout_contiguous_metadata, copy_metadata_to_contiguous};
use bp5::{Deserializer, ReadRequest, Result, TimestepInfo};
use bytes::Bytes;

/// One step's shipped cohort products.
pub struct StepExchange {
    /// Concatenated per-rank aggregation sections.
    pub aggregate: Bytes,
    /// Per-writer data streams.
    pub data: Vec<Vec<u8>>,
    /// Cohort size.
    pub writer_count: usize,
}

/// Packs one cohort step the way a gathering transport would.
pub fn ship_step(infos: Vec<TimestepInfo>) -> StepExchange {
    let writer_count = infos.len();
    let mut aggregate = Vec::new();
    let mut data = Vec::new();
    for info in infos {
        let attrs: Vec<Bytes> = info.attribute_data.clone().into_iter().collect();
        let section = copy_metadata_to_contiguous(
            &info.new_meta_meta_blocks,
            &[info.metadata.clone()],
            &attrs,
            &[info.data.size()],
            &[0],
        );
        aggregate.extend_from_slice(&section);
        data.push(info.data.to_vec());
    }
    StepExchange { aggregate: Bytes::from(aggregate), data, writer_count }
}

/// Feeds one shipped step into a reader.
pub fn install_step(reader: &mut Deserializer, ex: &StepExchange, step: u64) -> Result<()> {
    let broken = breakout_contiguous_metadata(&ex.aggregate, ex.writer_count)?;
    for mm in &broken.unique_meta_meta_blocks {
        reader.install_meta_meta_data(mm)?;
    }
    reader.setup_for_step(step, ex.writer_count);
    for (rank, block) in broken.metadata_blocks.iter().enumerate() {
        reader.install_meta_data(block.clone(), rank, step)?;
    }
    for block in &broken.attribute_blocks {
        reader.install_attribute_data(block.clone(), step)?;
    }
    Ok(())
}

/// Serves planned reads from the shipped data streams (indexed by step).
pub fn serve_reads(reads: Vec<ReadRequest>, steps: &[StepExchange]) -> Vec<ReadRequest> {
    reads
        .into_iter()
        .map(|mut rr| {
            let stream = &steps[rr.timestep as usize].data[rr.writer_rank];
            let at = rr.start_offset as usize;
            rr.destination = Some(stream[at..at + rr.read_length as usize].to_vec());
            rr
        })
        .collect()
}

/// Little-endian packing helpers for typed test data.
pub fn i32_bytes(vals: &[i32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn i32_vals(bytes: &[u8]) -> Vec<i32> {
    bytes
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().expect("chunk")))
        .collect()
}

pub fn f32_bytes(vals: &[f32]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn f32_vals(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().expect("chunk")))
        .collect()
}
