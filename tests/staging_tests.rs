//! Staging strategies on the write side: deferred externs, spans, mid-step
//! buffer swaps, and a persisted-step round trip through a real file.

mod common;

use std::io::{Read, Seek, SeekFrom, Write};

use bp5::stager::StageSource;
use bp5::{
    BufferV, DataType, Deserializer, DeserializerOptions, MarshalData, PutSpec, Serializer,
    SerializerOptions,
};
use bytes::Bytes;
use common::{i32_bytes, i32_vals, install_step, serve_reads, ship_step, StepExchange};

#[test]
fn deferred_puts_are_staged_at_flush() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    // Deferred put: nothing lands in the stager until the flush.
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[4], &[4], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2, 3, 4]))),
        false,
    )
    .expect("marshal");
    assert_eq!(w.staged_data_size(), 0);

    w.perform_puts(false).expect("flush");
    assert_eq!(w.staged_data_size(), 16);

    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);
    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("x").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![1, 2, 3, 4]);
}

#[test]
fn sync_puts_are_staged_immediately() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[4], &[4], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2, 3, 4]))),
        true,
    )
    .expect("marshal");
    assert_eq!(w.staged_data_size(), 16);
}

#[test]
fn span_put_is_filled_in_place() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    let pos = w
        .marshal_span(&PutSpec::global_array("x", DataType::Int32, &[4], &[4], &[0]))
        .expect("span");
    w.span_mut(&pos, 16)
        .expect("span bytes")
        .copy_from_slice(&i32_bytes(&[9, 8, 7, 6]));

    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);
    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("x").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![9, 8, 7, 6]);
}

#[test]
fn reinit_swaps_the_buffer_mid_step() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[4], &[2], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2]))),
        false,
    )
    .expect("marshal");
    let first = w.reinit_step_data(BufferV::new(), true).expect("reinit");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[4], &[2], &[2]),
        MarshalData::Array(Bytes::from(i32_bytes(&[3, 4]))),
        false,
    )
    .expect("marshal");
    let info = w.close_timestep(0, true).expect("close");

    // The step's data stream is the concatenation of both buffers; the
    // metadata offsets already account for the first buffer's aligned size.
    let mut stream = first.to_vec();
    stream.extend_from_slice(&info.data.to_vec());

    let attrs: Vec<Bytes> = info.attribute_data.clone().into_iter().collect();
    let section = bp5::aggregate::copy_metadata_to_contiguous(
        &info.new_meta_meta_blocks,
        &[info.metadata.clone()],
        &attrs,
        &[stream.len() as u64],
        &[0],
    );
    let ex = StepExchange {
        aggregate: Bytes::from(section),
        data: vec![stream],
        writer_count: 1,
    };

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("x").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![1, 2, 3, 4]);
}

#[test]
fn persisted_step_round_trips_through_a_file() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    let vals: Vec<i32> = (0..64).collect();
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[64], &[64], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&vals))),
        false,
    )
    .expect("marshal");
    let info = w.close_timestep(0, true).expect("close");
    let ex = ship_step(vec![info]);

    // A file transport writes the aggregated metadata, then the data stream.
    let mut file = tempfile::tempfile().expect("tempfile");
    let meta_len = ex.aggregate.len() as u64;
    file.write_all(&meta_len.to_le_bytes()).expect("write");
    file.write_all(&ex.aggregate).expect("write");
    let data_start = 8 + meta_len;
    file.write_all(&ex.data[0]).expect("write");

    // Reopen: breakout, install, plan, and serve reads with seeks.
    file.seek(SeekFrom::Start(0)).expect("seek");
    let mut len_buf = [0u8; 8];
    file.read_exact(&mut len_buf).expect("read");
    let meta_len = u64::from_le_bytes(len_buf);
    let mut agg = vec![0u8; meta_len as usize];
    file.read_exact(&mut agg).expect("read");

    let broken =
        bp5::aggregate::breakout_contiguous_metadata(&Bytes::from(agg), 1).expect("breakout");
    let mut r = Deserializer::new(DeserializerOptions::default());
    for mm in &broken.unique_meta_meta_blocks {
        r.install_meta_meta_data(mm).expect("install mm");
    }
    r.setup_for_step(0, 1);
    r.install_meta_data(broken.metadata_blocks[0].clone(), 0, 0).expect("install");

    let var = r.var("x").expect("discovered");
    r.set_selection(var, &[10], &[5]).expect("select");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let mut served = Vec::new();
    for mut rr in reads {
        file.seek(SeekFrom::Start(data_start + rr.start_offset)).expect("seek");
        let mut buf = vec![0u8; rr.read_length as usize];
        file.read_exact(&mut buf).expect("read");
        rr.destination = Some(buf);
        served.push(rr);
    }
    r.finalize_gets(served).expect("finalize");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![10, 11, 12, 13, 14]);
}

#[test]
fn stager_source_variants_compose() {
    // The stager itself accepts copies, shared slices, and pads.
    let mut b = BufferV::new();
    b.add_to_vec(StageSource::Copy(&[1, 2, 3]), 1, true);
    b.add_to_vec(StageSource::Shared(Bytes::from_static(&[4, 5])), 1, false);
    let end = b.add_to_vec(StageSource::Empty, 8, true);
    assert_eq!(end, 8);
    assert_eq!(b.to_vec(), vec![1, 2, 3, 4, 5, 0, 0, 0]);
}
