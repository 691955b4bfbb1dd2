//! Compressed-block round trips: whole-block reads under an operator and
//! byte-exact decode of subregions.

#![cfg(feature = "lz4_flex")]

mod common;

use bp5::{
    BufferV, DataType, Deserializer, DeserializerOptions, MarshalData, PutSpec, Serializer,
    SerializerOptions,
};
use bytes::Bytes;
use common::{f32_bytes, f32_vals, install_step, serve_reads, ship_step};

#[test]
fn compressed_block_round_trip() {
    // 4096 floats with enough structure to compress.
    let vals: Vec<f32> = (0..4096).map(|i| ((i % 32) as f32) * 0.25).collect();
    let payload = f32_bytes(&vals);

    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("field", DataType::Float, &[4096], &[4096], &[0])
            .with_operator("lz4"),
        MarshalData::Array(Bytes::from(payload.clone())),
        false,
    )
    .expect("marshal");
    let info = w.close_timestep(0, true).expect("close");
    // The stager holds the compressed form, which must beat the raw size.
    assert!(info.data.size() < payload.len() as u64);
    let ex = ship_step(vec![info]);

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("field").expect("discovered");

    // Any sub-box still fetches the whole compressed block.
    r.set_selection(var, &[100], &[50]).expect("select");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, max_read) = r.generate_read_requests(false).expect("plan");
    assert_eq!(reads.len(), 1);
    let compressed_len = reads[0].read_length;
    assert!(compressed_len < payload.len() as u64);
    assert_eq!(max_read, compressed_len);
    assert_eq!(reads[0].offset_in_block, 0);

    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    let out = f32_vals(&r.take_data(h).expect("data"));
    assert_eq!(out, vals[100..150].to_vec());
}

#[test]
fn compressed_whole_array_matches_source() {
    let vals: Vec<f32> = (0..4096).map(|i| (i as f32).sin()).collect();
    let payload = f32_bytes(&vals);

    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("field", DataType::Float, &[4096], &[4096], &[0])
            .with_operator("LZ4"),
        MarshalData::Array(Bytes::from(payload.clone())),
        false,
    )
    .expect("marshal");
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("field").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(true).expect("plan");
    // Temp buffers were requested; the transport fills them in place.
    let mut served = Vec::new();
    for mut rr in reads {
        let stream = &ex.data[rr.writer_rank];
        let at = rr.start_offset as usize;
        let dest = rr.destination.as_mut().expect("allocated");
        dest.copy_from_slice(&stream[at..at + rr.read_length as usize]);
        served.push(rr);
    }
    r.finalize_gets(served).expect("finalize");
    assert_eq!(r.take_data(h).expect("data"), payload);
}

#[test]
fn min_max_is_maintained_for_compressed_blocks() {
    let vals: Vec<f32> = (0..512).map(|i| (i as f32) - 256.0).collect();
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("field", DataType::Float, &[512], &[512], &[0])
            .with_operator("lz4"),
        MarshalData::Array(Bytes::from(f32_bytes(&vals))),
        false,
    )
    .expect("marshal");
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("field").expect("discovered");
    let mm = r.variable_min_max(var, 0).expect("stats").expect("present");
    assert_eq!(mm.min, Some(bp5::ScalarValue::F32(-256.0)));
    assert_eq!(mm.max, Some(bp5::ScalarValue::F32(255.0)));
}
