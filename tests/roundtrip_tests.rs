//! End-to-end round trips through the full write → ship → read cycle:
//! scalars, global arrays, majorness mismatch, local values, strings.

mod common;

use bp5::types::ScalarValue;
use bp5::{
    BufferV, DataType, Deserializer, DeserializerOptions, MarshalData, PutSpec, Serializer,
    SerializerOptions,
};
use bytes::Bytes;
use common::{i32_bytes, i32_vals, install_step, serve_reads, ship_step};

fn writer() -> Serializer {
    Serializer::new(SerializerOptions::default())
}

fn reader() -> Deserializer {
    Deserializer::new(DeserializerOptions::default())
}

#[test]
fn scalar_round_trip_two_writers() {
    // Writer 0 puts v = 42, writer 1 puts v = 7.
    let mut infos = Vec::new();
    for v in [42i32, 7] {
        let mut w = writer();
        w.init_step(BufferV::new()).expect("init");
        w.marshal(
            &PutSpec::scalar("v", DataType::Int32),
            MarshalData::Scalar(&v.to_le_bytes()),
            false,
        )
        .expect("marshal");
        infos.push(w.close_timestep(0, true).expect("close"));
    }
    let ex = ship_step(infos);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("v").expect("discovered");

    // Block selection addresses individual writers.
    r.set_block_selection(var, 0).expect("select");
    let (h0, deferred) = r.queue_get(var).expect("queue");
    assert!(!deferred, "scalars resolve synchronously");
    assert_eq!(i32_vals(&r.take_data(h0).expect("data")), vec![42]);

    r.set_block_selection(var, 1).expect("select");
    let (h1, _) = r.queue_get(var).expect("queue");
    assert_eq!(i32_vals(&r.take_data(h1).expect("data")), vec![7]);

    let mm = r.variable_min_max(var, 0).expect("stats").expect("present");
    assert_eq!(mm.min, Some(ScalarValue::I32(7)));
    assert_eq!(mm.max, Some(ScalarValue::I32(42)));
}

#[test]
fn global_2d_row_partition() {
    // Shape {2, 8}: writer 0 owns row 0 with 0..8, writer 1 owns row 1 with
    // 100..108.
    let shape = [2u64, 8];
    let mut infos = Vec::new();
    for (row, base) in [(0u64, 0i32), (1, 100)] {
        let mut w = writer();
        w.init_step(BufferV::new()).expect("init");
        let vals: Vec<i32> = (0..8).map(|i| base + i).collect();
        w.marshal(
            &PutSpec::global_array("grid", DataType::Int32, &shape, &[1, 8], &[row, 0]),
            MarshalData::Array(Bytes::from(i32_bytes(&vals))),
            false,
        )
        .expect("marshal");
        infos.push(w.close_timestep(0, true).expect("close"));
    }
    let ex = ship_step(infos);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("grid").expect("discovered");
    assert_eq!(r.var_info(var).expect("info").shape, Some(vec![2, 8]));

    r.set_selection(var, &[0, 3], &[2, 3]).expect("select");
    let (h, deferred) = r.queue_get(var).expect("queue");
    assert!(deferred);
    let (reads, max_read) = r.generate_read_requests(false).expect("plan");
    assert_eq!(reads.len(), 2, "one range per intersecting block");
    assert!(max_read >= 12);
    // Each request covers exactly the selected columns of one row.
    for rr in &reads {
        assert_eq!(rr.read_length, 12);
    }
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(
        i32_vals(&r.take_data(h).expect("data")),
        vec![3, 4, 5, 103, 104, 105]
    );
}

#[test]
fn whole_shape_get_recovers_put_order() {
    let shape = [4u64, 4];
    let mut infos = Vec::new();
    for row in 0..4u64 {
        let mut w = writer();
        w.init_step(BufferV::new()).expect("init");
        let vals: Vec<i32> = (0..4).map(|i| (row * 10) as i32 + i).collect();
        w.marshal(
            &PutSpec::global_array("a", DataType::Int32, &shape, &[1, 4], &[row, 0]),
            MarshalData::Array(Bytes::from(i32_bytes(&vals))),
            true,
        )
        .expect("marshal");
        infos.push(w.close_timestep(0, true).expect("close"));
    }
    let ex = ship_step(infos);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("a").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue whole shape");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(
        i32_vals(&r.take_data(h).expect("data")),
        vec![0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23, 30, 31, 32, 33]
    );
}

#[test]
fn majorness_mismatch_yields_transpose() {
    // Row-major writer, column-major reader, shape {3, 4}.
    let mut w = writer();
    w.init_step(BufferV::new()).expect("init");
    let vals: Vec<i32> = (0..12).collect();
    w.marshal(
        &PutSpec::global_array("m", DataType::Int32, &[3, 4], &[3, 4], &[0, 0]),
        MarshalData::Array(Bytes::from(i32_bytes(&vals))),
        false,
    )
    .expect("marshal");
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = Deserializer::new(DeserializerOptions {
        writer_is_row_major: true,
        reader_is_row_major: false,
        random_access: false,
    });
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("m").expect("discovered");
    // The reader sees the dimensions in its own majorness.
    assert_eq!(r.var_info(var).expect("info").shape, Some(vec![4, 3]));

    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    let out = i32_vals(&r.take_data(h).expect("data"));
    // Column-major {4,3}: element (i,j) lives at i + 4*j and equals the
    // writer's row-major a[j][i].
    for j in 0..3 {
        for i in 0..4 {
            assert_eq!(out[i + 4 * j], (j * 4 + i) as i32);
        }
    }
}

#[test]
fn local_values_lift_to_cohort_array() {
    let mut infos = Vec::new();
    for rank in 0..3i32 {
        let mut w = writer();
        w.init_step(BufferV::new()).expect("init");
        w.marshal(
            &PutSpec::local_value("rank_id", DataType::Int32),
            MarshalData::Scalar(&(rank * 11).to_le_bytes()),
            false,
        )
        .expect("marshal");
        infos.push(w.close_timestep(0, true).expect("close"));
    }
    let ex = ship_step(infos);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("rank_id").expect("discovered");
    let info = r.var_info(var).expect("info");
    assert_eq!(info.dims, 1);

    let (h, deferred) = r.queue_get(var).expect("queue");
    assert!(!deferred);
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![0, 11, 22]);
}

#[test]
fn string_scalars_round_trip_and_overwrite() {
    let mut w = writer();
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::scalar("label", DataType::String),
        MarshalData::Str("first"),
        false,
    )
    .expect("marshal");
    // Overwriting within a step frees the prior duplicate and wins.
    w.marshal(
        &PutSpec::scalar("label", DataType::String),
        MarshalData::Str("second"),
        false,
    )
    .expect("marshal");
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("label").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    assert_eq!(r.take_data(h).expect("data"), b"second".to_vec());
}

#[test]
fn empty_intersection_leaves_destination_untouched() {
    let mut w = writer();
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[8], &[4], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2, 3, 4]))),
        false,
    )
    .expect("marshal");
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("x").expect("discovered");
    // Select the half no block covers.
    r.set_selection(var, &[4], &[4]).expect("select");
    let sentinel = vec![0xEEu8; 16];
    let (h, _) = r.queue_get_into(var, sentinel.clone()).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    assert!(reads.is_empty(), "nothing intersects");
    r.finalize_gets(reads).expect("finalize");
    assert_eq!(r.take_data(h).expect("data"), sentinel);
}

#[test]
fn multi_block_puts_number_in_call_order() {
    // One writer appends two blocks of the same variable in one step.
    let mut w = writer();
    w.init_step(BufferV::new()).expect("init");
    for (at, vals) in [(0u64, [1i32, 2]), (2, [3, 4])] {
        w.marshal(
            &PutSpec::global_array("x", DataType::Int32, &[4], &[2], &[at]),
            MarshalData::Array(Bytes::from(i32_bytes(&vals))),
            false,
        )
        .expect("marshal");
    }
    let ex = ship_step(vec![w.close_timestep(0, true).expect("close")]);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("x").expect("discovered");
    let mv = r.min_blocks_info(var, 0).expect("blocks");
    assert_eq!(mv.blocks.len(), 2);
    assert_eq!(mv.blocks[0].start, Some(vec![0]));
    assert_eq!(mv.blocks[1].start, Some(vec![2]));

    let (h, _) = r.queue_get(var).expect("queue");
    let (reads, _) = r.generate_read_requests(false).expect("plan");
    let served = serve_reads(reads, std::slice::from_ref(&ex));
    r.finalize_gets(served).expect("finalize");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![1, 2, 3, 4]);
}

#[test]
fn heterogeneous_cohort_is_not_an_error() {
    // Writer 1 never writes "only_on_rank0"; its bit is simply unset there.
    let mut infos = Vec::new();
    for rank in 0..2 {
        let mut w = writer();
        w.init_step(BufferV::new()).expect("init");
        w.marshal(
            &PutSpec::scalar("everywhere", DataType::Int32),
            MarshalData::Scalar(&5i32.to_le_bytes()),
            false,
        )
        .expect("marshal");
        if rank == 0 {
            w.marshal(
                &PutSpec::scalar("only_on_rank0", DataType::Int32),
                MarshalData::Scalar(&9i32.to_le_bytes()),
                false,
            )
            .expect("marshal");
        }
        infos.push(w.close_timestep(0, true).expect("close"));
    }
    let ex = ship_step(infos);

    let mut r = reader();
    install_step(&mut r, &ex, 0).expect("install");
    let var = r.var("only_on_rank0").expect("discovered");
    let (h, _) = r.queue_get(var).expect("queue");
    assert_eq!(i32_vals(&r.take_data(h).expect("data")), vec![9]);
}

#[test]
fn marshal_before_init_is_a_logic_error() {
    let mut w = writer();
    let err = w
        .marshal(
            &PutSpec::global_array("x", DataType::Int32, &[2], &[2], &[0]),
            MarshalData::Array(Bytes::from(i32_bytes(&[1, 2]))),
            false,
        )
        .expect_err("must fail");
    assert!(matches!(err, bp5::Bp5Error::Logic(_)));
}

#[test]
fn shape_shrink_below_recorded_block_is_rejected() {
    let mut w = writer();
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[8], &[4], &[4]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2, 3, 4]))),
        false,
    )
    .expect("marshal");
    // A second block may refine the shape upward, not below 4 + 4.
    let err = w
        .marshal(
            &PutSpec::global_array("x", DataType::Int32, &[6], &[2], &[0]),
            MarshalData::Array(Bytes::from(i32_bytes(&[5, 6]))),
            false,
        )
        .expect_err("shrink must fail");
    assert!(matches!(err, bp5::Bp5Error::InvalidArgument(_)));
}
