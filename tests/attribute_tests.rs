//! Attribute marshaling and installation: scalars, arrays, strings, and the
//! step-change clearing rule.

mod common;

use bp5::{
    AttrData, AttrValue, BufferV, DataType, Deserializer, DeserializerOptions, MarshalData,
    PutSpec, Serializer, SerializerOptions,
};
use bytes::Bytes;
use common::{i32_bytes, install_step, ship_step};

fn close_with_attrs(w: &mut Serializer, step: u64) -> bp5::TimestepInfo {
    w.init_step(BufferV::new()).expect("init");
    // A step always carries at least one variable here, so the metadata
    // record is non-trivial alongside the attributes.
    w.marshal(
        &PutSpec::scalar("tick", DataType::Int32),
        MarshalData::Scalar(&(step as i32).to_le_bytes()),
        false,
    )
    .expect("marshal");
    w.close_timestep(step, true).expect("close")
}

#[test]
fn attribute_kinds_round_trip() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.marshal_attribute("answer", DataType::Int32, AttrData::Scalar(&42i32.to_le_bytes()))
        .expect("scalar");
    w.marshal_attribute("title", DataType::String, AttrData::Str("shock tube"))
        .expect("string");
    w.marshal_attribute("origin", DataType::Double, AttrData::Array(&f64_bytes(&[0.5, 1.5, 2.5])))
        .expect("array");
    let tags = vec!["alpha".to_string(), "beta".to_string()];
    w.marshal_attribute("tags", DataType::String, AttrData::StrArray(&tags))
        .expect("string array");

    let ex = ship_step(vec![close_with_attrs(&mut w, 0)]);
    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");

    let attrs = r.attributes();
    assert_eq!(
        attrs.get("answer"),
        Some(&AttrValue::Data { dtype: DataType::Int32, bytes: 42i32.to_le_bytes().to_vec() })
    );
    assert_eq!(attrs.get("title"), Some(&AttrValue::Str("shock tube".into())));
    assert_eq!(
        attrs.get("origin"),
        Some(&AttrValue::DataArray {
            dtype: DataType::Double,
            bytes: f64_bytes(&[0.5, 1.5, 2.5]),
            elem_count: 3,
        })
    );
    assert_eq!(attrs.get("tags"), Some(&AttrValue::StrArray(tags)));
}

#[test]
fn attributes_clear_when_the_step_changes() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.marshal_attribute("only_step0", DataType::Int32, AttrData::Scalar(&1i32.to_le_bytes()))
        .expect("attr");
    let step0 = ship_step(vec![close_with_attrs(&mut w, 0)]);

    w.marshal_attribute("only_step1", DataType::Int32, AttrData::Scalar(&2i32.to_le_bytes()))
        .expect("attr");
    let step1 = ship_step(vec![close_with_attrs(&mut w, 1)]);

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &step0, 0).expect("install");
    assert!(r.attributes().contains_key("only_step0"));

    install_step(&mut r, &step1, 1).expect("install");
    assert!(!r.attributes().contains_key("only_step0"));
    assert!(r.attributes().contains_key("only_step1"));
}

#[test]
fn rewriting_an_attribute_in_one_step_overwrites() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.marshal_attribute("v", DataType::Int32, AttrData::Scalar(&1i32.to_le_bytes()))
        .expect("attr");
    w.marshal_attribute("v", DataType::Int32, AttrData::Scalar(&2i32.to_le_bytes()))
        .expect("attr");
    let ex = ship_step(vec![close_with_attrs(&mut w, 0)]);

    let mut r = Deserializer::new(DeserializerOptions::default());
    install_step(&mut r, &ex, 0).expect("install");
    assert_eq!(
        r.attributes().get("v"),
        Some(&AttrValue::Data { dtype: DataType::Int32, bytes: 2i32.to_le_bytes().to_vec() })
    );
}

#[test]
fn a_step_without_attributes_ships_none() {
    let mut w = Serializer::new(SerializerOptions::default());
    w.init_step(BufferV::new()).expect("init");
    w.marshal(
        &PutSpec::global_array("x", DataType::Int32, &[2], &[2], &[0]),
        MarshalData::Array(Bytes::from(i32_bytes(&[1, 2]))),
        false,
    )
    .expect("marshal");
    let info = w.close_timestep(0, true).expect("close");
    assert!(info.attribute_data.is_none());
}

fn f64_bytes(vals: &[f64]) -> Vec<u8> {
    vals.iter().flat_map(|v| v.to_le_bytes()).collect()
}
