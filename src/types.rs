//! The element type registry and the small value types shared by the write
//! and read sides: data types with their wire tags and sizes, shape kinds,
//! memory spaces, and min/max statistics handling.
//!
//! Every concrete element type maps to a stable numeric code (used inside
//! encoded field names), a wire tag string (used inside layout descriptors,
//! so heterogeneous cohorts stay self-describing), and a fixed element size.
//! Strings are the exception: their metadata representation is a reference
//! into the record heap, so their metadata size is 8.

use crate::error::{Bp5Error, Result};

/// Supported element types.
///
/// The numeric codes are part of the wire format (they appear in encoded
/// field names) and must never be reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum DataType {
    /// Absent / unsupported.
    None = 0,
    /// Signed 8-bit integer.
    Int8 = 1,
    /// Signed 16-bit integer.
    Int16 = 2,
    /// Signed 32-bit integer.
    Int32 = 3,
    /// Signed 64-bit integer.
    Int64 = 4,
    /// Unsigned 8-bit integer.
    UInt8 = 5,
    /// Unsigned 16-bit integer.
    UInt16 = 6,
    /// Unsigned 32-bit integer.
    UInt32 = 7,
    /// Unsigned 64-bit integer.
    UInt64 = 8,
    /// IEEE-754 single precision.
    Float = 9,
    /// IEEE-754 double precision.
    Double = 10,
    /// Extended precision, archived as an opaque 16-byte payload.
    LongDouble = 11,
    /// Two single-precision floats (real, imaginary).
    FloatComplex = 12,
    /// Two double-precision floats (real, imaginary).
    DoubleComplex = 13,
    /// Variable-length string; metadata representation is a heap reference.
    String = 14,
    /// Platform character, treated as a signed byte.
    Char = 15,
    /// User-defined struct; not marshalable by this core.
    Struct = 16,
}

impl DataType {
    /// The stable numeric code embedded in encoded field names.
    pub fn code(self) -> u32 {
        self as u32
    }

    /// Inverse of [`DataType::code`].
    pub fn from_code(code: u32) -> Result<Self> {
        Ok(match code {
            0 => Self::None,
            1 => Self::Int8,
            2 => Self::Int16,
            3 => Self::Int32,
            4 => Self::Int64,
            5 => Self::UInt8,
            6 => Self::UInt16,
            7 => Self::UInt32,
            8 => Self::UInt64,
            9 => Self::Float,
            10 => Self::Double,
            11 => Self::LongDouble,
            12 => Self::FloatComplex,
            13 => Self::DoubleComplex,
            14 => Self::String,
            15 => Self::Char,
            16 => Self::Struct,
            other => {
                return Err(Bp5Error::Format(format!("Unknown data type code {other}")));
            }
        })
    }

    /// The wire tag used in layout descriptors, or `None` for types that
    /// cannot appear in a record (`None`, `Struct`).
    pub fn wire_tag(self) -> Option<&'static str> {
        match self {
            Self::None | Self::Struct => None,
            Self::Char | Self::Int8 | Self::Int16 | Self::Int32 | Self::Int64 => Some("integer"),
            Self::UInt8 | Self::UInt16 | Self::UInt32 | Self::UInt64 => Some("unsigned integer"),
            Self::Float | Self::Double | Self::LongDouble => Some("float"),
            Self::FloatComplex => Some("complex4"),
            Self::DoubleComplex => Some("complex8"),
            Self::String => Some("string"),
        }
    }

    /// The payload element size in bytes. Strings report their metadata
    /// representation (a heap reference, 8 bytes); `None`/`Struct` report 0.
    pub fn size(self) -> u64 {
        match self {
            Self::None | Self::Struct => 0,
            Self::Char | Self::Int8 | Self::UInt8 => 1,
            Self::Int16 | Self::UInt16 => 2,
            Self::Int32 | Self::UInt32 | Self::Float => 4,
            Self::Int64 | Self::UInt64 | Self::Double | Self::FloatComplex => 8,
            Self::LongDouble | Self::DoubleComplex => 16,
            Self::String => 8,
        }
    }

    /// Recovers a concrete type from a wire tag plus the recorded field size.
    ///
    /// An 8-byte `float` is a `Double`, a 16-byte one a `LongDouble`; the
    /// signed integer tags never distinguish `Char` from `Int8` (the writer
    /// folds both into one archival type).
    pub fn from_wire(tag: &str, size: u64) -> Result<Self> {
        let t = match (tag, size) {
            ("integer", 1) => Self::Int8,
            ("integer", 2) => Self::Int16,
            ("integer", 4) => Self::Int32,
            ("integer", 8) => Self::Int64,
            ("unsigned integer", 1) => Self::UInt8,
            ("unsigned integer", 2) => Self::UInt16,
            ("unsigned integer", 4) => Self::UInt32,
            ("unsigned integer", 8) => Self::UInt64,
            ("float", 4) => Self::Float,
            ("float", 8) => Self::Double,
            ("float", 16) => Self::LongDouble,
            ("complex4", _) => Self::FloatComplex,
            ("complex8", _) => Self::DoubleComplex,
            ("string", _) => Self::String,
            _ => {
                return Err(Bp5Error::Format(format!(
                    "Unrecognized wire type \"{tag}\" of size {size}"
                )));
            }
        };
        Ok(t)
    }
}

/// The geometric kind of a variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeId {
    /// Not yet determined.
    Unknown,
    /// One value shared by the cohort.
    GlobalValue,
    /// One value per writer; readers see a 1-D global array of cohort size.
    LocalValue,
    /// An N-D array with a cohort-wide shape and per-block offsets.
    GlobalArray,
    /// An N-D array with per-writer extents and no global shape.
    LocalArray,
    /// An N-D array whose global shape is joined from per-writer extents.
    JoinedArray,
}

impl ShapeId {
    /// The three-character field-name prefix encoding this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Unknown => "BPU",
            Self::GlobalValue => "BPg",
            Self::LocalValue => "BPl",
            Self::GlobalArray => "BPG",
            Self::LocalArray => "BPL",
            Self::JoinedArray => "BPJ",
        }
    }

    /// Recovers the kind from the third prefix character.
    pub fn from_prefix_char(c: u8) -> Self {
        match c {
            b'g' => Self::GlobalValue,
            b'l' => Self::LocalValue,
            b'G' => Self::GlobalArray,
            b'L' => Self::LocalArray,
            b'J' => Self::JoinedArray,
            _ => Self::Unknown,
        }
    }

    /// True for the array kinds (the ones carried as `MetaArray` fields).
    pub fn is_array(self) -> bool {
        matches!(self, Self::GlobalArray | Self::LocalArray | Self::JoinedArray)
    }
}

/// Where a payload buffer lives.
///
/// The core never owns a device runtime; the tag is carried through put and
/// get requests so an embedder can route the final copy leg through its own
/// staging path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MemorySpace {
    /// Ordinary host memory.
    #[default]
    Host,
    /// Device (accelerator) memory.
    Device,
}

/// A typed scalar, used for min/max statistics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ScalarValue {
    /// Signed integer slot (Char and Int8..Int64).
    I8(i8),
    /// 16-bit signed.
    I16(i16),
    /// 32-bit signed.
    I32(i32),
    /// 64-bit signed.
    I64(i64),
    /// 8-bit unsigned.
    U8(u8),
    /// 16-bit unsigned.
    U16(u16),
    /// 32-bit unsigned.
    U32(u32),
    /// 64-bit unsigned.
    U64(u64),
    /// Single precision.
    F32(f32),
    /// Double precision.
    F64(f64),
}

macro_rules! minmax_dispatch {
    ($dtype:expr, $f:ident) => {
        match $dtype {
            DataType::Char | DataType::Int8 => $f!(i8, I8, 1),
            DataType::Int16 => $f!(i16, I16, 2),
            DataType::Int32 => $f!(i32, I32, 4),
            DataType::Int64 => $f!(i64, I64, 8),
            DataType::UInt8 => $f!(u8, U8, 1),
            DataType::UInt16 => $f!(u16, U16, 2),
            DataType::UInt32 => $f!(u32, U32, 4),
            DataType::UInt64 => $f!(u64, U64, 8),
            DataType::Float => $f!(f32, F32, 4),
            DataType::Double => $f!(f64, F64, 8),
            _ => None,
        }
    };
}

/// Decodes one little-endian element of the given type, or `None` for types
/// without a statistics slot (complex, string, long double, struct).
pub fn decode_scalar(dtype: DataType, bytes: &[u8]) -> Option<ScalarValue> {
    macro_rules! read {
        ($t:ty, $v:ident, $n:literal) => {{
            let arr: [u8; $n] = bytes.get(..$n)?.try_into().ok()?;
            Some(ScalarValue::$v(<$t>::from_le_bytes(arr)))
        }};
    }
    minmax_dispatch!(dtype, read)
}

/// Running min/max statistics for one variable or block.
///
/// Initialized to the type's extremes so that folding any element narrows
/// the range. Types without a statistics slot stay `None` throughout.
#[derive(Debug, Clone, PartialEq)]
pub struct MinMaxStruct {
    /// The element type the slots are typed as.
    pub dtype: DataType,
    /// Smallest element folded so far.
    pub min: Option<ScalarValue>,
    /// Largest element folded so far.
    pub max: Option<ScalarValue>,
}

impl MinMaxStruct {
    /// Fresh statistics, initialized to the extremes of `dtype`.
    pub fn init(dtype: DataType) -> Self {
        macro_rules! extremes {
            ($t:ty, $v:ident, $n:literal) => {
                Some((ScalarValue::$v(<$t>::MAX), ScalarValue::$v(<$t>::MIN)))
            };
        }
        let pair = minmax_dispatch!(dtype, extremes);
        match pair {
            Some((min, max)) => Self { dtype, min: Some(min), max: Some(max) },
            None => Self { dtype, min: None, max: None },
        }
    }

    /// Folds one little-endian element into the running min and max.
    pub fn apply_element(&mut self, bytes: &[u8]) {
        let Some(v) = decode_scalar(self.dtype, bytes) else {
            return;
        };
        macro_rules! fold {
            ($v:ident, $new:expr) => {
                if let (Some(ScalarValue::$v(min)), Some(ScalarValue::$v(max))) =
                    (&mut self.min, &mut self.max)
                {
                    if $new < *min {
                        *min = $new;
                    }
                    if $new > *max {
                        *max = $new;
                    }
                }
            };
        }
        match v {
            ScalarValue::I8(x) => fold!(I8, x),
            ScalarValue::I16(x) => fold!(I16, x),
            ScalarValue::I32(x) => fold!(I32, x),
            ScalarValue::I64(x) => fold!(I64, x),
            ScalarValue::U8(x) => fold!(U8, x),
            ScalarValue::U16(x) => fold!(U16, x),
            ScalarValue::U32(x) => fold!(U32, x),
            ScalarValue::U64(x) => fold!(U64, x),
            ScalarValue::F32(x) => fold!(F32, x),
            ScalarValue::F64(x) => fold!(F64, x),
        }
    }

    /// Folds another statistics record into this one.
    pub fn merge(&mut self, other: &MinMaxStruct) {
        if let Some(min) = &other.min {
            self.apply_element(&encode_scalar(*min));
        }
        if let Some(max) = &other.max {
            self.apply_element(&encode_scalar(*max));
        }
    }
}

/// Encodes a typed scalar back to its little-endian element bytes.
pub fn encode_scalar(v: ScalarValue) -> Vec<u8> {
    match v {
        ScalarValue::I8(x) => x.to_le_bytes().to_vec(),
        ScalarValue::I16(x) => x.to_le_bytes().to_vec(),
        ScalarValue::I32(x) => x.to_le_bytes().to_vec(),
        ScalarValue::I64(x) => x.to_le_bytes().to_vec(),
        ScalarValue::U8(x) => x.to_le_bytes().to_vec(),
        ScalarValue::U16(x) => x.to_le_bytes().to_vec(),
        ScalarValue::U32(x) => x.to_le_bytes().to_vec(),
        ScalarValue::U64(x) => x.to_le_bytes().to_vec(),
        ScalarValue::F32(x) => x.to_le_bytes().to_vec(),
        ScalarValue::F64(x) => x.to_le_bytes().to_vec(),
    }
}

/// Element-wise min/max over a raw payload buffer.
///
/// Returns the little-endian `(min, max)` element byte pair, or `None` for
/// an empty buffer or a type without a statistics slot.
pub fn compute_min_max(data: &[u8], dtype: DataType) -> Option<(Vec<u8>, Vec<u8>)> {
    let elem = dtype.size() as usize;
    if elem == 0 || data.len() < elem {
        return None;
    }
    let mut mm = MinMaxStruct::init(dtype);
    mm.min.as_ref()?;
    for chunk in data.chunks_exact(elem) {
        mm.apply_element(chunk);
    }
    match (mm.min, mm.max) {
        (Some(min), Some(max)) => Some((encode_scalar(min), encode_scalar(max))),
        _ => None,
    }
}

/// Number of elements described by a dimension tuple (1 for scalars).
pub(crate) fn elem_product(dims: &[u64]) -> u64 {
    dims.iter().product()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_tag_round_trip() {
        for t in [
            DataType::Int8,
            DataType::Int16,
            DataType::Int32,
            DataType::Int64,
            DataType::UInt8,
            DataType::UInt16,
            DataType::UInt32,
            DataType::UInt64,
            DataType::Float,
            DataType::Double,
        ] {
            let tag = t.wire_tag().expect("tag");
            assert_eq!(DataType::from_wire(tag, t.size()).expect("from_wire"), t);
        }
    }

    #[test]
    fn min_max_over_buffer() {
        let vals: Vec<i32> = vec![5, -3, 42, 0];
        let bytes: Vec<u8> = vals.iter().flat_map(|v| v.to_le_bytes()).collect();
        let (min, max) = compute_min_max(&bytes, DataType::Int32).expect("stats");
        assert_eq!(i32::from_le_bytes(min.try_into().expect("len")), -3);
        assert_eq!(i32::from_le_bytes(max.try_into().expect("len")), 42);
    }

    #[test]
    fn no_stats_for_complex() {
        assert!(compute_min_max(&[0u8; 16], DataType::DoubleComplex).is_none());
        let mm = MinMaxStruct::init(DataType::String);
        assert!(mm.min.is_none());
    }
}
