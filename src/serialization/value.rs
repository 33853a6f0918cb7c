//! Typed value space for storage and dataset metadata.
//!
//! Everything the toolkit persists — storage leaves, dataset metadata,
//! encoded array payloads — is drawn from a closed, serialisable value set:
//! null, booleans, integers, floats, complex numbers, strings, byte strings,
//! numeric N-dimensional arrays, sequences, and nested mappings whose keys
//! may be strings or integers. The [`Value`] enum models that set; the
//! [`ValueMap`] container enforces it at insertion time through the type
//! system while preserving insertion order.

use indexmap::IndexMap;
use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use crate::error::{LabError, LabResult};

//==============================================================================
// Keys
//==============================================================================

/// A mapping key: either a string or an integer.
///
/// Integer keys survive the round trip through the JSON-compatible encoding
/// via the `_integer[<n>]` escape, see [`crate::serialization::codec`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Key {
    /// Integer key, including negative integers.
    Int(i64),
    /// String key; may contain dots, which are escaped in encoded form.
    Str(String),
}

impl std::fmt::Display for Key {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Key::Int(n) => write!(f, "{}", n),
            Key::Str(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for Key {
    fn from(n: i64) -> Self {
        Key::Int(n)
    }
}

impl From<i32> for Key {
    fn from(n: i32) -> Self {
        Key::Int(i64::from(n))
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Key::Str(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Key::Str(s)
    }
}

//==============================================================================
// Numeric N-dimensional arrays
//==============================================================================

/// Memory-efficient storage for numeric N-dimensional arrays.
///
/// Supports the restricted element types of the serialisable value space:
/// 32/64-bit signed integers, 32/64-bit floats, and double-precision complex.
/// The dtype strings follow the little-endian width-tagged convention used
/// by the encoded-array wrapper (`<i4`, `<i8`, `<f4`, `<f8`, `<c16`).
#[derive(Debug, Clone, PartialEq)]
pub enum NdArray {
    /// 32-bit signed integer elements.
    Int32(ArrayD<i32>),
    /// 64-bit signed integer elements.
    Int64(ArrayD<i64>),
    /// 32-bit float elements.
    Float32(ArrayD<f32>),
    /// 64-bit float elements.
    Float64(ArrayD<f64>),
    /// Double-precision complex elements.
    Complex128(ArrayD<Complex64>),
}

impl NdArray {
    /// The dtype descriptor recorded in the encoded form.
    pub fn dtype(&self) -> &'static str {
        match self {
            NdArray::Int32(_) => "<i4",
            NdArray::Int64(_) => "<i8",
            NdArray::Float32(_) => "<f4",
            NdArray::Float64(_) => "<f8",
            NdArray::Complex128(_) => "<c16",
        }
    }

    /// Size of one element in bytes.
    pub fn element_size(&self) -> usize {
        match self {
            NdArray::Int32(_) | NdArray::Float32(_) => 4,
            NdArray::Int64(_) | NdArray::Float64(_) => 8,
            NdArray::Complex128(_) => 16,
        }
    }

    /// The array shape.
    pub fn shape(&self) -> &[usize] {
        match self {
            NdArray::Int32(a) => a.shape(),
            NdArray::Int64(a) => a.shape(),
            NdArray::Float32(a) => a.shape(),
            NdArray::Float64(a) => a.shape(),
            NdArray::Complex128(a) => a.shape(),
        }
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    /// Whether the array has zero elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Raw element bytes in logical (row-major) order, little endian.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len() * self.element_size());
        match self {
            NdArray::Int32(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            NdArray::Int64(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            NdArray::Float32(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            NdArray::Float64(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.to_le_bytes());
                }
            }
            NdArray::Complex128(a) => {
                for v in a.iter() {
                    out.extend_from_slice(&v.re.to_le_bytes());
                    out.extend_from_slice(&v.im.to_le_bytes());
                }
            }
        }
        out
    }

    /// Rebuilds an array from its dtype descriptor, shape and raw bytes.
    pub fn from_le_bytes(dtype: &str, shape: &[usize], bytes: &[u8]) -> LabResult<Self> {
        let expected: usize = shape.iter().product();
        let element_size = match dtype {
            "<i4" | "<f4" => 4,
            "<i8" | "<f8" => 8,
            "<c16" => 16,
            other => return Err(LabError::UnknownType(format!("ndarray dtype '{}'", other))),
        };
        if bytes.len() != expected * element_size {
            return Err(LabError::NotSerializable(format!(
                "ndarray payload has {} bytes, shape {:?} needs {}",
                bytes.len(),
                shape,
                expected * element_size
            )));
        }
        let shape = IxDyn(shape);
        let shape_err =
            |_| LabError::NotSerializable("ndarray shape does not match payload".to_string());
        Ok(match dtype {
            "<i4" => {
                let elements = bytes
                    .chunks_exact(4)
                    .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                NdArray::Int32(ArrayD::from_shape_vec(shape, elements).map_err(shape_err)?)
            }
            "<i8" => {
                let elements = bytes
                    .chunks_exact(8)
                    .map(|c| {
                        i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect();
                NdArray::Int64(ArrayD::from_shape_vec(shape, elements).map_err(shape_err)?)
            }
            "<f4" => {
                let elements = bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                NdArray::Float32(ArrayD::from_shape_vec(shape, elements).map_err(shape_err)?)
            }
            "<f8" => {
                let elements = bytes
                    .chunks_exact(8)
                    .map(|c| {
                        f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]])
                    })
                    .collect();
                NdArray::Float64(ArrayD::from_shape_vec(shape, elements).map_err(shape_err)?)
            }
            _ => {
                let elements = bytes
                    .chunks_exact(16)
                    .map(|c| {
                        let re = f64::from_le_bytes([
                            c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7],
                        ]);
                        let im = f64::from_le_bytes([
                            c[8], c[9], c[10], c[11], c[12], c[13], c[14], c[15],
                        ]);
                        Complex64::new(re, im)
                    })
                    .collect();
                NdArray::Complex128(ArrayD::from_shape_vec(shape, elements).map_err(shape_err)?)
            }
        })
    }
}

impl From<ArrayD<i32>> for NdArray {
    fn from(a: ArrayD<i32>) -> Self {
        NdArray::Int32(a)
    }
}

impl From<ArrayD<i64>> for NdArray {
    fn from(a: ArrayD<i64>) -> Self {
        NdArray::Int64(a)
    }
}

impl From<ArrayD<f32>> for NdArray {
    fn from(a: ArrayD<f32>) -> Self {
        NdArray::Float32(a)
    }
}

impl From<ArrayD<f64>> for NdArray {
    fn from(a: ArrayD<f64>) -> Self {
        NdArray::Float64(a)
    }
}

impl From<ArrayD<Complex64>> for NdArray {
    fn from(a: ArrayD<Complex64>) -> Self {
        NdArray::Complex128(a)
    }
}

//==============================================================================
// Values
//==============================================================================

/// A value from the serialisable value space.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Null / absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Int(i64),
    /// Double-precision float.
    Float(f64),
    /// Double-precision complex number.
    Complex(Complex64),
    /// UTF-8 string.
    Str(String),
    /// Raw byte string.
    Bytes(Vec<u8>),
    /// Numeric N-dimensional array.
    Array(NdArray),
    /// Ordered sequence of values.
    Seq(Vec<Value>),
    /// Nested ordered mapping.
    Map(ValueMap),
}

impl Value {
    /// Constructs a byte-string value.
    pub fn bytes(bytes: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(bytes.into())
    }

    /// Short human-readable name of the variant, for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Complex(_) => "complex",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::Array(_) => "ndarray",
            Value::Seq(_) => "sequence",
            Value::Map(_) => "mapping",
        }
    }

    /// Returns the integer value, if this is an `Int`.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    /// Returns the float value, widening integers as well.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(n) => Some(*n as f64),
            _ => None,
        }
    }

    /// Returns the string slice, if this is a `Str`.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the nested mapping, if this is a `Map`.
    pub fn as_map(&self) -> Option<&ValueMap> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the numeric array, if this is an `Array`.
    pub fn as_ndarray(&self) -> Option<&NdArray> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<Complex64> for Value {
    fn from(v: Complex64) -> Self {
        Value::Complex(v)
    }
}

impl From<NdArray> for Value {
    fn from(v: NdArray) -> Self {
        Value::Array(v)
    }
}

impl From<ValueMap> for Value {
    fn from(v: ValueMap) -> Self {
        Value::Map(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Seq(v)
    }
}

//==============================================================================
// Typed container
//==============================================================================

/// Insertion-ordered mapping restricted to serialisable keys and values.
///
/// The closed key and value types make every inhabitant serialisable by
/// construction; nested maps are themselves `ValueMap`s, so the restriction
/// holds recursively.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ValueMap {
    entries: IndexMap<Key, Value>,
}

impl ValueMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a key-value pair, returning the previous value if replaced.
    pub fn insert(&mut self, key: impl Into<Key>, value: impl Into<Value>) -> Option<Value> {
        self.entries.insert(key.into(), value.into())
    }

    /// Looks up a value by key.
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries.get(key)
    }

    /// Looks up a value by string key.
    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.entries.get(&Key::Str(key.to_string()))
    }

    /// Looks up a value by integer key.
    pub fn get_int(&self, key: i64) -> Option<&Value> {
        self.entries.get(&Key::Int(key))
    }

    /// Removes a key, returning its value if present.
    pub fn remove(&mut self, key: &Key) -> Option<Value> {
        self.entries.shift_remove(key)
    }

    /// Whether the key is present.
    pub fn contains_key(&self, key: &Key) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Key, &Value)> {
        self.entries.iter()
    }

    /// Iterates keys in insertion order.
    pub fn keys(&self) -> impl Iterator<Item = &Key> {
        self.entries.keys()
    }
}

impl<K: Into<Key>, V: Into<Value>> FromIterator<(K, V)> for ValueMap {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut map = ValueMap::new();
        for (k, v) in iter {
            map.insert(k, v);
        }
        map
    }
}

impl IntoIterator for ValueMap {
    type Item = (Key, Value);
    type IntoIter = indexmap::map::IntoIter<Key, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.into_iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr1;

    #[test]
    fn test_map_preserves_insertion_order() {
        let mut map = ValueMap::new();
        map.insert("zeta", 1i64);
        map.insert(0i64, 2i64);
        map.insert("alpha", 3i64);
        let keys: Vec<String> = map.keys().map(|k| k.to_string()).collect();
        assert_eq!(keys, vec!["zeta", "0", "alpha"]);
    }

    #[test]
    fn test_map_replaces_existing_key_in_place() {
        let mut map = ValueMap::new();
        map.insert("a", 1i64);
        map.insert("b", 2i64);
        let previous = map.insert("a", 3i64);
        assert_eq!(previous, Some(Value::Int(1)));
        assert_eq!(map.get_str("a"), Some(&Value::Int(3)));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_integer_and_string_keys_are_distinct() {
        let mut map = ValueMap::new();
        map.insert(1i64, "int keyed");
        map.insert("1", "str keyed");
        assert_eq!(map.get_int(1), Some(&Value::Str("int keyed".into())));
        assert_eq!(map.get_str("1"), Some(&Value::Str("str keyed".into())));
    }

    #[test]
    fn test_ndarray_byte_round_trip_all_dtypes() {
        let arrays = vec![
            NdArray::Int32(arr1(&[1i32, -2, 3]).into_dyn()),
            NdArray::Int64(arr1(&[i64::MIN, 0, i64::MAX]).into_dyn()),
            NdArray::Float32(arr1(&[1.5f32, -2.25]).into_dyn()),
            NdArray::Float64(arr1(&[std::f64::consts::PI]).into_dyn()),
            NdArray::Complex128(arr1(&[Complex64::new(1.0, -2.0)]).into_dyn()),
        ];
        for array in arrays {
            let bytes = array.to_le_bytes();
            let back = NdArray::from_le_bytes(array.dtype(), array.shape(), &bytes)
                .expect("byte round trip");
            assert_eq!(array, back);
        }
    }

    #[test]
    fn test_ndarray_from_bytes_rejects_wrong_length() {
        let result = NdArray::from_le_bytes("<f8", &[4], &[0u8; 16]);
        assert!(matches!(result, Err(LabError::NotSerializable(_))));
    }

    #[test]
    fn test_ndarray_from_bytes_rejects_unknown_dtype() {
        let result = NdArray::from_le_bytes("<u2", &[1], &[0u8; 2]);
        assert!(matches!(result, Err(LabError::UnknownType(_))));
    }

    #[test]
    fn test_ndarray_two_dimensional_round_trip() {
        let array = NdArray::Float64(
            ArrayD::from_shape_vec(IxDyn(&[2, 3]), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
                .expect("shape"),
        );
        let back = NdArray::from_le_bytes("<f8", &[2, 3], &array.to_le_bytes()).expect("round");
        assert_eq!(array, back);
        assert_eq!(back.shape(), &[2, 3]);
    }
}
