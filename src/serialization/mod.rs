//! Typed value space and its JSON-compatible encoding.
//!
//! [`value`] defines the closed, serialisable set of keys and values used for
//! storage leaves and dataset metadata, including dtype-tagged numeric
//! N-dimensional arrays. [`codec`] maps that set bidirectionally onto a
//! JSON-compatible tree with tagged wrappers for bytes, complex numbers and
//! arrays, and with key escaping that keeps integer keys and dotted string
//! keys unambiguous inside document-database paths.

pub mod codec;
pub mod value;

pub use codec::{decode, decode_from_bson, encode, encode_to_bson, escape_key, unescape_key};
pub use value::{Key, NdArray, Value, ValueMap};
