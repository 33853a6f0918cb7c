//! # qulab
//!
//! Core library for quantum-measurement laboratory tooling. It provides the
//! dataset/array model with live producer–consumer replication and a tagged
//! hierarchical storage layer with typed encoding. Instrument drivers and
//! configuration schemas are external collaborators; they consume the
//! [`serialization`] value space and the [`storage`] save/load/list surface.
//!
//! ## Crate Structure
//!
//! The library is organized into several modules, each with a distinct
//! responsibility:
//!
//! - **`data`**: Labelled N-dimensional arrays ([`data::DataArray`]),
//!   dataset aggregates ([`data::DataSet`]), and the writer/reader channels
//!   replicating a producer dataset into consumer mirrors — in-process over
//!   a bounded FIFO, or across processes through a document database
//!   change stream.
//! - **`storage`**: A tagged hierarchical key-value store
//!   ([`storage::Storage`]) with an in-memory tree backend and a
//!   materialised-path document-database backend.
//! - **`serialization`**: The closed serialisable value space
//!   ([`serialization::Value`]) and its bidirectional JSON-compatible
//!   encoding with tagged wrappers and key escaping.
//! - **`error`**: The central [`error::LabError`] type for the whole crate.
//! - **`validation`**: Identifier and tag-component validators.
//!
//! ## Example
//!
//! ```rust
//! use qulab::data::{DataArray, DataSet, MemoryIoFactory, SyncWait};
//!
//! # fn main() -> qulab::error::LabResult<()> {
//! let (writer, reader) = MemoryIoFactory::create();
//!
//! let mut producer = DataSet::new("sweep");
//! producer.attach_writer(Box::new(writer))?;
//! producer.add_array(DataArray::builder("signal").shape(&[5, 5]).build_shared()?)?;
//! producer.add_scalar(&[4, 1], "signal", 1234.0)?;
//!
//! let mut consumer = DataSet::new("mirror");
//! consumer.bind_reader(Box::new(reader))?;
//! consumer.sync_from_storage(SyncWait::Block)?;
//!
//! let mirrored = consumer.array("signal").ok_or_else(|| {
//!     qulab::error::LabError::UnknownArray("signal".into())
//! })?;
//! assert_eq!(mirrored.read().get(&[4, 1])?, 1234.0);
//! # Ok(())
//! # }
//! ```

pub mod data;
pub mod error;
pub mod serialization;
pub mod storage;
pub mod validation;

pub use data::{ArrayRef, DataArray, DataSet, SyncWait};
pub use error::{LabError, LabResult};
pub use serialization::{Key, NdArray, Value, ValueMap};
pub use storage::{MemoryStorage, MongoStorage, Storage, Tag};
