//! Measurement data model: labelled arrays, datasets, and their channels.
//!
//! - [`array`]: [`DataArray`], an N-dimensional numeric array with name,
//!   label, unit, setpoint flag and shared axis handles.
//! - [`dataset`]: [`DataSet`], the aggregate of setpoint and data arrays
//!   plus metadata, with producer fan-out and consumer synchronisation.
//! - [`io`]: the writer/reader contract and the change-event types shared
//!   by every channel.
//! - [`memory_io`]: single-process channel over a bounded FIFO.
//! - [`mongo_io`]: document-database channel with a change-stream reader.

pub mod array;
pub mod dataset;
pub mod io;
pub mod memory_io;
pub mod mongo_io;

pub use array::{ArrayRef, DataArray, DataArrayBuilder};
pub use dataset::DataSet;
pub use io::{
    ArraySnapshot, DataSetReader, DataSetWriter, DataValue, MetadataEvent, SyncWait,
};
pub use memory_io::{DataSetEvent, MemoryIoFactory, MemoryReader, MemoryWriter};
pub use mongo_io::{MongoIoSettings, MongoReader, MongoWriter};
