//! Writer/reader contract between datasets and their channels.
//!
//! A producer dataset fans every change out to its attached
//! [`DataSetWriter`]s as one of three change events: a metadata update, an
//! array creation, or a data write. A consumer dataset owns one bound
//! [`DataSetReader`] that drains those events and rebuilds a mirror of the
//! producer. Channels preserve per-producer order, deliver array creation
//! before data for the same array, and deliver setpoint arrays before the
//! data arrays referencing them.

use std::time::Duration;

use chrono::{DateTime, Utc};
use ndarray::ArrayD;

use super::array::DataArray;
use super::dataset::DataSet;
use crate::error::{LabError, LabResult};
use crate::serialization::ValueMap;

/// A dataset metadata change.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataEvent {
    /// The dataset was renamed.
    Name(String),
    /// The dataset timestamp changed.
    TimeStamp(DateTime<Utc>),
    /// The user metadata mapping was replaced.
    UserData(ValueMap),
    /// The default array name changed.
    DefaultArrayName(String),
}

impl MetadataEvent {
    /// The metadata field this event updates.
    pub fn field_name(&self) -> &'static str {
        match self {
            MetadataEvent::Name(_) => "name",
            MetadataEvent::TimeStamp(_) => "time_stamp",
            MetadataEvent::UserData(_) => "user_data",
            MetadataEvent::DefaultArrayName(_) => "default_array_name",
        }
    }
}

/// A value written into an array: one element or a trailing-dimension block.
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// A single element, written at the full index.
    Scalar(f64),
    /// A one-dimensional block, written along the trailing dimension at a
    /// partial index.
    Block(Vec<f64>),
}

/// Detached copy of an array as it travels through a channel.
///
/// Snapshots carry axis arrays by name: channels deliver setpoints first, so
/// a consumer can resolve the names against the arrays it already rebuilt.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySnapshot {
    /// Array name.
    pub name: String,
    /// Human-readable label.
    pub label: String,
    /// Physical unit.
    pub unit: String,
    /// Setpoint flag.
    pub is_setpoint: bool,
    /// Copied buffer contents.
    pub data: ArrayD<f64>,
    /// Names of the ordered axis arrays.
    pub set_arrays: Vec<String>,
}

impl ArraySnapshot {
    /// Takes a defensive copy of the array, detached from producer mutation.
    pub fn of(array: &DataArray) -> Self {
        ArraySnapshot {
            name: array.name().to_string(),
            label: array.label().to_string(),
            unit: array.unit().to_string(),
            is_setpoint: array.is_setpoint(),
            data: array.values().clone(),
            set_arrays: array
                .set_arrays()
                .iter()
                .map(|axis| axis.read().name().to_string())
                .collect(),
        }
    }
}

/// How long a reader drain may wait for the next queued change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    /// Block until a drain leaves the queue empty.
    Block,
    /// Drain whatever is currently queued; return even if nothing is.
    NoWait,
    /// Wait at most this long for each queued item; a wait that elapses
    /// while the queue is still empty fails with `SyncTimeout`.
    Timeout(Duration),
}

impl SyncWait {
    /// Maps the numeric timeout convention: negative blocks, zero polls,
    /// positive bounds each wait.
    pub fn from_seconds(seconds: f64) -> Self {
        if seconds < 0.0 {
            SyncWait::Block
        } else if seconds == 0.0 {
            SyncWait::NoWait
        } else {
            SyncWait::Timeout(Duration::from_secs_f64(seconds))
        }
    }
}

/// Consumes the change events of one producer dataset.
///
/// Writers may assume all arguments were validated by the dataset. After
/// [`finalize`](DataSetWriter::finalize) every write fails with
/// `WriteAfterFinalize`; finalizing again is a no-op.
pub trait DataSetWriter: Send {
    /// Handles a metadata change.
    fn on_metadata(&mut self, event: &MetadataEvent) -> LabResult<()>;

    /// Handles a data write at `index` into the named arrays.
    fn on_data(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()>;

    /// Handles the creation of an array.
    fn on_add_array(&mut self, array: &ArraySnapshot) -> LabResult<()>;

    /// Flushes and closes the writer; idempotent.
    fn finalize(&mut self) -> LabResult<()>;
}

/// Rebuilds a mirror dataset from a channel of change events.
pub trait DataSetReader: Send {
    /// Drains queued change events into the bound dataset, honouring the
    /// wait discipline of [`SyncWait`].
    fn sync_from_storage(&mut self, wait: SyncWait, dataset: &mut DataSet) -> LabResult<()>;

    /// Builds a complete dataset from the persisted state.
    ///
    /// Live-only channels cannot replay from the start and fail with
    /// `UnsupportedOperation`.
    fn load(&mut self) -> LabResult<DataSet> {
        Err(LabError::UnsupportedOperation("load"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_wait_from_seconds_mapping() {
        assert_eq!(SyncWait::from_seconds(-1.0), SyncWait::Block);
        assert_eq!(SyncWait::from_seconds(0.0), SyncWait::NoWait);
        assert_eq!(
            SyncWait::from_seconds(1.5),
            SyncWait::Timeout(Duration::from_millis(1500))
        );
    }

    #[test]
    fn test_snapshot_detaches_from_producer() {
        let mut array = DataArray::builder("a").shape(&[2]).build().expect("array");
        let snapshot = ArraySnapshot::of(&array);
        array.set(&[0], 5.0).expect("set");
        assert!(snapshot.data[[0]].is_nan());
    }

    #[test]
    fn test_snapshot_records_axis_names_in_order() {
        let x = DataArray::builder("x")
            .setpoint(true)
            .shape(&[4])
            .build_shared()
            .expect("x");
        let y = DataArray::builder("y")
            .setpoint(true)
            .shape(&[4, 2])
            .set_arrays(vec![x.clone()])
            .build_shared()
            .expect("y");
        let z = DataArray::builder("z")
            .shape(&[4, 2])
            .set_arrays(vec![y, x])
            .build()
            .expect("z");
        let snapshot = ArraySnapshot::of(&z);
        assert_eq!(snapshot.set_arrays, vec!["y", "x"]);
    }
}
