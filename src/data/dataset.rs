//! Dataset aggregate: labelled arrays, metadata, and channel plumbing.
//!
//! A [`DataSet`] is either a **producer** — zero or more attached writers
//! fan out every change — or a **consumer** — one bound reader rebuilds the
//! dataset from a channel. The two roles are mutually exclusive on one
//! instance.
//!
//! Arrays are registered by name through an explicit indexer
//! ([`DataSet::array`]); names are valid identifiers and unique within the
//! dataset, and every data array shares the dataset's single setpoint list.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::sync::Arc;

use super::array::{ArrayRef, DataArray};
use super::io::{ArraySnapshot, DataSetReader, DataSetWriter, DataValue, MetadataEvent, SyncWait};
use crate::error::{LabError, LabResult};
use crate::serialization::ValueMap;

/// Aggregate of setpoint and data arrays plus metadata.
pub struct DataSet {
    name: String,
    time_stamp: DateTime<Utc>,
    user_data: ValueMap,
    default_array_name: Option<String>,
    arrays: IndexMap<String, ArrayRef>,
    set_arrays: Vec<ArrayRef>,
    writers: Vec<Box<dyn DataSetWriter>>,
    reader: Option<Box<dyn DataSetReader>>,
    finalized: bool,
}

impl std::fmt::Debug for DataSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataSet")
            .field("name", &self.name)
            .field("time_stamp", &self.time_stamp)
            .field("arrays", &self.arrays.keys().collect::<Vec<_>>())
            .field("writers", &self.writers.len())
            .field("reader", &self.reader.is_some())
            .field("finalized", &self.finalized)
            .finish()
    }
}

impl DataSet {
    /// Creates an empty dataset stamped with the current time.
    pub fn new(name: impl Into<String>) -> Self {
        DataSet {
            name: name.into(),
            time_stamp: Utc::now(),
            user_data: ValueMap::new(),
            default_array_name: None,
            arrays: IndexMap::new(),
            set_arrays: Vec::new(),
            writers: Vec::new(),
            reader: None,
            finalized: false,
        }
    }

    /// Dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation or last explicitly set timestamp.
    pub fn time_stamp(&self) -> DateTime<Utc> {
        self.time_stamp
    }

    /// User metadata mapping.
    pub fn user_data(&self) -> &ValueMap {
        &self.user_data
    }

    /// Name of the default array, if any arrays were added.
    pub fn default_array_name(&self) -> Option<&str> {
        self.default_array_name.as_deref()
    }

    /// The dataset's ordered setpoint arrays.
    pub fn set_arrays(&self) -> &[ArrayRef] {
        &self.set_arrays
    }

    /// Looks up an array handle by name.
    pub fn array(&self, name: &str) -> Option<ArrayRef> {
        self.arrays.get(name).cloned()
    }

    /// Handle of the default array.
    pub fn default_array(&self) -> Option<ArrayRef> {
        self.default_array_name
            .as_deref()
            .and_then(|name| self.arrays.get(name))
            .cloned()
    }

    /// Array names in insertion order.
    pub fn array_names(&self) -> impl Iterator<Item = &str> {
        self.arrays.keys().map(String::as_str)
    }

    /// Number of arrays in the dataset.
    pub fn array_count(&self) -> usize {
        self.arrays.len()
    }

    /// Whether the dataset was finalized.
    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    //==========================================================================
    // Producer surface
    //==========================================================================

    /// Attaches a writer; the dataset becomes a producer.
    pub fn attach_writer(&mut self, writer: Box<dyn DataSetWriter>) -> LabResult<()> {
        if self.reader.is_some() {
            return Err(LabError::UnsupportedOperation(
                "attach_writer on a consumer dataset",
            ));
        }
        self.writers.push(writer);
        Ok(())
    }

    /// Binds the single reader; the dataset becomes a consumer.
    pub fn bind_reader(&mut self, reader: Box<dyn DataSetReader>) -> LabResult<()> {
        if !self.writers.is_empty() {
            return Err(LabError::UnsupportedOperation(
                "bind_reader on a producer dataset",
            ));
        }
        if self.reader.is_some() {
            return Err(LabError::UnsupportedOperation(
                "bind_reader on an already bound dataset",
            ));
        }
        self.reader = Some(reader);
        Ok(())
    }

    /// Adds an array, fanning the creation out to every attached writer.
    ///
    /// The first array added becomes the default array unless a default was
    /// set explicitly. Data arrays must agree with the dataset's setpoint
    /// list; an array with no axes of its own adopts the dataset's.
    pub fn add_array(&mut self, array: ArrayRef) -> LabResult<()> {
        self.ensure_open()?;
        self.insert_array(array.clone())?;
        let snapshot = ArraySnapshot::of(&array.read());
        for writer in &mut self.writers {
            writer.on_add_array(&snapshot)?;
        }
        Ok(())
    }

    /// Writes values into named arrays at `index`, fanning out to writers.
    pub fn add_data(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()> {
        self.ensure_open()?;
        self.write_payload(index, payload)?;
        for writer in &mut self.writers {
            writer.on_data(index, payload)?;
        }
        Ok(())
    }

    /// Convenience for a single scalar write.
    pub fn add_scalar(&mut self, index: &[usize], name: &str, value: f64) -> LabResult<()> {
        self.add_data(index, &[(name.to_string(), DataValue::Scalar(value))])
    }

    /// Renames the dataset.
    pub fn set_name(&mut self, name: impl Into<String>) -> LabResult<()> {
        self.ensure_open()?;
        let name = name.into();
        self.name = name.clone();
        self.emit_metadata(MetadataEvent::Name(name))
    }

    /// Sets the dataset timestamp.
    pub fn set_time_stamp(&mut self, time_stamp: DateTime<Utc>) -> LabResult<()> {
        self.ensure_open()?;
        self.time_stamp = time_stamp;
        self.emit_metadata(MetadataEvent::TimeStamp(time_stamp))
    }

    /// Replaces the user metadata mapping.
    pub fn set_user_data(&mut self, user_data: ValueMap) -> LabResult<()> {
        self.ensure_open()?;
        self.user_data = user_data.clone();
        self.emit_metadata(MetadataEvent::UserData(user_data))
    }

    /// Overrides the default array name.
    pub fn set_default_array_name(&mut self, name: impl Into<String>) -> LabResult<()> {
        self.ensure_open()?;
        let name = name.into();
        self.default_array_name = Some(name.clone());
        self.emit_metadata(MetadataEvent::DefaultArrayName(name))
    }

    /// Finalizes every attached writer; idempotent.
    ///
    /// After finalisation every write on this dataset or its writers fails
    /// with `WriteAfterFinalize`.
    pub fn finalize(&mut self) -> LabResult<()> {
        if self.finalized {
            return Ok(());
        }
        self.finalized = true;
        tracing::debug!(dataset = %self.name, "finalizing dataset");
        let mut first_error = None;
        for writer in &mut self.writers {
            if let Err(err) = writer.finalize() {
                first_error.get_or_insert(err);
            }
        }
        match first_error {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    //==========================================================================
    // Consumer surface
    //==========================================================================

    /// Drains the bound reader's queued change events into this dataset.
    pub fn sync_from_storage(&mut self, wait: SyncWait) -> LabResult<()> {
        let mut reader = self.reader.take().ok_or(LabError::UnsupportedOperation(
            "sync_from_storage without a bound reader",
        ))?;
        let result = reader.sync_from_storage(wait, self);
        self.reader = Some(reader);
        result
    }

    /// Applies a metadata event without fanning out. Reader-facing.
    pub fn apply_metadata(&mut self, event: MetadataEvent) {
        match event {
            MetadataEvent::Name(name) => self.name = name,
            MetadataEvent::TimeStamp(time_stamp) => self.time_stamp = time_stamp,
            MetadataEvent::UserData(user_data) => self.user_data = user_data,
            MetadataEvent::DefaultArrayName(name) => self.default_array_name = Some(name),
        }
    }

    /// Creates or refreshes an array from a channel snapshot. Reader-facing.
    ///
    /// Axis names resolve against arrays already present; channels deliver
    /// setpoints first, so resolution cannot dangle.
    pub fn apply_snapshot(&mut self, snapshot: &ArraySnapshot) -> LabResult<()> {
        if let Some(existing) = self.arrays.get(&snapshot.name) {
            *existing.write().values_mut() = snapshot.data.clone();
            return Ok(());
        }
        let set_arrays = snapshot
            .set_arrays
            .iter()
            .map(|axis_name| {
                self.arrays
                    .get(axis_name)
                    .cloned()
                    .ok_or_else(|| LabError::UnknownArray(axis_name.clone()))
            })
            .collect::<LabResult<Vec<_>>>()?;
        let array = DataArray::builder(&snapshot.name)
            .label(&snapshot.label)
            .unit(&snapshot.unit)
            .setpoint(snapshot.is_setpoint)
            .preset_data(snapshot.data.clone())
            .set_arrays(set_arrays)
            .build_shared()?;
        self.insert_array(array)
    }

    /// Applies a data write without fanning out. Reader-facing.
    pub fn apply_data(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()> {
        self.write_payload(index, payload)
    }

    //==========================================================================
    // Internals
    //==========================================================================

    fn insert_array(&mut self, array: ArrayRef) -> LabResult<()> {
        let (name, is_setpoint) = {
            let guard = array.read();
            (guard.name().to_string(), guard.is_setpoint())
        };
        if self.arrays.contains_key(&name) {
            return Err(LabError::DuplicateArrayName(name));
        }

        if is_setpoint {
            self.set_arrays.push(array.clone());
        } else {
            let axes_empty = array.read().set_arrays().is_empty();
            if self.set_arrays.is_empty() {
                self.set_arrays = array.read().set_arrays().to_vec();
            } else if !axes_empty {
                self.check_setpoints_match(&array, &name)?;
            }
        }

        if self.default_array_name.is_none() {
            self.default_array_name = Some(name.clone());
        }
        self.arrays.insert(name, array);
        Ok(())
    }

    /// An array's axis list must be the dataset's setpoint list, compared as
    /// sets: arrays order axes by rank, the dataset by addition order.
    fn check_setpoints_match(&self, array: &ArrayRef, name: &str) -> LabResult<()> {
        let guard = array.read();
        let axes = guard.set_arrays();
        if axes.len() != self.set_arrays.len() {
            return Err(LabError::SetpointsMismatch(name.to_string()));
        }
        let matches = axes.iter().all(|axis| {
            self.set_arrays
                .iter()
                .any(|known| Arc::ptr_eq(axis, known) || axis.read().same_structure(&known.read()))
        });
        if matches {
            Ok(())
        } else {
            Err(LabError::SetpointsMismatch(name.to_string()))
        }
    }

    fn write_payload(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()> {
        for (name, value) in payload {
            let array = self
                .arrays
                .get(name)
                .cloned()
                .ok_or_else(|| LabError::UnknownArray(name.clone()))?;
            let mut array = array.write();
            match value {
                DataValue::Scalar(v) => array.set(index, *v)?,
                DataValue::Block(block) => array.set_block(index, block)?,
            }
        }
        Ok(())
    }

    fn ensure_open(&self) -> LabResult<()> {
        if self.finalized {
            Err(LabError::WriteAfterFinalize)
        } else {
            Ok(())
        }
    }

    fn emit_metadata(&mut self, event: MetadataEvent) -> LabResult<()> {
        for writer in &mut self.writers {
            writer.on_metadata(&event)?;
        }
        Ok(())
    }
}
