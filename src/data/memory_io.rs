//! Single-process producer/consumer channel over a bounded FIFO.
//!
//! [`MemoryIoFactory`] vends a connected [`MemoryWriter`] / [`MemoryReader`]
//! pair sharing one bounded `crossbeam` channel of tagged change events. The
//! writer snapshots array payloads defensively, so later producer mutation
//! cannot corrupt events already in flight. The channel is live-only:
//! [`DataSetReader::load`] is unsupported.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};

use super::dataset::DataSet;
use super::io::{
    ArraySnapshot, DataSetReader, DataSetWriter, DataValue, MetadataEvent, SyncWait,
};
use crate::error::{LabError, LabResult};

/// A change event as it travels through the in-memory FIFO.
#[derive(Debug, Clone)]
pub enum DataSetEvent {
    /// Metadata update.
    Metadata(MetadataEvent),
    /// Data written at an index.
    Data {
        /// Index or partial index the payload applies to.
        index: Vec<usize>,
        /// Per-array values.
        payload: Vec<(String, DataValue)>,
    },
    /// Array created.
    Array(ArraySnapshot),
}

/// Factory for connected in-memory writer/reader pairs.
pub struct MemoryIoFactory;

impl MemoryIoFactory {
    /// Default FIFO capacity, in events.
    pub const DEFAULT_CAPACITY: usize = 4096;

    /// Creates a pair with the default capacity.
    pub fn create() -> (MemoryWriter, MemoryReader) {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Creates a pair sharing a FIFO bounded to `capacity` events.
    pub fn with_capacity(capacity: usize) -> (MemoryWriter, MemoryReader) {
        let (sender, receiver) = bounded(capacity);
        (
            MemoryWriter {
                sender,
                finalized: false,
            },
            MemoryReader { receiver },
        )
    }
}

/// Producer end of the in-memory channel.
pub struct MemoryWriter {
    sender: Sender<DataSetEvent>,
    finalized: bool,
}

impl MemoryWriter {
    fn send(&self, event: DataSetEvent) -> LabResult<()> {
        self.sender
            .send(event)
            .map_err(|_| LabError::ChannelTerminated("reader dropped".to_string()))
    }

    fn check_open(&self) -> LabResult<()> {
        if self.finalized {
            Err(LabError::WriteAfterFinalize)
        } else {
            Ok(())
        }
    }
}

impl DataSetWriter for MemoryWriter {
    fn on_metadata(&mut self, event: &MetadataEvent) -> LabResult<()> {
        self.check_open()?;
        self.send(DataSetEvent::Metadata(event.clone()))
    }

    fn on_data(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()> {
        self.check_open()?;
        self.send(DataSetEvent::Data {
            index: index.to_vec(),
            payload: payload.to_vec(),
        })
    }

    fn on_add_array(&mut self, array: &ArraySnapshot) -> LabResult<()> {
        self.check_open()?;
        self.send(DataSetEvent::Array(array.clone()))
    }

    fn finalize(&mut self) -> LabResult<()> {
        self.finalized = true;
        Ok(())
    }
}

/// Consumer end of the in-memory channel.
pub struct MemoryReader {
    receiver: Receiver<DataSetEvent>,
}

impl MemoryReader {
    fn apply(dataset: &mut DataSet, event: DataSetEvent) -> LabResult<()> {
        match event {
            DataSetEvent::Metadata(event) => {
                dataset.apply_metadata(event);
                Ok(())
            }
            DataSetEvent::Array(snapshot) => dataset.apply_snapshot(&snapshot),
            DataSetEvent::Data { index, payload } => dataset.apply_data(&index, &payload),
        }
    }
}

impl DataSetReader for MemoryReader {
    fn sync_from_storage(&mut self, wait: SyncWait, dataset: &mut DataSet) -> LabResult<()> {
        match wait {
            SyncWait::NoWait => loop {
                match self.receiver.try_recv() {
                    Ok(event) => Self::apply(dataset, event)?,
                    Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return Ok(()),
                }
            },
            SyncWait::Block => {
                let mut drained_any = false;
                loop {
                    if drained_any && self.receiver.is_empty() {
                        return Ok(());
                    }
                    match self.receiver.recv() {
                        Ok(event) => Self::apply(dataset, event)?,
                        Err(_) if drained_any => return Ok(()),
                        Err(_) => {
                            return Err(LabError::ChannelTerminated(
                                "writer dropped before any event".to_string(),
                            ))
                        }
                    }
                    drained_any = true;
                }
            }
            SyncWait::Timeout(budget) => {
                // The budget bounds each wait for the next item, not the
                // whole drain.
                let mut drained_any = false;
                loop {
                    if drained_any && self.receiver.is_empty() {
                        return Ok(());
                    }
                    match self.receiver.recv_timeout(budget) {
                        Ok(event) => Self::apply(dataset, event)?,
                        Err(RecvTimeoutError::Timeout) => {
                            return Err(LabError::SyncTimeout(budget))
                        }
                        Err(RecvTimeoutError::Disconnected) if drained_any => return Ok(()),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(LabError::ChannelTerminated(
                                "writer dropped before any event".to_string(),
                            ))
                        }
                    }
                    drained_any = true;
                }
            }
        }
    }
}
