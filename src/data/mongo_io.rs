//! Document-database producer/consumer channel.
//!
//! One document represents the dataset, keyed by a unique `name`:
//!
//! ```text
//! { _id, name,
//!   metadata: { <field>: <value>, ... },
//!   data_arrays: { <name>: { name, label, unit, is_setpoint,
//!                            set_arrays: [<name>, ...],
//!                            preset_data: <encoded-array> } },
//!   array_updates: [ [<index>, { <array-name>: <value-or-block> }], ... ],
//!   lastModified }
//! ```
//!
//! The [`MongoWriter`] maps change events onto `$set` / `$push` updates of
//! that document. The [`MongoReader`] tails a change-stream cursor scoped to
//! the document (with full-document lookup) on a background worker thread
//! that drains into a bounded queue; `sync_from_storage` pops queue items,
//! re-lifts their dotted-path updated fields into nested form, and applies
//! them to the bound dataset. Cursor termination turns the reader terminal:
//! every later sync fails with `ChannelTerminated`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError};
use mongodb::bson::{doc, oid::ObjectId, Bson, Document};
use mongodb::change_stream::event::OperationType;
use mongodb::options::{ChangeStreamOptions, ClientOptions, FullDocumentType, ServerAddress};
use mongodb::sync::{Client, Collection};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use super::dataset::DataSet;
use super::io::{
    ArraySnapshot, DataSetReader, DataSetWriter, DataValue, MetadataEvent, SyncWait,
};
use crate::error::{LabError, LabResult};
use crate::serialization::{codec, NdArray, Value};

const QUEUE_CAPACITY: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(50);

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

fn default_collection() -> String {
    "datasets".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

/// Connection options for the dataset document channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoIoSettings {
    /// Dataset name; the unique document key.
    pub name: String,
    /// Optional explicit document id (hex `ObjectId`); takes precedence
    /// over the name lookup.
    #[serde(default)]
    pub document_id: Option<String>,
    /// Create the document when the lookup finds nothing.
    #[serde(default)]
    pub create_if_not_found: bool,
    /// Database name.
    pub database: String,
    /// Collection holding the dataset documents.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Database port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Budget for establishing and verifying the connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl MongoIoSettings {
    /// Settings for a dataset document on the default local instance.
    pub fn local(name: impl Into<String>, database: impl Into<String>) -> Self {
        MongoIoSettings {
            name: name.into(),
            document_id: None,
            create_if_not_found: true,
            database: database.into(),
            collection: default_collection(),
            host: default_host(),
            port: default_port(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

fn connect_collection(settings: &MongoIoSettings) -> LabResult<(Collection<Document>, ObjectId)> {
    let timeout = Duration::from_millis(settings.connection_timeout_ms);
    let mut options = ClientOptions::default();
    options.hosts = vec![ServerAddress::Tcp {
        host: settings.host.clone(),
        port: Some(settings.port),
    }];
    options.connect_timeout = Some(timeout);
    options.server_selection_timeout = Some(timeout);
    let client = Client::with_options(options)?;
    let database = client.database(&settings.database);
    database
        .run_command(doc! {"ping": 1}, None)
        .map_err(|_| LabError::ConnectionTimeout(timeout))?;
    let collection = database.collection::<Document>(&settings.collection);

    let document_id = match &settings.document_id {
        Some(id) => {
            let id = ObjectId::parse_str(id)
                .map_err(|_| LabError::DocumentNotFound(id.clone()))?;
            match collection.find_one(doc! {"_id": id}, None)? {
                Some(_) => id,
                None => return Err(LabError::DocumentNotFound(id.to_hex())),
            }
        }
        None => {
            let filter = doc! {"name": &settings.name};
            let count = collection.count_documents(filter.clone(), None)?;
            if count > 1 {
                return Err(LabError::FieldNotUnique {
                    field: "name".to_string(),
                    count,
                });
            }
            match collection.find_one(filter, None)? {
                Some(document) => document
                    .get_object_id("_id")
                    .map_err(|_| LabError::DocumentNotFound(settings.name.clone()))?,
                None if settings.create_if_not_found => {
                    let inserted = collection.insert_one(
                        doc! {
                            "name": &settings.name,
                            "metadata": {},
                            "data_arrays": {},
                            "array_updates": [],
                            "lastModified": mongodb::bson::DateTime::now(),
                        },
                        None,
                    )?;
                    inserted
                        .inserted_id
                        .as_object_id()
                        .ok_or_else(|| LabError::DocumentNotFound(settings.name.clone()))?
                }
                None => return Err(LabError::DocumentNotFound(settings.name.clone())),
            }
        }
    };
    Ok((collection, document_id))
}

//==============================================================================
// Bson conversions
//==============================================================================

fn f64_from_bson(bson: &Bson) -> Option<f64> {
    match bson {
        Bson::Double(v) => Some(*v),
        Bson::Int32(v) => Some(f64::from(*v)),
        Bson::Int64(v) => Some(*v as f64),
        _ => None,
    }
}

fn usize_from_bson(bson: &Bson) -> Option<usize> {
    match bson {
        Bson::Int32(v) if *v >= 0 => Some(*v as usize),
        Bson::Int64(v) if *v >= 0 => Some(*v as usize),
        Bson::Double(v) if *v >= 0.0 && v.fract() == 0.0 => Some(*v as usize),
        _ => None,
    }
}

fn metadata_event_to_bson(event: &MetadataEvent) -> LabResult<Bson> {
    Ok(match event {
        MetadataEvent::Name(name) => Bson::String(name.clone()),
        MetadataEvent::TimeStamp(time_stamp) => Bson::String(time_stamp.to_rfc3339()),
        MetadataEvent::UserData(user_data) => {
            codec::encode_to_bson(&Value::Map(user_data.clone()))?
        }
        MetadataEvent::DefaultArrayName(name) => Bson::String(name.clone()),
    })
}

fn metadata_event_from_bson(field: &str, value: &Bson) -> LabResult<Option<MetadataEvent>> {
    let as_string = |bson: &Bson| -> LabResult<String> {
        bson.as_str()
            .map(str::to_string)
            .ok_or_else(|| LabError::NotSerializable(format!("metadata '{}' must be a string", field)))
    };
    Ok(match field {
        "name" => Some(MetadataEvent::Name(as_string(value)?)),
        "time_stamp" => {
            let raw = as_string(value)?;
            let parsed = DateTime::parse_from_rfc3339(&raw)
                .map_err(|e| LabError::NotSerializable(format!("bad timestamp '{}': {}", raw, e)))?;
            Some(MetadataEvent::TimeStamp(parsed.with_timezone(&Utc)))
        }
        "user_data" => match codec::decode_from_bson(value)? {
            Value::Map(map) => Some(MetadataEvent::UserData(map)),
            other => {
                return Err(LabError::NotSerializable(format!(
                    "user_data must be a mapping, got {}",
                    other.type_name()
                )))
            }
        },
        "default_array_name" => Some(MetadataEvent::DefaultArrayName(as_string(value)?)),
        _ => None,
    })
}

fn snapshot_to_document(snapshot: &ArraySnapshot) -> LabResult<Document> {
    let preset = Value::Array(NdArray::Float64(snapshot.data.clone()));
    Ok(doc! {
        "name": &snapshot.name,
        "label": &snapshot.label,
        "unit": &snapshot.unit,
        "is_setpoint": snapshot.is_setpoint,
        "set_arrays": snapshot.set_arrays.iter().map(|n| Bson::String(n.clone())).collect::<Vec<_>>(),
        "preset_data": codec::encode_to_bson(&preset)?,
    })
}

fn ndarray_to_f64(array: &NdArray) -> LabResult<ArrayD<f64>> {
    Ok(match array {
        NdArray::Float64(a) => a.clone(),
        NdArray::Float32(a) => a.mapv(f64::from),
        NdArray::Int32(a) => a.mapv(f64::from),
        NdArray::Int64(a) => a.mapv(|v| v as f64),
        NdArray::Complex128(_) => {
            return Err(LabError::NotSerializable(
                "complex buffers are not valid dataset arrays".to_string(),
            ))
        }
    })
}

fn snapshot_from_document(document: &Document) -> LabResult<ArraySnapshot> {
    let bad = |what: &str| LabError::NotSerializable(format!("array document missing {}", what));
    let name = document.get_str("name").map_err(|_| bad("name"))?;
    let label = document.get_str("label").unwrap_or_default();
    let unit = document.get_str("unit").unwrap_or_default();
    let is_setpoint = document.get_bool("is_setpoint").unwrap_or(false);
    let set_arrays = document
        .get_array("set_arrays")
        .map(|names| {
            names
                .iter()
                .filter_map(Bson::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let preset = document.get("preset_data").ok_or_else(|| bad("preset_data"))?;
    let data = match codec::decode_from_bson(preset)? {
        Value::Array(array) => ndarray_to_f64(&array)?,
        other => {
            return Err(LabError::NotSerializable(format!(
                "preset_data must be an ndarray, got {}",
                other.type_name()
            )))
        }
    };
    Ok(ArraySnapshot {
        name: name.to_string(),
        label: label.to_string(),
        unit: unit.to_string(),
        is_setpoint,
        data,
        set_arrays,
    })
}

fn data_value_to_bson(value: &DataValue) -> Bson {
    match value {
        DataValue::Scalar(v) => Bson::Double(*v),
        DataValue::Block(block) => {
            Bson::Array(block.iter().map(|v| Bson::Double(*v)).collect())
        }
    }
}

fn update_to_bson(index: &[usize], payload: &[(String, DataValue)]) -> Bson {
    let index = Bson::Array(index.iter().map(|&i| Bson::Int64(i as i64)).collect());
    let mut values = Document::new();
    for (name, value) in payload {
        values.insert(name.clone(), data_value_to_bson(value));
    }
    Bson::Array(vec![index, Bson::Document(values)])
}

fn update_from_bson(entry: &Bson) -> LabResult<(Vec<usize>, Vec<(String, DataValue)>)> {
    let bad = || LabError::NotSerializable("malformed array update entry".to_string());
    let parts = entry.as_array().ok_or_else(bad)?;
    let (index_part, payload_part) = match parts.as_slice() {
        [index, payload] => (index, payload),
        _ => return Err(bad()),
    };
    let index = match index_part {
        Bson::Array(items) => items
            .iter()
            .map(|item| usize_from_bson(item).ok_or_else(bad))
            .collect::<LabResult<Vec<_>>>()?,
        single => vec![usize_from_bson(single).ok_or_else(bad)?],
    };
    let payload_doc = payload_part.as_document().ok_or_else(bad)?;
    let mut payload = Vec::with_capacity(payload_doc.len());
    for (name, value) in payload_doc {
        let data_value = match value {
            Bson::Array(items) => DataValue::Block(
                items
                    .iter()
                    .map(|item| f64_from_bson(item).ok_or_else(bad))
                    .collect::<LabResult<Vec<_>>>()?,
            ),
            scalar => DataValue::Scalar(f64_from_bson(scalar).ok_or_else(bad)?),
        };
        payload.push((name.clone(), data_value));
    }
    Ok((index, payload))
}

//==============================================================================
// Writer
//==============================================================================

/// Producer end persisting change events into the dataset document.
pub struct MongoWriter {
    collection: Collection<Document>,
    document_id: ObjectId,
    finalized: bool,
}

impl MongoWriter {
    /// Connects and locates (or creates) the dataset document.
    pub fn connect(settings: &MongoIoSettings) -> LabResult<Self> {
        let (collection, document_id) = connect_collection(settings)?;
        tracing::info!(name = %settings.name, id = %document_id, "dataset document writer ready");
        Ok(MongoWriter {
            collection,
            document_id,
            finalized: false,
        })
    }

    /// The id of the backing document.
    pub fn document_id(&self) -> ObjectId {
        self.document_id
    }

    fn check_open(&self) -> LabResult<()> {
        if self.finalized {
            Err(LabError::WriteAfterFinalize)
        } else {
            Ok(())
        }
    }

    fn update(&self, update: Document) -> LabResult<()> {
        self.collection
            .update_one(doc! {"_id": self.document_id}, update, None)?;
        Ok(())
    }
}

impl DataSetWriter for MongoWriter {
    fn on_metadata(&mut self, event: &MetadataEvent) -> LabResult<()> {
        self.check_open()?;
        let field = format!("metadata.{}", event.field_name());
        self.update(doc! {"$set": {
            field: metadata_event_to_bson(event)?,
            "lastModified": mongodb::bson::DateTime::now(),
        }})
    }

    fn on_data(&mut self, index: &[usize], payload: &[(String, DataValue)]) -> LabResult<()> {
        self.check_open()?;
        self.update(doc! {
            "$push": {"array_updates": update_to_bson(index, payload)},
            "$set": {"lastModified": mongodb::bson::DateTime::now()},
        })
    }

    fn on_add_array(&mut self, array: &ArraySnapshot) -> LabResult<()> {
        self.check_open()?;
        let field = format!("data_arrays.{}", array.name);
        self.update(doc! {"$set": {
            field: snapshot_to_document(array)?,
            "lastModified": mongodb::bson::DateTime::now(),
        }})
    }

    fn finalize(&mut self) -> LabResult<()> {
        if self.finalized {
            return Ok(());
        }
        // Clear the replay cursor before refusing further writes.
        self.update(doc! {"$set": {
            "array_updates": [],
            "lastModified": mongodb::bson::DateTime::now(),
        }})?;
        self.finalized = true;
        tracing::info!(id = %self.document_id, "dataset document writer finalized");
        Ok(())
    }
}

//==============================================================================
// Reader
//==============================================================================

enum StreamItem {
    /// Updated fields in dotted-path form, or whole-document sections.
    Fields(Document),
    /// The cursor terminated; the payload is the cause.
    Terminal(String),
}

/// Consumer end tailing the dataset document's change stream.
pub struct MongoReader {
    collection: Collection<Document>,
    document_id: ObjectId,
    queue: Receiver<StreamItem>,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
    terminal: Option<String>,
}

impl MongoReader {
    /// Connects, opens the change stream, and starts the worker thread.
    ///
    /// The worker seeds the queue with the document's current state, so the
    /// first drain reproduces everything written before the reader attached.
    pub fn connect(settings: &MongoIoSettings) -> LabResult<Self> {
        let (collection, document_id) = connect_collection(settings)?;

        let options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .build();
        let pipeline = vec![doc! {"$match": {"documentKey._id": document_id}}];
        let stream = collection.watch(pipeline, options)?;

        let initial = collection
            .find_one(doc! {"_id": document_id}, None)?
            .ok_or_else(|| LabError::DocumentNotFound(document_id.to_hex()))?;

        let (sender, queue) = bounded(QUEUE_CAPACITY);
        let stop = Arc::new(AtomicBool::new(false));
        let worker_stop = stop.clone();
        let worker = std::thread::Builder::new()
            .name("dataset-change-stream".to_string())
            .spawn(move || worker_loop(stream, initial, sender, worker_stop))?;

        tracing::info!(name = %settings.name, id = %document_id, "dataset change-stream reader ready");
        Ok(MongoReader {
            collection,
            document_id,
            queue,
            stop,
            worker: Some(worker),
            terminal: None,
        })
    }

    fn terminate(&mut self, cause: String) -> LabError {
        self.terminal = Some(cause.clone());
        LabError::ChannelTerminated(cause)
    }

    fn apply_item(&mut self, dataset: &mut DataSet, item: StreamItem) -> LabResult<()> {
        match item {
            StreamItem::Fields(fields) => apply_fields(dataset, &fields),
            StreamItem::Terminal(cause) => Err(self.terminate(cause)),
        }
    }
}

impl DataSetReader for MongoReader {
    fn sync_from_storage(&mut self, wait: SyncWait, dataset: &mut DataSet) -> LabResult<()> {
        if let Some(cause) = &self.terminal {
            return Err(LabError::ChannelTerminated(cause.clone()));
        }
        match wait {
            SyncWait::NoWait => loop {
                match self.queue.try_recv() {
                    Ok(item) => self.apply_item(dataset, item)?,
                    Err(TryRecvError::Empty) => return Ok(()),
                    Err(TryRecvError::Disconnected) => {
                        return Err(self.terminate("change-stream worker stopped".to_string()))
                    }
                }
            },
            SyncWait::Block => {
                let mut drained_any = false;
                loop {
                    if drained_any && self.queue.is_empty() {
                        return Ok(());
                    }
                    match self.queue.recv() {
                        Ok(item) => self.apply_item(dataset, item)?,
                        Err(_) => {
                            return Err(self.terminate("change-stream worker stopped".to_string()))
                        }
                    }
                    drained_any = true;
                }
            }
            SyncWait::Timeout(budget) => {
                // Per-item budget: each wait for the next queued item may
                // take at most `budget`.
                let mut drained_any = false;
                loop {
                    if drained_any && self.queue.is_empty() {
                        return Ok(());
                    }
                    match self.queue.recv_timeout(budget) {
                        Ok(item) => self.apply_item(dataset, item)?,
                        Err(RecvTimeoutError::Timeout) => return Err(LabError::SyncTimeout(budget)),
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(self.terminate("change-stream worker stopped".to_string()))
                        }
                    }
                    drained_any = true;
                }
            }
        }
    }

    fn load(&mut self) -> LabResult<DataSet> {
        let document = self
            .collection
            .find_one(doc! {"_id": self.document_id}, None)?
            .ok_or_else(|| LabError::DocumentNotFound(self.document_id.to_hex()))?;
        let name = document.get_str("name").unwrap_or_default().to_string();
        let mut dataset = DataSet::new(name);
        apply_fields(&mut dataset, &initial_fields(&document))?;
        Ok(dataset)
    }
}

impl Drop for MongoReader {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("change-stream worker panicked during shutdown");
            }
        }
    }
}

//==============================================================================
// Worker
//==============================================================================

type DatasetChangeStream =
    mongodb::sync::ChangeStream<mongodb::change_stream::event::ChangeStreamEvent<Document>>;

fn push(sender: &Sender<StreamItem>, stop: &AtomicBool, item: StreamItem) -> bool {
    let mut item = item;
    loop {
        if stop.load(Ordering::Relaxed) {
            return false;
        }
        match sender.send_timeout(item, POLL_INTERVAL) {
            Ok(()) => return true,
            Err(SendTimeoutError::Timeout(returned)) => item = returned,
            Err(SendTimeoutError::Disconnected(_)) => return false,
        }
    }
}

fn worker_loop(
    mut stream: DatasetChangeStream,
    initial: Document,
    sender: Sender<StreamItem>,
    stop: Arc<AtomicBool>,
) {
    // Seed with the current document state before tailing live changes.
    if !push(&sender, &stop, StreamItem::Fields(initial_fields(&initial))) {
        return;
    }
    loop {
        if stop.load(Ordering::Relaxed) {
            return;
        }
        match stream.next_if_any() {
            Ok(Some(event)) => {
                let item = match event.operation_type {
                    OperationType::Delete | OperationType::Drop | OperationType::Invalidate => {
                        Some(StreamItem::Terminal(format!(
                            "change stream ended: {:?}",
                            event.operation_type
                        )))
                    }
                    _ => {
                        if let Some(update) = event.update_description {
                            Some(StreamItem::Fields(update.updated_fields))
                        } else {
                            event
                                .full_document
                                .map(|document| StreamItem::Fields(initial_fields(&document)))
                        }
                    }
                };
                match item {
                    Some(item @ StreamItem::Terminal(_)) => {
                        push(&sender, &stop, item);
                        return;
                    }
                    Some(item) => {
                        if !push(&sender, &stop, item) {
                            return;
                        }
                    }
                    None => {}
                }
            }
            Ok(None) => std::thread::sleep(POLL_INTERVAL),
            Err(error) => {
                tracing::warn!(%error, "change stream terminated");
                push(&sender, &stop, StreamItem::Terminal(error.to_string()));
                return;
            }
        }
    }
}

//==============================================================================
// Updated-field dispatch
//==============================================================================

/// Projects the replication-relevant sections of a full document into the
/// same whole-section form that `apply_fields` dispatches on.
fn initial_fields(document: &Document) -> Document {
    let mut fields = Document::new();
    for section in ["metadata", "data_arrays", "array_updates"] {
        if let Some(value) = document.get(section) {
            fields.insert(section, value.clone());
        }
    }
    fields
}

/// Re-lifts dotted-path updated fields into nested form and applies them.
///
/// Path heads `data_arrays.X` become a single-array refresh, numeric
/// `array_updates.<n>` indices are coerced into a list of one update, and
/// `metadata.<field>` paths unpack by their first component. Setpoint arrays
/// apply before the data arrays that reference them.
pub(crate) fn apply_fields(dataset: &mut DataSet, fields: &Document) -> LabResult<()> {
    let mut metadata = Vec::new();
    let mut snapshots = Vec::new();
    let mut updates = Vec::new();

    for (path, value) in fields {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path.as_str(), None),
        };
        match head {
            "metadata" => match rest {
                Some(field) => {
                    if let Some(event) = metadata_event_from_bson(field, value)? {
                        metadata.push(event);
                    }
                }
                None => {
                    let section = value.as_document().ok_or_else(|| {
                        LabError::NotSerializable("metadata section must be a document".into())
                    })?;
                    for (field, field_value) in section {
                        if let Some(event) = metadata_event_from_bson(field, field_value)? {
                            metadata.push(event);
                        }
                    }
                }
            },
            "data_arrays" => match rest {
                Some(_name) => {
                    let entry = value.as_document().ok_or_else(|| {
                        LabError::NotSerializable("array entry must be a document".into())
                    })?;
                    snapshots.push(snapshot_from_document(entry)?);
                }
                None => {
                    let section = value.as_document().ok_or_else(|| {
                        LabError::NotSerializable("data_arrays section must be a document".into())
                    })?;
                    for (_name, entry) in section {
                        let entry = entry.as_document().ok_or_else(|| {
                            LabError::NotSerializable("array entry must be a document".into())
                        })?;
                        snapshots.push(snapshot_from_document(entry)?);
                    }
                }
            },
            "array_updates" => match rest {
                // A pushed element surfaces under its numeric index; coerce
                // into a list of one update.
                Some(_index) => updates.push(update_from_bson(value)?),
                None => {
                    let entries = value.as_array().ok_or_else(|| {
                        LabError::NotSerializable("array_updates must be a list".into())
                    })?;
                    for entry in entries {
                        updates.push(update_from_bson(entry)?);
                    }
                }
            },
            _ => tracing::debug!(path = %path, "ignoring unreplicated field"),
        }
    }

    for event in metadata {
        dataset.apply_metadata(event);
    }
    snapshots.sort_by_key(|snapshot| !snapshot.is_setpoint);
    for snapshot in &snapshots {
        dataset.apply_snapshot(snapshot)?;
    }
    for (index, payload) in updates {
        dataset.apply_data(&index, &payload)?;
    }
    Ok(())
}
