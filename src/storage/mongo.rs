//! Document-database storage backend using a materialised-path model.
//!
//! Every document represents one leaf and carries the full tag joined with
//! [`TAG_SEPARATOR`](super::TAG_SEPARATOR) in a reserved `tag` field plus the
//! encoded `value`. Parent nodes are implicit — no node documents exist, so
//! listing a node means a prefix query over leaf tags. The separator is not
//! a dot because timestamp components contain dots; mapping keys inside
//! values are escaped by the codec so dotted field paths stay unambiguous.

use std::collections::BTreeSet;
use std::time::Duration;

use mongodb::bson::{doc, Document};
use mongodb::options::{ClientOptions, FindOptions, IndexOptions, ServerAddress, UpdateOptions};
use mongodb::sync::{Client, Collection};
use mongodb::IndexModel;
use serde::{Deserialize, Serialize};

use super::{Storage, Tag, TAG_SEPARATOR};
use crate::error::{LabError, LabResult};
use crate::serialization::{codec, Key, Value};

const TAG_FIELD: &str = "tag";
const VALUE_FIELD: &str = "value";

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    27017
}

fn default_collection() -> String {
    "storage".to_string()
}

fn default_connection_timeout_ms() -> u64 {
    30_000
}

/// Connection options for [`MongoStorage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoStorageSettings {
    /// Database host.
    #[serde(default = "default_host")]
    pub host: String,
    /// Database port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Database name.
    pub database: String,
    /// Collection holding the storage documents.
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Budget for establishing and verifying the connection.
    #[serde(default = "default_connection_timeout_ms")]
    pub connection_timeout_ms: u64,
}

impl MongoStorageSettings {
    /// Settings for a storage database on the default local instance.
    pub fn local(database: impl Into<String>) -> Self {
        MongoStorageSettings {
            host: default_host(),
            port: default_port(),
            database: database.into(),
            collection: default_collection(),
            connection_timeout_ms: default_connection_timeout_ms(),
        }
    }
}

/// Tagged storage persisted in a MongoDB collection.
pub struct MongoStorage {
    collection: Collection<Document>,
}

impl MongoStorage {
    /// Connects, verifies reachability, and prepares the tag index.
    ///
    /// Fails with `ConnectionTimeout` when the server cannot be reached
    /// within the configured budget.
    pub fn connect(settings: &MongoStorageSettings) -> LabResult<Self> {
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
        collection.create_index(
            IndexModel::builder()
                .keys(doc! {TAG_FIELD: 1})
                .options(IndexOptions::builder().unique(true).build())
                .build(),
            None,
        )?;
        tracing::info!(
            host = %settings.host,
            port = settings.port,
            database = %settings.database,
            collection = %settings.collection,
            "connected to storage database"
        );
        Ok(MongoStorage { collection })
    }

    fn tag_string(tag: &Tag) -> String {
        tag.to_string()
    }

    /// Regex matching every descendant of `tag`.
    fn descendant_regex(tag: &Tag) -> String {
        if tag.is_root() {
            "^".to_string()
        } else {
            format!(
                "^{}{}",
                regex::escape(&Self::tag_string(tag)),
                TAG_SEPARATOR
            )
        }
    }

    fn has_children(&self, tag: &Tag) -> LabResult<bool> {
        let filter = doc! {TAG_FIELD: {"$regex": Self::descendant_regex(tag)}};
        Ok(self.collection.find_one(filter, None)?.is_some())
    }

    fn find_document(&self, tag: &Tag) -> LabResult<Option<Document>> {
        Ok(self
            .collection
            .find_one(doc! {TAG_FIELD: Self::tag_string(tag)}, None)?)
    }
}

/// Extracts the direct child component from a descendant tag string.
fn child_component<'a>(descendant: &'a str, prefix: &str) -> Option<&'a str> {
    let rest = descendant.strip_prefix(prefix)?;
    let component = rest.split(TAG_SEPARATOR).next()?;
    if component.is_empty() {
        None
    } else {
        Some(component)
    }
}

impl Storage for MongoStorage {
    fn save(&self, data: &Value, tag: &Tag) -> LabResult<()> {
        if tag.is_root() {
            return Err(LabError::NodeAlreadyExists(tag.to_string()));
        }
        if self.has_children(tag)? {
            return Err(LabError::NodeAlreadyExists(tag.to_string()));
        }
        // A leaf on a proper prefix would become a node by this write.
        if let Some(parent) = tag.parent() {
            let mut prefix = parent;
            loop {
                if !prefix.is_root() && self.find_document(&prefix)?.is_some() {
                    return Err(LabError::NodeAlreadyExists(prefix.to_string()));
                }
                match prefix.parent() {
                    Some(next) => prefix = next,
                    None => break,
                }
            }
        }
        let update = doc! {"$set": {VALUE_FIELD: codec::encode_to_bson(data)?}};
        self.collection.update_one(
            doc! {TAG_FIELD: Self::tag_string(tag)},
            update,
            UpdateOptions::builder().upsert(true).build(),
        )?;
        Ok(())
    }

    fn load(&self, tag: &Tag) -> LabResult<Value> {
        let document = self
            .find_document(tag)?
            .ok_or_else(|| LabError::NoDataAtKey(tag.to_string()))?;
        match document.get(VALUE_FIELD) {
            Some(bson) => codec::decode_from_bson(bson),
            None => Err(LabError::NoDataAtKey(tag.to_string())),
        }
    }

    fn list_subtags(&self, tag: &Tag, limit: usize) -> LabResult<Vec<String>> {
        let prefix = if tag.is_root() {
            String::new()
        } else {
            format!("{}{}", Self::tag_string(tag), TAG_SEPARATOR)
        };
        let filter = doc! {TAG_FIELD: {"$regex": Self::descendant_regex(tag)}};
        let options = FindOptions::builder()
            .projection(doc! {TAG_FIELD: 1, "_id": 0})
            .build();
        let mut components = BTreeSet::new();
        for document in self.collection.find(filter, options)? {
            let document = document?;
            if let Ok(full_tag) = document.get_str(TAG_FIELD) {
                if let Some(component) = child_component(full_tag, &prefix) {
                    components.insert(component.to_string());
                }
            }
        }
        let descending = components.into_iter().rev();
        Ok(if limit > 0 {
            descending.take(limit).collect()
        } else {
            descending.collect()
        })
    }

    fn tag_in_storage(&self, tag: &Tag) -> LabResult<bool> {
        if tag.is_root() {
            return Ok(true);
        }
        if self.find_document(tag)?.is_some() {
            return Ok(true);
        }
        self.has_children(tag)
    }

    fn load_field(&self, tag: &Tag, field: &Key) -> LabResult<Value> {
        let leaf = self.load(tag)?;
        leaf.as_map()
            .and_then(|map| map.get(field))
            .cloned()
            .ok_or_else(|| LabError::NoDataAtKey(format!("{}[{}]", tag, field)))
    }

    fn update_field(&self, value: &Value, tag: &Tag, field: &Key) -> LabResult<()> {
        match self.find_document(tag)? {
            None => {
                if self.has_children(tag)? {
                    Err(LabError::NodeAlreadyExists(tag.to_string()))
                } else {
                    Err(LabError::NoDataAtKey(tag.to_string()))
                }
            }
            Some(document) => {
                if document.get_document(VALUE_FIELD).is_err() {
                    return Err(LabError::NoDataAtKey(tag.to_string()));
                }
                let field_path = format!("{}.{}", VALUE_FIELD, codec::escape_key(field));
                self.collection.update_one(
                    doc! {TAG_FIELD: Self::tag_string(tag)},
                    doc! {"$set": {field_path: codec::encode_to_bson(value)?}},
                    None,
                )?;
                Ok(())
            }
        }
    }
}
