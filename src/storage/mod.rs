//! Tagged hierarchical key-value storage.
//!
//! A storage backend keeps a rooted ordered tree. Interior nodes are unnamed
//! containers keyed by string components; leaves carry a serialisable
//! [`Value`]. A [`Tag`] — an ordered sequence of non-empty components —
//! addresses either a node or a leaf; the root is the empty tag.
//!
//! Nodes and leaves are disjoint at a given path: a leaf may be overwritten
//! by another leaf, but a node can never become a leaf nor vice versa.
//! Subtags list in descending lexicographic order, which makes ISO-8601
//! timestamp components (see [`datetag_part`]) yield "latest" for free.

pub mod memory;
pub mod mongo;

pub use memory::MemoryStorage;
pub use mongo::{MongoStorage, MongoStorageSettings};

use chrono::{DateTime, Utc};

use crate::error::{LabError, LabResult};
use crate::serialization::{Key, Value};
use crate::validation::is_valid_tag_component;

/// Separator used in the document-database tag encoding and in the display
/// form of tags. Not a dot: timestamp components contain dots.
pub const TAG_SEPARATOR: char = '/';

//==============================================================================
// Tags
//==============================================================================

/// An ordered sequence of non-empty components addressing a node or leaf.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Tag {
    components: Vec<String>,
}

impl Tag {
    /// The empty tag addressing the tree root.
    pub fn root() -> Self {
        Tag {
            components: Vec::new(),
        }
    }

    /// Builds a tag from components, validating each one.
    pub fn new<I, S>(components: I) -> LabResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let components: Vec<String> = components.into_iter().map(Into::into).collect();
        for component in &components {
            is_valid_tag_component(component)
                .map_err(|reason| LabError::InvalidTag(format!("'{}': {}", component, reason)))?;
        }
        Ok(Tag { components })
    }

    /// Parses a `/`-separated path; the empty string is the root.
    pub fn parse(path: &str) -> LabResult<Self> {
        if path.is_empty() {
            return Ok(Tag::root());
        }
        Tag::new(path.split(TAG_SEPARATOR))
    }

    /// The ordered components.
    pub fn components(&self) -> &[String] {
        &self.components
    }

    /// Whether this is the root tag.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Number of components.
    pub fn len(&self) -> usize {
        self.components.len()
    }

    /// Whether the tag has no components; same as [`Tag::is_root`].
    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Extends the tag with one validated child component.
    pub fn child(&self, component: impl Into<String>) -> LabResult<Self> {
        let component = component.into();
        is_valid_tag_component(&component)
            .map_err(|reason| LabError::InvalidTag(format!("'{}': {}", component, reason)))?;
        let mut components = self.components.clone();
        components.push(component);
        Ok(Tag { components })
    }

    /// The tag addressing this tag's parent node, or `None` at the root.
    pub fn parent(&self) -> Option<Self> {
        if self.components.is_empty() {
            return None;
        }
        Some(Tag {
            components: self.components[..self.components.len() - 1].to_vec(),
        })
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.components.join(&TAG_SEPARATOR.to_string()))
    }
}

impl TryFrom<&[&str]> for Tag {
    type Error = LabError;

    fn try_from(components: &[&str]) -> LabResult<Self> {
        Tag::new(components.iter().copied())
    }
}

//==============================================================================
// Date tags
//==============================================================================

/// ISO-8601 timestamp component with microsecond precision.
///
/// The fixed-width format makes lexicographic order agree with time order,
/// so [`Storage::latest_subtag`] on date-tagged children returns the most
/// recent one.
pub fn datetag_part(dt: Option<DateTime<Utc>>) -> String {
    dt.unwrap_or_else(Utc::now)
        .format("%Y-%m-%dT%H:%M:%S%.6f")
        .to_string()
}

//==============================================================================
// Backend contract
//==============================================================================

/// Tagged hierarchical key-value store.
///
/// Implementations must be safe for concurrent independent tag writes; a
/// given tag is written by at most one producer at a time (usage contract,
/// not enforced here).
pub trait Storage {
    /// Stores or overwrites the leaf at `tag`.
    ///
    /// Fails with `NodeAlreadyExists` when `tag` currently addresses a node,
    /// or when the write would turn an existing leaf on the path into a node.
    fn save(&self, data: &Value, tag: &Tag) -> LabResult<()>;

    /// Returns the leaf value at `tag`.
    ///
    /// Fails with `NoDataAtKey` for a missing or node-addressing tag.
    fn load(&self, tag: &Tag) -> LabResult<Value>;

    /// Direct children of the node at `tag`, sorted descending.
    ///
    /// Empty for a missing tag or a leaf. `limit == 0` means unbounded.
    fn list_subtags(&self, tag: &Tag, limit: usize) -> LabResult<Vec<String>>;

    /// The full tag of the lexicographically largest child of `tag`.
    fn latest_subtag(&self, tag: &Tag) -> LabResult<Option<Tag>> {
        let subtags = self.list_subtags(tag, 1)?;
        match subtags.into_iter().next() {
            Some(component) => Ok(Some(tag.child(component)?)),
            None => Ok(None),
        }
    }

    /// Whether `tag` addresses a node or leaf in storage.
    fn tag_in_storage(&self, tag: &Tag) -> LabResult<bool>;

    /// Returns one field of the mapping-valued leaf at `tag`.
    ///
    /// Fails with `NoDataAtKey` when the tag or the field is missing.
    fn load_field(&self, tag: &Tag, field: &Key) -> LabResult<Value>;

    /// Upserts one field of the mapping-valued leaf at `tag`.
    ///
    /// The leaf must already exist; a missing tag fails with `NoDataAtKey`,
    /// a node-addressing tag with `NodeAlreadyExists`.
    fn update_field(&self, value: &Value, tag: &Tag, field: &Key) -> LabResult<()>;

    /// Reserved query entry point; no backend supports it.
    fn search(&self, _query: &str) -> LabResult<Vec<Tag>> {
        Err(LabError::UnsupportedOperation("search"))
    }
}
