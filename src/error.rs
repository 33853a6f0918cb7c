//! Custom error types for the toolkit.
//!
//! This module defines the primary error type, `LabError`, for the entire
//! crate. Using the `thiserror` crate, it provides a centralized and
//! consistent way to handle the different kinds of errors that can occur,
//! from array construction and dataset composition to storage access and
//! reader synchronisation.
//!
//! ## Error Categories
//!
//! - **Array construction** — `DimensionMismatch`, `MissingShape`,
//!   `InvalidIdentifier`, `IndexOutOfBounds`.
//! - **Dataset composition** — `DuplicateArrayName`, `SetpointsMismatch`,
//!   `UnknownArray`.
//! - **IO lifecycle** — `WriteAfterFinalize`, `UnsupportedOperation`.
//! - **Reader synchronisation** — `SyncTimeout`, `ChannelTerminated`.
//! - **Storage** — `NoDataAtKey`, `NodeAlreadyExists`, `ConnectionTimeout`,
//!   `DocumentNotFound`, `FieldNotUnique`, `InvalidTag`.
//! - **Typed container / codec** — `InvalidKey`, `NotSerializable`,
//!   `UnknownType`.
//!
//! Validation errors are raised synchronously to the caller. Errors from the
//! underlying document database are wrapped into this taxonomy at the
//! boundary; nothing is retried inside the crate.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type LabResult<T> = std::result::Result<T, LabError>;

/// Primary error type for the toolkit.
#[derive(Error, Debug)]
pub enum LabError {
    /// An array was created with axis arrays whose shapes do not match.
    #[error("Dimension mismatch for array '{name}': {reason}")]
    DimensionMismatch {
        /// Name of the array being constructed.
        name: String,
        /// Human-readable description of the violated shape rule.
        reason: String,
    },

    /// An array was created with neither a shape nor preset data.
    #[error("Array '{0}' needs either a shape or preset data")]
    MissingShape(String),

    /// A name is not a syntactically valid identifier.
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    /// An element access was outside the array bounds.
    #[error("Index {index:?} is out of bounds for shape {shape:?}")]
    IndexOutOfBounds {
        /// The offending index tuple.
        index: Vec<usize>,
        /// The shape of the accessed array.
        shape: Vec<usize>,
    },

    /// An array with this name already exists in the dataset.
    #[error("Array name '{0}' already taken in this dataset")]
    DuplicateArrayName(String),

    /// The array's setpoint list does not match the dataset's.
    #[error("Setpoint arrays of '{0}' do not match the dataset's setpoints")]
    SetpointsMismatch(String),

    /// A data write referenced an array the dataset does not contain.
    #[error("Dataset has no array named '{0}'")]
    UnknownArray(String),

    /// A write was attempted on a finalized writer or dataset.
    #[error("Dataset is finalized, no more data can be written")]
    WriteAfterFinalize,

    /// The operation is not supported by this backend or channel.
    #[error("Operation '{0}' is not supported")]
    UnsupportedOperation(&'static str),

    /// A reader synchronisation wait elapsed while the channel was empty.
    #[error("Timed out after {0:?} waiting for a change event")]
    SyncTimeout(std::time::Duration),

    /// The reader's background channel terminated; the reader stays terminal.
    #[error("Change stream terminated: {0}")]
    ChannelTerminated(String),

    /// No leaf value is stored at the given tag.
    #[error("No data at tag '{0}'")]
    NoDataAtKey(String),

    /// The tag addresses a node where a leaf was required, or vice versa.
    #[error("Tag '{0}' is occupied by a node")]
    NodeAlreadyExists(String),

    /// A tag or tag component is malformed.
    #[error("Invalid tag: {0}")]
    InvalidTag(String),

    /// The document database could not be reached within the timeout.
    #[error("Could not connect to the database within {0:?}")]
    ConnectionTimeout(std::time::Duration),

    /// No dataset document with the given name exists.
    #[error("Document '{0}' not found")]
    DocumentNotFound(String),

    /// A lookup by a supposedly unique field matched several documents.
    #[error("Field '{field}' matched {count} documents, expected one")]
    FieldNotUnique {
        /// The queried field.
        field: String,
        /// How many documents matched.
        count: u64,
    },

    /// A mapping key is not usable in the typed container.
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// A value cannot be represented in the serialisable value space.
    #[error("Value is not serializable: {0}")]
    NotSerializable(String),

    /// An encoded tree carried an unknown `__object__` tag.
    #[error("Unknown serialized type '{0}'")]
    UnknownType(String),

    /// I/O error, e.g. while spawning a worker thread.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Error from the document database driver.
    #[error("Database error: {0}")]
    Database(#[from] mongodb::error::Error),

    /// Error from the JSON layer.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LabError::DuplicateArrayName("volts".to_string());
        assert_eq!(
            err.to_string(),
            "Array name 'volts' already taken in this dataset"
        );
    }

    #[test]
    fn test_dimension_mismatch_message_carries_context() {
        let err = LabError::DimensionMismatch {
            name: "z".into(),
            reason: "axis 0 has shape [10], expected [12]".into(),
        };
        let rendered = err.to_string();
        assert!(rendered.contains("'z'"));
        assert!(rendered.contains("axis 0"));
    }

    #[test]
    fn test_sync_timeout_reports_duration() {
        let err = LabError::SyncTimeout(std::time::Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
