use std::path::PathBuf;

use thiserror::Error;

use crate::session::SessionState;

/// Errors raised while writing a multipage TIFF file.
#[derive(Debug, Error)]
pub enum WriteError {
    /// Underlying file I/O failed on the producer thread
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The file could not be extended to its estimated size (disk full)
    #[error("Insufficient space on disk: cannot allocate {requested} bytes for {path}: {source}")]
    AllocationFailed {
        path: PathBuf,
        requested: u64,
        #[source]
        source: std::io::Error,
    },

    /// A write executed by the background worker failed earlier
    #[error("Asynchronous write failed: {0}")]
    AsyncWriteFailed(String),

    /// An operation was requested in a state that does not allow it
    #[error("Cannot {operation} while session is {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },

    /// A file offset does not fit in a classic TIFF 32-bit field
    #[error("Offset {0} exceeds the 4 GB limit of classic TIFF")]
    OffsetOverflow(u64),

    /// The write scheduler's worker has shut down
    #[error("Write scheduler is no longer running")]
    SchedulerClosed,

    /// Summary or display metadata could not be interpreted
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Writer configuration is invalid
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Errors related to summary, per-image, or display metadata
#[derive(Debug, Clone, Error)]
pub enum MetadataError {
    /// A required summary field is missing
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    /// A field is present but has an unusable value
    #[error("Invalid value for {field}: {message}")]
    InvalidField {
        field: &'static str,
        message: String,
    },

    /// Metadata could not be serialized or parsed as JSON
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<serde_json::Error> for MetadataError {
    fn from(err: serde_json::Error) -> Self {
        MetadataError::Json(err.to_string())
    }
}

/// Errors that can occur when reading back a file written by this crate
#[derive(Debug, Error)]
pub enum TiffError {
    /// I/O error while reading the file
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid TIFF magic bytes (not II or MM)
    #[error("Invalid TIFF magic bytes: expected 0x4949 (II) or 0x4D4D (MM), got 0x{0:04X}")]
    InvalidMagic(u16),

    /// Invalid TIFF version number
    #[error("Invalid TIFF version: expected 42, got {0}")]
    InvalidVersion(u16),

    /// File is too small to contain a valid header
    #[error("File too small: need at least {required} bytes, got {actual}")]
    FileTooSmall { required: u64, actual: u64 },

    /// Invalid IFD offset (points outside file)
    #[error("Invalid IFD offset: {0}")]
    InvalidIfdOffset(u64),

    /// A block header did not carry the expected magic number
    #[error("Invalid {block} header: expected {expected}, got {actual}")]
    InvalidBlockHeader {
        block: &'static str,
        expected: u32,
        actual: u32,
    },

    /// Required tag is missing from IFD
    #[error("Missing required tag: {0}")]
    MissingTag(&'static str),

    /// Block payload is not valid UTF-8 or JSON
    #[error("Invalid {block} payload: {message}")]
    InvalidPayload {
        block: &'static str,
        message: String,
    },
}
