use thiserror::Error;

use super::types::{FilesystemType, TableType};

pub type Result<T> = std::result::Result<T, DiskError>;

/// Errors raised by the disk image engine.
#[derive(Error, Debug)]
pub enum DiskError {
    #[error("failed to open device {path} for {mode}: {source}")]
    DiskInitializeFailed {
        path: String,
        mode: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("raw device access is not supported on {0}")]
    PlatformNotSupported(&'static str),

    #[error("partition {number} is recorded as {recorded}, but the path addresses it as {requested}")]
    PartitionTableTypeMismatch {
        number: u32,
        recorded: TableType,
        requested: TableType,
    },

    #[error("no {fs_type} filesystem on partition {partition}")]
    NoMatchingFilesystem {
        partition: u32,
        fs_type: FilesystemType,
    },

    #[error("cannot parse path segment '{segment}': {reason}")]
    UnparsablePathSegment { segment: String, reason: String },

    #[error("partition {table_type} #{number} is not present in the geometry")]
    PartitionNotFound { table_type: TableType, number: u32 },

    #[error("geometry metadata has not been restored yet")]
    MissingGeometryMetadata,

    #[error("target device holds {available} bytes, geometry requires {required}")]
    SizeValidationFailed { required: u64, available: u64 },

    #[error("invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("geometry parse error: {0}")]
    GeometryParse(#[from] serde_json::Error),

    #[error("operation not supported: {0}")]
    UnsupportedOperation(String),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    #[error("operation cancelled")]
    Cancelled,

    #[error("finalize failed after {applied} of {total} groups: {source}")]
    FinalizeFailed {
        applied: usize,
        total: usize,
        #[source]
        source: Box<DiskError>,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DiskError {
    pub(crate) fn segment(segment: &str, reason: impl Into<String>) -> Self {
        DiskError::UnparsablePathSegment {
            segment: segment.to_string(),
            reason: reason.into(),
        }
    }
}
