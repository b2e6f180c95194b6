pub mod config;
pub mod disk;

pub use disk::device::{open_device, FileDevice, MemoryDevice, RawDevice};
pub use disk::error::{DiskError, Result};
pub use disk::geometry::GeometryMetadata;
pub use disk::provider::DiskImageTarget;
pub use disk::source::SourceDisk;
pub use disk::stage::{CancelToken, RestoreOptions, RestoreStore, StoreState};
